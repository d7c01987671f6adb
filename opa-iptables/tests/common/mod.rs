//! Shared test utilities: a recording rule table, a scripted policy engine and
//! an HTTP test server.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use opa_iptables::error::EngineError;
use opa_iptables::rest::{AppState, create_router};
use opa_iptables::{
    ApplyError, Operation, PolicyError, Rule, RuleApplier, RuleService, RuleSet, RuleSource,
    WatcherHandle,
};
use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;

/// A named ACCEPT rule in the INPUT chain.
pub fn rule(name: &str) -> Rule {
    let mut r = Rule::new("filter", "INPUT");
    r.protocol = Some("tcp".to_string());
    r.comment = Some(name.to_string());
    r.jump = Some("ACCEPT".to_string());
    r
}

pub fn rules(names: &[&str]) -> RuleSet {
    RuleSet::new(names.iter().map(|n| rule(n)).collect())
}

/// Rule table double that records every call and fails on demand.
#[derive(Default)]
pub struct RecordingApplier {
    calls: Mutex<Vec<(Operation, Rule)>>,
    failing: Mutex<HashSet<(Operation, Rule)>>,
    listing: Mutex<RuleSet>,
    delay: Duration,
    active: AtomicUsize,
    high_water: AtomicUsize,
}

impl RecordingApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every add/delete takes `delay`.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn fail_on(&self, op: Operation, rule: Rule) {
        self.failing.lock().unwrap().insert((op, rule));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn set_listing(&self, rules: RuleSet) {
        *self.listing.lock().unwrap() = rules;
    }

    pub fn calls(&self) -> Vec<(Operation, Rule)> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls rendered as `("insert" | "delete", comment)` for compact asserts.
    pub fn call_names(&self) -> Vec<(&'static str, String)> {
        self.calls()
            .into_iter()
            .map(|(op, r)| {
                let op = match op {
                    Operation::Insert => "insert",
                    Operation::Delete => "delete",
                };
                (op, r.comment.unwrap_or_default())
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of add/delete calls that ran at the same time.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    async fn apply(&self, op: Operation, rule: &Rule) -> Result<(), ApplyError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().unwrap().push((op, rule.clone()));
        if self.failing.lock().unwrap().contains(&(op, rule.clone())) {
            return Err(ApplyError::Failed {
                command: format!("iptables {}", rule),
                stderr: "iptables: Bad rule.".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RuleApplier for RecordingApplier {
    async fn add(&self, rule: &Rule) -> Result<(), ApplyError> {
        self.apply(Operation::Insert, rule).await
    }

    async fn delete(&self, rule: &Rule) -> Result<(), ApplyError> {
        self.apply(Operation::Delete, rule).await
    }

    async fn list(&self, table: &str, chain: Option<&str>) -> Result<RuleSet, ApplyError> {
        let listing = self.listing.lock().unwrap();
        Ok(RuleSet::new(
            listing
                .iter()
                .filter(|r| r.table == table && chain.is_none_or(|c| r.chain == c))
                .cloned()
                .collect(),
        ))
    }
}

/// Policy engine double: answers per document path, or fails.
#[derive(Default)]
pub struct ScriptedSource {
    answers: Mutex<HashMap<String, Result<RuleSet, EngineError>>>,
    inputs: Mutex<Vec<(String, Value)>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, path: &str, rules: RuleSet) {
        self.answers
            .lock()
            .unwrap()
            .insert(path.to_string(), Ok(rules));
    }

    pub fn fail(&self, path: &str) {
        self.answers.lock().unwrap().insert(
            path.to_string(),
            Err(EngineError {
                code: "internal_error".to_string(),
                message: "policy evaluation failed".to_string(),
                errors: None,
            }),
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<(String, Value)> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuleSource for ScriptedSource {
    async fn fetch_rules(&self, path: &str, input: &Value) -> Result<RuleSet, PolicyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .unwrap()
            .push((path.to_string(), input.clone()));

        match self.answers.lock().unwrap().get(path) {
            Some(Ok(rules)) => Ok(rules.clone()),
            Some(Err(e)) => Err(PolicyError::Engine(e.clone())),
            // Undefined document
            None => Ok(RuleSet::default()),
        }
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// HTTP control surface bound to an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub applier: Arc<RecordingApplier>,
    pub source: Arc<ScriptedSource>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with_watcher(None).await
    }

    pub async fn spawn_with_watcher(watcher: Option<WatcherHandle>) -> Self {
        let applier = RecordingApplier::new();
        let source = ScriptedSource::new();
        Self::spawn_with(applier, source, watcher).await
    }

    pub async fn spawn_with(
        applier: Arc<RecordingApplier>,
        source: Arc<ScriptedSource>,
        watcher: Option<WatcherHandle>,
    ) -> Self {
        let state = Arc::new(AppState {
            rules: RuleService::new(applier.clone()),
            source: source.clone(),
            watcher,
        });
        let router = create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            client: Client::new(),
            applier,
            source,
            shutdown_tx,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/v1{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn post(&self, path: &str) -> ReqwestResponse {
        self.client
            .post(self.url(path))
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn post_raw(&self, path: &str, body: &'static str) -> ReqwestResponse {
        self.client
            .post(self.url(path))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
