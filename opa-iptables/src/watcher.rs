//! Watcher: polls the policy engine for every registered target and
//! reconciles the host's rule table with the answers.
//!
//! The watcher task owns all per-target state. Other tasks reach it through a
//! [`WatcherHandle`], which sends commands over a channel; commands are
//! handled between poll cycles and while a cycle waits on its workers. Rule
//! changes run on a bounded set of worker tasks, one target per worker, so at
//! most `worker_count` batches write to the rule table at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::batch::BatchApplier;
use crate::clients::{RuleApplier, RuleSource};
use crate::error::WatcherError;
use crate::reconciler::{
    ApplyOutcome, BaselineMode, CycleOutcome, RuleDiff, TargetState, apply_diff,
};
use crate::rule::RuleSet;

/// Grace period for in-flight workers once the watcher is told to stop.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub interval: Duration,
    pub worker_count: usize,
    pub shutdown_grace: Duration,
    pub baseline: BaselineMode,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            worker_count: 5,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            baseline: BaselineMode::Attempted,
        }
    }
}

/// A policy document polled by the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WatchTarget {
    /// Document path, also the target's identifier.
    pub path: String,
    /// Input sent with every query.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub input: Value,
}

impl WatchTarget {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            input: Value::Null,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// Snapshot of one target, as reported by [`WatcherHandle::status`].
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TargetStatus {
    pub path: String,
    #[schema(value_type = Object)]
    pub input: Value,
    /// Unset until the first successful poll.
    #[schema(value_type = Option<String>)]
    pub last_poll: Option<DateTime<Utc>>,
    pub polls: u64,
    pub last_applied: RuleSet,
    pub last_outcome: CycleOutcome,
}

/// What happened to in-flight work during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: usize,
    pub abandoned: usize,
}

enum WatcherCommand {
    Register(WatchTarget, Option<RuleSet>, oneshot::Sender<bool>),
    Unregister(String, oneshot::Sender<bool>),
    Status(oneshot::Sender<Vec<TargetStatus>>),
}

/// Cloneable handle for talking to a running watcher.
#[derive(Clone)]
pub struct WatcherHandle {
    tx: mpsc::Sender<WatcherCommand>,
}

impl WatcherHandle {
    /// Start watching a target. Returns `false` if it was already watched
    /// (its input is replaced).
    pub async fn register(&self, target: WatchTarget) -> Result<bool, WatcherError> {
        self.request(|reply| WatcherCommand::Register(target, None, reply))
            .await
    }

    /// Start watching a target whose rules were just applied.
    ///
    /// `applied` becomes the baseline, so the first poll only applies what
    /// changed since.
    pub async fn register_applied(
        &self,
        target: WatchTarget,
        applied: RuleSet,
    ) -> Result<bool, WatcherError> {
        self.request(|reply| WatcherCommand::Register(target, Some(applied), reply))
            .await
    }

    /// Stop watching a target and forget its baseline. Rules already in the
    /// rule table are left alone.
    pub async fn unregister(&self, path: &str) -> Result<bool, WatcherError> {
        let path = path.to_string();
        self.request(|reply| WatcherCommand::Unregister(path, reply))
            .await
    }

    pub async fn status(&self) -> Result<Vec<TargetStatus>, WatcherError> {
        self.request(WatcherCommand::Status).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WatcherCommand,
    ) -> Result<T, WatcherError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| WatcherError::Stopped)?;
        reply_rx.await.map_err(|_| WatcherError::Stopped)
    }
}

type WorkerResult = (String, RuleSet, ApplyOutcome);

/// The reconciliation loop.
pub struct Watcher {
    config: WatcherConfig,
    source: Arc<dyn RuleSource>,
    batch: BatchApplier,
    targets: HashMap<String, WatchTarget>,
    registry: HashMap<String, TargetState>,
    commands: mpsc::Receiver<WatcherCommand>,
    workers: Arc<Semaphore>,
    in_flight: JoinSet<WorkerResult>,
}

impl Watcher {
    pub fn new(
        config: WatcherConfig,
        source: Arc<dyn RuleSource>,
        applier: Arc<dyn RuleApplier>,
    ) -> (Self, WatcherHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let workers = Arc::new(Semaphore::new(config.worker_count.max(1)));

        let watcher = Self {
            config,
            source,
            batch: BatchApplier::new(applier),
            targets: HashMap::new(),
            registry: HashMap::new(),
            commands,
            workers,
            in_flight: JoinSet::new(),
        };
        (watcher, WatcherHandle { tx })
    }

    /// Register a target before the loop starts.
    pub fn register(&mut self, target: WatchTarget) -> bool {
        let path = target.path.clone();
        let new = self.targets.insert(path.clone(), target).is_none();
        if new {
            info!(target_path = %path, "Watching target");
        }
        new
    }

    /// Set a target's baseline without polling it.
    pub fn seed(&mut self, path: &str, applied: RuleSet) {
        let state = self.registry.entry(path.to_string()).or_default();
        state.last_applied = applied;
    }

    pub fn unregister(&mut self, path: &str) -> bool {
        self.registry.remove(path);
        let removed = self.targets.remove(path).is_some();
        if removed {
            info!(target_path = path, "Stopped watching target");
        }
        removed
    }

    /// Reconciliation state of a target, if it has been polled or seeded.
    pub fn state(&self, path: &str) -> Option<&TargetState> {
        self.registry.get(path)
    }

    pub fn status(&self) -> Vec<TargetStatus> {
        let mut status: Vec<_> = self
            .targets
            .values()
            .map(|t| {
                let state = self.registry.get(&t.path);
                TargetStatus {
                    path: t.path.clone(),
                    input: t.input.clone(),
                    last_poll: state.filter(|s| s.polls > 0).map(|s| s.last_poll),
                    polls: state.map(|s| s.polls).unwrap_or(0),
                    last_applied: state.map(|s| s.last_applied.clone()).unwrap_or_default(),
                    last_outcome: state.map(|s| s.last_outcome).unwrap_or_default(),
                }
            })
            .collect();
        status.sort_by(|a, b| a.path.cmp(&b.path));
        status
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// After the stop signal no new cycle starts. Workers still running get
    /// the configured grace period; whatever is left after that is abandoned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ShutdownReport {
        info!(
            interval = ?self.config.interval,
            workers = self.config.worker_count,
            baseline = ?self.config.baseline,
            "Watcher started"
        );

        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                Some(cmd) = self.commands.recv() => self.handle_command(cmd),
                _ = ticker.tick() => {
                    let finished = tokio::select! {
                        _ = self.reconcile_once() => true,
                        _ = stop_requested(&mut shutdown) => false,
                    };
                    if !finished {
                        info!("Stop requested during poll cycle");
                        break;
                    }
                }
            }
        }

        self.drain().await
    }

    /// Run one poll cycle and wait for all of its workers.
    ///
    /// Commands are served while the cycle waits for a free worker or for
    /// workers to finish.
    pub async fn reconcile_once(&mut self) {
        let targets: Vec<WatchTarget> = self.targets.values().cloned().collect();
        debug!(targets = targets.len(), "Poll cycle started");

        for target in targets {
            if !self.targets.contains_key(&target.path) {
                debug!(target_path = %target.path, "Target unregistered during cycle");
                continue;
            }

            let fresh = match self.source.fetch_rules(&target.path, &target.input).await {
                Ok(set) => set,
                Err(e) => {
                    warn!(target_path = %target.path, "Failed to query policy engine: {}", e);
                    continue;
                }
            };

            let state = self.registry.entry(target.path.clone()).or_default();
            let diff = RuleDiff::between(&state.last_applied, &fresh);
            if diff.is_empty() {
                debug!(target_path = %target.path, "No rule changes");
                state.complete_cycle(self.config.baseline, fresh, None);
                continue;
            }

            let Some(permit) = self.acquire_worker().await else {
                error!("Worker pool closed");
                return;
            };

            let batch = self.batch.clone();
            let path = target.path;
            self.in_flight.spawn(async move {
                let outcome = apply_diff(&batch, &path, &diff).await;
                drop(permit);
                (path, fresh, outcome)
            });
        }

        self.join_workers().await;
        debug!("Poll cycle finished");
    }

    /// Blocks while every worker is busy.
    async fn acquire_worker(&mut self) -> Option<OwnedSemaphorePermit> {
        let acquire = self.workers.clone().acquire_owned();
        tokio::pin!(acquire);

        loop {
            tokio::select! {
                permit = &mut acquire => return permit.ok(),
                Some(cmd) = self.commands.recv() => self.handle_command(cmd),
            }
        }
    }

    async fn join_workers(&mut self) {
        loop {
            tokio::select! {
                joined = self.in_flight.join_next() => match joined {
                    Some(joined) => self.finish(joined),
                    None => break,
                },
                Some(cmd) = self.commands.recv() => self.handle_command(cmd),
            }
        }
    }

    fn finish(&mut self, joined: Result<WorkerResult, JoinError>) {
        let (path, fresh, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Reconcile worker failed: {}", e);
                return;
            }
        };

        if !self.targets.contains_key(&path) {
            debug!(target_path = %path, "Dropping result for unregistered target");
            return;
        }

        let counts = outcome.counts();
        if counts.failed > 0 {
            warn!(
                target_path = %path,
                failed = counts.failed,
                attempted = counts.attempted,
                "Some rules failed to apply"
            );
        }

        self.registry
            .entry(path)
            .or_default()
            .complete_cycle(self.config.baseline, fresh, Some(&outcome));
    }

    fn handle_command(&mut self, cmd: WatcherCommand) {
        match cmd {
            WatcherCommand::Register(target, applied, reply) => {
                let path = target.path.clone();
                let new = self.register(target);
                if let Some(applied) = applied {
                    self.seed(&path, applied);
                }
                let _ = reply.send(new);
            }
            WatcherCommand::Unregister(path, reply) => {
                let removed = self.unregister(&path);
                let _ = reply.send(removed);
            }
            WatcherCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn drain(mut self) -> ShutdownReport {
        let pending = self.in_flight.len();
        if pending == 0 {
            info!("Watcher stopped");
            return ShutdownReport::default();
        }

        info!(pending, "Waiting for in-flight workers");
        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);

        let mut report = ShutdownReport::default();
        loop {
            tokio::select! {
                joined = self.in_flight.join_next() => match joined {
                    Some(joined) => {
                        self.finish(joined);
                        report.completed += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        report.abandoned = self.in_flight.len();
        if report.abandoned > 0 {
            warn!(
                abandoned = report.abandoned,
                "Shutdown grace elapsed, abandoning in-flight workers"
            );
            self.in_flight.detach_all();
        }
        info!("Watcher stopped");
        report
    }
}

/// Resolves once the stop flag is set or the sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
