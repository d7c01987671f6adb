//! Controller: runs the HTTP control surface and the watcher, and shuts both
//! down in order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::RuleService;
use crate::clients::{RuleApplier, RuleSource};
use crate::config::Config;
use crate::rest::{AppState, create_router};
use crate::watcher::{ShutdownReport, WatchTarget, Watcher, WatcherHandle};

/// Extra time given to the watcher task on top of its own grace period, so
/// it can report what it abandoned before the controller gives up on it.
const WATCHER_JOIN_MARGIN: Duration = Duration::from_secs(1);

pub struct Controller {
    config: Config,
    source: Arc<dyn RuleSource>,
    applier: Arc<dyn RuleApplier>,
}

struct RunningWatcher {
    handle: WatcherHandle,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<ShutdownReport>,
}

impl Controller {
    pub fn new(config: Config, source: Arc<dyn RuleSource>, applier: Arc<dyn RuleApplier>) -> Self {
        Self {
            config,
            source,
            applier,
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves, then stop
    /// the watcher and the HTTP server, each within its own grace period.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let addr = listener.local_addr().context("Failed to read listen address")?;
        info!("Controller is running on {}", addr);

        let watcher = if self.config.watcher_enabled {
            Some(self.start_watcher())
        } else {
            None
        };

        let state = Arc::new(AppState {
            rules: RuleService::new(self.applier.clone()),
            source: self.source.clone(),
            watcher: watcher.as_ref().map(|w| w.handle.clone()),
        });
        let router = create_router(state);

        let (server_stop_tx, mut server_stop_rx) = watch::channel(false);
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    server_stop_rx.changed().await.ok();
                })
                .await
        });

        let server_failed = tokio::select! {
            _ = shutdown => {
                info!("Received shutdown signal");
                None
            }
            res = &mut server => Some(res),
        };

        if let Some(watcher) = watcher {
            self.shutdown_watcher(watcher).await;
        }

        match server_failed {
            Some(res) => {
                // The server stopped on its own; nothing left to drain.
                let err = match res {
                    Ok(Ok(())) => anyhow::anyhow!("HTTP server exited unexpectedly"),
                    Ok(Err(e)) => anyhow::Error::new(e).context("HTTP server failed"),
                    Err(e) => anyhow::Error::new(e).context("HTTP server task panicked"),
                };
                error!("{:#}", err);
                Err(err)
            }
            None => {
                self.shutdown_server(server_stop_tx, server).await;
                Ok(())
            }
        }
    }

    fn start_watcher(&self) -> RunningWatcher {
        let (mut watcher, handle) = Watcher::new(
            self.config.watcher.clone(),
            self.source.clone(),
            self.applier.clone(),
        );
        for path in &self.config.watch_targets {
            watcher.register(WatchTarget::new(path.clone()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(watcher.run(stop_rx));

        RunningWatcher {
            handle,
            stop_tx,
            task,
        }
    }

    async fn shutdown_watcher(&self, watcher: RunningWatcher) {
        info!("Shutting down watcher");
        let _ = watcher.stop_tx.send(true);

        let deadline = self.config.watcher.shutdown_grace + WATCHER_JOIN_MARGIN;
        match tokio::time::timeout(deadline, watcher.task).await {
            Ok(Ok(report)) if report.abandoned == 0 => info!("Watcher shutdown successfully"),
            Ok(Ok(report)) => warn!(
                abandoned = report.abandoned,
                "Watcher shutdown timeout, in-flight work abandoned"
            ),
            Ok(Err(e)) => error!("Watcher task failed: {}", e),
            Err(_) => warn!("Watcher shutdown timeout"),
        }
    }

    async fn shutdown_server(
        &self,
        stop_tx: watch::Sender<bool>,
        server: JoinHandle<std::io::Result<()>>,
    ) {
        info!("Shutting down controller");
        let _ = stop_tx.send(true);

        match tokio::time::timeout(self.config.server_grace, server).await {
            Ok(Ok(Ok(()))) => info!("Controller shutdown successfully"),
            Ok(Ok(Err(e))) => error!("Error while shutting down controller: {}", e),
            Ok(Err(e)) => error!("Controller task failed: {}", e),
            Err(_) => warn!("Controller shutdown timeout"),
        }
    }
}
