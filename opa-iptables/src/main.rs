//! opa-iptables: keeps the host's iptables rules in line with Open Policy Agent.
//!
//! This daemon:
//! - Serves an HTTP API to insert, delete and list rules on demand
//! - Optionally watches policy documents and reconciles their rules periodically
//! - Shuts down the watcher, then the HTTP server, on SIGINT/SIGTERM

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opa_iptables::config::listen_addr;
use opa_iptables::{BaselineMode, Config, Controller, IptablesApplier, OpaClient, WatcherConfig};

/// opa-iptables controller
#[derive(Parser, Debug)]
#[command(name = "opa-iptables", version, about)]
struct Args {
    /// Host the HTTP API listens on
    #[arg(long, env = "OPA_IPTABLES_CONTROLLER_HOST", default_value = "0.0.0.0")]
    controller_host: String,

    /// Port the HTTP API listens on
    #[arg(long, env = "OPA_IPTABLES_CONTROLLER_PORT", default_value = "33455")]
    controller_port: u16,

    /// Open Policy Agent endpoint
    #[arg(long, env = "OPA_IPTABLES_OPA_ENDPOINT", default_value = "http://127.0.0.1:8181")]
    opa_endpoint: String,

    /// Bearer token for Open Policy Agent
    #[arg(long, env = "OPA_IPTABLES_OPA_AUTH_TOKEN", hide_env_values = true)]
    opa_auth_token: Option<String>,

    /// Enable the watcher
    #[arg(long, env = "OPA_IPTABLES_WATCHER")]
    watcher: bool,

    /// Watcher poll interval in seconds
    #[arg(long, env = "OPA_IPTABLES_WATCHER_INTERVAL", default_value = "60")]
    watcher_interval: u64,

    /// Number of workers applying rule changes concurrently.
    /// Use 1 if the host's iptables does not tolerate concurrent writers.
    #[arg(long, env = "OPA_IPTABLES_WORKER_COUNT", default_value = "5")]
    worker_count: usize,

    /// Policy document watched from startup (can be repeated)
    #[arg(long = "watch", env = "OPA_IPTABLES_WATCH", value_delimiter = ',')]
    watch_targets: Vec<String>,

    /// Record only rules that were actually applied as the watcher baseline
    #[arg(long, env = "OPA_IPTABLES_STRICT_BASELINE")]
    strict_baseline: bool,

    /// Grace period in seconds for the watcher and the HTTP server on shutdown
    #[arg(long, env = "OPA_IPTABLES_SHUTDOWN_GRACE", default_value = "10")]
    shutdown_grace: u64,

    /// iptables binary
    #[arg(long, env = "OPA_IPTABLES_BINARY", default_value = "iptables")]
    iptables: String,

    /// Time limit in seconds for one iptables call, including the xtables lock wait
    #[arg(long, env = "OPA_IPTABLES_COMMAND_TIMEOUT", default_value = "30")]
    iptables_timeout: u64,
}

impl Args {
    fn into_config(self) -> Config {
        let grace = Duration::from_secs(self.shutdown_grace);
        Config {
            listen_addr: listen_addr(&self.controller_host, self.controller_port),
            opa_endpoint: self.opa_endpoint,
            opa_auth_token: self.opa_auth_token,
            watcher_enabled: self.watcher,
            watcher: WatcherConfig {
                interval: Duration::from_secs(self.watcher_interval),
                worker_count: self.worker_count,
                shutdown_grace: grace,
                baseline: if self.strict_baseline {
                    BaselineMode::Strict
                } else {
                    BaselineMode::Attempted
                },
            },
            watch_targets: self.watch_targets,
            server_grace: grace,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opa_iptables=info,tower_http=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.iptables_timeout > 0, "iptables timeout must be greater than zero");
    let iptables = IptablesApplier::new(args.iptables.clone())
        .with_timeout(Duration::from_secs(args.iptables_timeout));
    let config = args.into_config();
    config.validate().context("Invalid configuration")?;

    info!("Starting opa-iptables controller");
    if config.watcher_enabled {
        info!(
            "Watcher enabled: interval {:?}, {} workers",
            config.watcher.interval, config.watcher.worker_count
        );
    }

    let opa = OpaClient::new(&config.opa_endpoint, config.opa_auth_token.clone())
        .context("Failed to create OPA client")?;
    info!("OPA endpoint: {}", opa.endpoint());
    Controller::new(config, Arc::new(opa), Arc::new(iptables))
        .run(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
