pub mod api;
pub mod batch;
pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod reconciler;
pub mod rest;
pub mod rule;
pub mod watcher;

pub use api::RuleService;
pub use batch::{BatchApplier, BatchResult, RuleFailure};
pub use clients::{IptablesApplier, OpaClient, RuleApplier, RuleSource};
pub use config::Config;
pub use controller::Controller;
pub use error::{ApplyError, BatchError, ConfigError, Operation, PolicyError, WatcherError};
pub use reconciler::{BaselineMode, RuleDiff, TargetState};
pub use rule::{Rule, RuleSet};
pub use watcher::{TargetStatus, WatchTarget, Watcher, WatcherConfig, WatcherHandle};
