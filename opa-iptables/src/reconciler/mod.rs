//! Reconciliation of a target's rule set.
//!
//! The watcher compares the rule set fetched from the policy engine with the
//! target's baseline and hands the difference to [`apply_diff`], which runs
//! on a worker. Deletions go first so a rule whose specification changed is
//! never present twice.

pub mod diff;
pub mod state;

pub use diff::RuleDiff;
pub use state::{BaselineMode, CycleOutcome, TargetState};

use tracing::info;

use crate::batch::{BatchApplier, BatchResult};

/// Result of applying one target's diff.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub removed: BatchResult,
    pub added: BatchResult,
}

impl ApplyOutcome {
    pub fn counts(&self) -> CycleOutcome {
        CycleOutcome {
            attempted: self.removed.attempted + self.added.attempted,
            succeeded: self.removed.succeeded + self.added.succeeded,
            failed: self.removed.failed() + self.added.failed(),
        }
    }
}

/// Remove then insert. Never fails as a whole; failures are in the outcome.
pub async fn apply_diff(batch: &BatchApplier, target: &str, diff: &RuleDiff) -> ApplyOutcome {
    info!(
        target_path = target,
        add = diff.to_add.len(),
        remove = diff.to_remove.len(),
        "Reconciling target"
    );

    let removed = batch.remove_all(&diff.to_remove).await;
    let added = batch.apply_all(&diff.to_add).await;

    ApplyOutcome { removed, added }
}
