//! Per-target reconciliation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ApplyOutcome;
use crate::rule::RuleSet;

/// How the baseline is updated after a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BaselineMode {
    /// Baseline becomes the fetched set, whatever the per-rule outcome.
    ///
    /// A rule whose deletion failed is recorded as removed and stays in the
    /// rule table until it is desired and dropped again.
    #[default]
    Attempted,
    /// Baseline records what the rule table holds after the cycle: failed
    /// inserts are left out and failed deletions kept, so both are retried.
    Strict,
}

/// Counts for the most recent cycle of a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CycleOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Reconciliation state of one watched target.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub last_applied: RuleSet,
    pub last_poll: DateTime<Utc>,
    pub polls: u64,
    pub last_outcome: CycleOutcome,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            last_applied: RuleSet::default(),
            last_poll: Utc::now(),
            polls: 0,
            last_outcome: CycleOutcome::default(),
        }
    }
}

impl TargetState {
    /// Record a completed cycle. `outcome` is `None` when nothing had to change.
    pub fn complete_cycle(
        &mut self,
        mode: BaselineMode,
        fresh: RuleSet,
        outcome: Option<&ApplyOutcome>,
    ) {
        self.last_applied = match (mode, outcome) {
            (BaselineMode::Strict, Some(outcome)) => strict_baseline(fresh, outcome),
            _ => fresh,
        };
        self.last_poll = Utc::now();
        self.polls += 1;
        self.last_outcome = outcome.map(ApplyOutcome::counts).unwrap_or_default();
    }
}

/// Desired rules that are now in place, followed by rules that failed to go away.
fn strict_baseline(fresh: RuleSet, outcome: &ApplyOutcome) -> RuleSet {
    let mut rules: Vec<_> = fresh
        .into_iter()
        .filter(|r| !outcome.added.has_failed(r))
        .collect();
    rules.extend(outcome.removed.failures.iter().map(|f| f.rule.clone()));
    RuleSet::new(rules)
}
