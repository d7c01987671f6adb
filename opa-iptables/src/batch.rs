//! Best-effort application of rule batches.
//!
//! Every rule of a batch is attempted regardless of earlier failures. There
//! is no rollback. The caller gets a [`BatchResult`] with per-rule detail and
//! can collapse it into the aggregate [`BatchError`].

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::clients::RuleApplier;
use crate::error::{ApplyError, BatchError, Operation};
use crate::rule::Rule;

/// One rule that could not be applied.
#[derive(Debug)]
pub struct RuleFailure {
    pub rule: Rule,
    pub error: ApplyError,
}

/// Outcome of one batch.
#[derive(Debug)]
pub struct BatchResult {
    pub operation: Operation,
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed rules in batch order.
    pub failures: Vec<RuleFailure>,
}

impl BatchResult {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            attempted: 0,
            succeeded: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// True if `rule` is in this batch's failures.
    pub fn has_failed(&self, rule: &Rule) -> bool {
        self.failures.iter().any(|f| &f.rule == rule)
    }

    /// Collapse into the aggregate error.
    pub fn into_result(self) -> Result<(), BatchError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(BatchError {
                operation: self.operation,
                failed: self.failures.len(),
                total: self.attempted,
            })
        }
    }
}

/// Applies batches of rules through a [`RuleApplier`].
#[derive(Clone)]
pub struct BatchApplier {
    applier: Arc<dyn RuleApplier>,
}

impl BatchApplier {
    pub fn new(applier: Arc<dyn RuleApplier>) -> Self {
        Self { applier }
    }

    pub fn applier(&self) -> &Arc<dyn RuleApplier> {
        &self.applier
    }

    /// Insert every rule in order.
    pub async fn apply_all<'a, I>(&self, rules: I) -> BatchResult
    where
        I: IntoIterator<Item = &'a Rule>,
    {
        self.run(Operation::Insert, rules).await
    }

    /// Delete every rule in order.
    pub async fn remove_all<'a, I>(&self, rules: I) -> BatchResult
    where
        I: IntoIterator<Item = &'a Rule>,
    {
        self.run(Operation::Delete, rules).await
    }

    async fn run<'a, I>(&self, operation: Operation, rules: I) -> BatchResult
    where
        I: IntoIterator<Item = &'a Rule>,
    {
        let mut result = BatchResult::new(operation);

        for rule in rules {
            result.attempted += 1;
            let outcome = match operation {
                Operation::Insert => {
                    debug!("Inserting rule: {}", rule);
                    self.applier.add(rule).await
                }
                Operation::Delete => {
                    debug!("Deleting rule: {}", rule);
                    self.applier.delete(rule).await
                }
            };

            match outcome {
                Ok(()) => result.succeeded += 1,
                Err(e) => {
                    error!("Error while {} rule {}: {}", operation, rule, e);
                    result.failures.push(RuleFailure {
                        rule: rule.clone(),
                        error: e,
                    });
                }
            }
        }

        let verb = match operation {
            Operation::Insert => "Inserted",
            Operation::Delete => "Deleted",
        };
        info!(
            succeeded = result.succeeded,
            total = result.attempted,
            "{} {} out of {} rules",
            verb,
            result.succeeded,
            result.attempted
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleSet;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails every rule whose chain is listed in `failing`.
    #[derive(Default)]
    struct ScriptedApplier {
        failing: Vec<String>,
        calls: Mutex<Vec<(Operation, String)>>,
    }

    impl ScriptedApplier {
        fn failing(chains: &[&str]) -> Self {
            Self {
                failing: chains.iter().map(|c| c.to_string()).collect(),
                ..Default::default()
            }
        }

        fn record(&self, op: Operation, rule: &Rule) -> crate::clients::iptables::Result<()> {
            self.calls.lock().unwrap().push((op, rule.chain.clone()));
            if self.failing.contains(&rule.chain) {
                Err(ApplyError::Failed {
                    command: format!("iptables {}", rule),
                    stderr: "iptables: Bad rule".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RuleApplier for ScriptedApplier {
        async fn add(&self, rule: &Rule) -> crate::clients::iptables::Result<()> {
            self.record(Operation::Insert, rule)
        }

        async fn delete(&self, rule: &Rule) -> crate::clients::iptables::Result<()> {
            self.record(Operation::Delete, rule)
        }

        async fn list(
            &self,
            _table: &str,
            _chain: Option<&str>,
        ) -> crate::clients::iptables::Result<RuleSet> {
            Ok(RuleSet::default())
        }
    }

    fn rules(chains: &[&str]) -> Vec<Rule> {
        chains.iter().map(|c| Rule::new("filter", *c)).collect()
    }

    #[tokio::test]
    async fn all_succeed() {
        let applier = Arc::new(ScriptedApplier::default());
        let batch = BatchApplier::new(applier.clone());

        let result = batch.apply_all(&rules(&["A", "B", "C"])).await;
        assert_eq!(result.attempted, 3);
        assert_eq!(result.succeeded, 3);
        assert!(result.into_result().is_ok());
    }

    #[tokio::test]
    async fn continues_past_failures() {
        let applier = Arc::new(ScriptedApplier::failing(&["B", "D"]));
        let batch = BatchApplier::new(applier.clone());

        let result = batch.apply_all(&rules(&["A", "B", "C", "D", "E"])).await;
        assert_eq!(result.attempted, 5);
        assert_eq!(result.succeeded, 3);
        assert_eq!(result.failed(), 2);
        assert_eq!(result.failures[0].rule.chain, "B");
        assert_eq!(result.failures[1].rule.chain, "D");
        assert!(result.has_failed(&Rule::new("filter", "D")));

        // Every rule was attempted, in order.
        let calls = applier.calls.lock().unwrap().clone();
        let chains: Vec<_> = calls.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(chains, vec!["A", "B", "C", "D", "E"]);

        let err = result.into_result().unwrap_err();
        assert_eq!(
            err,
            BatchError {
                operation: Operation::Insert,
                failed: 2,
                total: 5
            }
        );
    }

    #[tokio::test]
    async fn remove_all_uses_delete() {
        let applier = Arc::new(ScriptedApplier::failing(&["A"]));
        let batch = BatchApplier::new(applier.clone());

        let result = batch.remove_all(&rules(&["A", "B"])).await;
        assert_eq!(result.succeeded, 1);
        let err = result.into_result().unwrap_err();
        assert_eq!(err.operation, Operation::Delete);

        let calls = applier.calls.lock().unwrap().clone();
        assert!(calls.iter().all(|(op, _)| *op == Operation::Delete));
    }

    #[tokio::test]
    async fn empty_batch_succeeds() {
        let batch = BatchApplier::new(Arc::new(ScriptedApplier::default()));

        let inserted = batch.apply_all(&Vec::new()).await;
        assert_eq!((inserted.attempted, inserted.succeeded), (0, 0));
        assert!(inserted.into_result().is_ok());

        let removed = batch.remove_all(&RuleSet::default()).await;
        assert_eq!((removed.attempted, removed.succeeded), (0, 0));
        assert!(removed.into_result().is_ok());
    }
}
