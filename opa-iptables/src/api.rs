//! One-shot rule operations, independent of the watcher.
//!
//! Rules inserted here are not part of any target's baseline; the watcher
//! only learns about them if a policy answer contains them too.

use std::sync::Arc;

use crate::batch::BatchApplier;
use crate::clients::RuleApplier;
use crate::clients::iptables::Result as ApplyResult;
use crate::error::BatchError;
use crate::rule::RuleSet;

#[derive(Clone)]
pub struct RuleService {
    batch: BatchApplier,
}

impl RuleService {
    pub fn new(applier: Arc<dyn RuleApplier>) -> Self {
        Self {
            batch: BatchApplier::new(applier),
        }
    }

    pub async fn insert_rules(&self, rules: &RuleSet) -> Result<(), BatchError> {
        self.batch.apply_all(rules).await.into_result()
    }

    pub async fn delete_rules(&self, rules: &RuleSet) -> Result<(), BatchError> {
        self.batch.remove_all(rules).await.into_result()
    }

    pub async fn list_rules(&self, table: &str, chain: &str) -> ApplyResult<RuleSet> {
        self.batch.applier().list(table, Some(chain)).await
    }

    pub async fn list_all_rules(&self) -> ApplyResult<RuleSet> {
        self.batch.applier().list_all().await
    }
}
