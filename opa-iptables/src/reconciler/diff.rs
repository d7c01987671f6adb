//! Rule set difference.

use std::collections::HashSet;

use crate::rule::{Rule, RuleSet};

/// Changes needed to move the rule table from one rule set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    /// Rules in the desired set but not in the current one, in desired order.
    pub to_add: Vec<Rule>,
    /// Rules in the current set but not in the desired one, in current order.
    pub to_remove: Vec<Rule>,
}

impl RuleDiff {
    pub fn between(current: &RuleSet, desired: &RuleSet) -> Self {
        let current_set: HashSet<&Rule> = current.iter().collect();
        let desired_set: HashSet<&Rule> = desired.iter().collect();

        Self {
            to_add: desired
                .iter()
                .filter(|r| !current_set.contains(r))
                .cloned()
                .collect(),
            to_remove: current
                .iter()
                .filter(|r| !desired_set.contains(r))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}
