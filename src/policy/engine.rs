//! Ordered, short-circuiting rule evaluation.

use crate::policy::context::SigningContext;
use crate::policy::rules::{PolicyEvaluation, PolicyRule, PolicyRuleConfig};

/// Rules evaluated in insertion order; the first deny wins.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine whose evaluation order is the config order.
    pub fn from_config(configs: &[PolicyRuleConfig]) -> Self {
        Self {
            rules: configs.iter().map(PolicyRule::build).collect(),
        }
    }

    pub fn add_rule(&mut self, rule: impl Into<PolicyRule>) {
        self.rules.push(rule.into());
    }

    /// Remove the first rule called `name`. Returns whether one was removed.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        match self.rules.iter().position(|r| r.name() == name) {
            Some(index) => {
                self.rules.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&mut self, ctx: &SigningContext) -> PolicyEvaluation {
        for rule in &mut self.rules {
            let evaluation = rule.evaluate(ctx);
            if !evaluation.is_allowed() {
                tracing::warn!(
                    rule = %evaluation.rule_name,
                    key_id = %ctx.key_id,
                    caller_id = %ctx.caller_id,
                    reason = %evaluation.reason,
                    "Policy denied signing request"
                );
                return evaluation;
            }
        }
        PolicyEvaluation::allow("engine", "All policy rules passed")
    }

    /// Clear the counters of stateful rules.
    pub fn reset(&mut self) {
        for rule in &mut self.rules {
            rule.reset();
        }
    }
}
