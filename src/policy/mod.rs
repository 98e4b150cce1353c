//! Signing policy: rules that must all allow before a key signs.

pub mod context;
pub mod engine;
pub mod rules;

pub use context::SigningContext;
pub use engine::PolicyEngine;
pub use rules::{
    amount, AllowlistRule, CallerRule, PolicyEvaluation, PolicyRule, PolicyRuleConfig,
    PolicyVerdict, RateLimitRule, SpendingLimitRule,
};
