//! Built-in signing rules and their serializable configuration.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::policy::context::SigningContext;

const RATE_WINDOW_MS: i64 = 60_000;

/// Outcome of a single rule, or of a whole engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyVerdict {
    Allow,
    Deny,
}

impl fmt::Display for PolicyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyVerdict::Allow => write!(f, "allow"),
            PolicyVerdict::Deny => write!(f, "deny"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEvaluation {
    pub verdict: PolicyVerdict,
    pub reason: String,
    pub rule_name: String,
}

impl PolicyEvaluation {
    pub fn allow(rule_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: PolicyVerdict::Allow,
            reason: reason.into(),
            rule_name: rule_name.into(),
        }
    }

    pub fn deny(rule_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: PolicyVerdict::Deny,
            reason: reason.into(),
            rule_name: rule_name.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == PolicyVerdict::Allow
    }
}

/// Serializable rule configuration, tagged by `type`.
///
/// ```json
/// {"type": "spending-limit", "maxValuePerTx": "1000", "maxValuePerDay": "5000"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PolicyRuleConfig {
    Caller {
        allowed_callers: Vec<String>,
    },
    SpendingLimit {
        #[serde(with = "amount")]
        max_value_per_tx: u128,
        #[serde(with = "amount")]
        max_value_per_day: u128,
    },
    RateLimit {
        max_requests_per_minute: u32,
    },
    Allowlist {
        allowed_addresses: Vec<String>,
    },
}

impl PolicyRuleConfig {
    /// The `type` tag of this config.
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyRuleConfig::Caller { .. } => "caller",
            PolicyRuleConfig::SpendingLimit { .. } => "spending-limit",
            PolicyRuleConfig::RateLimit { .. } => "rate-limit",
            PolicyRuleConfig::Allowlist { .. } => "allowlist",
        }
    }
}

/// Only callers in the set may sign.
#[derive(Debug, Clone)]
pub struct CallerRule {
    name: String,
    allowed_callers: HashSet<String>,
}

impl CallerRule {
    pub fn new<I, S>(allowed_callers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "caller-check".to_string(),
            allowed_callers: allowed_callers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn evaluate(&self, ctx: &SigningContext) -> PolicyEvaluation {
        if self.allowed_callers.contains(&ctx.caller_id) {
            PolicyEvaluation::allow(&self.name, "Caller is authorized")
        } else {
            PolicyEvaluation::deny(
                &self.name,
                format!("Caller '{}' is not in the allowed list", ctx.caller_id),
            )
        }
    }
}

/// Only transactions to listed addresses may be signed. Case-insensitive.
#[derive(Debug, Clone)]
pub struct AllowlistRule {
    name: String,
    allowed_addresses: HashSet<String>,
}

impl AllowlistRule {
    pub fn new<I, S>(allowed_addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: "allowlist".to_string(),
            allowed_addresses: allowed_addresses
                .into_iter()
                .map(|a| a.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn evaluate(&self, ctx: &SigningContext) -> PolicyEvaluation {
        match ctx.to.as_deref() {
            None => PolicyEvaluation::allow(&self.name, "Contract deployment (no target address)"),
            Some(to) if self.allowed_addresses.contains(&to.to_lowercase()) => {
                PolicyEvaluation::allow(&self.name, "Target address is in the allowlist")
            }
            Some(to) => PolicyEvaluation::deny(
                &self.name,
                format!("Target address {to} is not in the allowlist"),
            ),
        }
    }
}

/// Per-transaction and per-UTC-day value caps.
#[derive(Debug, Clone)]
pub struct SpendingLimitRule {
    name: String,
    max_value_per_tx: u128,
    max_value_per_day: u128,
    daily_spend: HashMap<NaiveDate, u128>,
}

impl SpendingLimitRule {
    pub fn new(max_value_per_tx: u128, max_value_per_day: u128) -> Self {
        Self {
            name: "spending-limit".to_string(),
            max_value_per_tx,
            max_value_per_day,
            daily_spend: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Amount committed on the given UTC date.
    pub fn spent_on(&self, date: NaiveDate) -> u128 {
        self.daily_spend.get(&date).copied().unwrap_or(0)
    }

    fn evaluate(&mut self, ctx: &SigningContext) -> PolicyEvaluation {
        let value = ctx.value.unwrap_or(0);
        if value > self.max_value_per_tx {
            return PolicyEvaluation::deny(
                &self.name,
                format!(
                    "Transaction value {value} exceeds per-tx limit of {}",
                    self.max_value_per_tx
                ),
            );
        }

        let date = ctx.timestamp.date_naive();
        let current = self.spent_on(date);
        match current.checked_add(value) {
            Some(total) if total <= self.max_value_per_day => {
                self.daily_spend.insert(date, total);
                PolicyEvaluation::allow(&self.name, "Within spending limits")
            }
            _ => PolicyEvaluation::deny(
                &self.name,
                format!(
                    "Daily spending would exceed limit of {} (current: {current}, requested: {value})",
                    self.max_value_per_day
                ),
            ),
        }
    }

    fn reset(&mut self) {
        self.daily_spend.clear();
    }
}

/// Sliding one-minute window over accepted requests.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    name: String,
    max_requests_per_minute: u32,
    accepted: VecDeque<i64>,
}

impl RateLimitRule {
    pub fn new(max_requests_per_minute: u32) -> Self {
        Self {
            name: "rate-limit".to_string(),
            max_requests_per_minute,
            accepted: VecDeque::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn evaluate(&mut self, ctx: &SigningContext) -> PolicyEvaluation {
        let now = ctx.timestamp.timestamp_millis();
        let window_start = now - RATE_WINDOW_MS;
        while self.accepted.front().is_some_and(|&ts| ts < window_start) {
            self.accepted.pop_front();
        }

        let count = self.accepted.len();
        if count >= self.max_requests_per_minute as usize {
            return PolicyEvaluation::deny(
                &self.name,
                format!(
                    "Rate limit exceeded: {count}/{} requests per minute",
                    self.max_requests_per_minute
                ),
            );
        }

        self.accepted.push_back(now);
        PolicyEvaluation::allow(&self.name, "Within rate limit")
    }

    fn reset(&mut self) {
        self.accepted.clear();
    }
}

/// A configured rule instance, possibly carrying counters.
#[derive(Debug, Clone)]
pub enum PolicyRule {
    Caller(CallerRule),
    SpendingLimit(SpendingLimitRule),
    RateLimit(RateLimitRule),
    Allowlist(AllowlistRule),
}

impl PolicyRule {
    /// Instantiate a fresh rule from its configuration.
    pub fn build(config: &PolicyRuleConfig) -> Self {
        match config {
            PolicyRuleConfig::Caller { allowed_callers } => {
                PolicyRule::Caller(CallerRule::new(allowed_callers.iter().cloned()))
            }
            PolicyRuleConfig::SpendingLimit {
                max_value_per_tx,
                max_value_per_day,
            } => PolicyRule::SpendingLimit(SpendingLimitRule::new(
                *max_value_per_tx,
                *max_value_per_day,
            )),
            PolicyRuleConfig::RateLimit {
                max_requests_per_minute,
            } => PolicyRule::RateLimit(RateLimitRule::new(*max_requests_per_minute)),
            PolicyRuleConfig::Allowlist { allowed_addresses } => {
                PolicyRule::Allowlist(AllowlistRule::new(allowed_addresses))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PolicyRule::Caller(r) => &r.name,
            PolicyRule::SpendingLimit(r) => &r.name,
            PolicyRule::RateLimit(r) => &r.name,
            PolicyRule::Allowlist(r) => &r.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PolicyRule::Caller(_) => "caller",
            PolicyRule::SpendingLimit(_) => "spending-limit",
            PolicyRule::RateLimit(_) => "rate-limit",
            PolicyRule::Allowlist(_) => "allowlist",
        }
    }

    pub fn evaluate(&mut self, ctx: &SigningContext) -> PolicyEvaluation {
        match self {
            PolicyRule::Caller(r) => r.evaluate(ctx),
            PolicyRule::SpendingLimit(r) => r.evaluate(ctx),
            PolicyRule::RateLimit(r) => r.evaluate(ctx),
            PolicyRule::Allowlist(r) => r.evaluate(ctx),
        }
    }

    /// Forget accumulated spend and request history.
    pub fn reset(&mut self) {
        match self {
            PolicyRule::SpendingLimit(r) => r.reset(),
            PolicyRule::RateLimit(r) => r.reset(),
            PolicyRule::Caller(_) | PolicyRule::Allowlist(_) => {}
        }
    }
}

impl From<CallerRule> for PolicyRule {
    fn from(rule: CallerRule) -> Self {
        PolicyRule::Caller(rule)
    }
}

impl From<SpendingLimitRule> for PolicyRule {
    fn from(rule: SpendingLimitRule) -> Self {
        PolicyRule::SpendingLimit(rule)
    }
}

impl From<RateLimitRule> for PolicyRule {
    fn from(rule: RateLimitRule) -> Self {
        PolicyRule::RateLimit(rule)
    }
}

impl From<AllowlistRule> for PolicyRule {
    fn from(rule: AllowlistRule) -> Self {
        PolicyRule::Allowlist(rule)
    }
}

/// Wei amounts: serialized as decimal strings, read from strings
/// (decimal or `0x` hex) or JSON integers.
pub mod amount {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn parse(s: &str) -> Result<u128, String> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u128::from_str_radix(hex, 16),
            None => s.parse::<u128>(),
        };
        parsed.map_err(|e| format!("invalid amount '{s}': {e}"))
    }

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }

    struct AmountVisitor;

    impl Visitor<'_> for AmountVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative integer or integer string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(u128::from(v))
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
            u128::try_from(v).map_err(|_| E::custom("amount must not be negative"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
            parse(v).map_err(E::custom)
        }
    }

    /// Same encoding for optional amounts.
    pub mod option {
        use std::fmt;

        use serde::de::{self, Visitor};
        use serde::{Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<u128>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u128>, D::Error> {
            deserializer.deserialize_option(OptionalAmountVisitor)
        }

        struct OptionalAmountVisitor;

        impl<'de> Visitor<'de> for OptionalAmountVisitor {
            type Value = Option<u128>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an optional amount")
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> Result<Self::Value, D::Error> {
                super::deserialize(deserializer).map(Some)
            }
        }
    }
}
