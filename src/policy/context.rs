//! Request context every policy rule evaluates against.

use chrono::{DateTime, Utc};

/// What is being signed, by whom, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub caller_id: String,
    pub key_id: String,
    /// Recipient address; `None` for contract deployments and plain messages.
    pub to: Option<String>,
    /// Value in wei.
    pub value: Option<u128>,
    pub data: Option<String>,
    pub chain_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl SigningContext {
    pub fn new(caller_id: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            key_id: key_id.into(),
            to: None,
            value: None,
            data: None,
            chain_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_value(mut self, value: u128) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
