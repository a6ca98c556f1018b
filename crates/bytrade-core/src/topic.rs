//! Subscribable stream identifiers.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A subscribable stream name such as `orderbook.1.BTCUSDT` or `order`.
///
/// Topics are opaque to the session: they are only compared for equality
/// or by prefix when routing inbound data frames.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a topic, rejecting empty names and embedded whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidTopic(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this topic starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Topic {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_validation() {
        assert!(Topic::new("orderbook.1.BTCUSDT").is_ok());
        assert!(Topic::new("").is_err());
        assert!(Topic::new("public Trade").is_err());
    }

    #[test]
    fn test_topic_prefix() {
        let topic = Topic::new("publicTrade.BTCUSDT").unwrap();
        assert!(topic.has_prefix("publicTrade."));
        assert!(!topic.has_prefix("orderbook."));
    }
}
