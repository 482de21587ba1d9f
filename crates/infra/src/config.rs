//! Ledger configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use equiptrack_core::{ConditionId, DomainError, StatusId};
use equiptrack_inventory::ReadinessRule;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Status id an admin-stock unit needs to be issuable.
    pub ready_status_id: String,
    /// Condition id an admin-stock unit needs to be issuable.
    pub ready_condition_id: String,
    /// Lease length for workflow and maintenance locks.
    pub lock_lease: Duration,
    /// Budget for one ownership transfer, caller side.
    pub operation_timeout: Duration,
    pub retry: RetryPolicy,
    /// Label frozen into snapshots of units that no longer exist.
    pub unknown_label: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ready_status_id: "available".to_string(),
            ready_condition_id: "working".to_string(),
            lock_lease: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            unknown_label: "Unknown (deleted)".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Defaults overlaid with `EQUIPTRACK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("EQUIPTRACK_READY_STATUS") {
            config.ready_status_id = v;
        }
        if let Some(v) = lookup("EQUIPTRACK_READY_CONDITION") {
            config.ready_condition_id = v;
        }
        if let Some(v) = lookup("EQUIPTRACK_LOCK_LEASE_SECS") {
            config.lock_lease = Duration::from_secs(parse_number("EQUIPTRACK_LOCK_LEASE_SECS", &v)?);
        }
        if let Some(v) = lookup("EQUIPTRACK_OPERATION_TIMEOUT_SECS") {
            config.operation_timeout =
                Duration::from_secs(parse_number("EQUIPTRACK_OPERATION_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("EQUIPTRACK_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_number("EQUIPTRACK_RETRY_MAX_ATTEMPTS", &v)? as u32;
        }
        if let Some(v) = lookup("EQUIPTRACK_UNKNOWN_LABEL") {
            config.unknown_label = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.readiness_rule()?;
        if self.lock_lease.is_zero() {
            return Err(ConfigError::Invalid {
                var: "lock_lease",
                value: "0".to_string(),
                reason: "lease must be positive".to_string(),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "operation_timeout",
                value: "0".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }
        if self.unknown_label.trim().is_empty() {
            return Err(ConfigError::Invalid {
                var: "unknown_label",
                value: self.unknown_label.clone(),
                reason: "label cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn readiness_rule(&self) -> Result<ReadinessRule, ConfigError> {
        Ok(ReadinessRule::new(
            StatusId::parse(&self.ready_status_id)?,
            ConditionId::parse(&self.ready_condition_id)?,
        ))
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = LedgerConfig::default();
        config.validate().unwrap();
        let rule = config.readiness_rule().unwrap();
        assert_eq!(rule.status.as_str(), "available");
    }

    #[test]
    fn env_overrides_apply() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("EQUIPTRACK_READY_STATUS", "in-stock"),
            ("EQUIPTRACK_LOCK_LEASE_SECS", "5"),
            ("EQUIPTRACK_RETRY_MAX_ATTEMPTS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.ready_status_id, "in-stock");
        assert_eq!(config.lock_lease, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 0);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = LedgerConfig::from_lookup(lookup(&[("EQUIPTRACK_LOCK_LEASE_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "EQUIPTRACK_LOCK_LEASE_SECS",
                ..
            }
        ));

        let blank = LedgerConfig::from_lookup(lookup(&[("EQUIPTRACK_READY_CONDITION", "  ")]));
        assert!(matches!(blank, Err(ConfigError::Domain(_))));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{ "ready_condition_id": "good" }"#).unwrap();
        assert_eq!(config.ready_condition_id, "good");
        assert_eq!(config.ready_status_id, "available");
    }
}
