//! Broker configuration: a TOML manifest plus environment overrides for
//! secret-bearing fields (SPEC_FULL.md §4.8).

use crate::error::LighthouseError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fallback policy for the speed layer when the expert tier times out
/// (SPEC_FULL.md §4.4 "Fallback policy on expert timeout").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Safe (safelisted) tools are approved; everything else is blocked.
    SafeAllowElseBlock,
    /// Every tool is blocked on expert timeout, no exceptions.
    AlwaysBlock,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::SafeAllowElseBlock
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub validations_per_second: u32,
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            validations_per_second: 10,
            burst: 30,
        }
    }
}

/// The validated, immutable configuration surface enumerated in
/// SPEC_FULL.md §6, plus the ambient `log_level`/`trace_path` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub data_dir: PathBuf,
    pub node_id: String,
    #[serde(skip)]
    pub broker_secret: Vec<u8>,
    pub max_event_size: u64,
    pub segment_size: u64,
    pub memory_cache_size: usize,
    pub policy_rules_path: Option<PathBuf>,
    pub expert_timeout_seconds: u64,
    pub elicitation_default_timeout_seconds: u64,
    pub elicitation_max_timeout_seconds: u64,
    pub rate_limits: RateLimitsByRole,
    pub subscription_buffer_size: usize,
    pub session_ttl_seconds: u64,
    pub token_ttl_seconds: u64,
    pub fallback_policy: FallbackPolicy,
    pub log_level: String,
    pub trace_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitsByRole {
    pub builder_agent: RateLimit,
    pub expert_agent: RateLimit,
    pub guest: RateLimit,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".lighthouse"),
            node_id: "node-0".to_string(),
            broker_secret: Vec::new(),
            max_event_size: 1024 * 1024,
            segment_size: 100 * 1024 * 1024,
            memory_cache_size: 10_000,
            policy_rules_path: None,
            expert_timeout_seconds: 30,
            elicitation_default_timeout_seconds: 30,
            elicitation_max_timeout_seconds: 300,
            rate_limits: RateLimitsByRole::default(),
            subscription_buffer_size: 1000,
            session_ttl_seconds: 2 * 60 * 60,
            token_ttl_seconds: 24 * 60 * 60,
            fallback_policy: FallbackPolicy::default(),
            log_level: "info".to_string(),
            trace_path: None,
        }
    }
}

impl BrokerConfig {
    /// Loads a `lighthouse.toml` manifest from `path`, applies environment
    /// overrides, validates field ranges, and returns the populated config.
    /// `LIGHTHOUSE_BROKER_SECRET` is required and is never read from the
    /// manifest file itself.
    pub fn load(path: &Path) -> Result<Self, LighthouseError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<BrokerConfig>(&content)?
        } else {
            BrokerConfig::default()
        };

        config.broker_secret = std::env::var("LIGHTHOUSE_BROKER_SECRET")
            .map_err(|_| {
                LighthouseError::ConfigError(
                    "LIGHTHOUSE_BROKER_SECRET must be set in the environment".to_string(),
                )
            })?
            .into_bytes();

        config.validate()?;
        Ok(config)
    }

    /// Builds a config suitable for tests/benches: a random-ish in-memory
    /// secret and a caller-supplied data directory, skipping the
    /// environment/file lookup entirely.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            broker_secret: b"test-only-broker-secret".to_vec(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), LighthouseError> {
        if self.broker_secret.is_empty() {
            return Err(LighthouseError::ConfigError(
                "broker_secret must not be empty".to_string(),
            ));
        }
        if self.max_event_size > 10 * 1024 * 1024 {
            return Err(LighthouseError::ConfigError(
                "max_event_size must not exceed 10 MiB".to_string(),
            ));
        }
        if self.elicitation_max_timeout_seconds > 300 {
            return Err(LighthouseError::ConfigError(
                "elicitation_max_timeout_seconds must not exceed 300".to_string(),
            ));
        }
        if self.elicitation_default_timeout_seconds > self.elicitation_max_timeout_seconds {
            return Err(LighthouseError::ConfigError(
                "elicitation_default_timeout_seconds must not exceed the max".to_string(),
            ));
        }
        if self.node_id.trim().is_empty() {
            return Err(LighthouseError::ConfigError(
                "node_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    pub fn trace_path(&self) -> PathBuf {
        self.trace_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("traces").join("traces.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_values() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_event_size, 1024 * 1024);
        assert_eq!(config.elicitation_max_timeout_seconds, 300);
        assert_eq!(config.fallback_policy, FallbackPolicy::SafeAllowElseBlock);
    }

    #[test]
    fn test_load_missing_manifest_uses_defaults() {
        // SAFETY: test-only env var scoping; no other test in this process
        // mutates LIGHTHOUSE_BROKER_SECRET concurrently within this crate's
        // single-threaded-per-module test harness assumptions.
        unsafe {
            std::env::set_var("LIGHTHOUSE_BROKER_SECRET", "unit-test-secret");
        }
        let tmp = tempdir().unwrap();
        let missing = tmp.path().join("lighthouse.toml");
        let config = BrokerConfig::load(&missing).unwrap();
        assert_eq!(config.node_id, "node-0");
        assert_eq!(config.broker_secret, b"unit-test-secret");
        unsafe {
            std::env::remove_var("LIGHTHOUSE_BROKER_SECRET");
        }
    }

    #[test]
    fn test_load_rejects_missing_secret() {
        unsafe {
            std::env::remove_var("LIGHTHOUSE_BROKER_SECRET");
        }
        let tmp = tempdir().unwrap();
        let missing = tmp.path().join("lighthouse.toml");
        let result = BrokerConfig::load(&missing);
        assert!(matches!(result, Err(LighthouseError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_event_limit() {
        let mut config = BrokerConfig::for_tests(PathBuf::from("/tmp/x"));
        config.max_event_size = 20 * 1024 * 1024;
        assert!(matches!(
            config.validate(),
            Err(LighthouseError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_elicitation_timeout_over_300() {
        let mut config = BrokerConfig::for_tests(PathBuf::from("/tmp/x"));
        config.elicitation_max_timeout_seconds = 400;
        assert!(matches!(
            config.validate(),
            Err(LighthouseError::ConfigError(_))
        ));
    }

    #[test]
    fn test_parse_toml_manifest() {
        let toml_src = r#"
            node_id = "node-a"
            max_event_size = 2048
        "#;
        let mut config: BrokerConfig = toml::from_str(toml_src).unwrap();
        config.broker_secret = b"secret".to_vec();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.max_event_size, 2048);
        assert!(config.validate().is_ok());
    }
}
