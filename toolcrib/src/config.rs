//! Service configuration.
//!
//! Every field has a default, so an empty configuration is a working one.
//! Values can come from serde (any format the caller likes) or from
//! `TOOLCRIB_*` environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `TOOLCRIB_REFERENCE_PREFIX` | `reference_prefix` |
//! | `TOOLCRIB_CRITICAL_THRESHOLD` | `critical_threshold` (minor units) |
//! | `TOOLCRIB_SEQUENCE_POLICY` | `sequence_policy` (`fallback` or `fail`) |
//! | `TOOLCRIB_SEGREGATION_OF_DUTIES` | `segregation_of_duties` |
//! | `TOOLCRIB_ROLE_POLICY` | `role_policy` (JSON) |
//! | `TOOLCRIB_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `TOOLCRIB_RETRY_BASE_DELAY_MS` | `retry.base_delay` |
//! | `TOOLCRIB_RETRY_MAX_DELAY_MS` | `retry.max_delay` |
//! | `TOOLCRIB_RETRY_BACKOFF_MULTIPLIER` | `retry.backoff_multiplier` |
//! | `TOOLCRIB_RETRY_JITTER` | `retry.use_jitter` |

use std::str::FromStr;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{
    BackoffMultiplier, MaxRetryAttempts, RetryBaseDelayMs, RetryConfig, RetryMaxDelayMs,
};
use crate::roles::RolePolicy;
use crate::sequence::SequencePolicy;
use crate::types::Money;

/// Document-type prefix of reference numbers, e.g. `BRW`.
#[nutype(
    sanitize(trim),
    validate(
        not_empty,
        len_char_max = 8,
        predicate = |prefix: &str| prefix.chars().all(|c| c.is_ascii_alphanumeric())
    ),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        AsRef,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct ReferencePrefix(String);

impl Default for ReferencePrefix {
    fn default() -> Self {
        Self::try_new("BRW".to_string()).expect("BRW is a valid prefix")
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was set but its value is not acceptable.
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// Raw value.
        value: String,
        /// What was wrong.
        reason: String,
    },
}

/// Configuration of a reservation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolcribConfig {
    /// Prefix of issued references.
    pub reference_prefix: ReferencePrefix,
    /// A resource valued strictly above this makes its batch critical.
    pub critical_threshold: Money,
    /// Behavior when the sequence counter fails.
    pub sequence_policy: SequencePolicy,
    /// Verifier must differ from maker; authorizer must differ from verifier.
    pub segregation_of_duties: bool,
    /// Roles allowed per guarded action.
    pub role_policy: RolePolicy,
    /// Retry of transient store failures.
    pub retry: RetryConfig,
}

impl Default for ToolcribConfig {
    fn default() -> Self {
        Self {
            reference_prefix: ReferencePrefix::default(),
            critical_threshold: Money::from_major(50_000),
            sequence_policy: SequencePolicy::Fallback,
            segregation_of_duties: true,
            role_policy: RolePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ToolcribConfig {
    /// Defaults overridden by `TOOLCRIB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("TOOLCRIB_REFERENCE_PREFIX") {
            config.reference_prefix = ReferencePrefix::try_new(raw.clone())
                .map_err(|e| invalid("TOOLCRIB_REFERENCE_PREFIX", &raw, e))?;
        }
        if let Some(raw) = lookup("TOOLCRIB_CRITICAL_THRESHOLD") {
            config.critical_threshold =
                Money::new(parse("TOOLCRIB_CRITICAL_THRESHOLD", &raw)?);
        }
        if let Some(raw) = lookup("TOOLCRIB_SEQUENCE_POLICY") {
            config.sequence_policy = match raw.trim().to_ascii_lowercase().as_str() {
                "fallback" => SequencePolicy::Fallback,
                "fail" => SequencePolicy::Fail,
                _ => {
                    return Err(invalid(
                        "TOOLCRIB_SEQUENCE_POLICY",
                        &raw,
                        "expected 'fallback' or 'fail'",
                    ))
                }
            };
        }
        if let Some(raw) = lookup("TOOLCRIB_SEGREGATION_OF_DUTIES") {
            config.segregation_of_duties = parse("TOOLCRIB_SEGREGATION_OF_DUTIES", &raw)?;
        }
        if let Some(raw) = lookup("TOOLCRIB_ROLE_POLICY") {
            config.role_policy = serde_json::from_str(&raw)
                .map_err(|e| invalid("TOOLCRIB_ROLE_POLICY", &raw, e))?;
        }

        if let Some(raw) = lookup("TOOLCRIB_RETRY_MAX_ATTEMPTS") {
            let key = "TOOLCRIB_RETRY_MAX_ATTEMPTS";
            config.retry.max_attempts =
                MaxRetryAttempts::try_new(parse(key, &raw)?).map_err(|e| invalid(key, &raw, e))?;
        }
        if let Some(raw) = lookup("TOOLCRIB_RETRY_BASE_DELAY_MS") {
            let key = "TOOLCRIB_RETRY_BASE_DELAY_MS";
            config.retry.base_delay =
                RetryBaseDelayMs::try_new(parse(key, &raw)?).map_err(|e| invalid(key, &raw, e))?;
        }
        if let Some(raw) = lookup("TOOLCRIB_RETRY_MAX_DELAY_MS") {
            let key = "TOOLCRIB_RETRY_MAX_DELAY_MS";
            config.retry.max_delay =
                RetryMaxDelayMs::try_new(parse(key, &raw)?).map_err(|e| invalid(key, &raw, e))?;
        }
        if let Some(raw) = lookup("TOOLCRIB_RETRY_BACKOFF_MULTIPLIER") {
            let key = "TOOLCRIB_RETRY_BACKOFF_MULTIPLIER";
            config.retry.backoff_multiplier = BackoffMultiplier::try_new(parse(key, &raw)?)
                .map_err(|e| invalid(key, &raw, e))?;
        }
        if let Some(raw) = lookup("TOOLCRIB_RETRY_JITTER") {
            config.retry.use_jitter = parse("TOOLCRIB_RETRY_JITTER", &raw)?;
        }

        Ok(config)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| invalid(key, raw, e))
}

fn invalid(key: &'static str, raw: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: reason.to_string(),
    }
}
