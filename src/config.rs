//! Broker configuration
//!
//! All tunables load from the environment with typed parse errors; anything
//! unset falls back to the component defaults. The vault master key accepts
//! 64-char hex (with or without `0x`) or base64, and must decode to exactly
//! 32 bytes.

use std::str::FromStr;
use std::time::Duration;

use base64::Engine;

use crate::coordinator::CoordinatorConfig;
use crate::error::{BrokerError, Result};
use crate::ledger::GatewayConfig;
use crate::vault::VaultKey;

/// Top-level configuration. No `Debug` derive: the vault master key must
/// not end up in log output.
#[derive(Clone, Default)]
pub struct BrokerConfig {
    pub gateway: GatewayConfig,
    pub coordinator: CoordinatorConfig,
    /// Master key for the credential vault
    pub vault_master_key: Option<VaultKey>,
}

impl BrokerConfig {
    /// Load configuration from `HEALTHLINK_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(key) = std::env::var("HEALTHLINK_VAULT_KEY").ok().as_deref() {
            config.vault_master_key = Some(parse_32_byte_key(key)?);
        }
        if let Ok(label) = std::env::var("HEALTHLINK_IDENTITY_LABEL") {
            config.gateway.identity_label = label;
        }
        if let Some(secs) = env_parse::<u64>("HEALTHLINK_LEDGER_TIMEOUT_SECS")? {
            config.gateway.call_timeout = Duration::from_secs(secs);
        }

        if let Some(max) = env_parse::<usize>("HEALTHLINK_POOL_MAX")? {
            config.gateway.pool = config.gateway.pool.with_max_size(max);
        }
        if let Some(min) = env_parse::<usize>("HEALTHLINK_POOL_MIN")? {
            config.gateway.pool = config.gateway.pool.with_min_size(min);
        }
        if let Some(ms) = env_parse::<u64>("HEALTHLINK_POOL_CHECKOUT_TIMEOUT_MS")? {
            config.gateway.pool = config
                .gateway
                .pool
                .with_checkout_timeout(Duration::from_millis(ms));
        }

        if let Some(threshold) = env_parse::<u32>("HEALTHLINK_BREAKER_THRESHOLD")? {
            config.gateway.breaker = config.gateway.breaker.with_failure_threshold(threshold);
        }
        if let Some(secs) = env_parse::<u64>("HEALTHLINK_BREAKER_WINDOW_SECS")? {
            config.gateway.breaker = config
                .gateway
                .breaker
                .with_failure_window(Duration::from_secs(secs));
        }
        if let Some(secs) = env_parse::<u64>("HEALTHLINK_BREAKER_RESET_SECS")? {
            config.gateway.breaker = config
                .gateway
                .breaker
                .with_reset_timeout(Duration::from_secs(secs));
        }

        if let Some(max) = env_parse::<u32>("HEALTHLINK_RETRY_MAX")? {
            config.gateway.retry = config.gateway.retry.clone().with_max_retries(max);
        }
        if let Some(ms) = env_parse::<u64>("HEALTHLINK_RETRY_INITIAL_MS")? {
            config.gateway.retry = config
                .gateway
                .retry
                .clone()
                .with_initial_delay(Duration::from_millis(ms));
        }

        if let Some(secs) = env_parse::<u64>("HEALTHLINK_CACHE_TTL_SECS")? {
            config.coordinator.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<usize>("HEALTHLINK_CACHE_MAX")? {
            config.coordinator.cache_max_entries = max;
        }
        if let Some(hours) = env_parse::<i64>("HEALTHLINK_MIN_VALIDITY_HOURS")? {
            config.coordinator.min_validity = chrono::Duration::hours(hours);
        }
        if let Ok(actor) = std::env::var("HEALTHLINK_ACTOR_ID") {
            config.coordinator.actor_id = actor;
        }
        if let Some(flag) = std::env::var("HEALTHLINK_VERIFY_READS").ok().as_deref() {
            config.coordinator.verify_reads = parse_bool("HEALTHLINK_VERIFY_READS", flag)?;
        }

        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| BrokerError::Configuration(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" => Ok(false),
        other => Err(BrokerError::Configuration(format!(
            "invalid {name}={other} (expected: true|false)"
        ))),
    }
}

/// Parse a 32-byte key from hex (optionally `0x`-prefixed) or base64
pub fn parse_32_byte_key(s: &str) -> Result<VaultKey> {
    let trimmed = s.trim();
    let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    if hex_str.len() == 64 && hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(hex_str)
            .map_err(|e| BrokerError::Configuration(format!("invalid vault key hex: {e}")))?;
        return bytes
            .try_into()
            .map_err(|_| BrokerError::Configuration("vault key must be 32 bytes".to_string()));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed)
        })
        .map_err(|e| BrokerError::Configuration(format!("invalid vault key base64: {e}")))?;

    bytes
        .try_into()
        .map_err(|_| BrokerError::Configuration("vault key must be 32 bytes".to_string()))
}
