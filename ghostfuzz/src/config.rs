//! Harness settings, read from `GHOSTFUZZ_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::constants::{
    DEFAULT_CLIENT_NAME, DEFAULT_SERVER, LOG_BUFFER_CAPACITY, MAX_BATCH_SIZE, MAX_MAPPED_REGIONS, MAX_RETRIES,
    WATCHDOG_TIMEOUT,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub server: String,
    pub client_name: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_regions: usize,
    pub log_capacity: usize,
    pub max_batch: u32,
    pub echo_log: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            timeout: WATCHDOG_TIMEOUT,
            max_retries: MAX_RETRIES,
            max_regions: MAX_MAPPED_REGIONS,
            log_capacity: LOG_BUFFER_CAPACITY,
            max_batch: MAX_BATCH_SIZE,
            echo_log: true,
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let timeout_ms = parse(&lookup, "GHOSTFUZZ_TIMEOUT_MS", defaults.timeout.as_millis() as u64)?;
        if timeout_ms == 0 {
            bail!("GHOSTFUZZ_TIMEOUT_MS must be positive");
        }
        let max_retries = parse(&lookup, "GHOSTFUZZ_MAX_RETRIES", defaults.max_retries)?;
        if max_retries == 0 {
            bail!("GHOSTFUZZ_MAX_RETRIES must be positive");
        }
        Ok(Self {
            server: lookup("GHOSTFUZZ_SERVER").unwrap_or(defaults.server),
            client_name: lookup("GHOSTFUZZ_CLIENT_NAME").unwrap_or(defaults.client_name),
            timeout: Duration::from_millis(timeout_ms),
            max_retries,
            max_regions: parse(&lookup, "GHOSTFUZZ_MAX_REGIONS", defaults.max_regions)?,
            log_capacity: parse(&lookup, "GHOSTFUZZ_LOG_CAPACITY", defaults.log_capacity)?,
            max_batch: parse(&lookup, "GHOSTFUZZ_MAX_BATCH", defaults.max_batch)?,
            echo_log: parse(&lookup, "GHOSTFUZZ_ECHO_LOG", defaults.echo_log)?,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
