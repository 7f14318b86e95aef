use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Transport configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// How long `request` waits for a reply
    pub rpc_timeout: Duration,
    /// Delay before each redelivery of a failed message
    pub retry_schedule: Vec<Duration>,
    /// Upper bound on concurrently running deliveries
    pub max_concurrent_deliveries: usize,
    /// How long `stop` waits for in-flight deliveries
    pub shutdown_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            retry_schedule: RetryPolicy::default().schedule().to_vec(),
            max_concurrent_deliveries: 64,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rpc_timeout = match lookup("SWITCHYARD_RPC_TIMEOUT_MS") {
            Some(raw) => parse_millis(&raw)
                .context("SWITCHYARD_RPC_TIMEOUT_MS must be a number of milliseconds")?,
            None => defaults.rpc_timeout,
        };

        let retry_schedule = match lookup("SWITCHYARD_RETRY_SCHEDULE_MS") {
            Some(raw) => parse_schedule(&raw).context(
                "SWITCHYARD_RETRY_SCHEDULE_MS must be a comma separated list of milliseconds",
            )?,
            None => defaults.retry_schedule,
        };

        let max_concurrent_deliveries = match lookup("SWITCHYARD_MAX_CONCURRENT_DELIVERIES") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .context("SWITCHYARD_MAX_CONCURRENT_DELIVERIES must be a positive number")?,
            None => defaults.max_concurrent_deliveries,
        };

        let shutdown_timeout = match lookup("SWITCHYARD_SHUTDOWN_TIMEOUT_MS") {
            Some(raw) => parse_millis(&raw)
                .context("SWITCHYARD_SHUTDOWN_TIMEOUT_MS must be a number of milliseconds")?,
            None => defaults.shutdown_timeout,
        };

        Ok(Self {
            rpc_timeout,
            retry_schedule,
            max_concurrent_deliveries,
            shutdown_timeout,
        })
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.retry_schedule = schedule;
        self
    }

    pub fn with_max_concurrent_deliveries(mut self, max: usize) -> Self {
        self.max_concurrent_deliveries = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The retry policy described by `retry_schedule`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_schedule.clone())
    }
}

fn parse_millis(raw: &str) -> Result<Duration> {
    let millis: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid milliseconds value {raw:?}"))?;
    Ok(Duration::from_millis(millis))
}

fn parse_schedule(raw: &str) -> Result<Vec<Duration>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',').map(parse_millis).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = TransportConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(
            config.retry_schedule,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2)
            ]
        );
        assert_eq!(config.max_concurrent_deliveries, 64);
    }

    #[test]
    fn test_overrides() {
        let config = TransportConfig::from_lookup(lookup(&[
            ("SWITCHYARD_RPC_TIMEOUT_MS", "250"),
            ("SWITCHYARD_RETRY_SCHEDULE_MS", "10, 20,40"),
            ("SWITCHYARD_MAX_CONCURRENT_DELIVERIES", "8"),
            ("SWITCHYARD_SHUTDOWN_TIMEOUT_MS", "1000"),
        ]))
        .unwrap();

        assert_eq!(config.rpc_timeout, Duration::from_millis(250));
        assert_eq!(
            config.retry_schedule,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
        assert_eq!(config.max_concurrent_deliveries, 8);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.retry_policy().max_retries(), 3);
    }

    #[test]
    fn test_empty_schedule_disables_retries() {
        let config =
            TransportConfig::from_lookup(lookup(&[("SWITCHYARD_RETRY_SCHEDULE_MS", "")])).unwrap();
        assert!(config.retry_schedule.is_empty());
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = TransportConfig::from_lookup(lookup(&[("SWITCHYARD_RPC_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("SWITCHYARD_RPC_TIMEOUT_MS"));

        let err = TransportConfig::from_lookup(lookup(&[(
            "SWITCHYARD_MAX_CONCURRENT_DELIVERIES",
            "0",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("positive"));
    }
}
