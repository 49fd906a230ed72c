//! Controller configuration.
//!
//! Configuration is read from `KEEL_*` environment variables. Unset or
//! blank variables keep their defaults; malformed values are errors.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `KEEL_CONCURRENT_RECONCILES` | - | Per-type workers, `Type=N,Type=N` |
//! | `KEEL_DEFAULT_CONCURRENCY` | `1` | Workers for unlisted types |
//! | `KEEL_STORE_URL` | `http://localhost:8080` | Canonical store endpoint |
//! | `KEEL_BROKER_HOST` | `localhost` | Broker host |
//! | `KEEL_BROKER_PORT` | `4222` | Broker port |
//! | `KEEL_BROKER_USER` | - | Broker user |
//! | `KEEL_BROKER_PASSWORD` | - | Broker password |
//! | `KEEL_AUTH_ENABLED` | `false` | Authenticate to the broker |
//! | `KEEL_SHUTDOWN_PORT` | `8081` | Admin HTTP port |
//! | `KEEL_LOG_FORMAT` | `pretty` | `json` or `pretty` |
//! | `KEEL_VERBOSITY` | `1` | 0 warn, 1 info, 2 debug, 3 trace |
//! | `KEEL_LOCK_TTL_SECS` | `1200` | Lock bucket TTL |
//! | `KEEL_BACKOFF_INITIAL_SECS` | `1` | Minimum requeue delay |
//! | `KEEL_BACKOFF_MAX_SECS` | `300` | Maximum requeue delay |
//! | `KEEL_POLL_TIMEOUT_SECS` | `20` | Pull timeout |
//! | `KEEL_DRAIN_GRACE_SECS` | `10` | Shutdown drain grace |

use std::collections::BTreeMap;
use std::time::Duration;

use keel_core::kv::DEFAULT_BUCKET_TTL;
use keel_core::observability::LogFormat;

use crate::backoff::{BackoffConfig, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY};
use crate::engine::{ReconcilerConfig, DEFAULT_DRAIN_GRACE, DEFAULT_POLL_TIMEOUT};
use crate::error::{Error, Result};

/// Default admin HTTP port.
pub const DEFAULT_SHUTDOWN_PORT: u16 = 8081;

/// Broker connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// User for authenticated connections.
    pub user: Option<String>,
    /// Password for authenticated connections.
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4222,
            user: None,
            password: None,
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl BrokerConfig {
    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Process-wide controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Workers per object type.
    pub concurrent_reconciles: BTreeMap<String, usize>,
    /// Workers for types not listed in `concurrent_reconciles`.
    pub default_concurrency: usize,
    /// Canonical store endpoint.
    pub store_url: String,
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Whether broker connections authenticate.
    pub auth_enabled: bool,
    /// Admin HTTP port.
    pub shutdown_port: u16,
    /// Log output format.
    pub log_format: LogFormat,
    /// Log verbosity, 0 (warn) to 3 (trace).
    pub verbosity: u8,
    /// Lock bucket TTL.
    pub lock_ttl: Duration,
    /// Requeue delay bounds.
    pub backoff: BackoffConfig,
    /// Pull timeout.
    pub poll_timeout: Duration,
    /// Shutdown drain grace.
    pub drain_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_reconciles: BTreeMap::new(),
            default_concurrency: 1,
            store_url: "http://localhost:8080".to_string(),
            broker: BrokerConfig::default(),
            auth_enabled: false,
            shutdown_port: DEFAULT_SHUTDOWN_PORT,
            log_format: LogFormat::Pretty,
            verbosity: 1,
            lock_ttl: DEFAULT_BUCKET_TTL,
            backoff: BackoffConfig::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is malformed or the
    /// result fails [`ControllerConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup` instead of the environment.
    ///
    /// # Errors
    ///
    /// See [`ControllerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(v) = env.string("KEEL_CONCURRENT_RECONCILES") {
            config.concurrent_reconciles = parse_concurrency("KEEL_CONCURRENT_RECONCILES", &v)?;
        }
        if let Some(n) = env.usize("KEEL_DEFAULT_CONCURRENCY")? {
            config.default_concurrency = n;
        }
        if let Some(url) = env.string("KEEL_STORE_URL") {
            config.store_url = url;
        }
        if let Some(host) = env.string("KEEL_BROKER_HOST") {
            config.broker.host = host;
        }
        if let Some(port) = env.u16("KEEL_BROKER_PORT")? {
            config.broker.port = port;
        }
        config.broker.user = env.string("KEEL_BROKER_USER");
        config.broker.password = env.string("KEEL_BROKER_PASSWORD");
        if let Some(enabled) = env.bool("KEEL_AUTH_ENABLED")? {
            config.auth_enabled = enabled;
        }
        if let Some(port) = env.u16("KEEL_SHUTDOWN_PORT")? {
            config.shutdown_port = port;
        }
        if let Some(format) = env.string("KEEL_LOG_FORMAT") {
            config.log_format = format
                .parse()
                .map_err(|e| Error::configuration(format!("KEEL_LOG_FORMAT: {e}")))?;
        }
        if let Some(v) = env.u64("KEEL_VERBOSITY")? {
            config.verbosity = u8::try_from(v.min(3)).unwrap_or(3);
        }
        if let Some(secs) = env.u64("KEEL_LOCK_TTL_SECS")? {
            config.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("KEEL_BACKOFF_INITIAL_SECS")? {
            config.backoff.initial = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("KEEL_BACKOFF_MAX_SECS")? {
            config.backoff.max = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("KEEL_POLL_TIMEOUT_SECS")? {
            config.poll_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("KEEL_DRAIN_GRACE_SECS")? {
            config.drain_grace = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for zero concurrency, an initial
    /// backoff above the maximum, a zero lock TTL, or authentication without
    /// broker credentials.
    pub fn validate(&self) -> Result<()> {
        if self.default_concurrency == 0 {
            return Err(Error::configuration("KEEL_DEFAULT_CONCURRENCY must be at least 1"));
        }
        if let Some((kind, _)) = self.concurrent_reconciles.iter().find(|(_, n)| **n == 0) {
            return Err(Error::configuration(format!(
                "KEEL_CONCURRENT_RECONCILES: {kind} must have at least 1 worker"
            )));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(Error::configuration(
                "KEEL_BACKOFF_INITIAL_SECS must not exceed KEEL_BACKOFF_MAX_SECS",
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(Error::configuration("KEEL_LOCK_TTL_SECS must be positive"));
        }
        if self.auth_enabled && (self.broker.user.is_none() || self.broker.password.is_none()) {
            return Err(Error::configuration(
                "KEEL_AUTH_ENABLED requires KEEL_BROKER_USER and KEEL_BROKER_PASSWORD",
            ));
        }
        Ok(())
    }

    /// Returns the worker count for an object type.
    #[must_use]
    pub fn concurrency_for(&self, type_tag: &str) -> usize {
        self.concurrent_reconciles
            .get(type_tag)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    /// Returns the default log filter directive for the configured verbosity.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Builds the engine config of one reconciler.
    #[must_use]
    pub fn reconciler_config(&self, name: &str, type_tag: &str) -> ReconcilerConfig {
        ReconcilerConfig::new(name)
            .with_concurrency(self.concurrency_for(type_tag))
            .with_poll_timeout(self.poll_timeout)
            .with_drain_grace(self.drain_grace)
            .with_backoff(self.backoff)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u16(&self, name: &str) -> Result<Option<u16>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u16>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u16: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

/// Parses `Type=N,Type=N`.
fn parse_concurrency(name: &str, value: &str) -> Result<BTreeMap<String, usize>> {
    let mut out = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (kind, count) = pair
            .split_once('=')
            .ok_or_else(|| Error::configuration(format!("{name}: expected Type=N, got {pair:?}")))?;
        let count = count
            .trim()
            .parse::<usize>()
            .map_err(|e| Error::configuration(format!("{name}: {kind}: {e}")))?;
        out.insert(kind.trim().to_string(), count);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ControllerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).expect("defaults");
        assert_eq!(config.shutdown_port, 8081);
        assert_eq!(config.lock_ttl, Duration::from_secs(1200));
        assert_eq!(config.backoff.initial, Duration::from_secs(1));
        assert_eq!(config.backoff.max, Duration::from_secs(300));
        assert_eq!(config.poll_timeout, Duration::from_secs(20));
        assert_eq!(config.concurrency_for("Workload"), 1);
        assert_eq!(config.log_directive(), "info");
    }

    #[test]
    fn per_type_concurrency_parses() {
        let config = load(&[
            ("KEEL_CONCURRENT_RECONCILES", "Workload=4, Gateway=2"),
            ("KEEL_DEFAULT_CONCURRENCY", "3"),
        ])
        .expect("config");
        assert_eq!(config.concurrency_for("Workload"), 4);
        assert_eq!(config.concurrency_for("Gateway"), 2);
        assert_eq!(config.concurrency_for("Volume"), 3);

        let engine = config.reconciler_config("WorkloadReconciler", "Workload");
        assert_eq!(engine.concurrent_reconciles, 4);
        assert_eq!(engine.name, "WorkloadReconciler");
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = load(&[("KEEL_SHUTDOWN_PORT", "   ")]).expect("config");
        assert_eq!(config.shutdown_port, 8081);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(load(&[("KEEL_SHUTDOWN_PORT", "eighty")]).is_err());
        assert!(load(&[("KEEL_AUTH_ENABLED", "maybe")]).is_err());
        assert!(load(&[("KEEL_CONCURRENT_RECONCILES", "Workload")]).is_err());
        assert!(load(&[("KEEL_LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn validation_rules() {
        assert!(load(&[("KEEL_DEFAULT_CONCURRENCY", "0")]).is_err());
        assert!(load(&[("KEEL_CONCURRENT_RECONCILES", "Workload=0")]).is_err());
        assert!(load(&[
            ("KEEL_BACKOFF_INITIAL_SECS", "10"),
            ("KEEL_BACKOFF_MAX_SECS", "5"),
        ])
        .is_err());
        assert!(load(&[("KEEL_AUTH_ENABLED", "true")]).is_err());
        assert!(load(&[
            ("KEEL_AUTH_ENABLED", "true"),
            ("KEEL_BROKER_USER", "keel"),
            ("KEEL_BROKER_PASSWORD", "hunter2"),
        ])
        .is_ok());
    }

    #[test]
    fn verbosity_maps_to_directive() {
        assert_eq!(load(&[("KEEL_VERBOSITY", "0")]).expect("config").log_directive(), "warn");
        assert_eq!(load(&[("KEEL_VERBOSITY", "2")]).expect("config").log_directive(), "debug");
        assert_eq!(load(&[("KEEL_VERBOSITY", "9")]).expect("config").log_directive(), "trace");
    }

    #[test]
    fn debug_redacts_password() {
        let broker = BrokerConfig {
            password: Some("hunter2".into()),
            ..BrokerConfig::default()
        };
        let rendered = format!("{broker:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
