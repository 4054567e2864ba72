// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tributary_http::{
    AddressClass, DEFAULT_MAX_BODY_SIZE, HttpClientConfig, MAX_FUNCTION_TIMEOUT, RetryWindow,
    SsrfPolicy,
};

use crate::driver::HttpDriverConfig;
use crate::duration::parse_duration;
use crate::executor::{DEFAULT_MAX_STEPS, ExecutorConfig};

/// Deployment mode. Selects the SSRF defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every private address class is reachable.
    Dev,
    /// Only addresses listed in `TRIBUTARY_SSRF_ALLOW` beyond public ones.
    Prod,
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "prod" | "production" => Ok(Self::Prod),
            _ => Err(()),
        }
    }
}

/// Tributary engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL. In-memory state when unset.
    pub database_url: Option<String>,
    /// HTTP API address
    pub http_addr: SocketAddr,
    /// Worker tasks leasing from the queue
    pub workers: usize,
    /// HMAC key for outbound request signatures
    pub signing_key: Vec<u8>,
    /// Bearer key required by the HTTP API
    pub event_key: Option<String>,
    /// Environment name sent to SDKs
    pub env: String,
    pub mode: Mode,
    /// Address classes allowed on top of the mode defaults
    pub ssrf_allow: Vec<AddressClass>,
    pub max_function_timeout: Duration,
    pub max_body_size: usize,
    pub max_steps: usize,
    pub retry_window: RetryWindow,
    /// How often the pause expiry scan runs
    pub expiry_interval: Duration,
    /// How often cron triggers are evaluated
    pub cron_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required in prod mode:
    /// - `TRIBUTARY_EVENT_KEY`: bearer key for the HTTP API
    ///
    /// Optional (with defaults):
    /// - `TRIBUTARY_DATABASE_URL`: SQLite URL (default: in-memory state)
    /// - `TRIBUTARY_PORT`: HTTP API port (default: 8288)
    /// - `TRIBUTARY_WORKERS`: worker tasks (default: 16)
    /// - `TRIBUTARY_SIGNING_KEY`: request signing key (default: unsigned)
    /// - `TRIBUTARY_ENV`: environment name (default: dev)
    /// - `TRIBUTARY_MODE`: `dev` or `prod` (default: dev)
    /// - `TRIBUTARY_SSRF_ALLOW`: comma separated address classes
    /// - `TRIBUTARY_MAX_FUNCTION_TIMEOUT`: duration (default: 2h)
    /// - `TRIBUTARY_MAX_BODY_SIZE`: bytes (default: 4 MiB)
    /// - `TRIBUTARY_MAX_STEPS`: step limit per run (default: 1000)
    /// - `TRIBUTARY_RETRY_MIN` / `TRIBUTARY_RETRY_MAX`: retry-after window (default: 10s / 7d)
    /// - `TRIBUTARY_EXPIRY_INTERVAL`: pause expiry scan period (default: 1s)
    /// - `TRIBUTARY_CRON_INTERVAL`: cron tick period (default: 1s)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode: Mode = var("TRIBUTARY_MODE")
            .unwrap_or_else(|| "dev".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TRIBUTARY_MODE", "must be 'dev' or 'prod'"))?;

        let event_key = var("TRIBUTARY_EVENT_KEY");
        if mode == Mode::Prod && event_key.is_none() {
            return Err(ConfigError::Missing("TRIBUTARY_EVENT_KEY"));
        }

        let port: u16 = parsed("TRIBUTARY_PORT", "8288", "must be a valid port number")?;
        let workers: usize = parsed("TRIBUTARY_WORKERS", "16", "must be a positive integer")?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                "TRIBUTARY_WORKERS",
                "must be a positive integer",
            ));
        }

        let ssrf_allow = match var("TRIBUTARY_SSRF_ALLOW") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    AddressClass::parse(s).ok_or(ConfigError::Invalid(
                        "TRIBUTARY_SSRF_ALLOW",
                        "unknown address class",
                    ))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let max_function_timeout = duration("TRIBUTARY_MAX_FUNCTION_TIMEOUT", MAX_FUNCTION_TIMEOUT)?;
        let retry_window = RetryWindow {
            min: duration("TRIBUTARY_RETRY_MIN", RetryWindow::default().min)?,
            max: duration("TRIBUTARY_RETRY_MAX", RetryWindow::default().max)?,
        };
        if retry_window.min > retry_window.max {
            return Err(ConfigError::Invalid(
                "TRIBUTARY_RETRY_MIN",
                "must not exceed TRIBUTARY_RETRY_MAX",
            ));
        }

        Ok(Self {
            database_url: var("TRIBUTARY_DATABASE_URL"),
            http_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            workers,
            signing_key: var("TRIBUTARY_SIGNING_KEY")
                .map(String::into_bytes)
                .unwrap_or_default(),
            event_key,
            env: var("TRIBUTARY_ENV").unwrap_or_else(|| "dev".to_string()),
            mode,
            ssrf_allow,
            max_function_timeout,
            max_body_size: parsed(
                "TRIBUTARY_MAX_BODY_SIZE",
                &DEFAULT_MAX_BODY_SIZE.to_string(),
                "must be a size in bytes",
            )?,
            max_steps: parsed(
                "TRIBUTARY_MAX_STEPS",
                &DEFAULT_MAX_STEPS.to_string(),
                "must be a positive integer",
            )?,
            retry_window,
            expiry_interval: duration("TRIBUTARY_EXPIRY_INTERVAL", Duration::from_secs(1))?,
            cron_interval: duration("TRIBUTARY_CRON_INTERVAL", Duration::from_secs(1))?,
        })
    }

    /// SSRF policy: everything in dev, mode defaults plus `ssrf_allow` in prod.
    pub fn ssrf_policy(&self) -> SsrfPolicy {
        match self.mode {
            Mode::Dev => SsrfPolicy::permissive(),
            Mode::Prod => self
                .ssrf_allow
                .iter()
                .fold(SsrfPolicy::strict(), |policy, class| policy.allow(*class)),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            ssrf: self.ssrf_policy(),
            max_body_size: self.max_body_size,
            timeout: self.max_function_timeout,
            ..Default::default()
        }
    }

    pub fn http_driver_config(&self) -> HttpDriverConfig {
        HttpDriverConfig {
            signing_key: self.signing_key.clone(),
            retry_window: self.retry_window,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            env: self.env.clone(),
            max_steps: self.max_steps,
            max_step_output_size: self.max_body_size,
            ..Default::default()
        }
    }
}

/// A set, non-empty variable.
fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(
    key: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    var(key)
        .unwrap_or_else(|| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(key, message))
}

fn duration(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match var(key) {
        Some(v) => parse_duration(&v).map_err(|_| ConfigError::Invalid(key, "must be a duration")),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 15] = [
        "TRIBUTARY_DATABASE_URL",
        "TRIBUTARY_PORT",
        "TRIBUTARY_WORKERS",
        "TRIBUTARY_SIGNING_KEY",
        "TRIBUTARY_EVENT_KEY",
        "TRIBUTARY_ENV",
        "TRIBUTARY_MODE",
        "TRIBUTARY_SSRF_ALLOW",
        "TRIBUTARY_MAX_FUNCTION_TIMEOUT",
        "TRIBUTARY_MAX_BODY_SIZE",
        "TRIBUTARY_MAX_STEPS",
        "TRIBUTARY_RETRY_MIN",
        "TRIBUTARY_RETRY_MAX",
        "TRIBUTARY_EXPIRY_INTERVAL",
        "TRIBUTARY_CRON_INTERVAL",
    ];

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate of `TRIBUTARY_*` variables.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.http_addr.port(), 8288);
        assert_eq!(config.workers, 16);
        assert!(config.signing_key.is_empty());
        assert_eq!(config.env, "dev");
        assert_eq!(config.mode, Mode::Dev);
        assert_eq!(config.max_function_timeout, MAX_FUNCTION_TIMEOUT);
        assert_eq!(config.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(config.retry_window, RetryWindow::default());
        assert!(config.ssrf_policy().allows(AddressClass::Loopback));
    }

    #[test]
    fn test_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("TRIBUTARY_DATABASE_URL", "sqlite:tributary.db");
        guard.set("TRIBUTARY_PORT", "9000");
        guard.set("TRIBUTARY_WORKERS", "4");
        guard.set("TRIBUTARY_SIGNING_KEY", "signkey-test-12345");
        guard.set("TRIBUTARY_EVENT_KEY", "evt");
        guard.set("TRIBUTARY_ENV", "production");
        guard.set("TRIBUTARY_MODE", "prod");
        guard.set("TRIBUTARY_SSRF_ALLOW", "private, docker");
        guard.set("TRIBUTARY_MAX_FUNCTION_TIMEOUT", "30m");
        guard.set("TRIBUTARY_MAX_STEPS", "50");
        guard.set("TRIBUTARY_RETRY_MIN", "1s");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url.as_deref(), Some("sqlite:tributary.db"));
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.workers, 4);
        assert_eq!(config.signing_key, b"signkey-test-12345");
        assert_eq!(config.event_key.as_deref(), Some("evt"));
        assert_eq!(config.mode, Mode::Prod);
        assert_eq!(config.max_function_timeout, Duration::from_secs(1800));
        assert_eq!(config.retry_window.min, Duration::from_secs(1));

        let policy = config.ssrf_policy();
        assert!(policy.allows(AddressClass::Private));
        assert!(policy.allows(AddressClass::DockerHost));
        assert!(!policy.allows(AddressClass::Loopback));

        let executor = config.executor_config();
        assert_eq!(executor.env, "production");
        assert_eq!(executor.max_steps, 50);
        assert_eq!(config.http_client_config().timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_prod_requires_event_key() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("TRIBUTARY_MODE", "prod");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TRIBUTARY_EVENT_KEY")));
        assert!(err.to_string().contains("TRIBUTARY_EVENT_KEY"));
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let cases = [
            ("TRIBUTARY_PORT", "99999"),
            ("TRIBUTARY_WORKERS", "0"),
            ("TRIBUTARY_MODE", "staging"),
            ("TRIBUTARY_SSRF_ALLOW", "intranet"),
            ("TRIBUTARY_MAX_FUNCTION_TIMEOUT", "soon"),
            ("TRIBUTARY_MAX_BODY_SIZE", "-1"),
            ("TRIBUTARY_RETRY_MIN", "30d"),
        ];
        for (key, value) in cases {
            let mut guard = EnvGuard::clean();
            guard.set(key, value);
            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(k, _) if k == key),
                "{}={} gave {:?}",
                key,
                value,
                err
            );
        }
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
