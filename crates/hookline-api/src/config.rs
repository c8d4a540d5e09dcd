//! Service configuration.

use std::{net::SocketAddr, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookline_delivery::{DeliveryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::crypto::{SignatureVerifier, SigningScheme};

const CONFIG_FILE: &str = "hookline.toml";

/// Prefix for environment overrides, e.g. `HOOKLINE_PORT`.
const ENV_PREFIX: &str = "HOOKLINE_";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. `HOOKLINE_*` environment variables (highest priority)
/// 2. `WEBHOOK_SECRET` and `RUST_LOG`
/// 3. Configuration file (`hookline.toml`)
/// 4. Built-in defaults (lowest priority)
///
/// Everything except the shared secret has a working default.
///
/// # Example
///
/// ```no_run
/// use hookline_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    // Intake
    /// Shared HMAC secret. Required.
    pub shared_secret: String,
    /// What the sender's MAC covers.
    pub signing_scheme: SigningScheme,
    /// Maximum allowed distance between the timestamp header and now.
    /// Unset disables the check.
    pub replay_window_seconds: Option<u64>,

    // Retry
    /// Handler outcomes recorded before an event is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub base_retry_delay_ms: u64,
    /// Upper bound on any retry delay in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    pub jitter_factor: f64,

    // Delivery
    /// How long a claim stays exclusive, in milliseconds.
    pub lease_timeout_ms: u64,
    /// Upper bound on one handler invocation, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Number of concurrent delivery workers.
    pub worker_count: usize,
    /// Longest idle wait before a worker polls again, in milliseconds.
    pub poll_interval_ms: u64,
    /// Period of the expired-lease sweep, in milliseconds.
    pub sweep_interval_ms: u64,
    /// How long shutdown waits for running handlers, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Program run for each delivery. Unset logs and acknowledges events.
    pub handler_command: Option<String>,

    // Storage
    /// SQLite connection URL.
    pub database_url: String,
    /// Maximum number of pooled database connections.
    pub database_max_connections: u32,

    // Server
    /// Server bind address.
    pub host: String,
    /// Server bind port.
    pub port: u16,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Bearer token for operator routes. Unset disables them.
    pub admin_token: Option<String>,

    // Logging
    /// Log filter directives.
    pub rust_log: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("shared_secret", &"<redacted>")
            .field("signing_scheme", &self.signing_scheme)
            .field("replay_window_seconds", &self.replay_window_seconds)
            .field("max_attempts", &self.max_attempts)
            .field("base_retry_delay_ms", &self.base_retry_delay_ms)
            .field("max_retry_delay_ms", &self.max_retry_delay_ms)
            .field("jitter_factor", &self.jitter_factor)
            .field("lease_timeout_ms", &self.lease_timeout_ms)
            .field("handler_timeout_ms", &self.handler_timeout_ms)
            .field("worker_count", &self.worker_count)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("sweep_interval_ms", &self.sweep_interval_ms)
            .field("shutdown_timeout_ms", &self.shutdown_timeout_ms)
            .field("handler_command", &self.handler_command)
            .field("database_url", &self.database_url)
            .field("database_max_connections", &self.database_max_connections)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("rust_log", &self.rust_log)
            .finish()
    }
}

impl Config {
    /// Loads configuration from defaults, `hookline.toml`, and environment
    /// overrides, then validates it.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Like [`Config::load`] with a different configuration file. A missing
    /// file is not an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::raw().only(&["WEBHOOK_SECRET"]).map(|_| "shared_secret".into()))
            .merge(Env::raw().only(&["RUST_LOG"]))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Converts to the delivery engine's configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_timeout: Duration::from_millis(self.lease_timeout_ms),
            handler_timeout: Duration::from_millis(self.handler_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            retry_policy: self.to_retry_policy(),
        }
    }

    /// Converts to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            jitter_factor: self.jitter_factor,
        }
    }

    /// Builds the signature verifier for intake.
    pub fn signature_verifier(&self) -> SignatureVerifier {
        let verifier = SignatureVerifier::new(self.shared_secret.as_bytes(), self.signing_scheme);
        match self.replay_window_seconds {
            Some(seconds) => verifier.with_replay_window(Duration::from_secs(seconds)),
            None => verifier,
        }
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parses server socket address from host and port configuration.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("invalid server address")
    }

    /// Validates configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.shared_secret.trim().is_empty() {
            anyhow::bail!("shared_secret must be set (WEBHOOK_SECRET or HOOKLINE_SHARED_SECRET)");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            anyhow::bail!("jitter_factor must be between 0.0 and 1.0");
        }

        if self.lease_timeout_ms <= self.handler_timeout_ms {
            anyhow::bail!("lease_timeout_ms must be greater than handler_timeout_ms");
        }

        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            anyhow::bail!("base_retry_delay_ms cannot exceed max_retry_delay_ms");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.admin_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            anyhow::bail!("admin_token must not be empty when set");
        }

        if self.handler_command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            anyhow::bail!("handler_command must not be empty when set");
        }

        self.to_delivery_config().validate().context("invalid delivery configuration")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            signing_scheme: SigningScheme::Body,
            replay_window_seconds: None,
            max_attempts: 5,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
            jitter_factor: 0.1,
            lease_timeout_ms: 60_000,
            handler_timeout_ms: 30_000,
            worker_count: 4,
            poll_interval_ms: 1_000,
            sweep_interval_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            handler_command: None,
            database_url: "sqlite://hookline.db".to_string(),
            database_max_connections: 8,
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            admin_token: None,
            rust_log: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config { shared_secret: "s3cr3t".into(), ..Config::default() }
    }

    #[test]
    fn defaults_need_only_a_secret() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn invalid_config_validation_fails() {
        let cases: Vec<(&str, Config)> = vec![
            ("blank secret", Config { shared_secret: "  ".into(), ..valid() }),
            ("no workers", Config { worker_count: 0, ..valid() }),
            ("no attempts", Config { max_attempts: 0, ..valid() }),
            ("jitter above 1", Config { jitter_factor: 1.5, ..valid() }),
            ("negative jitter", Config { jitter_factor: -0.1, ..valid() }),
            ("lease equals handler timeout", Config {
                lease_timeout_ms: 30_000,
                handler_timeout_ms: 30_000,
                ..valid()
            }),
            ("base above max", Config {
                base_retry_delay_ms: 10_000,
                max_retry_delay_ms: 1_000,
                ..valid()
            }),
            ("zero poll", Config { poll_interval_ms: 0, ..valid() }),
            ("empty admin token", Config { admin_token: Some(String::new()), ..valid() }),
        ];

        for (name, config) in cases {
            assert!(config.validate().is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn conversions_carry_every_delivery_setting() {
        let config = Config {
            worker_count: 7,
            max_attempts: 3,
            base_retry_delay_ms: 250,
            max_retry_delay_ms: 4_000,
            jitter_factor: 0.0,
            lease_timeout_ms: 9_000,
            handler_timeout_ms: 2_000,
            ..valid()
        };

        let delivery = config.to_delivery_config();
        assert_eq!(delivery.worker_count, 7);
        assert_eq!(delivery.lease_timeout, Duration::from_secs(9));
        assert_eq!(delivery.handler_timeout, Duration::from_secs(2));
        assert_eq!(delivery.retry_policy.max_attempts, 3);
        assert_eq!(delivery.retry_policy.base_delay, Duration::from_millis(250));
        assert_eq!(delivery.retry_policy.max_delay, Duration::from_secs(4));
    }

    #[test]
    fn socket_address_parsing() {
        let config = Config { host: "127.0.0.1".into(), port: 9000, ..valid() };

        let addr = config.parse_server_addr().expect("Should parse socket address");

        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = Config { admin_token: Some("op-token".into()), ..valid() };
        let debug = format!("{config:?}");

        assert!(!debug.contains("s3cr3t"));
        assert!(!debug.contains("op-token"));
    }
}
