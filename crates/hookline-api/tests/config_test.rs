//! Configuration loading from file and environment.
//!
//! These tests mutate process environment, so they run serially.

use std::{collections::HashMap, env, fs, time::Duration};

use anyhow::Result;
use hookline_api::{Config, SigningScheme};
use serial_test::serial;

/// Sets variables for one test and restores them on drop.
struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    fn new() -> Self {
        let mut guard = Self { originals: HashMap::new() };
        // Start from a clean slate regardless of the host environment
        for key in ["WEBHOOK_SECRET", "RUST_LOG"] {
            guard.remove_var(key);
        }
        let inherited: Vec<String> =
            env::vars().map(|(k, _)| k).filter(|k| k.starts_with("HOOKLINE_")).collect();
        for key in inherited {
            guard.remove_var(&key);
        }
        guard
    }

    fn remember(&mut self, key: &str) {
        self.originals.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
    }

    fn set_var(&mut self, key: &str, value: &str) {
        self.remember(key);
        env::set_var(key, value);
    }

    fn remove_var(&mut self, key: &str) {
        self.remember(key);
        env::remove_var(key);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in &self.originals {
            match original {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
    }
}

#[test]
#[serial]
fn missing_secret_fails_to_load() {
    let _guard = EnvGuard::new();
    let dir = tempfile::tempdir().unwrap();

    let result = Config::load_from(dir.path().join("absent.toml"));

    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("shared_secret"), "{message}");
}

#[test]
#[serial]
fn webhook_secret_variable_sets_shared_secret() -> Result<()> {
    let mut guard = EnvGuard::new();
    guard.set_var("WEBHOOK_SECRET", "s3cr3t");
    let dir = tempfile::tempdir()?;

    let config = Config::load_from(dir.path().join("absent.toml"))?;

    assert_eq!(config.shared_secret, "s3cr3t");
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.worker_count, 4);
    assert_eq!(config.signing_scheme, SigningScheme::Body);
    assert!(config.admin_token.is_none());
    Ok(())
}

#[test]
#[serial]
fn file_then_environment_override_defaults() -> Result<()> {
    let mut guard = EnvGuard::new();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("hookline.toml");
    fs::write(
        &path,
        r#"
shared_secret = "from-file"
signing_scheme = "timestamped"
replay_window_seconds = 300
max_attempts = 3
worker_count = 2
admin_token = "op-token"
handler_command = "/usr/local/bin/consume --fast"
"#,
    )?;
    guard.set_var("HOOKLINE_WORKER_COUNT", "9");
    guard.set_var("HOOKLINE_BASE_RETRY_DELAY_MS", "250");
    guard.set_var("RUST_LOG", "debug,hookline=trace");

    let config = Config::load_from(&path)?;

    assert_eq!(config.shared_secret, "from-file");
    assert_eq!(config.signing_scheme, SigningScheme::Timestamped);
    assert_eq!(config.replay_window_seconds, Some(300));
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.worker_count, 9);
    assert_eq!(config.admin_token.as_deref(), Some("op-token"));
    assert_eq!(config.handler_command.as_deref(), Some("/usr/local/bin/consume --fast"));
    assert_eq!(config.rust_log, "debug,hookline=trace");
    assert_eq!(config.to_retry_policy().base_delay, Duration::from_millis(250));
    Ok(())
}

#[test]
#[serial]
fn prefixed_secret_wins_over_bare_variable() -> Result<()> {
    let mut guard = EnvGuard::new();
    guard.set_var("WEBHOOK_SECRET", "bare");
    guard.set_var("HOOKLINE_SHARED_SECRET", "prefixed");
    let dir = tempfile::tempdir()?;

    let config = Config::load_from(dir.path().join("absent.toml"))?;

    assert_eq!(config.shared_secret, "prefixed");
    Ok(())
}

#[test]
#[serial]
fn invalid_values_from_environment_are_rejected() {
    let mut guard = EnvGuard::new();
    guard.set_var("WEBHOOK_SECRET", "s3cr3t");
    guard.set_var("HOOKLINE_LEASE_TIMEOUT_MS", "1000");
    guard.set_var("HOOKLINE_HANDLER_TIMEOUT_MS", "5000");
    let dir = tempfile::tempdir().unwrap();

    assert!(Config::load_from(dir.path().join("absent.toml")).is_err());
}
