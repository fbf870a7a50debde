//! Engine configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. Optional TOML file (`[sync]` and `[server]` tables)
//! 3. `LOGOS_SYNC__<TABLE>__<KEY>` environment variables
//!
//! All durations are expressed in milliseconds.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::server::ServerConfig;

/// Who may hard-delete an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Only the current lease holder.
    HolderOnly,
    /// The lease holder, or the creator while nobody else holds a valid lease.
    HolderOrCreator,
}

impl Default for DeletePolicy {
    fn default() -> Self {
        DeletePolicy::HolderOrCreator
    }
}

/// Lease rules a store enforces for every client.
///
/// Owned by the store (or the server in front of it). Clients never send
/// them; each granted [`crate::object::LockLease`] carries its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LeasePolicy {
    /// Lock expiry window (`LEASE_TTL`).
    pub ttl_ms: u64,
    pub delete_policy: DeletePolicy,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl LeasePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_ms == 0 {
            return Err(ConfigError::Invalid("lease ttl_ms must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for retried store calls.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    /// Retries after the first attempt. 0 disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        let ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1_000
}

/// Client-side engine settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Lease TTL the store is expected to grant. Only paces the local
    /// expiry sweep; the TTL stamped on each lease is what counts.
    pub lease_ttl_ms: u64,
    /// Coalescing window for outgoing object writes (`EDIT_FLUSH_THROTTLE_MS`).
    pub edit_flush_throttle_ms: u64,
    /// Coalescing window for presence writes (`PRESENCE_FLUSH_THROTTLE_MS`).
    pub presence_flush_throttle_ms: u64,
    /// Presence records older than this are reclaimed (`PRESENCE_TTL`).
    pub presence_ttl_ms: u64,
    /// Local lease-expiry sweep period (`EXPIRY_SWEEP_INTERVAL_MS`).
    /// Defaults to a sixth of the lease TTL.
    pub expiry_sweep_interval_ms: Option<u64>,
    /// Presence GC period. Defaults to half the presence TTL.
    pub presence_gc_interval_ms: Option<u64>,
    pub acquire_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub flush_retry: BackoffPolicy,
    /// Renew a held lease once it is half-way to expiry while edits continue.
    pub renew_on_activity: bool,
    /// Capacity of event channels handed to subscribers.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 30_000,
            edit_flush_throttle_ms: 150,
            presence_flush_throttle_ms: 33, // 30fps
            presence_ttl_ms: 30_000,
            expiry_sweep_interval_ms: None,
            presence_gc_interval_ms: None,
            acquire_timeout_ms: 2_000,
            flush_timeout_ms: 2_000,
            flush_retry: BackoffPolicy::default(),
            renew_on_activity: true,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn edit_flush_throttle(&self) -> Duration {
        Duration::from_millis(self.edit_flush_throttle_ms)
    }

    pub fn presence_flush_throttle(&self) -> Duration {
        Duration::from_millis(self.presence_flush_throttle_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_millis(
            self.expiry_sweep_interval_ms
                .unwrap_or(self.lease_ttl_ms / 6)
                .max(1),
        )
    }

    pub fn presence_gc_interval(&self) -> Duration {
        Duration::from_millis(
            self.presence_gc_interval_ms
                .unwrap_or(self.presence_ttl_ms / 2)
                .max(1),
        )
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("lease_ttl_ms", self.lease_ttl_ms),
            ("edit_flush_throttle_ms", self.edit_flush_throttle_ms),
            ("presence_flush_throttle_ms", self.presence_flush_throttle_ms),
            ("presence_ttl_ms", self.presence_ttl_ms),
            ("acquire_timeout_ms", self.acquire_timeout_ms),
            ("flush_timeout_ms", self.flush_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.expiry_sweep_interval() >= self.lease_ttl() {
            return Err(ConfigError::Invalid(format!(
                "expiry sweep interval ({}ms) must be shorter than the lease TTL ({}ms)",
                self.expiry_sweep_interval().as_millis(),
                self.lease_ttl_ms
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Everything a process reads at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sync: SyncConfig,
    pub server: ServerConfig,
}

impl Settings {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("LOGOS_SYNC")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.sync.validate()?;
        settings.server.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.expiry_sweep_interval(), Duration::from_millis(5_000));
        assert_eq!(config.presence_gc_interval(), Duration::from_millis(15_000));
        LeasePolicy::default().validate().unwrap();
    }

    #[test]
    fn test_sweep_follows_short_ttl() {
        let config = SyncConfig { lease_ttl_ms: 600, ..SyncConfig::default() };
        assert_eq!(config.expiry_sweep_interval(), Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn test_sweep_must_be_shorter_than_ttl() {
        let config = SyncConfig {
            lease_ttl_ms: 1_000,
            expiry_sweep_interval_ms: Some(1_000),
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_throttle_rejected() {
        let config = SyncConfig { edit_flush_throttle_ms: 0, ..SyncConfig::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("edit_flush_throttle_ms"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy { max_retries: 5, base_delay_ms: 50, max_delay_ms: 300 };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(300));
        assert_eq!(policy.delay(40), Duration::from_millis(300));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[sync]
lease_ttl_ms = 12000
edit_flush_throttle_ms = 80

[sync.flush_retry]
max_retries = 7

[server]
bind_addr = "0.0.0.0:7000"

[server.lease]
ttl_ms = 9000
delete_policy = "holder_only"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let settings = Settings::load(Some(&path)).unwrap();

        assert_eq!(settings.sync.lease_ttl_ms, 12_000);
        assert_eq!(settings.sync.edit_flush_throttle_ms, 80);
        assert_eq!(settings.sync.flush_retry.max_retries, 7);
        assert_eq!(settings.sync.flush_retry.base_delay_ms, 50);
        assert_eq!(settings.sync.presence_flush_throttle_ms, 33);
        assert_eq!(settings.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(settings.server.lease.ttl(), Duration::from_millis(9_000));
        assert_eq!(settings.server.lease.delete_policy, DeletePolicy::HolderOnly);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[sync]\nlease_ttl_ms = 0").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert!(Settings::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_server_section() {
        for body in ["[server]\nbroadcast_capacity = 0", "[server.lease]\nttl_ms = 0"] {
            let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            writeln!(file, "{body}").unwrap();
            let path = file.path().to_str().unwrap().to_string();
            assert!(
                matches!(Settings::load(Some(&path)), Err(ConfigError::Invalid(_))),
                "accepted {body:?}"
            );
        }
    }
}
