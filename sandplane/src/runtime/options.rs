//! Control plane configuration.
//!
//! Options are plain serde structs with defaults for every field, so a JSON
//! config file only needs to name what it changes:
//!
//! ```json
//! {
//!   "store": { "kind": "sqlite" },
//!   "lock": { "acquire_timeout_ms": 2000 },
//!   "proxy": { "auto_resume": true }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sandplane_shared::constants::defaults;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides [`SandplaneOptions::home_dir`].
pub const HOME_ENV: &str = "SANDPLANE_HOME";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandplaneOptions {
    /// Root directory for the database and log files. Must be absolute.
    pub home_dir: PathBuf,
    pub store: StoreBackend,
    pub lock: LockOptions,
    pub transition: TransitionOptions,
    pub proxy: ProxyOptions,
    pub logging: LoggingOptions,
}

impl Default for SandplaneOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            store: StoreBackend::default(),
            lock: LockOptions::default(),
            transition: TransitionOptions::default(),
            proxy: ProxyOptions::default(),
            logging: LoggingOptions::default(),
        }
    }
}

impl SandplaneOptions {
    /// Load options from a JSON file, applying the `SANDPLANE_HOME` override.
    pub fn from_file(path: &Path) -> SandplaneResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandplaneError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut options: Self = serde_json::from_str(&raw).map_err(|e| {
            SandplaneError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        if let Some(home) = std::env::var_os(HOME_ENV) {
            options.home_dir = PathBuf::from(home);
        }

        options.validate()?;
        Ok(options)
    }

    /// Reject configurations that would make waits or locks unbounded.
    pub fn validate(&self) -> SandplaneResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(SandplaneError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }

        let durations = [
            ("lock.ttl_ms", self.lock.ttl),
            ("lock.retry_interval_ms", self.lock.retry_interval),
            ("lock.acquire_timeout_ms", self.lock.acquire_timeout),
            ("transition.ttl_ms", self.transition.ttl),
            ("transition.result_ttl_ms", self.transition.result_ttl),
            ("transition.poll_interval_ms", self.transition.poll_interval),
            ("transition.wait_timeout_ms", self.transition.wait_timeout),
            ("proxy.catalog_ttl_ms", self.proxy.catalog_ttl),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SandplaneError::Config(format!("{} must be non-zero", name)));
            }
        }

        if self.proxy.max_connections_per_sandbox == 0 {
            return Err(SandplaneError::Config(
                "proxy.max_connections_per_sandbox must be non-zero".into(),
            ));
        }

        Ok(())
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join("db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }
}

fn default_home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sandplane")
}

/// Where sandbox records and transition markers live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps. Only coordinates callers within one process.
    #[default]
    Memory,
    /// SQLite file shared by every API process on the host.
    Sqlite {
        /// Defaults to `<home>/db/state.db`.
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

/// Distributed lock timing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// How long a held lock survives if its holder disappears.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    #[serde(rename = "retry_interval_ms", with = "duration_ms")]
    pub retry_interval: Duration,
    /// Give up on obtaining the lock after this long.
    #[serde(rename = "acquire_timeout_ms", with = "duration_ms")]
    pub acquire_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(defaults::LOCK_TTL_MS),
            retry_interval: Duration::from_millis(defaults::LOCK_RETRY_INTERVAL_MS),
            acquire_timeout: Duration::from_millis(defaults::LOCK_ACQUIRE_TIMEOUT_MS),
        }
    }
}

/// Transition descriptor and result timing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionOptions {
    /// Lifetime of an in-flight descriptor if nobody finalizes it.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// How long a published result stays readable for late waiters.
    #[serde(rename = "result_ttl_ms", with = "duration_ms")]
    pub result_ttl: Duration,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Upper bound on a single wait for another caller's transition.
    #[serde(rename = "wait_timeout_ms", with = "duration_ms")]
    pub wait_timeout: Duration,
}

impl Default for TransitionOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(defaults::TRANSITION_TTL_MS),
            result_ttl: Duration::from_millis(defaults::TRANSITION_RESULT_TTL_MS),
            poll_interval: Duration::from_millis(defaults::TRANSITION_POLL_INTERVAL_MS),
            wait_timeout: Duration::from_millis(defaults::TRANSITION_WAIT_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    pub max_connections_per_sandbox: usize,
    /// Default value of the auto-resume flag when no flag source overrides it.
    pub auto_resume: bool,
    #[serde(rename = "catalog_ttl_ms", with = "duration_ms")]
    pub catalog_ttl: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            max_connections_per_sandbox: defaults::MAX_CONNECTIONS_PER_SANDBOX,
            auto_resume: false,
            catalog_ttl: Duration::from_millis(defaults::CATALOG_ENTRY_TTL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Install the file logger when the control plane opens.
    pub enabled: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self { enabled: true }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let mut options = SandplaneOptions::default();
        options.home_dir = PathBuf::from("/var/lib/sandplane");
        options.validate().unwrap();
        assert_eq!(options.store, StoreBackend::Memory);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options: SandplaneOptions = serde_json::from_str(
            r#"{
                "home_dir": "/srv/sandplane",
                "store": { "kind": "sqlite" },
                "lock": { "acquire_timeout_ms": 250 },
                "proxy": { "auto_resume": true }
            }"#,
        )
        .unwrap();

        assert_eq!(options.store, StoreBackend::Sqlite { path: None });
        assert_eq!(options.lock.acquire_timeout, Duration::from_millis(250));
        assert_eq!(
            options.lock.ttl,
            Duration::from_millis(defaults::LOCK_TTL_MS)
        );
        assert!(options.proxy.auto_resume);
        assert!(options.logging.enabled);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut options = SandplaneOptions::default();
        options.home_dir = PathBuf::from("/srv/sandplane");
        options.transition.poll_interval = Duration::ZERO;

        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("transition.poll_interval_ms"));
    }

    #[test]
    fn test_relative_home_rejected() {
        let mut options = SandplaneOptions::default();
        options.home_dir = PathBuf::from("relative/home");
        assert!(matches!(
            options.validate(),
            Err(SandplaneError::Config(_))
        ));
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sandplane.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = SandplaneOptions::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
