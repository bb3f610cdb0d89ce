//! Well-known names and default values.

/// Key layout used by state store backends.
pub mod keys {
    /// Prefix for sandbox record keys.
    pub const SANDBOX_PREFIX: &str = "sandbox";
    /// Suffix appended to a sandbox key to form its transition descriptor key.
    pub const TRANSITION_SUFFIX: &str = "transition";
    /// Prefix for distributed lock keys.
    pub const LOCK_PREFIX: &str = "lock";
}

/// Default durations, in milliseconds.
pub mod defaults {
    pub const LOCK_TTL_MS: u64 = 10_000;
    pub const LOCK_RETRY_INTERVAL_MS: u64 = 20;
    pub const LOCK_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

    pub const TRANSITION_TTL_MS: u64 = 10 * 60 * 1000;
    pub const TRANSITION_RESULT_TTL_MS: u64 = 30_000;
    pub const TRANSITION_POLL_INTERVAL_MS: u64 = 100;
    pub const TRANSITION_WAIT_TIMEOUT_MS: u64 = 10 * 60 * 1000;

    pub const CATALOG_ENTRY_TTL_MS: u64 = 24 * 60 * 60 * 1000;

    /// Concurrent inbound connections per sandbox when no tier limit applies.
    pub const MAX_CONNECTIONS_PER_SANDBOX: usize = 1024;
}

/// Feature flag names.
pub mod flags {
    /// Gates resuming a paused sandbox when proxy traffic arrives for it.
    pub const SANDBOX_AUTO_RESUME: &str = "sandbox-auto-resume";
}

/// Tag given to a snapshot build when the caller names none.
pub const DEFAULT_TAG: &str = "default";
