//! Feature flag source.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Boolean feature flags, evaluated per call.
pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Flags held in memory. Unknown flags are off.
#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    flags: RwLock<HashMap<String, bool>>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, flag: impl Into<String>, enabled: bool) -> Self {
        self.set(flag, enabled);
        self
    }

    pub fn set(&self, flag: impl Into<String>, enabled: bool) {
        self.flags.write().insert(flag.into(), enabled);
    }
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled(&self, flag: &str) -> bool {
        self.flags.read().get(flag).copied().unwrap_or(false)
    }
}
