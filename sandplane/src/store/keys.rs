//! Key naming for records, markers and locks.

use crate::runtime::types::SandboxKey;
use sandplane_shared::constants::keys::{LOCK_PREFIX, SANDBOX_PREFIX, TRANSITION_SUFFIX};

pub fn sandbox_key(key: &SandboxKey) -> String {
    format!("{}:{}:{}", SANDBOX_PREFIX, key.team_id, key.sandbox_id)
}

pub fn transition_key(key: &SandboxKey) -> String {
    format!("{}:{}", sandbox_key(key), TRANSITION_SUFFIX)
}

pub fn transition_result_key(key: &SandboxKey, transition_id: &str) -> String {
    format!("{}:{}", transition_key(key), transition_id)
}

pub fn lock_key(resource: &str) -> String {
    format!("{}:{}", LOCK_PREFIX, resource)
}
