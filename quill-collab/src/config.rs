//! Protocol configuration.
//!
//! Durations are expressed in milliseconds so the struct deserializes from
//! flat sources (environment, JSON settings blobs).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How local edits of a field are turned into `field_updated` broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmissionPolicy {
    /// Send every change as it happens.
    Immediate,
    /// Single-line fields: send when the length moves by more than
    /// `min_len_delta` characters, or when content changes at equal length.
    Threshold { min_len_delta: usize },
    /// Multi-line fields: send the latest value once edits pause for
    /// `quiet_ms`.
    Windowed { quiet_ms: u64 },
}

impl EmissionPolicy {
    pub fn threshold() -> Self {
        EmissionPolicy::Threshold { min_len_delta: 2 }
    }

    pub fn windowed() -> Self {
        EmissionPolicy::Windowed { quiet_ms: 500 }
    }
}

/// Whether continued typing extends a held lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePolicy {
    /// A lease expires on schedule regardless of activity.
    #[default]
    Fixed,
    /// Each local broadcast on a held field re-issues the lease once less
    /// than half of its TTL remains.
    RenewOnActivity,
}

/// Session-level protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Channel topic prefix
    pub topic_prefix: String,
    /// Lease time-to-live
    pub lock_ttl_ms: u64,
    pub lease_policy: LeasePolicy,
    /// Presence coalescing window
    pub presence_debounce_ms: u64,
    /// Presence re-announcement interval
    pub presence_heartbeat_ms: u64,
    /// Policy for fields without an explicit entry
    pub default_policy: EmissionPolicy,
    pub field_policies: HashMap<String, EmissionPolicy>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "article".to_string(),
            lock_ttl_ms: 30_000,
            lease_policy: LeasePolicy::Fixed,
            presence_debounce_ms: 300,
            presence_heartbeat_ms: 30_000,
            default_policy: EmissionPolicy::threshold(),
            field_policies: HashMap::new(),
        }
    }
}

impl CollabConfig {
    /// Set the emission policy of one field.
    pub fn with_policy(mut self, field: impl Into<String>, policy: EmissionPolicy) -> Self {
        self.field_policies.insert(field.into(), policy);
        self
    }

    pub fn policy_for(&self, field: &str) -> EmissionPolicy {
        self.field_policies
            .get(field)
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn presence_debounce(&self) -> Duration {
        Duration::from_millis(self.presence_debounce_ms)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms)
    }
}
