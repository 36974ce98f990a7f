use std::time::Duration;

use kinject_cipher::Key;
use serde::{Deserialize, Serialize};

/// How thunks are delivered to the target thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Queue a user callback and wait for the thread to become alertable.
    Queue,

    /// Queue a kernel carrier that re-queues the user callback from the
    /// target thread and then briefly waits alertably, so the callback runs
    /// even on threads that never wait on their own.
    #[default]
    Force,
}

/// Engine configuration.
///
/// Every field has a default, so a partial document deserializes into a
/// complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delivery flavor.
    pub delivery: DeliveryMode,

    /// Length of the alertable wait performed by [`DeliveryMode::Force`].
    pub alertable_delay: Duration,

    /// Requires the user-facing system libraries of both subsystems before
    /// injecting into translated processes.
    ///
    /// Older hosts load these libraries while the translation layer is still
    /// initializing, so a callback delivered earlier cannot be dispatched.
    pub legacy_translated_gating: bool,

    /// Key used to seal in-memory payloads at registration.
    pub payload_key: Option<Key>,

    /// Maximum number of mappings matched for one created process.
    pub max_mappings_per_process: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::default(),
            alertable_delay: Duration::from_millis(1),
            legacy_translated_gating: false,
            payload_key: None,
            max_mappings_per_process: 64,
        }
    }
}

impl EngineConfig {
    /// Sets the delivery flavor.
    pub fn with_delivery(self, delivery: DeliveryMode) -> Self {
        Self { delivery, ..self }
    }

    /// Sets the alertable wait of the force path.
    pub fn with_alertable_delay(self, alertable_delay: Duration) -> Self {
        Self {
            alertable_delay,
            ..self
        }
    }

    /// Enables the extended gating for translated processes.
    pub fn with_legacy_translated_gating(self, legacy_translated_gating: bool) -> Self {
        Self {
            legacy_translated_gating,
            ..self
        }
    }

    /// Sets the payload key.
    pub fn with_payload_key(self, key: Key) -> Self {
        Self {
            payload_key: Some(key),
            ..self
        }
    }

    /// Sets the per-process mapping limit.
    pub fn with_max_mappings_per_process(self, max_mappings_per_process: usize) -> Self {
        Self {
            max_mappings_per_process,
            ..self
        }
    }
}
