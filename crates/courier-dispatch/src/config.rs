//! Dispatcher settings and per-endpoint policy enums.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A frozen endpoint was mutated.
    #[error("endpoint '{endpoint}' is frozen and can no longer be modified")]
    Frozen { endpoint: String },

    #[error("endpoint '{endpoint}' registers action '{action}' more than once")]
    DuplicateAction { endpoint: String, action: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Whether messages of one session may be processed simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConcurrencyMode {
    /// One message at a time per instance, in arrival order.
    #[default]
    Single,
    /// Serialized like `Single`, but a call waiting on an outbound request
    /// gives up the instance lock until the reply arrives.
    Reentrant,
    /// Messages run concurrently; the next receive starts before invocation.
    Multiple,
}

impl ConcurrencyMode {
    pub fn is_concurrent(self) -> bool {
        matches!(self, Self::Multiple)
    }
}

/// Lifetime of the application instance bound to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceMode {
    /// A fresh instance per message.
    PerCall,
    /// One instance per session channel; per call on datagram channels.
    #[default]
    PerSession,
    /// One instance for the whole endpoint.
    Single,
}

/// Gate capacities. `None` leaves a gate unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThrottleSettings {
    pub max_concurrent_calls: Option<usize>,
    pub max_concurrent_sessions: Option<usize>,
    pub max_concurrent_instances: Option<usize>,
    /// Initial limit of the manually adjusted quota gate.
    pub dynamic_quota: Option<usize>,
}

impl ThrottleSettings {
    pub fn unbounded() -> Self {
        Self {
            max_concurrent_calls: None,
            max_concurrent_sessions: None,
            max_concurrent_instances: None,
            dynamic_quota: None,
        }
    }
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let calls = 16 * cpus;
        let sessions = 100 * cpus;
        Self {
            max_concurrent_calls: Some(calls),
            max_concurrent_sessions: Some(sessions),
            max_concurrent_instances: Some(calls + sessions),
            dynamic_quota: None,
        }
    }
}

/// Dispatcher-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    pub open_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Upper bound for throttle, quota and concurrency-lock waits.
    pub admission_timeout_ms: u64,
    /// Close a session after this long without inbound messages.
    pub idle_timeout_ms: Option<u64>,
    pub throttle: ThrottleSettings,
    /// Attach the error text to internal-service faults.
    pub include_exception_detail_in_faults: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            open_timeout_ms: 60_000,
            close_timeout_ms: 60_000,
            send_timeout_ms: 60_000,
            admission_timeout_ms: 60_000,
            idle_timeout_ms: None,
            throttle: ThrottleSettings::default(),
            include_exception_detail_in_faults: false,
        }
    }
}

impl DispatchSettings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}
