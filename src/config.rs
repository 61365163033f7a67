//! Runtime configuration for a mesh instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`Mesh`](crate::runtime::Mesh) runtime.
///
/// Heartbeat cadence and the grace multiple are configuration values, not
/// protocol constants — workers learn the cadence from the runtime that
/// created them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Interval at which workers emit liveness signals. Default: 5s.
    pub heartbeat_interval: Duration,
    /// A connection is considered dead after `heartbeat_interval *
    /// heartbeat_grace` without traffic. Default: 3.
    pub heartbeat_grace: u32,
    /// Cadence of the pending-call expiry sweep. Default: 100ms.
    pub sweep_interval: Duration,
    /// Capacity of each worker's inbound frame channel. Default: 256.
    pub channel_capacity: usize,
    /// Call timeout applied when a caller does not pass one. Default: 30s.
    pub default_call_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_grace: 3,
            sweep_interval: Duration::from_millis(100),
            channel_capacity: 256,
            default_call_timeout: Duration::from_secs(30),
        }
    }
}

impl MeshConfig {
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_grace(mut self, grace: u32) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn default_call_timeout(mut self, timeout: Duration) -> Self {
        self.default_call_timeout = timeout;
        self
    }

    /// The window after which a silent connection is marked disconnected.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_grace.max(1)
    }
}
