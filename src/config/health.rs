//! Health and lifecycle configuration

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Health endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether the health/metrics HTTP server runs
    pub enabled: bool,
    /// HTTP bind address for liveness, readiness and metrics
    pub bind: SocketAddr,
    /// Liveness fails above this many active workers
    pub max_workers: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([0, 0, 0, 0], 8086)),
            max_workers: 100,
        }
    }
}

/// Shutdown behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Time between withdrawing readiness and tearing down connections
    #[serde(with = "humantime_serde")]
    pub drain_window: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_window: Duration::from_secs(4 * 60),
        }
    }
}
