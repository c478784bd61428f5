//! Firewall core configuration

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{FirewallError, FirewallResult};

/// Runtime configuration of the firewall core.
///
/// Hot-swappable: the core keeps the active config behind an `ArcSwap` and
/// every decision path loads the current snapshot.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Master switch for the privacy filter. When off, every new
    /// connection is accepted with a "filter disabled" reason.
    pub filter_enabled: bool,

    /// Allow the driver to auto-apply verdicts to future packets of a
    /// decided flow without a userspace round-trip.
    pub permanent_verdicts: bool,

    /// Kill-switch: when false, `start` does not wire the driver at all.
    pub interception_enabled: bool,

    /// Endpoint of the local management API, fast-tracked when local.
    pub api_endpoint: Option<SocketAddr>,

    /// Depth of the bounded packet channel between driver and dispatcher.
    pub queue_depth: usize,

    /// Hard deadline for collaborator calls, in milliseconds.
    pub collaborator_deadline_ms: u64,

    /// How long shutdown waits for in-flight packet handlers, in milliseconds.
    pub shutdown_drain_ms: u64,

    /// Interval of the periodic stat log line, in seconds.
    pub stat_interval_secs: u64,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            filter_enabled: true,
            permanent_verdicts: true,
            interception_enabled: true,
            api_endpoint: None,
            queue_depth: 1000,
            collaborator_deadline_ms: 10_000,
            shutdown_drain_ms: 2000,
            stat_interval_secs: 10,
        }
    }
}

impl FirewallConfig {
    /// Collaborator deadline as a `Duration`.
    #[inline]
    pub fn collaborator_deadline(&self) -> Duration {
        Duration::from_millis(self.collaborator_deadline_ms)
    }

    /// Shutdown drain deadline as a `Duration`.
    #[inline]
    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }

    /// Stat logger interval as a `Duration`.
    #[inline]
    pub fn stat_interval(&self) -> Duration {
        Duration::from_secs(self.stat_interval_secs)
    }

    /// Validate values that would stall the datapath.
    pub fn validate(&self) -> FirewallResult<()> {
        if self.queue_depth == 0 {
            return Err(FirewallError::Config("queue_depth must be > 0".into()));
        }
        if self.collaborator_deadline_ms == 0 {
            return Err(FirewallError::Config(
                "collaborator_deadline_ms must be > 0".into(),
            ));
        }
        if self.stat_interval_secs == 0 {
            return Err(FirewallError::Config(
                "stat_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
