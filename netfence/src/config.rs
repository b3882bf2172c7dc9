//! Configuration for the coverage measurement engine.
//!
//! All tunables live in [`CoverageConfig`]. Component tasks derive
//! their own smaller configs from it at wiring time, so individual
//! modules stay testable with hand-built settings.

use std::path::PathBuf;
use std::time::Duration;

/// Default fence radius in metres. Leaving this circle around the
/// fence's first location closes the fence and opens a new one.
pub const DEFAULT_FENCE_RADIUS_M: f64 = 20.0;

/// Default minimum horizontal accuracy in metres. Location samples
/// reporting a larger (worse) accuracy open an inaccurate window.
pub const DEFAULT_MIN_LOCATION_ACCURACY_M: f64 = 10.0;

/// Default cadence for latency probes.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Default per-probe response timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default maximum age for queued fences awaiting delivery.
pub const DEFAULT_MAX_RESEND_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct CoverageConfig {
    /// Radius of a geographic fence in metres.
    pub fence_radius_m: f64,

    /// Worst acceptable horizontal accuracy for a location sample, in
    /// metres. Samples above this threshold suppress probe-to-fence
    /// assignment until an accurate sample arrives.
    pub min_location_accuracy_m: f64,

    /// Interval between latency probes.
    pub ping_interval: Duration,

    /// How long a probe waits for its response before reporting a
    /// timeout. Also the grace period a closed fence is held in memory
    /// so late probe outcomes can still be assigned to it.
    pub probe_timeout: Duration,

    /// Queued fences older than this are dropped during resend cleanup.
    pub max_resend_age: Duration,

    /// Directory for the on-disk sub-session spool.
    pub spool_dir: PathBuf,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            fence_radius_m: DEFAULT_FENCE_RADIUS_M,
            min_location_accuracy_m: DEFAULT_MIN_LOCATION_ACCURACY_M,
            ping_interval: DEFAULT_PING_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            max_resend_age: DEFAULT_MAX_RESEND_AGE,
            spool_dir: PathBuf::from("coverage-spool"),
        }
    }
}

/// Error type for configuration validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Fence radius must be a positive number of metres.
    #[error("fence radius must be positive, got {0}")]
    InvalidFenceRadius(f64),

    /// Accuracy threshold must be a positive number of metres.
    #[error("minimum location accuracy must be positive, got {0}")]
    InvalidLocationAccuracy(f64),

    /// A zero ping interval would spin the probe driver.
    #[error("ping interval must be non-zero")]
    ZeroPingInterval,

    /// A zero probe timeout would fail every probe instantly.
    #[error("probe timeout must be non-zero")]
    ZeroProbeTimeout,
}

impl CoverageConfig {
    /// Validate the configuration before the engine starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fence_radius_m.is_finite() || self.fence_radius_m <= 0.0 {
            return Err(ConfigError::InvalidFenceRadius(self.fence_radius_m));
        }
        if !self.min_location_accuracy_m.is_finite() || self.min_location_accuracy_m <= 0.0 {
            return Err(ConfigError::InvalidLocationAccuracy(
                self.min_location_accuracy_m,
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ZeroPingInterval);
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::ZeroProbeTimeout);
        }
        Ok(())
    }
}
