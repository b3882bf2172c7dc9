//! NetFence - Mobile network coverage measurement engine
//!
//! This library measures network coverage along a device's path: it
//! segments movement into geographic fences, samples round-trip
//! latency against a measurement server inside each fence, and
//! delivers the finished fences reliably through an on-disk spool.
//!
//! # High-Level API
//!
//! The [`service`] module provides the facade most hosts need:
//!
//! ```ignore
//! use netfence::config::CoverageConfig;
//! use netfence::service::{ActivityLease, CoverageService};
//! use netfence::store::StartMode;
//!
//! let service = CoverageService::new(CoverageConfig::default(), provider, sender)?;
//!
//! // Recover anything earlier runs left behind.
//! service.deliver_backlog(StartMode::Cold).await;
//!
//! // Run a measurement until stopped.
//! let handle = service
//!     .start_measurement(locations, radio, ActivityLease::none())
//!     .await?;
//! handle.stop().await;
//! ```

pub mod config;
pub mod event;
pub mod fence;
pub mod gate;
pub mod geo;
pub mod logging;
pub mod ping;
pub mod resend;
pub mod service;
pub mod session;
pub mod store;

/// Version of the NetFence library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
