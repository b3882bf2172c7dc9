//! Measurement session negotiation and lifetime management.
//!
//! A measurement runs against a series of server-granted sub-sessions.
//! The [`SessionProvider`] trait abstracts the control-server
//! negotiation; the [`SessionCoordinator`] owns the current grant,
//! rotates sub-sessions when grants expire or fail, and keeps the
//! durable store's identity fields in step.

mod coordinator;
mod window;

pub use coordinator::SessionCoordinator;
pub use window::{SessionWindows, WindowVerdict};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::ping::IpVersion;

/// Parameters for a session request.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Identifier of the sub-session this one continues, if any.
    /// Lets the control server chain the series together.
    pub previous_test_uuid: Option<String>,
}

/// A granted measurement session.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    /// Server-assigned identifier for the sub-session.
    pub test_uuid: String,

    /// Ping server coordinates.
    pub ping_host: String,
    pub ping_port: u16,

    /// Base64-encoded ping token.
    pub ping_token: String,

    /// IP version the ping server expects, if the server cares.
    pub ip_version: Option<IpVersion>,

    /// How long this grant may be used before renewal. Zero means
    /// unlimited.
    pub max_sub_session: Duration,

    /// Total measurement time across all grants. Zero means
    /// unlimited.
    pub max_total: Duration,
}

/// Session negotiation failed.
#[derive(Debug, Clone, Error)]
#[error("session initiation failed: {reason}")]
pub struct SessionInitError {
    reason: String,
}

impl SessionInitError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Negotiates measurement sessions with the control server.
pub trait SessionProvider: Send + Sync {
    fn request_session(
        &self,
        request: SessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SessionGrant, SessionInitError>> + Send + '_>>;
}
