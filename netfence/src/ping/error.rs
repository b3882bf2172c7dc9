use thiserror::Error;

/// Why a single probe produced no round-trip interval.
///
/// None of these are fatal to the measurement: the probe is recorded
/// as an error sample and the schedule carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No response arrived within the probe timeout.
    #[error("probe timed out")]
    TimedOut,

    /// The server refused the probe; the endpoint was torn down and
    /// the next probe will negotiate a fresh session.
    #[error("server rejected probe, session needs reinitialization")]
    NeedsReinitialization,

    /// The datagram could not be sent.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Negotiating or opening the endpoint failed, so the probe was
    /// never sent.
    #[error("session initiation failed: {0}")]
    Initiation(String),

    /// The probing actor is gone.
    #[error("ping session closed")]
    SessionClosed,
}
