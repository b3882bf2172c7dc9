//! Lightweight UDP round-trip probing.
//!
//! A probe is a single datagram carrying a 4-byte tag, a sequence
//! number, and the session token; the server echoes the sequence back
//! with a success or error tag. The [`PingSession`] actor owns the
//! socket and the pending-probe table, and [`PingClient`] is the
//! cheap cloneable handle tasks use to run probes.

mod error;
mod session;
pub mod wire;

pub use error::ProbeError;
pub use session::{
    IpVersion, PingClient, PingEndpoint, PingSession, PingSessionConfig, SessionSource,
};
