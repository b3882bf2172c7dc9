//! Durable queue of coverage sub-sessions awaiting delivery.
//!
//! Fence records are grouped into [`CoverageSubSession`]s, one per
//! ping-protocol authentication period, and spooled to disk so that a
//! crash or process exit never loses measured data. All mutation goes
//! through a single-writer worker task ([`worker::StoreWorker`]); the
//! rest of the engine talks to it through [`worker::StoreHandle`].

pub mod spool;
pub mod worker;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fence::Fence;

pub use spool::{CleanupSummary, SpoolStore};
pub use worker::{StoreHandle, StoreWorker};

/// How the application came back to life before a backlog delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Process launched fresh; a previous instance may have crashed or
    /// been killed mid-measurement.
    Cold,
    /// Application resumed to the foreground within the same process.
    Warm,
}

/// One measurement sub-session and the fences recorded during it.
///
/// `test_uuid` stays unset until session initiation first succeeds,
/// which supports starting a measurement offline. `anchor_at` is the
/// zero point for delivery offsets; fences recorded before the network
/// came up carry negative offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSubSession {
    /// Local spool key, assigned at creation.
    pub local_id: Uuid,
    /// Server-assigned measurement identifier, once granted.
    pub test_uuid: Option<String>,
    /// `test_uuid` of the preceding sub-session in a renewal chain.
    pub loop_uuid: Option<String>,
    /// When measurement into this sub-session began.
    pub started_at: DateTime<Utc>,
    /// When the identifier was confirmed; delivery offset zero point.
    pub anchor_at: Option<DateTime<Utc>>,
    /// When the sub-session ended, or `None` while measuring.
    pub finalized_at: Option<DateTime<Utc>>,
    /// Fences recorded under this sub-session, in persistence order.
    pub fences: Vec<Fence>,
}

impl CoverageSubSession {
    /// Begin a fresh sub-session.
    pub fn begin(at: DateTime<Utc>, loop_uuid: Option<String>) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            test_uuid: None,
            loop_uuid,
            started_at: at,
            anchor_at: None,
            finalized_at: None,
            fences: Vec::new(),
        }
    }

    /// Whether the sub-session has ended.
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Entry time of the oldest fence, used for resend ordering.
    pub fn earliest_fence_at(&self) -> Option<DateTime<Utc>> {
        self.fences.iter().map(|f| f.entered_at).min()
    }
}

/// Error type for the durable queue.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Spool directory or record file I/O failed.
    #[error("spool I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be encoded for the spool.
    #[error("spool record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A mutation needs a current sub-session but none is active.
    #[error("no sub-session is currently active")]
    NoCurrentSubSession,

    /// The store worker task has stopped.
    #[error("store worker has shut down")]
    WorkerGone,
}
