//! Redelivery of persisted fences to the result server.
//!
//! Every sub-session sits in the spool until its fences have been
//! accepted by the server. A delivery pass runs at measurement stop
//! and on cold starts; whatever it cannot deliver stays spooled for
//! the next pass, so the only way measured data disappears without
//! being sent is the age-based cleanup.

use std::cmp::Reverse;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fence::Fence;
use crate::store::{CleanupSummary, CoverageSubSession, StartMode, StoreHandle};

/// One fence as the result server wants to see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FencePayload {
    /// Fence entry time, microseconds since the Unix epoch.
    pub entered_at_us: i64,
    /// Fence start position.
    pub latitude: f64,
    pub longitude: f64,
    /// Mean round-trip time in whole milliseconds, if any probe
    /// succeeded inside the fence.
    pub avg_ping_ms: Option<u64>,
    /// Radio technology the fence is reported with.
    pub technology: Option<String>,
    /// Entry time relative to the sub-session anchor, milliseconds.
    /// Negative when the fence predates the anchor.
    pub offset_ms: i64,
    /// Dwell time in milliseconds, absent if the fence never closed.
    pub duration_ms: Option<u64>,
}

impl FencePayload {
    /// Flatten a fence for delivery, expressing its entry time
    /// relative to the sub-session anchor.
    pub fn from_fence(fence: &Fence, anchor: DateTime<Utc>) -> Self {
        Self {
            entered_at_us: fence.entered_at.timestamp_micros(),
            latitude: fence.start.latitude,
            longitude: fence.start.longitude,
            avg_ping_ms: fence
                .average_ping()
                .map(|avg| (avg.as_secs_f64() * 1000.0).round() as u64),
            technology: fence.significant_technology().map(str::to_string),
            offset_ms: fence
                .entered_at
                .signed_duration_since(anchor)
                .num_milliseconds(),
            duration_ms: fence.dwell().map(|d| d.num_milliseconds().max(0) as u64),
        }
    }
}

/// One sub-session's worth of fences, addressed by its server
/// identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryBatch {
    pub test_uuid: String,
    /// Zero-point the fences' `offset_ms` values are relative to.
    pub anchor_at: DateTime<Utc>,
    /// Fences in entry order.
    pub fences: Vec<FencePayload>,
}

/// The result server did not accept a batch.
#[derive(Debug, Clone, Error)]
#[error("delivery failed: {reason}")]
pub struct DeliveryError {
    reason: String,
}

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Ships fence batches to the result server.
pub trait ResultSender: Send + Sync {
    fn send_fences(
        &self,
        batch: DeliveryBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>>;
}

/// What a delivery pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sub-sessions accepted by the server and removed from the spool.
    pub sub_sessions_sent: usize,
    /// Sub-sessions the server refused; they stay spooled.
    pub sub_sessions_failed: usize,
    /// Sub-sessions skipped (nothing to deliver).
    pub sub_sessions_skipped: usize,
    /// Fences across all accepted sub-sessions.
    pub fences_sent: usize,
    /// What the age-based cleanup removed before delivery.
    pub cleanup: CleanupSummary,
}

/// Runs delivery passes over the spool.
#[derive(Clone)]
pub struct ResendCoordinator {
    store: StoreHandle,
    sender: Arc<dyn ResultSender>,
    max_resend_age: Duration,
}

impl ResendCoordinator {
    pub fn new(store: StoreHandle, sender: Arc<dyn ResultSender>, max_resend_age: Duration) -> Self {
        Self {
            store,
            sender,
            max_resend_age,
        }
    }

    /// Run one delivery pass.
    ///
    /// Ages out stale records first, then sends every eligible
    /// sub-session newest first. A batch the server accepts is deleted
    /// from the spool; a refused batch is left for a later pass.
    /// Failures never abort the pass.
    pub async fn deliver(&self, mode: StartMode) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        match self.store.cleanup(Utc::now(), self.max_resend_age).await {
            Ok(summary) => {
                if !summary.is_empty() {
                    info!(
                        fences_removed = summary.fences_removed,
                        sub_sessions_removed = summary.sub_sessions_removed,
                        "aged out stale spool records"
                    );
                }
                report.cleanup = summary;
            }
            Err(e) => warn!(error = %e, "spool cleanup failed"),
        }

        let records = match self.store.eligible(mode).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not list deliverable sub-sessions");
                return report;
            }
        };

        let mut deliverable: Vec<CoverageSubSession> = Vec::with_capacity(records.len());
        for record in records {
            if record.fences.is_empty() {
                debug!(sub_session = %record.local_id, "no fences recorded, skipping");
                report.sub_sessions_skipped += 1;
            } else {
                deliverable.push(record);
            }
        }
        // Newest measurements first; a flaky server should get the
        // most recent data before anything else.
        deliverable.sort_by_key(|record| Reverse(record.earliest_fence_at()));

        for mut record in deliverable {
            let (test_uuid, anchor) = match (record.test_uuid.clone(), record.anchor_at) {
                (Some(test_uuid), Some(anchor)) => (test_uuid, anchor),
                _ => {
                    warn!(
                        sub_session = %record.local_id,
                        "record has no delivery identity, skipping"
                    );
                    report.sub_sessions_skipped += 1;
                    continue;
                }
            };

            record.fences.sort_by_key(|fence| fence.entered_at);
            let fences: Vec<FencePayload> = record
                .fences
                .iter()
                .map(|fence| FencePayload::from_fence(fence, anchor))
                .collect();
            let count = fences.len();

            let batch = DeliveryBatch {
                test_uuid: test_uuid.clone(),
                anchor_at: anchor,
                fences,
            };
            match self.sender.send_fences(batch).await {
                Ok(()) => {
                    debug!(test_uuid = %test_uuid, fences = count, "sub-session delivered");
                    report.sub_sessions_sent += 1;
                    report.fences_sent += count;
                    if let Err(e) = self.store.delete_sub_session(record.local_id).await {
                        warn!(
                            sub_session = %record.local_id,
                            error = %e,
                            "delivered but could not remove spool record"
                        );
                    }
                }
                Err(e) => {
                    warn!(test_uuid = %test_uuid, error = %e, "delivery refused, keeping spool record");
                    report.sub_sessions_failed += 1;
                }
            }
        }

        if report.sub_sessions_sent > 0 || report.sub_sessions_failed > 0 {
            info!(
                sent = report.sub_sessions_sent,
                failed = report.sub_sessions_failed,
                fences = report.fences_sent,
                "delivery pass finished"
            );
        }
        report
    }
}
