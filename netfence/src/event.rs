//! The merged measurement event stream.
//!
//! Location fixes, latency probe outcomes, and radio technology
//! changes all funnel into one ordered channel consumed by the fence
//! aggregator. Producers hold a clone-able [`EventFeed`]; the
//! aggregator owns the receiving end.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::fence::{LocationSample, PingOutcome};

/// One event on the merged measurement stream.
#[derive(Debug)]
pub enum MeasurementEvent {
    /// A location fix from the platform location service.
    Location(LocationSample),
    /// A resolved latency probe.
    Probe(PingOutcome),
    /// The radio technology changed; the payload is the new code.
    Technology(String),
    /// Barrier: the aggregator persists every settled fence, then
    /// acknowledges. Used before sub-session boundaries so fence saves
    /// land in the right sub-session.
    Flush { done: oneshot::Sender<()> },
}

/// Error returned when the aggregator has stopped consuming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedClosed;

impl fmt::Display for FeedClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "measurement event feed is closed")
    }
}

impl std::error::Error for FeedClosed {}

/// Clone-able sending handle for the merged event stream.
#[derive(Debug, Clone)]
pub struct EventFeed {
    tx: mpsc::Sender<MeasurementEvent>,
}

impl EventFeed {
    /// Create a feed and the receiver the aggregator will consume.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MeasurementEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Send an event, waiting for channel capacity if necessary.
    pub async fn send(&self, event: MeasurementEvent) -> Result<(), FeedClosed> {
        self.tx.send(event).await.map_err(|_| FeedClosed)
    }

    /// Ask the aggregator to persist all settled fences and wait until
    /// it has done so. Returns `Err` if the aggregator is gone, in
    /// which case there is nothing left to flush.
    pub async fn flush(&self) -> Result<(), FeedClosed> {
        let (done, ack) = oneshot::channel();
        self.tx
            .send(MeasurementEvent::Flush { done })
            .await
            .map_err(|_| FeedClosed)?;
        ack.await.map_err(|_| FeedClosed)
    }

    /// Whether the aggregator is still consuming.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
