//! The probe schedule.
//!
//! One task ticks at the probe cadence. Each tick judges the session
//! windows, then fires an independent probe task so a slow or timed
//! out probe never delays the next one. Session renewal also runs off
//! the schedule's back so probing continues against the old grant
//! until the replacement is installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StopCause;
use crate::event::{EventFeed, MeasurementEvent};
use crate::fence::PingOutcome;
use crate::ping::PingClient;
use crate::session::{SessionCoordinator, WindowVerdict};

pub struct ProbeDriver {
    interval: Duration,
    coordinator: Arc<SessionCoordinator>,
    ping: PingClient,
    feed: EventFeed,
    cancel: CancellationToken,
    stop_cause: Option<oneshot::Sender<StopCause>>,
    renewal_inflight: Arc<AtomicBool>,
}

impl ProbeDriver {
    pub fn new(
        interval: Duration,
        coordinator: Arc<SessionCoordinator>,
        ping: PingClient,
        feed: EventFeed,
        cancel: CancellationToken,
        stop_cause: oneshot::Sender<StopCause>,
    ) -> Self {
        Self {
            interval,
            coordinator,
            ping,
            feed,
            cancel,
            stop_cause: Some(stop_cause),
            renewal_inflight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "probe schedule started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.coordinator.window_verdict().await {
                WindowVerdict::Continue => {}
                WindowVerdict::RenewSession => self.spawn_renewal(),
                WindowVerdict::StopMeasurement => {
                    info!("total measurement window elapsed, stopping");
                    if let Some(tx) = self.stop_cause.take() {
                        let _ = tx.send(StopCause::TotalWindowExpired);
                    }
                    self.cancel.cancel();
                    break;
                }
            }
            self.spawn_probe();
        }
        info!("probe schedule stopped");
    }

    /// Renew in the background; the schedule keeps probing against the
    /// old grant until the new one lands. At most one renewal runs at
    /// a time.
    fn spawn_renewal(&self) {
        if self
            .renewal_inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let coordinator = Arc::clone(&self.coordinator);
        let ping = self.ping.clone();
        let cancel = self.cancel.clone();
        let inflight = Arc::clone(&self.renewal_inflight);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = coordinator.renew() => match result {
                    // The old endpoint token is dead weight now; drop
                    // it so the next probe negotiates with the new
                    // grant.
                    Ok(()) => ping.reset().await,
                    Err(e) => {
                        warn!(error = %e, "session renewal failed, keeping current session");
                    }
                },
            }
            inflight.store(false, Ordering::Release);
        });
    }

    /// Fire one probe without holding up the schedule.
    fn spawn_probe(&self) {
        let ping = self.ping.clone();
        let feed = self.feed.clone();
        tokio::spawn(async move {
            let at = Utc::now();
            let outcome = match ping.probe().await {
                Ok(rtt) => PingOutcome::interval(at, rtt),
                Err(e) => {
                    debug!(error = %e, "probe failed");
                    PingOutcome::error(at)
                }
            };
            if feed.send(MeasurementEvent::Probe(outcome)).await.is_err() {
                debug!("event feed closed, probe outcome dropped");
            }
        });
    }
}
