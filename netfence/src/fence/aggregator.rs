//! Fence aggregation over the merged measurement stream.
//!
//! A single task consumes the ordered stream of location, probe, and
//! technology events and maintains the current open fence. Moving past
//! the fence radius closes the fence and opens a new one at the new
//! location.
//!
//! Closed fences are not persisted immediately: a probe sent shortly
//! before the fence closed may still be in flight, and persisted
//! fences are immutable. Instead a closed fence settles in memory for
//! one probe-timeout and is persisted once nothing can still target
//! it. Stop and flush barriers persist the settling buffer
//! unconditionally.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Fence, LocationSample, PingOutcome};
use crate::event::MeasurementEvent;
use crate::gate::AccuracyGate;
use crate::geo::distance_m;
use crate::store::StoreHandle;

/// Fence aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Fence radius in metres.
    pub fence_radius_m: f64,

    /// Horizontal accuracy threshold in metres.
    pub min_location_accuracy_m: f64,

    /// How long a closed fence waits in memory for late probe
    /// outcomes before it is persisted. Matches the probe timeout.
    pub settle_after: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            fence_radius_m: crate::config::DEFAULT_FENCE_RADIUS_M,
            min_location_accuracy_m: crate::config::DEFAULT_MIN_LOCATION_ACCURACY_M,
            settle_after: crate::config::DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// The aggregation task. Owns the open fence, the settling buffer,
/// and the accuracy gate.
pub struct FenceAggregator {
    config: AggregatorConfig,
    settle: chrono::Duration,
    store: StoreHandle,
    gate: AccuracyGate,
    events: mpsc::Receiver<MeasurementEvent>,
    open_fence: Option<Fence>,
    /// Closed fences awaiting settlement, oldest at the front.
    settling: VecDeque<Fence>,
    last_technology: Option<String>,
    fences_opened: u64,
    fences_saved: u64,
    probes_assigned: u64,
    probes_dropped: u64,
}

impl FenceAggregator {
    /// Create an aggregator over the given event stream.
    pub fn new(
        config: AggregatorConfig,
        store: StoreHandle,
        events: mpsc::Receiver<MeasurementEvent>,
    ) -> Self {
        // Clamp so the prune cutoff arithmetic below stays in range.
        let settle = chrono::Duration::from_std(config.settle_after)
            .unwrap_or_else(|_| chrono::Duration::days(365_000));
        let gate = AccuracyGate::new(config.min_location_accuracy_m);
        Self {
            config,
            settle,
            store,
            gate,
            events,
            open_fence: None,
            settling: VecDeque::new(),
            last_technology: None,
            fences_opened: 0,
            fences_saved: 0,
            probes_assigned: 0,
            probes_dropped: 0,
        }
    }

    /// Spawn the aggregation loop.
    ///
    /// The task runs until every [`EventFeed`](crate::event::EventFeed)
    /// handle is gone, draining whatever is still buffered, then closes
    /// and persists the open fence on its way out.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            fence_radius_m = self.config.fence_radius_m,
            min_accuracy_m = self.config.min_location_accuracy_m,
            "fence aggregator started"
        );
        while let Some(event) = self.events.recv().await {
            self.handle_event(event, Utc::now()).await;
        }
        self.finish(Utc::now()).await;
    }

    async fn handle_event(&mut self, event: MeasurementEvent, now: DateTime<Utc>) {
        match event {
            MeasurementEvent::Location(sample) => self.handle_location(sample),
            MeasurementEvent::Probe(outcome) => self.handle_probe(outcome, now),
            MeasurementEvent::Technology(code) => self.handle_technology(code),
            MeasurementEvent::Flush { done } => {
                self.flush_all().await;
                let _ = done.send(());
            }
        }
        self.flush_settled(now).await;
        self.gate.prune(now - self.settle);
    }

    fn handle_location(&mut self, sample: LocationSample) {
        if !self.gate.observe(&sample) {
            debug!(
                accuracy_m = sample.horizontal_accuracy_m,
                "inaccurate location, fences unchanged"
            );
            return;
        }

        let needs_new = match &self.open_fence {
            Some(fence) => {
                distance_m(fence.start, sample.coordinate) >= self.config.fence_radius_m
            }
            None => true,
        };
        if !needs_new {
            return;
        }

        if let Some(mut fence) = self.open_fence.take() {
            fence.close(sample.at);
            debug!(
                fence = %fence.id,
                pings = fence.pings.len(),
                "fence closed"
            );
            self.settling.push_back(fence);
        }

        let mut fence = Fence::open(sample.coordinate, sample.at, self.config.fence_radius_m);
        // Radio technology arrives as a change stream; carry the last
        // known code into the new fence so it is never reported blank.
        if let Some(code) = &self.last_technology {
            fence.record_technology(code.clone());
        }
        debug!(
            fence = %fence.id,
            latitude = sample.coordinate.latitude,
            longitude = sample.coordinate.longitude,
            "fence opened"
        );
        self.fences_opened += 1;
        self.open_fence = Some(fence);
    }

    fn handle_probe(&mut self, outcome: PingOutcome, now: DateTime<Utc>) {
        if self.gate.is_suppressed(outcome.at, now) {
            self.probes_dropped += 1;
            debug!(at = %outcome.at, "probe inside inaccurate window, dropped");
            return;
        }

        // Newest fence first: the open fence, then the settling buffer
        // back to front.
        if let Some(fence) = self
            .open_fence
            .as_mut()
            .filter(|f| f.contains_instant(outcome.at, now))
        {
            fence.record_ping(outcome);
            self.probes_assigned += 1;
            return;
        }
        for fence in self.settling.iter_mut().rev() {
            if fence.contains_instant(outcome.at, now) {
                fence.record_ping(outcome);
                self.probes_assigned += 1;
                return;
            }
        }

        self.probes_dropped += 1;
        debug!(at = %outcome.at, "no fence for probe, dropped");
    }

    fn handle_technology(&mut self, code: String) {
        if let Some(fence) = self.open_fence.as_mut() {
            fence.record_technology(code.clone());
        }
        self.last_technology = Some(code);
    }

    /// Persist settling fences that no in-flight probe can target
    /// anymore.
    async fn flush_settled(&mut self, now: DateTime<Utc>) {
        loop {
            let settled = match self.settling.front() {
                Some(fence) => {
                    let exited = fence.exited_at.unwrap_or(now);
                    now.signed_duration_since(exited) > self.settle
                }
                None => break,
            };
            if !settled {
                break;
            }
            if let Some(fence) = self.settling.pop_front() {
                self.save_fence(fence).await;
            }
        }
    }

    /// Persist the whole settling buffer, settled or not. The open
    /// fence stays open.
    async fn flush_all(&mut self) {
        while let Some(fence) = self.settling.pop_front() {
            self.save_fence(fence).await;
        }
    }

    async fn save_fence(&mut self, fence: Fence) {
        let id = fence.id;
        match self.store.save_fence(fence).await {
            Ok(()) => {
                self.fences_saved += 1;
            }
            Err(e) => {
                warn!(fence = %id, error = %e, "failed to persist fence");
            }
        }
    }

    /// Close the open fence and persist everything. Runs once at the
    /// end of the measurement.
    async fn finish(&mut self, now: DateTime<Utc>) {
        if let Some(mut fence) = self.open_fence.take() {
            fence.close(now);
            self.settling.push_back(fence);
        }
        self.flush_all().await;
        info!(
            fences_opened = self.fences_opened,
            fences_saved = self.fences_saved,
            probes_assigned = self.probes_assigned,
            probes_dropped = self.probes_dropped,
            "fence aggregator stopped"
        );
    }
}
