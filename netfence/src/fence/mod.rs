//! Geographic fence records and the measurement samples they collect.
//!
//! A fence is a circular region entered at a point in time and exited
//! when the device moves past the configured radius from the fence's
//! first location. While a fence is open it accumulates latency probe
//! outcomes and radio technology samples; once closed and persisted it
//! never changes again.

pub mod aggregator;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Coordinate;

/// A location fix delivered by the platform's location service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Reported position.
    pub coordinate: Coordinate,
    /// Wall-clock time of the fix.
    pub at: DateTime<Utc>,
    /// Reported horizontal accuracy in metres. Larger is worse.
    pub horizontal_accuracy_m: f64,
}

impl LocationSample {
    /// Create a location sample.
    pub fn new(coordinate: Coordinate, at: DateTime<Utc>, horizontal_accuracy_m: f64) -> Self {
        Self {
            coordinate,
            at,
            horizontal_accuracy_m,
        }
    }
}

/// The result half of a latency probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingResult {
    /// The server answered; round-trip time.
    Interval(Duration),
    /// The probe failed (timeout, transport error, or session fault).
    Error,
}

/// One latency probe outcome, stamped with the probe's send time.
///
/// Outcomes are immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingOutcome {
    /// When the probe was sent.
    pub at: DateTime<Utc>,
    /// What came of it.
    pub result: PingResult,
}

impl PingOutcome {
    /// A successful probe with the given round-trip time.
    pub fn interval(at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            at,
            result: PingResult::Interval(duration),
        }
    }

    /// A failed probe.
    pub fn error(at: DateTime<Utc>) -> Self {
        Self {
            at,
            result: PingResult::Error,
        }
    }
}

/// A geographic fence and the samples recorded inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fence {
    /// Local identifier, assigned at creation.
    pub id: Uuid,
    /// First location of the fence; distance checks measure from here.
    pub start: Coordinate,
    /// When the device entered the fence.
    pub entered_at: DateTime<Utc>,
    /// When the device left, or `None` while the fence is open.
    pub exited_at: Option<DateTime<Utc>>,
    /// Radius in metres the fence was built with.
    pub radius_m: f64,
    /// Radio technology codes observed while inside, in order.
    pub technologies: Vec<String>,
    /// Latency probe outcomes assigned to this fence, in order.
    pub pings: Vec<PingOutcome>,
}

impl Fence {
    /// Open a new fence at the given location.
    pub fn open(start: Coordinate, entered_at: DateTime<Utc>, radius_m: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            start,
            entered_at,
            exited_at: None,
            radius_m,
            technologies: Vec::new(),
            pings: Vec::new(),
        }
    }

    /// Whether the fence is still collecting samples.
    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }

    /// Close the fence at the given instant.
    pub fn close(&mut self, at: DateTime<Utc>) {
        self.exited_at = Some(at);
    }

    /// Whether `at` falls inside this fence's time interval.
    ///
    /// The interval is `[entered_at, exited_at)`; an open fence uses
    /// `now` as its provisional exit time. A probe stamped exactly at
    /// a fence boundary belongs to the newer fence.
    pub fn contains_instant(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        at >= self.entered_at && at < self.exited_at.unwrap_or(now)
    }

    /// Append a probe outcome.
    pub fn record_ping(&mut self, outcome: PingOutcome) {
        self.pings.push(outcome);
    }

    /// Append a radio technology sample.
    pub fn record_technology(&mut self, code: String) {
        self.technologies.push(code);
    }

    /// Mean round-trip time across successful probes, or `None` if no
    /// probe in this fence succeeded. Failed outcomes never contribute.
    pub fn average_ping(&self) -> Option<Duration> {
        let mut total_nanos: u128 = 0;
        let mut count: u32 = 0;
        for outcome in &self.pings {
            if let PingResult::Interval(duration) = outcome.result {
                total_nanos += duration.as_nanos();
                count += 1;
            }
        }
        if count == 0 {
            return None;
        }
        let avg_nanos = total_nanos / u128::from(count);
        Some(Duration::from_nanos(avg_nanos as u64))
    }

    /// The technology code the fence is reported with: the most
    /// recently observed sample.
    pub fn significant_technology(&self) -> Option<&str> {
        self.technologies.last().map(String::as_str)
    }

    /// Time spent inside the fence, known once it has closed.
    pub fn dwell(&self) -> Option<chrono::Duration> {
        self.exited_at
            .map(|exited| exited.signed_duration_since(self.entered_at))
    }
}
