//! Location accuracy gating.
//!
//! GPS fixes carry a horizontal accuracy estimate. While the estimate
//! is worse than the configured threshold, the device's position is
//! not trustworthy enough to attribute latency probes to a fence, so
//! the gate records an "inaccurate window". Probes whose send time
//! falls inside any such window are discarded instead of assigned.
//!
//! A window opens at the first inaccurate sample and closes at the
//! next accurate one. An open window suppresses everything from its
//! begin time up to the present.

use chrono::{DateTime, Utc};

use crate::fence::LocationSample;

/// A span of time during which location accuracy was unacceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccuracyWindow {
    /// When accuracy first degraded.
    pub begin: DateTime<Utc>,
    /// When accuracy recovered, or `None` while still degraded.
    pub end: Option<DateTime<Utc>>,
}

/// Tracks inaccurate windows from the location sample stream.
#[derive(Debug)]
pub struct AccuracyGate {
    min_accuracy_m: f64,
    windows: Vec<AccuracyWindow>,
}

impl AccuracyGate {
    /// Create a gate with the given accuracy threshold in metres.
    /// A sample is accurate when its reported horizontal accuracy is
    /// at or below the threshold.
    pub fn new(min_accuracy_m: f64) -> Self {
        Self {
            min_accuracy_m,
            windows: Vec::new(),
        }
    }

    /// Record a location sample's accuracy.
    ///
    /// Returns `true` if the sample is accurate enough for fence
    /// processing. Transitions open or close windows as needed;
    /// repeated samples on the same side of the threshold change
    /// nothing.
    pub fn observe(&mut self, sample: &LocationSample) -> bool {
        let accurate = sample.horizontal_accuracy_m <= self.min_accuracy_m;
        match (accurate, self.open_window_index()) {
            (false, None) => {
                self.windows.push(AccuracyWindow {
                    begin: sample.at,
                    end: None,
                });
            }
            (true, Some(idx)) => {
                self.windows[idx].end = Some(sample.at);
            }
            _ => {}
        }
        accurate
    }

    /// Whether a probe sent at `at` must be discarded.
    ///
    /// Closed windows suppress `[begin, end)`; an open window
    /// suppresses `[begin, now)`.
    pub fn is_suppressed(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.windows
            .iter()
            .any(|w| at >= w.begin && at < w.end.unwrap_or(now))
    }

    /// Drop closed windows that ended before `cutoff`. Once every
    /// probe that could fall inside a window has been processed, the
    /// window is dead weight.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.windows
            .retain(|w| w.end.map_or(true, |end| end >= cutoff));
    }

    /// Number of windows currently tracked.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    fn open_window_index(&self) -> Option<usize> {
        self.windows.iter().position(|w| w.end.is_none())
    }
}
