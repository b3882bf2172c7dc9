//! Grant and measurement lifetime windows.

use std::time::Duration;

/// What the probe schedule should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    /// Both windows are open, keep probing.
    Continue,
    /// The grant window elapsed, negotiate a fresh sub-session.
    RenewSession,
    /// The total measurement window elapsed, wind everything down.
    StopMeasurement,
}

/// Lifetime limits attached to a session grant. A zero duration
/// disables the corresponding limit.
#[derive(Debug, Clone, Copy)]
pub struct SessionWindows {
    pub max_sub_session: Duration,
    pub max_total: Duration,
}

impl SessionWindows {
    /// Judge the elapsed times against both windows. The total window
    /// wins when both have elapsed.
    pub fn verdict(
        &self,
        measurement_elapsed: Duration,
        grant_elapsed: Duration,
    ) -> WindowVerdict {
        if !self.max_total.is_zero() && measurement_elapsed >= self.max_total {
            return WindowVerdict::StopMeasurement;
        }
        if !self.max_sub_session.is_zero() && grant_elapsed >= self.max_sub_session {
            return WindowVerdict::RenewSession;
        }
        WindowVerdict::Continue
    }
}
