// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CaptureState {
    // Newly constructed, or the most recent intensity was below threshold.
    Idle,

    // Every intensity passed to update() since `since` has been at or above
    // threshold. Also the state after a failed export, so that the next frame
    // above threshold retries.
    Holding{since: Instant},

    // Export succeeded. Terminal; update() has no further effect.
    Captured,
}

/// Outcome of one CaptureStateMachine::update() call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HoldStatus {
    Idle,
    Holding{elapsed: Duration, remaining: Duration},
    // The hold duration has been met; the caller should export now and report
    // back with export_succeeded() or export_failed().
    Confirmed,
    Captured,
}

/// Debounced hold-to-capture: an intensity at or above `threshold` must be
/// sustained without a break for `hold_duration` before a capture is
/// confirmed. A single frame below threshold restarts the hold.
pub struct CaptureStateMachine {
    state: CaptureState,
    threshold: f64,
    hold_duration: Duration,
}

impl CaptureStateMachine {
    pub fn new(threshold: f64, hold_duration: Duration) -> Self {
        CaptureStateMachine{state: CaptureState::Idle, threshold, hold_duration}
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    // When the current hold streak began, if one is in progress.
    pub fn hold_start(&self) -> Option<Instant> {
        match self.state {
            CaptureState::Holding{since} => Some(since),
            _ => None,
        }
    }

    /// `intensity` The best smile intensity in the frame captured at `now`.
    /// `now` Must not be earlier than `now` passed to the previous call.
    pub fn update(&mut self, intensity: f64, now: Instant) -> HoldStatus {
        let above = intensity >= self.threshold;
        match self.state {
            CaptureState::Captured => HoldStatus::Captured,
            CaptureState::Idle => {
                if !above {
                    return HoldStatus::Idle;
                }
                debug!("Hold started at intensity {:.1}", intensity);
                self.state = CaptureState::Holding{since: now};
                self.check_hold(now, now)
            },
            CaptureState::Holding{since} => {
                if !above {
                    debug!("Hold broken at intensity {:.1}", intensity);
                    self.state = CaptureState::Idle;
                    return HoldStatus::Idle;
                }
                self.check_hold(since, now)
            },
        }
    }

    fn check_hold(&self, since: Instant, now: Instant) -> HoldStatus {
        let elapsed = now.saturating_duration_since(since);
        if elapsed >= self.hold_duration {
            HoldStatus::Confirmed
        } else {
            HoldStatus::Holding{elapsed, remaining: self.hold_duration - elapsed}
        }
    }

    pub fn export_succeeded(&mut self) {
        info!("Capture confirmed");
        self.state = CaptureState::Captured;
    }

    // Stays in Holding with the original start time. Returns the status to
    // report for the frame at `now` in place of Confirmed.
    pub fn export_failed(&mut self, now: Instant) -> HoldStatus {
        warn!("Export failed; will retry while the smile is held");
        match self.state {
            CaptureState::Holding{since} => HoldStatus::Holding{
                elapsed: now.saturating_duration_since(since),
                remaining: Duration::ZERO},
            CaptureState::Idle => HoldStatus::Idle,
            CaptureState::Captured => HoldStatus::Captured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(start: Instant, seconds: f64) -> Instant {
        start + Duration::from_secs_f64(seconds)
    }

    #[test]
    fn test_sustained_hold_confirms() {
        let mut csm = CaptureStateMachine::new(98.0, Duration::from_secs(3));
        let t0 = Instant::now();
        assert_eq!(csm.update(98.0, t0),
                   HoldStatus::Holding{elapsed: Duration::ZERO,
                                       remaining: Duration::from_secs(3)});
        assert_eq!(csm.hold_start(), Some(t0));
        assert_eq!(csm.update(98.0, at(t0, 1.5)),
                   HoldStatus::Holding{elapsed: Duration::from_millis(1500),
                                       remaining: Duration::from_millis(1500)});
        assert_eq!(csm.update(98.0, at(t0, 3.0)), HoldStatus::Confirmed);
        csm.export_succeeded();
        assert_eq!(csm.state(), CaptureState::Captured);
        // Terminal.
        assert_eq!(csm.update(0.0, at(t0, 4.0)), HoldStatus::Captured);
        assert_eq!(csm.hold_start(), None);
    }

    #[test]
    fn test_break_restarts_hold() {
        let mut csm = CaptureStateMachine::new(98.0, Duration::from_secs(3));
        let t0 = Instant::now();
        let intensities = [98.0, 98.0, 50.0, 98.0, 98.0, 98.0];
        let mut statuses = Vec::new();
        for (i, intensity) in intensities.iter().enumerate() {
            statuses.push(csm.update(*intensity, at(t0, 1.5 * i as f64)));
        }
        // No capture at t=3.0, which was the break.
        assert_eq!(statuses[2], HoldStatus::Idle);
        assert!(!statuses[..5].contains(&HoldStatus::Confirmed));
        assert_eq!(statuses[3],
                   HoldStatus::Holding{elapsed: Duration::ZERO,
                                       remaining: Duration::from_secs(3)});
        // The restarted hold completes 3s after t=4.5.
        assert_eq!(statuses[5], HoldStatus::Confirmed);
    }

    #[test]
    fn test_below_threshold_stays_idle() {
        let mut csm = CaptureStateMachine::new(98.0, Duration::from_secs(3));
        let t0 = Instant::now();
        for i in 0..10 {
            assert_eq!(csm.update(97.9, at(t0, i as f64)), HoldStatus::Idle);
        }
        assert_eq!(csm.state(), CaptureState::Idle);
    }

    #[test]
    fn test_export_failure_retries() {
        let mut csm = CaptureStateMachine::new(98.0, Duration::from_secs(3));
        let t0 = Instant::now();
        csm.update(100.0, t0);
        assert_eq!(csm.update(100.0, at(t0, 3.2)), HoldStatus::Confirmed);
        assert_eq!(csm.export_failed(at(t0, 3.2)),
                   HoldStatus::Holding{elapsed: Duration::from_millis(3200),
                                       remaining: Duration::ZERO});
        assert_eq!(csm.state(), CaptureState::Holding{since: t0});
        // Next frame above threshold confirms again immediately.
        assert_eq!(csm.update(99.0, at(t0, 3.3)), HoldStatus::Confirmed);
        csm.export_failed(at(t0, 3.3));
        // Dropping below threshold abandons the retry.
        assert_eq!(csm.update(10.0, at(t0, 3.4)), HoldStatus::Idle);
        assert_eq!(csm.update(100.0, at(t0, 3.5)),
                   HoldStatus::Holding{elapsed: Duration::ZERO,
                                       remaining: Duration::from_secs(3)});
    }

    #[test]
    fn test_zero_hold_duration() {
        let mut csm = CaptureStateMachine::new(98.0, Duration::ZERO);
        assert_eq!(csm.update(98.0, Instant::now()), HoldStatus::Confirmed);
        csm.export_succeeded();
        assert_eq!(csm.state(), CaptureState::Captured);
    }

}  // mod tests.
