//! Per-connection timeout control.
//!
//! One timer slot per connection: at most one [`TimeoutReason`] is armed at a
//! time and arming a new reason cancels the prior one. Minimum-data-rate
//! reasons are evaluated incrementally against transferred byte counts rather
//! than as a flat deadline.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::MinDataRate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    None,
    KeepAlive,
    RequestHeaders,
    RequestBodyDrain,
    ReadDataRate,
    WriteDataRate,
    TimeoutFeature,
}

impl TimeoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutReason::None => "none",
            TimeoutReason::KeepAlive => "keep-alive",
            TimeoutReason::RequestHeaders => "request headers",
            TimeoutReason::RequestBodyDrain => "request body drain",
            TimeoutReason::ReadDataRate => "request body minimum data rate",
            TimeoutReason::WriteDataRate => "response minimum data rate",
            TimeoutReason::TimeoutFeature => "requested timeout",
        }
    }
}

impl std::fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct RateTracker {
    rate: MinDataRate,
    started: Instant,
    transferred: u64,
}

impl RateTracker {
    fn new(rate: MinDataRate, now: Instant) -> Self {
        Self {
            rate,
            started: now,
            transferred: 0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.transferred = self.transferred.saturating_add(bytes);
    }

    /// Below the minimum rate after the grace period has elapsed?
    fn too_slow(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed <= self.rate.grace_period {
            return false;
        }
        let expected = self.rate.bytes_per_second * elapsed.as_secs_f64();
        (self.transferred as f64) < expected
    }
}

#[derive(Debug)]
struct TimeoutState {
    reason: TimeoutReason,
    deadline: Option<Instant>,
    rate: Option<RateTracker>,
}

/// Shared per-connection timer state. Engines consult [`poll_deadline`] to
/// bound their transport waits and [`fired`] to decide what expired.
///
/// [`poll_deadline`]: TimeoutControl::poll_deadline
/// [`fired`]: TimeoutControl::fired
#[derive(Debug)]
pub struct TimeoutControl {
    state: Mutex<TimeoutState>,
}

impl Default for TimeoutControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Heartbeat used while a data-rate reason is armed; rate verdicts have no
/// fixed deadline so the loop re-checks on this cadence.
const RATE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

impl TimeoutControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimeoutState {
                reason: TimeoutReason::None,
                deadline: None,
                rate: None,
            }),
        }
    }

    pub fn reason(&self) -> TimeoutReason {
        self.state.lock().unwrap().reason
    }

    /// Arm a deadline-style timeout. Replaces whatever was armed before.
    pub fn set_timeout(&self, reason: TimeoutReason, after: Duration, now: Instant) {
        let mut state = self.state.lock().unwrap();
        state.reason = reason;
        state.deadline = Some(now + after);
        state.rate = None;
    }

    /// Arm an incremental data-rate timeout (read or write direction is
    /// carried by the reason). Replaces whatever was armed before.
    pub fn set_data_rate(&self, reason: TimeoutReason, rate: MinDataRate, now: Instant) {
        debug_assert!(matches!(
            reason,
            TimeoutReason::ReadDataRate | TimeoutReason::WriteDataRate
        ));
        let mut state = self.state.lock().unwrap();
        state.reason = reason;
        state.deadline = None;
        state.rate = Some(RateTracker::new(rate, now));
    }

    /// Disarm entirely.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.reason = TimeoutReason::None;
        state.deadline = None;
        state.rate = None;
    }

    /// Account bytes against an armed data-rate reason; no-op otherwise.
    pub fn record_transfer(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(rate) = state.rate.as_mut() {
            rate.record(bytes);
        }
    }

    /// The instant the engine should wake to re-evaluate, if anything is
    /// armed.
    pub fn poll_deadline(&self, now: Instant) -> Option<Instant> {
        let state = self.state.lock().unwrap();
        match state.reason {
            TimeoutReason::None => None,
            TimeoutReason::ReadDataRate | TimeoutReason::WriteDataRate => {
                Some(now + RATE_CHECK_INTERVAL)
            }
            _ => state.deadline,
        }
    }

    /// Which reason, if any, has expired at `now`.
    pub fn fired(&self, now: Instant) -> Option<TimeoutReason> {
        let state = self.state.lock().unwrap();
        match state.reason {
            TimeoutReason::None => None,
            TimeoutReason::ReadDataRate | TimeoutReason::WriteDataRate => state
                .rate
                .as_ref()
                .filter(|r| r.too_slow(now))
                .map(|_| state.reason),
            reason => state
                .deadline
                .filter(|deadline| now >= *deadline)
                .map(|_| reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(bps: f64, grace_secs: u64) -> MinDataRate {
        MinDataRate::new(bps, Duration::from_secs(grace_secs))
    }

    #[test]
    fn arming_a_new_reason_cancels_the_prior() {
        let control = TimeoutControl::new();
        let now = Instant::now();

        control.set_timeout(TimeoutReason::KeepAlive, Duration::from_secs(10), now);
        assert_eq!(control.reason(), TimeoutReason::KeepAlive);

        control.set_timeout(TimeoutReason::RequestHeaders, Duration::from_secs(30), now);
        assert_eq!(control.reason(), TimeoutReason::RequestHeaders);
        // The keep-alive deadline no longer fires.
        assert_eq!(control.fired(now + Duration::from_secs(11)), None);
        assert_eq!(
            control.fired(now + Duration::from_secs(31)),
            Some(TimeoutReason::RequestHeaders)
        );
    }

    #[test]
    fn deadline_fires_only_after_expiry() {
        let control = TimeoutControl::new();
        let now = Instant::now();
        control.set_timeout(TimeoutReason::KeepAlive, Duration::from_secs(5), now);

        assert_eq!(control.fired(now + Duration::from_secs(4)), None);
        assert_eq!(
            control.fired(now + Duration::from_secs(5)),
            Some(TimeoutReason::KeepAlive)
        );
    }

    #[test]
    fn rate_has_grace_period() {
        let control = TimeoutControl::new();
        let now = Instant::now();
        control.set_data_rate(TimeoutReason::ReadDataRate, rate(100.0, 5), now);

        // No bytes at all, but still inside the grace period.
        assert_eq!(control.fired(now + Duration::from_secs(5)), None);
        assert_eq!(
            control.fired(now + Duration::from_secs(6)),
            Some(TimeoutReason::ReadDataRate)
        );
    }

    #[test]
    fn fast_transfer_never_fires() {
        let control = TimeoutControl::new();
        let now = Instant::now();
        control.set_data_rate(TimeoutReason::WriteDataRate, rate(100.0, 2), now);

        control.record_transfer(100_000);
        assert_eq!(control.fired(now + Duration::from_secs(60)), None);
    }

    #[test]
    fn slow_transfer_fires_incrementally() {
        let control = TimeoutControl::new();
        let now = Instant::now();
        control.set_data_rate(TimeoutReason::ReadDataRate, rate(100.0, 2), now);

        // 10 bytes in 10 seconds is far below 100 B/s.
        control.record_transfer(10);
        assert_eq!(
            control.fired(now + Duration::from_secs(10)),
            Some(TimeoutReason::ReadDataRate)
        );
    }

    #[test]
    fn cancel_disarms() {
        let control = TimeoutControl::new();
        let now = Instant::now();
        control.set_timeout(TimeoutReason::RequestBodyDrain, Duration::from_secs(1), now);
        control.cancel();
        assert_eq!(control.reason(), TimeoutReason::None);
        assert_eq!(control.fired(now + Duration::from_secs(10)), None);
        assert_eq!(control.poll_deadline(now), None);
    }
}
