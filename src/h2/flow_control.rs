//! Flow-control window accounting (RFC 7540 Section 5.2).
//!
//! Pure counter logic shared by the per-connection and per-stream windows.
//! Windows can go negative when a SETTINGS change shrinks the initial window
//! under bytes already in flight.

use crate::h2::consts::MAX_WINDOW_SIZE;

/// Outcome of replenishing a window; exceeding the 31-bit protocol maximum is
/// an error whose severity (stream vs connection) the caller assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUpdateResult {
    Ok,
    Overflow,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowControlWindow {
    available: i64,
}

impl FlowControlWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: i64::from(initial),
        }
    }

    /// Bytes that may still be transferred. Negative when a settings shrink
    /// overdrew the window.
    pub fn available(&self) -> i64 {
        self.available
    }

    /// Can `bytes` be transferred right now?
    pub fn can_consume(&self, bytes: usize) -> bool {
        self.available >= bytes as i64
    }

    /// Account `bytes` as transferred. Callers check [`can_consume`] first
    /// for send windows; receive windows consume unconditionally and report
    /// the violation from the resulting negative balance.
    ///
    /// [`can_consume`]: FlowControlWindow::can_consume
    pub fn consume(&mut self, bytes: usize) {
        self.available -= bytes as i64;
    }

    /// Apply a WINDOW_UPDATE increment.
    pub fn replenish(&mut self, increment: u32) -> WindowUpdateResult {
        self.adjust(i64::from(increment))
    }

    /// Apply a SETTINGS-driven initial-window-size delta (may be negative).
    pub fn adjust(&mut self, delta: i64) -> WindowUpdateResult {
        let new_value = self.available + delta;
        if new_value > i64::from(MAX_WINDOW_SIZE) {
            return WindowUpdateResult::Overflow;
        }
        self.available = new_value;
        WindowUpdateResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_and_replenish() {
        let mut window = FlowControlWindow::new(100);
        assert!(window.can_consume(100));
        window.consume(60);
        assert_eq!(window.available(), 40);
        assert!(!window.can_consume(41));

        assert_eq!(window.replenish(10), WindowUpdateResult::Ok);
        assert_eq!(window.available(), 50);
    }

    #[test]
    fn window_never_exceeds_protocol_maximum() {
        let mut window = FlowControlWindow::new(MAX_WINDOW_SIZE);
        assert_eq!(window.replenish(1), WindowUpdateResult::Overflow);
        // A failed replenish leaves the balance untouched.
        assert_eq!(window.available(), i64::from(MAX_WINDOW_SIZE));
    }

    #[test]
    fn settings_shrink_can_go_negative() {
        let mut window = FlowControlWindow::new(65_535);
        window.consume(65_535);
        assert_eq!(window.adjust(-30_000), WindowUpdateResult::Ok);
        assert_eq!(window.available(), -30_000);
        assert!(!window.can_consume(1));

        // Credit restores it.
        assert_eq!(window.replenish(30_001), WindowUpdateResult::Ok);
        assert!(window.can_consume(1));
    }

    #[test]
    fn mixed_update_sequences_respect_the_maximum() {
        // Any interleaving of increments and settings deltas that would push
        // past 2^31-1 must report overflow at the step that crosses.
        let mut window = FlowControlWindow::new(0);
        assert_eq!(window.replenish(MAX_WINDOW_SIZE), WindowUpdateResult::Ok);
        assert_eq!(window.adjust(1), WindowUpdateResult::Overflow);
        window.consume(5);
        assert_eq!(window.adjust(5), WindowUpdateResult::Ok);
        assert_eq!(window.replenish(1), WindowUpdateResult::Overflow);
    }
}
