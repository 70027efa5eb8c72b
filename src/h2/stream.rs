//! Per-stream lifecycle state and the send-window synchronization primitive.
//!
//! The connection read loop owns one [`StreamState`] per active stream and is
//! the only mutator of its receive-side bookkeeping. The stream's worker task
//! touches the connection only through the body event channel, the credit
//! channel, the shared frame writer, and the [`SendWindow`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::body::BodyEvent;
use crate::h2::flow_control::{FlowControlWindow, WindowUpdateResult};
use crate::types::{HeaderMap, ServerError};

/// Output window credit shared between the read loop (replenishes) and the
/// stream worker (consumes, suspending while exhausted).
pub(crate) struct SendWindow {
    window: Mutex<FlowControlWindow>,
    closed: AtomicBool,
    notify: Notify,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: Mutex::new(FlowControlWindow::new(initial)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn available(&self) -> i64 {
        self.window.lock().unwrap().available()
    }

    pub fn replenish(&self, increment: u32) -> WindowUpdateResult {
        let result = self.window.lock().unwrap().replenish(increment);
        if result == WindowUpdateResult::Ok {
            self.notify.notify_waiters();
        }
        result
    }

    /// SETTINGS-driven initial-window-size delta.
    pub fn adjust(&self, delta: i64) -> WindowUpdateResult {
        let result = self.window.lock().unwrap().adjust(delta);
        if result == WindowUpdateResult::Ok {
            self.notify.notify_waiters();
        }
        result
    }

    /// Wake any waiting writer with a permanent "stream is gone" verdict.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Consume up to `max` bytes of credit, suspending while the window is
    /// empty. `None` means the stream was aborted.
    pub async fn reserve(&self, max: usize) -> Option<usize> {
        loop {
            // Register interest before checking, so a replenish racing with
            // the check cannot be missed.
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            {
                let mut window = self.window.lock().unwrap();
                let available = window.available();
                if available > 0 {
                    let take = (available as usize).min(max);
                    window.consume(take);
                    return Some(take);
                }
            }
            notified.await;
        }
    }

    /// Consume exactly `n` bytes of credit, over as many waits as it takes.
    pub async fn reserve_exact(&self, n: usize) -> Option<()> {
        let mut remaining = n;
        while remaining > 0 {
            remaining -= self.reserve(remaining).await?;
        }
        Some(())
    }
}

/// Read-loop-owned state for one multiplexed request.
pub(crate) struct StreamState {
    pub id: u32,
    /// Client-to-server credit, consumed as DATA arrives.
    pub recv_window: FlowControlWindow,
    /// Server-to-client credit, shared with the worker.
    pub send_window: Arc<SendWindow>,
    pub body_tx: mpsc::UnboundedSender<BodyEvent>,
    /// Declared content-length still expected, when one was present.
    pub input_remaining: Option<u64>,
    pub end_stream_received: bool,
    /// The client reset the stream; any DATA after this is a violation.
    pub rst_stream_received: bool,
    /// We reset the stream; frames already in flight are absorbed.
    pub rst_stream_sent: bool,
    /// Worker finished (or abandoned) its response.
    pub local_complete: bool,
    /// Set on first sight in the completed queue; the stream is evicted when
    /// it passes without closing both directions.
    pub drain_deadline: Option<Instant>,
    pub worker: JoinHandle<()>,
}

impl StreamState {
    pub fn remote_complete(&self) -> bool {
        self.end_stream_received || self.rst_stream_received
    }

    pub fn fully_closed(&self) -> bool {
        self.remote_complete() && self.local_complete
    }

    pub fn deliver_data(&mut self, data: bytes::Bytes) {
        // The worker may already be gone; backpressure is handled via the
        // delayed window credit, not the channel.
        let _ = self.body_tx.send(BodyEvent::Data(data));
    }

    pub fn deliver_end(&mut self) {
        self.end_stream_received = true;
        let _ = self.body_tx.send(BodyEvent::End);
    }

    pub fn deliver_trailers(&mut self, trailers: HeaderMap) {
        self.end_stream_received = true;
        let _ = self.body_tx.send(BodyEvent::Trailers(trailers));
        let _ = self.body_tx.send(BodyEvent::End);
    }

    /// Tear the stream down: the worker's next body read observes the error
    /// and any blocked response write wakes with an abort verdict.
    pub fn abort(&mut self, error: ServerError) {
        let _ = self.body_tx.send(BodyEvent::Error(error));
        self.send_window.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reserve_takes_available_credit() {
        let window = SendWindow::new(100);
        assert_eq!(window.reserve(60).await, Some(60));
        assert_eq!(window.reserve(60).await, Some(40));
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn reserve_waits_for_replenish() {
        let window = Arc::new(SendWindow::new(0));
        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.reserve(10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.replenish(5);
        assert_eq!(waiter.await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_abort() {
        let window = Arc::new(SendWindow::new(0));
        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.reserve(10).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn reserve_exact_spans_multiple_grants() {
        let window = Arc::new(SendWindow::new(3));
        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.reserve_exact(10).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.replenish(4);
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.replenish(3);
        assert_eq!(waiter.await.unwrap(), Some(()));
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn settings_shrink_blocks_until_restored() {
        let window = SendWindow::new(10);
        window.adjust(-10);
        assert_eq!(window.available(), 0);
        window.replenish(4);
        assert_eq!(window.reserve(100).await, Some(4));
    }
}
