//! # Session Message Queue
//!
//! Per-session FIFO of asynchronous completion messages posted by the
//! engine, drained by blocking receive calls. Queue state and count sit
//! behind one fine-grained lock because posting happens on the firmware
//! callback path.
//!
//! The receive contract distinguishes four outcomes: a message, a timeout
//! (try again), a stopped queue with residual messages (the pending count
//! is reported, not silently discarded), and a stopped-and-empty queue
//! (nothing more will ever arrive).

use std::collections::VecDeque;
use std::time::Instant;

use event_listener::{Event, Listener};
use prism_hal::MsgPacket;
use spin::Mutex;

use crate::error::{CoreError, CoreResult};

/// Delivery state of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Created, never started; posts are rejected
    Init,
    /// Accepting posts and receives
    Active,
    /// Stopped; receivers drain the distinct error outcomes
    Stopped,
}

struct QueueInner {
    state: QueueState,
    msgs: VecDeque<Box<MsgPacket>>,
}

/// Per-session FIFO with blocking receive
pub struct SessionQueue {
    inner: Mutex<QueueInner>,
    wq: Event,
}

impl SessionQueue {
    /// Create a queue in the `Init` state
    pub fn new() -> Self {
        SessionQueue {
            inner: Mutex::new(QueueInner {
                state: QueueState::Init,
                msgs: VecDeque::new(),
            }),
            wq: Event::new(),
        }
    }

    /// Current delivery state
    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Undelivered message count
    pub fn pending(&self) -> usize {
        self.inner.lock().msgs.len()
    }

    /// Activate delivery. Residual undelivered messages indicate a
    /// protocol violation and fail the start.
    pub fn start(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.msgs.is_empty() {
            log::error!(
                "queue start failed, {} messages pending",
                inner.msgs.len()
            );
            return Err(CoreError::InvalidState);
        }
        inner.state = QueueState::Active;
        Ok(())
    }

    /// Stop delivery and wake every blocked receiver. Fails with the
    /// pending count if messages are still queued.
    pub fn stop(&self) -> CoreResult<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.msgs.is_empty() {
                let pending = inner.msgs.len() as u32;
                log::error!("queue stop incorrect, {} messages pending", pending);
                return Err(CoreError::UncleanQueue { pending });
            }
            inner.state = QueueState::Stopped;
        }
        self.wq.notify(usize::MAX);
        Ok(())
    }

    /// Unconditional stop for teardown: transitions the queue, wakes all
    /// receivers, and reports how many messages were dropped.
    pub fn force_stop(&self) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.state = QueueState::Stopped;
            inner.msgs.len()
        };
        self.wq.notify(usize::MAX);
        if dropped != 0 {
            log::warn!("queue stopped with {} undelivered messages", dropped);
        }
        dropped
    }

    /// Drop all pending messages after a force stop, reporting the count
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.msgs.len();
        inner.msgs.clear();
        count
    }

    /// Deposit one message; only an active queue accepts posts
    pub fn post(&self, msg: Box<MsgPacket>) -> CoreResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != QueueState::Active {
                log::debug!("dropping message posted to inactive queue");
                return Err(CoreError::InvalidState);
            }
            inner.msgs.push_back(msg);
        }
        self.wq.notify(1);
        Ok(())
    }

    /// Pop the oldest message, blocking until `deadline`.
    ///
    /// An elapsed timeout leaves the queue untouched. A stopped queue
    /// reports [`CoreError::UncleanQueue`] while messages remain, then
    /// [`CoreError::Drained`] once empty.
    pub fn receive(&self, deadline: Instant) -> CoreResult<Box<MsgPacket>> {
        loop {
            if let Some(outcome) = self.try_receive() {
                return outcome;
            }
            let listener = self.wq.listen();
            if let Some(outcome) = self.try_receive() {
                return outcome;
            }
            if listener.wait_deadline(deadline).is_none() {
                log::debug!("session queue wait timeout");
                return Err(CoreError::Timeout);
            }
        }
    }

    /// One non-blocking receive attempt; `None` means keep waiting
    fn try_receive(&self) -> Option<CoreResult<Box<MsgPacket>>> {
        let mut inner = self.inner.lock();
        if inner.state != QueueState::Active {
            let pending = inner.msgs.len() as u32;
            return Some(if pending != 0 {
                Err(CoreError::UncleanQueue { pending })
            } else {
                Err(CoreError::Drained)
            });
        }
        inner.msgs.pop_front().map(Ok)
    }
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg(kind: u32) -> Box<MsgPacket> {
        Box::new(MsgPacket::new(kind))
    }

    #[test]
    fn post_requires_active_queue() {
        let queue = SessionQueue::new();
        assert_eq!(queue.post(msg(1)), Err(CoreError::InvalidState));
        queue.start().unwrap();
        queue.post(msg(1)).unwrap();
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn receive_is_fifo() {
        let queue = SessionQueue::new();
        queue.start().unwrap();
        queue.post(msg(1)).unwrap();
        queue.post(msg(2)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(queue.receive(deadline).unwrap().kind(), 1);
        assert_eq!(queue.receive(deadline).unwrap().kind(), 2);
    }

    #[test]
    fn receive_times_out_without_mutating() {
        let queue = SessionQueue::new();
        queue.start().unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(queue.receive(deadline), Err(CoreError::Timeout));
        assert_eq!(queue.state(), QueueState::Active);
    }

    #[test]
    fn stop_rejected_while_messages_pending() {
        let queue = SessionQueue::new();
        queue.start().unwrap();
        queue.post(msg(1)).unwrap();
        queue.post(msg(2)).unwrap();
        assert_eq!(queue.stop(), Err(CoreError::UncleanQueue { pending: 2 }));
        // still active; drain then stop
        let deadline = Instant::now() + Duration::from_secs(1);
        queue.receive(deadline).unwrap();
        queue.receive(deadline).unwrap();
        queue.stop().unwrap();
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[test]
    fn stop_then_start_leaves_queue_empty_and_active() {
        let queue = SessionQueue::new();
        queue.start().unwrap();
        queue.stop().unwrap();
        queue.start().unwrap();
        assert_eq!(queue.state(), QueueState::Active);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn start_rejected_with_residual_messages() {
        let queue = SessionQueue::new();
        queue.start().unwrap();
        queue.post(msg(1)).unwrap();
        queue.force_stop();
        assert_eq!(queue.start(), Err(CoreError::InvalidState));
    }

    #[test]
    fn receive_distinguishes_unclean_from_drained() {
        let queue = SessionQueue::new();
        queue.start().unwrap();
        queue.post(msg(1)).unwrap();
        queue.post(msg(2)).unwrap();
        queue.post(msg(3)).unwrap();
        assert_eq!(queue.force_stop(), 3);

        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            queue.receive(deadline),
            Err(CoreError::UncleanQueue { pending: 3 })
        );

        assert_eq!(queue.drain(), 3);
        assert_eq!(queue.receive(deadline), Err(CoreError::Drained));
    }

    #[test]
    fn force_stop_wakes_blocked_receiver() {
        let queue = Arc::new(SessionQueue::new());
        queue.start().unwrap();

        let receiver = Arc::clone(&queue);
        let t = std::thread::spawn(move || {
            receiver.receive(Instant::now() + Duration::from_secs(10))
        });

        std::thread::sleep(Duration::from_millis(20));
        queue.force_stop();
        assert_eq!(t.join().unwrap(), Err(CoreError::Drained));
    }
}
