//! # Completion Signals
//!
//! A [`Completion`] is a reusable single-slot signal receipt: the producer
//! deposits a status code, exactly one waiter consumes it. Session signal
//! receipts and the DSP link's shared per-call-type completions are built
//! on it. Callers that reuse a completion across calls must serialize
//! themselves (the DSP link holds a call mutex for this) and [`reset`] the
//! slot before issuing the next request.
//!
//! [`reset`]: Completion::reset

use std::time::Instant;

use event_listener::{Event, Listener};
use spin::Mutex;

use crate::error::{CoreError, CoreResult};

/// Single-slot completion with an i32 status payload
pub struct Completion {
    slot: Mutex<Option<i32>>,
    done: Event,
}

impl Completion {
    /// Create an empty completion
    pub fn new() -> Self {
        Completion {
            slot: Mutex::new(None),
            done: Event::new(),
        }
    }

    /// Deposit a status and wake every waiter.
    ///
    /// A second deposit before the first is consumed overwrites it; the
    /// call protocols built on top never issue two outstanding requests
    /// against one completion.
    pub fn complete(&self, status: i32) {
        *self.slot.lock() = Some(status);
        self.done.notify(usize::MAX);
    }

    /// Consume the deposited status, if any
    pub fn try_take(&self) -> Option<i32> {
        self.slot.lock().take()
    }

    /// Discard any stale deposit before issuing a new request
    pub fn reset(&self) {
        *self.slot.lock() = None;
    }

    /// Block until a status is deposited or the deadline passes
    pub fn wait_deadline(&self, deadline: Instant) -> CoreResult<i32> {
        loop {
            if let Some(status) = self.try_take() {
                return Ok(status);
            }
            let listener = self.done.listen();
            if let Some(status) = self.try_take() {
                return Ok(status);
            }
            if listener.wait_deadline(deadline).is_none() {
                return Err(CoreError::Timeout);
            }
        }
    }

    /// Block until a status is deposited, without bound.
    ///
    /// Used only on the DSP register/deregister path, where the protocol
    /// assumes the remote side always eventually responds.
    pub fn wait(&self) -> i32 {
        loop {
            if let Some(status) = self.try_take() {
                return status;
            }
            let listener = self.done.listen();
            if let Some(status) = self.try_take() {
                return status;
            }
            listener.wait();
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Completion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.slot.lock().is_some())
            .finish()
    }
}
