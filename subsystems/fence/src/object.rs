//! # Fence Completion Primitives
//!
//! [`FenceCore`] is the single underlying completion primitive a fence row
//! wraps: a monotonic state cell, a waiter event, and a watcher list fired
//! exactly once when the state turns terminal. Merged fences hold a vector
//! of shared cores; their state is derived on demand and never stored.

use std::sync::Arc;
use std::time::Instant;

use event_listener::{Event, Listener};
use spin::Mutex;

use crate::{FenceError, FenceResult};

// =============================================================================
// State
// =============================================================================

/// Signaling state of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Slot does not hold a live fence
    Invalid,
    /// Not yet signaled
    Active,
    /// Signaled, operation succeeded
    SignaledSuccess,
    /// Signaled, operation failed
    SignaledError,
}

impl FenceState {
    /// Whether the state is terminal (no further transitions)
    pub fn is_terminal(self) -> bool {
        matches!(self, FenceState::SignaledSuccess | FenceState::SignaledError)
    }
}

/// Derive the state of a merged group from its members.
///
/// Any member error wins; otherwise any active member keeps the group
/// active; the group succeeds only when every member succeeded.
pub fn group_state(members: &[Arc<FenceCore>]) -> FenceState {
    let mut active = 0usize;
    let mut success = 0usize;
    let mut error = 0usize;

    for core in members {
        match core.state() {
            FenceState::SignaledError | FenceState::Invalid => error += 1,
            FenceState::Active => active += 1,
            FenceState::SignaledSuccess => success += 1,
        }
    }

    log::debug!(
        "group state counts act:{} sig:{} err:{}",
        active,
        success,
        error
    );

    if error != 0 {
        FenceState::SignaledError
    } else if active != 0 {
        FenceState::Active
    } else if success == members.len() {
        FenceState::SignaledSuccess
    } else {
        FenceState::Invalid
    }
}

// =============================================================================
// Core Primitive
// =============================================================================

/// Watcher fired once with the terminal state
pub type Watcher = Box<dyn FnOnce(FenceState) + Send>;

/// One completion primitive shared by every fence row referencing it
pub struct FenceCore {
    state: Mutex<FenceState>,
    waiters: Event,
    watchers: Mutex<Vec<Watcher>>,
}

impl FenceCore {
    /// Create an active primitive
    pub fn new() -> Arc<Self> {
        Arc::new(FenceCore {
            state: Mutex::new(FenceState::Active),
            waiters: Event::new(),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Current state
    pub fn state(&self) -> FenceState {
        *self.state.lock()
    }

    /// Move to a terminal state exactly once.
    ///
    /// Wakes every waiter and fires all registered watchers. A second
    /// signal is rejected; the first result stands.
    pub fn signal(&self, result: FenceState) -> FenceResult<()> {
        debug_assert!(result.is_terminal());

        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return Err(FenceError::AlreadySignaled);
            }
            *state = result;
        }

        self.waiters.notify(usize::MAX);

        let watchers = core::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            watcher(result);
        }

        Ok(())
    }

    /// Register a watcher; fires immediately if already terminal.
    ///
    /// The state lock is held across registration so a concurrent signal
    /// cannot slip between the check and the push.
    pub fn watch(&self, watcher: Watcher) {
        let state = self.state.lock();
        if state.is_terminal() {
            let terminal = *state;
            drop(state);
            watcher(terminal);
        } else {
            self.watchers.lock().push(watcher);
            drop(state);
        }
    }

    /// Block until the primitive turns terminal or the deadline passes
    pub fn wait_deadline(&self, deadline: Instant) -> FenceResult<FenceState> {
        loop {
            let state = self.state();
            if state.is_terminal() {
                return Ok(state);
            }
            let listener = self.waiters.listen();
            let state = self.state();
            if state.is_terminal() {
                return Ok(state);
            }
            if listener.wait_deadline(deadline).is_none() {
                return Err(FenceError::Timeout);
            }
        }
    }
}

impl core::fmt::Debug for FenceCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FenceCore")
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_is_monotonic() {
        let core = FenceCore::new();
        assert_eq!(core.state(), FenceState::Active);
        core.signal(FenceState::SignaledSuccess).unwrap();
        assert_eq!(
            core.signal(FenceState::SignaledError),
            Err(FenceError::AlreadySignaled)
        );
        assert_eq!(core.state(), FenceState::SignaledSuccess);
    }

    #[test]
    fn watcher_fires_once_with_terminal_state() {
        let core = FenceCore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.watch(Box::new(move |state| sink.lock().push(state)));

        core.signal(FenceState::SignaledError).unwrap();
        assert_eq!(&*seen.lock(), &[FenceState::SignaledError]);

        // Late watcher on an already-terminal core fires immediately.
        let sink = Arc::clone(&seen);
        core.watch(Box::new(move |state| sink.lock().push(state)));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn wait_times_out_on_active_core() {
        let core = FenceCore::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(core.wait_deadline(deadline), Err(FenceError::Timeout));
    }

    #[test]
    fn wait_observes_cross_thread_signal() {
        let core = FenceCore::new();
        let signaler = Arc::clone(&core);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal(FenceState::SignaledSuccess).unwrap();
        });
        let state = core
            .wait_deadline(Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert_eq!(state, FenceState::SignaledSuccess);
        t.join().unwrap();
    }

    #[test]
    fn group_state_derivation() {
        let a = FenceCore::new();
        let b = FenceCore::new();
        let members = vec![Arc::clone(&a), Arc::clone(&b)];

        assert_eq!(group_state(&members), FenceState::Active);

        a.signal(FenceState::SignaledSuccess).unwrap();
        assert_eq!(group_state(&members), FenceState::Active);

        b.signal(FenceState::SignaledSuccess).unwrap();
        assert_eq!(group_state(&members), FenceState::SignaledSuccess);

        let c = FenceCore::new();
        let mixed = vec![Arc::clone(&a), Arc::clone(&c)];
        c.signal(FenceState::SignaledError).unwrap();
        assert_eq!(group_state(&mixed), FenceState::SignaledError);
    }
}
