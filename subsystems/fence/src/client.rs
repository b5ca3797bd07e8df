//! # Fence Clients
//!
//! One [`FenceClient`] exists per subscribing process, found by process
//! identity. A client owns an event queue of completed-payload records and
//! a wait queue for blocking reads; it outlives the individual fences it
//! has registered against.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use event_listener::{Event, Listener};
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::object::FenceState;
use crate::{ClientId, FenceError, FenceHandle, FenceResult};

/// One completed-payload record delivered to a subscribing client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceEvent {
    /// The fence that signaled
    pub handle: FenceHandle,
    /// Terminal state observed at dispatch
    pub state: FenceState,
    /// Payload supplied at registration
    pub data: [u64; 2],
}

/// Per-process subscription context
pub struct FenceClient {
    id: ClientId,
    eventq: Mutex<VecDeque<FenceEvent>>,
    wq: Event,
}

impl FenceClient {
    fn new(id: ClientId) -> Self {
        FenceClient {
            id,
            eventq: Mutex::new(VecDeque::new()),
            wq: Event::new(),
        }
    }

    /// Client identity
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Deposit one completion event and wake every blocked reader.
    ///
    /// Payloads can be registered by multiple clients against one fence, so
    /// the wakeup is a broadcast.
    pub fn push_event(&self, event: FenceEvent) {
        self.eventq.lock().push_back(event);
        self.wq.notify(usize::MAX);
    }

    /// Pop the oldest completion event, blocking until the deadline
    pub fn poll_deadline(&self, deadline: Instant) -> FenceResult<FenceEvent> {
        loop {
            if let Some(event) = self.eventq.lock().pop_front() {
                return Ok(event);
            }
            let listener = self.wq.listen();
            if let Some(event) = self.eventq.lock().pop_front() {
                return Ok(event);
            }
            if listener.wait_deadline(deadline).is_none() {
                return Err(FenceError::Timeout);
            }
        }
    }

    /// Number of undelivered completion events
    pub fn pending(&self) -> usize {
        self.eventq.lock().len()
    }
}

/// Registry of all subscribing clients, keyed by process identity
pub struct ClientRegistry {
    clients: RwLock<HashMap<u32, Arc<FenceClient>>>,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        ClientRegistry {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Find or create the client context for `id`
    pub fn register(&self, id: ClientId) -> Arc<FenceClient> {
        if let Some(client) = self.clients.read().get(&id.0) {
            return Arc::clone(client);
        }
        let mut clients = self.clients.write();
        Arc::clone(
            clients
                .entry(id.0)
                .or_insert_with(|| Arc::new(FenceClient::new(id))),
        )
    }

    /// Look up an existing client context
    pub fn get(&self, id: ClientId) -> Option<Arc<FenceClient>> {
        self.clients.read().get(&id.0).map(Arc::clone)
    }

    /// Drop a client context; undelivered events are discarded with a note
    pub fn unregister(&self, id: ClientId) {
        if let Some(client) = self.clients.write().remove(&id.0) {
            let pending = client.pending();
            if pending != 0 {
                log::warn!(
                    "client {} unregistered with {} undelivered fence events",
                    id.0,
                    pending
                );
            }
        }
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no client is registered
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl Default for ClientRegistry {
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
    use std::time::Duration;

    fn event(slot: usize) -> FenceEvent {
        FenceEvent {
            handle: FenceHandle::compose(ClientId(1), slot),
            state: FenceState::SignaledSuccess,
            data: [slot as u64, 0],
        }
    }

    #[test]
    fn events_are_fifo() {
        let client = FenceClient::new(ClientId(1));
        client.push_event(event(1));
        client.push_event(event(2));

        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(client.poll_deadline(deadline).unwrap().data[0], 1);
        assert_eq!(client.poll_deadline(deadline).unwrap().data[0], 2);
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn poll_times_out_when_empty() {
        let client = FenceClient::new(ClientId(1));
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(client.poll_deadline(deadline), Err(FenceError::Timeout));
    }

    #[test]
    fn poll_wakes_on_cross_thread_push() {
        let client = Arc::new(FenceClient::new(ClientId(1)));
        let pusher = Arc::clone(&client);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            pusher.push_event(event(9));
        });
        let got = client
            .poll_deadline(Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert_eq!(got.data[0], 9);
        t.join().unwrap();
    }

    #[test]
    fn registry_register_is_idempotent() {
        let registry = ClientRegistry::new();
        let a = registry.register(ClientId(7));
        let b = registry.register(ClientId(7));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.unregister(ClientId(7));
        assert!(registry.get(ClientId(7)).is_none());
        assert!(registry.is_empty());
    }
}
