//! # Fence Engine
//!
//! The public API of the fence subsystem: create, merge, signal, wait,
//! destroy, export/import, and the client subscription surface.
//!
//! Every underlying primitive carries a watcher per referencing row; when
//! a primitive turns terminal the watcher re-derives the row's state and,
//! once terminal, dispatches the row's pending kernel callbacks to the
//! work queue and moves its user payloads into each subscribing client's
//! event queue, waking every waiter. This keeps merged groups and imported
//! handles honest: whichever row references a primitive hears about it.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use event_listener::{Event, Listener};
use rand::Rng;

use crate::client::{ClientRegistry, FenceClient, FenceEvent};
use crate::object::{FenceCore, FenceState};
use crate::table::{
    CallbackRecord, FenceCallback, FenceTable, PayloadRecord, Row, RowKind, DEFAULT_CAPACITY,
};
use crate::work::CallbackQueue;
use crate::{ClientId, FenceError, FenceHandle, FenceResult, SecureKey};

// =============================================================================
// Engine
// =============================================================================

/// The fence subsystem instance
pub struct FenceEngine {
    shared: Arc<Shared>,
}

struct Shared {
    table: FenceTable,
    clients: ClientRegistry,
    workq: CallbackQueue,
}

impl FenceEngine {
    /// Create an engine with the default table capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an engine with `capacity` fence slots
    pub fn with_capacity(capacity: usize) -> Self {
        FenceEngine {
            shared: Arc::new(Shared {
                table: FenceTable::new(capacity),
                clients: ClientRegistry::new(),
                workq: CallbackQueue::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// Register (or find) the subscription context for a client
    pub fn register_client(&self, client: ClientId) -> Arc<FenceClient> {
        self.shared.clients.register(client)
    }

    /// Remove a client's subscription context
    pub fn unregister_client(&self, client: ClientId) {
        self.shared.clients.unregister(client);
    }

    /// Pop the oldest completion event for `client`, blocking up to `timeout`
    pub fn poll_events(&self, client: ClientId, timeout: Duration) -> FenceResult<FenceEvent> {
        let ctx = self
            .shared
            .clients
            .get(client)
            .ok_or(FenceError::InvalidArgument)?;
        ctx.poll_deadline(Instant::now() + timeout)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Create a new single fence owned by `client`
    pub fn create(&self, client: ClientId, name: &str) -> FenceResult<FenceHandle> {
        let core = FenceCore::new();
        self.shared
            .alloc_row(client, name, RowKind::Single(core))
    }

    /// Merge two or more fences into a new group fence.
    ///
    /// Existing groups are expanded into their members and exact duplicates
    /// are eliminated, releasing the duplicate's reference. Any invalid
    /// handle fails the whole operation and releases every reference
    /// acquired so far.
    pub fn merge(&self, client: ClientId, handles: &[FenceHandle]) -> FenceResult<FenceHandle> {
        if handles.len() <= 1 {
            log::error!("single fence merge is not allowed");
            return Err(FenceError::InvalidArgument);
        }

        let mut collected: Vec<Arc<FenceCore>> = Vec::new();
        for &handle in handles {
            match self.shared.with_owned_row(client, handle, |row| row.kind.clone()) {
                Ok(kind) => kind.collect_into(&mut collected),
                Err(err) => {
                    log::error!("invalid handle {} in merge", handle);
                    // dropping `collected` releases every reference taken
                    return Err(err);
                }
            }
        }

        let members = dedup_members(collected);
        self.shared
            .alloc_row(client, "merged", RowKind::Group(members))
    }

    /// Signal a single fence with a terminal state, exactly once.
    ///
    /// Groups cannot be signaled directly; their state is derived.
    pub fn signal(
        &self,
        client: ClientId,
        handle: FenceHandle,
        result: FenceState,
    ) -> FenceResult<()> {
        if !result.is_terminal() {
            return Err(FenceError::InvalidArgument);
        }

        let kind = self
            .shared
            .with_owned_row(client, handle, |row| row.kind.clone())?;
        let core = match kind {
            RowKind::Single(core) => core,
            RowKind::Group(_) => {
                log::error!("cannot signal merged fence {}", handle);
                return Err(FenceError::InvalidArgument);
            }
        };

        // The row lock is released here; watchers registered on the core
        // re-enter the table to dispatch callbacks and payloads.
        core.signal(result)
    }

    /// Current (derived) state of a fence
    pub fn status(&self, client: ClientId, handle: FenceHandle) -> FenceResult<FenceState> {
        self.shared.with_owned_row(client, handle, |row| row.kind.state())
    }

    /// Block until the fence reaches a terminal state or `timeout` passes
    pub fn wait(
        &self,
        client: ClientId,
        handle: FenceHandle,
        timeout: Duration,
    ) -> FenceResult<FenceState> {
        let (kind, notify) = self
            .shared
            .with_owned_row(client, handle, |row| {
                (row.kind.clone(), Arc::clone(&row.notify))
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            let state = kind.state();
            if state.is_terminal() {
                return Ok(state);
            }
            let listener = notify.listen();
            let state = kind.state();
            if state.is_terminal() {
                return Ok(state);
            }
            if listener.wait_deadline(deadline).is_none() {
                return Err(FenceError::Timeout);
            }
        }
    }

    /// Destroy a fence, releasing its slot.
    ///
    /// A clean teardown has no pending registrations; any found are freed
    /// and logged as a protocol anomaly. Member fences of a merged group
    /// keep their independent lifetime.
    pub fn destroy(&self, client: ClientId, handle: FenceHandle) -> FenceResult<()> {
        if !handle.owned_by(client) {
            return Err(FenceError::InvalidHandle);
        }
        let row = self
            .shared
            .table
            .remove_if(handle.slot(), |row| row.handle == handle)
            .ok_or(FenceError::InvalidHandle)?;

        for _ in &row.callbacks {
            log::error!("pending kernel callback at destroy of {}", handle);
        }
        for payload in &row.payloads {
            log::error!(
                "pending user payload (client {}) at destroy of {}",
                payload.client.0,
                handle
            );
        }

        log::debug!("destroyed fence {} ({})", handle, row.name);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cross-Client Sharing
    // -------------------------------------------------------------------------

    /// Bind (once) and return the secure key of a fence the caller owns
    pub fn export(&self, client: ClientId, handle: FenceHandle) -> FenceResult<SecureKey> {
        self.shared.with_owned_row(client, handle, |row| {
            if let Some(key) = row.secure_key {
                return key;
            }
            let mut rng = rand::rng();
            let mut key: u32 = rng.random();
            while key == 0 {
                key = rng.random();
            }
            row.secure_key = Some(key);
            key
        })
    }

    /// Resolve an exported fence by `(id, key)` and take a reference for
    /// the importing client, returning a handle of its own
    pub fn import(
        &self,
        client: ClientId,
        id: u32,
        key: SecureKey,
    ) -> FenceResult<FenceHandle> {
        let external = FenceHandle(id);
        let found = self
            .shared
            .table
            .with_row(external.slot(), |row| {
                if row.handle == external && row.secure_key == Some(key) {
                    Some((row.name.clone(), row.kind.clone()))
                } else {
                    None
                }
            })
            .flatten();

        let (name, kind) = match found {
            Some(entry) => entry,
            None => {
                log::error!("import of {:#010x} rejected", id);
                return Err(FenceError::InvalidHandle);
            }
        };

        self.shared.alloc_row(client, &name, kind)
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register a user payload delivered to `client`'s event queue when the
    /// fence signals. An already-terminal fence delivers immediately.
    pub fn register_payload(
        &self,
        client: ClientId,
        handle: FenceHandle,
        data: [u64; 2],
    ) -> FenceResult<()> {
        let ctx = self
            .shared
            .clients
            .get(client)
            .ok_or(FenceError::InvalidArgument)?;

        self.shared.with_owned_row(client, handle, |row| {
            let state = row.kind.state();
            if state.is_terminal() {
                ctx.push_event(FenceEvent {
                    handle,
                    state,
                    data,
                });
            } else {
                row.payloads.push(PayloadRecord { client, data });
            }
        })
    }

    /// Register a kernel callback fired on the work queue when the fence
    /// signals. An already-terminal fence dispatches immediately.
    pub fn register_callback(
        &self,
        client: ClientId,
        handle: FenceHandle,
        func: FenceCallback,
    ) -> FenceResult<()> {
        let shared = Arc::clone(&self.shared);
        self.shared.with_owned_row(client, handle, move |row| {
            let state = row.kind.state();
            if state.is_terminal() {
                shared.workq.queue(Box::new(move || func(handle, state)));
            } else {
                row.callbacks.push(CallbackRecord { func });
            }
        })
    }

    /// Number of live fences in the table
    pub fn live_count(&self) -> usize {
        self.shared.table.live_count()
    }
}

impl Default for FenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Shared Internals
// =============================================================================

impl Shared {
    /// Allocate a slot, install the row, and hook watchers on every
    /// underlying primitive so dispatch happens whichever timeline signals.
    fn alloc_row(
        self: &Arc<Self>,
        client: ClientId,
        name: &str,
        kind: RowKind,
    ) -> FenceResult<FenceHandle> {
        let slot = self.table.alloc_slot()?;
        let handle = FenceHandle::compose(client, slot);

        let cores = kind.cores();
        self.table.install(
            slot,
            Row {
                handle,
                name: String::from(name),
                kind,
                notify: Arc::new(Event::new()),
                secure_key: None,
                callbacks: Vec::new(),
                payloads: Vec::new(),
                dispatched: false,
            },
        );

        for core in cores {
            let weak: Weak<Shared> = Arc::downgrade(self);
            core.watch(Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_primitive_signaled(handle);
                }
            }));
        }

        log::debug!("fence {} ({}) created", handle, name);
        Ok(handle)
    }

    /// Validate ownership and run `f` on the live row behind `handle`
    fn with_owned_row<R>(
        &self,
        client: ClientId,
        handle: FenceHandle,
        f: impl FnOnce(&mut Row) -> R,
    ) -> FenceResult<R> {
        if !handle.owned_by(client) {
            log::error!(
                "client {} does not own fence handle {}",
                client.0,
                handle
            );
            return Err(FenceError::InvalidHandle);
        }
        self.table
            .with_row(handle.slot(), |row| {
                if row.handle == handle {
                    Some(f(row))
                } else {
                    None
                }
            })
            .flatten()
            .ok_or(FenceError::InvalidHandle)
    }

    /// A primitive referenced by `handle`'s row turned terminal: wake the
    /// row's waiters and, if the row state is now terminal, dispatch its
    /// pending records exactly once.
    fn on_primitive_signaled(&self, handle: FenceHandle) {
        let mut callbacks = Vec::new();
        let mut payloads = Vec::new();
        let mut state = FenceState::Invalid;

        let notify = self.table.with_row(handle.slot(), |row| {
            if row.handle != handle {
                return None;
            }
            state = row.kind.state();
            if state.is_terminal() && !row.dispatched {
                row.dispatched = true;
                callbacks = core::mem::take(&mut row.callbacks);
                payloads = core::mem::take(&mut row.payloads);
            }
            Some(Arc::clone(&row.notify))
        });

        let notify = match notify.flatten() {
            Some(notify) => notify,
            None => {
                log::debug!("primitive signaled after row {} was destroyed", handle);
                return;
            }
        };

        notify.notify(usize::MAX);

        for record in callbacks {
            let func = record.func;
            self.workq.queue(Box::new(move || func(handle, state)));
        }

        for record in payloads {
            match self.clients.get(record.client) {
                Some(client) => client.push_event(FenceEvent {
                    handle,
                    state,
                    data: record.data,
                }),
                None => log::warn!(
                    "dropping fence payload for unregistered client {}",
                    record.client.0
                ),
            }
        }
    }
}

/// Order-preserving exact-match dedup; dropping a duplicate releases the
/// extra reference taken during collection.
fn dedup_members(collected: Vec<Arc<FenceCore>>) -> Vec<Arc<FenceCore>> {
    let mut out: Vec<Arc<FenceCore>> = Vec::with_capacity(collected.len());
    for core in collected {
        if out.iter().any(|kept| Arc::ptr_eq(kept, &core)) {
            log::debug!("duplicate member eliminated at merge");
            continue;
        }
        out.push(core);
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;

    const CLIENT: ClientId = ClientId(0x11);
    const OTHER: ClientId = ClientId(0x22);

    fn engine() -> FenceEngine {
        let engine = FenceEngine::with_capacity(64);
        engine.register_client(CLIENT);
        engine.register_client(OTHER);
        engine
    }

    #[test]
    fn create_signal_wait() {
        let engine = engine();
        let fence = engine.create(CLIENT, "a").unwrap();
        assert_eq!(engine.status(CLIENT, fence).unwrap(), FenceState::Active);

        engine
            .signal(CLIENT, fence, FenceState::SignaledSuccess)
            .unwrap();
        let state = engine
            .wait(CLIENT, fence, Duration::from_secs(1))
            .unwrap();
        assert_eq!(state, FenceState::SignaledSuccess);
    }

    #[test]
    fn double_signal_rejected_first_result_stands() {
        let engine = engine();
        let fence = engine.create(CLIENT, "a").unwrap();
        engine
            .signal(CLIENT, fence, FenceState::SignaledError)
            .unwrap();
        assert_eq!(
            engine.signal(CLIENT, fence, FenceState::SignaledSuccess),
            Err(FenceError::AlreadySignaled)
        );
        assert_eq!(
            engine.status(CLIENT, fence).unwrap(),
            FenceState::SignaledError
        );
    }

    #[test]
    fn foreign_handle_is_not_found() {
        let engine = engine();
        let fence = engine.create(CLIENT, "a").unwrap();
        assert_eq!(
            engine.status(OTHER, fence),
            Err(FenceError::InvalidHandle)
        );
        assert_eq!(
            engine.signal(OTHER, fence, FenceState::SignaledSuccess),
            Err(FenceError::InvalidHandle)
        );
    }

    #[test]
    fn merge_rejects_fewer_than_two() {
        let engine = engine();
        let fence = engine.create(CLIENT, "a").unwrap();
        assert_eq!(
            engine.merge(CLIENT, &[]),
            Err(FenceError::InvalidArgument)
        );
        assert_eq!(
            engine.merge(CLIENT, &[fence]),
            Err(FenceError::InvalidArgument)
        );
    }

    #[test]
    fn merge_distinct_keeps_count() {
        let engine = engine();
        let a = engine.create(CLIENT, "a").unwrap();
        let b = engine.create(CLIENT, "b").unwrap();
        let c = engine.create(CLIENT, "c").unwrap();
        let group = engine.merge(CLIENT, &[a, b, c]).unwrap();

        let count = engine
            .shared
            .with_owned_row(CLIENT, group, |row| row.kind.member_count())
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn merge_eliminates_duplicates() {
        let engine = engine();
        let a = engine.create(CLIENT, "a").unwrap();
        let b = engine.create(CLIENT, "b").unwrap();
        let group = engine.merge(CLIENT, &[a, b, a]).unwrap();

        let count = engine
            .shared
            .with_owned_row(CLIENT, group, |row| row.kind.member_count())
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn merge_expands_existing_groups() {
        let engine = engine();
        let a = engine.create(CLIENT, "a").unwrap();
        let b = engine.create(CLIENT, "b").unwrap();
        let c = engine.create(CLIENT, "c").unwrap();
        let inner = engine.merge(CLIENT, &[a, b]).unwrap();
        let outer = engine.merge(CLIENT, &[inner, c]).unwrap();

        // inner's members plus c, with a/b deduplicated against inner
        let count = engine
            .shared
            .with_owned_row(CLIENT, outer, |row| row.kind.member_count())
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn merge_rolls_back_on_invalid_handle() {
        let engine = engine();
        let a = engine.create(CLIENT, "a").unwrap();
        let bogus = FenceHandle::compose(CLIENT, 63);
        assert_eq!(
            engine.merge(CLIENT, &[a, bogus]),
            Err(FenceError::InvalidHandle)
        );
        // `a` is untouched and still usable
        engine
            .signal(CLIENT, a, FenceState::SignaledSuccess)
            .unwrap();
    }

    #[test]
    fn group_state_follows_members() {
        let engine = engine();
        let a = engine.create(CLIENT, "a").unwrap();
        let b = engine.create(CLIENT, "b").unwrap();
        let group = engine.merge(CLIENT, &[a, b]).unwrap();

        assert_eq!(engine.status(CLIENT, group).unwrap(), FenceState::Active);

        engine
            .signal(CLIENT, a, FenceState::SignaledSuccess)
            .unwrap();
        assert_eq!(engine.status(CLIENT, group).unwrap(), FenceState::Active);

        engine
            .signal(CLIENT, b, FenceState::SignaledError)
            .unwrap();
        assert_eq!(
            engine.status(CLIENT, group).unwrap(),
            FenceState::SignaledError
        );
    }

    #[test]
    fn group_cannot_be_signaled() {
        let engine = engine();
        let a = engine.create(CLIENT, "a").unwrap();
        let b = engine.create(CLIENT, "b").unwrap();
        let group = engine.merge(CLIENT, &[a, b]).unwrap();
        assert_eq!(
            engine.signal(CLIENT, group, FenceState::SignaledSuccess),
            Err(FenceError::InvalidArgument)
        );
    }

    #[test]
    fn group_wait_wakes_on_last_member() {
        let engine = Arc::new(engine());
        let a = engine.create(CLIENT, "a").unwrap();
        let b = engine.create(CLIENT, "b").unwrap();
        let group = engine.merge(CLIENT, &[a, b]).unwrap();

        let signaler = Arc::clone(&engine);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler
                .signal(CLIENT, a, FenceState::SignaledSuccess)
                .unwrap();
            std::thread::sleep(Duration::from_millis(10));
            signaler
                .signal(CLIENT, b, FenceState::SignaledSuccess)
                .unwrap();
        });

        let state = engine
            .wait(CLIENT, group, Duration::from_secs(5))
            .unwrap();
        assert_eq!(state, FenceState::SignaledSuccess);
        t.join().unwrap();
    }

    #[test]
    fn destroy_frees_slot_members_survive() {
        let engine = engine();
        let a = engine.create(CLIENT, "a").unwrap();
        let b = engine.create(CLIENT, "b").unwrap();
        let group = engine.merge(CLIENT, &[a, b]).unwrap();

        engine.destroy(CLIENT, group).unwrap();
        assert_eq!(
            engine.status(CLIENT, group),
            Err(FenceError::InvalidHandle)
        );

        // members keep independent lifetime
        engine
            .signal(CLIENT, a, FenceState::SignaledSuccess)
            .unwrap();
        assert_eq!(
            engine.status(CLIENT, b).unwrap(),
            FenceState::Active
        );
    }

    #[test]
    fn export_import_roundtrip() {
        let engine = engine();
        let fence = engine.create(CLIENT, "shared").unwrap();
        let key = engine.export(CLIENT, fence).unwrap();
        // export is bind-once
        assert_eq!(engine.export(CLIENT, fence).unwrap(), key);

        let imported = engine.import(OTHER, fence.0, key).unwrap();
        assert!(imported.owned_by(OTHER));
        assert_eq!(
            engine.status(OTHER, imported).unwrap(),
            FenceState::Active
        );

        // signaling through the original handle is visible on the import
        engine
            .signal(CLIENT, fence, FenceState::SignaledSuccess)
            .unwrap();
        assert_eq!(
            engine.status(OTHER, imported).unwrap(),
            FenceState::SignaledSuccess
        );
    }

    #[test]
    fn import_with_wrong_key_rejected() {
        let engine = engine();
        let fence = engine.create(CLIENT, "shared").unwrap();
        let key = engine.export(CLIENT, fence).unwrap();
        assert_eq!(
            engine.import(OTHER, fence.0, key.wrapping_add(1)),
            Err(FenceError::InvalidHandle)
        );
        // un-exported fences cannot be imported at all
        let private = engine.create(CLIENT, "private").unwrap();
        assert_eq!(
            engine.import(OTHER, private.0, 0),
            Err(FenceError::InvalidHandle)
        );
    }

    #[test]
    fn payload_delivery_on_signal() {
        let engine = engine();
        let fence = engine.create(CLIENT, "a").unwrap();
        engine
            .register_payload(CLIENT, fence, [7, 8])
            .unwrap();

        engine
            .signal(CLIENT, fence, FenceState::SignaledSuccess)
            .unwrap();

        let event = engine
            .poll_events(CLIENT, Duration::from_secs(1))
            .unwrap();
        assert_eq!(event.handle, fence);
        assert_eq!(event.state, FenceState::SignaledSuccess);
        assert_eq!(event.data, [7, 8]);
    }

    #[test]
    fn payload_on_terminal_fence_delivers_immediately() {
        let engine = engine();
        let fence = engine.create(CLIENT, "a").unwrap();
        engine
            .signal(CLIENT, fence, FenceState::SignaledError)
            .unwrap();

        engine
            .register_payload(CLIENT, fence, [1, 2])
            .unwrap();
        let event = engine
            .poll_events(CLIENT, Duration::from_secs(1))
            .unwrap();
        assert_eq!(event.state, FenceState::SignaledError);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let engine = engine();
        let fence = engine.create(CLIENT, "a").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let sink = Arc::clone(&seen);
            engine
                .register_callback(
                    CLIENT,
                    fence,
                    Box::new(move |_, state| {
                        assert!(state.is_terminal());
                        sink.lock().push(i);
                    }),
                )
                .unwrap();
        }

        engine
            .signal(CLIENT, fence, FenceState::SignaledSuccess)
            .unwrap();

        // wait for the work queue to drain
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().len() < 4 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(&*seen.lock(), &[0, 1, 2, 3]);
    }
}
