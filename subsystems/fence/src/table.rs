//! # Fence Slot Table
//!
//! Arena of fence rows with an occupancy bitmap. Each row is guarded by its
//! own lock so signal dispatch on one fence never contends with lookups of
//! another. Slot 0 is reserved so a zero handle never resolves.

use std::sync::Arc;

use event_listener::Event;
use spin::Mutex;

use crate::object::{group_state, FenceCore, FenceState};
use crate::{ClientId, FenceError, FenceHandle, FenceResult, SecureKey};

/// Default number of slots in the fence table
pub const DEFAULT_CAPACITY: usize = 512;

/// Hard ceiling imposed by the 16-bit slot field of a handle
pub const MAX_CAPACITY: usize = 1 << 16;

// =============================================================================
// Row Contents
// =============================================================================

/// Kernel callback fired on the work queue with the terminal state
pub type FenceCallback = Box<dyn FnOnce(FenceHandle, FenceState) + Send>;

/// Pending kernel callback registration
pub struct CallbackRecord {
    /// The callback to fire
    pub func: FenceCallback,
}

/// Pending user payload registration
#[derive(Debug, Clone, Copy)]
pub struct PayloadRecord {
    /// Subscribing client
    pub client: ClientId,
    /// Opaque payload returned with the completion event
    pub data: [u64; 2],
}

/// The completion primitives a row wraps
#[derive(Clone)]
pub enum RowKind {
    /// A single primitive
    Single(Arc<FenceCore>),
    /// A merged group; state derived from the members
    Group(Vec<Arc<FenceCore>>),
}

impl RowKind {
    /// Current (possibly derived) state
    pub fn state(&self) -> FenceState {
        match self {
            RowKind::Single(core) => core.state(),
            RowKind::Group(members) => group_state(members),
        }
    }

    /// Append one reference per underlying primitive, expanding groups
    pub fn collect_into(&self, out: &mut Vec<Arc<FenceCore>>) {
        match self {
            RowKind::Single(core) => out.push(Arc::clone(core)),
            RowKind::Group(members) => out.extend(members.iter().cloned()),
        }
    }

    /// References to every underlying primitive
    pub fn cores(&self) -> Vec<Arc<FenceCore>> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    /// Number of underlying primitives
    pub fn member_count(&self) -> usize {
        match self {
            RowKind::Single(_) => 1,
            RowKind::Group(members) => members.len(),
        }
    }

    /// Whether this row wraps a merged group
    pub fn is_group(&self) -> bool {
        matches!(self, RowKind::Group(_))
    }
}

/// One live fence
pub struct Row {
    /// The full handle this row was created under; compared on every
    /// lookup so a stale handle cannot alias a reused slot
    pub handle: FenceHandle,
    /// Diagnostic name
    pub name: String,
    /// Underlying primitives
    pub kind: RowKind,
    /// Waiter wakeup for this row (members notify it through watchers)
    pub notify: Arc<Event>,
    /// Key bound at export time, if any
    pub secure_key: Option<SecureKey>,
    /// Kernel callbacks awaiting the terminal state
    pub callbacks: Vec<CallbackRecord>,
    /// User payloads awaiting the terminal state
    pub payloads: Vec<PayloadRecord>,
    /// Records already handed off to dispatch
    pub dispatched: bool,
}

// =============================================================================
// Table
// =============================================================================

/// Slot arena with occupancy bitmap
pub struct FenceTable {
    rows: Vec<Mutex<Option<Row>>>,
    bitmap: Mutex<Vec<u64>>,
}

impl FenceTable {
    /// Create a table with `capacity` slots (slot 0 stays reserved)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(2, MAX_CAPACITY);
        let mut rows = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            rows.push(Mutex::new(None));
        }
        let words = capacity.div_ceil(64);
        let mut bitmap = vec![0u64; words];
        bitmap[0] |= 1; // slot 0 reserved
        FenceTable {
            rows,
            bitmap: Mutex::new(bitmap),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    /// Claim a free slot
    pub fn alloc_slot(&self) -> FenceResult<usize> {
        let mut bitmap = self.bitmap.lock();
        for (word_idx, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let slot = word_idx * 64 + bit;
            if slot >= self.rows.len() {
                break;
            }
            *word |= 1u64 << bit;
            return Ok(slot);
        }
        log::error!("fence table exhausted ({} slots)", self.rows.len());
        Err(FenceError::Exhausted)
    }

    /// Install a row into a previously claimed slot
    pub fn install(&self, slot: usize, row: Row) {
        let mut guard = self.rows[slot].lock();
        debug_assert!(guard.is_none());
        *guard = Some(row);
    }

    /// Run `f` against the live row in `slot`, if any
    pub fn with_row<R>(&self, slot: usize, f: impl FnOnce(&mut Row) -> R) -> Option<R> {
        let mut guard = self.rows.get(slot)?.lock();
        guard.as_mut().map(f)
    }

    /// Remove the row in `slot` if `check` accepts it, releasing the slot
    pub fn remove_if(&self, slot: usize, check: impl FnOnce(&Row) -> bool) -> Option<Row> {
        let row_slot = self.rows.get(slot)?;
        let mut guard = row_slot.lock();
        let accepted = match guard.as_ref() {
            Some(row) => check(row),
            None => false,
        };
        if !accepted {
            return None;
        }
        let row = guard.take();
        drop(guard);

        let mut bitmap = self.bitmap.lock();
        bitmap[slot / 64] &= !(1u64 << (slot % 64));
        row
    }

    /// Number of occupied slots (excluding the reserved one)
    pub fn live_count(&self) -> usize {
        let bitmap = self.bitmap.lock();
        bitmap.iter().map(|w| w.count_ones() as usize).sum::<usize>() - 1
    }
}

// =============================================================================
// Tests
// =============================================================================
