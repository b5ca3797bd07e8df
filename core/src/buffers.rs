//! # Buffer Registries
//!
//! Each session tracks externally supplied buffers in two independent
//! registries keyed by the client's raw handle: the CPU path, populated on
//! first reference inside a command packet, and the DSP path, populated by
//! explicit register calls and additionally carrying a remote registration
//! index. An entry lives in at most one registry, and the size recorded at
//! map time must match the size requested on every later lookup.

use hashbrown::HashMap;
use prism_hal::{DeviceAddr, MapFlags, RawHandle};
use spin::Mutex;

use crate::error::{CoreError, CoreResult};

/// Client-supplied parameters for an explicit register/unregister call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferParams {
    /// External buffer handle
    pub raw: RawHandle,
    /// Buffer size in bytes
    pub size: u32,
    /// Deprecated; must be zero
    pub offset: u32,
    /// Remote DSP registration index; zero selects the deprecated CPU
    /// no-op path
    pub index: u32,
    /// Mapping flags
    pub flags: MapFlags,
}

/// One mapped buffer owned by a session registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferEntry {
    /// External handle this entry is keyed by
    pub raw: RawHandle,
    /// Size recorded at map time
    pub size: u32,
    /// Mapped device address
    pub device_addr: DeviceAddr,
    /// Mapping flags
    pub flags: MapFlags,
    /// Remote registration index, zero for CPU-path entries
    pub dsp_index: u32,
}

/// Mutex-guarded map of live entries keyed by raw handle
pub struct BufferRegistry {
    name: &'static str,
    entries: Mutex<HashMap<RawHandle, BufferEntry>>,
}

impl BufferRegistry {
    /// Create an empty registry; `name` shows up in diagnostics
    pub fn new(name: &'static str) -> Self {
        BufferRegistry {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `raw` has a live entry
    pub fn contains(&self, raw: RawHandle) -> bool {
        self.entries.lock().contains_key(&raw)
    }

    /// Look up `raw`, insisting the recorded size matches `size`.
    ///
    /// A missing entry is [`CoreError::NoEntry`] so resolution can map on
    /// demand; a size mismatch is an error, never an auto-correction.
    pub fn lookup(&self, raw: RawHandle, size: u32) -> CoreResult<BufferEntry> {
        let entries = self.entries.lock();
        let entry = entries.get(&raw).ok_or(CoreError::NoEntry)?;
        if entry.size != size {
            log::error!(
                "{}: size mismatch for handle {}: mapped {:#x} requested {:#x}",
                self.name,
                raw,
                entry.size,
                size
            );
            return Err(CoreError::InvalidArgument);
        }
        Ok(*entry)
    }

    /// Fetch an entry without size validation
    pub fn get(&self, raw: RawHandle) -> Option<BufferEntry> {
        self.entries.lock().get(&raw).copied()
    }

    /// Insert a new entry; duplicates are rejected
    pub fn insert(&self, entry: BufferEntry) -> CoreResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.raw) {
            log::error!("{}: duplicate handle {}", self.name, entry.raw);
            return Err(CoreError::InvalidArgument);
        }
        entries.insert(entry.raw, entry);
        Ok(())
    }

    /// Remove and return the entry for `raw`
    pub fn remove(&self, raw: RawHandle) -> Option<BufferEntry> {
        self.entries.lock().remove(&raw)
    }

    /// Remove every entry, for the teardown sweep
    pub fn drain(&self) -> Vec<BufferEntry> {
        self.entries.lock().drain().map(|(_, entry)| entry).collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(raw: RawHandle, size: u32) -> BufferEntry {
        BufferEntry {
            raw,
            size,
            device_addr: DeviceAddr(0x1000 + raw),
            flags: MapFlags::empty(),
            dsp_index: 0,
        }
    }

    #[test]
    fn duplicate_insert_rejected() {
        let registry = BufferRegistry::new("cpu");
        registry.insert(entry(3, 4096)).unwrap();
        assert_eq!(
            registry.insert(entry(3, 4096)),
            Err(CoreError::InvalidArgument)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remap_after_remove_succeeds() {
        let registry = BufferRegistry::new("cpu");
        registry.insert(entry(3, 4096)).unwrap();
        registry.remove(3).unwrap();
        registry.insert(entry(3, 4096)).unwrap();
    }

    #[test]
    fn lookup_enforces_recorded_size() {
        let registry = BufferRegistry::new("cpu");
        registry.insert(entry(7, 4096)).unwrap();

        assert!(registry.lookup(7, 4096).is_ok());
        assert_eq!(registry.lookup(7, 8192), Err(CoreError::InvalidArgument));
        assert_eq!(registry.lookup(8, 4096), Err(CoreError::NoEntry));
    }

    #[test]
    fn drain_empties_registry() {
        let registry = BufferRegistry::new("dsp");
        registry.insert(entry(1, 64)).unwrap();
        registry.insert(entry(2, 64)).unwrap();
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
