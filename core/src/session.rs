//! # Sessions
//!
//! One [`Session`] represents a client's compute context: lifecycle state,
//! the asynchronous message queue, the two buffer registries, the power
//! ask, and the named-signal receipt table. State transitions are guarded
//! by a blocking session mutex; the queue keeps its own finer lock because
//! posting happens on the firmware callback path.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use prism_fence::ClientId;
use prism_hal::packet::{Signal, SIGNAL_COUNT};
use prism_hal::{DeviceAddr, HalError, MemoryOps, SessionHandle};
use spin::Mutex as SpinMutex;

use crate::buffers::{BufferEntry, BufferParams, BufferRegistry};
use crate::dsp::DspLink;
use crate::error::{CoreError, CoreResult};
use crate::power::PowerRequest;
use crate::queue::SessionQueue;
use crate::sync::Completion;

// =============================================================================
// Lifecycle State
// =============================================================================

/// Session lifecycle states.
///
/// Transitions are monotonic except for the explicit start/stop pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Instance created, engine session not yet open
    CoreInitDone,
    /// Engine session open, persistent buffers established
    OpenDone,
    /// Message delivery started
    Start,
    /// Message delivery stopped
    Stop,
    /// Engine session closed
    CloseDone,
}

/// The persistent buffer a session establishes with the engine at create
#[derive(Debug, Clone, Copy)]
pub struct PersistentBuf {
    /// Device address of the allocation
    pub device_addr: DeviceAddr,
    /// Allocation size in bytes
    pub size: u32,
}

// =============================================================================
// Session
// =============================================================================

/// One client compute context
pub struct Session {
    owner: ClientId,
    handle: SpinMutex<Option<SessionHandle>>,
    state: Mutex<SessionState>,
    queue: SessionQueue,
    cpu_bufs: BufferRegistry,
    dsp_bufs: BufferRegistry,
    power: SpinMutex<PowerRequest>,
    signals: [Completion; SIGNAL_COUNT],
    props: SpinMutex<HashMap<u32, u32>>,
    persistent: SpinMutex<Option<PersistentBuf>>,
}

impl Session {
    /// Create a fresh instance in `CoreInitDone`
    pub fn new(owner: ClientId) -> Self {
        Session {
            owner,
            handle: SpinMutex::new(None),
            state: Mutex::new(SessionState::CoreInitDone),
            queue: SessionQueue::new(),
            cpu_bufs: BufferRegistry::new("cpu-bufs"),
            dsp_bufs: BufferRegistry::new("dsp-bufs"),
            power: SpinMutex::new(PowerRequest::default()),
            signals: std::array::from_fn(|_| Completion::new()),
            props: SpinMutex::new(HashMap::new()),
            persistent: SpinMutex::new(None),
        }
    }

    /// Owning client identity
    pub fn owner(&self) -> ClientId {
        self.owner
    }

    /// Client-visible session id, zero before the engine session opens
    pub fn id(&self) -> u32 {
        self.handle.lock().map(SessionHandle::id).unwrap_or(0)
    }

    /// Engine session handle, if open
    pub fn handle(&self) -> Option<SessionHandle> {
        *self.handle.lock()
    }

    /// Record the engine session handle
    pub fn set_handle(&self, handle: Option<SessionHandle>) {
        *self.handle.lock() = handle;
    }

    /// Lock the lifecycle state for a transition
    pub fn state_lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read the lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state_lock()
    }

    /// The asynchronous message queue
    pub fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    /// Snapshot of the current power ask
    pub fn power(&self) -> PowerRequest {
        *self.power.lock()
    }

    /// Replace the power ask
    pub fn set_power(&self, request: PowerRequest) {
        *self.power.lock() = request;
    }

    /// The persistent buffer, if established
    pub fn persistent(&self) -> Option<PersistentBuf> {
        *self.persistent.lock()
    }

    /// Record or clear the persistent buffer
    pub fn set_persistent(&self, buf: Option<PersistentBuf>) {
        *self.persistent.lock() = buf;
    }

    /// Read one session property
    pub fn get_prop(&self, key: u32) -> Option<u32> {
        self.props.lock().get(&key).copied()
    }

    /// Write one session property
    pub fn set_prop(&self, key: u32, value: u32) {
        self.props.lock().insert(key, value);
    }

    /// Number of live entries in (cpu, dsp) registries
    pub fn buf_counts(&self) -> (usize, usize) {
        (self.cpu_bufs.len(), self.dsp_bufs.len())
    }

    // -------------------------------------------------------------------------
    // Signal Receipts
    // -------------------------------------------------------------------------

    /// Deposit a named completion signal from the engine
    pub fn post_signal(&self, signal: Signal, status: i32) {
        self.signals[signal.index()].complete(status);
    }

    /// Await a named completion signal; a nonzero status is a hardware
    /// failure
    pub fn wait_signal(&self, signal: Signal, timeout: Duration) -> CoreResult<()> {
        let status = self.signals[signal.index()].wait_deadline(Instant::now() + timeout)?;
        if status != 0 {
            log::error!("signal {:?} completed with status {}", signal, status);
            return Err(CoreError::Hal(HalError::Hardware(status)));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Buffer Flows
    // -------------------------------------------------------------------------

    /// Resolve a raw handle against both registries, CPU path first.
    ///
    /// [`CoreError::NoEntry`] means the caller should map now; a size
    /// mismatch on a present entry is an error in either registry.
    pub fn resolve_buf(&self, raw: u32, size: u32) -> CoreResult<BufferEntry> {
        match self.cpu_bufs.lookup(raw, size) {
            Err(CoreError::NoEntry) => self.dsp_bufs.lookup(raw, size),
            other => other,
        }
    }

    /// Map a buffer on first reference inside a command packet
    pub fn map_buf_cpu(
        &self,
        memory: &dyn MemoryOps,
        raw: u32,
        size: u32,
    ) -> CoreResult<BufferEntry> {
        if self.cpu_bufs.contains(raw) {
            log::error!("duplicate cpu-path map of handle {}", raw);
            return Err(CoreError::InvalidArgument);
        }

        let device_addr = memory.map(raw, size, prism_hal::MapFlags::empty())?;
        let entry = BufferEntry {
            raw,
            size,
            device_addr,
            flags: prism_hal::MapFlags::empty(),
            dsp_index: 0,
        };

        if let Err(err) = self.cpu_bufs.insert(entry) {
            // lost a race to a concurrent map; no partial insert remains
            if let Err(unmap_err) = memory.unmap(device_addr) {
                log::warn!("rollback unmap failed: {}", unmap_err);
            }
            return Err(err);
        }
        Ok(entry)
    }

    /// Map and remotely register a buffer on the DSP path
    pub fn map_buf_dsp(
        &self,
        memory: &dyn MemoryOps,
        dsp: &DspLink,
        params: &BufferParams,
    ) -> CoreResult<()> {
        if params.offset != 0 {
            log::error!("buffer offset is deprecated, set to 0");
            return Err(CoreError::InvalidArgument);
        }

        if let Some(existing) = self.dsp_bufs.get(params.raw) {
            if existing.size != params.size {
                log::error!("dsp-path size mismatch for handle {}", params.raw);
            } else {
                log::error!("duplicate dsp-path registration of handle {}", params.raw);
            }
            return Err(CoreError::InvalidArgument);
        }

        let device_addr = memory.map(params.raw, params.size, params.flags)?;

        if params.index != 0 {
            if let Err(err) =
                dsp.register_buffer(device_addr, params.index, params.size, self.id())
            {
                log::error!(
                    "dsp registration failed for handle {}: {}",
                    params.raw,
                    err
                );
                if let Err(unmap_err) = memory.unmap(device_addr) {
                    log::warn!("rollback unmap failed: {}", unmap_err);
                }
                return Err(err);
            }
        }

        let entry = BufferEntry {
            raw: params.raw,
            size: params.size,
            device_addr,
            flags: params.flags,
            dsp_index: params.index,
        };

        if let Err(err) = self.dsp_bufs.insert(entry) {
            if params.index != 0 {
                let _ = dsp.deregister_buffer(device_addr, params.index, params.size, self.id());
            }
            if let Err(unmap_err) = memory.unmap(device_addr) {
                log::warn!("rollback unmap failed: {}", unmap_err);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remotely deregister and unmap a DSP-path buffer.
    ///
    /// A remote deregistration failure aborts the unmap; the entry remains
    /// so no orphaned remote state is left behind.
    pub fn unmap_buf_dsp(
        &self,
        memory: &dyn MemoryOps,
        dsp: &DspLink,
        params: &BufferParams,
    ) -> CoreResult<()> {
        let entry = match self.dsp_bufs.get(params.raw) {
            Some(entry) => entry,
            None => {
                log::error!("unregister of unknown handle {}", params.raw);
                return Err(CoreError::InvalidArgument);
            }
        };

        if entry.dsp_index != 0 {
            dsp.deregister_buffer(entry.device_addr, entry.dsp_index, entry.size, self.id())?;
        }

        if let Err(err) = memory.unmap(entry.device_addr) {
            log::warn!("unmap failed for handle {}: {}", params.raw, err);
        }
        self.dsp_bufs.remove(params.raw);
        Ok(())
    }

    /// Teardown sweep: release every entry in both registries.
    ///
    /// Remote deregistration failures are logged, never fatal; teardown
    /// must complete.
    pub fn teardown_buffers(&self, memory: &dyn MemoryOps, dsp: &DspLink) {
        for entry in self.dsp_bufs.drain() {
            if entry.dsp_index != 0 {
                if let Err(err) =
                    dsp.deregister_buffer(entry.device_addr, entry.dsp_index, entry.size, self.id())
                {
                    log::warn!(
                        "teardown: dsp deregister failed for handle {}: {}",
                        entry.raw,
                        err
                    );
                }
            }
            if let Err(err) = memory.unmap(entry.device_addr) {
                log::warn!("teardown: unmap failed for handle {}: {}", entry.raw, err);
            }
        }

        for entry in self.cpu_bufs.drain() {
            if let Err(err) = memory.unmap(entry.device_addr) {
                log::warn!("teardown: unmap failed for handle {}: {}", entry.raw, err);
            }
        }
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
