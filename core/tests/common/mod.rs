//! Mock transports backing the scenario tests: an engine that records
//! submissions and acknowledges named signals, a mapping domain with
//! injectable failures, and a DSP endpoint that answers from the calling
//! thread.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use prism_core::{Core, CoreConfig, DspLink};
use prism_hal::packet::packet_info;
use prism_hal::{
    CmdPacket, DeviceAddr, EngineOps, FwInfo, HalError, HalResult, MapFlags, MemoryOps, RawHandle,
    RemoteCommand, RemoteEndpoint, RemoteResponse, SessionHandle,
};
use spin::Mutex;

// =============================================================================
// Engine
// =============================================================================

pub struct MockEngine {
    next_session: AtomicU32,
    core: Mutex<Option<Weak<Core>>>,
    pub sent: Mutex<Vec<(SessionHandle, CmdPacket)>>,
    pub closed: Mutex<Vec<SessionHandle>>,
    pub clock_votes: Mutex<Vec<u64>>,
    pub bus_votes: Mutex<Vec<(u64, u64)>>,
    pub fail_send: AtomicBool,
    pub ack_signals: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEngine {
            next_session: AtomicU32::new(0x1000),
            core: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            clock_votes: Mutex::new(Vec::new()),
            bus_votes: Mutex::new(Vec::new()),
            fail_send: AtomicBool::new(false),
            ack_signals: AtomicBool::new(true),
        })
    }

    /// Wire the engine back to the core so signal-bearing packets are
    /// acknowledged as firmware would.
    pub fn attach_core(&self, core: &Arc<Core>) {
        *self.core.lock() = Some(Arc::downgrade(core));
    }

    pub fn last_clock_vote(&self) -> Option<u64> {
        self.clock_votes.lock().last().copied()
    }

    pub fn last_bus_vote(&self) -> Option<(u64, u64)> {
        self.bus_votes.lock().last().copied()
    }

    pub fn sent_kinds(&self) -> Vec<u32> {
        self.sent.lock().iter().map(|(_, pkt)| pkt.kind()).collect()
    }
}

impl EngineOps for MockEngine {
    fn session_open(&self) -> HalResult<SessionHandle> {
        Ok(SessionHandle(
            self.next_session.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn session_close(&self, session: SessionHandle) -> HalResult<()> {
        self.closed.lock().push(session);
        Ok(())
    }

    fn session_send(&self, session: SessionHandle, pkt: &CmdPacket) -> HalResult<()> {
        if self.fail_send.load(Ordering::Relaxed) {
            return Err(HalError::Hardware(-71));
        }
        self.sent.lock().push((session, pkt.clone()));

        if self.ack_signals.load(Ordering::Relaxed) {
            let core = self.core.lock().as_ref().and_then(Weak::upgrade);
            if let (Some(core), Some(info)) = (core, packet_info(pkt.kind())) {
                if let Some(signal) = info.signal {
                    let _ = core.post_session_signal(session.id(), signal, 0);
                }
            }
        }
        Ok(())
    }

    fn scale_clocks(&self, rate_hz: u64) -> HalResult<()> {
        self.clock_votes.lock().push(rate_hz);
        Ok(())
    }

    fn vote_bus(&self, ab_kbps: u64, ib_kbps: u64) -> HalResult<()> {
        self.bus_votes.lock().push((ab_kbps, ib_kbps));
        Ok(())
    }

    fn fw_info(&self) -> HalResult<FwInfo> {
        Ok(FwInfo {
            version: 0x0001_0002,
            base_addr: 0x9000_0000,
            register_base: 0x9100_0000,
            register_size: 0x1000,
            irq: 53,
        })
    }
}

// =============================================================================
// Memory
// =============================================================================

pub struct MockMemory {
    next_alloc: AtomicU32,
    pub mapped: Mutex<Vec<DeviceAddr>>,
    pub cache_ops: AtomicU32,
    pub fail_next_map: AtomicBool,
}

impl MockMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(MockMemory {
            next_alloc: AtomicU32::new(0xa000_0000),
            mapped: Mutex::new(Vec::new()),
            cache_ops: AtomicU32::new(0),
            fail_next_map: AtomicBool::new(false),
        })
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().len()
    }
}

impl MemoryOps for MockMemory {
    fn map(&self, raw: RawHandle, _size: u32, _flags: MapFlags) -> HalResult<DeviceAddr> {
        if self.fail_next_map.swap(false, Ordering::Relaxed) {
            return Err(HalError::Hardware(-12));
        }
        let addr = DeviceAddr(0x8000_0000 | (raw << 12));
        self.mapped.lock().push(addr);
        Ok(addr)
    }

    fn unmap(&self, addr: DeviceAddr) -> HalResult<()> {
        let mut mapped = self.mapped.lock();
        match mapped.iter().position(|&a| a == addr) {
            Some(at) => {
                mapped.swap_remove(at);
                Ok(())
            }
            None => Err(HalError::InvalidPacket),
        }
    }

    fn alloc(&self, _size: u32, _flags: MapFlags) -> HalResult<DeviceAddr> {
        let addr = DeviceAddr(self.next_alloc.fetch_add(0x0010_0000, Ordering::Relaxed));
        self.mapped.lock().push(addr);
        Ok(addr)
    }

    fn free(&self, addr: DeviceAddr) -> HalResult<()> {
        self.unmap(addr)
    }

    fn cache_clean_invalidate(&self, _addr: DeviceAddr, _size: u32) -> HalResult<()> {
        self.cache_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// DSP Endpoint
// =============================================================================

pub struct MockRemote {
    link: Mutex<Option<Weak<DspLink>>>,
    pub sent: Mutex<Vec<RemoteCommand>>,
    pub status: AtomicI32,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(MockRemote {
            link: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            status: AtomicI32::new(0),
        })
    }

    /// Wire the endpoint back to the link so every command is answered
    /// from the calling thread.
    pub fn attach_link(&self, link: &Arc<DspLink>) {
        *self.link.lock() = Some(Arc::downgrade(link));
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl RemoteEndpoint for MockRemote {
    fn send(&self, cmd: &RemoteCommand) -> HalResult<()> {
        self.sent.lock().push(*cmd);
        if let Some(link) = self.link.lock().as_ref().and_then(Weak::upgrade) {
            link.handle_response(RemoteResponse {
                kind: cmd.kind,
                status: self.status.load(Ordering::Relaxed),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub struct Fixture {
    pub core: Arc<Core>,
    pub engine: Arc<MockEngine>,
    pub memory: Arc<MockMemory>,
    pub remote: Arc<MockRemote>,
}

pub fn fixture() -> Fixture {
    fixture_with(CoreConfig::default())
}

pub fn fixture_with(config: CoreConfig) -> Fixture {
    let engine = MockEngine::new();
    let memory = MockMemory::new();
    let remote = MockRemote::new();

    let core = Core::new(
        config,
        Arc::clone(&engine) as Arc<dyn EngineOps>,
        Arc::clone(&memory) as Arc<dyn MemoryOps>,
        Some(Arc::clone(&remote) as Arc<dyn RemoteEndpoint>),
    );
    engine.attach_core(&core);
    remote.attach_link(core.dsp());

    Fixture {
        core,
        engine,
        memory,
        remote,
    }
}
