//! # Prism HAL
//!
//! Device-boundary abstraction layer for the Prism offload driver core.
//!
//! The driver core talks to three externally owned collaborators, each
//! modeled here as a trait so the core stays independent of the physical
//! transport:
//!
//! - [`EngineOps`]: the firmware-controlled compute engine, reached through
//!   a command/response packet interface.
//! - [`MemoryOps`]: the local IOMMU mapping domain for client buffers.
//! - [`RemoteEndpoint`]: the raw one-way message channel to the companion
//!   DSP co-processor. Responses travel back through the driver core's
//!   link layer, not through this trait.
//!
//! The packet layout helpers live in [`packet`].

pub mod packet;

use core::fmt;

pub use packet::{CmdPacket, FenceCmdPacket, MsgPacket};

// =============================================================================
// Result / Error
// =============================================================================

/// Result type for transport operations
pub type HalResult<T> = Result<T, HalError>;

/// Transport-level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The underlying channel is not available
    ChannelDown,
    /// A packet failed basic layout validation
    InvalidPacket,
    /// The hardware or firmware reported a failure code
    Hardware(i32),
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::ChannelDown => write!(f, "transport channel down"),
            HalError::InvalidPacket => write!(f, "malformed packet"),
            HalError::Hardware(code) => write!(f, "hardware error {}", code),
        }
    }
}

// =============================================================================
// Identity Types
// =============================================================================

/// Opaque engine session identity.
///
/// The engine assigns one per open session; the low 32 bits double as the
/// client-visible session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

impl SessionHandle {
    /// Client-visible session id derived from this handle
    pub fn id(self) -> u32 {
        self.0
    }
}

/// External buffer handle supplied by the client (file-descriptor equivalent)
pub type RawHandle = u32;

/// Device address produced by the local mapping domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr(pub u32);

bitflags::bitflags! {
    /// Buffer mapping flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Map into the protected domain
        const SECURE = 1 << 0;
        /// CPU-cached mapping
        const CACHED = 1 << 1;
        /// Device reads only
        const READ_ONLY = 1 << 2;
    }
}

/// Firmware identification snapshot, served through debug introspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FwInfo {
    /// Firmware version word
    pub version: u32,
    /// Firmware load base
    pub base_addr: u64,
    /// Register window base
    pub register_base: u64,
    /// Register window size
    pub register_size: u32,
    /// Interrupt line
    pub irq: u32,
}

// =============================================================================
// Engine Transport
// =============================================================================

/// Operations on the firmware-controlled compute engine.
///
/// All calls may be issued from any thread; implementations serialize
/// internally as needed. `session_send` is fire-and-forget: completions are
/// delivered asynchronously through the driver core's response path.
pub trait EngineOps: Send + Sync {
    /// Open a new engine session
    fn session_open(&self) -> HalResult<SessionHandle>;

    /// Close an engine session
    fn session_close(&self, session: SessionHandle) -> HalResult<()>;

    /// Submit one command packet on a session
    fn session_send(&self, session: SessionHandle, pkt: &CmdPacket) -> HalResult<()>;

    /// Apply a system-wide core clock rate
    fn scale_clocks(&self, rate_hz: u64) -> HalResult<()>;

    /// Apply a system-wide bus bandwidth vote (average, instantaneous)
    fn vote_bus(&self, ab_kbps: u64, ib_kbps: u64) -> HalResult<()>;

    /// Read the firmware identification block
    fn fw_info(&self) -> HalResult<FwInfo>;
}

// =============================================================================
// Local Mapping Domain
// =============================================================================

/// The local IOMMU mapping domain for externally supplied buffers and
/// driver-internal allocations
pub trait MemoryOps: Send + Sync {
    /// Map an external buffer into device address space
    fn map(&self, raw: RawHandle, size: u32, flags: MapFlags) -> HalResult<DeviceAddr>;

    /// Release a device mapping
    fn unmap(&self, addr: DeviceAddr) -> HalResult<()>;

    /// Allocate driver-internal device memory (persistent session buffers)
    fn alloc(&self, size: u32, flags: MapFlags) -> HalResult<DeviceAddr>;

    /// Release a driver-internal allocation
    fn free(&self, addr: DeviceAddr) -> HalResult<()>;

    /// Clean and invalidate CPU caches over a mapped range
    fn cache_clean_invalidate(&self, addr: DeviceAddr, size: u32) -> HalResult<()>;
}

// =============================================================================
// DSP Remote Channel
// =============================================================================

/// Remote procedure kinds understood by the DSP co-processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCmdKind {
    /// Register a mapped buffer with the DSP
    RegisterBuffer,
    /// Remove a buffer registration from the DSP
    DeregisterBuffer,
    /// Suspend DSP-side processing
    Suspend,
    /// Resume DSP-side processing
    Resume,
    /// Shut the DSP service down
    Shutdown,
}

/// One command message on the DSP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Procedure selector
    pub kind: RemoteCmdKind,
    /// Device address of the buffer (register/deregister)
    pub device_addr: u32,
    /// Remote registration index (register/deregister)
    pub index: u32,
    /// Buffer size in bytes (register/deregister)
    pub size: u32,
    /// Owning session id
    pub session_id: u32,
}

impl RemoteCommand {
    /// Build a control message that carries no buffer payload
    pub fn control(kind: RemoteCmdKind) -> Self {
        RemoteCommand {
            kind,
            device_addr: 0,
            index: 0,
            size: 0,
            session_id: 0,
        }
    }
}

/// One response message from the DSP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteResponse {
    /// Procedure this response answers
    pub kind: RemoteCmdKind,
    /// Remote status, zero on success
    pub status: i32,
}

/// Raw one-way message channel to the DSP co-processor.
///
/// Exactly one in-flight command per [`RemoteCmdKind`] is permitted; the
/// driver core serializes callers of the same kind because the completion
/// event on the response path is shared per kind, not per call.
pub trait RemoteEndpoint: Send + Sync {
    /// Post one command message to the remote side
    fn send(&self, cmd: &RemoteCommand) -> HalResult<()>;
}
