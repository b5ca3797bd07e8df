//! # Command Dispatch
//!
//! Typed request routing for the session command pipeline. Every entry
//! point pins the session first; a session that was concurrently torn
//! down fails with a reset error before anything is touched.
//!
//! Packet submission resolves declared buffer descriptors in place
//! (mapping unseen handles on demand), performs cache maintenance,
//! forwards to the engine, and blocks on the named completion signal when
//! the command type declares one. The fence-gated variant hands the fully
//! resolved packet to a detached worker that waits on every input fence,
//! submits, and signals every declared output fence exactly once whatever
//! happens along the way.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use prism_fence::{FenceEngine, FenceState};
use prism_hal::packet::{packet_info, BufDesc, Signal};
use prism_hal::{CmdPacket, FenceCmdPacket, MsgPacket};

use crate::buffers::BufferParams;
use crate::driver::Core;
use crate::error::{CoreError, CoreResult};
use crate::power::PowerRequest;
use crate::queue::QueueState;
use crate::session::{Session, SessionState};

/// Device-scope property: firmware version word
pub const PROP_FW_VERSION: u32 = 1;

/// Session-control sub-operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Drive the engine session open and establish persistent buffers
    Create,
    /// Activate message delivery
    Start,
    /// Stop message delivery
    Stop,
}

/// One typed client request
#[derive(Debug, Clone)]
pub enum Command {
    /// Return the opaque session identifier
    GetSessionInfo,
    /// Update the session's clock/bandwidth ask and recompute the vote
    RequestPower(PowerRequest),
    /// DSP-path buffer registration
    RegisterBuffer(BufferParams),
    /// DSP-path buffer removal
    UnregisterBuffer(BufferParams),
    /// Deprecated generic command; accepted as a no-op
    SendLegacyCommand,
    /// Pop one queued completion message (blocking, bounded)
    ReceiveMessage,
    /// Resolve buffers and submit one command packet
    SendPacket {
        /// The packet to submit
        pkt: CmdPacket,
        /// Caller-declared buffer table offset, for unknown packet kinds
        buf_offset: usize,
        /// Caller-declared buffer count, for unknown packet kinds
        buf_count: usize,
    },
    /// Resolve buffers and hand the packet to a fence-gated worker
    SendFencePacket {
        /// The packet plus its fence-data block
        pkt: FenceCmdPacket,
        /// Caller-declared buffer table offset, for unknown packet kinds
        buf_offset: usize,
        /// Caller-declared buffer count, for unknown packet kinds
        buf_count: usize,
    },
    /// Deprecated response commands; always rejected
    PacketResponse {
        /// The response kind the caller tried to wait on
        kind: u32,
    },
    /// Session lifecycle control
    SessionControl(SessionControl),
    /// Read a session or device property
    GetProperty(u32),
    /// Write a session property
    SetProperty(u32, u32),
}

/// Reply to a successfully handled command
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Completed with nothing to return
    Done,
    /// Session identifier
    SessionInfo {
        /// Opaque id derived from the engine handle
        id: u32,
    },
    /// One drained completion message
    Message(Box<MsgPacket>),
    /// Property value
    Property(u32),
}

/// Whether a command triggers the implicit ensure-session-created step
fn needs_session(cmd: &Command) -> bool {
    !matches!(
        cmd,
        Command::SessionControl(_) | Command::GetProperty(_) | Command::SetProperty(..)
    )
}

impl Core {
    /// Route one typed command against a pinned session
    pub fn submit(self: &Arc<Self>, session: &Arc<Session>, cmd: Command) -> CoreResult<Reply> {
        let session = self.validate_session(session)?;

        if needs_session(&cmd) {
            self.session_create(&session)?;
        }

        match cmd {
            Command::GetSessionInfo => {
                let id = session.id();
                log::debug!("session info: {:#x}", id);
                Ok(Reply::SessionInfo { id })
            }
            Command::RequestPower(request) => {
                self.request_power(&session, request)?;
                Ok(Reply::Done)
            }
            Command::RegisterBuffer(params) => {
                if params.index == 0 {
                    log::debug!("cpu-path register is deprecated, ignoring");
                    return Ok(Reply::Done);
                }
                session.map_buf_dsp(&*self.memory, &self.dsp, &params)?;
                Ok(Reply::Done)
            }
            Command::UnregisterBuffer(params) => {
                if params.index == 0 {
                    log::info!("cpu-path unregister is deprecated, ignoring");
                    return Ok(Reply::Done);
                }
                session.unmap_buf_dsp(&*self.memory, &self.dsp, &params)?;
                Ok(Reply::Done)
            }
            Command::SendLegacyCommand => {
                log::error!("client sent a deprecated generic command");
                Ok(Reply::Done)
            }
            Command::ReceiveMessage => {
                let deadline = Instant::now() + self.config.receive_timeout;
                let msg = session.queue().receive(deadline)?;
                Ok(Reply::Message(msg))
            }
            Command::SendPacket {
                mut pkt,
                buf_offset,
                buf_count,
            } => {
                self.process_packet(&session, &mut pkt, buf_offset, buf_count)?;
                Ok(Reply::Done)
            }
            Command::SendFencePacket {
                pkt,
                buf_offset,
                buf_count,
            } => {
                self.process_fence_packet(&session, pkt, buf_offset, buf_count)?;
                Ok(Reply::Done)
            }
            Command::PacketResponse { kind } => {
                log::error!("deprecated response command {:#x} rejected", kind);
                Err(CoreError::NotSupported)
            }
            Command::SessionControl(ctrl) => self.session_ctrl(&session, ctrl),
            Command::GetProperty(key) => self.get_property(&session, key),
            Command::SetProperty(key, value) => self.set_property(&session, key, value),
        }
    }

    // -------------------------------------------------------------------------
    // Session Control / Properties
    // -------------------------------------------------------------------------

    fn session_ctrl(&self, session: &Arc<Session>, ctrl: SessionControl) -> CoreResult<Reply> {
        match ctrl {
            SessionControl::Create => self.session_create(session)?,
            SessionControl::Start => {
                session.queue().start()?;
                let mut state = session.state_lock();
                if matches!(*state, SessionState::OpenDone | SessionState::Stop) {
                    *state = SessionState::Start;
                }
            }
            SessionControl::Stop => {
                session.queue().stop()?;
                let mut state = session.state_lock();
                if *state == SessionState::Start {
                    *state = SessionState::Stop;
                }
            }
        }
        Ok(Reply::Done)
    }

    fn get_property(&self, session: &Arc<Session>, key: u32) -> CoreResult<Reply> {
        if key == PROP_FW_VERSION {
            let info = self.engine.fw_info()?;
            return Ok(Reply::Property(info.version));
        }
        match session.get_prop(key) {
            Some(value) => Ok(Reply::Property(value)),
            None => {
                log::error!("unrecognized property {:#x}", key);
                Err(CoreError::NotSupported)
            }
        }
    }

    fn set_property(&self, session: &Arc<Session>, key: u32, value: u32) -> CoreResult<Reply> {
        if key == PROP_FW_VERSION {
            return Err(CoreError::NotSupported);
        }
        session.set_prop(key, value);
        Ok(Reply::Done)
    }

    // -------------------------------------------------------------------------
    // Packet Processing
    // -------------------------------------------------------------------------

    /// Declared dimensions and signal for a packet, with the caller's
    /// values as fallback for unknown kinds and as an override when both
    /// are nonzero
    fn resolve_dims(
        &self,
        kind: u32,
        in_offset: usize,
        in_count: usize,
    ) -> (usize, usize, Option<Signal>) {
        match packet_info(kind) {
            Some(info) => {
                let mut offset = info.buf_offset;
                let mut count = info.buf_count;
                if in_offset != 0 && in_count != 0 {
                    offset = in_offset;
                    count = in_count;
                }
                (offset, count, info.signal)
            }
            None => {
                log::error!("unrecognized packet kind {:#x}", kind);
                (in_offset, in_count, None)
            }
        }
    }

    /// Substitute every declared nonzero buffer descriptor with its
    /// resolved device address, mapping unseen handles on the CPU path,
    /// then run cache maintenance over each resolved range. Any failure
    /// aborts the whole command before engine submission.
    fn map_packet_buffers(
        &self,
        session: &Arc<Session>,
        pkt: &mut CmdPacket,
        offset: usize,
        count: usize,
    ) -> CoreResult<()> {
        if offset == 0 || count == 0 {
            return Ok(());
        }
        if !CmdPacket::table_in_bounds(offset, count) {
            log::error!("buffer table out of bounds: offset {} count {}", offset, count);
            return Err(CoreError::InvalidArgument);
        }

        for i in 0..count {
            let desc = pkt.buf_desc(offset, i);
            if desc.handle == 0 {
                continue;
            }

            let entry = match session.resolve_buf(desc.handle, desc.size) {
                Ok(entry) => entry,
                Err(CoreError::NoEntry) => {
                    log::debug!("mapping buf handle {} size {}", desc.handle, desc.size);
                    session.map_buf_cpu(&*self.memory, desc.handle, desc.size)?
                }
                Err(err) => {
                    log::error!("buf {} resolution failed: {}", i, err);
                    return Err(err);
                }
            };

            pkt.set_buf_desc(
                offset,
                i,
                BufDesc {
                    handle: entry.device_addr.0,
                    size: entry.size,
                },
            );
            self.memory
                .cache_clean_invalidate(entry.device_addr, entry.size)?;
        }
        Ok(())
    }

    /// Resolve buffers, submit, and optionally block on the named signal
    fn process_packet(
        &self,
        session: &Arc<Session>,
        pkt: &mut CmdPacket,
        in_offset: usize,
        in_count: usize,
    ) -> CoreResult<()> {
        if session.queue().state() != QueueState::Active {
            log::error!("packet submitted while queue inactive");
            return Err(CoreError::InvalidState);
        }

        let (offset, count, signal) = self.resolve_dims(pkt.kind(), in_offset, in_count);
        self.map_packet_buffers(session, pkt, offset, count)?;

        if self.config.debug.log_packets {
            log::debug!("submitting packet kind {:#x}", pkt.kind());
        }

        let handle = session.handle().ok_or(CoreError::InvalidState)?;
        self.engine.session_send(handle, pkt)?;

        if let Some(signal) = signal {
            session.wait_signal(signal, self.config.signal_timeout)?;
        }
        Ok(())
    }

    /// Resolve buffers, then spawn the fence-gated submission worker
    fn process_fence_packet(
        self: &Arc<Self>,
        session: &Arc<Session>,
        mut fpkt: FenceCmdPacket,
        in_offset: usize,
        in_count: usize,
    ) -> CoreResult<()> {
        if session.queue().state() != QueueState::Active {
            log::error!("fence packet submitted while queue inactive");
            return Err(CoreError::InvalidState);
        }
        if !fpkt.counts_in_bounds() {
            log::error!(
                "fence block overflows: {} in, {} out",
                fpkt.input_count(),
                fpkt.output_count()
            );
            return Err(CoreError::InvalidArgument);
        }

        let (offset, count, signal) = self.resolve_dims(fpkt.pkt.kind(), in_offset, in_count);
        self.map_packet_buffers(session, &mut fpkt.pkt, offset, count)?;

        let core = Arc::clone(self);
        // the worker's clone keeps the session alive across teardown
        let session = Arc::clone(session);
        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);

        let spawned = std::thread::Builder::new()
            .name(format!("prism-fence-{}", seq))
            .spawn(move || fence_worker(&core, &session, &fpkt, signal));
        if let Err(err) = spawned {
            log::error!("fence worker spawn failed: {}", err);
            return Err(CoreError::Exhausted);
        }
        Ok(())
    }
}

// =============================================================================
// Fence-Gated Worker
// =============================================================================

/// Wait on every input fence, submit, await the named signal, then signal
/// every declared output fence exactly once with the overall outcome.
fn fence_worker(
    core: &Arc<Core>,
    session: &Arc<Session>,
    fpkt: &FenceCmdPacket,
    signal: Option<Signal>,
) {
    let fences = core.fences();
    let client = session.owner();

    let result = run_gated_submission(core, session, fpkt, signal);

    let outcome = match &result {
        Ok(()) => FenceState::SignaledSuccess,
        Err(err) => {
            log::error!("fence-gated command failed: {}", err);
            FenceState::SignaledError
        }
    };

    let first_out = fpkt.input_count();
    for i in first_out..first_out + fpkt.output_count() {
        let (id, key) = fpkt.pair(i);
        if id == 0 {
            log::error!("declared output fence {} has no handle", i - first_out);
            continue;
        }
        signal_output(fences, client, id, key, outcome);
    }
}

/// The gated steps; any failure aborts the rest
fn run_gated_submission(
    core: &Arc<Core>,
    session: &Arc<Session>,
    fpkt: &FenceCmdPacket,
    signal: Option<Signal>,
) -> CoreResult<()> {
    let fences = core.fences();
    let client = session.owner();

    for i in 0..fpkt.input_count() {
        let (id, key) = fpkt.pair(i);
        if id == 0 {
            continue;
        }

        let handle = fences.import(client, id, key)?;
        let waited = fences.wait(client, handle, core.config().fence_wait_timeout);
        if let Err(err) = fences.destroy(client, handle) {
            log::warn!("input fence release failed: {}", err);
        }

        match waited? {
            FenceState::SignaledSuccess => {}
            state => {
                log::error!("input fence {:#x} resolved to {:?}", id, state);
                return Err(CoreError::DependencyFailed);
            }
        }
    }

    let handle = session.handle().ok_or(CoreError::InvalidState)?;
    core.engine.session_send(handle, &fpkt.pkt)?;

    if let Some(signal) = signal {
        session.wait_signal(signal, core.config().signal_timeout)?;
    }
    Ok(())
}

/// Import, signal, release one output fence; every step is best-effort
/// because the consumer must never be left blocked forever
fn signal_output(
    fences: &Arc<FenceEngine>,
    client: prism_fence::ClientId,
    id: u32,
    key: u32,
    outcome: FenceState,
) {
    match fences.import(client, id, key) {
        Ok(handle) => {
            if let Err(err) = fences.signal(client, handle, outcome) {
                log::error!("output fence {:#x} signal failed: {}", id, err);
            }
            if let Err(err) = fences.destroy(client, handle) {
                log::warn!("output fence release failed: {}", err);
            }
        }
        Err(err) => {
            log::error!("output fence {:#x} import failed: {}", id, err);
        }
    }
}
