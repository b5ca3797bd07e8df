//! # Driver Core
//!
//! The one global structure: the list of live sessions, the transports,
//! the fence engine, and the injected configuration. The core lock guards
//! the session list only and is held briefly for traversal and pinning,
//! never across a blocking call.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use prism_fence::{ClientId, FenceEngine};
use prism_hal::packet::{packet_info, BufDesc, CmdPacket, Signal, PKT_SET_PERSISTENT};
use prism_hal::{EngineOps, MapFlags, MemoryOps, MsgPacket, RemoteEndpoint};
use spin::Mutex as SpinMutex;

use crate::config::CoreConfig;
use crate::dsp::DspLink;
use crate::error::{CoreError, CoreResult};
use crate::power::{self, PowerRequest, Vote};
use crate::session::{PersistentBuf, Session, SessionState};

/// Health of the core as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// Operational
    InitDone,
    /// A subsystem failure was reported or simulated
    Error,
}

/// The driver core
pub struct Core {
    pub(crate) config: CoreConfig,
    pub(crate) engine: Arc<dyn EngineOps>,
    pub(crate) memory: Arc<dyn MemoryOps>,
    pub(crate) dsp: Arc<DspLink>,
    pub(crate) fences: Arc<FenceEngine>,
    pub(crate) state: SpinMutex<CoreState>,
    pub(crate) sessions: SpinMutex<Vec<Arc<Session>>>,
    pub(crate) worker_seq: AtomicU32,
}

impl Core {
    /// Construct the core around its transports. The DSP endpoint may
    /// attach later (remote service probe order is not guaranteed).
    pub fn new(
        config: CoreConfig,
        engine: Arc<dyn EngineOps>,
        memory: Arc<dyn MemoryOps>,
        remote: Option<Arc<dyn RemoteEndpoint>>,
    ) -> Arc<Self> {
        let dsp = Arc::new(DspLink::new());
        if let Some(endpoint) = remote {
            dsp.attach(endpoint);
        }
        let fences = Arc::new(FenceEngine::with_capacity(config.fence_capacity));

        Arc::new(Core {
            config,
            engine,
            memory,
            dsp,
            fences,
            state: SpinMutex::new(CoreState::InitDone),
            sessions: SpinMutex::new(Vec::new()),
            worker_seq: AtomicU32::new(0),
        })
    }

    /// Injected configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The fence engine
    pub fn fences(&self) -> &Arc<FenceEngine> {
        &self.fences
    }

    /// The DSP link (response demux entry point lives here)
    pub fn dsp(&self) -> &Arc<DspLink> {
        &self.dsp
    }

    /// Core health
    pub fn state(&self) -> CoreState {
        *self.state.lock()
    }

    // -------------------------------------------------------------------------
    // Session Lifecycle
    // -------------------------------------------------------------------------

    /// Create a session instance for `owner` and add it to the live list
    pub fn open_session(&self, owner: ClientId) -> Arc<Session> {
        self.fences.register_client(owner);
        let session = Arc::new(Session::new(owner));
        self.sessions.lock().push(Arc::clone(&session));
        log::debug!("session instance opened for client {}", owner.0);
        session
    }

    /// Pin a session by reference: fails with [`CoreError::SessionReset`]
    /// if it was concurrently destroyed.
    pub fn validate_session(&self, session: &Arc<Session>) -> CoreResult<Arc<Session>> {
        let sessions = self.sessions.lock();
        for live in sessions.iter() {
            if Arc::ptr_eq(live, session) {
                return Ok(Arc::clone(live));
            }
        }
        log::error!("session {:#x} gone, rejecting request", session.id());
        Err(CoreError::SessionReset)
    }

    /// Find a live session by its engine-derived id (firmware callback
    /// path)
    pub fn find_session(&self, session_id: u32) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock();
        sessions
            .iter()
            .find(|s| s.id() == session_id)
            .map(Arc::clone)
    }

    /// Snapshot of every live session, for arbitration and introspection
    pub fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().clone()
    }

    /// Drive the engine session open and establish the persistent buffers
    /// firmware requires before normal command processing.
    ///
    /// Valid from `CoreInitDone` (performs the transition) through
    /// `OpenDone` (no-op); any later state is an invalid-state error.
    pub fn session_create(&self, session: &Arc<Session>) -> CoreResult<()> {
        let mut state = session.state_lock();
        match *state {
            SessionState::OpenDone => Ok(()),
            SessionState::CoreInitDone => {
                let handle = self.engine.session_open()?;
                session.set_handle(Some(handle));

                if let Err(err) = self.establish_persistent(session) {
                    log::error!("persistent buffer setup failed: {}", err);
                    if let Err(close_err) = self.engine.session_close(handle) {
                        log::warn!("session close after failed create: {}", close_err);
                    }
                    session.set_handle(None);
                    return Err(err);
                }

                *state = SessionState::OpenDone;
                log::debug!("session {:#x} created", session.id());
                Ok(())
            }
            other => {
                log::error!("session create in state {:?}", other);
                Err(CoreError::InvalidState)
            }
        }
    }

    /// Allocate, submit, and confirm the persistent buffer
    fn establish_persistent(&self, session: &Arc<Session>) -> CoreResult<()> {
        let size = self.config.persistent_buf_size;
        let device_addr = self.memory.alloc(size, MapFlags::empty())?;

        let info = packet_info(PKT_SET_PERSISTENT).ok_or(CoreError::NotSupported)?;
        let mut pkt = CmdPacket::new(PKT_SET_PERSISTENT);
        pkt.set_buf_desc(
            info.buf_offset,
            0,
            BufDesc {
                handle: device_addr.0,
                size,
            },
        );

        let handle = session.handle().ok_or(CoreError::InvalidState)?;
        let submit = self
            .engine
            .session_send(handle, &pkt)
            .map_err(CoreError::from)
            .and_then(|()| session.wait_signal(Signal::SetPersistent, self.config.signal_timeout));

        match submit {
            Ok(()) => {
                session.set_persistent(Some(PersistentBuf { device_addr, size }));
                Ok(())
            }
            Err(err) => {
                if let Err(free_err) = self.memory.free(device_addr) {
                    log::warn!("persistent buffer free failed: {}", free_err);
                }
                Err(err)
            }
        }
    }

    /// Tear a session down: queue and buffer registries go first, then the
    /// engine close, then the power record is zeroed and the global vote
    /// recomputed. Finally the instance leaves the live list; in-flight
    /// holders keep it alive until their references drop.
    pub fn close_session(&self, session: &Arc<Session>) -> CoreResult<()> {
        self.validate_session(session)?;

        let mut state = session.state_lock();

        let dropped = session.queue().force_stop();
        if dropped != 0 {
            log::warn!(
                "session {:#x} torn down with {} undelivered messages",
                session.id(),
                dropped
            );
        }
        session.queue().drain();

        session.teardown_buffers(&*self.memory, &self.dsp);

        if let Some(buf) = session.persistent() {
            if let Err(err) = self.memory.free(buf.device_addr) {
                log::warn!("persistent buffer free failed: {}", err);
            }
            session.set_persistent(None);
        }

        if let Some(handle) = session.handle() {
            if let Err(err) = self.engine.session_close(handle) {
                log::error!("engine session close failed: {}", err);
            }
        }
        *state = SessionState::CloseDone;
        drop(state);

        session.set_power(PowerRequest::default());
        if let Err(err) = self.arbitrate() {
            log::warn!("post-teardown arbitration failed: {}", err);
        }

        self.sessions.lock().retain(|live| !Arc::ptr_eq(live, session));
        log::debug!("session {:#x} destroyed", session.id());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Power
    // -------------------------------------------------------------------------

    /// Normalize and record one session's power ask, then recompute and
    /// apply the global vote
    pub fn request_power(
        &self,
        session: &Arc<Session>,
        mut request: PowerRequest,
    ) -> CoreResult<Vote> {
        power::normalize_request(&mut request, &self.config);
        log::debug!(
            "power ask: core {} ctlr {} bw {}",
            request.core_cycles,
            request.controller_cycles,
            request.ddr_bw
        );
        session.set_power(request);
        self.arbitrate()
    }

    /// Recompute the aggregated vote from every live session and apply it
    pub fn arbitrate(&self) -> CoreResult<Vote> {
        let requests: Vec<PowerRequest> = {
            let sessions = self.sessions.lock();
            sessions.iter().map(|s| s.power()).collect()
        };

        let vote = power::aggregate(&requests, &self.config);
        self.engine.scale_clocks(vote.clock_rate)?;
        self.engine.vote_bus(vote.ab_kbps, vote.ib_kbps)?;
        log::debug!(
            "vote applied: rate {} ab {} ib {}",
            vote.clock_rate,
            vote.ab_kbps,
            vote.ib_kbps
        );
        Ok(vote)
    }

    // -------------------------------------------------------------------------
    // Engine Response Path
    // -------------------------------------------------------------------------

    /// Deposit one asynchronous completion message into a session's queue
    pub fn post_session_message(&self, session_id: u32, msg: MsgPacket) -> CoreResult<()> {
        let session = self
            .find_session(session_id)
            .ok_or(CoreError::SessionReset)?;
        session.queue().post(Box::new(msg))
    }

    /// Deposit a named completion signal for a session
    pub fn post_session_signal(
        &self,
        session_id: u32,
        signal: Signal,
        status: i32,
    ) -> CoreResult<()> {
        let session = self
            .find_session(session_id)
            .ok_or(CoreError::SessionReset)?;
        session.post_signal(signal, status);
        Ok(())
    }
}
