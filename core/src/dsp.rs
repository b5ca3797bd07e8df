//! # DSP Link
//!
//! Driver-side state for the companion DSP co-processor channel. Buffer
//! register/deregister are remote calls with one completion event shared
//! across all callers of that call type, so callers of the same type
//! serialize on a call mutex; the response handler only ever completes the
//! one outstanding request of each kind.
//!
//! The remote waits are unbounded: the protocol assumes the DSP service
//! always eventually responds. A detached channel (service restart) fails
//! senders fast and unblocks anyone already waiting.

use std::sync::Arc;

use prism_hal::{DeviceAddr, HalError, RemoteCmdKind, RemoteCommand, RemoteEndpoint, RemoteResponse};
use spin::Mutex as SpinMutex;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::sync::Completion;

/// Status deposited into pending completions when the channel drops
const LINK_RESET_STATUS: i32 = -104;

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No endpoint has ever attached
    Init,
    /// Endpoint attached and serviceable
    Ok,
    /// Endpoint lost; the remote service is restarting
    ServiceRestart,
    /// Shut down by request
    Deinit,
}

struct Channel {
    endpoint: Option<Arc<dyn RemoteEndpoint>>,
    state: LinkState,
}

/// The DSP co-processor link
pub struct DspLink {
    chan: SpinMutex<Channel>,
    reg_lock: Mutex<()>,
    dereg_lock: Mutex<()>,
    shutdown_lock: Mutex<()>,
    reg_done: Completion,
    dereg_done: Completion,
    shutdown_done: Completion,
}

impl DspLink {
    /// Create a link with no endpoint attached
    pub fn new() -> Self {
        DspLink {
            chan: SpinMutex::new(Channel {
                endpoint: None,
                state: LinkState::Init,
            }),
            reg_lock: Mutex::new(()),
            dereg_lock: Mutex::new(()),
            shutdown_lock: Mutex::new(()),
            reg_done: Completion::new(),
            dereg_done: Completion::new(),
            shutdown_done: Completion::new(),
        }
    }

    /// Attach a live endpoint (remote service probed)
    pub fn attach(&self, endpoint: Arc<dyn RemoteEndpoint>) {
        let mut chan = self.chan.lock();
        chan.endpoint = Some(endpoint);
        chan.state = LinkState::Ok;
        log::info!("dsp link attached");
    }

    /// Drop the endpoint (remote service restart).
    ///
    /// Anyone blocked on a remote completion is unwedged with a reset
    /// status.
    pub fn detach(&self) {
        {
            let mut chan = self.chan.lock();
            chan.endpoint = None;
            chan.state = LinkState::ServiceRestart;
        }
        self.reg_done.complete(LINK_RESET_STATUS);
        self.dereg_done.complete(LINK_RESET_STATUS);
        self.shutdown_done.complete(LINK_RESET_STATUS);
        log::warn!("dsp link detached, service restart");
    }

    /// Current channel state
    pub fn state(&self) -> LinkState {
        self.chan.lock().state
    }

    fn send(&self, cmd: &RemoteCommand) -> CoreResult<()> {
        let endpoint = {
            let chan = self.chan.lock();
            chan.endpoint.clone()
        };
        match endpoint {
            Some(endpoint) => Ok(endpoint.send(cmd)?),
            None => Err(CoreError::Hal(HalError::ChannelDown)),
        }
    }

    /// Register a mapped buffer with the DSP; blocks until the remote
    /// responds
    pub fn register_buffer(
        &self,
        addr: DeviceAddr,
        index: u32,
        size: u32,
        session_id: u32,
    ) -> CoreResult<()> {
        let guard = self.reg_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.reg_done.reset();
        self.send(&RemoteCommand {
            kind: RemoteCmdKind::RegisterBuffer,
            device_addr: addr.0,
            index,
            size,
            session_id,
        })?;
        let status = self.reg_done.wait();
        drop(guard);

        if status != 0 {
            log::error!("dsp register failed addr={:#x} rc={}", addr.0, status);
            return Err(CoreError::Remote(status));
        }
        Ok(())
    }

    /// Remove a buffer registration from the DSP; blocks until the remote
    /// responds
    pub fn deregister_buffer(
        &self,
        addr: DeviceAddr,
        index: u32,
        size: u32,
        session_id: u32,
    ) -> CoreResult<()> {
        let guard = self.dereg_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.dereg_done.reset();
        self.send(&RemoteCommand {
            kind: RemoteCmdKind::DeregisterBuffer,
            device_addr: addr.0,
            index,
            size,
            session_id,
        })?;
        let status = self.dereg_done.wait();
        drop(guard);

        if status != 0 {
            log::error!("dsp deregister failed addr={:#x} rc={}", addr.0, status);
            return Err(CoreError::Remote(status));
        }
        Ok(())
    }

    /// Ask the remote side to suspend; fire-and-forget, skipped during a
    /// service restart
    pub fn suspend(&self) -> CoreResult<()> {
        if self.state() == LinkState::ServiceRestart {
            return Ok(());
        }
        self.send(&RemoteCommand::control(RemoteCmdKind::Suspend))
    }

    /// Ask the remote side to resume; fire-and-forget, skipped during a
    /// service restart
    pub fn resume(&self) -> CoreResult<()> {
        if self.state() == LinkState::ServiceRestart {
            return Ok(());
        }
        self.send(&RemoteCommand::control(RemoteCmdKind::Resume))
    }

    /// Shut the remote service down and wait for its acknowledgement
    pub fn shutdown(&self) -> CoreResult<()> {
        let guard = self.shutdown_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.shutdown_done.reset();
        self.send(&RemoteCommand::control(RemoteCmdKind::Shutdown))?;
        let status = self.shutdown_done.wait();
        drop(guard);

        self.chan.lock().state = LinkState::Deinit;
        if status != 0 {
            return Err(CoreError::Remote(status));
        }
        Ok(())
    }

    /// Response demultiplexer; called from the remote callback context
    pub fn handle_response(&self, response: RemoteResponse) {
        log::debug!(
            "dsp response kind={:?} status={}",
            response.kind,
            response.status
        );
        match response.kind {
            RemoteCmdKind::RegisterBuffer => self.reg_done.complete(response.status),
            RemoteCmdKind::DeregisterBuffer => self.dereg_done.complete(response.status),
            RemoteCmdKind::Shutdown => self.shutdown_done.complete(response.status),
            other => {
                log::error!("unexpected dsp response kind {:?}", other);
            }
        }
    }
}

impl Default for DspLink {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
