//! # Debug Introspection
//!
//! Read-only textual dump of core and session state, plus the
//! administrative trigger that simulates a subsystem failure. Debug
//! tunables come from the injected configuration; nothing here mutates
//! them at runtime.

use std::fmt::Write;

use crate::driver::{Core, CoreState};
use crate::error::{CoreError, CoreResult};

impl Core {
    /// Render the core and every live session as text
    pub fn debug_dump(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "===============================");
        let _ = writeln!(out, "CORE state: {:?}", self.state());
        let _ = writeln!(out, "===============================");

        match self.engine.fw_info() {
            Ok(fw) => {
                let _ = writeln!(out, "FW version: {:#x}", fw.version);
                let _ = writeln!(out, "base addr: {:#x}", fw.base_addr);
                let _ = writeln!(out, "register_base: {:#x}", fw.register_base);
                let _ = writeln!(out, "register_size: {}", fw.register_size);
                let _ = writeln!(out, "irq: {}", fw.irq);
            }
            Err(err) => {
                log::warn!("failed to read FW info");
                let _ = writeln!(out, "FW info unavailable: {}", err);
            }
        }

        let _ = writeln!(out, "DSP link: {:?}", self.dsp.state());
        let _ = writeln!(out, "live fences: {}", self.fences.live_count());

        for session in self.sessions_snapshot() {
            let (cpu, dsp) = session.buf_counts();
            let power = session.power();
            let _ = writeln!(out, "-------------------------------");
            let _ = writeln!(out, "SESSION {:#x}", session.id());
            let _ = writeln!(out, "state: {:?}", session.state());
            let _ = writeln!(
                out,
                "queue: {:?}, {} pending",
                session.queue().state(),
                session.queue().pending()
            );
            let _ = writeln!(out, "bufs: {} cpu, {} dsp", cpu, dsp);
            let _ = writeln!(
                out,
                "power: core {} ctlr {} bw {}",
                power.core_cycles, power.controller_cycles, power.ddr_bw
            );
        }

        out
    }

    /// Simulate a subsystem failure: mark the core errored, drop the DSP
    /// channel, and force-stop every session queue so blocked receivers
    /// observe the teardown outcomes.
    pub fn trigger_ssr(&self) -> CoreResult<()> {
        if !self.config.debug.allow_ssr_trigger {
            return Err(CoreError::NotSupported);
        }

        log::warn!("simulated subsystem failure triggered");
        *self.state.lock() = CoreState::Error;
        self.dsp.detach();

        for session in self.sessions_snapshot() {
            session.queue().force_stop();
        }
        Ok(())
    }
}
