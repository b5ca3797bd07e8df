//! # Clock / Bus Arbitration
//!
//! Per-session power asks are normalized against the allowed clock table,
//! then aggregated across every live session into one system-wide clock
//! rate and bandwidth vote. The controller clock runs at a fixed 3:2 ratio
//! to the core clock; a controller ask implying a higher core requirement
//! than stated raises the core figure before table lookup.

use crate::config::CoreConfig;

/// Controller-to-core clock ratio, expressed as a fraction (3/2 = 1.5)
pub const CLOCK_RATIO_NUM: u64 = 3;
/// Denominator of the controller-to-core ratio
pub const CLOCK_RATIO_DEN: u64 = 2;

/// One session's resource ask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerRequest {
    /// Core clock cycles per second
    pub core_cycles: u64,
    /// Controller clock cycles per second
    pub controller_cycles: u64,
    /// DDR bandwidth; bits per second as submitted, KBps once normalized
    pub ddr_bw: u64,
    /// System-cache bandwidth ask (recorded, not arbitrated)
    pub sys_cache_bw: u64,
}

/// The aggregated system-wide vote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vote {
    /// Quantized core clock rate in Hz
    pub clock_rate: u64,
    /// Average bandwidth in KBps
    pub ab_kbps: u64,
    /// Instantaneous bandwidth in KBps
    pub ib_kbps: u64,
}

/// Controller-equivalent of a core rate
fn controller_rate(core_rate: u64) -> u64 {
    core_rate * CLOCK_RATIO_NUM / CLOCK_RATIO_DEN
}

/// Normalize one session's ask against the allowed table.
///
/// Out-of-range clock figures floor to the table minimum (or its
/// controller equivalent). Bandwidth arrives in bps, is recorded in KBps,
/// and an ask beyond the bus cap is cut to half the cap.
pub fn normalize_request(request: &mut PowerRequest, config: &CoreConfig) {
    let min_rate = config.min_rate();
    let max_rate = config.max_rate();

    if request.core_cycles < min_rate || request.core_cycles > max_rate {
        request.core_cycles = min_rate;
    }

    let ctlr_min = controller_rate(min_rate);
    let ctlr_max = controller_rate(max_rate);
    if request.controller_cycles < ctlr_min || request.controller_cycles > ctlr_max {
        request.controller_cycles = ctlr_min;
    }

    // bps to KBps
    request.ddr_bw >>= 10;
    if request.ddr_bw > config.bus_cap_kbps {
        request.ddr_bw = config.bus_cap_kbps >> 1;
    }
}

/// Aggregate every live session's normalized ask into one vote.
///
/// Core and controller cycles are summed independently; if the controller
/// sum implies a higher core requirement than the core sum states, the
/// core sum is raised to the controller equivalent before quantizing up to
/// the first allowed rate that covers it.
pub fn aggregate(requests: &[PowerRequest], config: &CoreConfig) -> Vote {
    let mut core_sum: u64 = 0;
    let mut ctlr_sum: u64 = 0;
    let mut bw_sum: u64 = 0;

    for request in requests {
        core_sum += request.core_cycles;
        ctlr_sum += request.controller_cycles;
        bw_sum += request.ddr_bw;
    }

    // ratio floor: core_sum * 1.5 < ctlr_sum means the controller ask
    // dominates
    if core_sum * CLOCK_RATIO_NUM < ctlr_sum * CLOCK_RATIO_DEN {
        core_sum = ctlr_sum * CLOCK_RATIO_DEN / CLOCK_RATIO_NUM;
    }

    let clock_rate = config
        .clock_table
        .iter()
        .copied()
        .find(|&rate| rate >= core_sum)
        .unwrap_or_else(|| config.max_rate());

    Vote {
        clock_rate,
        ab_kbps: bw_sum.min(config.bus_cap_kbps),
        ib_kbps: 0,
    }
}

// =============================================================================
// Tests
// =============================================================================
