//! # Core Configuration
//!
//! All tunables are injected at core construction through [`CoreConfig`];
//! there is no mutable global state. Debug tunables are read through the
//! introspection surface only.

use std::time::Duration;

/// Debug tunables
#[derive(Debug, Clone, Copy)]
pub struct DebugFlags {
    /// Log every submitted packet at debug level
    pub log_packets: bool,
    /// Permit the administrative subsystem-failure trigger
    pub allow_ssr_trigger: bool,
}

impl Default for DebugFlags {
    fn default() -> Self {
        DebugFlags {
            log_packets: false,
            allow_ssr_trigger: true,
        }
    }
}

/// Injected driver-core configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Allowed core clock rates in Hz, ascending; votes quantize up into
    /// this table
    pub clock_table: Vec<u64>,
    /// Bus bandwidth cap in KBps
    pub bus_cap_kbps: u64,
    /// Maximum blocking-receive wait
    pub receive_timeout: Duration,
    /// Maximum wait for a named completion signal
    pub signal_timeout: Duration,
    /// Maximum wait on one input fence inside a fence-gated worker
    pub fence_wait_timeout: Duration,
    /// Size of the persistent buffer established at session create
    pub persistent_buf_size: u32,
    /// Fence table capacity
    pub fence_capacity: usize,
    /// Debug tunables
    pub debug: DebugFlags,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            clock_table: vec![240_000_000, 338_000_000, 366_000_000, 444_000_000],
            bus_cap_kbps: 6_533_000,
            receive_timeout: Duration::from_secs(2),
            signal_timeout: Duration::from_secs(2),
            fence_wait_timeout: Duration::from_secs(1),
            persistent_buf_size: 2 * 1024 * 1024,
            fence_capacity: 512,
            debug: DebugFlags::default(),
        }
    }
}

impl CoreConfig {
    /// Lowest allowed clock rate
    pub fn min_rate(&self) -> u64 {
        self.clock_table.first().copied().unwrap_or(0)
    }

    /// Highest allowed clock rate
    pub fn max_rate(&self) -> u64 {
        self.clock_table.last().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_ascending() {
        let config = CoreConfig::default();
        assert!(config.clock_table.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(config.min_rate(), 240_000_000);
        assert_eq!(config.max_rate(), 444_000_000);
    }
}
