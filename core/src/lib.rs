//! # Prism Driver Core
//!
//! The session command pipeline and cross-domain synchronization core of
//! the Prism compute/vision offload driver.
//!
//! ## Components
//!
//! - **Sessions** ([`session`]): lifecycle state machine, buffer
//!   registries, signal receipts
//! - **Message queue** ([`queue`]): per-session FIFO with blocking receive
//!   and teardown-drain semantics
//! - **Dispatch** ([`dispatch`]): typed command routing, buffer
//!   resolution, fence-gated submission workers
//! - **Arbitration** ([`power`]): aggregation of per-session power asks
//!   into one system-wide clock and bus vote
//! - **DSP link** ([`dsp`]): serialized remote buffer registration against
//!   the companion co-processor
//! - **Introspection** ([`debug`]): textual state dump and the simulated
//!   subsystem-failure trigger
//!
//! The firmware engine, the mapping domain, and the DSP channel are
//! injected through the `prism-hal` traits; fences come from
//! `prism-fence`. All state is in-memory for the lifetime of the device
//! session.

pub mod buffers;
pub mod config;
pub mod debug;
pub mod dispatch;
pub mod driver;
pub mod dsp;
pub mod error;
pub mod power;
pub mod queue;
pub mod session;
pub mod sync;

pub use buffers::{BufferEntry, BufferParams};
pub use config::{CoreConfig, DebugFlags};
pub use dispatch::{Command, Reply, SessionControl, PROP_FW_VERSION};
pub use driver::{Core, CoreState};
pub use dsp::{DspLink, LinkState};
pub use error::{CoreError, CoreResult};
pub use power::{PowerRequest, Vote};
pub use queue::QueueState;
pub use session::{Session, SessionState};
