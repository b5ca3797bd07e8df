//! # Error Taxonomy
//!
//! Driver-core error type. Callers receive one status per call; blocking
//! calls additionally distinguish timeout from reset from success, and the
//! unclean-queue condition carries the pending message count so a caller
//! knows whether another drain attempt is worthwhile.

use core::fmt;

use prism_fence::FenceError;
use prism_hal::HalError;

/// Result type for driver-core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Driver-core errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Null/malformed request, offset or size mismatch, deprecated-field
    /// misuse
    InvalidArgument,
    /// Operation not permitted in the session's current state
    InvalidState,
    /// Buffer handle unknown; distinguishes "must map now" from a real
    /// failure during resolution
    NoEntry,
    /// No space left in a bounded table
    Exhausted,
    /// The session was concurrently destroyed or reset
    SessionReset,
    /// Bounded wait elapsed with no completion
    Timeout,
    /// Queue stopped or session invalidated with messages still pending
    UncleanQueue {
        /// Undelivered message count at the time of the failure
        pending: u32,
    },
    /// Queue stopped and fully drained; nothing more will arrive
    Drained,
    /// Unrecognized command type or property
    NotSupported,
    /// An input dependency signaled failure
    DependencyFailed,
    /// The DSP co-processor reported a failure
    Remote(i32),
    /// Transport-level failure
    Hal(HalError),
    /// Fence engine failure
    Fence(FenceError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidArgument => write!(f, "invalid argument"),
            CoreError::InvalidState => write!(f, "invalid session state"),
            CoreError::NoEntry => write!(f, "no such entry"),
            CoreError::Exhausted => write!(f, "resource exhausted"),
            CoreError::SessionReset => write!(f, "session reset"),
            CoreError::Timeout => write!(f, "timed out"),
            CoreError::UncleanQueue { pending } => {
                write!(f, "queue unclean, {} messages pending", pending)
            }
            CoreError::Drained => write!(f, "queue drained and closed"),
            CoreError::NotSupported => write!(f, "not supported"),
            CoreError::DependencyFailed => write!(f, "input dependency failed"),
            CoreError::Remote(code) => write!(f, "remote failure {}", code),
            CoreError::Hal(err) => write!(f, "transport: {}", err),
            CoreError::Fence(err) => write!(f, "fence: {}", err),
        }
    }
}

impl From<HalError> for CoreError {
    fn from(err: HalError) -> Self {
        CoreError::Hal(err)
    }
}

impl From<FenceError> for CoreError {
    fn from(err: FenceError) -> Self {
        CoreError::Fence(err)
    }
}
