//! Error types for dual-mapped JIT memory
//!
//! Every failure the translator can observe is reported as an explicit
//! [`JitMemoryError`] value. Only [`JitMemoryError::InvalidAddress`] signals a
//! caller bug; everything else is an expected condition that sends the
//! translator back to the interpreter.

use std::fmt;
use std::time::Duration;

/// Error types for region creation, allocation, translation and activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitMemoryError {
    /// Backing memory or address space unavailable
    ResourceExhausted { operation: &'static str, errno: i32 },

    /// Host refused the mapping (typically execute permission without a JIT grant)
    PermissionDenied { operation: &'static str, errno: i32 },

    /// Bump allocator ran out of space in the region
    RegionExhausted { requested: usize, remaining: usize },

    /// Address outside the owned region (dangling or foreign pointer)
    InvalidAddress { address: usize },

    /// Host did not grant JIT before the wait elapsed
    ActivationTimeout { waited: Duration },

    /// Region manager used before a successful `initialize`
    NotInitialized,

    /// Zero-byte region or allocation, or a non power-of-two alignment
    InvalidSize(usize),

    /// Configuration could not be parsed
    Config(String),
}

impl JitMemoryError {
    /// Classify an OS error number returned by a mapping primitive.
    pub(crate) fn from_errno(operation: &'static str, errno: i32) -> Self {
        if errno == libc::EACCES || errno == libc::EPERM {
            JitMemoryError::PermissionDenied { operation, errno }
        } else {
            JitMemoryError::ResourceExhausted { operation, errno }
        }
    }

    /// Capture `errno` of the last failed libc call.
    pub(crate) fn last_os_error(operation: &'static str) -> Self {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::ENOMEM);
        Self::from_errno(operation, errno)
    }

    /// True for internal inconsistencies that may be escalated to a hard stop.
    #[inline]
    pub fn is_programming_error(&self) -> bool {
        matches!(self, JitMemoryError::InvalidAddress { .. })
    }

    /// True when the translator should continue in the interpreter.
    #[inline]
    pub fn should_fall_back(&self) -> bool {
        matches!(
            self,
            JitMemoryError::ResourceExhausted { .. }
                | JitMemoryError::PermissionDenied { .. }
                | JitMemoryError::RegionExhausted { .. }
                | JitMemoryError::ActivationTimeout { .. }
                | JitMemoryError::NotInitialized
        )
    }
}

impl fmt::Display for JitMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitMemoryError::ResourceExhausted { operation, errno } => write!(
                f,
                "Resource exhausted during {}: {}",
                operation,
                std::io::Error::from_raw_os_error(*errno)
            ),
            JitMemoryError::PermissionDenied { operation, errno } => write!(
                f,
                "Permission denied during {}: {}",
                operation,
                std::io::Error::from_raw_os_error(*errno)
            ),
            JitMemoryError::RegionExhausted {
                requested,
                remaining,
            } => write!(
                f,
                "Region exhausted: requested {} bytes, {} remaining",
                requested, remaining
            ),
            JitMemoryError::InvalidAddress { address } => {
                write!(f, "Invalid address {:#x}: outside the JIT region", address)
            }
            JitMemoryError::ActivationTimeout { waited } => {
                write!(f, "JIT activation timed out after {:?}", waited)
            }
            JitMemoryError::NotInitialized => write!(f, "JIT region not initialized"),
            JitMemoryError::InvalidSize(size) => write!(f, "Invalid size: {}", size),
            JitMemoryError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for JitMemoryError {}

/// Result type for JIT memory operations
pub type JitMemoryResult<T> = Result<T, JitMemoryError>;
