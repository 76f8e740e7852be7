//! # IGNIS Error Handling
//!
//! One error type for the whole submission stack. Every failure is returned
//! to the immediate caller; nothing is swallowed.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// IGNIS Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// IGNIS unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not valid in the current state
    InvalidState,
    /// Operation not supported on this hardware
    NotSupported,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Backing memory exhausted
    OutOfMemory,
    /// Allocation failed
    AllocationFailed,
    /// Write or read past the end of a buffer
    BufferOverflow,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Command buffer cannot hold the requested commands
    CommandBufferFull,
    /// Malformed command in a command stream
    InvalidCommand,
    /// Backend rejected the submission
    SubmissionFailed,
    /// Waiting on a fence did not complete
    FenceTimeout,
    /// GPU hang detected while waiting
    GpuHang,
    /// Surface-state slot ring has no retired slot left
    CapacityExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::BufferOverflow => write!(f, "buffer overflow"),

            // Command
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::FenceTimeout => write!(f, "fence wait timeout"),
            Self::GpuHang => write!(f, "GPU hang detected"),
            Self::CapacityExceeded => write!(f, "scratch slot capacity exceeded"),
        }
    }
}

impl Error {
    /// Check if the failure came from memory exhaustion
    pub const fn is_memory_error(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::AllocationFailed | Self::BufferOverflow
        )
    }

    /// Check if retrying the same operation later can succeed
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SubmissionFailed | Self::FenceTimeout | Self::CommandBufferFull
        )
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display() {
        assert_eq!(Error::SubmissionFailed.to_string(), "submission failed");
        assert_eq!(
            Error::CapacityExceeded.to_string(),
            "scratch slot capacity exceeded"
        );
    }

    #[test]
    fn test_categories() {
        assert!(Error::AllocationFailed.is_memory_error());
        assert!(!Error::SubmissionFailed.is_memory_error());
        assert!(Error::SubmissionFailed.is_recoverable());
        assert!(!Error::CapacityExceeded.is_recoverable());
    }
}
