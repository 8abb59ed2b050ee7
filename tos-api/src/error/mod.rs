//! Error handling module for the TOS virtual memory core

use core::fmt;

use crate::types::VirtAddr;

/// Reason a block transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    /// The named device does not exist or could not be opened
    NoDevice,
    /// Block number is past the end of the device
    OutOfRange(u64),
    /// The buffer handed to the device is not exactly one block
    BadLength(usize),
    /// Fewer bytes were transferred than requested
    ShortTransfer,
    /// The device reported a hardware error code
    Device(i32),
}

impl fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoErrorKind::NoDevice => write!(f, "no such device"),
            IoErrorKind::OutOfRange(block) => write!(f, "block {} out of range", block),
            IoErrorKind::BadLength(len) => write!(f, "buffer of {} bytes is not one block", len),
            IoErrorKind::ShortTransfer => write!(f, "short transfer"),
            IoErrorKind::Device(code) => write!(f, "device error {}", code),
        }
    }
}

/// Broad classes of failure, used by callers to pick a recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The machine cannot run user programs at all
    FatalConfiguration,
    /// Out of swap slots or memory for metadata
    ResourceExhaustion,
    /// Bad address or genuine protection fault; the faulting process dies
    AccessViolation,
    /// Swap device read or write failed
    IoFailure,
    /// The caller passed something the core does not accept
    Usage,
}

/// Common error type used throughout the VM core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Fault address lies outside every region of the address space
    InvalidAddress(VirtAddr),
    /// Write to a page whose region is read-only
    PermissionViolation(VirtAddr),
    /// A fault arrived while no address space was active
    NoAddressSpace,
    /// The address space handle refers to a destroyed address space
    StaleAddressSpace,
    /// Out of memory for page-table metadata
    OutOfMemory,
    /// Every swap slot is in use
    SwapExhausted,
    /// Block I/O error
    Io(IoErrorKind),
    /// Invalid argument
    InvalidArgument(&'static str),
    /// Invalid state
    InvalidState(&'static str),
    /// Not implemented
    NotImplemented(&'static str),
    /// Configuration error
    ConfigError(&'static str),
}

impl Error {
    /// Classifies the error into the recovery taxonomy
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidAddress(_) | Error::PermissionViolation(_) | Error::NoAddressSpace => {
                ErrorCategory::AccessViolation
            }
            Error::OutOfMemory | Error::SwapExhausted => ErrorCategory::ResourceExhaustion,
            Error::Io(_) => ErrorCategory::IoFailure,
            Error::ConfigError(_) => ErrorCategory::FatalConfiguration,
            Error::StaleAddressSpace
            | Error::InvalidArgument(_)
            | Error::InvalidState(_)
            | Error::NotImplemented(_) => ErrorCategory::Usage,
        }
    }

    /// True when the faulting process must be killed rather than retried
    pub const fn is_fatal_to_process(&self) -> bool {
        matches!(self.category(), ErrorCategory::AccessViolation)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidAddress(addr) => write!(f, "Invalid address: {:#x}", addr.as_usize()),
            Error::PermissionViolation(addr) => {
                write!(f, "Permission violation at {:#x}", addr.as_usize())
            }
            Error::NoAddressSpace => write!(f, "No address space"),
            Error::StaleAddressSpace => write!(f, "Stale address space handle"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::SwapExhausted => write!(f, "Out of swap slots"),
            Error::Io(kind) => write!(f, "I/O error: {}", kind),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl From<IoErrorKind> for Error {
    fn from(kind: IoErrorKind) -> Self {
        Error::Io(kind)
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

/// Creates a new invalid argument error
pub fn invalid_argument(msg: &'static str) -> Error {
    Error::InvalidArgument(msg)
}

/// Creates a new invalid state error
pub fn invalid_state(msg: &'static str) -> Error {
    Error::InvalidState(msg)
}

/// Creates a new not implemented error
pub fn not_implemented(msg: &'static str) -> Error {
    Error::NotImplemented(msg)
}

/// Creates a new out of memory error
pub fn out_of_memory() -> Error {
    Error::OutOfMemory
}

/// Creates a new I/O error
pub fn io_error(kind: IoErrorKind) -> Error {
    Error::Io(kind)
}

/// Creates a new config error
pub fn config_error(msg: &'static str) -> Error {
    Error::ConfigError(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let addr = VirtAddr::new(0x4000);
        assert_eq!(Error::InvalidAddress(addr).category(), ErrorCategory::AccessViolation);
        assert_eq!(Error::PermissionViolation(addr).category(), ErrorCategory::AccessViolation);
        assert_eq!(Error::SwapExhausted.category(), ErrorCategory::ResourceExhaustion);
        assert_eq!(out_of_memory().category(), ErrorCategory::ResourceExhaustion);
        assert_eq!(io_error(IoErrorKind::ShortTransfer).category(), ErrorCategory::IoFailure);
        assert_eq!(config_error("x").category(), ErrorCategory::FatalConfiguration);
        assert_eq!(invalid_argument("x").category(), ErrorCategory::Usage);
    }

    #[test]
    fn test_fatal_to_process() {
        assert!(Error::NoAddressSpace.is_fatal_to_process());
        assert!(!Error::Io(IoErrorKind::Device(5)).is_fatal_to_process());
        assert!(!Error::SwapExhausted.is_fatal_to_process());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = IoErrorKind::OutOfRange(9).into();
        assert_eq!(err, Error::Io(IoErrorKind::OutOfRange(9)));
    }
}
