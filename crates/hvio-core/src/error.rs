use crate::protocol::DecodeError;
use crate::request::{RequestState, RequestType};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IoEmulError>;

pub const EIO: i32 = 5;
pub const ENODEV: i32 = 19;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ETIMEDOUT: i32 = 110;

/// Status reported by [`crate::emulate_io`] when a request has been forwarded to the device
/// model. It is a positive value: pending is not an error.
pub const IOREQ_PENDING: i32 = 1;

/// Failure reported by an emulation handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (errno {errno})")]
pub struct HandlerError {
    /// Negative errno, as handlers report it.
    pub errno: i32,
    pub reason: &'static str,
}

impl HandlerError {
    /// Accepts the errno with either sign. Zero is not a failure code and becomes `-EIO`.
    pub const fn new(errno: i32, reason: &'static str) -> Self {
        let errno = if errno == 0 { -EIO } else { -errno.saturating_abs() };
        Self { errno, reason }
    }

    pub const fn io(reason: &'static str) -> Self {
        Self::new(EIO, reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoEmulError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("I/O request type {0:?} cannot be emulated here")]
    InvalidType(RequestType),

    #[error("{kind:?} access at {address:#x} (size {size}) spans emulated ranges")]
    SpansRanges {
        kind: RequestType,
        address: u64,
        size: u8,
    },

    #[error("emulation handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("vCPU {vcpu_id} already has an I/O request in flight ({state:?})")]
    RequestInFlight { vcpu_id: u16, state: RequestState },

    #[error("I/O request of vCPU {vcpu_id} is {found:?}, expected {expected:?}")]
    UnexpectedState {
        vcpu_id: u16,
        expected: RequestState,
        found: RequestState,
    },

    #[error("vCPU {vcpu_id}: device model did not complete the I/O request within {timeout:?}")]
    CompletionTimeout { vcpu_id: u16, timeout: Duration },

    #[error("VM {vm_id} has no vCPU {vcpu_id}")]
    NoSuchVcpu { vm_id: u16, vcpu_id: u16 },

    #[error("malformed request slot: {0}")]
    Protocol(#[from] DecodeError),
}

impl IoEmulError {
    /// Negative errno equivalent of this error, for callers that speak the hypercall ABI.
    pub fn errno(&self) -> i32 {
        match self {
            IoEmulError::InvalidArgument(_)
            | IoEmulError::InvalidType(_)
            | IoEmulError::UnexpectedState { .. }
            | IoEmulError::Protocol(_) => -EINVAL,
            IoEmulError::SpansRanges { .. } => -EIO,
            IoEmulError::Handler(err) => err.errno,
            IoEmulError::RequestInFlight { .. } => -EBUSY,
            IoEmulError::CompletionTimeout { .. } => -ETIMEDOUT,
            IoEmulError::NoSuchVcpu { .. } => -ENODEV,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_hypercall_abi() {
        assert_eq!(IoEmulError::InvalidArgument("x").errno(), -EINVAL);
        assert_eq!(IoEmulError::InvalidType(RequestType::PciCfg).errno(), -EINVAL);
        assert_eq!(
            IoEmulError::SpansRanges {
                kind: RequestType::Mmio,
                address: 0,
                size: 4
            }
            .errno(),
            -EIO
        );
        assert_eq!(
            IoEmulError::from(HandlerError::new(ENODEV, "gone")).errno(),
            -ENODEV
        );
    }

    #[test]
    fn handler_errno_is_always_negative() {
        assert_eq!(HandlerError::new(EIO, "a").errno, -EIO);
        assert_eq!(HandlerError::new(-EIO, "b").errno, -EIO);
        assert_eq!(HandlerError::new(i32::MIN, "c").errno, -i32::MAX);
    }

    #[test]
    fn zero_errno_never_reads_as_success() {
        let err = IoEmulError::from(HandlerError::new(0, "unset"));
        assert_eq!(err.errno(), -EIO);
    }
}
