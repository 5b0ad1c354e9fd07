//! Host error classes and their Linux errno mapping
//!
//! `RET_SUBMIT.status` and `RET_UNLINK.status` carry negated Linux errno
//! values; importers (the kernel VHCI driver among them) interpret them
//! directly. This module is the single place where host-side failure
//! conditions turn into wire statuses.

use crate::cmd::IsoPacket;
use std::time::Duration;
use thiserror::Error;

/// A failed device transfer, classified by host condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Malformed or out-of-range request parameters
    #[error("invalid argument")]
    InvalidArgument,
    /// Device is gone or was never present
    #[error("device disconnected")]
    Disconnected,
    /// Device not claimed or access denied by the host
    #[error("permission denied")]
    PermissionDenied,
    /// Device or endpoint busy
    #[error("device busy")]
    Busy,
    /// Endpoint stalled
    #[error("endpoint stalled")]
    Stall,
    /// Deadline expired before the device completed the transfer
    #[error("transfer timed out")]
    TimedOut,
    /// Cancelled by unlink or session shutdown
    #[error("transfer cancelled")]
    Cancelled,
    /// Host out of memory
    #[error("out of memory")]
    NoMemory,
    /// Too many requests in flight
    #[error("too many pending requests")]
    TooManyRequests,
    /// Unclassified I/O failure
    #[error("I/O error")]
    Io,
}

impl TransferError {
    /// The negated Linux errno placed in `RET_SUBMIT.status`
    pub fn status(self) -> i32 {
        match self {
            TransferError::InvalidArgument => -22,  // EINVAL
            TransferError::Disconnected => -19,     // ENODEV
            TransferError::PermissionDenied => -13, // EACCES
            TransferError::Busy => -16,             // EBUSY
            TransferError::Stall => -32,            // EPIPE
            TransferError::TimedOut => -110,        // ETIMEDOUT
            TransferError::Cancelled => -125,       // ECANCELED
            TransferError::NoMemory => -12,         // ENOMEM
            TransferError::TooManyRequests => -11,  // EAGAIN
            TransferError::Io => -5,                // EIO
        }
    }

    /// Whether a caller may reasonably retry after backing off
    ///
    /// Timeouts and resource exhaustion are transient; disconnection,
    /// permission and malformed-request failures are not.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            TransferError::TimedOut
                | TransferError::Busy
                | TransferError::NoMemory
                | TransferError::TooManyRequests
        )
    }
}

/// Base delay for retrying a recoverable error
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Ceiling for the exponential retry backoff
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Recommended backoff before retry attempt `attempt` (0-based)
///
/// `min(base * 2^attempt, max)`.
pub fn retry_backoff(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    RETRY_BASE_DELAY
        .checked_mul(factor)
        .map_or(RETRY_MAX_DELAY, |d| d.min(RETRY_MAX_DELAY))
}

/// A successful device transfer, as reported by the device layer
///
/// `actual_length` always reflects what the device acknowledged; for IN
/// transfers it equals `data.len()`. Iso fields are zero/empty for other
/// transfer types.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    /// IN payload; empty for OUT transfers
    pub data: Vec<u8>,
    pub actual_length: u32,
    /// Frame the device scheduled an iso transfer at
    pub start_frame: u32,
    /// Number of iso packets that failed
    pub error_count: u32,
    pub iso_packets: Vec<IsoPacket>,
}

impl Completion {
    /// Completion of an IN transfer returning `data`
    pub fn data_in(data: Vec<u8>) -> Self {
        Self {
            actual_length: data.len() as u32,
            data,
            ..Self::default()
        }
    }

    /// Completion of an OUT transfer that wrote `written` bytes
    pub fn data_out(written: usize) -> Self {
        Self {
            actual_length: written as u32,
            ..Self::default()
        }
    }
}

/// Outcome of one device transfer
pub type TransferOutcome = std::result::Result<Completion, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_table() {
        assert_eq!(TransferError::InvalidArgument.status(), -22);
        assert_eq!(TransferError::Disconnected.status(), -19);
        assert_eq!(TransferError::PermissionDenied.status(), -13);
        assert_eq!(TransferError::Busy.status(), -16);
        assert_eq!(TransferError::Stall.status(), -32);
        assert_eq!(TransferError::TimedOut.status(), -110);
        assert_eq!(TransferError::Cancelled.status(), -125);
        assert_eq!(TransferError::NoMemory.status(), -12);
        assert_eq!(TransferError::TooManyRequests.status(), -11);
        assert_eq!(TransferError::Io.status(), -5);
    }

    #[test]
    fn test_recoverable_classes() {
        assert!(TransferError::TimedOut.is_recoverable());
        assert!(TransferError::Busy.is_recoverable());
        assert!(TransferError::TooManyRequests.is_recoverable());
        assert!(!TransferError::Disconnected.is_recoverable());
        assert!(!TransferError::PermissionDenied.is_recoverable());
        assert!(!TransferError::InvalidArgument.is_recoverable());
        assert!(!TransferError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_millis(100));
        assert_eq!(retry_backoff(1), Duration::from_millis(200));
        assert_eq!(retry_backoff(3), Duration::from_millis(800));
        assert_eq!(retry_backoff(10), RETRY_MAX_DELAY);
        assert_eq!(retry_backoff(u32::MAX), RETRY_MAX_DELAY);
    }

    #[test]
    fn test_completion_lengths() {
        let completion = Completion::data_in(vec![1, 2, 3]);
        assert_eq!(completion.actual_length, 3);
        let completion = Completion::data_out(7);
        assert_eq!(completion.actual_length, 7);
        assert!(completion.data.is_empty());
    }
}
