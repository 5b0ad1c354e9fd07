//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Every decoder failure collapses into one of these: a version word the
/// server does not speak, a message that violates the wire format, or a
/// transport-level I/O failure while framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Protocol version word did not match the supported version
    #[error("unsupported protocol version {version:#06x} (expected {expected:#06x})")]
    UnsupportedVersion { version: u16, expected: u16 },

    /// Message violates the wire format (unknown codes, bad lengths,
    /// fields out of range)
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    /// I/O error while reading or writing frames
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::Malformed`]
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
