use std::time::Duration;
use thiserror::Error;

/// I/O failure on the control device. Fatal to the current session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("device closed")]
    Closed,
}

/// A frame that could not be decoded, or a response that makes no sense.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unexpected frame marker 0x{0:02x}")]
    BadMarker(u8),

    #[error("length field says {declared} bytes but frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message type 0x{0:08x}")]
    UnknownMessageType(u32),

    #[error("mandatory TLV 0x{0:02x} missing")]
    MissingTlv(u8),

    #[error("TLV 0x{tlv:02x} is malformed: {reason}")]
    InvalidTlv { tlv: u8, reason: &'static str },

    #[error("frame cannot be encoded: {0}")]
    Unencodable(&'static str),
}

/// Outcome of a single synchronous protocol call that did not succeed.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("operation not supported by the modem")]
    DeviceUnsupported,

    #[error("data call rejected: authentication failed")]
    Auth,

    #[error("modem rejected request with error 0x{0:04x}")]
    Rejected(u16),

    #[error("operation not offered by this protocol variant")]
    NotImplemented,

    #[error("transaction id {0} is already outstanding")]
    DuplicateTransaction(u32),
}

impl CallError {
    /// The modem answered and said no, as opposed to the call never completing.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CallError::Auth | CallError::Rejected(_))
    }
}

/// Errors that end a whole session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device did not report connected: {0}")]
    NoDeviceConnected(String),

    #[error("modem init failed: {0}")]
    InitFailed(#[source] CallError),

    #[error("device node {0} did not come back after modem reset")]
    DeviceGone(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(CallError::Auth.is_rejection());
        assert!(CallError::Rejected(0x0e).is_rejection());
        assert!(!CallError::Timeout(Duration::from_secs(1)).is_rejection());
        assert!(!CallError::Transport(TransportError::Closed).is_rejection());
        assert!(!CallError::DeviceUnsupported.is_rejection());
    }
}
