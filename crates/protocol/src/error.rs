//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding or reading USB/IP wire data
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Truncated or malformed frame; `offset` is the byte position at fault
    #[error("malformed frame at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },

    /// Peer announced a protocol version we do not speak
    #[error("incompatible USB/IP version {version:#06x} (expected {expected:#06x})")]
    IncompatibleVersion { version: u16, expected: u16 },

    /// Unknown op code in the handshake phase
    #[error("unsupported op code {code:#06x}")]
    UnsupportedOp { code: u16 },

    /// Unknown command code in the command phase
    #[error("unsupported command {code:#010x}")]
    UnsupportedCommand { code: u32 },

    /// Declared transfer buffer exceeds the size cap
    #[error("transfer too large: {size} bytes (max: {max})")]
    TransferTooLarge { size: usize, max: usize },

    /// Peer closed the connection at a message boundary
    #[error("peer disconnected")]
    Disconnected,

    /// I/O error while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the session must close. Unknown op codes can be answered
    /// with an error-status reply; everything else desynchronizes the
    /// stream or indicates a broken peer.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::UnsupportedOp { .. })
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::Malformed {
            offset: 12,
            reason: "short busid field",
        };
        let msg = format!("{}", err);
        assert!(msg.contains("offset 12"));
        assert!(msg.contains("short busid field"));
    }

    #[test]
    fn test_fatality() {
        assert!(!ProtocolError::UnsupportedOp { code: 0x8004 }.is_fatal());
        assert!(ProtocolError::UnsupportedCommand { code: 9 }.is_fatal());
        assert!(
            ProtocolError::Malformed {
                offset: 0,
                reason: "empty"
            }
            .is_fatal()
        );
    }
}
