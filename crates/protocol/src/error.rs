//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Packet errors
    /// The tag byte does not name a known packet type.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// A message carried no tag byte at all.
    #[error("empty packet: message has no type tag")]
    EmptyPacket,

    /// A packet type that carries no payload arrived with trailing bytes.
    #[error("unexpected payload: {0} trailing bytes after a payload-less packet")]
    UnexpectedPayload(usize),

    // Handshake errors
    /// An environment entry in the initial payload is not of the form NAME=VALUE.
    #[error("malformed environment entry: {0:?}")]
    MalformedEnvironment(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other I/O failure on the underlying transport.
    #[error("I/O error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// Returns true for errors caused by the peer violating the protocol.
    ///
    /// These are never recoverable: the session that produced them is torn down.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownPacketType(_)
                | ProtocolError::EmptyPacket
                | ProtocolError::UnexpectedPayload(_)
                | ProtocolError::MalformedEnvironment(_)
                | ProtocolError::Deserialization(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_unknown_packet_type_display() {
        let err = ProtocolError::UnknownPacketType(0x7f);
        assert_eq!(err.to_string(), "unknown packet type: 127");
    }

    #[test]
    fn test_malformed_environment_display() {
        let err = ProtocolError::MalformedEnvironment("NOEQUALS".to_string());
        assert_eq!(
            err.to_string(),
            "malformed environment entry: \"NOEQUALS\""
        );
    }

    #[test]
    fn test_violations_are_classified() {
        assert!(ProtocolError::UnknownPacketType(9).is_violation());
        assert!(ProtocolError::EmptyPacket.is_violation());
        assert!(ProtocolError::UnexpectedPayload(3).is_violation());
        assert!(ProtocolError::MalformedEnvironment("X".into()).is_violation());
        assert!(!ProtocolError::ConnectionClosed("eof".into()).is_violation());
        assert!(!ProtocolError::Timeout("slow".into()).is_violation());
        assert!(!ProtocolError::FrameTooLarge { size: 2, max: 1 }.is_violation());
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
