//! Error types for the echo endpoint, its codec and the probe harness.
//!
//! Every receive-side failure maps to the close code the endpoint sends
//! before dropping the transport; see [`Error::close_code`].

use thiserror::Error;

use crate::message::CloseCode;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handshaking, framing, compressing or
/// assembling messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Peer broke an RFC 6455 framing rule.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Text message did not decode as UTF-8.
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    /// A single frame exceeds the configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Announced frame length.
        size: usize,
        /// Maximum allowed frame length.
        max: usize,
    },

    /// The message, compressed or inflated, exceeds the configured maximum.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Size reached when the limit tripped.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many continuation frames in one message.
    #[error("Too many fragments: {count} (max: {max})")]
    TooManyFragments {
        /// Fragment count reached.
        count: usize,
        /// Maximum allowed fragments.
        max: usize,
    },

    /// Connection is closed; carries the peer's close code if one was received.
    #[error("Connection closed: {0:?}")]
    ConnectionClosed(Option<u16>),

    /// Upgrade request or response was malformed.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Handshake bytes exceeded the configured maximum before the blank line.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Bytes read so far.
        size: usize,
        /// Maximum allowed handshake size.
        max: usize,
    },

    /// A header value contained characters that are not allowed.
    #[error("Invalid header value for {header}: {reason}")]
    InvalidHeaderValue {
        /// Header name.
        header: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Extension response could not be accepted by the client.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    /// Compressed payload was not a valid raw DEFLATE stream.
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// Outgoing payload could not be compressed.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// Close frame carried a code that must not appear on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame with FIN clear.
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload above 125 bytes.
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Server received a frame without a masking key.
    #[error("Client frame must be masked")]
    UnmaskedClientFrame,

    /// Client received a masked frame.
    #[error("Server frame must not be masked")]
    MaskedServerFrame,

    /// RSV bit set that no negotiated extension defines.
    #[error("Reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Buffer ends before the frame does.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },

    /// A bounded wait elapsed.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Close code this endpoint sends when the error ends a connection.
    ///
    /// Returns `None` for failures where no close frame can or should be
    /// sent (transport errors, already-closed connections, timeouts).
    #[must_use]
    pub const fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::MessageTooLarge { .. }
            | Error::FrameTooLarge { .. }
            | Error::TooManyFragments { .. } => Some(CloseCode::MessageTooBig),
            Error::InvalidUtf8 => Some(CloseCode::InvalidPayload),
            Error::ProtocolViolation(_)
            | Error::Decompression(_)
            | Error::InvalidCloseCode(_)
            | Error::ReservedOpcode(_)
            | Error::FragmentedControlFrame
            | Error::ControlFrameTooLarge(_)
            | Error::UnmaskedClientFrame
            | Error::MaskedServerFrame
            | Error::ReservedBitsSet => Some(CloseCode::ProtocolError),
            Error::Compression(_) => Some(CloseCode::InternalError),
            Error::ConnectionClosed(_)
            | Error::InvalidHandshake(_)
            | Error::HandshakeTooLarge { .. }
            | Error::InvalidHeaderValue { .. }
            | Error::InvalidExtension(_)
            | Error::IncompleteFrame { .. }
            | Error::Timeout(_)
            | Error::Io(_) => None,
        }
    }

    /// Returns `true` for failures that happened before the upgrade completed.
    #[must_use]
    pub const fn is_handshake(&self) -> bool {
        matches!(
            self,
            Error::InvalidHandshake(_)
                | Error::HandshakeTooLarge { .. }
                | Error::InvalidHeaderValue { .. }
                | Error::InvalidExtension(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<flate2::CompressError> for Error {
    fn from(err: flate2::CompressError) -> Self {
        Error::Compression(err.to_string())
    }
}

impl From<flate2::DecompressError> for Error {
    fn from(err: flate2::DecompressError) -> Self {
        Error::Decompression(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(0)
    }
}
