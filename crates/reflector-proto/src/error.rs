//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The payload is too short, or a field is corrupt, for the message
    /// type named by its tag. Carries the field that failed to parse.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// A variable-length field exceeds what its length prefix can carry.
    #[error("field too large to encode: {0}")]
    Oversize(&'static str),

    /// An incoming frame declared a length beyond [`crate::MAX_FRAME_LEN`].
    /// The stream is unrecoverable after this; the connection must close.
    #[error("frame of {0} bytes exceeds maximum frame length")]
    FrameTooLarge(usize),

    /// An I/O error surfaced through the frame codec.
    #[error("frame I/O: {0}")]
    Io(#[from] std::io::Error),
}
