use thiserror::Error;

/// What went wrong while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolErrorKind {
    #[error("unexpected byte 0x{0:02x}")]
    UnexpectedByte(u8),

    #[error("invalid byte string length")]
    InvalidLength,

    #[error("byte string length {len} exceeds maximum {max}")]
    LengthTooLarge { len: usize, max: usize },

    #[error("invalid integer")]
    InvalidInteger,

    #[error("integer out of range")]
    IntegerOverflow,

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("stream ended in the middle of a value")]
    UnexpectedEof,
}

/// Malformed bytes on the wire. Fatal to the connection that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Protocol error at byte {offset}: {kind}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    /// Offset from the start of the stream.
    pub offset: usize,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }

    /// Shift a buffer-relative offset to a stream offset.
    pub(crate) fn shifted(mut self, base: usize) -> Self {
        self.offset += base;
        self
    }
}

/// A value that has no bencode representation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Encoding error: cannot encode {kind} as bencode")]
pub struct EncodingError {
    pub kind: &'static str,
}
