use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at byte {offset}")]
pub struct DecodeError {
    pub offset: usize,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    pub(crate) fn new(offset: usize, kind: DecodeErrorKind) -> Self {
        Self { offset, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid string length")]
    InvalidLength,
    #[error("dictionary key is not a byte string")]
    NonStringKey,
    #[error("duplicate dictionary key")]
    DuplicateKey,
    #[error("pieces length is not a multiple of 20")]
    InvalidPieces,
    #[error("trailing data after value")]
    TrailingData,
    #[error("nesting too deep")]
    NestingTooDeep,
}
