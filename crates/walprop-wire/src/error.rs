//! Wire protocol error types.

use thiserror::Error;
use walprop_types::{Lsn, Term};

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, ProtocolError>;

/// A message could not be decoded or was not the one expected.
///
/// Every variant is a connection-level failure: the peer that sent the bytes
/// is reset, nothing else is affected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The leading tag is not a known message type.
    #[error("unknown {direction} message tag {tag:#x}")]
    UnknownTag { direction: &'static str, tag: u64 },

    /// Buffer is shorter than the fixed part of the message.
    #[error("{message} needs at least {needed} bytes, got {actual}")]
    TooShort {
        message: &'static str,
        needed: usize,
        actual: usize,
    },

    /// Buffer ended in the middle of a field.
    #[error("{message} truncated while reading {field}")]
    Truncated {
        message: &'static str,
        field: &'static str,
    },

    /// Greeting carried the wrong magic constant.
    #[error("bad greeting magic {found:#x}, expected {expected:#x}")]
    BadMagic { found: u32, expected: u32 },

    /// Greeting carried a protocol version we do not speak.
    #[error("unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Term history entries are not ordered by term.
    #[error("term history entry {index} is not ordered by term")]
    UnorderedTermHistory { index: usize },

    /// A term both logs hold began at different positions.
    #[error("term {term} began at {theirs} on the acceptor but at {ours} on the proposer")]
    InconsistentTermHistory { term: Term, ours: Lsn, theirs: Lsn },

    /// Append request range is inverted.
    #[error("append request begin {begin} is past end {end}")]
    InvalidAppendRange { begin: Lsn, end: Lsn },

    /// Append request carries more WAL than one message may.
    #[error("append request carries {size} bytes, maximum is {max}")]
    PayloadTooLarge { size: u64, max: usize },

    /// A known storage feedback key has a value of the wrong length.
    #[error("storage feedback key '{key}' has length {len}, expected 8")]
    InvalidFeedbackLength { key: &'static str, len: i32 },

    /// A storage feedback key is not NUL terminated or not UTF-8.
    #[error("storage feedback key is malformed")]
    MalformedFeedbackKey,

    /// A well-formed message arrived in a state that expects another type.
    #[error("expected {expected}, received {found}")]
    UnexpectedMessage {
        expected: &'static str,
        found: &'static str,
    },
}
