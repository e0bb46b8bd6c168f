//! # walprop-wire: proposer/acceptor wire protocol
//!
//! Binary encoding of the messages exchanged between a WAL proposer and its
//! acceptors. Fixed fields are little-endian; the storage feedback section
//! appended to append responses is a self-describing key/value list with
//! big-endian values.
//!
//! Decoding never panics on malformed input: every short or inconsistent
//! buffer becomes a [`ProtocolError`].

pub(crate) mod codec;
mod error;
mod feedback;
mod message;

pub use error::{ProtocolError, WireResult};
pub use feedback::{HotStandbyFeedback, StorageFeedback};
pub use message::{
    APPEND_REQUEST_HEADER_SIZE, APPEND_RESPONSE_FIXED_SIZE, AcceptorGreeting, AcceptorMessage,
    AppendRequest, AppendRequestHeader, AppendResponse, ProposerElected, ProposerGreeting,
    ProposerMessage, VoteRequest, VoteResponse,
};

/// Magic number opening every proposer greeting.
pub const SK_MAGIC: u32 = 0xCAFE_CEEF;

/// Protocol version spoken by this crate.
pub const SK_PROTOCOL_VERSION: u32 = 2;

/// Maximum number of WAL bytes carried by a single append request.
pub const MAX_SEND_SIZE: usize = 128 * 1024;

/// Command that switches an acceptor connection into WAL push mode.
pub const START_WAL_PUSH: &str = "START_WAL_PUSH";
