//! Proposer error types.

use thiserror::Error;
use walprop_config::ConfigError;
use walprop_types::{Lsn, Term};
use walprop_wire::ProtocolError;

/// Result type for proposer operations.
pub type ProposerResult<T> = Result<T, ProposerError>;

/// Errors raised by the proposer.
///
/// `Connect` and `Protocol` are local to one peer: the peer is reset and the
/// error is logged. `ObsoleteTerm` restarts the election epoch. The rest are
/// returned to the host.
#[derive(Debug, Error)]
pub enum ProposerError {
    /// Connecting to or talking with an acceptor failed.
    #[error("peer {peer} ({endpoint}): {reason}")]
    Connect {
        peer: usize,
        endpoint: String,
        reason: String,
    },

    /// An acceptor sent bytes that do not decode, or the wrong message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An acceptor has seen a term above ours; another proposer is running.
    #[error("peer {peer} reported term {observed}, above our term {ours}")]
    ObsoleteTerm {
        peer: usize,
        observed: Term,
        ours: Term,
    },

    /// Too few acceptors are connected to ever reach a quorum.
    #[error("{connected} acceptors connected, quorum needs {quorum}")]
    QuorumUnavailable { connected: usize, quorum: usize },

    /// The WAL source could not supply WAL to stream.
    #[error("failed to read WAL at {lsn}: {source}")]
    WalRead {
        lsn: Lsn,
        #[source]
        source: std::io::Error,
    },

    /// WAL between the truncate position and the epoch start could not be
    /// fetched from the donor.
    #[error("failed to download WAL [{start}, {end}) from donor peer {donor}")]
    Recovery { donor: usize, start: Lsn, end: Lsn },

    /// Invalid proposer configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// No secure random source for the proposer id.
    #[error("secure random source unavailable")]
    RandomUnavailable,
}
