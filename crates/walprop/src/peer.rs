//! Per-acceptor connection record.

use std::fmt::{self, Display};
use std::time::Duration;

use walprop_types::{Lsn, Term};
use walprop_wire::{AcceptorGreeting, AppendRequestHeader, AppendResponse, VoteResponse};

use crate::api::Readiness;

/// Connection state of one acceptor, in the order a connection normally goes
/// through them.
///
/// Most states fall back to `Offline` on failure. Leaving `Offline` only
/// happens through a reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SafekeeperState {
    /// No connection. Left only by reconnecting, to `ConnectingWrite`.
    #[default]
    Offline,
    /// Nonblocking connect in progress, waiting for write readiness.
    ConnectingWrite,
    /// Nonblocking connect in progress, waiting for read readiness.
    ConnectingRead,
    /// `START_WAL_PUSH` sent, waiting for the command result.
    WaitExecResult,
    /// Greeting sent, waiting for the acceptor's greeting.
    HandshakeRecv,
    /// Greeted. Waiting for a quorum of greetings before asking for a vote.
    Voting,
    /// Vote requested, waiting for the response.
    WaitVerdict,
    /// `ProposerElected` partially sent, waiting to flush it.
    SendElectedFlush,
    /// Voted (or elected sent), waiting to start streaming.
    Idle,
    /// Streaming WAL and receiving acknowledgements.
    Active,
}

impl SafekeeperState {
    /// Socket interest while in this state, `None` when unregistered.
    pub fn interest(self, flush_pending: bool) -> Option<Readiness> {
        match self {
            Self::Offline => None,
            Self::ConnectingWrite => Some(Readiness::WRITABLE),
            Self::SendElectedFlush => Some(Readiness::READ_WRITE),
            Self::Active if flush_pending => Some(Readiness::READ_WRITE),
            // Idle states watch for EOF.
            _ => Some(Readiness::READABLE),
        }
    }
}

impl Display for SafekeeperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::ConnectingWrite | Self::ConnectingRead => "connecting",
            Self::WaitExecResult => "receiving query result",
            Self::HandshakeRecv => "handshake (receiving)",
            Self::Voting => "voting",
            Self::WaitVerdict => "wait-for-verdict",
            Self::SendElectedFlush => "send-announcement-flush",
            Self::Idle => "idle",
            Self::Active => "active",
        };
        f.write_str(name)
    }
}

/// One configured acceptor. Lives for the whole process; connections come
/// and go.
#[derive(Debug)]
pub struct Safekeeper<C> {
    pub(crate) endpoint: String,
    /// `None` exactly when `state` is `Offline`.
    pub(crate) conn: Option<C>,
    pub(crate) state: SafekeeperState,

    /// Where streaming to this acceptor starts, fixed at election.
    pub(crate) start_streaming_at: Lsn,
    /// End of WAL already sent; never moves back while streaming.
    pub(crate) streaming_at: Lsn,
    /// Part of an append request is still buffered in the connection.
    pub(crate) flush_write: bool,
    pub(crate) last_append: Option<AppendRequestHeader>,

    pub(crate) greeting: Option<AcceptorGreeting>,
    /// The greeting counted towards this epoch's greeting quorum.
    pub(crate) greeted_this_epoch: bool,
    /// Granted vote for the current term; cleared on disconnect.
    pub(crate) vote_response: Option<VoteResponse>,
    pub(crate) append_response: Option<AppendResponse>,
    /// Term of the `ProposerElected` already queued on this connection.
    pub(crate) elected_term: Option<Term>,

    pub(crate) latest_msg_received_at: Duration,
}

impl<C> Safekeeper<C> {
    pub(crate) fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            conn: None,
            state: SafekeeperState::Offline,
            start_streaming_at: Lsn::INVALID,
            streaming_at: Lsn::INVALID,
            flush_write: false,
            last_append: None,
            greeting: None,
            greeted_this_epoch: false,
            vote_response: None,
            append_response: None,
            elected_term: None,
            latest_msg_received_at: Duration::ZERO,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> SafekeeperState {
        self.state
    }

    pub fn streaming_at(&self) -> Lsn {
        self.streaming_at
    }

    pub fn start_streaming_at(&self) -> Lsn {
        self.start_streaming_at
    }

    pub fn greeting(&self) -> Option<&AcceptorGreeting> {
        self.greeting.as_ref()
    }

    pub fn vote_response(&self) -> Option<&VoteResponse> {
        self.vote_response.as_ref()
    }

    pub fn append_response(&self) -> Option<&AppendResponse> {
        self.append_response.as_ref()
    }

    pub fn last_append(&self) -> Option<&AppendRequestHeader> {
        self.last_append.as_ref()
    }

    /// Flush position acknowledged by this acceptor, if it is streaming.
    pub(crate) fn active_flush_lsn(&self) -> Option<Lsn> {
        if self.state != SafekeeperState::Active {
            return None;
        }
        self.append_response.map(|r| r.flush_lsn)
    }

    /// Forgets everything tied to the closed connection.
    pub(crate) fn clear_connection_state(&mut self) {
        self.state = SafekeeperState::Offline;
        self.streaming_at = Lsn::INVALID;
        self.flush_write = false;
        self.vote_response = None;
        self.elected_term = None;
    }

    /// Forgets everything tied to the epoch.
    pub(crate) fn clear_epoch_state(&mut self) {
        self.greeting = None;
        self.greeted_this_epoch = false;
        self.append_response = None;
        self.start_streaming_at = Lsn::INVALID;
        self.last_append = None;
    }
}
