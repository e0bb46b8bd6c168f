//! The proposer's view of the outside world.
//!
//! [`WalProposer`](crate::WalProposer) owns no sockets, clocks or WAL. Every
//! side effect goes through a [`ProposerApi`] supplied by the host: a real
//! deployment delegates the connection and event methods to
//! [`MioTransport`](crate::net::MioTransport), tests plug in a simulated
//! cluster.

use std::time::Duration;

use bytes::Bytes;
use walprop_types::{Lsn, Term};

use crate::feedback::SharedState;

/// Status of a freshly started connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
}

/// Progress of a nonblocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPollStatus {
    Ok,
    /// Wait for the socket to become readable, then poll again.
    Reading,
    /// Wait for the socket to become writable, then poll again.
    Writing,
    Failed,
}

/// Outcome of the `START_WAL_PUSH` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The connection switched to bidirectional streaming.
    CopyBoth,
    /// Reply not complete yet.
    NeedsInput,
    /// The command succeeded without entering streaming mode.
    UnexpectedSuccess,
    Failed,
}

/// Result of a nonblocking message read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncRead {
    /// One complete message.
    Success(Bytes),
    TryAgain,
    Fail,
}

/// Result of a nonblocking message write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncWrite {
    Success,
    /// Message queued but not fully sent; call `conn_flush` once writable.
    TryFlush,
    Fail,
}

/// Result of flushing queued output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Done,
    TryAgain,
    Failed,
}

/// Socket readiness, used both as interest and as reported events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
    pub const READ_WRITE: Readiness = Readiness {
        readable: true,
        writable: true,
    };
}

/// What woke up [`ProposerApi::wait_event_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Socket event for the peer at `peer` (its index in configuration order).
    Peer { peer: usize, events: Readiness },
    /// The control latch was set, typically because new WAL was flushed.
    Latch,
    Timeout,
}

/// Capabilities the proposer needs from its host.
///
/// Connection methods work on an opaque [`ProposerApi::Conn`] handle owned by
/// the peer record. Event registration is keyed by peer index.
pub trait ProposerApi {
    type Conn;

    // === Environment ===

    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;

    fn shared_state(&self) -> &SharedState;

    /// End of WAL flushed locally and available for streaming.
    fn flush_rec_ptr(&self) -> Lsn;

    /// Where WAL starts when no acceptor has any.
    fn redo_start_lsn(&self) -> Lsn;

    /// Term to campaign for, given the highest term observed so far. Must be
    /// strictly greater than `observed`.
    fn next_term(&mut self, observed: Term) -> Term {
        observed.next()
    }

    /// Fills `buf` with cryptographically secure random bytes.
    fn strong_random(&mut self, buf: &mut [u8]) -> bool {
        getrandom::fill(buf).is_ok()
    }

    // === Connections ===

    /// Starts a nonblocking connect to `endpoint`.
    fn conn_connect_start(&mut self, peer: usize, endpoint: &str) -> Self::Conn;
    fn conn_status(&self, conn: &Self::Conn) -> ConnStatus;
    fn conn_connect_poll(&mut self, conn: &mut Self::Conn) -> ConnectPollStatus;
    fn conn_send_query(&mut self, conn: &mut Self::Conn, query: &str) -> bool;
    fn conn_get_query_result(&mut self, conn: &mut Self::Conn) -> ExecStatus;
    fn conn_flush(&mut self, conn: &mut Self::Conn) -> FlushStatus;
    fn conn_finish(&mut self, conn: Self::Conn);
    fn conn_async_read(&mut self, conn: &mut Self::Conn) -> AsyncRead;
    fn conn_async_write(&mut self, conn: &mut Self::Conn, buf: &[u8]) -> AsyncWrite;
    fn conn_blocking_write(&mut self, conn: &mut Self::Conn, buf: &[u8]) -> bool;
    fn conn_error_message(&self, conn: &Self::Conn) -> String;

    // === Readiness multiplexer ===

    fn add_peer_event(&mut self, peer: usize, conn: &mut Self::Conn, interest: Readiness);
    fn update_peer_event(&mut self, peer: usize, conn: &mut Self::Conn, interest: Readiness);
    fn remove_peer_event(&mut self, peer: usize, conn: &mut Self::Conn);

    /// Blocks until a peer event, the latch, or `timeout` (`None` = forever).
    fn wait_event_set(&mut self, timeout: Option<Duration>) -> WaitResult;

    // === WAL ===

    /// Reads exactly `buf.len()` bytes of WAL starting at `start`.
    fn wal_read(&mut self, start: Lsn, buf: &mut [u8]) -> std::io::Result<()>;

    /// Normal mode: makes WAL in `[start, end)` readable through `wal_read`
    /// by fetching it from the donor acceptor at `endpoint`. Called after an
    /// election when the donor holds WAL the host may lack. Returning `false`
    /// aborts the proposer. The default assumes the host already has it.
    fn recovery_download(
        &mut self,
        _donor: usize,
        _endpoint: &str,
        _start: Lsn,
        _end: Lsn,
    ) -> bool {
        true
    }

    // === Notifications ===

    /// Normal mode: the proposer won an election; WAL past `start` may be
    /// generated.
    fn start_streaming(&mut self, _start: Lsn) {}

    /// Sync mode: a quorum of acceptors holds WAL up to `lsn`.
    fn finish_sync_safekeepers(&mut self, _lsn: Lsn) {}

    /// Normal mode: every streaming acceptor holds committed WAL up to
    /// `truncate_lsn`, so local WAL below it may be recycled. Only called
    /// when the position advances.
    fn confirm_wal_streamed(&mut self, _truncate_lsn: Lsn) {}
}
