//! Per-peer connection state machine.

use tracing::{debug, info, warn};
use walprop_wire::{AcceptorMessage, ProposerMessage, ProtocolError, START_WAL_PUSH};

use super::WalProposer;
use crate::api::{
    AsyncRead, ConnStatus, ConnectPollStatus, ExecStatus, FlushStatus, ProposerApi, Readiness,
};
use crate::error::{ProposerError, ProposerResult};
use crate::instrumentation::METRICS;
use crate::peer::SafekeeperState;

impl<A: ProposerApi> WalProposer<A> {
    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Closes the peer's connection, if any, and starts a new one.
    pub(crate) fn reset_connection(&mut self, peer: usize) {
        if self.peers[peer].conn.is_some() {
            self.shutdown_connection(peer);
        }
        METRICS.increment_reconnect_attempts();

        let now = self.api.now();
        let sk = &mut self.peers[peer];
        info!(peer, endpoint = %sk.endpoint, "connecting to safekeeper");

        let conn = self.api.conn_connect_start(peer, &sk.endpoint);
        if self.api.conn_status(&conn) == ConnStatus::Bad {
            let err = ProposerError::Connect {
                peer,
                endpoint: sk.endpoint.clone(),
                reason: self.api.conn_error_message(&conn),
            };
            warn!(error = %err, "failed to start connection");
            self.api.conn_finish(conn);
            return;
        }

        let conn = sk.conn.insert(conn);
        sk.state = SafekeeperState::ConnectingWrite;
        sk.latest_msg_received_at = now;
        self.api.add_peer_event(peer, conn, Readiness::WRITABLE);
    }

    /// Closes the peer's connection and moves it to `Offline`. It is
    /// reconnected by the reconnect timer.
    pub(crate) fn shutdown_connection(&mut self, peer: usize) {
        let sk = &mut self.peers[peer];
        if let Some(mut conn) = sk.conn.take() {
            self.api.remove_peer_event(peer, &mut conn);
            self.api.conn_finish(conn);
        }
        sk.clear_connection_state();
    }

    /// Logs a peer-local failure and shuts the connection down.
    pub(crate) fn fail_peer(&mut self, peer: usize, err: &ProposerError) {
        let sk = &self.peers[peer];
        warn!(
            peer,
            endpoint = %sk.endpoint,
            state = %sk.state,
            error = %err,
            "closing connection to safekeeper"
        );
        METRICS.increment_connection_resets();
        self.shutdown_connection(peer);
    }

    /// Fails the peer with the connection's own error message.
    pub(crate) fn fail_peer_io(&mut self, peer: usize, what: &str) {
        let sk = &self.peers[peer];
        let detail = sk
            .conn
            .as_ref()
            .map(|conn| self.api.conn_error_message(conn))
            .unwrap_or_default();
        let err = ProposerError::Connect {
            peer,
            endpoint: sk.endpoint.clone(),
            reason: format!("{what}: {detail}"),
        };
        self.fail_peer(peer, &err);
    }

    /// Sets socket interest to what the peer's state needs.
    pub(crate) fn update_interest(&mut self, peer: usize) {
        let sk = &mut self.peers[peer];
        let Some(interest) = sk.state.interest(sk.flush_write) else {
            return;
        };
        if let Some(conn) = sk.conn.as_mut() {
            self.api.update_peer_event(peer, conn, interest);
        }
    }

    // ========================================================================
    // Messaging helpers
    // ========================================================================

    /// Reads one message. `None` when nothing is buffered yet, or when the
    /// read failed and the peer was shut down.
    pub(crate) fn read_message(&mut self, peer: usize) -> Option<AcceptorMessage> {
        let now = self.api.now();
        let sk = &mut self.peers[peer];
        let conn = sk.conn.as_mut()?;

        let bytes = match self.api.conn_async_read(conn) {
            AsyncRead::Success(bytes) => bytes,
            AsyncRead::TryAgain => return None,
            AsyncRead::Fail => {
                self.fail_peer_io(peer, "failed to read from node");
                return None;
            }
        };
        sk.latest_msg_received_at = now;

        match AcceptorMessage::decode(&bytes) {
            Ok(msg) => {
                debug!(peer, message = msg.name(), len = bytes.len(), "received");
                Some(msg)
            }
            Err(e) => {
                self.fail_peer(peer, &e.into());
                None
            }
        }
    }

    /// Fails the peer for sending `found` where `expected` was due.
    pub(crate) fn unexpected_message(
        &mut self,
        peer: usize,
        expected: &'static str,
        found: &AcceptorMessage,
    ) {
        let err = ProtocolError::UnexpectedMessage {
            expected,
            found: found.name(),
        };
        self.fail_peer(peer, &err.into());
    }

    /// Writes `msg` completely and moves the peer to `next`.
    pub(crate) fn blocking_send(
        &mut self,
        peer: usize,
        msg: &ProposerMessage,
        next: SafekeeperState,
    ) -> bool {
        let bytes = msg.encode();
        let sk = &mut self.peers[peer];
        let Some(conn) = sk.conn.as_mut() else {
            return false;
        };
        if !self.api.conn_blocking_write(conn, &bytes) {
            self.fail_peer_io(peer, &format!("failed to send {}", msg.name()));
            return false;
        }
        debug!(peer, message = msg.name(), len = bytes.len(), "sent");
        sk.state = next;
        self.update_interest(peer);
        true
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Handles a socket event for `peer` according to its state.
    pub(crate) fn advance_peer(&mut self, peer: usize, events: Readiness) -> ProposerResult<()> {
        match self.peers[peer].state {
            SafekeeperState::Offline => {
                warn!(peer, "event for offline safekeeper ignored");
            }
            SafekeeperState::ConnectingWrite | SafekeeperState::ConnectingRead => {
                self.handle_connecting(peer);
            }
            SafekeeperState::WaitExecResult => self.recv_start_wal_push_result(peer),
            SafekeeperState::HandshakeRecv => self.recv_acceptor_greeting(peer)?,
            SafekeeperState::Voting | SafekeeperState::Idle => {
                // Nothing is expected here; readable means the peer hung up.
                if events.readable {
                    self.fail_peer_io(peer, "unexpected event, connection closed");
                }
            }
            SafekeeperState::WaitVerdict => self.recv_vote_response(peer)?,
            SafekeeperState::SendElectedFlush => self.flush_elected(peer)?,
            SafekeeperState::Active => {
                if events.writable {
                    self.send_append_requests(peer)?;
                }
                if events.readable && self.peers[peer].state == SafekeeperState::Active {
                    self.recv_append_responses(peer)?;
                }
            }
        }
        Ok(())
    }

    fn handle_connecting(&mut self, peer: usize) {
        let sk = &mut self.peers[peer];
        let Some(conn) = sk.conn.as_mut() else {
            return;
        };

        match self.api.conn_connect_poll(conn) {
            ConnectPollStatus::Ok => {
                info!(peer, endpoint = %sk.endpoint, "connected to safekeeper");
                // The socket may have changed while connecting.
                self.api.remove_peer_event(peer, conn);
                self.api.add_peer_event(peer, conn, Readiness::READABLE);

                if !self.api.conn_send_query(conn, START_WAL_PUSH) {
                    self.fail_peer_io(peer, "failed to send START_WAL_PUSH");
                    return;
                }
                sk.state = SafekeeperState::WaitExecResult;
            }
            ConnectPollStatus::Reading => {
                sk.state = SafekeeperState::ConnectingRead;
                self.update_interest(peer);
            }
            ConnectPollStatus::Writing => {
                sk.state = SafekeeperState::ConnectingWrite;
                self.update_interest(peer);
            }
            ConnectPollStatus::Failed => self.fail_peer_io(peer, "failed to connect"),
        }
    }

    fn recv_start_wal_push_result(&mut self, peer: usize) {
        let sk = &mut self.peers[peer];
        let Some(conn) = sk.conn.as_mut() else {
            return;
        };

        match self.api.conn_get_query_result(conn) {
            ExecStatus::CopyBoth => {
                let greeting = ProposerMessage::Greeting(self.greeting.clone());
                self.blocking_send(peer, &greeting, SafekeeperState::HandshakeRecv);
            }
            ExecStatus::NeedsInput => {}
            ExecStatus::Failed => self.fail_peer_io(peer, "START_WAL_PUSH failed"),
            ExecStatus::UnexpectedSuccess => {
                self.fail_peer_io(peer, "START_WAL_PUSH did not enter copy-both mode");
            }
        }
    }

    fn recv_acceptor_greeting(&mut self, peer: usize) -> ProposerResult<()> {
        let Some(msg) = self.read_message(peer) else {
            return Ok(());
        };
        let AcceptorMessage::Greeting(greeting) = msg else {
            self.unexpected_message(peer, "AcceptorGreeting", &msg);
            return Ok(());
        };

        let sk = &mut self.peers[peer];
        info!(
            peer,
            endpoint = %sk.endpoint,
            node_id = %greeting.node_id,
            term = %greeting.term,
            "received acceptor greeting"
        );
        sk.greeting = Some(greeting);
        sk.state = SafekeeperState::Voting;
        self.update_interest(peer);

        self.handle_greeting(peer)
    }

    fn flush_elected(&mut self, peer: usize) -> ProposerResult<()> {
        let sk = &mut self.peers[peer];
        let Some(conn) = sk.conn.as_mut() else {
            return Ok(());
        };
        match self.api.conn_flush(conn) {
            FlushStatus::Done => {
                sk.state = SafekeeperState::Idle;
                self.start_streaming(peer)
            }
            FlushStatus::TryAgain => Ok(()),
            FlushStatus::Failed => {
                self.fail_peer_io(peer, "failed to flush ProposerElected");
                Ok(())
            }
        }
    }
}
