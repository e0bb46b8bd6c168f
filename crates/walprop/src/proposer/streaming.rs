//! WAL streaming, commit position and feedback.

use bytes::BytesMut;
use tracing::{debug, info};
use walprop_types::Lsn;
use walprop_wire::{
    APPEND_REQUEST_HEADER_SIZE, AcceptorMessage, AppendRequestHeader, MAX_SEND_SIZE,
};

use super::WalProposer;
use crate::api::{AsyncWrite, FlushStatus, ProposerApi};
use crate::error::{ProposerError, ProposerResult};
use crate::feedback::AggregatedFeedback;
use crate::instrumentation::METRICS;
use crate::peer::SafekeeperState;
use crate::quorum::{min_flush_lsn, quorum_commit_lsn};

impl<A: ProposerApi> WalProposer<A> {
    // ========================================================================
    // Sending
    // ========================================================================

    /// Moves an `Idle` peer to `Active` and sends it what it is missing.
    pub(crate) fn start_streaming(&mut self, peer: usize) -> ProposerResult<()> {
        let sk = &mut self.peers[peer];
        info!(
            peer,
            endpoint = %sk.endpoint,
            start_streaming_at = %sk.start_streaming_at,
            "starting streaming"
        );
        sk.state = SafekeeperState::Active;
        sk.streaming_at = sk.start_streaming_at;
        self.update_interest(peer);
        self.send_append_requests(peer)
    }

    /// Announces WAL flushed up to `end_lsn` and streams it to every active
    /// acceptor.
    pub fn broadcast(&mut self, end_lsn: Lsn) -> ProposerResult<()> {
        self.available_lsn = self.available_lsn.max(end_lsn);
        self.broadcast_append_request()
    }

    pub(crate) fn broadcast_append_request(&mut self) -> ProposerResult<()> {
        for peer in 0..self.peers.len() {
            if self.peers[peer].state == SafekeeperState::Active {
                self.send_append_requests(peer)?;
            }
        }
        Ok(())
    }

    /// Sends WAL from the peer's streaming position up to `available_lsn`,
    /// at most [`MAX_SEND_SIZE`] bytes per message.
    ///
    /// Always sends at least one message, possibly empty, so that this also
    /// serves as a keepalive and commit position update. Stops early when the
    /// connection cannot take more; the rest goes out on write readiness.
    pub(crate) fn send_append_requests(&mut self, peer: usize) -> ProposerResult<()> {
        let Some(election) = self.election.as_ref() else {
            return Ok(());
        };
        let (term, epoch_start_lsn) = (election.term, election.epoch_start_lsn);

        if self.peers[peer].flush_write {
            let sk = &mut self.peers[peer];
            let Some(conn) = sk.conn.as_mut() else {
                return Ok(());
            };
            match self.api.conn_flush(conn) {
                FlushStatus::Done => sk.flush_write = false,
                FlushStatus::TryAgain => return Ok(()),
                FlushStatus::Failed => {
                    self.fail_peer_io(peer, "failed to flush append request");
                    return Ok(());
                }
            }
        }

        loop {
            let begin = self.peers[peer].streaming_at;
            let end = if begin < self.available_lsn {
                self.available_lsn.min(begin + MAX_SEND_SIZE as u64)
            } else {
                begin
            };
            let header = AppendRequestHeader {
                term,
                epoch_start_lsn,
                begin_lsn: begin,
                end_lsn: end,
                commit_lsn: self.commit_lsn,
                truncate_lsn: self.truncate_lsn,
                proposer_id: self.proposer_id,
            };

            let len = header.payload_len() as usize;
            let mut buf = BytesMut::with_capacity(APPEND_REQUEST_HEADER_SIZE + len);
            header.encode(&mut buf);
            if len > 0 {
                let offset = buf.len();
                buf.resize(offset + len, 0);
                self.api
                    .wal_read(begin, &mut buf[offset..])
                    .map_err(|source| ProposerError::WalRead { lsn: begin, source })?;
            }

            let sk = &mut self.peers[peer];
            let Some(conn) = sk.conn.as_mut() else {
                return Ok(());
            };
            let written = self.api.conn_async_write(conn, &buf);
            if written == AsyncWrite::Fail {
                self.fail_peer_io(peer, "failed to send append request");
                return Ok(());
            }

            debug!(
                peer,
                begin = %begin,
                end = %end,
                commit = %header.commit_lsn,
                truncate = %header.truncate_lsn,
                "sent append request"
            );
            METRICS.record_append_sent(len as u64);
            sk.streaming_at = end;
            sk.last_append = Some(header);

            if written == AsyncWrite::TryFlush {
                sk.flush_write = true;
                break;
            }
            if end >= self.available_lsn {
                break;
            }
        }

        self.update_interest(peer);
        Ok(())
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Drains buffered append responses from `peer`.
    pub(crate) fn recv_append_responses(&mut self, peer: usize) -> ProposerResult<()> {
        let Some(term) = self.election.as_ref().map(|e| e.term) else {
            return Ok(());
        };

        let mut received = false;
        while self.peers[peer].state == SafekeeperState::Active {
            let Some(msg) = self.read_message(peer) else {
                break;
            };
            let AcceptorMessage::AppendResponse(resp) = msg else {
                self.unexpected_message(peer, "AppendResponse", &msg);
                break;
            };
            if resp.term > term {
                return Err(ProposerError::ObsoleteTerm {
                    peer,
                    observed: resp.term,
                    ours: term,
                });
            }
            debug!(
                peer,
                flush_lsn = %resp.flush_lsn,
                commit_lsn = %resp.commit_lsn,
                "received append response"
            );
            METRICS.increment_append_responses();
            self.peers[peer].append_response = Some(resp);
            received = true;
        }

        if received {
            self.handle_append_responses()?;
        }
        Ok(())
    }

    /// Recomputes commit and truncate positions and the aggregated feedback
    /// after new acknowledgements.
    fn handle_append_responses(&mut self) -> ProposerResult<()> {
        let Some(epoch_start_lsn) = self.election.as_ref().map(|e| e.epoch_start_lsn) else {
            return Ok(());
        };

        let active_flushes: Vec<Lsn> = self
            .peers
            .iter()
            .filter_map(|sk| sk.active_flush_lsn())
            .collect();
        METRICS.set_active_peers(active_flushes.len() as u64);

        let commit =
            quorum_commit_lsn(active_flushes.iter().copied(), epoch_start_lsn, self.quorum);
        if commit > self.commit_lsn {
            self.commit_lsn = commit;
            METRICS.set_commit_lsn(commit.as_u64());
        }

        if let Some(min_flush) = min_flush_lsn(active_flushes) {
            let truncate = min_flush.min(self.commit_lsn);
            if truncate > self.truncate_lsn {
                self.truncate_lsn = truncate;
                METRICS.set_truncate_lsn(truncate.as_u64());
            }
        }

        let feedback = AggregatedFeedback::from_reports(
            self.peers
                .iter()
                .filter(|sk| sk.state == SafekeeperState::Active)
                .filter_map(|sk| sk.append_response.as_ref())
                .map(|r| (&r.hs_feedback, r.storage_feedback.as_ref())),
        );
        if self.api.shared_state().publish_feedback(feedback) {
            debug!(?feedback, "aggregated feedback changed");
        }

        if !self.sync_safekeepers && self.truncate_lsn > self.confirmed_truncate_lsn {
            self.confirmed_truncate_lsn = self.truncate_lsn;
            self.api.confirm_wal_streamed(self.truncate_lsn);
        }

        if self.commit_lsn > self.last_sent_commit_lsn {
            self.last_sent_commit_lsn = self.commit_lsn;
            self.broadcast_append_request()?;
        }

        if self.sync_safekeepers && self.synced_lsn.is_none() {
            let n_synced = self
                .peers
                .iter()
                .filter_map(|sk| sk.append_response.as_ref())
                .filter(|r| r.commit_lsn >= epoch_start_lsn)
                .count();
            if n_synced >= self.quorum {
                self.finish_sync(epoch_start_lsn);
            }
        }
        Ok(())
    }

    pub(crate) fn finish_sync(&mut self, lsn: Lsn) {
        info!(lsn = %lsn, "safekeepers synced");
        self.synced_lsn = Some(lsn);
        self.api.finish_sync_safekeepers(lsn);
    }
}
