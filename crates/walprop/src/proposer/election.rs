//! Election: greetings, votes and the epoch start.
//!
//! Once a quorum of acceptors has greeted us, we campaign for a term above
//! every term they reported. Once a quorum granted its vote, the most
//! advanced voter (the donor) defines where this proposer's epoch starts and
//! which history it continues.

use tracing::{info, warn};
use walprop_types::{Lsn, Term, TermHistory, TermLsn};
use walprop_wire::{
    AcceptorMessage, ProposerElected, ProposerMessage, ProtocolError, VoteRequest, VoteResponse,
};

use super::WalProposer;
use crate::api::{AsyncWrite, ProposerApi};
use crate::error::{ProposerError, ProposerResult};
use crate::instrumentation::METRICS;
use crate::peer::SafekeeperState;
use crate::quorum::choose_donor;

/// Outcome of an election, fixed for the whole epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionResult {
    pub term: Term,
    /// Donor's flush LSN; our WAL starts here.
    pub epoch_start_lsn: Lsn,
    /// Donor's history followed by `(term, epoch_start_lsn)`.
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
    /// Highest truncate LSN among the voters.
    pub truncate_lsn: Lsn,
    /// Peer index of the donor.
    pub donor: usize,
    /// Last term the donor holds WAL from.
    pub donor_epoch: Term,
}

impl ElectionResult {
    /// Computes the election result from the granted votes.
    ///
    /// `redo_start_lsn` is where the epoch starts when no voter has any WAL;
    /// `None` keeps the donor's position (sync mode never invents WAL).
    pub fn determine(
        term: Term,
        votes: &[(usize, &VoteResponse)],
        redo_start_lsn: Option<Lsn>,
    ) -> Option<Self> {
        let donor = choose_donor(
            votes
                .iter()
                .map(|(peer, v)| (*peer, v.epoch(), v.flush_lsn)),
        )?;
        let donor_vote = votes.iter().find(|(peer, _)| *peer == donor)?.1;

        let mut epoch_start_lsn = donor_vote.flush_lsn;
        let mut truncate_lsn = votes
            .iter()
            .map(|(_, v)| v.truncate_lsn)
            .max()
            .unwrap_or(Lsn::INVALID);

        let mut timeline_start_lsn = Lsn::INVALID;
        for (peer, v) in votes {
            if !v.timeline_start_lsn.is_valid() {
                continue;
            }
            if timeline_start_lsn.is_valid() && timeline_start_lsn != v.timeline_start_lsn {
                warn!(
                    peer,
                    theirs = %v.timeline_start_lsn,
                    ours = %timeline_start_lsn,
                    "inconsistent timeline start LSN among voters"
                );
            }
            timeline_start_lsn = v.timeline_start_lsn;
        }

        // Fresh timeline: nobody has WAL yet, start where local WAL starts.
        if let Some(redo_start) = redo_start_lsn
            && votes.iter().all(|(_, v)| !v.flush_lsn.is_valid())
        {
            epoch_start_lsn = redo_start;
            truncate_lsn = redo_start;
            if !timeline_start_lsn.is_valid() {
                timeline_start_lsn = redo_start;
            }
        }

        let mut term_history = donor_vote.term_history.clone();
        term_history.push(term, epoch_start_lsn);

        Some(Self {
            term,
            epoch_start_lsn,
            term_history,
            timeline_start_lsn,
            truncate_lsn,
            donor,
            donor_epoch: donor_vote.epoch(),
        })
    }

    /// Where streaming to an acceptor with `vote`'s log starts: the end of
    /// the last term both logs share.
    pub fn start_streaming_at(&self, vote: &VoteResponse) -> Lsn {
        let ours = &self.term_history;
        match TermHistory::highest_common_point(ours, &vote.term_history, vote.flush_lsn) {
            Some(TermLsn { lsn, .. }) => lsn,
            None => self
                .term_history
                .entries()
                .first()
                .map_or(self.epoch_start_lsn, |e| e.lsn),
        }
    }
}

impl<A: ProposerApi> WalProposer<A> {
    // ========================================================================
    // Greetings
    // ========================================================================

    /// Counts a greeting; picks the term once a quorum greeted us.
    pub(crate) fn handle_greeting(&mut self, peer: usize) -> ProposerResult<()> {
        let sk = &mut self.peers[peer];
        let Some(greeting) = sk.greeting else {
            return Ok(());
        };
        if !sk.greeted_this_epoch {
            sk.greeted_this_epoch = true;
            self.n_greeted += 1;
        }

        if self.term == Term::ZERO {
            self.observed_term = self.observed_term.max(greeting.term);
            if self.n_greeted < self.quorum {
                return Ok(());
            }
            self.choose_term();
            for peer in 0..self.peers.len() {
                if self.peers[peer].state == SafekeeperState::Voting {
                    self.send_vote_request(peer);
                }
            }
        } else if greeting.term > self.term {
            return Err(ProposerError::ObsoleteTerm {
                peer,
                observed: greeting.term,
                ours: self.term,
            });
        } else if self.peers[peer].state == SafekeeperState::Voting {
            self.send_vote_request(peer);
        }
        Ok(())
    }

    fn choose_term(&mut self) {
        let observed = self.observed_term;
        let mut term = self.api.next_term(observed);
        if term <= observed {
            warn!(term = %term, observed = %observed, "term source returned a stale term");
            term = observed.next();
        }
        self.term = term;
        self.election_started_at = Some(self.api.now());
        METRICS.set_current_term(term.as_u64());
        info!(term = %term, greetings = self.n_greeted, "quorum of greetings, requesting votes");
    }

    fn send_vote_request(&mut self, peer: usize) {
        let msg = ProposerMessage::VoteRequest(VoteRequest {
            term: self.term,
            proposer_id: self.proposer_id,
        });
        self.blocking_send(peer, &msg, SafekeeperState::WaitVerdict);
    }

    // ========================================================================
    // Votes
    // ========================================================================

    pub(crate) fn recv_vote_response(&mut self, peer: usize) -> ProposerResult<()> {
        let Some(msg) = self.read_message(peer) else {
            return Ok(());
        };
        let AcceptorMessage::VoteResponse(vote) = msg else {
            self.unexpected_message(peer, "VoteResponse", &msg);
            return Ok(());
        };

        info!(
            peer,
            term = %vote.term,
            granted = vote.vote_given,
            flush_lsn = %vote.flush_lsn,
            truncate_lsn = %vote.truncate_lsn,
            epoch = %vote.epoch(),
            timeline_start_lsn = %vote.timeline_start_lsn,
            "received vote response"
        );

        if !vote.vote_given || vote.term != self.term {
            if vote.term > self.term {
                return Err(ProposerError::ObsoleteTerm {
                    peer,
                    observed: vote.term,
                    ours: self.term,
                });
            }
            let err = ProposerError::Connect {
                peer,
                endpoint: self.peers[peer].endpoint.clone(),
                reason: format!("vote for term {} rejected", self.term),
            };
            self.fail_peer(peer, &err);
            return Ok(());
        }

        let sk = &mut self.peers[peer];
        sk.vote_response = Some(vote);
        sk.state = SafekeeperState::Idle;
        self.update_interest(peer);

        if self.election.is_some() {
            // Late voter.
            return self.send_elected(peer);
        }

        let votes = self.granted_votes().len();
        if votes >= self.quorum {
            self.handle_elected()?;
        }
        Ok(())
    }

    /// Peers holding a granted vote for the current term.
    pub(crate) fn granted_votes(&self) -> Vec<(usize, &VoteResponse)> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, sk)| sk.state == SafekeeperState::Idle)
            .filter_map(|(peer, sk)| sk.vote_response.as_ref().map(|v| (peer, v)))
            .filter(|(_, v)| v.term == self.term && v.vote_given)
            .collect()
    }

    // ========================================================================
    // Election
    // ========================================================================

    fn handle_elected(&mut self) -> ProposerResult<()> {
        let redo_start = (!self.sync_safekeepers).then(|| self.api.redo_start_lsn());
        let votes = self.granted_votes();
        let Some(result) = ElectionResult::determine(self.term, &votes, redo_start) else {
            return Ok(());
        };
        // Sync mode may exit right away if every acceptor already agrees.
        let all_synced = votes.len() == self.peers.len()
            && votes.iter().all(|(_, v)| {
                v.flush_lsn == result.epoch_start_lsn && v.truncate_lsn == result.epoch_start_lsn
            });

        info!(
            term = %result.term,
            epoch_start_lsn = %result.epoch_start_lsn,
            donor = result.donor,
            donor_endpoint = %self.peers[result.donor].endpoint,
            donor_epoch = %result.donor_epoch,
            truncate_lsn = %result.truncate_lsn,
            timeline_start_lsn = %result.timeline_start_lsn,
            history = ?result.term_history,
            "elected"
        );
        METRICS.increment_elections_won();
        if let Some(started) = self.election_started_at {
            METRICS.record_election_latency(self.api.now().saturating_sub(started));
        }
        self.api.shared_state().set_mine_last_elected_term(result.term);

        let epoch_start = result.epoch_start_lsn;
        let donor = result.donor;
        // WAL below the epoch start that acceptors may still need.
        let recover_from = result.truncate_lsn.max(result.timeline_start_lsn);
        self.truncate_lsn = result.truncate_lsn;
        self.available_lsn = epoch_start;
        self.election = Some(result);

        if self.sync_safekeepers {
            if all_synced {
                info!(lsn = %epoch_start, "all safekeepers already synced");
                self.finish_sync(epoch_start);
                return Ok(());
            }
        } else {
            if recover_from.is_valid() && recover_from < epoch_start {
                self.recover_from_donor(donor, recover_from, epoch_start)?;
            }
            self.api.start_streaming(epoch_start);
        }

        for peer in 0..self.peers.len() {
            if self.peers[peer].state == SafekeeperState::Idle {
                self.send_elected(peer)?;
            }
        }
        Ok(())
    }

    /// Makes `[start, end)` readable locally before streaming begins.
    fn recover_from_donor(&mut self, donor: usize, start: Lsn, end: Lsn) -> ProposerResult<()> {
        let endpoint = &self.peers[donor].endpoint;
        info!(
            donor,
            endpoint = %endpoint,
            start = %start,
            end = %end,
            "downloading WAL from donor"
        );
        if self.api.recovery_download(donor, endpoint, start, end) {
            Ok(())
        } else {
            Err(ProposerError::Recovery { donor, start, end })
        }
    }

    /// Sends `ProposerElected` unless this connection already got it for the
    /// current term.
    pub(crate) fn send_elected(&mut self, peer: usize) -> ProposerResult<()> {
        let Some(election) = self.election.as_ref() else {
            return Ok(());
        };
        let sk = &mut self.peers[peer];
        if sk.elected_term == Some(election.term) {
            return Ok(());
        }
        let Some(vote) = sk.vote_response.as_ref() else {
            return Ok(());
        };
        if let Some((term, ours, theirs)) =
            election.term_history.conflicting_switch(&vote.term_history)
        {
            let err = ProtocolError::InconsistentTermHistory { term, ours, theirs };
            self.fail_peer(peer, &err.into());
            return Ok(());
        }

        sk.start_streaming_at = election.start_streaming_at(vote);
        info!(
            peer,
            endpoint = %sk.endpoint,
            start_streaming_at = %sk.start_streaming_at,
            "sending elected message"
        );
        let msg = ProposerMessage::Elected(ProposerElected {
            term: election.term,
            start_streaming_at: sk.start_streaming_at,
            term_history: election.term_history.clone(),
            timeline_start_lsn: election.timeline_start_lsn,
        });
        sk.elected_term = Some(election.term);

        let bytes = msg.encode();
        let Some(conn) = sk.conn.as_mut() else {
            return Ok(());
        };
        match self.api.conn_async_write(conn, &bytes) {
            AsyncWrite::Success => self.start_streaming(peer),
            AsyncWrite::TryFlush => {
                sk.state = SafekeeperState::SendElectedFlush;
                self.update_interest(peer);
                Ok(())
            }
            AsyncWrite::Fail => {
                self.fail_peer_io(peer, "failed to send ProposerElected");
                Ok(())
            }
        }
    }
}
