//! The WAL proposer.
//!
//! A single-threaded reactor driving one connection per acceptor through
//! greeting, voting and streaming. All I/O goes through [`ProposerApi`].
//!
//! # Protocol Overview
//!
//! ```text
//! Proposer ──Greeting──► Acceptor₁..ₙ
//!            ◄─Greeting(term)──
//!                │
//!                ▼ (quorum of greetings: term = next_term(max seen))
//! Proposer ──VoteRequest(term)──► Acceptors
//!            ◄─VoteResponse(flush, history)──
//!                │
//!                ▼ (quorum of grants: donor = most advanced log)
//! Proposer ──Elected(term, history, start)──► Voters
//! Proposer ──AppendRequest(WAL, commit)──► Acceptors
//!            ◄─AppendResponse(flush, feedback)──
//!                │
//!                ▼ commit = quorum-th highest flush
//! ```
//!
//! An acceptor reporting a term above ours ends the epoch: every connection
//! is reset and the election starts over with a higher term.
//!
//! The impl is split by concern:
//! - `connection`: per-peer state machine and connection lifecycle
//! - `election`: greetings, votes and the election result
//! - `streaming`: append requests, responses, commit and feedback

mod connection;
mod election;
mod streaming;

pub use election::ElectionResult;

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;
use walprop_config::WalProposerConfig;
use walprop_types::{Lsn, Term};
use walprop_wire::{ProposerGreeting, SK_PROTOCOL_VERSION};

use crate::api::{ProposerApi, WaitResult};
use crate::error::{ProposerError, ProposerResult};
use crate::instrumentation::METRICS;
use crate::peer::{Safekeeper, SafekeeperState};
use crate::quorum::quorum_size;

/// Result of one [`WalProposer::poll`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Keep polling.
    Continue,
    /// Sync mode finished: a quorum of acceptors holds WAL up to this LSN.
    Synced(Lsn),
}

/// Proposer state for one process.
pub struct WalProposer<A: ProposerApi> {
    pub(crate) api: A,
    pub(crate) peers: Vec<Safekeeper<A::Conn>>,
    pub(crate) quorum: usize,

    pub(crate) sync_safekeepers: bool,
    pub(crate) reconnect_timeout: Option<Duration>,
    pub(crate) connection_timeout: Option<Duration>,

    pub(crate) proposer_id: Uuid,
    pub(crate) greeting: ProposerGreeting,

    // === Epoch ===
    /// Term we campaign for; zero until a quorum has greeted us.
    pub(crate) term: Term,
    /// Highest term reported by any acceptor, including past epochs.
    pub(crate) observed_term: Term,
    /// Distinct peers that greeted us this epoch.
    pub(crate) n_greeted: usize,
    pub(crate) election: Option<ElectionResult>,
    pub(crate) election_started_at: Option<Duration>,

    // === Streaming ===
    /// End of WAL to stream to acceptors.
    pub(crate) available_lsn: Lsn,
    pub(crate) commit_lsn: Lsn,
    pub(crate) last_sent_commit_lsn: Lsn,
    pub(crate) truncate_lsn: Lsn,
    /// Last truncate LSN reported to the host; survives epoch restarts.
    pub(crate) confirmed_truncate_lsn: Lsn,

    pub(crate) last_reconnect_attempt: Duration,
    pub(crate) synced_lsn: Option<Lsn>,
}

impl<A: ProposerApi> WalProposer<A> {
    pub fn new(config: &WalProposerConfig, mut api: A) -> ProposerResult<Self> {
        config.validate()?;

        let mut id = [0u8; 16];
        if !api.strong_random(&mut id) {
            return Err(ProposerError::RandomUnavailable);
        }
        let proposer_id = uuid::Builder::from_random_bytes(id).into_uuid();

        let peers: Vec<_> = config
            .safekeeper_list()
            .into_iter()
            .map(Safekeeper::new)
            .collect();
        let quorum = quorum_size(peers.len());

        info!(
            safekeepers = peers.len(),
            quorum,
            sync = config.sync_safekeepers,
            proposer_id = %proposer_id,
            "walproposer configured"
        );

        Ok(Self {
            api,
            peers,
            quorum,
            sync_safekeepers: config.sync_safekeepers,
            reconnect_timeout: config.reconnect_timeout(),
            connection_timeout: config.connection_timeout(),
            proposer_id,
            greeting: ProposerGreeting {
                protocol_version: SK_PROTOCOL_VERSION,
                pg_version: config.pg_version,
                proposer_id,
                system_id: config.system_id,
                timeline_id: config.timeline_id,
                tenant_id: config.tenant_id,
                timeline: config.timeline,
                wal_seg_size: config.wal_segment_size,
            },
            term: Term::ZERO,
            observed_term: Term::ZERO,
            n_greeted: 0,
            election: None,
            election_started_at: None,
            available_lsn: Lsn::INVALID,
            commit_lsn: Lsn::INVALID,
            last_sent_commit_lsn: Lsn::INVALID,
            truncate_lsn: Lsn::INVALID,
            confirmed_truncate_lsn: Lsn::INVALID,
            last_reconnect_attempt: Duration::ZERO,
            synced_lsn: None,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    pub fn peers(&self) -> &[Safekeeper<A::Conn>] {
        &self.peers
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn proposer_id(&self) -> Uuid {
        self.proposer_id
    }

    /// Current term, [`Term::ZERO`] before a quorum greeted us.
    pub fn term(&self) -> Term {
        self.term
    }

    pub fn election(&self) -> Option<&ElectionResult> {
        self.election.as_ref()
    }

    pub fn available_lsn(&self) -> Lsn {
        self.available_lsn
    }

    pub fn commit_lsn(&self) -> Lsn {
        self.commit_lsn
    }

    pub fn truncate_lsn(&self) -> Lsn {
        self.truncate_lsn
    }

    /// Fails when fewer acceptors are connected than a quorum needs.
    pub fn check_quorum_reachable(&self) -> ProposerResult<()> {
        let connected = self
            .peers
            .iter()
            .filter(|sk| sk.state != SafekeeperState::Offline)
            .count();
        if connected < self.quorum {
            return Err(ProposerError::QuorumUnavailable {
                connected,
                quorum: self.quorum,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Starts connecting to every acceptor.
    pub fn start(&mut self) {
        for peer in 0..self.peers.len() {
            self.reset_connection(peer);
        }
        self.last_reconnect_attempt = self.api.now();
    }

    /// Runs until sync mode finishes; in normal mode only returns on error.
    pub fn run(&mut self) -> ProposerResult<Lsn> {
        self.start();
        loop {
            if let PollOutcome::Synced(lsn) = self.poll()? {
                return Ok(lsn);
            }
        }
    }

    /// Waits for one event and handles it.
    pub fn poll(&mut self) -> ProposerResult<PollOutcome> {
        if let Some(lsn) = self.synced_lsn {
            return Ok(PollOutcome::Synced(lsn));
        }

        let timeout = self.next_timeout(self.api.now());
        let event = self.api.wait_event_set(timeout);

        match self.handle_event(event) {
            Ok(()) => {}
            Err(ProposerError::ObsoleteTerm {
                peer,
                observed,
                ours,
            }) => {
                warn!(
                    peer,
                    endpoint = %self.peers[peer].endpoint,
                    observed = %observed,
                    ours = %ours,
                    "acceptor reports a higher term, another proposer is running"
                );
                self.restart_epoch(observed);
            }
            Err(e) => return Err(e),
        }

        Ok(match self.synced_lsn {
            Some(lsn) => PollOutcome::Synced(lsn),
            None => PollOutcome::Continue,
        })
    }

    fn handle_event(&mut self, event: WaitResult) -> ProposerResult<()> {
        match event {
            WaitResult::Peer { peer, events } => {
                if peer < self.peers.len() {
                    self.advance_peer(peer, events)?;
                } else {
                    warn!(peer, "event for unknown peer");
                }
            }
            WaitResult::Latch => self.check_new_wal()?,
            WaitResult::Timeout => {
                self.check_new_wal()?;
                if self.election.is_some() && self.synced_lsn.is_none() {
                    // Keepalive; also carries the latest commit position.
                    self.broadcast_append_request()?;
                }
                self.check_connection_timeouts();
                if let Err(e) = self.check_quorum_reachable() {
                    debug!(error = %e, "waiting for acceptors");
                }
            }
        }
        self.reconnect_if_due();
        Ok(())
    }

    /// Streams WAL flushed since the last broadcast.
    fn check_new_wal(&mut self) -> ProposerResult<()> {
        if self.election.is_none() || self.sync_safekeepers {
            return Ok(());
        }
        let flush = self.api.flush_rec_ptr();
        if flush > self.available_lsn {
            self.broadcast(flush)?;
        }
        Ok(())
    }

    /// Time until the next reconnect or connection-timeout check.
    fn next_timeout(&self, now: Duration) -> Option<Duration> {
        let reconnect = self
            .reconnect_timeout
            .map(|t| t.saturating_sub(now.saturating_sub(self.last_reconnect_attempt)));
        let connection = self.connection_timeout.and_then(|t| {
            self.peers
                .iter()
                .filter(|sk| sk.state != SafekeeperState::Offline)
                .map(|sk| (sk.latest_msg_received_at + t).saturating_sub(now))
                .min()
        });
        [reconnect, connection].into_iter().flatten().min()
    }

    fn reconnect_if_due(&mut self) {
        let Some(timeout) = self.reconnect_timeout else {
            return;
        };
        let now = self.api.now();
        if now.saturating_sub(self.last_reconnect_attempt) < timeout {
            return;
        }
        self.last_reconnect_attempt = now;
        for peer in 0..self.peers.len() {
            if self.peers[peer].state == SafekeeperState::Offline {
                self.reset_connection(peer);
            }
        }
    }

    fn check_connection_timeouts(&mut self) {
        let Some(timeout) = self.connection_timeout else {
            return;
        };
        let now = self.api.now();
        for peer in 0..self.peers.len() {
            let sk = &self.peers[peer];
            if sk.state == SafekeeperState::Offline {
                continue;
            }
            let silent_for = now.saturating_sub(sk.latest_msg_received_at);
            if silent_for >= timeout {
                warn!(
                    peer,
                    endpoint = %sk.endpoint,
                    state = %sk.state,
                    silent_ms = silent_for.as_millis() as u64,
                    "no messages received within connection timeout, closing"
                );
                self.shutdown_connection(peer);
            }
        }
    }

    /// Drops every connection and all election state; reconnects with a term
    /// above `observed`.
    fn restart_epoch(&mut self, observed: Term) {
        METRICS.increment_epochs_restarted();
        self.observed_term = self.observed_term.max(observed).max(self.term);

        for peer in 0..self.peers.len() {
            self.shutdown_connection(peer);
            self.peers[peer].clear_epoch_state();
        }
        self.term = Term::ZERO;
        self.n_greeted = 0;
        self.election = None;
        self.election_started_at = None;
        self.available_lsn = Lsn::INVALID;
        self.commit_lsn = Lsn::INVALID;
        self.last_sent_commit_lsn = Lsn::INVALID;
        self.truncate_lsn = Lsn::INVALID;

        info!(observed_term = %self.observed_term, "restarting election epoch");
        self.start();
    }
}
