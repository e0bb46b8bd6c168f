//! Proposer tests against a simulated cluster.
//!
//! `SimApi` implements [`ProposerApi`] in memory. Each acceptor answers the
//! proposer's messages synchronously and queues a readable event for its
//! reply; time only moves when the proposer waits with nothing queued.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use test_case::test_case;
use walprop_config::WalProposerConfig;
use walprop_types::{Lsn, NodeId, Term, TermHistory, TermLsn};
use walprop_wire::{
    AcceptorGreeting, AcceptorMessage, AppendRequestHeader, AppendResponse, HotStandbyFeedback,
    MAX_SEND_SIZE, ProposerElected, ProposerMessage, START_WAL_PUSH, StorageFeedback,
    VoteResponse,
};

use crate::api::{
    AsyncRead, AsyncWrite, ConnStatus, ConnectPollStatus, ExecStatus, FlushStatus, ProposerApi,
    Readiness, WaitResult,
};
use crate::error::ProposerError;
use crate::feedback::SharedState;
use crate::peer::SafekeeperState;
use crate::proposer::{PollOutcome, WalProposer};

const REDO_START: Lsn = Lsn::new(0x0100_0028);
const MAX_STEPS: usize = 500;

fn wal_byte(lsn: Lsn) -> u8 {
    (lsn.as_u64() % 251) as u8
}

// ============================================================================
// Simulated acceptor
// ============================================================================

/// Misbehavior of a simulated acceptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Fault {
    #[default]
    Healthy,
    /// The start command succeeds without entering streaming mode.
    NoCopyBoth,
    /// Answers the greeting with bytes that do not decode.
    GarbageGreeting,
    /// Answers the vote request with a greeting.
    GreetingForVote,
    /// Grants the vote under a term below the requested one.
    StaleGrant,
    /// Reads fail once `ProposerElected` was received.
    ReadFailure,
    /// Writes fail once `ProposerElected` was received.
    WriteFailure,
}

#[derive(Debug, Default)]
struct SimAcceptor {
    node_id: u64,
    term: Term,
    flush_lsn: Lsn,
    truncate_lsn: Lsn,
    commit_lsn: Lsn,
    history: TermHistory,
    timeline_start_lsn: Lsn,
    hs_feedback: HotStandbyFeedback,
    storage_feedback: Option<StorageFeedback>,

    reject_votes: bool,
    refuse_connect: bool,
    /// Accepts connections but never answers the start command.
    silent: bool,
    fault: Fault,

    connected: bool,
    exec_ready: bool,
    inbox: VecDeque<Bytes>,

    connects: usize,
    elected: Vec<ProposerElected>,
    appends: Vec<AppendRequestHeader>,
    bad_wal_bytes: usize,
    faults_hit: usize,
}

impl SimAcceptor {
    fn empty(node_id: u64) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    fn with_log(
        node_id: u64,
        term: u64,
        flush: u64,
        truncate: u64,
        history: &[(u64, u64)],
    ) -> Self {
        let entries = history.iter().copied().map(TermLsn::from).collect();
        Self {
            node_id,
            term: Term::new(term),
            flush_lsn: Lsn::new(flush),
            truncate_lsn: Lsn::new(truncate),
            history: TermHistory::from_entries(entries),
            timeline_start_lsn: history
                .first()
                .map_or(Lsn::INVALID, |(_, lsn)| Lsn::new(*lsn)),
            ..Self::default()
        }
    }

    fn reply(&mut self, msg: AcceptorMessage) {
        self.inbox.push_back(msg.encode());
    }

    /// Applies a proposer message; returns whether a reply was queued.
    fn receive(&mut self, msg: ProposerMessage) -> bool {
        match msg {
            ProposerMessage::Greeting(_) if self.fault == Fault::GarbageGreeting => {
                self.faults_hit += 1;
                self.inbox.push_back(Bytes::from_static(&[0xff; 16]));
                true
            }
            ProposerMessage::Greeting(_) => {
                self.reply(AcceptorMessage::Greeting(AcceptorGreeting {
                    term: self.term,
                    node_id: NodeId::new(self.node_id),
                }));
                true
            }
            ProposerMessage::VoteRequest(_) if self.fault == Fault::GreetingForVote => {
                self.faults_hit += 1;
                self.reply(AcceptorMessage::Greeting(AcceptorGreeting {
                    term: self.term,
                    node_id: NodeId::new(self.node_id),
                }));
                true
            }
            ProposerMessage::VoteRequest(req) if self.fault == Fault::StaleGrant => {
                self.faults_hit += 1;
                self.reply(AcceptorMessage::VoteResponse(VoteResponse {
                    term: Term::new(req.term.as_u64() - 1),
                    vote_given: true,
                    flush_lsn: self.flush_lsn,
                    truncate_lsn: self.truncate_lsn,
                    term_history: self.history.clone(),
                    timeline_start_lsn: self.timeline_start_lsn,
                }));
                true
            }
            ProposerMessage::VoteRequest(req) => {
                let granted = !self.reject_votes && req.term >= self.term;
                if granted {
                    self.term = req.term;
                }
                self.reply(AcceptorMessage::VoteResponse(VoteResponse {
                    term: self.term,
                    vote_given: granted,
                    flush_lsn: self.flush_lsn,
                    truncate_lsn: self.truncate_lsn,
                    term_history: self.history.clone(),
                    timeline_start_lsn: self.timeline_start_lsn,
                }));
                true
            }
            ProposerMessage::Elected(elected) => {
                if elected.term >= self.term {
                    self.term = elected.term;
                    self.flush_lsn = elected.start_streaming_at;
                    self.history = elected.term_history.clone();
                    self.timeline_start_lsn = elected.timeline_start_lsn;
                }
                self.elected.push(elected);
                false
            }
            ProposerMessage::AppendRequest(req) => {
                let h = req.header;
                self.appends.push(h);
                if h.term >= self.term {
                    if h.end_lsn > h.begin_lsn {
                        self.bad_wal_bytes += req
                            .wal_data
                            .iter()
                            .enumerate()
                            .filter(|(i, b)| **b != wal_byte(h.begin_lsn + *i as u64))
                            .count();
                        self.flush_lsn = h.end_lsn;
                    }
                    self.commit_lsn = h.commit_lsn.min(self.flush_lsn);
                    self.truncate_lsn = self.truncate_lsn.max(h.truncate_lsn);
                }
                self.reply(AcceptorMessage::AppendResponse(AppendResponse {
                    term: self.term,
                    flush_lsn: self.flush_lsn,
                    commit_lsn: self.commit_lsn,
                    hs_feedback: self.hs_feedback,
                    storage_feedback: self.storage_feedback,
                }));
                true
            }
        }
    }

    /// Whether an I/O fault applies now.
    fn io_fault(&mut self, fault: Fault) -> bool {
        let hit = self.fault == fault && !self.elected.is_empty();
        if hit {
            self.faults_hit += 1;
        }
        hit
    }
}

// ============================================================================
// Simulated host
// ============================================================================

struct SimApi {
    now: Duration,
    shared: SharedState,
    flush_lsn: Lsn,
    redo_start_lsn: Lsn,
    acceptors: Vec<SimAcceptor>,
    registered: Vec<bool>,
    events: VecDeque<WaitResult>,
    /// WAL below this is not readable until downloaded.
    local_wal_start: Lsn,
    refuse_recovery: bool,

    started_streaming: Option<Lsn>,
    finished_sync: Option<Lsn>,
    confirmed: Vec<Lsn>,
    downloads: Vec<(usize, Lsn, Lsn)>,
}

impl SimApi {
    fn new(acceptors: Vec<SimAcceptor>) -> Self {
        Self {
            now: Duration::ZERO,
            shared: SharedState::new(),
            flush_lsn: REDO_START,
            redo_start_lsn: REDO_START,
            registered: vec![false; acceptors.len()],
            acceptors,
            events: VecDeque::new(),
            local_wal_start: Lsn::INVALID,
            refuse_recovery: false,
            started_streaming: None,
            finished_sync: None,
            confirmed: Vec::new(),
            downloads: Vec::new(),
        }
    }

    fn push_readable(&mut self, peer: usize) {
        self.events.push_back(WaitResult::Peer {
            peer,
            events: Readiness::READABLE,
        });
    }

    /// Hands `bytes` to the acceptor behind `peer`.
    fn deliver(&mut self, peer: usize, bytes: &[u8]) -> bool {
        let Ok(msg) = ProposerMessage::decode(bytes) else {
            return false;
        };
        let acc = &mut self.acceptors[peer];
        if !acc.connected || acc.io_fault(Fault::WriteFailure) {
            return false;
        }
        if acc.receive(msg) {
            self.push_readable(peer);
        }
        true
    }
}

impl ProposerApi for SimApi {
    /// Index of the acceptor.
    type Conn = usize;

    fn now(&self) -> Duration {
        self.now
    }

    fn shared_state(&self) -> &SharedState {
        &self.shared
    }

    fn flush_rec_ptr(&self) -> Lsn {
        self.flush_lsn
    }

    fn redo_start_lsn(&self) -> Lsn {
        self.redo_start_lsn
    }

    fn conn_connect_start(&mut self, peer: usize, _endpoint: &str) -> usize {
        let acc = &mut self.acceptors[peer];
        acc.connects += 1;
        acc.connected = !acc.refuse_connect;
        acc.exec_ready = false;
        acc.inbox.clear();
        peer
    }

    fn conn_status(&self, conn: &usize) -> ConnStatus {
        if self.acceptors[*conn].connected {
            ConnStatus::Ok
        } else {
            ConnStatus::Bad
        }
    }

    fn conn_connect_poll(&mut self, conn: &mut usize) -> ConnectPollStatus {
        if self.acceptors[*conn].connected {
            ConnectPollStatus::Ok
        } else {
            ConnectPollStatus::Failed
        }
    }

    fn conn_send_query(&mut self, conn: &mut usize, query: &str) -> bool {
        assert_eq!(query, START_WAL_PUSH);
        let peer = *conn;
        if !self.acceptors[peer].silent {
            self.acceptors[peer].exec_ready = true;
            self.push_readable(peer);
        }
        true
    }

    fn conn_get_query_result(&mut self, conn: &mut usize) -> ExecStatus {
        let acc = &mut self.acceptors[*conn];
        if !acc.connected {
            ExecStatus::Failed
        } else if !std::mem::take(&mut acc.exec_ready) {
            ExecStatus::NeedsInput
        } else if acc.fault == Fault::NoCopyBoth {
            acc.faults_hit += 1;
            ExecStatus::UnexpectedSuccess
        } else {
            ExecStatus::CopyBoth
        }
    }

    fn conn_flush(&mut self, _conn: &mut usize) -> FlushStatus {
        FlushStatus::Done
    }

    fn conn_finish(&mut self, conn: usize) {
        let acc = &mut self.acceptors[conn];
        acc.connected = false;
        acc.exec_ready = false;
        acc.inbox.clear();
    }

    fn conn_async_read(&mut self, conn: &mut usize) -> AsyncRead {
        let acc = &mut self.acceptors[*conn];
        if !acc.connected || acc.io_fault(Fault::ReadFailure) {
            return AsyncRead::Fail;
        }
        match acc.inbox.pop_front() {
            Some(bytes) => AsyncRead::Success(bytes),
            None => AsyncRead::TryAgain,
        }
    }

    fn conn_async_write(&mut self, conn: &mut usize, buf: &[u8]) -> AsyncWrite {
        if self.deliver(*conn, buf) {
            AsyncWrite::Success
        } else {
            AsyncWrite::Fail
        }
    }

    fn conn_blocking_write(&mut self, conn: &mut usize, buf: &[u8]) -> bool {
        self.deliver(*conn, buf)
    }

    fn conn_error_message(&self, conn: &usize) -> String {
        if self.acceptors[*conn].refuse_connect {
            "connection refused".to_string()
        } else {
            "connection closed".to_string()
        }
    }

    fn add_peer_event(&mut self, peer: usize, _conn: &mut usize, interest: Readiness) {
        self.registered[peer] = true;
        if interest.writable {
            self.events.push_back(WaitResult::Peer {
                peer,
                events: Readiness::WRITABLE,
            });
        }
    }

    fn update_peer_event(&mut self, peer: usize, _conn: &mut usize, interest: Readiness) {
        if interest.writable {
            self.events.push_back(WaitResult::Peer {
                peer,
                events: Readiness::WRITABLE,
            });
        }
    }

    fn remove_peer_event(&mut self, peer: usize, _conn: &mut usize) {
        self.registered[peer] = false;
        self.events
            .retain(|ev| !matches!(ev, WaitResult::Peer { peer: p, .. } if *p == peer));
    }

    fn wait_event_set(&mut self, timeout: Option<Duration>) -> WaitResult {
        while let Some(ev) = self.events.pop_front() {
            match ev {
                WaitResult::Peer { peer, .. } if !self.registered[peer] => {}
                ev => return ev,
            }
        }
        self.now += timeout.unwrap_or(Duration::from_secs(1));
        WaitResult::Timeout
    }

    fn wal_read(&mut self, start: Lsn, buf: &mut [u8]) -> std::io::Result<()> {
        if start < self.local_wal_start {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("WAL at {start} was removed"),
            ));
        }
        for (i, b) in buf.iter_mut().enumerate() {
            *b = wal_byte(start + i as u64);
        }
        Ok(())
    }

    fn recovery_download(&mut self, donor: usize, _endpoint: &str, start: Lsn, end: Lsn) -> bool {
        self.downloads.push((donor, start, end));
        if self.refuse_recovery {
            return false;
        }
        self.local_wal_start = self.local_wal_start.min(start);
        true
    }

    fn start_streaming(&mut self, start: Lsn) {
        self.started_streaming = Some(start);
    }

    fn finish_sync_safekeepers(&mut self, lsn: Lsn) {
        self.finished_sync = Some(lsn);
    }

    fn confirm_wal_streamed(&mut self, truncate_lsn: Lsn) {
        self.confirmed.push(truncate_lsn);
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

type SimProposer = WalProposer<SimApi>;

fn config(n: usize) -> WalProposerConfig {
    WalProposerConfig {
        safekeepers: (0..n)
            .map(|i| format!("sk{i}:5454"))
            .collect::<Vec<_>>()
            .join(","),
        ..WalProposerConfig::default()
    }
}

fn sync_config(n: usize) -> WalProposerConfig {
    WalProposerConfig {
        sync_safekeepers: true,
        ..config(n)
    }
}

fn fresh_cluster(n: usize) -> Vec<SimAcceptor> {
    (0..n as u64).map(SimAcceptor::empty).collect()
}

fn started(config: &WalProposerConfig, acceptors: Vec<SimAcceptor>) -> SimProposer {
    let mut proposer =
        WalProposer::new(config, SimApi::new(acceptors)).expect("valid configuration");
    proposer.start();
    proposer
}

fn all_active(p: &SimProposer) -> bool {
    p.peers()
        .iter()
        .all(|sk| sk.state() == SafekeeperState::Active)
}

/// Polls until `done` holds.
fn poll_until(p: &mut SimProposer, done: impl Fn(&SimProposer) -> bool) {
    for _ in 0..MAX_STEPS {
        if done(&*p) {
            return;
        }
        p.poll().expect("poll failed");
    }
    assert!(done(&*p), "condition not reached after {MAX_STEPS} polls");
}

/// The peer's connection is closed and no longer polled.
fn assert_disconnected(p: &SimProposer, peer: usize) {
    assert_eq!(p.peers()[peer].state(), SafekeeperState::Offline);
    assert!(p.peers()[peer].conn.is_none());
    let api = p.api();
    assert!(!api.registered[peer]);
    assert!(!api.acceptors[peer].connected);
    assert!(
        api.events
            .iter()
            .all(|ev| !matches!(ev, WaitResult::Peer { peer: q, .. } if *q == peer))
    );
}

fn poll_until_synced(p: &mut SimProposer) -> Lsn {
    for _ in 0..MAX_STEPS {
        if let PollOutcome::Synced(lsn) = p.poll().expect("poll failed") {
            return lsn;
        }
    }
    panic!("not synced after {MAX_STEPS} polls");
}

fn elected_fresh_cluster() -> SimProposer {
    let mut p = started(&config(3), fresh_cluster(3));
    poll_until(&mut p, |p| all_active(p) && p.commit_lsn() == REDO_START);
    p
}

// ============================================================================
// Election Tests
// ============================================================================

#[test]
fn fresh_cluster_elects_first_term_at_redo_start() {
    let p = elected_fresh_cluster();

    assert_eq!(p.term(), Term::new(1));
    let election = p.election().expect("elected");
    assert_eq!(election.epoch_start_lsn, REDO_START);
    assert_eq!(election.timeline_start_lsn, REDO_START);
    assert_eq!(
        election.term_history.entries(),
        &[TermLsn::new(Term::new(1), REDO_START)]
    );

    let api = p.api();
    assert_eq!(api.started_streaming, Some(REDO_START));
    assert_eq!(api.shared.mine_last_elected_term(), Term::new(1));
    assert_eq!(api.confirmed, vec![REDO_START]);
    assert!(api.downloads.is_empty());
    for acc in &api.acceptors {
        assert_eq!(acc.term, Term::new(1));
        assert_eq!(acc.elected.len(), 1);
        assert_eq!(acc.elected[0].start_streaming_at, REDO_START);
    }
}

#[test]
fn most_advanced_voter_becomes_donor() {
    // Peers 0 and 1 vote first. Peer 0 has more WAL, but from an older term.
    let acceptors = vec![
        SimAcceptor::with_log(0, 5, 500, 100, &[(1, 0x10), (3, 200)]),
        SimAcceptor::with_log(1, 5, 400, 120, &[(1, 0x10), (5, 250)]),
        SimAcceptor::with_log(2, 5, 300, 150, &[(1, 0x10), (5, 250)]),
    ];
    let mut p = started(&config(3), acceptors);
    p.api_mut().flush_lsn = Lsn::new(400);

    poll_until(&mut p, |p| all_active(p) && p.commit_lsn() == Lsn::new(400));

    assert_eq!(p.term(), Term::new(6));
    let election = p.election().expect("elected");
    assert_eq!(election.donor, 1);
    assert_eq!(election.donor_epoch, Term::new(5));
    assert_eq!(election.epoch_start_lsn, Lsn::new(400));
    assert_eq!(election.truncate_lsn, Lsn::new(120));
    assert_eq!(election.timeline_start_lsn, Lsn::new(0x10));
    assert_eq!(
        election.term_history.last(),
        Some(&TermLsn::new(Term::new(6), Lsn::new(400)))
    );
    assert_eq!(election.term_history.len(), 3);

    let api = p.api();
    let starts: Vec<u64> = api
        .acceptors
        .iter()
        .map(|acc| acc.elected[0].start_streaming_at.as_u64())
        .collect();
    assert_eq!(starts, vec![200, 400, 300]);
    assert_eq!(api.downloads, vec![(1, Lsn::new(120), Lsn::new(400))]);
    for acc in &api.acceptors {
        assert_eq!(acc.flush_lsn, Lsn::new(400));
        assert_eq!(acc.bad_wal_bytes, 0);
    }
}

#[test]
fn higher_term_in_greeting_restarts_epoch() {
    let mut acceptors = fresh_cluster(3);
    acceptors[2].term = Term::new(9);
    let mut p = started(&config(3), acceptors);

    poll_until(&mut p, |p| all_active(p) && p.commit_lsn() == REDO_START);

    assert_eq!(p.term(), Term::new(10));
    for acc in &p.api().acceptors {
        assert_eq!(acc.term, Term::new(10));
        assert_eq!(acc.elected.len(), 1);
        assert_eq!(acc.elected[0].term, Term::new(10));
    }
}

#[test]
fn higher_term_in_append_response_restarts_epoch() {
    let mut p = elected_fresh_cluster();

    // Another proposer got acceptor 1 to term 20.
    p.api_mut().acceptors[1].term = Term::new(20);
    p.api_mut().flush_lsn = REDO_START + 100;
    p.api_mut().events.push_back(WaitResult::Latch);

    poll_until(&mut p, |p| p.term() == Term::new(21) && all_active(p));

    assert_eq!(p.api().shared.mine_last_elected_term(), Term::new(21));
    for acc in &p.api().acceptors {
        assert_eq!(acc.term, Term::new(21));
    }
}

#[test]
fn rejected_votes_prevent_election() {
    let mut acceptors = fresh_cluster(3);
    acceptors[0].reject_votes = true;
    acceptors[1].reject_votes = true;
    let mut p = started(&config(3), acceptors);

    for _ in 0..200 {
        p.poll().expect("poll failed");
    }

    assert!(p.election().is_none());
    assert_eq!(p.term(), Term::new(1));
    let api = p.api();
    assert_eq!(api.started_streaming, None);
    assert!(api.acceptors.iter().all(|acc| acc.elected.is_empty()));
    assert_eq!(api.acceptors[2].term, Term::new(1));
}

#[test]
fn elected_is_sent_once_per_connection() {
    let mut p = elected_fresh_cluster();

    p.send_elected(0).expect("resend is a no-op");

    assert_eq!(p.api().acceptors[0].elected.len(), 1);
}

// ============================================================================
// Sync Mode Tests
// ============================================================================

#[test]
fn sync_mode_finishes_at_once_when_acceptors_agree() {
    let acceptors = vec![SimAcceptor::with_log(0, 2, 0x5000, 0x5000, &[(2, 0x1000)])];
    let mut p = started(&sync_config(1), acceptors);

    let lsn = poll_until_synced(&mut p);

    assert_eq!(lsn, Lsn::new(0x5000));
    assert_eq!(p.term(), Term::new(3));
    let api = p.api();
    assert_eq!(api.finished_sync, Some(Lsn::new(0x5000)));
    assert_eq!(api.started_streaming, None);
    assert!(api.acceptors[0].elected.is_empty());

    // Finished stays finished.
    assert_eq!(p.poll().expect("poll"), PollOutcome::Synced(Lsn::new(0x5000)));
}

#[test]
fn sync_mode_brings_lagging_acceptors_to_epoch_start() {
    let acceptors = vec![
        SimAcceptor::with_log(0, 2, 0x5000, 0x1000, &[(2, 0x1000)]),
        SimAcceptor::with_log(1, 2, 0x4000, 0x1000, &[(2, 0x1000)]),
        SimAcceptor::with_log(2, 2, 0x4000, 0x1000, &[(2, 0x1000)]),
    ];
    let mut p = started(&sync_config(3), acceptors);

    let lsn = poll_until_synced(&mut p);

    assert_eq!(lsn, Lsn::new(0x5000));
    let api = p.api();
    assert_eq!(api.finished_sync, Some(lsn));
    assert_eq!(api.started_streaming, None);
    assert!(api.confirmed.is_empty());
    assert_eq!(api.acceptors[1].elected[0].start_streaming_at, Lsn::new(0x4000));
    let synced = api
        .acceptors
        .iter()
        .filter(|acc| acc.flush_lsn == lsn)
        .count();
    assert!(synced >= 2);
    assert!(api.acceptors.iter().all(|acc| acc.bad_wal_bytes == 0));
}

// ============================================================================
// Connection Tests
// ============================================================================

#[test]
fn refused_connection_stays_offline_until_reconnect() {
    let mut acceptors = fresh_cluster(3);
    acceptors[0].refuse_connect = true;
    acceptors[1].refuse_connect = true;
    let mut p = started(&config(3), acceptors);

    assert_eq!(p.peers()[0].state(), SafekeeperState::Offline);
    assert_eq!(p.peers()[2].state(), SafekeeperState::ConnectingWrite);
    assert!(matches!(
        p.check_quorum_reachable(),
        Err(ProposerError::QuorumUnavailable {
            connected: 1,
            quorum: 2
        })
    ));

    p.api_mut().acceptors[0].refuse_connect = false;
    poll_until(&mut p, |p| {
        p.peers()[0].state() == SafekeeperState::Active
            && p.peers()[2].state() == SafekeeperState::Active
    });

    assert!(p.api().acceptors[0].connects >= 2);
    assert_eq!(p.peers()[1].state(), SafekeeperState::Offline);
    p.check_quorum_reachable().expect("quorum reachable");
}

#[test]
fn silent_acceptor_is_reset_after_connection_timeout() {
    let mut acceptors = fresh_cluster(3);
    acceptors[2].silent = true;
    let config = WalProposerConfig {
        connection_timeout_ms: 2_000,
        ..config(3)
    };
    let mut p = started(&config, acceptors);

    poll_until(&mut p, |p| p.api().acceptors[2].connects >= 3);

    assert!(p.election().is_some());
    assert_eq!(p.peers()[0].state(), SafekeeperState::Active);
    assert_eq!(p.peers()[1].state(), SafekeeperState::Active);
    assert_eq!(p.api().acceptors[0].connects, 1);
    assert!(p.api().now >= Duration::from_secs(4));
}

// ============================================================================
// Streaming Tests
// ============================================================================

#[test]
fn new_wal_is_streamed_and_committed() {
    let mut acceptors = fresh_cluster(3);
    for (acc, (ts, xmin)) in acceptors.iter_mut().zip([(1, 100), (2, 90), (3, 0)]) {
        acc.hs_feedback = HotStandbyFeedback {
            ts,
            xmin,
            catalog_xmin: 0,
        };
    }
    acceptors[0].storage_feedback = Some(StorageFeedback {
        current_timeline_size: 10,
        disk_consistent_lsn: Lsn::new(0x2000),
        ..StorageFeedback::default()
    });
    acceptors[1].storage_feedback = Some(StorageFeedback {
        current_timeline_size: 20,
        disk_consistent_lsn: Lsn::new(0x3000),
        ..StorageFeedback::default()
    });
    let mut p = started(&config(3), acceptors);
    poll_until(&mut p, |p| all_active(p) && p.commit_lsn() == REDO_START);

    let target = REDO_START + (2 * MAX_SEND_SIZE as u64 + 100);
    p.api_mut().flush_lsn = target;
    p.api_mut().events.push_back(WaitResult::Latch);
    poll_until(&mut p, |p| {
        p.commit_lsn() == target && p.truncate_lsn() == target
    });

    assert_eq!(p.available_lsn(), target);
    let api = p.api();
    assert_eq!(api.confirmed.last(), Some(&target));
    assert!(api.confirmed.windows(2).all(|w| w[0] < w[1]));
    for acc in &api.acceptors {
        assert_eq!(acc.flush_lsn, target);
        assert_eq!(acc.bad_wal_bytes, 0);
        assert!(
            acc.appends
                .iter()
                .all(|h| h.payload_len() <= MAX_SEND_SIZE as u64)
        );
    }

    let feedback = api.shared.feedback();
    assert_eq!(feedback.hot_standby.xmin, 90);
    assert_eq!(feedback.hot_standby.ts, 3);
    let storage = feedback.storage.expect("storage feedback");
    assert_eq!(storage.current_timeline_size, 20);
    assert_eq!(storage.disk_consistent_lsn, Lsn::new(0x2000));
}

#[test]
fn keepalive_carries_commit_position() {
    let mut p = elected_fresh_cluster();
    let sent_before = p.api().acceptors[0].appends.len();

    // Nothing queued: the wait times out and a keepalive goes out.
    p.api_mut().events.clear();
    p.poll().expect("poll failed");

    let acc = &p.api().acceptors[0];
    assert!(acc.appends.len() > sent_before);
    let keepalive = acc.appends.last().expect("keepalive");
    assert_eq!(keepalive.payload_len(), 0);
    assert_eq!(keepalive.commit_lsn, REDO_START);
}

// ============================================================================
// Recovery Tests
// ============================================================================

/// Peer 0 holds WAL past the host's oldest local segment, peers 1 and 2 lag.
fn cluster_ahead_of_host() -> SimProposer {
    let acceptors = vec![
        SimAcceptor::with_log(0, 1, 0x5000, 0x2000, &[(1, 0x1000)]),
        SimAcceptor::with_log(1, 1, 0x3000, 0x2000, &[(1, 0x1000)]),
        SimAcceptor::with_log(2, 1, 0x3000, 0x2000, &[(1, 0x1000)]),
    ];
    let mut p = started(&config(3), acceptors);
    let api = p.api_mut();
    api.flush_lsn = Lsn::new(0x5000);
    api.redo_start_lsn = Lsn::new(0x5000);
    api.local_wal_start = Lsn::new(0x5000);
    p
}

#[test]
fn donor_wal_is_downloaded_before_streaming() {
    let mut p = cluster_ahead_of_host();

    poll_until(&mut p, |p| all_active(p) && p.commit_lsn() == Lsn::new(0x5000));

    let election = p.election().expect("elected");
    assert_eq!(election.donor, 0);
    assert_eq!(election.epoch_start_lsn, Lsn::new(0x5000));
    let api = p.api();
    assert_eq!(api.downloads, vec![(0, Lsn::new(0x2000), Lsn::new(0x5000))]);
    assert_eq!(api.started_streaming, Some(Lsn::new(0x5000)));
    for acc in &api.acceptors[1..] {
        assert_eq!(acc.elected[0].start_streaming_at, Lsn::new(0x3000));
    }
    for acc in &api.acceptors {
        assert_eq!(acc.flush_lsn, Lsn::new(0x5000));
        assert_eq!(acc.bad_wal_bytes, 0);
    }
}

#[test]
fn failed_download_stops_the_proposer() {
    let mut p = cluster_ahead_of_host();
    p.api_mut().refuse_recovery = true;

    let err = (0..MAX_STEPS)
        .find_map(|_| p.poll().err())
        .expect("download failure is reported");

    match err {
        ProposerError::Recovery { donor, start, end } => {
            assert_eq!(donor, 0);
            assert_eq!(start, Lsn::new(0x2000));
            assert_eq!(end, Lsn::new(0x5000));
        }
        other => panic!("unexpected error: {other}"),
    }
    let api = p.api();
    assert_eq!(api.started_streaming, None);
    assert!(api.acceptors.iter().all(|acc| acc.appends.is_empty()));
}

#[test]
fn sync_mode_never_downloads() {
    let acceptors = vec![
        SimAcceptor::with_log(0, 2, 0x5000, 0x1000, &[(2, 0x1000)]),
        SimAcceptor::with_log(1, 2, 0x4000, 0x1000, &[(2, 0x1000)]),
        SimAcceptor::with_log(2, 2, 0x4000, 0x1000, &[(2, 0x1000)]),
    ];
    let mut p = started(&sync_config(3), acceptors);
    p.api_mut().refuse_recovery = true;

    assert_eq!(poll_until_synced(&mut p), Lsn::new(0x5000));
    assert!(p.api().downloads.is_empty());
}

// ============================================================================
// Misbehaving Acceptor Tests
// ============================================================================

#[test_case(Fault::NoCopyBoth ; "start command without copy both")]
#[test_case(Fault::GarbageGreeting ; "undecodable greeting")]
#[test_case(Fault::GreetingForVote ; "greeting instead of vote")]
#[test_case(Fault::StaleGrant ; "grant under a stale term")]
#[test_case(Fault::ReadFailure ; "read failure while streaming")]
#[test_case(Fault::WriteFailure ; "write failure while streaming")]
fn misbehaving_acceptor_is_disconnected(fault: Fault) {
    let mut acceptors = fresh_cluster(3);
    acceptors[2].fault = fault;
    let mut p = started(&config(3), acceptors);

    poll_until(&mut p, |p| {
        p.api().acceptors[2].faults_hit > 0 && p.peers()[2].state() == SafekeeperState::Offline
    });
    assert_disconnected(&p, 2);

    // The other two still form a quorum.
    poll_until(&mut p, |p| {
        p.commit_lsn() == REDO_START
            && p.peers()[..2]
                .iter()
                .all(|sk| sk.state() == SafekeeperState::Active)
    });
    assert_ne!(p.election().expect("elected").donor, 2);
    assert_ne!(p.peers()[2].state(), SafekeeperState::Active);
}

#[test]
fn stale_grants_are_never_counted() {
    let mut acceptors = fresh_cluster(3);
    acceptors[1].fault = Fault::StaleGrant;
    acceptors[2].fault = Fault::StaleGrant;
    let mut p = started(&config(3), acceptors);

    for _ in 0..200 {
        p.poll().expect("poll failed");
        assert!(p.granted_votes().iter().all(|(peer, _)| *peer == 0));
    }

    assert!(p.election().is_none());
    let api = p.api();
    assert!(api.acceptors[1].faults_hit > 1);
    assert_eq!(api.started_streaming, None);
    assert!(api.acceptors.iter().all(|acc| acc.elected.is_empty()));
}

#[test]
fn acceptor_with_inconsistent_history_is_disconnected() {
    // Peer 2 claims term 5 began at 260; the donor says 250.
    let acceptors = vec![
        SimAcceptor::with_log(0, 5, 400, 0x10, &[(1, 0x10), (5, 250)]),
        SimAcceptor::with_log(1, 5, 400, 0x10, &[(1, 0x10), (5, 250)]),
        SimAcceptor::with_log(2, 5, 300, 0x10, &[(1, 0x10), (5, 260)]),
    ];
    let mut p = started(&config(3), acceptors);
    p.api_mut().flush_lsn = Lsn::new(400);

    poll_until(&mut p, |p| {
        p.commit_lsn() == Lsn::new(400) && p.peers()[2].state() == SafekeeperState::Offline
    });

    assert_eq!(p.election().expect("elected").donor, 0);
    assert_disconnected(&p, 2);
    let api = p.api();
    assert!(api.acceptors[2].elected.is_empty());
    assert_eq!(api.acceptors[2].flush_lsn, Lsn::new(300));
}
