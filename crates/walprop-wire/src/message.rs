//! Proposer/acceptor protocol messages.
//!
//! ## Proposer → Acceptor ([`ProposerMessage`])
//! - [`ProposerGreeting`] - first message on a connection, identifies the timeline
//! - [`VoteRequest`] - asks for a vote in a term
//! - [`ProposerElected`] - announces the elected term and its history
//! - [`AppendRequest`] - a chunk of WAL plus commit/truncate positions
//!
//! ## Acceptor → Proposer ([`AcceptorMessage`])
//! - [`AcceptorGreeting`] - the acceptor's current term and node id
//! - [`VoteResponse`] - the vote, with the acceptor's log position and history
//! - [`AppendResponse`] - flush/commit progress and feedback
//!
//! Every message starts with a little-endian `u64` tag holding an ASCII
//! character; fixed fields follow in little-endian order.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;
use walprop_types::{Lsn, NodeId, TenantId, Term, TermHistory, TermLsn, TimelineId};

use crate::codec::BufExt;
use crate::error::{ProtocolError, WireResult};
use crate::feedback::{HotStandbyFeedback, StorageFeedback};
use crate::{MAX_SEND_SIZE, SK_MAGIC, SK_PROTOCOL_VERSION};

const TAG_GREETING: u64 = b'g' as u64;
const TAG_VOTE: u64 = b'v' as u64;
const TAG_ELECTED: u64 = b'e' as u64;
const TAG_APPEND: u64 = b'a' as u64;

const U32: usize = std::mem::size_of::<u32>();
const U64: usize = std::mem::size_of::<u64>();
const UUID: usize = 16;

/// Fixed part of an append response: tag, term, flush LSN, commit LSN and
/// hot standby feedback. Storage feedback, if any, follows.
pub const APPEND_RESPONSE_FIXED_SIZE: usize = U64 + 3 * U64 + HotStandbyFeedback::WIRE_SIZE;

/// Size of an encoded [`AppendRequestHeader`], tag included.
pub const APPEND_REQUEST_HEADER_SIZE: usize = U64 + 6 * U64 + UUID;

const GREETING_FIXED_SIZE: usize = U64 + 3 * U32 + UUID + U64 + 2 * UUID + 2 * U32;

// ============================================================================
// Proposer → Acceptor
// ============================================================================

/// Initial proposer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerGreeting {
    pub protocol_version: u32,
    pub pg_version: u32,
    pub proposer_id: Uuid,
    pub system_id: u64,
    pub timeline_id: TimelineId,
    pub tenant_id: TenantId,
    pub timeline: u32,
    pub wal_seg_size: u32,
}

/// Request for a vote in `term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: Term,
    /// For monitoring and debugging only.
    pub proposer_id: Uuid,
}

/// Announcement that the proposer won `term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerElected {
    pub term: Term,
    /// The proposer streams to this acceptor from here.
    pub start_streaming_at: Lsn,
    /// History of term switches up to and including `term`.
    pub term_history: TermHistory,
    /// Timeline globally starts at this LSN.
    pub timeline_start_lsn: Lsn,
}

/// Header of a WAL-carrying request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendRequestHeader {
    pub term: Term,
    /// LSN since which the current proposer appends WAL; the epoch switch
    /// point.
    pub epoch_start_lsn: Lsn,
    pub begin_lsn: Lsn,
    pub end_lsn: Lsn,
    /// LSN acknowledged by a quorum.
    pub commit_lsn: Lsn,
    /// Minimal LSN any acceptor may still need for recovery.
    pub truncate_lsn: Lsn,
    pub proposer_id: Uuid,
}

impl AppendRequestHeader {
    /// Number of WAL bytes the header announces.
    pub fn payload_len(&self) -> u64 {
        self.end_lsn - self.begin_lsn
    }

    /// Writes the header; the caller appends `payload_len()` WAL bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(APPEND_REQUEST_HEADER_SIZE);
        buf.put_u64_le(TAG_APPEND);
        buf.put_u64_le(self.term.as_u64());
        buf.put_u64_le(self.epoch_start_lsn.as_u64());
        buf.put_u64_le(self.begin_lsn.as_u64());
        buf.put_u64_le(self.end_lsn.as_u64());
        buf.put_u64_le(self.commit_lsn.as_u64());
        buf.put_u64_le(self.truncate_lsn.as_u64());
        buf.put_slice(self.proposer_id.as_bytes());
    }
}

/// WAL chunk with its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub header: AppendRequestHeader,
    pub wal_data: Bytes,
}

/// Messages sent by the proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposerMessage {
    Greeting(ProposerGreeting),
    VoteRequest(VoteRequest),
    Elected(ProposerElected),
    AppendRequest(AppendRequest),
}

impl ProposerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Greeting(_) => "ProposerGreeting",
            Self::VoteRequest(_) => "VoteRequest",
            Self::Elected(_) => "ProposerElected",
            Self::AppendRequest(_) => "AppendRequest",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Greeting(g) => {
                buf.reserve(GREETING_FIXED_SIZE);
                buf.put_u64_le(TAG_GREETING);
                buf.put_u32_le(SK_MAGIC);
                buf.put_u32_le(g.protocol_version);
                buf.put_u32_le(g.pg_version);
                buf.put_slice(g.proposer_id.as_bytes());
                buf.put_u64_le(g.system_id);
                buf.put_slice(g.timeline_id.as_bytes());
                buf.put_slice(g.tenant_id.as_bytes());
                buf.put_u32_le(g.timeline);
                buf.put_u32_le(g.wal_seg_size);
            }
            Self::VoteRequest(v) => {
                buf.put_u64_le(TAG_VOTE);
                buf.put_u64_le(v.term.as_u64());
                buf.put_slice(v.proposer_id.as_bytes());
            }
            Self::Elected(e) => {
                buf.put_u64_le(TAG_ELECTED);
                buf.put_u64_le(e.term.as_u64());
                buf.put_u64_le(e.start_streaming_at.as_u64());
                encode_term_history(&e.term_history, buf);
                buf.put_u64_le(e.timeline_start_lsn.as_u64());
            }
            Self::AppendRequest(a) => {
                debug_assert_eq!(a.header.payload_len(), a.wal_data.len() as u64);
                a.header.encode(buf);
                buf.put_slice(&a.wal_data);
            }
        }
    }

    pub fn decode(mut buf: &[u8]) -> WireResult<Self> {
        let tag = buf.try_get_u64_le("proposer message", "tag")?;
        match tag {
            TAG_GREETING => {
                const MSG: &str = "ProposerGreeting";
                check_fixed(MSG, GREETING_FIXED_SIZE - U64, buf.len())?;
                let magic = buf.try_get_u32_le(MSG, "magic")?;
                if magic != SK_MAGIC {
                    return Err(ProtocolError::BadMagic {
                        found: magic,
                        expected: SK_MAGIC,
                    });
                }
                let protocol_version = buf.try_get_u32_le(MSG, "protocol_version")?;
                if protocol_version != SK_PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion {
                        found: protocol_version,
                        expected: SK_PROTOCOL_VERSION,
                    });
                }
                Ok(Self::Greeting(ProposerGreeting {
                    protocol_version,
                    pg_version: buf.try_get_u32_le(MSG, "pg_version")?,
                    proposer_id: Uuid::from_bytes(buf.try_get_array16(MSG, "proposer_id")?),
                    system_id: buf.try_get_u64_le(MSG, "system_id")?,
                    timeline_id: TimelineId::from_bytes(buf.try_get_array16(MSG, "timeline_id")?),
                    tenant_id: TenantId::from_bytes(buf.try_get_array16(MSG, "tenant_id")?),
                    timeline: buf.try_get_u32_le(MSG, "timeline")?,
                    wal_seg_size: buf.try_get_u32_le(MSG, "wal_seg_size")?,
                }))
            }
            TAG_VOTE => {
                const MSG: &str = "VoteRequest";
                check_fixed(MSG, U64 + UUID, buf.len())?;
                Ok(Self::VoteRequest(VoteRequest {
                    term: Term::new(buf.try_get_u64_le(MSG, "term")?),
                    proposer_id: Uuid::from_bytes(buf.try_get_array16(MSG, "proposer_id")?),
                }))
            }
            TAG_ELECTED => {
                const MSG: &str = "ProposerElected";
                check_fixed(MSG, 2 * U64 + U32, buf.len())?;
                let term = Term::new(buf.try_get_u64_le(MSG, "term")?);
                let start_streaming_at = Lsn::new(buf.try_get_u64_le(MSG, "start_streaming_at")?);
                let term_history = decode_term_history(&mut buf, MSG)?;
                let timeline_start_lsn = Lsn::new(buf.try_get_u64_le(MSG, "timeline_start_lsn")?);
                Ok(Self::Elected(ProposerElected {
                    term,
                    start_streaming_at,
                    term_history,
                    timeline_start_lsn,
                }))
            }
            TAG_APPEND => {
                const MSG: &str = "AppendRequest";
                check_fixed(MSG, APPEND_REQUEST_HEADER_SIZE - U64, buf.len())?;
                let header = AppendRequestHeader {
                    term: Term::new(buf.try_get_u64_le(MSG, "term")?),
                    epoch_start_lsn: Lsn::new(buf.try_get_u64_le(MSG, "epoch_start_lsn")?),
                    begin_lsn: Lsn::new(buf.try_get_u64_le(MSG, "begin_lsn")?),
                    end_lsn: Lsn::new(buf.try_get_u64_le(MSG, "end_lsn")?),
                    commit_lsn: Lsn::new(buf.try_get_u64_le(MSG, "commit_lsn")?),
                    truncate_lsn: Lsn::new(buf.try_get_u64_le(MSG, "truncate_lsn")?),
                    proposer_id: Uuid::from_bytes(buf.try_get_array16(MSG, "proposer_id")?),
                };
                let size = header.end_lsn.checked_sub(header.begin_lsn).ok_or(
                    ProtocolError::InvalidAppendRange {
                        begin: header.begin_lsn,
                        end: header.end_lsn,
                    },
                )?;
                if size > MAX_SEND_SIZE as u64 {
                    return Err(ProtocolError::PayloadTooLarge {
                        size,
                        max: MAX_SEND_SIZE,
                    });
                }
                let size = size as usize;
                if buf.len() < size {
                    return Err(ProtocolError::Truncated {
                        message: MSG,
                        field: "wal_data",
                    });
                }
                Ok(Self::AppendRequest(AppendRequest {
                    header,
                    wal_data: Bytes::copy_from_slice(&buf[..size]),
                }))
            }
            tag => Err(ProtocolError::UnknownTag {
                direction: "proposer",
                tag,
            }),
        }
    }
}

// ============================================================================
// Acceptor → Proposer
// ============================================================================

/// Acceptor reply to the greeting: the highest term it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptorGreeting {
    pub term: Term,
    pub node_id: NodeId,
}

/// The vote.
///
/// Flush LSN and the term history let the proposer pick the most advanced
/// acceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_given: bool,
    pub flush_lsn: Lsn,
    /// Minimal LSN which may be needed for recovery of some acceptor.
    pub truncate_lsn: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

impl VoteResponse {
    /// The acceptor's epoch: the last term it holds WAL from.
    pub fn epoch(&self) -> Term {
        self.term_history.highest_term()
    }
}

/// Acceptor progress report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendResponse {
    /// Acceptor's current term; above the proposer's means the proposer is
    /// obsolete.
    pub term: Term,
    pub flush_lsn: Lsn,
    /// The acceptor's view of the commit position.
    pub commit_lsn: Lsn,
    pub hs_feedback: HotStandbyFeedback,
    pub storage_feedback: Option<StorageFeedback>,
}

/// Messages sent by an acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptorMessage {
    Greeting(AcceptorGreeting),
    VoteResponse(VoteResponse),
    AppendResponse(AppendResponse),
}

impl AcceptorMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Greeting(_) => "AcceptorGreeting",
            Self::VoteResponse(_) => "VoteResponse",
            Self::AppendResponse(_) => "AppendResponse",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Greeting(g) => {
                buf.put_u64_le(TAG_GREETING);
                buf.put_u64_le(g.term.as_u64());
                buf.put_u64_le(g.node_id.as_u64());
            }
            Self::VoteResponse(v) => {
                buf.put_u64_le(TAG_VOTE);
                buf.put_u64_le(v.term.as_u64());
                buf.put_u64_le(u64::from(v.vote_given));
                buf.put_u64_le(v.flush_lsn.as_u64());
                buf.put_u64_le(v.truncate_lsn.as_u64());
                encode_term_history(&v.term_history, buf);
                buf.put_u64_le(v.timeline_start_lsn.as_u64());
            }
            Self::AppendResponse(a) => {
                buf.reserve(APPEND_RESPONSE_FIXED_SIZE);
                buf.put_u64_le(TAG_APPEND);
                buf.put_u64_le(a.term.as_u64());
                buf.put_u64_le(a.flush_lsn.as_u64());
                buf.put_u64_le(a.commit_lsn.as_u64());
                a.hs_feedback.encode(buf);
                if let Some(fb) = &a.storage_feedback {
                    fb.encode(buf);
                }
            }
        }
    }

    pub fn decode(mut buf: &[u8]) -> WireResult<Self> {
        let total = buf.len();
        let tag = buf.try_get_u64_le("acceptor message", "tag")?;
        match tag {
            TAG_GREETING => {
                const MSG: &str = "AcceptorGreeting";
                check_fixed(MSG, 2 * U64, buf.len())?;
                Ok(Self::Greeting(AcceptorGreeting {
                    term: Term::new(buf.try_get_u64_le(MSG, "term")?),
                    node_id: NodeId::new(buf.try_get_u64_le(MSG, "node_id")?),
                }))
            }
            TAG_VOTE => {
                const MSG: &str = "VoteResponse";
                check_fixed(MSG, 4 * U64 + U32, buf.len())?;
                let term = Term::new(buf.try_get_u64_le(MSG, "term")?);
                let vote_given = buf.try_get_u64_le(MSG, "vote_given")? != 0;
                let flush_lsn = Lsn::new(buf.try_get_u64_le(MSG, "flush_lsn")?);
                let truncate_lsn = Lsn::new(buf.try_get_u64_le(MSG, "truncate_lsn")?);
                let term_history = decode_term_history(&mut buf, MSG)?;
                let timeline_start_lsn = Lsn::new(buf.try_get_u64_le(MSG, "timeline_start_lsn")?);
                Ok(Self::VoteResponse(VoteResponse {
                    term,
                    vote_given,
                    flush_lsn,
                    truncate_lsn,
                    term_history,
                    timeline_start_lsn,
                }))
            }
            TAG_APPEND => {
                const MSG: &str = "AppendResponse";
                if total < APPEND_RESPONSE_FIXED_SIZE {
                    return Err(ProtocolError::TooShort {
                        message: MSG,
                        needed: APPEND_RESPONSE_FIXED_SIZE,
                        actual: total,
                    });
                }
                let term = Term::new(buf.try_get_u64_le(MSG, "term")?);
                let flush_lsn = Lsn::new(buf.try_get_u64_le(MSG, "flush_lsn")?);
                let commit_lsn = Lsn::new(buf.try_get_u64_le(MSG, "commit_lsn")?);
                let hs_feedback = HotStandbyFeedback::decode(&mut buf, MSG)?;
                let storage_feedback = if buf.is_empty() {
                    None
                } else {
                    Some(StorageFeedback::decode(buf)?)
                };
                Ok(Self::AppendResponse(AppendResponse {
                    term,
                    flush_lsn,
                    commit_lsn,
                    hs_feedback,
                    storage_feedback,
                }))
            }
            tag => Err(ProtocolError::UnknownTag {
                direction: "acceptor",
                tag,
            }),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn check_fixed(message: &'static str, needed: usize, actual: usize) -> WireResult<()> {
    if actual < needed {
        // Report sizes including the tag already consumed.
        return Err(ProtocolError::TooShort {
            message,
            needed: needed + U64,
            actual: actual + U64,
        });
    }
    Ok(())
}

fn encode_term_history(history: &TermHistory, buf: &mut BytesMut) {
    buf.put_u32_le(history.len() as u32);
    for entry in history.entries() {
        buf.put_u64_le(entry.term.as_u64());
        buf.put_u64_le(entry.lsn.as_u64());
    }
}

fn decode_term_history(buf: &mut &[u8], message: &'static str) -> WireResult<TermHistory> {
    let n_entries = buf.try_get_u32_le(message, "term_history.n_entries")? as usize;
    if buf.len() < n_entries.saturating_mul(2 * U64) {
        return Err(ProtocolError::Truncated {
            message,
            field: "term_history.entries",
        });
    }
    let mut entries: Vec<TermLsn> = Vec::with_capacity(n_entries);
    for index in 0..n_entries {
        let term = Term::new(buf.try_get_u64_le(message, "term_history.term")?);
        let lsn = Lsn::new(buf.try_get_u64_le(message, "term_history.lsn")?);
        if entries.last().is_some_and(|prev| prev.term >= term) {
            return Err(ProtocolError::UnorderedTermHistory { index });
        }
        entries.push(TermLsn::new(term, lsn));
    }
    Ok(TermHistory::from_entries(entries))
}
