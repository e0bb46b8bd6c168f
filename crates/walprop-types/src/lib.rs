//! # walprop-types: Core types for the WAL proposer
//!
//! This crate contains the value types shared by every proposer crate:
//! - Consensus clock ([`Term`])
//! - WAL positions ([`Lsn`])
//! - Acceptor identity ([`NodeId`])
//! - Term switch history ([`TermLsn`], [`TermHistory`])
//! - Timeline addressing ([`TimelineId`], [`TenantId`])

use std::{
    fmt::{Debug, Display},
    ops::{Add, Sub},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Term - logical leadership epoch
// ============================================================================

/// Consensus logical timestamp.
///
/// Terms are totally ordered; a higher term supersedes every lower one. A
/// proposer never reuses a term.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub const fn new(term: u64) -> Self {
        Self(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the term immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Term> for u64 {
    fn from(term: Term) -> Self {
        term.0
    }
}

// ============================================================================
// Lsn - WAL byte position
// ============================================================================

/// Log sequence number: a byte offset into the write-ahead log.
///
/// `Lsn(0)` is reserved as the invalid position, meaning "nothing yet".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Returns `self - other` in bytes, or `None` if `other` is ahead.
    pub fn checked_sub(self, other: Lsn) -> Option<u64> {
        self.0.checked_sub(other.0)
    }

    /// Returns how many bytes `self` is behind `ahead`, clamped at zero.
    pub fn lag_behind(self, ahead: Lsn) -> u64 {
        ahead.0.saturating_sub(self.0)
    }
}

/// Formats as `high/low` in hex, the customary WAL position notation.
impl Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl Debug for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lsn({self})")
    }
}

impl Add<u64> for Lsn {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

impl Sub<Lsn> for Lsn {
    type Output = u64;
    fn sub(self, rhs: Lsn) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

// ============================================================================
// NodeId - acceptor identity
// ============================================================================

/// Storage node identifier reported by an acceptor in its greeting.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Term History
// ============================================================================

/// A term switch: `term` began at `lsn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TermLsn {
    pub term: Term,
    pub lsn: Lsn,
}

impl TermLsn {
    pub fn new(term: Term, lsn: Lsn) -> Self {
        Self { term, lsn }
    }
}

impl From<(u64, u64)> for TermLsn {
    fn from((term, lsn): (u64, u64)) -> Self {
        Self {
            term: Term::new(term),
            lsn: Lsn::new(lsn),
        }
    }
}

/// Ordered chain of term switches, term ascending.
///
/// Each entry records where a term began; a term ends where the next one
/// begins (or at the owner's end of WAL for the last entry).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermHistory(Vec<TermLsn>);

impl TermHistory {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_entries(entries: Vec<TermLsn>) -> Self {
        debug_assert!(
            entries.windows(2).all(|w| w[0].term < w[1].term),
            "term history must be ordered by term"
        );
        Self(entries)
    }

    pub fn entries(&self) -> &[TermLsn] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&TermLsn> {
        self.0.last()
    }

    /// Term of the last switch, or [`Term::ZERO`] for an empty history.
    ///
    /// This is the "epoch" of an acceptor: the latest term it holds WAL from.
    pub fn highest_term(&self) -> Term {
        self.0.last().map_or(Term::ZERO, |e| e.term)
    }

    /// Appends a switch to `term` at `lsn`, closing the previous term there.
    pub fn push(&mut self, term: Term, lsn: Lsn) {
        debug_assert!(
            self.0.last().is_none_or(|e| e.term < term),
            "term history must grow by term"
        );
        self.0.push(TermLsn { term, lsn });
    }

    /// Returns a copy with switches happening strictly after `up_to` removed.
    pub fn up_to(&self, up_to: Lsn) -> TermHistory {
        TermHistory(self.0.iter().take_while(|e| e.lsn <= up_to).copied().collect())
    }

    /// First term both histories switch to at different positions, with
    /// `self`'s and `other`'s start of it.
    ///
    /// Logs agreeing on a term agree on where it began, so a conflict means
    /// one of the histories is corrupt.
    pub fn conflicting_switch(&self, other: &TermHistory) -> Option<(Term, Lsn, Lsn)> {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a.term == b.term)
            .find(|(a, b)| a.lsn != b.lsn)
            .map(|(a, b)| (a.term, a.lsn, b.lsn))
    }

    /// Finds where an acceptor's log diverges from the proposer's.
    ///
    /// The histories are not symmetric: the proposer's last term extends to
    /// +infinity, the acceptor's ends at `acceptor_flush_lsn`. Returns the last
    /// common term together with the position where it ends on both sides, or
    /// `None` if the histories share no term. A term that began at different
    /// positions (see [`TermHistory::conflicting_switch`]) is not common.
    pub fn highest_common_point(
        proposer: &TermHistory,
        acceptor: &TermHistory,
        acceptor_flush_lsn: Lsn,
    ) -> Option<TermLsn> {
        let (prop, acc) = (&proposer.0, &acceptor.0);

        let mut last_common = None;
        for (i, (p, a)) in prop.iter().zip(acc.iter()).enumerate() {
            if p.term != a.term || p.lsn != a.lsn {
                break;
            }
            last_common = Some(i);
        }
        let i = last_common?;

        if i + 1 == prop.len() {
            return Some(TermLsn::new(prop[i].term, acceptor_flush_lsn));
        }
        let prop_term_end = prop[i + 1].lsn;
        let acc_term_end = acc.get(i + 1).map_or(acceptor_flush_lsn, |e| e.lsn);
        Some(TermLsn::new(prop[i].term, prop_term_end.min(acc_term_end)))
    }
}

/// Display only the latest entries; histories can grow long.
impl Debug for TermHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const N_PRINTED: usize = 20;
        let skipped = self.0.len().saturating_sub(N_PRINTED);
        if skipped > 0 {
            write!(f, "... ")?;
        }
        f.debug_list()
            .entries(self.0[skipped..].iter().map(|e| (e.term.0, e.lsn)))
            .finish()
    }
}

impl From<Vec<TermLsn>> for TermHistory {
    fn from(entries: Vec<TermLsn>) -> Self {
        Self::from_entries(entries)
    }
}

// ============================================================================
// Timeline addressing - 16-byte ids, hex encoded
// ============================================================================

/// Length in bytes of timeline and tenant identifiers.
pub const ID_LENGTH: usize = 16;

/// Error returned when parsing a hex identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError(String);

impl Display for ParseIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid id '{}': expected 32 hex digits", self.0)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; ID_LENGTH]);

        impl $name {
            pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", Uuid::from_bytes(self.0).simple())
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({self})", stringify!($name))
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != 2 * ID_LENGTH {
                    return Err(ParseIdError(s.to_string()));
                }
                Uuid::try_parse(s)
                    .map(|u| Self(u.into_bytes()))
                    .map_err(|_| ParseIdError(s.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseIdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

hex_id!(
    /// Identifier of the timeline whose WAL is replicated.
    TimelineId
);

hex_id!(
    /// Identifier of the tenant owning the timeline.
    TenantId
);
