//! Quorum arithmetic.
//!
//! Pure functions over acceptor reports; the proposer feeds them from its
//! peer records.

use walprop_types::{Lsn, Term};

/// Number of acceptors forming a majority of `n`.
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}

/// Highest LSN flushed by at least `quorum` acceptors.
///
/// Flushes below `epoch_start_lsn` count as zero: WAL from previous terms may
/// not be committed by this proposer until its own epoch start is
/// acknowledged. Returns [`Lsn::INVALID`] when fewer than `quorum` acceptors
/// reported.
pub fn quorum_commit_lsn(
    flush_lsns: impl IntoIterator<Item = Lsn>,
    epoch_start_lsn: Lsn,
    quorum: usize,
) -> Lsn {
    let mut flushes: Vec<Lsn> = flush_lsns
        .into_iter()
        .map(|lsn| {
            if lsn < epoch_start_lsn {
                Lsn::INVALID
            } else {
                lsn
            }
        })
        .collect();
    if quorum == 0 || flushes.len() < quorum {
        return Lsn::INVALID;
    }
    flushes.sort_unstable_by(|a, b| b.cmp(a));
    flushes[quorum - 1]
}

/// Lowest flush among reporting acceptors, `None` if nobody reported.
pub fn min_flush_lsn(flush_lsns: impl IntoIterator<Item = Lsn>) -> Option<Lsn> {
    flush_lsns.into_iter().min()
}

/// Picks the voter with the most advanced log.
///
/// Logs compare by `(epoch, flush_lsn)`. Candidates are visited in peer index
/// order and only a strictly greater log replaces the current pick, so ties
/// go to the lowest index.
pub fn choose_donor(candidates: impl IntoIterator<Item = (usize, Term, Lsn)>) -> Option<usize> {
    let mut best: Option<(usize, Term, Lsn)> = None;
    for (peer, epoch, flush) in candidates {
        let better = best.is_none_or(|(_, best_epoch, best_flush)| {
            (epoch, flush) > (best_epoch, best_flush)
        });
        if better {
            best = Some((peer, epoch, flush));
        }
    }
    best.map(|(peer, _, _)| peer)
}
