//! # walprop: WAL proposer
//!
//! Streams a write-ahead log from a single writer to a fixed set of
//! acceptors. Before streaming, the proposer wins a term from a quorum of
//! acceptors; WAL is committed once a quorum has flushed it, so committed WAL
//! survives the loss of any minority.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       WalProposer                         │
//! │  ┌────────────┐   ┌──────────────┐   ┌─────────────────┐  │
//! │  │ Peer state │ → │   Election   │ → │ Streaming and   │  │
//! │  │  machines  │   │ (term, vote) │   │ commit, feedback│  │
//! │  └────────────┘   └──────────────┘   └─────────────────┘  │
//! │         │                                     │           │
//! │         ▼                                     ▼           │
//! │    ProposerApi (sockets, clock, WAL)     SharedState      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The proposer is a single-threaded reactor with no I/O of its own. The
//! host implements [`ProposerApi`]; [`net::MioTransport`] covers the socket
//! half of it. Only [`SharedState`] is shared with other threads.
//!
//! ## Usage
//!
//! ```ignore
//! use walprop::{WalProposer, PollOutcome};
//! use walprop_config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load()?;
//! let mut proposer = WalProposer::new(&config, host)?;
//! proposer.start();
//! loop {
//!     if let PollOutcome::Synced(lsn) = proposer.poll()? {
//!         println!("{lsn}");
//!         break;
//!     }
//! }
//! ```

pub mod api;
mod error;
pub mod feedback;
pub mod instrumentation;
pub mod net;
mod peer;
mod proposer;
pub mod quorum;
#[cfg(test)]
mod tests;

pub use api::{ProposerApi, Readiness, WaitResult};
pub use error::{ProposerError, ProposerResult};
pub use feedback::{AggregatedFeedback, BackpressureLimits, ReplicationLag, SharedState};
pub use instrumentation::METRICS;
pub use peer::{Safekeeper, SafekeeperState};
pub use proposer::{ElectionResult, PollOutcome, WalProposer};
