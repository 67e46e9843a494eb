//! peersync - keep local directories in sync across peers
//!
//! Every filesystem change becomes a timestamped transaction in a local
//! transaction log. Peers exchange their logs over a point-to-point
//! connection and fetch the files whose transactions are newer on the other
//! side (last write wins, by wall-clock timestamp).
//!
//! # Architecture
//!
//! - [`filter::ExclusionFilter`] - drops paths matching ignore patterns
//! - [`log::TransactionLog`] - sync key -> latest transaction, persisted as one JSON document
//! - [`classifier::ChangeClassifier`] - filesystem events -> transactions
//! - [`scanner::ReconciliationScanner`] - startup catch-up with changes made while offline
//! - [`session::SyncSession`] - per-peer rounds: log exchange, selective fetch, apply
//!
//! # Quick Start
//!
//! ```rust
//! use peersync::ops::LocalChange;
//! use peersync::types::{ContentHash, TxKind};
//! use peersync::TransactionLog;
//!
//! let log = TransactionLog::in_memory();
//! let hash = ContentHash::of_bytes(b"hello");
//! let change = LocalChange::Written { kind: TxKind::Created, hash };
//!
//! assert!(log.record_local("docs:hello.txt", change.clone()).unwrap().is_some());
//! // Same content again: nothing to record
//! assert!(log.record_local("docs:hello.txt", change).unwrap().is_none());
//! ```
//!
//! # Non-goals
//!
//! - vector clocks or merging of concurrent edits (timestamps decide)
//! - partial or resumable transfers
//! - payload encryption
//! - directory rename tracking (moves become delete + create)

pub mod classifier;
pub mod config;
pub mod filter;
pub mod log;
pub mod mapping;
pub mod ops;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod status;
pub mod transport;
pub mod types;

pub use classifier::ChangeClassifier;
pub use log::TransactionLog;
