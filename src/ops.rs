use crate::types::{ContentHash, LogDocument, Transaction, TxKind};
use serde::{Deserialize, Serialize};

/// A locally observed change, before it is stamped into a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalChange {
    /// File created or modified; carries the hash of its current content.
    Written { kind: TxKind, hash: ContentHash },
    /// File no longer exists.
    Removed,
}

/// Atomic log operations - the only instructions that mutate [`CoreLog`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOp {
    /// Local classification. A no-op when the stored hash already matches,
    /// or the key is already deleted.
    Record { key: String, change: LocalChange },

    /// Overwrite with a remote peer's transaction (last-write-wins was
    /// decided before the fetch).
    Apply { key: String, tx: Transaction },
}

impl LogOp {
    pub fn key(&self) -> &str {
        match self {
            LogOp::Record { key, .. } | LogOp::Apply { key, .. } => key,
        }
    }
}

/// In-memory form of the log: one transaction per key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreLog {
    entries: LogDocument,
}

impl CoreLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(entries: LogDocument) -> Self {
        Self { entries }
    }

    pub fn is_noop(&self, op: &LogOp) -> bool {
        match op {
            LogOp::Record { key, change } => {
                let Some(existing) = self.entries.get(key) else {
                    return false;
                };
                match change {
                    LocalChange::Written { hash, .. } => {
                        existing.content_hash.as_ref() == Some(hash)
                    }
                    LocalChange::Removed => existing.is_deleted(),
                }
            }
            LogOp::Apply { key, tx } => self.entries.get(key) == Some(tx),
        }
    }

    /// Execute an operation, returning the transaction now stored for the
    /// key. Callers check [`CoreLog::is_noop`] first.
    pub fn execute(&mut self, op: LogOp) -> Transaction {
        let (key, tx) = match op {
            LogOp::Record { key, change } => {
                let tx = match change {
                    LocalChange::Written { kind, hash } => Transaction::new(kind, hash),
                    LocalChange::Removed => Transaction::deleted(),
                };
                (key, tx)
            }
            LogOp::Apply { key, tx } => (key, tx),
        };
        self.entries.insert(key, tx.clone());
        tx
    }

    /// Put back what [`CoreLog::execute`] replaced.
    pub fn restore(&mut self, key: &str, previous: Option<Transaction>) {
        match previous {
            Some(tx) => {
                self.entries.insert(key.to_string(), tx);
            }
            None => {
                self.entries.remove(key);
            }
        }
    }

    pub fn entries(&self) -> &LogDocument {
        &self.entries
    }
}
