use crate::ops::{CoreLog, LocalChange, LogOp};
use crate::types::{LogDocument, Transaction};
use anyhow::{anyhow, Context, Result};
use fs_err::{self as fs, File, OpenOptions};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStatus {
    pub n_keys: usize,
    pub n_deleted: usize,
    pub path: Option<PathBuf>,
}

/// Log contents plus where they are persisted. Only reachable through the
/// [`TransactionLog`] lock, so every mutation and its save happen in one
/// critical section.
pub struct LogState {
    core: CoreLog,

    /// JSON document path; `None` keeps the log in memory only
    path: Option<PathBuf>,
}

/// The transaction log shared by the classifier, the scanner and every
/// peer session.
///
/// - one transaction per sync key, last write wins
/// - a single RwLock serializes all mutations
/// - each mutation rewrites the whole JSON document atomically
#[derive(Clone)]
pub struct TransactionLog {
    state: Arc<RwLock<LogState>>,
}

impl LogState {
    fn load(path: &Path) -> Result<CoreLog> {
        let data = fs::read(path)?;
        let entries: LogDocument = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse transaction log {}", path.display()))?;
        Ok(CoreLog::from_document(entries))
    }

    pub fn persist_to_disk(&mut self) -> Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| anyhow!("Transaction log path not configured"))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec(self.core.entries())?;

        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            writer.write_all(&encoded)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        trace!("Saved transaction log to {:?}", path);
        Ok(())
    }

    /// The only method that mutates the log.
    fn execute_op(&mut self, op: LogOp) -> Result<Option<Transaction>> {
        if self.core.is_noop(&op) {
            trace!("Skipping noop op: {op:?}");
            return Ok(None);
        }
        let key = op.key().to_string();
        let previous = self.core.entries().get(&key).cloned();
        let tx = self.core.execute(op);
        if self.path.is_some() {
            if let Err(e) = self.persist_to_disk() {
                // Memory must not run ahead of the saved document
                self.core.restore(&key, previous);
                return Err(e.context("Failed to save transaction log"));
            }
        }
        Ok(Some(tx))
    }

    /// Record a local change. Returns the new transaction, or `None` when the
    /// log already reflects it.
    pub fn record_local(&mut self, key: &str, change: LocalChange) -> Result<Option<Transaction>> {
        self.execute_op(LogOp::Record {
            key: key.to_string(),
            change,
        })
    }

    /// Overwrite the entry with a remote transaction. Returns `false` when the
    /// identical transaction was already stored.
    pub fn apply_remote(&mut self, key: &str, tx: Transaction) -> Result<bool> {
        debug!(key, "Applying remote transaction: {tx:?}");
        let applied = self.execute_op(LogOp::Apply {
            key: key.to_string(),
            tx,
        })?;
        Ok(applied.is_some())
    }

    pub fn get(&self, key: &str) -> Option<Transaction> {
        self.core.entries().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.core.entries().contains_key(key)
    }

    pub fn entries(&self) -> &LogDocument {
        self.core.entries()
    }

    /// Copy of the whole document, as sent to peers.
    pub fn snapshot(&self) -> LogDocument {
        self.core.entries().clone()
    }

    pub fn len(&self) -> usize {
        self.core.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.entries().is_empty()
    }

    pub fn status(&self) -> LogStatus {
        LogStatus {
            n_keys: self.len(),
            n_deleted: self
                .core
                .entries()
                .values()
                .filter(|tx| tx.is_deleted())
                .count(),
            path: self.path.clone(),
        }
    }
}

impl TransactionLog {
    /// A log that is never written to disk.
    pub fn in_memory() -> Self {
        Self::from_state(LogState {
            core: CoreLog::new(),
            path: None,
        })
    }

    /// Open the log at `path`, creating an empty document when none exists.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut state = LogState {
            core: CoreLog::new(),
            path: Some(path.clone()),
        };

        if path.exists() {
            state.core = LogState::load(&path)?;
            info!(
                "Loaded transaction log from {} ({} keys)",
                path.display(),
                state.len()
            );
        } else {
            info!("No database found, creating a new one at {}", path.display());
            state.persist_to_disk()?;
        }

        Ok(Self::from_state(state))
    }

    fn from_state(state: LogState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<LogState> {
        self.state.write().expect("Failed to lock transaction log")
    }

    pub fn read(&self) -> RwLockReadGuard<LogState> {
        self.state.read().expect("Failed to lock transaction log")
    }

    pub fn get(&self, key: &str) -> Option<Transaction> {
        self.read().get(key)
    }

    pub fn snapshot(&self) -> LogDocument {
        self.read().snapshot()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn record_local(&self, key: &str, change: LocalChange) -> Result<Option<Transaction>> {
        self.write().record_local(key, change)
    }

    pub fn apply_remote(&self, key: &str, tx: Transaction) -> Result<bool> {
        self.write().apply_remote(key, tx)
    }

    /// Save the current document (no-op for in-memory logs).
    pub fn persist(&self) -> Result<()> {
        let mut state = self.write();
        if state.path.is_none() {
            return Ok(());
        }
        state.persist_to_disk()
    }
}
