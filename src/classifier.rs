use crate::filter::{ExclusionFilter, LEGACY_PLACEHOLDER};
use crate::log::{LogState, TransactionLog};
use crate::mapping::Mapping;
use crate::ops::LocalChange;
use crate::types::{display_key, ContentHash, Transaction, TxKind};
use anyhow::{Context, Result};
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLockWriteGuard};
use tracing::{debug, info, trace};
use walkdir::WalkDir;

/// A filesystem change as delivered by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created { path: PathBuf, is_directory: bool },
    Modified { path: PathBuf, is_directory: bool },
    Deleted { path: PathBuf, is_directory: bool },
    Moved { from: PathBuf, to: PathBuf, is_directory: bool },
}

impl FsEvent {
    /// Convert a raw watcher event. Events that do not describe a content or
    /// name change (access, metadata-less `Other`) yield nothing.
    pub fn from_notify(event: notify::Event) -> Vec<FsEvent> {
        let mut paths = event.paths.into_iter();
        match event.kind {
            EventKind::Create(kind) => paths
                .map(|path| {
                    let is_directory = kind == CreateKind::Folder || path.is_dir();
                    FsEvent::Created { path, is_directory }
                })
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                match (paths.next(), paths.next()) {
                    (Some(from), Some(to)) => {
                        let is_directory = to.is_dir();
                        vec![FsEvent::Moved {
                            from,
                            to,
                            is_directory,
                        }]
                    }
                    _ => vec![],
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
                .map(|path| FsEvent::Deleted {
                    path,
                    is_directory: false,
                })
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
                .map(|path| {
                    let is_directory = path.is_dir();
                    FsEvent::Created { path, is_directory }
                })
                .collect(),
            EventKind::Modify(_) => paths
                .map(|path| {
                    let is_directory = path.is_dir();
                    FsEvent::Modified { path, is_directory }
                })
                .collect(),
            EventKind::Remove(kind) => paths
                .map(|path| FsEvent::Deleted {
                    path,
                    is_directory: kind == RemoveKind::Folder,
                })
                .collect(),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => vec![],
        }
    }
}

/// Turns filesystem events into log transactions.
///
/// Created/modified files are recorded only when their content hash changed,
/// deletions only when the key is not already deleted, so replayed or
/// duplicate watcher events leave the log untouched.
#[derive(Clone)]
pub struct ChangeClassifier {
    log: TransactionLog,
    mapping: Arc<Mapping>,
    filter: Arc<ExclusionFilter>,
}

impl ChangeClassifier {
    pub fn new(log: TransactionLog, mapping: Arc<Mapping>, filter: Arc<ExclusionFilter>) -> Self {
        Self {
            log,
            mapping,
            filter,
        }
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn filter(&self) -> &ExclusionFilter {
        &self.filter
    }

    /// Classify one event. Returns the number of log entries it changed.
    pub fn handle(&self, event: FsEvent) -> Result<usize> {
        trace!("Handling {event:?}");
        match event {
            FsEvent::Created { path, is_directory } => {
                self.on_written(&path, is_directory, TxKind::Created)
            }
            FsEvent::Modified { path, is_directory } => {
                self.on_written(&path, is_directory, TxKind::Modified)
            }
            FsEvent::Deleted { path, is_directory } => self.on_deleted(&path, is_directory),
            FsEvent::Moved {
                from,
                to,
                is_directory,
            } => self.on_moved(&from, &to, is_directory),
        }
    }

    /// Convenience for the watcher task: convert and classify.
    pub fn handle_notify(&self, event: notify::Event) -> Result<usize> {
        let mut changed = 0;
        for event in FsEvent::from_notify(event) {
            changed += self.handle(event)?;
        }
        Ok(changed)
    }

    fn on_written(&self, path: &Path, is_directory: bool, kind: TxKind) -> Result<usize> {
        if is_directory || self.filter.is_excluded(path, false) {
            return Ok(0);
        }
        let Some(key) = self.mapping.sync_key(path) else {
            debug!("Ignoring path outside synced directories: {}", path.display());
            return Ok(0);
        };

        // Hash under the write lock: an apply in progress holds it while the
        // file is being replaced.
        let log = self.log.write();
        let change = match ContentHash::of_file(path) {
            Ok(hash) => LocalChange::Written { kind, hash },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(key, "File vanished before hashing, recording deletion");
                LocalChange::Removed
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to hash {}", path.display()))
            }
        };
        Self::commit(log, &key, change)
    }

    fn on_deleted(&self, path: &Path, is_directory: bool) -> Result<usize> {
        if self.filter.is_excluded(path, is_directory) {
            return Ok(0);
        }
        let Some(key) = self.mapping.sync_key(path) else {
            debug!("Ignoring path outside synced directories: {}", path.display());
            return Ok(0);
        };

        let prefix = format!("{key}/");
        let (has_entry, has_children) = {
            let log = self.log.read();
            let has_children = log.entries().keys().any(|k| k.starts_with(&prefix));
            (log.contains(&key), has_children)
        };
        if !is_directory && !has_children {
            return self.record(&key, LocalChange::Removed);
        }

        // Gone as a directory: everything below it, plus a stale entry of
        // the same name.
        let mut changed = self.delete_tree(&prefix)?;
        if has_entry {
            changed += self.record(&key, LocalChange::Removed)?;
        }
        Ok(changed)
    }

    fn on_moved(&self, from: &Path, to: &Path, is_directory: bool) -> Result<usize> {
        let from_placeholder = from.to_string_lossy().ends_with(LEGACY_PLACEHOLDER);
        if from_placeholder {
            return self.on_written(to, is_directory, TxKind::Created);
        }

        if !is_directory {
            let removed = self.on_deleted(from, false)?;
            return Ok(removed + self.on_written(to, false, TxKind::Created)?);
        }

        // No directory rename tracking: everything below `from` is deleted
        // and everything below `to` is created.
        let mut changed = self.on_deleted(from, true)?;
        for entry in WalkDir::new(to).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                changed += self.on_written(entry.path(), false, TxKind::Created)?;
            }
        }
        Ok(changed)
    }

    fn delete_tree(&self, prefix: &str) -> Result<usize> {
        let live: Vec<String> = self
            .log
            .read()
            .entries()
            .iter()
            .filter(|(k, tx)| k.starts_with(prefix) && !tx.is_deleted())
            .map(|(k, _)| k.clone())
            .collect();

        let mut changed = 0;
        for key in live {
            changed += self.record(&key, LocalChange::Removed)?;
        }
        Ok(changed)
    }

    fn record(&self, key: &str, change: LocalChange) -> Result<usize> {
        Self::commit(self.log.write(), key, change)
    }

    fn commit(
        mut log: RwLockWriteGuard<LogState>,
        key: &str,
        change: LocalChange,
    ) -> Result<usize> {
        let Some(tx) = log.record_local(key, change)? else {
            trace!(key, "Log already up to date");
            return Ok(0);
        };
        let len = log.len();
        drop(log);

        report(key, &tx, len);
        Ok(1)
    }
}

fn report(key: &str, tx: &Transaction, len: usize) {
    info!(
        "{}: {:<128} (len watches: {len})",
        tx.kind.label(),
        display_key(key)
    );
}
