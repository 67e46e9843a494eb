//! Startup reconciliation: catch up with changes made while the process was
//! not running.

use crate::classifier::{ChangeClassifier, FsEvent};
use crate::mapping::split_key;
use crate::types::{display_key, ContentHash};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub tracked: usize,
    pub modified: usize,
    pub deleted: usize,
    pub created: usize,
}

impl ScanReport {
    pub fn changes(&self) -> usize {
        self.modified + self.deleted + self.created
    }
}

/// Walks the log, then the mapped directories, and feeds every drift
/// through the classifier. Must finish before the watcher and sessions
/// start.
pub struct ReconciliationScanner<'a> {
    classifier: &'a ChangeClassifier,
}

impl<'a> ReconciliationScanner<'a> {
    pub fn new(classifier: &'a ChangeClassifier) -> Self {
        Self { classifier }
    }

    pub fn scan(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let seen = self.scan_tracked(&mut report)?;
        self.scan_directories(&seen, &mut report)?;
        info!(
            "Scan completed: {} tracked, {} modified, {} deleted, {} created",
            report.tracked, report.modified, report.deleted, report.created
        );
        Ok(report)
    }

    /// Step 1: compare every resolvable log entry against disk. Returns the
    /// paths that still exist; step 2 skips them.
    fn scan_tracked(&self, report: &mut ScanReport) -> Result<HashSet<PathBuf>> {
        let mapping = self.classifier.mapping();
        let entries = self.classifier.log().snapshot();
        info!("Scanning {} tracked files", entries.len());

        let mut seen = HashSet::new();
        for (key, tx) in &entries {
            let Some((namespace, _)) = split_key(key) else {
                warn!(key, "Skipping malformed key");
                continue;
            };
            if !mapping.contains_namespace(namespace) {
                continue;
            }
            let Some(disk_path) = mapping.resolve(key) else {
                warn!(key, "Skipping unresolvable key");
                continue;
            };
            debug!("Scanning: {}", display_key(key));
            report.tracked += 1;

            match ContentHash::of_file(&disk_path) {
                Ok(hash) => {
                    seen.insert(disk_path.clone());
                    if tx.content_hash.as_ref() != Some(&hash) {
                        report.modified += self.classifier.handle(FsEvent::Modified {
                            path: disk_path,
                            is_directory: false,
                        })?;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound || disk_path.is_dir() => {
                    if !tx.is_deleted() {
                        report.deleted += self.classifier.handle(FsEvent::Deleted {
                            path: disk_path,
                            is_directory: false,
                        })?;
                    }
                }
                Err(err) => {
                    warn!(key, "Failed to hash tracked file: {err}");
                    seen.insert(disk_path);
                }
            }
        }
        Ok(seen)
    }

    /// Step 2: any file on disk not seen in step 1 is new.
    fn scan_directories(&self, seen: &HashSet<PathBuf>, report: &mut ScanReport) -> Result<()> {
        let dirs: Vec<PathBuf> = self
            .classifier
            .mapping()
            .directories()
            .map(PathBuf::from)
            .collect();

        for dir in dirs {
            info!("Scanning: {}", dir.display());
            let mut created = 0;
            for entry in WalkDir::new(&dir).into_iter() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("Skipping unreadable entry under {}: {err}", dir.display());
                        continue;
                    }
                };
                if !entry.file_type().is_file() || seen.contains(entry.path()) {
                    continue;
                }
                created += self.classifier.handle(FsEvent::Created {
                    path: entry.into_path(),
                    is_directory: false,
                })?;
            }
            if created == 0 {
                info!("(no changes)");
            }
            report.created += created;
        }
        Ok(())
    }
}
