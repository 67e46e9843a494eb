use std::path::Path;

use anyhow::{Context, Result};
use fs_err as fs;
use tracing::info;

/// Patterns used when no ignore file exists.
pub const DEFAULT_PATTERNS: [&str; 3] = [".ipynb_checkpoints/", ".~", "__pycache__/"];

/// Placeholder name some desktop shells give new text files; it is renamed
/// almost immediately, so it is never tracked.
pub const LEGACY_PLACEHOLDER: &str = "Neues Textdokument.txt";

/// Decides which paths never enter the transaction log.
///
/// - a pattern ending in `/` names a directory: it excludes any path that
///   contains it, and the directory itself
/// - any other pattern excludes paths whose last segment starts with it or
///   whose full path ends with it
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    patterns: Vec<String>,
}

impl Default for ExclusionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PATTERNS)
    }
}

impl ExclusionFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| normalize(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Parse ignore-file content: one pattern per line, blank lines and
    /// `#` comments skipped.
    pub fn parse(content: &str) -> Self {
        Self::new(
            content
                .lines()
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Load from an ignore file, falling back to [`DEFAULT_PATTERNS`] when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).context("Failed to read ignore file")?;
        let filter = Self::parse(&content);
        info!("Ignore patterns: {:?}", filter.patterns);
        Ok(filter)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded(&self, path: &Path, is_directory: bool) -> bool {
        let raw = normalize(&path.to_string_lossy());
        if raw.ends_with(LEGACY_PLACEHOLDER) {
            return true;
        }

        let file_name = raw.rsplit('/').next().unwrap_or(raw.as_str());
        self.patterns.iter().any(|pattern| {
            if let Some(dir) = pattern.strip_suffix('/') {
                raw.contains(pattern.as_str()) || (is_directory && raw.ends_with(dir))
            } else {
                file_name.starts_with(pattern.as_str()) || raw.ends_with(pattern.as_str())
            }
        })
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}
