use std::{cmp::Ordering, collections::BTreeMap, fmt, io::Read, path::Path};

use anyhow::{bail, Result};
use chrono::Utc;
use fs_err::File;
use serde::{Deserialize, Serialize};

/// The whole transaction log as it is persisted and exchanged with peers:
/// sync key -> most recent transaction for that key.
pub type LogDocument = BTreeMap<String, Transaction>;

/// Wall-clock seconds since the Unix epoch.
pub type Timestamp = f64;

pub fn now_timestamp() -> Timestamp {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Created,
    Modified,
    Deleted,
}

impl TxKind {
    pub fn is_deleted(self) -> bool {
        self == TxKind::Deleted
    }

    pub fn label(self) -> &'static str {
        match self {
            TxKind::Created => "Created",
            TxKind::Modified => "Modified",
            TxKind::Deleted => "Deleted",
        }
    }
}

/// MD5 digest of a file's content, as 32 lowercase hex digits.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(data)))
    }

    /// Hash a file in 4 KiB chunks without loading it whole.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        let mut ctx = md5::Context::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
        }
        Ok(Self(format!("{:x}", ctx.compute())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The last known change of one synced file.
///
/// `content_hash` is present iff `kind` is not [`TxKind::Deleted`]; the
/// constructors and deserialization both enforce it.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawTransaction")]
pub struct Transaction {
    #[serde(rename = "type")]
    pub kind: TxKind,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
}

#[derive(Deserialize)]
struct RawTransaction {
    #[serde(rename = "type")]
    kind: TxKind,
    timestamp: Timestamp,
    #[serde(default, alias = "md5")]
    content_hash: Option<ContentHash>,
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = anyhow::Error;

    fn try_from(raw: RawTransaction) -> Result<Self> {
        match (raw.kind, raw.content_hash) {
            (TxKind::Deleted, None) => Ok(Self::deleted_at(raw.timestamp)),
            (TxKind::Deleted, Some(_)) => bail!("deleted transaction must not carry a hash"),
            (kind, Some(hash)) => Ok(Self {
                kind,
                timestamp: raw.timestamp,
                content_hash: Some(hash),
            }),
            (kind, None) => bail!("{} transaction is missing its content hash", kind.label()),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp)
            .field("hash", &self.content_hash.as_ref().map(ContentHash::as_str))
            .finish()
    }
}

impl Transaction {
    /// A created/modified transaction stamped with the current time.
    /// Passing [`TxKind::Deleted`] yields a deletion and drops the hash.
    pub fn new(kind: TxKind, hash: ContentHash) -> Self {
        Self::at(kind, hash, now_timestamp())
    }

    pub fn deleted() -> Self {
        Self::deleted_at(now_timestamp())
    }

    pub fn deleted_at(timestamp: Timestamp) -> Self {
        Self {
            kind: TxKind::Deleted,
            timestamp,
            content_hash: None,
        }
    }

    /// Build a transaction with an explicit timestamp.
    pub fn at(kind: TxKind, hash: ContentHash, timestamp: Timestamp) -> Self {
        if kind.is_deleted() {
            return Self::deleted_at(timestamp);
        }
        Self {
            kind,
            timestamp,
            content_hash: Some(hash),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.kind.is_deleted()
    }

    /// Last-write-wins: `self` replaces `other` only when strictly newer.
    /// Equal timestamps keep the local entry.
    pub fn supersedes(&self, other: &Transaction) -> bool {
        compare_transactions(self, other) == Ordering::Greater
    }
}

/// Order two transactions by timestamp only. Non-comparable timestamps
/// (NaN) compare equal, so they never win.
pub fn compare_transactions(a: &Transaction, b: &Transaction) -> Ordering {
    a.timestamp
        .partial_cmp(&b.timestamp)
        .unwrap_or(Ordering::Equal)
}

/// Shorten a key for single-line progress output.
pub fn display_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 128 {
        return key.to_string();
    }
    let head: String = chars[..63].iter().collect();
    let tail: String = chars[chars.len() - 62..].iter().collect();
    format!("{head}...{tail}")
}

pub fn format_len(size: u64) -> String {
    let size = size as f64;
    if size > 1e12 {
        format!("{:.1} TB", size / 1e12)
    } else if size > 1e9 {
        format!("{:.1} GB", size / 1e9)
    } else if size > 1e6 {
        format!("{:.1} MB", size / 1e6)
    } else if size > 1e3 {
        format!("{:.1} KB", size / 1e3)
    } else {
        format!("{:.1} B", size)
    }
}
