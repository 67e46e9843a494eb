//! Namespace table: translates between local paths and sync keys.
//!
//! A sync key is `namespace:relative/path`. Peers agree on namespaces, each
//! peer maps them to its own directories.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Split a sync key into `(namespace, relative_path)` at the first `:`.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

pub fn make_key(namespace: &str, relative: &str) -> String {
    format!("{namespace}:{relative}")
}

#[derive(Debug, Clone, Default)]
pub struct Mapping {
    namespaces: BTreeMap<String, PathBuf>,
}

impl Mapping {
    pub fn new<I, N, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            namespaces: entries
                .into_iter()
                .map(|(ns, dir)| (ns.into(), dir.into()))
                .collect(),
        }
    }

    pub fn contains_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Whether `key` belongs to a namespace configured on this peer.
    pub fn is_local_key(&self, key: &str) -> bool {
        split_key(key).is_some_and(|(ns, _)| self.contains_namespace(ns))
    }

    pub fn namespaces(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.namespaces
            .iter()
            .map(|(ns, dir)| (ns.as_str(), dir.as_path()))
    }

    pub fn directories(&self) -> impl Iterator<Item = &Path> {
        self.namespaces.values().map(PathBuf::as_path)
    }

    /// Derive the sync key of a local path. Nested mappings resolve to the
    /// deepest directory.
    pub fn sync_key(&self, path: &Path) -> Option<String> {
        let (namespace, relative) = self
            .namespaces
            .iter()
            .filter_map(|(ns, dir)| path.strip_prefix(dir).ok().map(|rel| (ns, dir, rel)))
            .max_by_key(|(_, dir, _)| dir.components().count())
            .map(|(ns, _, rel)| (ns, rel))?;

        let parts = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(make_key(namespace, &parts.join("/")))
    }

    /// Resolve a sync key to a path under its mapped directory. Keys whose
    /// relative part could escape that directory never resolve.
    pub fn resolve(&self, key: &str) -> Option<PathBuf> {
        let (namespace, relative) = split_key(key)?;
        let dir = self.namespaces.get(namespace)?;
        let relative = relative.replace('\\', "/");

        let mut path = dir.clone();
        let mut depth = 0;
        for part in relative.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return None;
            }
            if Path::new(part)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return None;
            }
            path.push(part);
            depth += 1;
        }
        (depth > 0).then_some(path)
    }
}
