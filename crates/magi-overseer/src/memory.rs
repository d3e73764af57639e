//! File-backed memory store for the overseer's memory tools.
//!
//! Short-term memories are surfaced in every system status; long-term
//! memories are retrieved on demand with `find_memory`.  Lookup is
//! substring scoring — the vector pipeline behind semantic recall is an
//! external collaborator.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTerm {
    Short,
    Long,
}

impl MemoryTerm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "short" => Some(Self::Short),
            "long" => Some(Self::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: u64,
    pub term: MemoryTerm,
    pub memory: String,
    pub created_at: DateTime<Utc>,
}

pub struct MemoryStore {
    path: PathBuf,
    inner: Mutex<Vec<MemoryEntry>>,
}

impl MemoryStore {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("memories.json");
        let entries = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), "unreadable memory store, starting fresh: {e}");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(entries),
        })
    }

    pub fn save(&self, term: MemoryTerm, memory: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        inner.push(MemoryEntry {
            id,
            term,
            memory: memory.into(),
            created_at: Utc::now(),
        });
        self.persist(&inner);
        id
    }

    pub fn delete(&self, term: MemoryTerm, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|e| !(e.id == id && e.term == term));
        let removed = inner.len() != before;
        if removed {
            self.persist(&inner);
        }
        removed
    }

    /// Rank all memories by how many query terms they contain
    /// (case-insensitive); unmatched entries are filtered out.
    pub fn find(&self, queries: &[String]) -> Vec<MemoryEntry> {
        let needles: Vec<String> = queries.iter().map(|q| q.to_lowercase()).collect();
        let inner = self.inner.lock().unwrap();
        let mut scored: Vec<(usize, MemoryEntry)> = inner
            .iter()
            .filter_map(|e| {
                let haystack = e.memory.to_lowercase();
                let score = needles.iter().filter(|n| haystack.contains(n.as_str())).count();
                (score > 0).then(|| (score, e.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
        scored.into_iter().map(|(_, e)| e).collect()
    }

    /// Short-term memories, oldest first, for system-status display.
    pub fn short_term(&self) -> Vec<MemoryEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .filter(|e| e.term == MemoryTerm::Short)
            .cloned()
            .collect()
    }

    fn persist(&self, entries: &[MemoryEntry]) {
        match serde_json::to_string_pretty(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(path = %self.path.display(), "failed to persist memories: {e}");
                }
            }
            Err(e) => warn!("failed to serialize memories: {e}"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_assigns_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        let a = store.save(MemoryTerm::Short, "first");
        let b = store.save(MemoryTerm::Long, "second");
        assert!(b > a);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store.save(MemoryTerm::Long, "persistent fact");
        }
        let store = MemoryStore::open(dir.path()).unwrap();
        let found = store.find(&["persistent".into()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].memory, "persistent fact");
    }

    #[test]
    fn find_ranks_by_matched_terms() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        store.save(MemoryTerm::Long, "rust compiler internals");
        store.save(MemoryTerm::Long, "rust async compiler design notes");
        store.save(MemoryTerm::Long, "gardening tips");

        let found = store.find(&["rust".into(), "compiler".into(), "async".into()]);
        assert_eq!(found.len(), 2);
        assert!(found[0].memory.contains("async"), "higher score first");
    }

    #[test]
    fn delete_requires_matching_term() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        let id = store.save(MemoryTerm::Short, "ephemeral");
        assert!(!store.delete(MemoryTerm::Long, id));
        assert!(store.delete(MemoryTerm::Short, id));
        assert!(store.find(&["ephemeral".into()]).is_empty());
    }

    #[test]
    fn short_term_filters_by_term() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        store.save(MemoryTerm::Short, "note A");
        store.save(MemoryTerm::Long, "deep fact");
        store.save(MemoryTerm::Short, "note B");
        let short: Vec<String> = store.short_term().into_iter().map(|e| e.memory).collect();
        assert_eq!(short, vec!["note A", "note B"]);
    }

    #[test]
    fn term_parse_accepts_known_values() {
        assert_eq!(MemoryTerm::parse("short"), Some(MemoryTerm::Short));
        assert_eq!(MemoryTerm::parse("long"), Some(MemoryTerm::Long));
        assert_eq!(MemoryTerm::parse("medium"), None);
    }
}
