//! Working memory
//!
//! Append-only log of successful interactions, searchable by keyword overlap
//! and used to enrich planning prompts. Appends are serialized so the durable
//! copy is always a complete snapshot.

use crate::entry::MemoryEntry;
use crate::error::MemoryError;
use crate::store::{InMemoryStore, MemoryStore};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default number of entries used for context
pub const DEFAULT_CONTEXT_LIMIT: usize = 3;

/// Characters of each past result quoted in context
pub const KEY_FINDING_CHARS: usize = 150;

/// Durable, searchable interaction log
#[derive(Debug)]
pub struct WorkingMemory {
    store: Arc<dyn MemoryStore>,
    entries: Mutex<Vec<MemoryEntry>>,
    context_limit: usize,
}

impl WorkingMemory {
    /// Load existing entries from `store`
    ///
    /// # Errors
    /// Returns the store's load error.
    pub async fn open(store: Arc<dyn MemoryStore>) -> Result<Self, MemoryError> {
        let entries = store.load().await?;
        tracing::info!(entries = entries.len(), "working memory loaded");
        Ok(Self {
            store,
            entries: Mutex::new(entries),
            context_limit: DEFAULT_CONTEXT_LIMIT,
        })
    }

    /// Memory backed by a volatile store
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            entries: Mutex::new(Vec::new()),
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// With a different number of context entries
    #[must_use]
    pub fn with_context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    /// Append and persist one entry
    ///
    /// On a failed save the entry is dropped from memory too, so the log never
    /// holds entries the store does not.
    ///
    /// # Errors
    /// Returns the store's save error.
    pub async fn append(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        let mut entries = self.entries.lock().await;
        entries.push(entry);
        if let Err(e) = self.store.save(&entries).await {
            entries.pop();
            tracing::error!(error = %e, "failed to persist memory entry");
            return Err(e);
        }
        tracing::info!(interaction_count = entries.len(), "interaction saved to memory");
        Ok(())
    }

    /// Entries relevant to `query`, best first
    ///
    /// Relevance is the number of whitespace-separated query terms found in
    /// instruction or plan; ties go to the newer entry. Irrelevant entries
    /// are excluded.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<MemoryEntry> {
        let terms: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }
        let entries = self.entries.lock().await;
        let mut scored: Vec<(usize, &MemoryEntry)> = entries
            .iter()
            .map(|e| (e.relevance(&terms), e))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.timestamp.cmp(&a.1.timestamp)));
        scored.into_iter().take(limit).map(|(_, e)| e.clone()).collect()
    }

    /// Past interactions formatted for a planning prompt, empty if none match
    pub async fn context_for(&self, query: &str) -> String {
        let relevant = self.search(query, self.context_limit).await;
        if relevant.is_empty() {
            return String::new();
        }
        let mut context = String::from("\n--- Past Interaction Context ---\n");
        for entry in &relevant {
            context.push_str(&format!(
                "Previous Request: {}\nKey Finding: {}...\n\n",
                entry.instruction,
                entry.key_finding(KEY_FINDING_CHARS)
            ));
        }
        context
    }

    /// Number of stored entries
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no entry is stored
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Snapshot of every entry in append order
    pub async fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    async fn memory_with(entries: Vec<MemoryEntry>) -> WorkingMemory {
        WorkingMemory::open(Arc::new(InMemoryStore::with_entries(entries)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn search_ranks_by_overlap_then_recency() {
        let now = Utc::now();
        let memory = memory_with(vec![
            MemoryEntry::new("mean of sales", "", "", "a").with_timestamp(now - Duration::hours(2)),
            MemoryEntry::new("mean of sales by region", "", "", "b").with_timestamp(now - Duration::hours(3)),
            MemoryEntry::new("sales trend", "", "", "c").with_timestamp(now - Duration::hours(1)),
            MemoryEntry::new("mean sales", "", "", "d").with_timestamp(now),
            MemoryEntry::new("unrelated", "", "", "e").with_timestamp(now),
        ])
        .await;

        let results: Vec<String> = memory
            .search("mean sales region", 10)
            .await
            .into_iter()
            .map(|e| e.result)
            .collect();
        assert_eq!(results, ["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn search_respects_limit_and_empty_query() {
        let memory = memory_with(vec![
            MemoryEntry::new("a b", "", "", "1"),
            MemoryEntry::new("a", "", "", "2"),
        ])
        .await;
        assert_eq!(memory.search("a", 1).await.len(), 1);
        assert!(memory.search("   ", 3).await.is_empty());
    }

    #[tokio::test]
    async fn context_quotes_truncated_findings() {
        let memory = memory_with(vec![MemoryEntry::new("average sales", "", "", "x".repeat(300))]).await;
        let context = memory.context_for("sales").await;
        assert!(context.starts_with("\n--- Past Interaction Context ---\n"));
        assert!(context.contains("Previous Request: average sales\n"));
        assert!(context.contains(&format!("Key Finding: {}...\n", "x".repeat(150))));
        assert!(memory.context_for("weather").await.is_empty());
    }

    #[tokio::test]
    async fn append_persists_through_store() {
        let store = Arc::new(InMemoryStore::new());
        let memory = WorkingMemory::open(store.clone()).await.unwrap();
        memory.append(MemoryEntry::new("i", "p", "c", "r")).await.unwrap();
        memory.append(MemoryEntry::new("i2", "p", "c", "r")).await.unwrap();

        assert_eq!(memory.len().await, 2);
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load().await.unwrap().len(), 2);
    }
}
