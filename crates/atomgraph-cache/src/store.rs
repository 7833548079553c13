use crate::{CacheRecord, CacheStats};
use atomgraph_core::{content_hash, ChangeType, FileAnalysis, SourceProvider};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Content-hash keyed store of the last analysis per file.
///
/// A lookup only hits when the stored hash equals the hash of the content the
/// caller holds right now; anything else is a miss and the caller re-extracts.
#[derive(Default)]
pub struct IncrementalCache {
    entries: DashMap<String, CacheRecord>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl IncrementalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cache from a previously persisted index.
    pub fn from_records(records: BTreeMap<String, CacheRecord>) -> Self {
        let cache = Self::new();
        for (path, record) in records {
            cache.entries.insert(path, record);
        }
        cache
    }

    pub fn get(&self, file_path: &str, content: &str) -> Option<FileAnalysis> {
        self.get_by_hash(file_path, &content_hash(content))
    }

    pub fn get_by_hash(&self, file_path: &str, hash: &str) -> Option<FileAnalysis> {
        match self.entries.get(file_path) {
            Some(record) if record.hash == hash => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(record.metadata.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores the analysis for `content`. Re-storing the same content keeps the
    /// record's versions; new content bumps `static_version` and drops insights.
    pub fn set(
        &self,
        file_path: &str,
        content: &str,
        analysis: FileAnalysis,
        change_type: ChangeType,
    ) {
        let hash = content_hash(content);
        let mut record = CacheRecord::new(hash, analysis, change_type);
        if let Some(previous) = self.entries.get(file_path) {
            if previous.hash == record.hash {
                record.static_version = previous.static_version;
                record.llm_version = previous.llm_version;
                record.llm_insights = previous.llm_insights.clone();
            } else {
                record.static_version = previous.static_version + 1;
                record.llm_version = previous.llm_version;
            }
        }
        debug!(
            "Cached {} (static v{})",
            file_path, record.static_version
        );
        self.entries.insert(file_path.to_string(), record);
    }

    /// Attaches deep-analysis output to the current record, if any.
    pub fn set_llm_insights(&self, file_path: &str, insights: serde_json::Value) -> bool {
        match self.entries.get_mut(file_path) {
            Some(mut record) => {
                record.llm_version += 1;
                record.llm_insights = Some(insights);
                true
            }
            None => false,
        }
    }

    /// Replaces the stored metadata without touching hash or versions. Used
    /// after re-fusion changes a file's connections or purposes but not its
    /// content.
    pub fn refresh_metadata(&self, file_path: &str, analysis: FileAnalysis) -> bool {
        match self.entries.get_mut(file_path) {
            Some(mut record) if record.hash == analysis.content_hash => {
                record.dependencies = analysis.dependency_paths();
                record.metadata = analysis;
                true
            }
            _ => false,
        }
    }

    pub fn record(&self, file_path: &str) -> Option<CacheRecord> {
        self.entries.get(file_path).map(|r| r.value().clone())
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.entries.contains_key(file_path)
    }

    pub fn remove(&self, file_path: &str) -> Option<CacheRecord> {
        self.entries.remove(file_path).map(|(_, record)| record)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries whose file is no longer present. Returns the removed paths.
    pub async fn prune_missing(&self, source: &dyn SourceProvider) -> Vec<String> {
        let mut removed = Vec::new();
        for path in self.paths() {
            if !source.exists(&path).await {
                self.entries.remove(&path);
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            self.evictions
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
            info!("Pruned {} cache entries for deleted files", removed.len());
        }
        removed
    }

    /// Evicts entries last analysed before `now - max_age`. A negative age
    /// evicts nothing, as does a horizon earlier than any representable time.
    pub fn evict_older_than(&self, max_age: chrono::Duration) -> usize {
        if max_age < chrono::Duration::zero() {
            warn!("Ignoring negative cache age limit of {} days", max_age.num_days());
            return 0;
        }
        match Utc::now().checked_sub_signed(max_age) {
            Some(horizon) => self.evict_before(horizon),
            None => {
                debug!(
                    "Cache age limit of {} days reaches past the earliest date; nothing to evict",
                    max_age.num_days()
                );
                0
            }
        }
    }

    pub fn evict_before(&self, horizon: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, record| !record.is_older_than(horizon));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            info!("Evicted {} stale cache entries", evicted);
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Point-in-time copy of every record, ordered by path.
    pub fn snapshot(&self) -> BTreeMap<String, CacheRecord> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomgraph_core::{Atom, AtomKind, ExtractionResult, FsSourceProvider};
    use tempfile::TempDir;

    fn analysis(path: &str, content: &str) -> FileAnalysis {
        let extraction = ExtractionResult {
            atoms: vec![Atom::new(path, "f", AtomKind::Function)],
            ..Default::default()
        };
        FileAnalysis::from_extraction(path, content, extraction)
    }

    #[test]
    fn unchanged_content_hits_and_changed_content_misses() {
        let cache = IncrementalCache::new();
        let stored = analysis("a.js", "v1");
        cache.set("a.js", "v1", stored.clone(), ChangeType::Semantic);

        let hit = cache.get("a.js", "v1").unwrap();
        assert_eq!(hit.content_hash, stored.content_hash);
        assert_eq!(hit.analyzed_at, stored.analyzed_at);
        assert!(cache.get("a.js", "v2").is_none());
        assert!(cache.get("b.js", "v1").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn restoring_same_content_keeps_versions() {
        let cache = IncrementalCache::new();
        cache.set("a.js", "v1", analysis("a.js", "v1"), ChangeType::Semantic);
        assert!(cache.set_llm_insights("a.js", serde_json::json!({"summary": "ok"})));
        cache.set("a.js", "v1", analysis("a.js", "v1"), ChangeType::None);

        let record = cache.record("a.js").unwrap();
        assert_eq!(record.static_version, 1);
        assert_eq!(record.llm_version, 1);
        assert!(record.llm_insights.is_some());

        cache.set("a.js", "v2", analysis("a.js", "v2"), ChangeType::Static);
        let record = cache.record("a.js").unwrap();
        assert_eq!(record.static_version, 2);
        assert!(record.llm_insights.is_none());
    }

    #[test]
    fn refresh_only_applies_to_matching_content() {
        let cache = IncrementalCache::new();
        cache.set("a.js", "v1", analysis("a.js", "v1"), ChangeType::Semantic);

        let mut refused = analysis("a.js", "v1");
        refused.file_archetype = Some(atomgraph_core::FileArchetype::OrphanModule);
        assert!(cache.refresh_metadata("a.js", refused));
        let record = cache.record("a.js").unwrap();
        assert_eq!(record.static_version, 1);
        assert!(record.metadata.file_archetype.is_some());

        assert!(!cache.refresh_metadata("a.js", analysis("a.js", "v2")));
        assert!(!cache.refresh_metadata("b.js", analysis("b.js", "v1")));
    }

    #[test]
    fn evicts_entries_past_the_horizon() {
        let cache = IncrementalCache::new();
        cache.set("old.js", "x", analysis("old.js", "x"), ChangeType::Semantic);
        cache.set("new.js", "y", analysis("new.js", "y"), ChangeType::Semantic);
        if let Some(mut record) = cache.entries.get_mut("old.js") {
            record.last_analyzed = Utc::now() - chrono::Duration::days(45);
        }

        assert_eq!(cache.evict_older_than(chrono::Duration::days(30)), 1);
        assert!(!cache.contains("old.js"));
        assert!(cache.contains("new.js"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn out_of_range_or_negative_age_evicts_nothing() {
        let cache = IncrementalCache::new();
        cache.set("a.js", "x", analysis("a.js", "x"), ChangeType::Semantic);

        assert_eq!(cache.evict_older_than(chrono::Duration::days(100_000_000)), 0);
        assert_eq!(cache.evict_older_than(chrono::Duration::days(-1)), 0);
        assert!(cache.contains("a.js"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn prunes_entries_for_missing_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kept.js"), "x").unwrap();
        let cache = IncrementalCache::new();
        cache.set("kept.js", "x", analysis("kept.js", "x"), ChangeType::Semantic);
        cache.set("gone.js", "y", analysis("gone.js", "y"), ChangeType::Semantic);

        let removed = cache
            .prune_missing(&FsSourceProvider::new(dir.path()))
            .await;
        assert_eq!(removed, vec!["gone.js".to_string()]);
        assert_eq!(cache.paths(), vec!["kept.js".to_string()]);
    }
}
