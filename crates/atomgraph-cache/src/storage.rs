use crate::{CacheRecord, IncrementalCache};
use atomgraph_core::{AtomGraphError, CacheConfig, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bumped whenever `CacheRecord` or `FileAnalysis` changes shape.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: BTreeMap<String, CacheRecord>,
}

/// Version header read before the full document so a schema change is
/// detected even when the entries no longer deserialize.
#[derive(Deserialize)]
struct SnapshotHeader {
    version: u32,
}

/// Single-file JSON snapshot of the cache index for one project root.
#[derive(Debug, Clone)]
pub struct SnapshotStorage {
    path: PathBuf,
}

impl SnapshotStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_project(project_root: &Path, config: &CacheConfig) -> Self {
        Self::new(config.snapshot_path(project_root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted index. A missing file yields an empty index; a
    /// corrupt file or one written under another schema version is discarded.
    pub async fn load(&self) -> Result<BTreeMap<String, CacheRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        match Self::decode(&raw) {
            Ok(entries) => {
                info!(
                    "Loaded {} cache entries from {}",
                    entries.len(),
                    self.path.display()
                );
                Ok(entries)
            }
            Err(e) => {
                warn!(
                    "Discarding cache snapshot {}: {}",
                    self.path.display(),
                    e
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn decode(raw: &str) -> Result<BTreeMap<String, CacheRecord>> {
        let header: SnapshotHeader = serde_json::from_str(raw)
            .map_err(|e| AtomGraphError::CacheCorruption(format!("unreadable header: {}", e)))?;
        if header.version != SCHEMA_VERSION {
            return Err(AtomGraphError::CacheCorruption(format!(
                "schema version {} does not match {}",
                header.version, SCHEMA_VERSION
            )));
        }
        let snapshot: CacheSnapshot = serde_json::from_str(raw)
            .map_err(|e| AtomGraphError::CacheCorruption(e.to_string()))?;
        Ok(snapshot.entries)
    }

    /// Writes the whole index to a temporary sibling and renames it into place.
    pub async fn save(&self, entries: BTreeMap<String, CacheRecord>) -> Result<()> {
        let snapshot = CacheSnapshot {
            version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            entries,
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence_error(parent, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| persistence_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| persistence_error(&self.path, e))?;
        Ok(())
    }

    pub async fn load_cache(&self) -> Result<IncrementalCache> {
        Ok(IncrementalCache::from_records(self.load().await?))
    }

    pub async fn save_cache(&self, cache: &IncrementalCache) -> Result<()> {
        self.save(cache.snapshot()).await
    }
}

fn persistence_error(path: &Path, e: std::io::Error) -> AtomGraphError {
    AtomGraphError::Persistence(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomgraph_core::{ChangeType, ExtractionResult, FileAnalysis};
    use tempfile::TempDir;

    fn cache_with(path: &str, content: &str) -> IncrementalCache {
        let cache = IncrementalCache::new();
        let analysis = FileAnalysis::from_extraction(path, content, ExtractionResult::default());
        cache.set(path, content, analysis, ChangeType::Semantic);
        cache
    }

    #[tokio::test]
    async fn survives_a_restart() {
        let dir = TempDir::new().unwrap();
        let storage = SnapshotStorage::for_project(dir.path(), &CacheConfig::default());
        storage.save_cache(&cache_with("src/a.js", "v1")).await.unwrap();
        assert!(dir.path().join(".atomgraph/cache-index.json").exists());

        let restored = storage.load_cache().await.unwrap();
        assert!(restored.get("src/a.js", "v1").is_some());
        assert!(restored.get("src/a.js", "v2").is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let storage = SnapshotStorage::new(dir.path().join("none.json"));
        assert!(storage.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_discards_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache-index.json");
        let storage = SnapshotStorage::new(&path);
        storage.save_cache(&cache_with("a.js", "v1")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        doc["version"] = serde_json::json!(SCHEMA_VERSION + 1);
        std::fs::write(&path, doc.to_string()).unwrap();

        assert!(storage.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache-index.json");
        std::fs::write(&path, "{\"version\": 1, \"entries\": {\"a.js\": 42").unwrap();
        let storage = SnapshotStorage::new(&path);
        assert!(storage.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwritable_target_is_a_persistence_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();
        let storage = SnapshotStorage::new(blocker.join("cache-index.json"));

        let err = storage.save(BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, AtomGraphError::Persistence(_)));
    }
}
