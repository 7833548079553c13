use crate::{Atom, Connection, ExtractionResult, FileArchetype, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Turns source text into atoms and candidate connections.
///
/// Parse failures come back as [`ExtractionResult::failed`], never as a panic.
pub trait Extractor: Send + Sync {
    fn extract(&self, file_path: &str, content: &str) -> ExtractionResult;
}

/// Static metadata handed to the deep analyzer alongside the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeepAnalysisRequest {
    pub file_path: String,
    pub content: String,
    pub atoms: Vec<Atom>,
    pub connections: Vec<Connection>,
    pub file_archetype: Option<FileArchetype>,
}

#[async_trait]
pub trait DeepAnalyzer: Send + Sync {
    async fn analyze(&self, request: DeepAnalysisRequest) -> Result<serde_json::Value>;
}

/// Read access to file contents, relative to a project root.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn read(&self, file_path: &str) -> Result<String>;
    async fn exists(&self, file_path: &str) -> bool;
}

pub struct FsSourceProvider {
    root: PathBuf,
}

impl FsSourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceProvider for FsSourceProvider {
    async fn read(&self, file_path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.root.join(file_path)).await?)
    }

    async fn exists(&self, file_path: &str) -> bool {
        tokio::fs::metadata(self.root.join(file_path)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fs_source_reads_relative_to_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.js"), "export function a() {}").unwrap();

        let source = FsSourceProvider::new(dir.path());
        assert!(source.exists("src/a.js").await);
        assert!(!source.exists("src/b.js").await);
        assert_eq!(source.read("src/a.js").await.unwrap(), "export function a() {}");
        assert!(source.read("src/b.js").await.is_err());
    }
}
