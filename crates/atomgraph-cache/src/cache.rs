use atomgraph_core::{ChangeType, FileAnalysis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted entry of the cache index, keyed by file path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Content hash the analysis was computed from
    pub hash: String,
    pub last_analyzed: DateTime<Utc>,
    pub static_version: u64,
    pub llm_version: u64,
    pub change_type: ChangeType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub metadata: FileAnalysis,
    #[serde(default)]
    pub llm_insights: Option<serde_json::Value>,
}

impl CacheRecord {
    pub fn new(hash: String, analysis: FileAnalysis, change_type: ChangeType) -> Self {
        Self {
            hash,
            last_analyzed: Utc::now(),
            static_version: 1,
            llm_version: 0,
            change_type,
            dependencies: analysis.dependency_paths(),
            metadata: analysis,
            llm_insights: None,
        }
    }

    pub fn is_older_than(&self, horizon: DateTime<Utc>) -> bool {
        self.last_analyzed < horizon
    }
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hit_rate_handles_empty_and_mixed() {
        let empty = CacheStats::default();
        assert_relative_eq!(empty.hit_rate(), 0.0);

        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_relative_eq!(stats.hit_rate(), 0.75);
        assert_relative_eq!(stats.miss_rate(), 0.25);
    }
}
