use atomgraph_core::{AtomGraphError, DeepAnalysisRequest, DeepAnalyzer, DeepAnalyzerConfig};
use std::sync::Arc;
use tracing::{debug, warn};

/// Calls the external deep analyzer with a per-attempt timeout and
/// exponential backoff between attempts.
///
/// Failures never propagate: a file whose deep analysis fails keeps its
/// static results.
#[derive(Clone)]
pub struct DeepAnalysisClient {
    analyzer: Arc<dyn DeepAnalyzer>,
    config: DeepAnalyzerConfig,
}

impl DeepAnalysisClient {
    pub fn new(analyzer: Arc<dyn DeepAnalyzer>, config: DeepAnalyzerConfig) -> Self {
        Self { analyzer, config }
    }

    pub fn config(&self) -> &DeepAnalyzerConfig {
        &self.config
    }

    pub async fn analyze(&self, request: DeepAnalysisRequest) -> Option<serde_json::Value> {
        let file = request.file_path.clone();
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff_for(attempt)).await;
            }

            let result =
                tokio::time::timeout(self.config.timeout(), self.analyzer.analyze(request.clone()))
                    .await;

            match result {
                Ok(Ok(insights)) => {
                    debug!("Deep analysis of {} succeeded on attempt {}", file, attempt + 1);
                    return Some(insights);
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(AtomGraphError::Timeout(format!(
                        "deep analysis of {} exceeded {}s",
                        file, self.config.timeout_secs
                    )))
                }
            }

            if attempt < self.config.max_retries {
                warn!(
                    "Deep analysis of {} failed (attempt {}/{}), retrying...",
                    file,
                    attempt + 1,
                    self.config.max_retries + 1
                );
            }
        }

        if let Some(e) = last_error {
            warn!("Deep analysis of {} gave up: {}", file, e);
        }
        None
    }
}
