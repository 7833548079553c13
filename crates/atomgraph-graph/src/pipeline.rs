use crate::deep::DeepAnalysisClient;
use crate::dependency::{DependencyGraph, DependencyView};
use crate::fusion::{FusionEngine, FusionOutcome};
use crate::gate::{DecisionGate, GateInput, GateOutcome};
use crate::purpose::PurposeClassifier;
use crate::query::GraphQuery;
use crate::snapshot::KnowledgeSnapshot;
use atomgraph_cache::{IncrementalCache, SnapshotStorage};
use atomgraph_core::{
    classify_change, content_hash, AtomGraphConfig, AtomGraphError, ChangeType, DeepAnalysisRequest,
    DeepAnalyzer, ExtractionResult, Extractor, FileAnalysis, FileChangeEvent, FileChangeKind,
    FsSourceProvider, Result, SourceProvider,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Everything the pipeline needs from the outside, built once and passed in.
#[derive(Clone)]
pub struct AnalysisContext {
    pub config: AtomGraphConfig,
    pub project_root: PathBuf,
    pub extractor: Arc<dyn Extractor>,
    pub source: Arc<dyn SourceProvider>,
    pub deep_analyzer: Option<Arc<dyn DeepAnalyzer>>,
}

impl AnalysisContext {
    /// Context reading sources from disk under `project_root`.
    pub fn new(
        config: AtomGraphConfig,
        project_root: impl Into<PathBuf>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let project_root = project_root.into();
        Self {
            config,
            source: Arc::new(FsSourceProvider::new(project_root.clone())),
            project_root,
            extractor,
            deep_analyzer: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceProvider>) -> Self {
        self.source = source;
        self
    }

    pub fn with_deep_analyzer(mut self, analyzer: Arc<dyn DeepAnalyzer>) -> Self {
        self.deep_analyzer = Some(analyzer);
        self
    }
}

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Files re-extracted in this batch
    pub analyzed: Vec<String>,
    /// Files whose content matched the cache and were not re-extracted
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    /// Dependents marked stale by the batch's changes
    pub invalidated: Vec<String>,
    /// Files that failed to read or parse
    pub failed: Vec<String>,
    pub deep_analyzed: Vec<String>,
    pub cycles_detected: usize,
    pub conflicts: usize,
}

enum Fetched {
    Missing,
    Unchanged(FileAnalysis),
    Extracted { content: String, analysis: FileAnalysis },
    Unreadable(AtomGraphError),
}

/// Mutable state owned by whoever holds the writer lock.
#[derive(Default)]
struct WorkingSet {
    analyses: BTreeMap<String, FileAnalysis>,
    gate_outcomes: BTreeMap<String, GateOutcome>,
    generation: u64,
}

/// Single mutation authority over the knowledge graph.
///
/// Batches are serialised by an async mutex; extraction inside a batch runs
/// on up to `max_concurrent_analyses` workers. Readers go through
/// [`GraphQuery`] and only ever see a published [`KnowledgeSnapshot`].
pub struct KnowledgePipeline {
    context: AnalysisContext,
    fusion: FusionEngine,
    purposes: PurposeClassifier,
    gate: DecisionGate,
    deep: Option<DeepAnalysisClient>,
    graph: Arc<DependencyGraph>,
    cache: Arc<IncrementalCache>,
    storage: SnapshotStorage,
    snapshot: Arc<RwLock<Arc<KnowledgeSnapshot>>>,
    writer: Mutex<WorkingSet>,
    workers: Arc<Semaphore>,
}

impl KnowledgePipeline {
    /// Validates the configuration, restores the persisted cache, drops stale
    /// and vanished entries and rebuilds the dependency graph from what is left.
    pub async fn open(context: AnalysisContext) -> Result<Self> {
        let config = &context.config;
        config
            .validate()
            .map_err(|e| AtomGraphError::Config(e.to_string()))?;
        let storage = SnapshotStorage::for_project(&context.project_root, &config.cache);
        let cache = storage.load_cache().await?;
        match chrono::Duration::try_days(config.cache.max_age_days) {
            Some(max_age) => {
                cache.evict_older_than(max_age);
            }
            None => warn!(
                "cache.max_age_days={} is out of range; skipping age eviction",
                config.cache.max_age_days
            ),
        }
        cache.prune_missing(context.source.as_ref()).await;

        let graph = DependencyGraph::new();
        let mut working = WorkingSet::default();
        for (path, record) in cache.snapshot() {
            graph.record_analysis(&path, &record.hash, record.change_type);
            graph.update_dependencies(&path, &record.dependencies);
            if let Some(insights) = &record.llm_insights {
                graph.mark_llm_analyzed(&path, &content_hash(&insights.to_string()));
            }
            working.analyses.insert(path, record.metadata);
        }
        if !working.analyses.is_empty() {
            info!("Restored {} files from the incremental cache", working.analyses.len());
        }

        let deep = match (&context.deep_analyzer, config.deep_analyzer.enabled) {
            (Some(analyzer), true) => Some(DeepAnalysisClient::new(
                analyzer.clone(),
                config.deep_analyzer.clone(),
            )),
            (Some(_), false) => {
                debug!("Deep analyzer supplied but disabled in configuration");
                None
            }
            _ => None,
        };

        let pipeline = Self {
            fusion: FusionEngine::new(config.fusion.clone()),
            purposes: PurposeClassifier::standard(),
            gate: DecisionGate::standard(),
            deep,
            graph: Arc::new(graph),
            cache: Arc::new(cache),
            storage,
            snapshot: Arc::new(RwLock::new(Arc::new(KnowledgeSnapshot::default()))),
            writer: Mutex::new(WorkingSet::default()),
            workers: Arc::new(Semaphore::new(config.workers.max_concurrent_analyses.max(1))),
            context,
        };

        if !working.analyses.is_empty() {
            let outcome = pipeline.derive(&mut working.analyses);
            pipeline.publish(&mut working, outcome, false);
        }
        *pipeline.writer.lock().await = working;
        Ok(pipeline)
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.context
    }

    /// Read-only view of the dependency graph. Mutations go through batches.
    pub fn graph(&self) -> DependencyView {
        DependencyView::new(self.graph.clone())
    }

    pub fn cache(&self) -> &Arc<IncrementalCache> {
        &self.cache
    }

    pub fn snapshot(&self) -> Arc<KnowledgeSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn query(&self) -> GraphQuery {
        GraphQuery::new(
            self.snapshot.clone(),
            self.cache.clone(),
            self.context.source.clone(),
            self.context.config.query.clone(),
        )
    }

    /// Analyses `paths` as if each had been modified.
    pub async fn index_paths<I, S>(&self, paths: I) -> Result<BatchReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let events = paths.into_iter().map(FileChangeEvent::modified).collect();
        self.process_batch(events).await
    }

    /// Analyses one in-memory file without reading it from the source.
    pub async fn index_content(&self, path: &str, content: &str) -> Result<BatchReport> {
        let mut working = self.writer.lock().await;
        let fetched = match self.cache.get(path, content) {
            Some(analysis) => Fetched::Unchanged(analysis),
            None => Fetched::Extracted {
                content: content.to_string(),
                analysis: extract(self.context.extractor.clone(), path.to_string(), content.to_string()).await,
            },
        };
        self.apply(&mut working, Vec::new(), vec![(path.to_string(), fetched)])
            .await
    }

    /// Applies one batch of change events.
    ///
    /// Deletions run first. A path that is both deleted and modified in the
    /// same batch keeps only its latest event, so a deleted file is never
    /// re-extracted.
    pub async fn process_batch(&self, events: Vec<FileChangeEvent>) -> Result<BatchReport> {
        let mut working = self.writer.lock().await;

        let mut latest: BTreeMap<String, FileChangeKind> = BTreeMap::new();
        for event in events {
            latest.insert(event.path, event.change_type);
        }
        let (deleted, upserts): (Vec<_>, Vec<_>) = latest
            .into_iter()
            .partition(|(_, kind)| *kind == FileChangeKind::Deleted);
        let deleted: Vec<String> = deleted.into_iter().map(|(path, _)| path).collect();
        let upserts: Vec<String> = upserts.into_iter().map(|(path, _)| path).collect();

        let fetched = self.fetch_all(upserts).await;
        self.apply(&mut working, deleted, fetched).await
    }

    /// Writes the cache snapshot to disk.
    pub async fn persist(&self) -> Result<()> {
        self.storage.save_cache(&self.cache).await
    }

    async fn fetch_all(&self, paths: Vec<String>) -> Vec<(String, Fetched)> {
        let tasks = paths.into_iter().map(|path| {
            let workers = self.workers.clone();
            let source = self.context.source.clone();
            let extractor = self.context.extractor.clone();
            let cache = self.cache.clone();
            async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let err = AtomGraphError::InvalidOperation(e.to_string());
                        return (path, Fetched::Unreadable(err));
                    }
                };
                let content = match source.read(&path).await {
                    Ok(content) => content,
                    Err(AtomGraphError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        return (path, Fetched::Missing);
                    }
                    Err(e) => return (path, Fetched::Unreadable(e)),
                };
                if let Some(analysis) = cache.get(&path, &content) {
                    return (path, Fetched::Unchanged(analysis));
                }
                let analysis = extract(extractor, path.clone(), content.clone()).await;
                (path, Fetched::Extracted { content, analysis })
            }
        });
        futures::future::join_all(tasks).await
    }

    async fn apply(
        &self,
        working: &mut WorkingSet,
        mut deleted: Vec<String>,
        fetched: Vec<(String, Fetched)>,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let mut report = BatchReport::default();
        let mut contents: BTreeMap<String, (String, ChangeType)> = BTreeMap::new();
        let mut invalidated: BTreeSet<String> = BTreeSet::new();

        let mut extracted = Vec::new();
        for (path, fetched) in fetched {
            match fetched {
                Fetched::Missing => {
                    debug!("{} vanished before analysis; treating as deleted", path);
                    deleted.push(path);
                }
                Fetched::Unreadable(e) => {
                    warn!("Skipping {}: {}", path, e);
                    report.failed.push(path);
                }
                Fetched::Unchanged(analysis) => {
                    working.analyses.entry(path.clone()).or_insert(analysis);
                    self.graph.mark_static_analyzed(&path);
                    report.unchanged.push(path);
                }
                Fetched::Extracted { content, analysis } => extracted.push((path, content, analysis)),
            }
        }

        for path in &deleted {
            working.analyses.remove(path);
            working.gate_outcomes.remove(path);
            self.cache.remove(path);
            if let Some(cascade) = self.graph.remove_file(path) {
                if cascade.cycle_detected {
                    report.cycles_detected += 1;
                }
                invalidated.extend(cascade.invalidated);
            }
            report.deleted.push(path.clone());
        }

        for (path, content, analysis) in extracted {
            if let Some(error) = &analysis.error {
                warn!("Extraction failed for {}: {}", path, error);
                report.failed.push(path.clone());
            }
            let change = classify_change(working.analyses.get(&path), &analysis);
            self.graph.record_analysis(&path, &analysis.content_hash, change);
            self.graph
                .update_dependencies(&path, &analysis.dependency_paths());
            if change >= ChangeType::Static {
                let cascade = self.graph.invalidate_dependents(&path);
                if cascade.cycle_detected {
                    report.cycles_detected += 1;
                }
                invalidated.extend(cascade.invalidated);
            }
            working.analyses.insert(path.clone(), analysis);
            contents.insert(path.clone(), (content, change));
            report.analyzed.push(path);
        }

        invalidated.retain(|path| working.analyses.contains_key(path));
        // Deletion strips the deleted file from its dependents' edge lists, but
        // their analyses still import it; restore those edges as placeholders.
        for path in invalidated.iter().filter(|p| !contents.contains_key(*p)) {
            if let Some(analysis) = working.analyses.get(path) {
                self.graph
                    .update_dependencies(path, &analysis.dependency_paths());
            }
        }
        let outcome = self.derive(&mut working.analyses);

        let targets: BTreeSet<String> = contents
            .keys()
            .cloned()
            .chain(invalidated.iter().cloned())
            .collect();
        for path in &targets {
            if let Some(analysis) = working.analyses.get(path) {
                let decision = self.gate.decide(&GateInput {
                    analysis,
                    connections: &outcome.connections,
                    thresholds: &self.context.config.gates,
                });
                working.gate_outcomes.insert(path.clone(), decision);
            }
        }

        for (path, analysis) in &working.analyses {
            match contents.get(path) {
                Some((content, change)) => self.cache.set(path, content, analysis.clone(), *change),
                None => {
                    self.cache.refresh_metadata(path, analysis.clone());
                }
            }
        }

        report.deep_analyzed = self.run_deep_analysis(working, &targets, &contents).await;

        for path in &invalidated {
            self.graph.mark_static_analyzed(path);
        }
        report.invalidated = invalidated.into_iter().collect();
        report.conflicts = outcome.conflicts.len();

        self.publish(working, outcome, true);
        info!(
            "Batch complete in {:?}: {} analyzed, {} unchanged, {} deleted, {} invalidated, {} failed",
            started.elapsed(),
            report.analyzed.len(),
            report.unchanged.len(),
            report.deleted.len(),
            report.invalidated.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Fusion, then purposes and archetypes over the whole working set.
    fn derive(&self, analyses: &mut BTreeMap<String, FileAnalysis>) -> FusionOutcome {
        let outcome = self.fusion.fuse(analyses);
        let graph = &self.graph;
        self.purposes
            .apply(analyses, |path| graph.dependents(path).len());
        outcome
    }

    async fn run_deep_analysis(
        &self,
        working: &WorkingSet,
        targets: &BTreeSet<String>,
        contents: &BTreeMap<String, (String, ChangeType)>,
    ) -> Vec<String> {
        let Some(client) = &self.deep else {
            return Vec::new();
        };

        let mut requests = Vec::new();
        for path in targets {
            let needs_llm = working
                .gate_outcomes
                .get(path)
                .map(|o| o.needs_llm)
                .unwrap_or(false);
            let Some(analysis) = working.analyses.get(path).filter(|_| needs_llm) else {
                continue;
            };
            let content = match contents.get(path) {
                Some((content, _)) => content.clone(),
                None => match self.context.source.read(path).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("Skipping deep analysis of {}: {}", path, e);
                        continue;
                    }
                },
            };
            requests.push(DeepAnalysisRequest {
                file_path: path.clone(),
                content,
                atoms: analysis.atoms.clone(),
                connections: analysis.connections.clone(),
                file_archetype: analysis.file_archetype,
            });
        }

        let calls = requests.into_iter().map(|request| {
            let workers = self.workers.clone();
            async move {
                let _permit = workers.acquire_owned().await.ok()?;
                let path = request.file_path.clone();
                client.analyze(request).await.map(|insights| (path, insights))
            }
        });

        let mut analyzed = Vec::new();
        for (path, insights) in futures::future::join_all(calls).await.into_iter().flatten() {
            let insight_hash = content_hash(&insights.to_string());
            if self.cache.set_llm_insights(&path, insights) {
                self.graph.mark_llm_analyzed(&path, &insight_hash);
                analyzed.push(path);
            }
        }
        analyzed
    }

    fn publish(&self, working: &mut WorkingSet, outcome: FusionOutcome, ready: bool) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let violations = self.graph.symmetry_violations();
            if !violations.is_empty() {
                debug!("Dependency symmetry violations: {:?}", violations);
            }
            let cycles = self.graph.find_cycles();
            if !cycles.is_empty() {
                debug!("{} dependency cycle(s): {:?}", cycles.len(), cycles);
            }
        }

        working.generation += 1;
        let snapshot = KnowledgeSnapshot {
            analyses: working.analyses.clone(),
            entries: self.graph.entries_snapshot(),
            connections: outcome.connections,
            conflicts: outcome.conflicts,
            gate_outcomes: working.gate_outcomes.clone(),
            ready: ready || self.snapshot.read().ready,
            generation: working.generation,
        };
        *self.snapshot.write() = Arc::new(snapshot);
    }
}

/// Runs the extractor off the async workers. A panicking extractor degrades
/// to an empty, error-tagged analysis.
async fn extract(extractor: Arc<dyn Extractor>, path: String, content: String) -> FileAnalysis {
    let result = tokio::task::spawn_blocking({
        let path = path.clone();
        let content = content.clone();
        move || extractor.extract(&path, &content)
    })
    .await
    .unwrap_or_else(|e| ExtractionResult::failed(format!("extractor panicked: {}", e)));
    FileAnalysis::from_extraction(path, &content, result)
}
