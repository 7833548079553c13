use crate::dependency::transitive_used_by;
use crate::fusion::Conflict;
use crate::gate::GateOutcome;
use crate::snapshot::KnowledgeSnapshot;
use atomgraph_cache::{CacheStats, IncrementalCache};
use atomgraph_core::{Atom, Connection, ConnectionCategory, ExportKind, QueryConfig, SourceProvider};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatusKind {
    NotReady,
    NotIndexed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStatus {
    pub status: QueryStatusKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactMap {
    pub file: String,
    pub directly_affects: Vec<String>,
    /// Dependents beyond the direct ones, capped
    pub transitive_affects: Vec<String>,
    pub semantic_connections: Vec<Connection>,
    /// Size of the full closure, before capping
    pub total_affected: usize,
    pub risk_level: RiskLevel,
    pub subsystem: String,
    pub exports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ImpactResponse {
    Map(ImpactMap),
    Status(QueryStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallForm {
    Direct,
    Namespaced,
    New,
    Method,
    CallApply,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSite {
    pub file: String,
    /// 1-based
    pub line: usize,
    /// 1-based, at the symbol
    pub column: usize,
    pub snippet: String,
    pub form: CallForm,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSites {
    pub target_symbol: String,
    pub target_file: String,
    pub export_type: String,
    /// Matches found before capping
    pub total_call_sites: usize,
    pub unique_files: usize,
    pub call_sites: Vec<CallSite>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CallSitesResponse {
    Found(CallSites),
    Error { error: String },
}

impl CallSitesResponse {
    fn error(message: impl Into<String>) -> Self {
        CallSitesResponse::Error {
            error: message.into(),
        }
    }
}

/// How a dependent file can refer to the target symbol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Binding {
    Local(String),
    Namespace(String),
}

/// Compiled call-form patterns for one binding, most specific first.
struct Matcher {
    patterns: Vec<(CallForm, Regex)>,
}

impl Matcher {
    fn new(binding: &Binding, symbol: &str) -> Result<Self, regex::Error> {
        let sym = regex::escape(symbol);
        let specs: Vec<(CallForm, String)> = match binding {
            Binding::Local(local) => {
                let name = regex::escape(local);
                vec![
                    (CallForm::New, format!(r"\bnew\s+(?P<sym>{name})\s*\(")),
                    (CallForm::CallApply, format!(r"(?:^|[^\w$.])(?P<sym>{name})\s*\.\s*(?:call|apply)\s*\(")),
                    (CallForm::Direct, format!(r"(?:^|[^\w$.])(?P<sym>{name})\s*\(")),
                    (CallForm::Method, format!(r"\.\s*(?P<sym>{name})\s*\(")),
                    (CallForm::Reference, format!(r"(?:^|[^\w$.])(?P<sym>{name})(?:[^\w$]|$)")),
                ]
            }
            Binding::Namespace(ns) => {
                let ns = regex::escape(ns);
                vec![
                    (CallForm::New, format!(r"\bnew\s+{ns}\s*\.\s*(?P<sym>{sym})\s*\(")),
                    (CallForm::CallApply, format!(r"\b{ns}\s*\.\s*(?P<sym>{sym})\s*\.\s*(?:call|apply)\s*\(")),
                    (CallForm::Namespaced, format!(r"\b{ns}\s*\.\s*(?P<sym>{sym})\s*\(")),
                    (CallForm::Reference, format!(r"\b{ns}\s*\.\s*(?P<sym>{sym})(?:[^\w$]|$)")),
                ]
            }
        };
        let patterns = specs
            .into_iter()
            .map(|(form, pattern)| Regex::new(&pattern).map(|re| (form, re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// First matching form on the line and the 0-based character column of
    /// the symbol.
    fn find(&self, line: &str) -> Option<(CallForm, usize)> {
        self.patterns.iter().find_map(|(form, re)| {
            re.captures(line)
                .and_then(|c| c.name("sym"))
                .map(|m| (*form, line[..m.start()].chars().count()))
        })
    }
}

/// Tracks import and re-export statements across lines so their specifier
/// lines are never reported as uses.
#[derive(Default)]
struct ImportSpan {
    open: bool,
}

impl ImportSpan {
    fn skips(&mut self, line: &str) -> bool {
        let trimmed = line.trim_start();
        if self.open {
            if trimmed.contains('}') {
                self.open = false;
            }
            return true;
        }
        if trimmed.starts_with("//") {
            return true;
        }
        let import = trimmed.starts_with("import ") || trimmed.starts_with("import{");
        let re_export = trimmed.starts_with("export ") && trimmed.contains(" from ");
        let braced_re_export = (trimmed.starts_with("export {") || trimmed.starts_with("export{"))
            && !trimmed.contains('}');
        if import || braced_re_export {
            self.open = trimmed.contains('{') && !trimmed.contains('}');
            return true;
        }
        re_export
    }
}

/// First directory under `src/`, else the parent directory, else `root`.
pub fn subsystem(file: &str) -> String {
    let parts: Vec<&str> = file.split('/').collect();
    if let Some(i) = parts.iter().position(|p| *p == "src") {
        if i + 2 < parts.len() {
            return parts[i + 1].to_string();
        }
    }
    if parts.len() >= 2 {
        return parts[parts.len() - 2].to_string();
    }
    "root".to_string()
}

/// Read-only view over the latest published snapshot. Never mutates.
#[derive(Clone)]
pub struct GraphQuery {
    snapshot: Arc<RwLock<Arc<KnowledgeSnapshot>>>,
    cache: Arc<IncrementalCache>,
    source: Arc<dyn SourceProvider>,
    config: QueryConfig,
}

impl GraphQuery {
    pub fn new(
        snapshot: Arc<RwLock<Arc<KnowledgeSnapshot>>>,
        cache: Arc<IncrementalCache>,
        source: Arc<dyn SourceProvider>,
        config: QueryConfig,
    ) -> Self {
        Self {
            snapshot,
            cache,
            source,
            config,
        }
    }

    fn current(&self) -> Arc<KnowledgeSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current().ready
    }

    fn status_for(&self, snapshot: &KnowledgeSnapshot, file: &str) -> Option<QueryStatus> {
        if !snapshot.ready {
            return Some(QueryStatus {
                status: QueryStatusKind::NotReady,
                message: "Index is still being built; retry after the first batch completes".into(),
            });
        }
        if snapshot.analysis(file).is_none() {
            return Some(QueryStatus {
                status: QueryStatusKind::NotIndexed,
                message: format!("{} is not in the index", file),
            });
        }
        None
    }

    pub fn get_impact_map(&self, file: &str) -> ImpactResponse {
        let snapshot = self.current();
        if let Some(status) = self.status_for(&snapshot, file) {
            return ImpactResponse::Status(status);
        }

        let directly_affects: Vec<String> = snapshot
            .entry(file)
            .map(|e| e.used_by.iter().cloned().collect())
            .unwrap_or_default();
        let direct: BTreeSet<&str> = directly_affects.iter().map(String::as_str).collect();
        let closure = transitive_used_by(&snapshot.entries, file);
        let total_affected = closure.len();
        let transitive_affects: Vec<String> = closure
            .into_iter()
            .filter(|f| !direct.contains(f.as_str()))
            .take(self.config.transitive_cap)
            .collect();

        let semantic_connections: Vec<Connection> = snapshot
            .connections_touching(file)
            .filter(|c| !c.kind.is_structural())
            .cloned()
            .collect();

        let risk_level = self.risk_level(total_affected, &semantic_connections);
        let exports = snapshot
            .analysis(file)
            .map(|a| a.export_names())
            .unwrap_or_default();

        debug!(
            "Impact map for {}: {} affected, risk {:?}",
            file, total_affected, risk_level
        );
        ImpactResponse::Map(ImpactMap {
            file: file.to_string(),
            directly_affects,
            transitive_affects,
            semantic_connections,
            total_affected,
            risk_level,
            subsystem: subsystem(file),
            exports,
        })
    }

    fn risk_level(&self, total: usize, semantic: &[Connection]) -> RiskLevel {
        let any = |category: ConnectionCategory| semantic.iter().any(|c| c.category() == category);
        if total >= self.config.high_risk_threshold || any(ConnectionCategory::Critical) {
            RiskLevel::High
        } else if total >= self.config.medium_risk_threshold || any(ConnectionCategory::Strong) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Finds textual uses of `symbol` (exported from `file`) in the files that
    /// depend on it, following renamed and namespace imports.
    pub async fn get_call_sites(&self, file: &str, symbol: &str) -> CallSitesResponse {
        let snapshot = self.current();
        if let Some(status) = self.status_for(&snapshot, file) {
            return CallSitesResponse::error(status.message);
        }
        let Some(target) = snapshot.analysis(file) else {
            return CallSitesResponse::error(format!("{} is not in the index", file));
        };

        let export = target.exports.iter().find(|e| e.name == symbol);
        let defined = target.atoms.iter().any(|a| a.name == symbol);
        if export.is_none() && !defined {
            return CallSitesResponse::error(format!("Symbol {} not found in {}", symbol, file));
        }
        let export_type = match export.map(|e| e.kind) {
            Some(ExportKind::Named) => "named",
            Some(ExportKind::Default) => "default",
            None => "none",
        };

        let mut sites = Vec::new();
        let dependents: Vec<String> = snapshot
            .entry(file)
            .map(|e| e.used_by.iter().cloned().collect())
            .unwrap_or_default();

        for dependent in dependents {
            let Some(analysis) = snapshot.analysis(&dependent) else {
                continue;
            };
            let mut bindings = BTreeSet::new();
            for import in analysis.imports.iter().filter(|i| i.source == file) {
                for spec in &import.specifiers {
                    if spec.is_namespace() {
                        bindings.insert(Binding::Namespace(spec.local.clone()));
                    } else if spec.is_default() {
                        if export_type == "default" {
                            bindings.insert(Binding::Local(spec.local.clone()));
                        }
                    } else if spec.imported == symbol {
                        bindings.insert(Binding::Local(spec.local.clone()));
                    }
                }
            }
            if bindings.is_empty() {
                continue;
            }

            let matchers = match bindings
                .iter()
                .map(|b| Matcher::new(b, symbol))
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(matchers) => matchers,
                Err(e) => return CallSitesResponse::error(format!("Invalid symbol pattern: {}", e)),
            };

            let content = match self.source.read(&dependent).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Cannot read {} for call-site search: {}", dependent, e);
                    continue;
                }
            };

            let mut imports = ImportSpan::default();
            for (index, line) in content.lines().enumerate() {
                if imports.skips(line) {
                    continue;
                }
                if let Some((form, column)) = matchers.iter().find_map(|m| m.find(line)) {
                    sites.push(CallSite {
                        file: dependent.clone(),
                        line: index + 1,
                        column: column + 1,
                        snippet: line.trim().to_string(),
                        form,
                    });
                }
            }
        }

        sites.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
        let total_call_sites = sites.len();
        let unique_files = sites
            .iter()
            .map(|s| s.file.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        sites.truncate(self.config.call_site_cap);

        CallSitesResponse::Found(CallSites {
            target_symbol: symbol.to_string(),
            target_file: file.to_string(),
            export_type: export_type.to_string(),
            total_call_sites,
            unique_files,
            call_sites: sites,
        })
    }

    pub fn find_atom(&self, id: &str) -> Option<Atom> {
        self.current().atom(id).cloned()
    }

    pub fn atoms_in_file(&self, file: &str) -> Vec<Atom> {
        self.current()
            .analysis(file)
            .map(|a| a.atoms.clone())
            .unwrap_or_default()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.current().conflicts.clone()
    }

    pub fn gate_outcome(&self, file: &str) -> Option<GateOutcome> {
        self.current().gate_outcomes.get(file).cloned()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
