use crate::Connection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub type AtomId = String;

/// Builds the stable id of an atom from its file and name.
pub fn atom_id(file_path: &str, name: &str) -> AtomId {
    format!("{}::{}", file_path, name)
}

/// Splits an atom id back into `(file_path, name)`.
pub fn split_atom_id(id: &str) -> Option<(&str, &str)> {
    id.rsplit_once("::")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AtomKind {
    Function,
    Variable,
    ClassMethod,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffects {
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub storage: bool,
    #[serde(default)]
    pub dom: bool,
    #[serde(default)]
    pub global_access: bool,
}

impl SideEffects {
    pub fn any(&self) -> bool {
        self.network || self.storage || self.dom || self.global_access
    }
}

/// Execution-order hints collected by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalSignals {
    #[serde(default)]
    pub lifecycle_hooks: Vec<String>,
    #[serde(default)]
    pub event_listeners: bool,
    #[serde(default)]
    pub event_emitters: bool,
    #[serde(default)]
    pub timers: bool,
}

impl TemporalSignals {
    pub fn is_event_driven(&self) -> bool {
        !self.lifecycle_hooks.is_empty() || self.event_listeners || self.event_emitters
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSignature {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAccess {
    pub key: String,
    pub mode: StateAccessMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ArchetypeKind {
    GodFunction,
    HotPath,
    FragileNetwork,
    Validator,
    Transformer,
    Other(String),
}

impl fmt::Display for ArchetypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchetypeKind::GodFunction => "god-function",
            ArchetypeKind::HotPath => "hot-path",
            ArchetypeKind::FragileNetwork => "fragile-network",
            ArchetypeKind::Validator => "validator",
            ArchetypeKind::Transformer => "transformer",
            ArchetypeKind::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ArchetypeKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "god-function" => ArchetypeKind::GodFunction,
            "hot-path" => ArchetypeKind::HotPath,
            "fragile-network" => ArchetypeKind::FragileNetwork,
            "validator" => ArchetypeKind::Validator,
            "transformer" => ArchetypeKind::Transformer,
            other => ArchetypeKind::Other(other.to_string()),
        })
    }
}

impl From<String> for ArchetypeKind {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<ArchetypeKind> for String {
    fn from(kind: ArchetypeKind) -> Self {
        kind.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archetype {
    #[serde(rename = "type")]
    pub kind: ArchetypeKind,
    pub severity: u8,
    pub confidence: f64,
}

impl Archetype {
    pub fn new(kind: ArchetypeKind, severity: u8, confidence: f64) -> Self {
        Self {
            kind,
            severity,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Purpose {
    ApiExport,
    TestHelper,
    ScriptMain,
    ConfigSetup,
    ClassMethod,
    EventHandler,
    TimerAsync,
    NetworkHandler,
    InternalHelper,
    DeadCode,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::ApiExport => "API_EXPORT",
            Purpose::TestHelper => "TEST_HELPER",
            Purpose::ScriptMain => "SCRIPT_MAIN",
            Purpose::ConfigSetup => "CONFIG_SETUP",
            Purpose::ClassMethod => "CLASS_METHOD",
            Purpose::EventHandler => "EVENT_HANDLER",
            Purpose::TimerAsync => "TIMER_ASYNC",
            Purpose::NetworkHandler => "NETWORK_HANDLER",
            Purpose::InternalHelper => "INTERNAL_HELPER",
            Purpose::DeadCode => "DEAD_CODE",
        }
    }

    /// Purposes whose runtime behaviour depends on wiring the static pass may not see.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            Purpose::EventHandler | Purpose::NetworkHandler | Purpose::TimerAsync
        )
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurposeInfo {
    pub value: Purpose,
    pub reason: String,
    pub confidence: f64,
    #[serde(default)]
    pub is_dead: bool,
}

impl PurposeInfo {
    pub fn new(value: Purpose, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            value,
            reason: reason.into(),
            confidence,
            is_dead: false,
        }
    }
}

/// A connection the predecessor atom held, carried forward to its successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InheritedEdge {
    pub target: AtomId,
    pub relationship: String,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ancestry {
    pub ancestor_id: AtomId,
    pub generation: u32,
    /// Similarity between this atom and its ancestor, in `[0, 1]`.
    pub vibration_score: f64,
    #[serde(default)]
    pub inherited: Vec<InheritedEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Atom {
    pub id: AtomId,
    pub name: String,
    pub file_path: String,
    pub kind: AtomKind,
    #[serde(default)]
    pub is_exported: bool,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub side_effects: SideEffects,
    #[serde(default)]
    pub temporal: TemporalSignals,
    #[serde(default)]
    pub signature: TypeSignature,
    #[serde(default)]
    pub shared_state: Vec<StateAccess>,
    #[serde(default)]
    pub complexity: u32,
    #[serde(default)]
    pub archetype: Option<Archetype>,
    #[serde(default)]
    pub purpose: Option<PurposeInfo>,
    #[serde(default)]
    pub ancestry: Option<Ancestry>,
    /// Callee ids once fused; raw callee names straight out of the extractor.
    #[serde(default)]
    pub calls: Vec<String>,
    #[serde(default)]
    pub called_by: Vec<AtomId>,
}

impl Atom {
    pub fn new(file_path: impl Into<String>, name: impl Into<String>, kind: AtomKind) -> Self {
        let file_path = file_path.into();
        let name = name.into();
        Self {
            id: atom_id(&file_path, &name),
            name,
            file_path,
            kind,
            is_exported: false,
            is_async: false,
            side_effects: SideEffects::default(),
            temporal: TemporalSignals::default(),
            signature: TypeSignature::default(),
            shared_state: Vec::new(),
            complexity: 1,
            archetype: None,
            purpose: None,
            ancestry: None,
            calls: Vec::new(),
            called_by: Vec::new(),
        }
    }

    pub fn exported(mut self) -> Self {
        self.is_exported = true;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn with_calls<I, S>(mut self, calls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.calls = calls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_side_effects(mut self, side_effects: SideEffects) -> Self {
        self.side_effects = side_effects;
        self
    }

    pub fn with_temporal(mut self, temporal: TemporalSignals) -> Self {
        self.temporal = temporal;
        self
    }

    pub fn with_signature(mut self, inputs: Vec<String>, output: Option<String>) -> Self {
        self.signature = TypeSignature { inputs, output };
        self
    }

    pub fn with_shared_state(mut self, key: impl Into<String>, mode: StateAccessMode) -> Self {
        self.shared_state.push(StateAccess {
            key: key.into(),
            mode,
        });
        self
    }

    pub fn with_archetype(mut self, archetype: Archetype) -> Self {
        self.archetype = Some(archetype);
        self
    }

    pub fn with_ancestry(mut self, ancestry: Ancestry) -> Self {
        self.ancestry = Some(ancestry);
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn writes_shared_state(&self) -> impl Iterator<Item = &str> {
        self.shared_state
            .iter()
            .filter(|s| s.mode == StateAccessMode::Write)
            .map(|s| s.key.as_str())
    }

    pub fn is_dead(&self) -> bool {
        self.purpose.as_ref().map(|p| p.is_dead).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    None,
    Cosmetic,
    Static,
    Semantic,
    Critical,
}

impl Default for ChangeType {
    fn default() -> Self {
        ChangeType::None
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::None => "none",
            ChangeType::Cosmetic => "cosmetic",
            ChangeType::Static => "static",
            ChangeType::Semantic => "semantic",
            ChangeType::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Per-file bookkeeping owned by the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCacheEntry {
    pub file_path: String,
    /// `None` for placeholder entries created before the file was first analysed.
    pub content_hash: Option<String>,
    pub change_type: ChangeType,
    pub version: u64,
    pub static_analyzed: bool,
    pub llm_analyzed: bool,
    pub static_hash: Option<String>,
    pub llm_hash: Option<String>,
    pub depends_on: BTreeSet<String>,
    pub used_by: BTreeSet<String>,
}

impl FileCacheEntry {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            content_hash: None,
            change_type: ChangeType::None,
            version: 0,
            static_analyzed: false,
            llm_analyzed: false,
            static_hash: None,
            llm_hash: None,
            depends_on: BTreeSet::new(),
            used_by: BTreeSet::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.content_hash.is_none()
    }

    /// Marks the entry stale after an upstream change.
    pub fn invalidate(&mut self) {
        self.static_analyzed = false;
        self.llm_analyzed = false;
        self.version += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSpecifier {
    /// Exported name in the source module; `default` or `*` for default and namespace imports.
    pub imported: String,
    pub local: String,
}

impl ImportSpecifier {
    pub fn named(imported: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            imported: imported.into(),
            local: local.into(),
        }
    }

    pub fn namespace(local: impl Into<String>) -> Self {
        Self::named("*", local)
    }

    pub fn is_namespace(&self) -> bool {
        self.imported == "*"
    }

    pub fn is_default(&self) -> bool {
        self.imported == "default"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    /// Resolved path of the imported file.
    pub source: String,
    #[serde(default)]
    pub specifiers: Vec<ImportSpecifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Named,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub name: String,
    pub kind: ExportKind,
}

impl ExportRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExportKind::Named,
        }
    }

    pub fn default_export(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExportKind::Default,
        }
    }
}

/// What the extractor hands back for one file. Parse failures are reported
/// through `error` with an empty atom set, never as a panic or `Err`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub atoms: Vec<Atom>,
    #[serde(default)]
    pub candidate_connections: Vec<Connection>,
    #[serde(default)]
    pub imports: Vec<ImportRecord>,
    #[serde(default)]
    pub exports: Vec<ExportRecord>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileArchetype {
    GodObject,
    CriticalBottleneck,
    NetworkHub,
    OrphanModule,
}

impl FileArchetype {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileArchetype::GodObject => "god-object",
            FileArchetype::CriticalBottleneck => "critical-bottleneck",
            FileArchetype::NetworkHub => "network-hub",
            FileArchetype::OrphanModule => "orphan-module",
        }
    }
}

impl fmt::Display for FileArchetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest analysis result for one file. Replaced wholesale on every re-analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnalysis {
    pub file_path: String,
    pub content_hash: String,
    pub normalized_hash: String,
    pub atoms: Vec<Atom>,
    /// Raw candidates from the extractor, re-validated on every fusion pass
    #[serde(default)]
    pub candidates: Vec<Connection>,
    /// Fused connections whose source endpoint lives in this file
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub imports: Vec<ImportRecord>,
    #[serde(default)]
    pub exports: Vec<ExportRecord>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub file_archetype: Option<FileArchetype>,
    pub analyzed_at: DateTime<Utc>,
}

impl FileAnalysis {
    pub fn from_extraction(
        file_path: impl Into<String>,
        content: &str,
        extraction: ExtractionResult,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            content_hash: crate::content_hash(content),
            normalized_hash: crate::normalized_hash(content),
            atoms: extraction.atoms,
            candidates: extraction.candidate_connections,
            connections: Vec::new(),
            imports: extraction.imports,
            exports: extraction.exports,
            error: extraction.error,
            file_archetype: None,
            analyzed_at: Utc::now(),
        }
    }

    pub fn dependency_paths(&self) -> Vec<String> {
        let mut deps: Vec<String> = self.imports.iter().map(|i| i.source.clone()).collect();
        deps.sort();
        deps.dedup();
        deps.retain(|d| d != &self.file_path);
        deps
    }

    pub fn export_names(&self) -> Vec<String> {
        self.exports.iter().map(|e| e.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    pub path: String,
    pub change_type: FileChangeKind,
}

impl FileChangeEvent {
    pub fn created(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_type: FileChangeKind::Created,
        }
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_type: FileChangeKind::Modified,
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_type: FileChangeKind::Deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_id_is_path_and_name() {
        let atom = Atom::new("src/auth.js", "login", AtomKind::Function);
        assert_eq!(atom.id, "src/auth.js::login");
        assert_eq!(split_atom_id(&atom.id), Some(("src/auth.js", "login")));
    }

    #[test]
    fn archetype_kind_round_trips_through_strings() {
        let kind: ArchetypeKind = "hot-path".parse().unwrap();
        assert_eq!(kind, ArchetypeKind::HotPath);
        let custom: ArchetypeKind = String::from("facade").into();
        assert_eq!(custom.to_string(), "facade");
    }

    #[test]
    fn invalidate_clears_flags_and_bumps_version() {
        let mut entry = FileCacheEntry::new("a.js");
        entry.static_analyzed = true;
        entry.llm_analyzed = true;
        entry.invalidate();
        assert!(!entry.static_analyzed);
        assert!(!entry.llm_analyzed);
        assert_eq!(entry.version, 1);
    }

    #[test]
    fn change_types_are_ordered_by_severity() {
        assert!(ChangeType::Critical > ChangeType::Semantic);
        assert!(ChangeType::Static > ChangeType::Cosmetic);
        assert!(ChangeType::Cosmetic > ChangeType::None);
    }

    #[test]
    fn file_change_event_uses_camel_case_keys() {
        let json = serde_json::to_value(FileChangeEvent::deleted("x.js")).unwrap();
        assert_eq!(json["changeType"], "deleted");
        assert_eq!(json["path"], "x.js");
    }
}
