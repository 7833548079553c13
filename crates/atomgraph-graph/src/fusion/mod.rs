//! Connection extraction and fusion.
//!
//! Independent detectors propose candidate connections over the full atom
//! set. Fusion drops malformed candidates, merges duplicates, assigns weights
//! and categories, and reports structural conflicts.

pub mod conflicts;
pub mod detectors;
pub mod linking;

pub use conflicts::*;
pub use detectors::*;
pub use linking::link_calls;

use atomgraph_core::{
    split_atom_id, Atom, Connection, EndpointFlags, FileAnalysis, FusionConfig, Result,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Read-only view of the analysed codebase handed to every detector.
pub struct FusionInput<'a> {
    pub analyses: &'a BTreeMap<String, FileAnalysis>,
    atoms_by_id: HashMap<&'a str, &'a Atom>,
}

impl<'a> FusionInput<'a> {
    pub fn new(analyses: &'a BTreeMap<String, FileAnalysis>) -> Self {
        let atoms_by_id = analyses
            .values()
            .flat_map(|a| a.atoms.iter())
            .map(|atom| (atom.id.as_str(), atom))
            .collect();
        Self {
            analyses,
            atoms_by_id,
        }
    }

    pub fn atoms(&self) -> impl Iterator<Item = &'a Atom> + 'a {
        let analyses = self.analyses;
        analyses.values().flat_map(|a| a.atoms.iter())
    }

    pub fn atom(&self, id: &str) -> Option<&'a Atom> {
        self.atoms_by_id.get(id).copied()
    }

    /// True for known atom ids, known file paths and `state:` pseudo-nodes.
    pub fn knows(&self, endpoint: &str) -> bool {
        self.atoms_by_id.contains_key(endpoint)
            || self.analyses.contains_key(endpoint)
            || endpoint.starts_with("state:")
    }

    fn endpoint_flags(&self, endpoint: &str) -> EndpointFlags {
        match self.atom(endpoint).and_then(|a| a.ancestry.as_ref()) {
            Some(ancestry) => EndpointFlags {
                vibration: Some(ancestry.vibration_score),
                generation: Some(ancestry.generation),
            },
            None => EndpointFlags::default(),
        }
    }
}

/// One independent connection-finding strategy.
pub trait ConnectionDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, input: &FusionInput<'_>) -> Result<Vec<Connection>>;
}

#[derive(Debug, Clone, Default)]
pub struct FusionOutcome {
    pub connections: Vec<Connection>,
    pub conflicts: Vec<Conflict>,
    pub dropped: usize,
    pub failed_detectors: Vec<String>,
}

/// Why a candidate is rejected, if it is.
pub fn malformed_reason(candidate: &Connection) -> Option<&'static str> {
    if candidate.from.is_empty() || candidate.to.is_empty() {
        Some("empty endpoint")
    } else if candidate.from == candidate.to {
        Some("self-referential")
    } else if !candidate.confidence.is_finite() || !(0.0..=1.0).contains(&candidate.confidence) {
        Some("confidence outside [0, 1]")
    } else {
        None
    }
}

/// File that owns a connection endpoint: the atom's file, or the id itself
/// for file-level endpoints.
pub fn endpoint_file(endpoint: &str) -> &str {
    split_atom_id(endpoint)
        .map(|(file, _)| file)
        .unwrap_or(endpoint)
}

pub struct FusionEngine {
    config: FusionConfig,
    detectors: Vec<Box<dyn ConnectionDetector>>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self::with_detectors(
            config,
            vec![
                Box::new(StructuralDetector),
                Box::new(DataFlowDetector),
                Box::new(TemporalDetector),
                Box::new(LineageDetector),
                Box::new(SharedStateDetector),
            ],
        )
    }

    pub fn with_detectors(config: FusionConfig, detectors: Vec<Box<dyn ConnectionDetector>>) -> Self {
        Self { config, detectors }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Links calls, runs every detector and writes the fused connections back
    /// onto the analyses (each connection lives with its source file).
    pub fn fuse(&self, analyses: &mut BTreeMap<String, FileAnalysis>) -> FusionOutcome {
        link_calls(analyses);

        let mut outcome = FusionOutcome::default();
        {
            let input = FusionInput::new(analyses);
            let mut merged: BTreeMap<(String, String, String), Connection> = BTreeMap::new();

            for detector in &self.detectors {
                let candidates = match detector.detect(&input) {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        warn!("Detector {} failed: {}", detector.name(), e);
                        outcome.failed_detectors.push(detector.name().to_string());
                        continue;
                    }
                };

                for candidate in candidates {
                    if let Some(reason) = malformed_reason(&candidate) {
                        warn!(
                            "Dropping {} candidate {} -> {} from {}: {}",
                            candidate.type_name(),
                            candidate.from,
                            candidate.to,
                            detector.name(),
                            reason
                        );
                        outcome.dropped += 1;
                        continue;
                    }
                    merge_candidate(&mut merged, candidate);
                }
            }

            outcome.connections = merged
                .into_values()
                .map(|mut c| {
                    let flags = input
                        .endpoint_flags(&c.from)
                        .merge(input.endpoint_flags(&c.to));
                    c.apply_weight(&self.config, flags);
                    c
                })
                .collect();
        }

        outcome.conflicts = detect_conflicts(&outcome.connections);

        for analysis in analyses.values_mut() {
            analysis.connections.clear();
        }
        for connection in &outcome.connections {
            if let Some(analysis) = analyses.get_mut(endpoint_file(&connection.from)) {
                analysis.connections.push(connection.clone());
            }
        }

        debug!(
            "Fused {} connections ({} dropped, {} conflicts)",
            outcome.connections.len(),
            outcome.dropped,
            outcome.conflicts.len()
        );
        outcome
    }
}

fn merge_candidate(merged: &mut BTreeMap<(String, String, String), Connection>, candidate: Connection) {
    match merged.get_mut(&candidate.key()) {
        Some(existing) => {
            if candidate.confidence > existing.confidence {
                existing.confidence = candidate.confidence;
                existing.kind = candidate.kind.clone();
                existing.status = candidate.status;
                if !candidate.relationship.is_empty() {
                    existing.relationship = candidate.relationship.clone();
                }
            }
            for evidence in candidate.evidence {
                if !existing.evidence.contains(&evidence) {
                    existing.evidence.push(evidence);
                }
            }
        }
        None => {
            merged.insert(candidate.key(), candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomgraph_core::{
        AtomGraphError, AtomKind, ConnectionKind, ExtractionResult, ImportRecord,
        ImportSpecifier,
    };

    struct Failing;

    impl ConnectionDetector for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&self, _input: &FusionInput<'_>) -> Result<Vec<Connection>> {
            Err(AtomGraphError::InvalidOperation("boom".into()))
        }
    }

    struct Fixed(Vec<Connection>);

    impl ConnectionDetector for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&self, _input: &FusionInput<'_>) -> Result<Vec<Connection>> {
            Ok(self.0.clone())
        }
    }

    fn codebase() -> BTreeMap<String, FileAnalysis> {
        let auth = ExtractionResult {
            atoms: vec![Atom::new("src/auth.js", "login", AtomKind::Function).exported()],
            ..Default::default()
        };
        let ui = ExtractionResult {
            atoms: vec![Atom::new("src/ui.js", "submit", AtomKind::Function).with_calls(["login"])],
            imports: vec![ImportRecord {
                source: "src/auth.js".into(),
                specifiers: vec![ImportSpecifier::named("login", "login")],
            }],
            ..Default::default()
        };
        [
            ("src/auth.js", FileAnalysis::from_extraction("src/auth.js", "a", auth)),
            ("src/ui.js", FileAnalysis::from_extraction("src/ui.js", "b", ui)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn fuses_imports_and_calls_with_weights() {
        let mut analyses = codebase();
        let outcome = FusionEngine::new(FusionConfig::default()).fuse(&mut analyses);

        let call = outcome
            .connections
            .iter()
            .find(|c| c.type_name() == "call")
            .unwrap();
        assert_eq!(call.from, "src/ui.js::submit");
        assert_eq!(call.to, "src/auth.js::login");
        assert!(call.weight() > 0.0);

        assert!(outcome
            .connections
            .iter()
            .any(|c| c.type_name() == "import" && c.from == "src/ui.js" && c.to == "src/auth.js"));
        assert_eq!(analyses["src/ui.js"].connections.len(), 2);
        assert!(analyses["src/auth.js"].connections.is_empty());
    }

    #[test]
    fn failing_detector_does_not_abort_fusion() {
        let mut analyses = codebase();
        let engine = FusionEngine::with_detectors(
            FusionConfig::default(),
            vec![Box::new(Failing), Box::new(StructuralDetector)],
        );
        let outcome = engine.fuse(&mut analyses);
        assert_eq!(outcome.failed_detectors, vec!["failing"]);
        assert!(!outcome.connections.is_empty());
    }

    #[test]
    fn malformed_candidates_are_dropped_and_duplicates_merged() {
        let mut analyses = codebase();
        let a = "src/ui.js::submit";
        let b = "src/auth.js::login";
        let engine = FusionEngine::with_detectors(
            FusionConfig::default(),
            vec![Box::new(Fixed(vec![
                Connection::new(a, a, ConnectionKind::Call, 1.0),
                Connection::new("", b, ConnectionKind::Call, 1.0),
                Connection::new(a, b, ConnectionKind::Call, f64::NAN),
                Connection::new(a, b, ConnectionKind::Call, 1.5),
                Connection::new(a, b, ConnectionKind::Call, 0.4).with_evidence("one"),
                Connection::new(a, b, ConnectionKind::Call, 0.9).with_evidence("two"),
            ]))],
        );
        let outcome = engine.fuse(&mut analyses);
        assert_eq!(outcome.dropped, 4);
        assert_eq!(outcome.connections.len(), 1);
        assert_eq!(outcome.connections[0].confidence, 0.9);
        assert_eq!(outcome.connections[0].evidence, vec!["one", "two"]);
    }
}
