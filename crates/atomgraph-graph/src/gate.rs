//! Decides per file whether deep analysis is worth paying for.
//!
//! Gates run in a fixed order and the first one that decides ends the
//! cascade. A file that no gate decides is reported as undecided with
//! `needs_llm` set.

use crate::fusion::endpoint_file;
use crate::purpose::FileClass;
use atomgraph_core::{
    ArchetypeKind, Connection, FileAnalysis, FileArchetype, GateThresholds, Purpose,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SAFE_PURPOSES: &[Purpose] = &[
    Purpose::TestHelper,
    Purpose::ConfigSetup,
    Purpose::ScriptMain,
    Purpose::InternalHelper,
    Purpose::ClassMethod,
    Purpose::ApiExport,
];

/// Severity at or above which an archetype is a risk signal on its own.
const RISKY_SEVERITY: u8 = 7;

pub struct GateInput<'a> {
    pub analysis: &'a FileAnalysis,
    /// Every fused connection in the graph.
    pub connections: &'a [Connection],
    pub thresholds: &'a GateThresholds,
}

impl<'a> GateInput<'a> {
    pub fn file_class(&self) -> FileClass {
        FileClass::of(&self.analysis.file_path)
    }

    /// Share of atoms that carry a purpose.
    pub fn coverage(&self) -> f64 {
        let atoms = &self.analysis.atoms;
        if atoms.is_empty() {
            return 0.0;
        }
        atoms.iter().filter(|a| a.purpose.is_some()).count() as f64 / atoms.len() as f64
    }

    pub fn purposes(&self) -> impl Iterator<Item = Purpose> + 'a {
        let analysis = self.analysis;
        analysis
            .atoms
            .iter()
            .filter_map(|a| a.purpose.as_ref().map(|p| p.value))
    }

    /// Semantic connections touching this file with confidence at or above the threshold.
    pub fn resolved_semantic_connections(&self) -> usize {
        let path = self.analysis.file_path.as_str();
        self.connections
            .iter()
            .filter(|c| !c.kind.is_structural())
            .filter(|c| c.confidence >= self.thresholds.semantic_confidence)
            .filter(|c| endpoint_file(&c.from) == path || endpoint_file(&c.to) == path)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Decided {
        needs_llm: bool,
        reason: String,
        file_archetype: Option<FileArchetype>,
    },
    Continue,
}

impl GateVerdict {
    fn decided(needs_llm: bool, reason: impl Into<String>) -> Self {
        GateVerdict::Decided {
            needs_llm,
            reason: reason.into(),
            file_archetype: None,
        }
    }
}

pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub decided: bool,
    #[serde(rename = "needsLLM")]
    pub needs_llm: bool,
    pub file_archetype: Option<String>,
    pub reason: String,
    /// Gate that decided, if any.
    #[serde(default)]
    pub gate: Option<String>,
}

/// Gate 0: tests, type declarations and empty files never need deep analysis.
pub struct BypassGate;

impl Gate for BypassGate {
    fn name(&self) -> &'static str {
        "bypass"
    }

    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict {
        match input.file_class() {
            FileClass::Test => GateVerdict::decided(false, "test file bypass"),
            FileClass::TypeDefinition => GateVerdict::decided(false, "type definition bypass"),
            _ if input.analysis.atoms.is_empty() => {
                GateVerdict::decided(false, "no atoms to analyse")
            }
            _ => GateVerdict::Continue,
        }
    }
}

/// Gate 1: low purpose coverage is inconclusive; the cascade carries on.
pub struct CoverageGate;

impl Gate for CoverageGate {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict {
        let coverage = input.coverage();
        if coverage < input.thresholds.min_coverage {
            debug!(
                "Purpose coverage {:.2} below {:.2} for {}",
                coverage, input.thresholds.min_coverage, input.analysis.file_path
            );
        }
        GateVerdict::Continue
    }
}

/// Gate 2: god functions and hot paths always warrant a deeper look.
pub struct ComplexArchetypeGate;

impl Gate for ComplexArchetypeGate {
    fn name(&self) -> &'static str {
        "complex-archetype"
    }

    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict {
        let found = input.analysis.atoms.iter().find_map(|a| {
            a.archetype
                .as_ref()
                .filter(|x| matches!(x.kind, ArchetypeKind::GodFunction | ArchetypeKind::HotPath))
                .map(|x| (a.name.as_str(), x.kind.to_string()))
        });
        match found {
            Some((name, kind)) => GateVerdict::decided(true, format!("{} is a {}", name, kind)),
            None => GateVerdict::Continue,
        }
    }
}

/// Gate 3: every purpose is in the safe set and coverage is high enough.
pub struct SafePurposeGate;

impl Gate for SafePurposeGate {
    fn name(&self) -> &'static str {
        "safe-purposes"
    }

    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict {
        let coverage = input.coverage();
        let mut purposes = input.purposes().peekable();
        if purposes.peek().is_none() || coverage < input.thresholds.safe_coverage {
            return GateVerdict::Continue;
        }
        if purposes.all(|p| SAFE_PURPOSES.contains(&p)) {
            GateVerdict::decided(
                false,
                format!("all atoms have safe purposes (coverage {:.0}%)", coverage * 100.0),
            )
        } else {
            GateVerdict::Continue
        }
    }
}

/// Gate 4: a file of nothing but dead code is an orphan.
pub struct DeadCodeGate;

impl Gate for DeadCodeGate {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict {
        let mut purposes = input.purposes().peekable();
        if purposes.peek().is_some() && purposes.all(|p| p == Purpose::DeadCode) {
            GateVerdict::Decided {
                needs_llm: false,
                reason: "all atoms are dead code".to_string(),
                file_archetype: Some(
                    input
                        .analysis
                        .file_archetype
                        .unwrap_or(FileArchetype::OrphanModule),
                ),
            }
        } else {
            GateVerdict::Continue
        }
    }
}

/// Gate 5: conditional handlers are fine when enough confident semantic
/// connections already explain them.
pub struct ConditionalPurposeGate;

impl Gate for ConditionalPurposeGate {
    fn name(&self) -> &'static str {
        "conditional-purposes"
    }

    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict {
        let conditional = input.purposes().filter(|p| p.is_conditional()).count();
        if conditional == 0 {
            return GateVerdict::Continue;
        }
        let resolved = input.resolved_semantic_connections();
        if resolved >= conditional {
            GateVerdict::decided(
                false,
                format!(
                    "{} conditional atom(s) covered by {} resolved semantic connection(s)",
                    conditional, resolved
                ),
            )
        } else {
            GateVerdict::decided(
                true,
                format!(
                    "{} conditional atom(s) but only {} resolved semantic connection(s)",
                    conditional, resolved
                ),
            )
        }
    }
}

/// Gate 6: high coverage with no risky archetype.
pub struct HighCoverageGate;

impl Gate for HighCoverageGate {
    fn name(&self) -> &'static str {
        "high-coverage"
    }

    fn evaluate(&self, input: &GateInput<'_>) -> GateVerdict {
        let coverage = input.coverage();
        if coverage < input.thresholds.high_coverage {
            return GateVerdict::Continue;
        }
        let risky = input.analysis.atoms.iter().any(|a| {
            a.archetype.as_ref().is_some_and(|x| {
                x.confidence >= input.thresholds.risk_confidence
                    && (x.kind == ArchetypeKind::FragileNetwork || x.severity >= RISKY_SEVERITY)
            })
        });
        if risky {
            GateVerdict::Continue
        } else {
            GateVerdict::decided(
                false,
                format!("coverage {:.0}% with no risk signals", coverage * 100.0),
            )
        }
    }
}

pub struct DecisionGate {
    gates: Vec<Box<dyn Gate>>,
}

impl DecisionGate {
    pub fn standard() -> Self {
        Self::with_gates(vec![
            Box::new(BypassGate),
            Box::new(CoverageGate),
            Box::new(ComplexArchetypeGate),
            Box::new(SafePurposeGate),
            Box::new(DeadCodeGate),
            Box::new(ConditionalPurposeGate),
            Box::new(HighCoverageGate),
        ])
    }

    pub fn with_gates(gates: Vec<Box<dyn Gate>>) -> Self {
        Self { gates }
    }

    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub fn decide(&self, input: &GateInput<'_>) -> GateOutcome {
        for gate in &self.gates {
            if let GateVerdict::Decided {
                needs_llm,
                reason,
                file_archetype,
            } = gate.evaluate(input)
            {
                debug!(
                    "Gate {} decided {} (needs_llm={}): {}",
                    gate.name(),
                    input.analysis.file_path,
                    needs_llm,
                    reason
                );
                return GateOutcome {
                    decided: true,
                    needs_llm,
                    file_archetype: file_archetype
                        .or(input.analysis.file_archetype)
                        .map(|a| a.to_string()),
                    reason,
                    gate: Some(gate.name().to_string()),
                };
            }
        }

        debug!("No gate decided {}", input.analysis.file_path);
        GateOutcome {
            decided: false,
            needs_llm: true,
            file_archetype: input.analysis.file_archetype.map(|a| a.to_string()),
            reason: "no gate reached a confident decision".to_string(),
            gate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purpose::PurposeClassifier;
    use atomgraph_core::{
        Archetype, Atom, AtomKind, ConnectionKind, ExtractionResult, PurposeInfo, SideEffects,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn classified(path: &str, atoms: Vec<Atom>) -> FileAnalysis {
        let mut analyses = BTreeMap::new();
        analyses.insert(
            path.to_string(),
            FileAnalysis::from_extraction(
                path,
                "",
                ExtractionResult {
                    atoms,
                    ..Default::default()
                },
            ),
        );
        PurposeClassifier::standard().apply(&mut analyses, |_| 1);
        analyses.remove(path).unwrap()
    }

    fn decide(analysis: &FileAnalysis, connections: &[Connection]) -> GateOutcome {
        let thresholds = GateThresholds::default();
        DecisionGate::standard().decide(&GateInput {
            analysis,
            connections,
            thresholds: &thresholds,
        })
    }

    #[test]
    fn test_files_bypass() {
        let analysis = classified(
            "src/auth.test.js",
            vec![Atom::new("src/auth.test.js", "fixture", AtomKind::Function)],
        );
        let outcome = decide(&analysis, &[]);
        assert!(outcome.decided);
        assert!(!outcome.needs_llm);
        assert_eq!(outcome.gate.as_deref(), Some("bypass"));
    }

    #[test]
    fn all_safe_purposes_skip_deep_analysis() {
        let atoms = (0..4)
            .map(|i| {
                let mut atom = Atom::new("src/lib.js", format!("h{}", i), AtomKind::Function);
                atom.purpose = Some(PurposeInfo::new(Purpose::TestHelper, "helper", 0.9));
                atom
            })
            .collect();
        let analysis = FileAnalysis::from_extraction(
            "src/lib.js",
            "",
            ExtractionResult {
                atoms,
                ..Default::default()
            },
        );
        let outcome = decide(&analysis, &[]);
        assert!(outcome.decided);
        assert!(!outcome.needs_llm);
        assert!(outcome.reason.contains("safe purposes"));
    }

    #[test]
    fn hot_paths_need_deep_analysis() {
        let analysis = classified(
            "src/router.js",
            vec![Atom::new("src/router.js", "route", AtomKind::Function)
                .exported()
                .with_archetype(Archetype::new(ArchetypeKind::HotPath, 6, 0.8))],
        );
        let outcome = decide(&analysis, &[]);
        assert!(outcome.needs_llm);
        assert_eq!(outcome.gate.as_deref(), Some("complex-archetype"));
    }

    #[test]
    fn dead_files_default_to_orphan_module() {
        let mut atom = Atom::new("src/old.js", "unused", AtomKind::Function);
        let mut info = PurposeInfo::new(Purpose::DeadCode, "no rule matched", 0.5);
        info.is_dead = true;
        atom.purpose = Some(info);
        let analysis = FileAnalysis::from_extraction(
            "src/old.js",
            "",
            ExtractionResult {
                atoms: vec![atom],
                ..Default::default()
            },
        );
        let outcome = decide(&analysis, &[]);
        assert!(!outcome.needs_llm);
        assert_eq!(outcome.file_archetype.as_deref(), Some("orphan-module"));
    }

    #[test]
    fn conditional_purposes_need_resolved_connections() {
        let net = SideEffects {
            network: true,
            ..Default::default()
        };
        let analysis = classified(
            "src/sync.js",
            vec![Atom::new("src/sync.js", "poll", AtomKind::Function).with_side_effects(net)],
        );
        let unresolved = decide(&analysis, &[]);
        assert!(unresolved.needs_llm);
        assert_eq!(unresolved.gate.as_deref(), Some("conditional-purposes"));

        let shared = Connection::new(
            "src/sync.js::poll",
            "src/view.js::render",
            ConnectionKind::SharedState { key: "feed".into() },
            0.8,
        );
        let resolved = decide(&analysis, &[shared]);
        assert!(!resolved.needs_llm);
    }

    #[test]
    fn undecided_files_err_towards_analysis() {
        let gates = DecisionGate::with_gates(vec![Box::new(CoverageGate)]);
        let analysis = classified(
            "src/a.js",
            vec![Atom::new("src/a.js", "f", AtomKind::Function)],
        );
        let thresholds = GateThresholds::default();
        let outcome = gates.decide(&GateInput {
            analysis: &analysis,
            connections: &[],
            thresholds: &thresholds,
        });
        assert!(!outcome.decided);
        assert!(outcome.needs_llm);
    }

    struct Tracked {
        name: &'static str,
        verdict: GateVerdict,
        calls: Arc<AtomicUsize>,
    }

    impl Gate for Tracked {
        fn name(&self) -> &'static str {
            self.name
        }

        fn evaluate(&self, _input: &GateInput<'_>) -> GateVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.clone()
        }
    }

    #[test]
    fn later_gates_never_run_after_a_decision() {
        let counters: Vec<Arc<AtomicUsize>> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let verdicts = [
            GateVerdict::Continue,
            GateVerdict::decided(false, "stop here"),
            GateVerdict::decided(true, "unreachable"),
            GateVerdict::Continue,
        ];
        let gates: Vec<Box<dyn Gate>> = verdicts
            .into_iter()
            .zip(counters.iter())
            .map(|(verdict, calls)| {
                Box::new(Tracked {
                    name: "tracked",
                    verdict,
                    calls: calls.clone(),
                }) as Box<dyn Gate>
            })
            .collect();

        let analysis = classified("src/a.js", vec![Atom::new("src/a.js", "f", AtomKind::Function)]);
        let thresholds = GateThresholds::default();
        let outcome = DecisionGate::with_gates(gates).decide(&GateInput {
            analysis: &analysis,
            connections: &[],
            thresholds: &thresholds,
        });

        assert_eq!(outcome.reason, "stop here");
        let calls: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(calls, vec![1, 1, 0, 0]);
    }
}
