use super::{ConnectionDetector, FusionInput};
use atomgraph_core::{
    split_atom_id, Atom, Connection, ConnectionKind, ExecutionPhase, Result, StateAccessMode,
    TemporalRelation,
};
use std::collections::{BTreeMap, HashMap};

const INITIALIZER_PREFIXES: &[&str] = &[
    "init",
    "setup",
    "configure",
    "bootstrap",
    "register",
    "connect",
    "load",
    "create",
];
const TEARDOWN_MARKERS: &[&str] = &["destroy", "dispose", "teardown", "close", "cleanup", "unmount"];
const TRIVIAL_TYPES: &[&str] = &["", "void", "any", "unknown", "undefined", "null"];

fn file_of(id: &str) -> &str {
    split_atom_id(id).map(|(file, _)| file).unwrap_or(id)
}

/// Extractor candidates whose endpoints still exist, plus file imports and
/// resolved calls.
pub struct StructuralDetector;

impl ConnectionDetector for StructuralDetector {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn detect(&self, input: &FusionInput<'_>) -> Result<Vec<Connection>> {
        let mut out = Vec::new();

        for (path, analysis) in input.analyses {
            for candidate in &analysis.candidates {
                if input.knows(&candidate.from) && input.knows(&candidate.to) {
                    out.push(candidate.clone());
                }
            }

            for import in &analysis.imports {
                if import.source == *path {
                    continue;
                }
                let specifiers = import
                    .specifiers
                    .iter()
                    .map(|s| s.imported.clone())
                    .collect();
                out.push(
                    Connection::new(
                        path.clone(),
                        import.source.clone(),
                        ConnectionKind::Import { specifiers },
                        1.0,
                    )
                    .with_relationship("imports"),
                );
            }
        }

        for atom in input.atoms() {
            for callee in atom.calls.iter() {
                if callee != &atom.id && input.atom(callee).is_some() {
                    out.push(
                        Connection::new(atom.id.clone(), callee.clone(), ConnectionKind::Call, 1.0)
                            .with_relationship("calls"),
                    );
                }
            }
        }

        Ok(out)
    }
}

fn normalize_type(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    match compact
        .strip_prefix("Promise<")
        .and_then(|rest| rest.strip_suffix('>'))
    {
        Some(inner) => inner.to_string(),
        None => compact,
    }
}

fn is_trivial(ty: &str) -> bool {
    TRIVIAL_TYPES.contains(&ty.to_lowercase().as_str())
}

/// Producer -> consumer links keyed by a normalised type fingerprint.
pub struct DataFlowDetector;

impl ConnectionDetector for DataFlowDetector {
    fn name(&self) -> &'static str {
        "data-flow"
    }

    fn detect(&self, input: &FusionInput<'_>) -> Result<Vec<Connection>> {
        let mut consumers: HashMap<String, Vec<&Atom>> = HashMap::new();
        for atom in input.atoms() {
            for ty in atom.signature.inputs.iter().map(|t| normalize_type(t)) {
                if !is_trivial(&ty) {
                    consumers.entry(ty).or_default().push(atom);
                }
            }
        }

        let mut out = Vec::new();
        for producer in input.atoms() {
            let Some(output) = producer.signature.output.as_deref().map(normalize_type) else {
                continue;
            };
            if is_trivial(&output) {
                continue;
            }
            for consumer in consumers.get(&output).into_iter().flatten() {
                if consumer.id == producer.id {
                    continue;
                }
                out.push(
                    Connection::new(
                        producer.id.clone(),
                        consumer.id.clone(),
                        ConnectionKind::DataFlowChain {
                            fingerprint: output.clone(),
                        },
                        0.7,
                    )
                    .with_relationship("feeds")
                    .with_evidence(format!(
                        "{} returns {} consumed by {}",
                        producer.name, output, consumer.name
                    )),
                );
            }
        }
        Ok(out)
    }
}

/// Returns the initialised subject when `name` looks like an initializer.
fn initializer_subject(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    INITIALIZER_PREFIXES.iter().find_map(|prefix| {
        let subject = lower.strip_prefix(prefix)?.trim_start_matches('_');
        (subject.len() >= 3).then(|| subject.to_string())
    })
}

pub fn execution_phase(atom: &Atom) -> ExecutionPhase {
    let lower = atom.name.to_lowercase();
    let hooks: Vec<String> = atom
        .temporal
        .lifecycle_hooks
        .iter()
        .map(|h| h.to_lowercase())
        .collect();

    if TEARDOWN_MARKERS
        .iter()
        .any(|m| lower.contains(m) || hooks.iter().any(|h| h.contains(m)))
    {
        return ExecutionPhase::Teardown;
    }
    if initializer_subject(&atom.name).is_some()
        || hooks.iter().any(|h| h.contains("mount") || h.contains("init"))
    {
        return ExecutionPhase::Init;
    }
    ExecutionPhase::Runtime
}

/// Execution-order hints from initializer naming plus async shared-state writes.
pub struct TemporalDetector;

impl ConnectionDetector for TemporalDetector {
    fn name(&self) -> &'static str {
        "temporal"
    }

    fn detect(&self, input: &FusionInput<'_>) -> Result<Vec<Connection>> {
        let atoms: Vec<&Atom> = input.atoms().collect();
        let initializers: Vec<(&Atom, String)> = atoms
            .iter()
            .filter_map(|a| initializer_subject(&a.name).map(|s| (*a, s)))
            .collect();

        let mut out = Vec::new();
        for (init, subject) in &initializers {
            let phase = execution_phase(init);
            for consumer in &atoms {
                if consumer.id == init.id || initializer_subject(&consumer.name).is_some() {
                    continue;
                }
                if !consumer.name.to_lowercase().contains(subject.as_str()) {
                    continue;
                }
                let confidence = if consumer.file_path == init.file_path {
                    0.75
                } else {
                    0.6
                };
                out.push(
                    Connection::new(
                        init.id.clone(),
                        consumer.id.clone(),
                        ConnectionKind::TemporalDependency {
                            relation: TemporalRelation::MustRunBefore,
                            phase,
                            potential_race: false,
                        },
                        confidence,
                    )
                    .with_relationship("must-run-before")
                    .with_evidence(format!("{} initializes {}", init.name, subject)),
                );
            }
        }

        for atom in atoms.iter().filter(|a| a.is_async) {
            for key in atom.writes_shared_state() {
                out.push(
                    Connection::new(
                        atom.id.clone(),
                        format!("state:{}", key),
                        ConnectionKind::TemporalDependency {
                            relation: TemporalRelation::ConcurrentWrite,
                            phase: execution_phase(atom),
                            potential_race: true,
                        },
                        0.6,
                    )
                    .with_relationship("concurrent-write")
                    .with_evidence(format!("async write to {}", key)),
                );
            }
        }
        Ok(out)
    }
}

/// Connections carried over from an atom's ancestor.
pub struct LineageDetector;

impl ConnectionDetector for LineageDetector {
    fn name(&self) -> &'static str {
        "lineage"
    }

    fn detect(&self, input: &FusionInput<'_>) -> Result<Vec<Connection>> {
        let mut out = Vec::new();
        for atom in input.atoms() {
            let Some(ancestry) = &atom.ancestry else {
                continue;
            };
            for edge in &ancestry.inherited {
                let connection = if input.atom(&edge.target).is_some() {
                    Connection::new(
                        atom.id.clone(),
                        edge.target.clone(),
                        ConnectionKind::Inherited {
                            ancestor: ancestry.ancestor_id.clone(),
                            generation: ancestry.generation,
                            vibration: ancestry.vibration_score,
                        },
                        (edge.strength * ancestry.vibration_score).clamp(0.0, 1.0),
                    )
                } else {
                    Connection::new(
                        atom.id.clone(),
                        edge.target.clone(),
                        ConnectionKind::Ruptured {
                            ancestor: ancestry.ancestor_id.clone(),
                            generation: ancestry.generation,
                        },
                        edge.strength.clamp(0.0, 1.0),
                    )
                    .with_evidence(format!("{} no longer exists", edge.target))
                };
                out.push(connection.with_relationship(edge.relationship.clone()));
            }
        }
        Ok(out)
    }
}

/// Writer -> reader links per shared mutable key.
pub struct SharedStateDetector;

impl ConnectionDetector for SharedStateDetector {
    fn name(&self) -> &'static str {
        "shared-state"
    }

    fn detect(&self, input: &FusionInput<'_>) -> Result<Vec<Connection>> {
        let mut writers: BTreeMap<&str, Vec<&Atom>> = BTreeMap::new();
        let mut readers: BTreeMap<&str, Vec<&Atom>> = BTreeMap::new();
        for atom in input.atoms() {
            for access in &atom.shared_state {
                let bucket = match access.mode {
                    StateAccessMode::Write => &mut writers,
                    StateAccessMode::Read => &mut readers,
                };
                bucket.entry(access.key.as_str()).or_default().push(atom);
            }
        }

        let mut out = Vec::new();
        for (key, writers) in &writers {
            for reader in readers.get(key).into_iter().flatten() {
                for writer in writers.iter().filter(|w| w.id != reader.id) {
                    let cross = file_of(&writer.id) != file_of(&reader.id);
                    out.push(
                        Connection::new(
                            writer.id.clone(),
                            reader.id.clone(),
                            ConnectionKind::SharedState {
                                key: key.to_string(),
                            },
                            0.8,
                        )
                        .with_relationship(if cross {
                            "shares-state-across-files"
                        } else {
                            "shares-state"
                        })
                        .with_evidence(format!("{} writes {} read by {}", writer.name, key, reader.name)),
                    );
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionInput;
    use atomgraph_core::{
        Ancestry, AtomKind, ConnectionStatus, ExtractionResult, FileAnalysis, InheritedEdge,
        TemporalSignals,
    };

    fn analyses(atoms: Vec<Atom>) -> BTreeMap<String, FileAnalysis> {
        let mut by_file: BTreeMap<String, Vec<Atom>> = BTreeMap::new();
        for atom in atoms {
            by_file.entry(atom.file_path.clone()).or_default().push(atom);
        }
        by_file
            .into_iter()
            .map(|(path, atoms)| {
                let extraction = ExtractionResult {
                    atoms,
                    ..Default::default()
                };
                let analysis = FileAnalysis::from_extraction(path.clone(), "", extraction);
                (path, analysis)
            })
            .collect()
    }

    #[test]
    fn data_flow_matches_normalised_types_and_skips_trivial() {
        let map = analyses(vec![
            Atom::new("a.ts", "loadUser", AtomKind::Function)
                .with_signature(vec![], Some("Promise< User >".into())),
            Atom::new("b.ts", "render", AtomKind::Function)
                .with_signature(vec!["User".into()], None),
            Atom::new("b.ts", "log", AtomKind::Function)
                .with_signature(vec!["void".into()], Some("void".into())),
        ]);
        let input = FusionInput::new(&map);
        let found = DataFlowDetector.detect(&input).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].from, "a.ts::loadUser");
        assert_eq!(found[0].to, "b.ts::render");
        assert_eq!(found[0].confidence, 0.7);
    }

    #[test]
    fn initializers_run_before_their_subject() {
        let map = analyses(vec![
            Atom::new("db.js", "initDatabase", AtomKind::Function),
            Atom::new("db.js", "queryDatabase", AtomKind::Function),
            Atom::new("api.js", "databaseHealth", AtomKind::Function),
        ]);
        let input = FusionInput::new(&map);
        let found = TemporalDetector.detect(&input).unwrap();
        let same_file = found.iter().find(|c| c.to == "db.js::queryDatabase").unwrap();
        assert_eq!(same_file.confidence, 0.75);
        let cross = found.iter().find(|c| c.to == "api.js::databaseHealth").unwrap();
        assert_eq!(cross.confidence, 0.6);
        assert!(matches!(
            cross.kind,
            ConnectionKind::TemporalDependency {
                phase: ExecutionPhase::Init,
                ..
            }
        ));
    }

    #[test]
    fn async_state_writers_are_race_flagged() {
        let map = analyses(vec![Atom::new("s.js", "save", AtomKind::Function)
            .asynchronous()
            .with_shared_state("session", StateAccessMode::Write)]);
        let input = FusionInput::new(&map);
        let found = TemporalDetector.detect(&input).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to, "state:session");
        assert_eq!(found[0].potential_race(), Some(ExecutionPhase::Runtime));
    }

    #[test]
    fn phases_follow_names_and_hooks() {
        let teardown = Atom::new("c.js", "closeSocket", AtomKind::Function);
        assert_eq!(execution_phase(&teardown), ExecutionPhase::Teardown);
        let mounted = Atom::new("c.js", "render", AtomKind::Function).with_temporal(
            TemporalSignals {
                lifecycle_hooks: vec!["onMounted".into()],
                ..Default::default()
            },
        );
        assert_eq!(execution_phase(&mounted), ExecutionPhase::Init);
    }

    #[test]
    fn lineage_yields_inherited_or_ruptured() {
        let ancestry = Ancestry {
            ancestor_id: "old.js::f".into(),
            generation: 2,
            vibration_score: 0.9,
            inherited: vec![
                InheritedEdge {
                    target: "b.js::g".into(),
                    relationship: "calls".into(),
                    strength: 0.5,
                },
                InheritedEdge {
                    target: "gone.js::h".into(),
                    relationship: "calls".into(),
                    strength: 0.5,
                },
            ],
        };
        let map = analyses(vec![
            Atom::new("a.js", "f", AtomKind::Function).with_ancestry(ancestry),
            Atom::new("b.js", "g", AtomKind::Function),
        ]);
        let input = FusionInput::new(&map);
        let found = LineageDetector.detect(&input).unwrap();
        assert_eq!(found.len(), 2);
        let inherited = found.iter().find(|c| c.to == "b.js::g").unwrap();
        assert_eq!(inherited.type_name(), "inherited");
        assert!((inherited.confidence - 0.45).abs() < 1e-9);
        let ruptured = found.iter().find(|c| c.to == "gone.js::h").unwrap();
        assert_eq!(ruptured.type_name(), "ruptured");
        assert_eq!(ruptured.status, ConnectionStatus::Broken);
    }

    #[test]
    fn shared_state_links_writers_to_readers() {
        let map = analyses(vec![
            Atom::new("a.js", "setUser", AtomKind::Function)
                .with_shared_state("user", StateAccessMode::Write),
            Atom::new("b.js", "showUser", AtomKind::Function)
                .with_shared_state("user", StateAccessMode::Read),
        ]);
        let input = FusionInput::new(&map);
        let found = SharedStateDetector.detect(&input).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].confidence, 0.8);
        assert_eq!(found[0].relationship, "shares-state-across-files");
    }
}
