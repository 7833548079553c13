use atomgraph_core::{Connection, ConnectionKind, ExecutionPhase, TemporalRelation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    TemporalCycle,
    PotentialRace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Critical,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub description: String,
    /// Cycle members in traversal order; empty for races.
    #[serde(default)]
    pub cycle: Vec<String>,
    /// The two racing writers; empty for cycles.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// What each writer in `endpoints` writes, in the same order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    pub suggested_fix: Option<String>,
}

pub fn detect_conflicts(connections: &[Connection]) -> Vec<Conflict> {
    let mut conflicts = temporal_cycles(connections);
    conflicts.extend(potential_races(connections));
    conflicts
}

fn is_must_run_before(connection: &Connection) -> bool {
    matches!(
        connection.kind,
        ConnectionKind::TemporalDependency {
            relation: TemporalRelation::MustRunBefore,
            ..
        }
    )
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Cycles in the must-run-before subgraph, each reported once and rotated
/// to start at its smallest member.
pub fn temporal_cycles(connections: &[Connection]) -> Vec<Conflict> {
    let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for c in connections.iter().filter(|c| is_must_run_before(c)) {
        adjacency.entry(c.from.as_str()).or_default().insert(c.to.as_str());
        adjacency.entry(c.to.as_str()).or_default();
    }

    let mut marks: BTreeMap<&str, Mark> = adjacency.keys().map(|k| (*k, Mark::White)).collect();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut cycles = Vec::new();

    let roots: Vec<&str> = adjacency.keys().copied().collect();
    for root in roots {
        if marks.get(root) != Some(&Mark::White) {
            continue;
        }
        // Iterative DFS; `path` mirrors the gray nodes on the stack.
        let mut stack: Vec<(&str, Vec<&str>)> = Vec::new();
        let mut path: Vec<&str> = Vec::new();
        marks.insert(root, Mark::Gray);
        path.push(root);
        stack.push((root, adjacency[root].iter().rev().copied().collect()));

        while let Some((node, pending)) = stack.last_mut() {
            let Some(next) = pending.pop() else {
                marks.insert(*node, Mark::Black);
                path.pop();
                stack.pop();
                continue;
            };
            match marks.get(next).copied().unwrap_or(Mark::White) {
                Mark::White => {
                    marks.insert(next, Mark::Gray);
                    path.push(next);
                    stack.push((next, adjacency[next].iter().rev().copied().collect()));
                }
                Mark::Gray => {
                    if let Some(start) = path.iter().position(|n| *n == next) {
                        let cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                        let cycle = canonical(&cycle);
                        if seen.insert(cycle.clone()) {
                            cycles.push(cycle);
                        }
                    }
                }
                Mark::Black => {}
            }
        }
    }

    cycles
        .into_iter()
        .map(|cycle| {
            let mut rendered = cycle.join(" -> ");
            if let Some(first) = cycle.first() {
                rendered.push_str(" -> ");
                rendered.push_str(first);
            }
            Conflict {
                kind: ConflictKind::TemporalCycle,
                severity: ConflictSeverity::Critical,
                description: format!("Circular must-run-before ordering: {}", rendered),
                suggested_fix: Some(format!(
                    "Break the cycle by moving initialisation out of {} or deferring it",
                    cycle.last().cloned().unwrap_or_default()
                )),
                cycle,
                endpoints: Vec::new(),
                targets: Vec::new(),
            }
        })
        .collect()
}

/// Rotation starting at the smallest member.
fn canonical(cycle: &[String]) -> Vec<String> {
    let Some(min_at) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    else {
        return Vec::new();
    };
    cycle[min_at..]
        .iter()
        .chain(cycle[..min_at].iter())
        .cloned()
        .collect()
}

/// Pairs of race-flagged connections that run in the same execution phase.
/// Two edges from the same writer never race with each other.
pub fn potential_races(connections: &[Connection]) -> Vec<Conflict> {
    let mut groups: BTreeMap<ExecutionPhase, BTreeSet<(&str, &str)>> = BTreeMap::new();
    for c in connections {
        if let Some(phase) = c.potential_race() {
            groups
                .entry(phase)
                .or_default()
                .insert((c.from.as_str(), c.to.as_str()));
        }
    }

    let mut conflicts = Vec::new();
    for (phase, edges) in groups {
        let edges: Vec<(&str, &str)> = edges.into_iter().collect();
        for (i, (a, a_target)) in edges.iter().enumerate() {
            for (b, b_target) in edges[i + 1..].iter().filter(|(b, _)| b != a) {
                let description = if a_target == b_target {
                    format!("{} and {} both write {} during {}", a, b, a_target, phase)
                } else {
                    format!(
                        "{} writes {} and {} writes {} concurrently during {}",
                        a, a_target, b, b_target, phase
                    )
                };
                conflicts.push(Conflict {
                    kind: ConflictKind::PotentialRace,
                    severity: ConflictSeverity::Warning,
                    description,
                    cycle: Vec::new(),
                    endpoints: vec![a.to_string(), b.to_string()],
                    targets: vec![a_target.to_string(), b_target.to_string()],
                    suggested_fix: Some(format!(
                        "Order {} and {} explicitly or serialise their writes",
                        a, b
                    )),
                });
            }
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn before(from: &str, to: &str) -> Connection {
        Connection::new(
            from,
            to,
            ConnectionKind::TemporalDependency {
                relation: TemporalRelation::MustRunBefore,
                phase: ExecutionPhase::Init,
                potential_race: false,
            },
            0.75,
        )
    }

    fn racing(from: &str, key: &str, phase: ExecutionPhase) -> Connection {
        Connection::new(
            from,
            format!("state:{}", key),
            ConnectionKind::TemporalDependency {
                relation: TemporalRelation::ConcurrentWrite,
                phase,
                potential_race: true,
            },
            0.6,
        )
    }

    #[test]
    fn three_node_cycle_is_reported_once() {
        let conflicts = detect_conflicts(&[before("A", "B"), before("B", "C"), before("C", "A")]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::TemporalCycle);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Critical);
        assert_eq!(conflicts[0].cycle, vec!["A", "B", "C"]);
        assert!(conflicts[0].suggested_fix.is_some());
    }

    #[test]
    fn acyclic_ordering_has_no_conflicts() {
        assert!(detect_conflicts(&[before("A", "B"), before("B", "C"), before("A", "C")]).is_empty());
    }

    #[test]
    fn non_ordering_edges_do_not_form_cycles() {
        let call = Connection::new("C", "A", ConnectionKind::Call, 1.0);
        assert!(detect_conflicts(&[before("A", "B"), before("B", "C"), call]).is_empty());
    }

    #[test]
    fn cycle_entered_from_outside_starts_at_smallest_member() {
        let conflicts = detect_conflicts(&[
            before("A", "C"),
            before("C", "D"),
            before("D", "B"),
            before("B", "C"),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].cycle, vec!["B", "C", "D"]);
    }

    #[test]
    fn races_pair_writers_in_the_same_phase() {
        let conflicts = detect_conflicts(&[
            racing("a.js::save", "session", ExecutionPhase::Runtime),
            racing("b.js::store", "cart", ExecutionPhase::Runtime),
            racing("c.js::boot", "session", ExecutionPhase::Init),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::PotentialRace);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Warning);
        assert_eq!(conflicts[0].endpoints, vec!["a.js::save", "b.js::store"]);
        assert_eq!(conflicts[0].targets, vec!["state:session", "state:cart"]);
    }

    #[test]
    fn one_writer_does_not_race_itself() {
        let conflicts = detect_conflicts(&[
            racing("a.js::save", "session", ExecutionPhase::Runtime),
            racing("a.js::save", "cart", ExecutionPhase::Runtime),
        ]);
        assert!(conflicts.is_empty());
    }
}
