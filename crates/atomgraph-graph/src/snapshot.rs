use crate::fusion::Conflict;
use crate::gate::GateOutcome;
use atomgraph_core::{split_atom_id, Atom, Connection, FileAnalysis, FileCacheEntry};
use serde::Serialize;
use std::collections::BTreeMap;

/// Immutable view of the knowledge graph published after each batch.
///
/// Queries only ever read a snapshot, so an invalidation cascade is either
/// fully visible or not visible at all.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSnapshot {
    pub analyses: BTreeMap<String, FileAnalysis>,
    pub entries: BTreeMap<String, FileCacheEntry>,
    pub connections: Vec<Connection>,
    pub conflicts: Vec<Conflict>,
    pub gate_outcomes: BTreeMap<String, GateOutcome>,
    /// False until the first batch has been processed.
    pub ready: bool,
    pub generation: u64,
}

impl KnowledgeSnapshot {
    pub fn analysis(&self, file: &str) -> Option<&FileAnalysis> {
        self.analyses.get(file)
    }

    pub fn entry(&self, file: &str) -> Option<&FileCacheEntry> {
        self.entries.get(file)
    }

    pub fn atom(&self, id: &str) -> Option<&Atom> {
        let (file, _) = split_atom_id(id)?;
        self.analyses.get(file)?.atoms.iter().find(|a| a.id == id)
    }

    /// Connections with either endpoint in `file`.
    pub fn connections_touching<'a>(&'a self, file: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| {
            crate::fusion::endpoint_file(&c.from) == file || crate::fusion::endpoint_file(&c.to) == file
        })
    }

    pub fn atom_count(&self) -> usize {
        self.analyses.values().map(|a| a.atoms.len()).sum()
    }
}
