use atomgraph_core::{AtomId, ExportKind, FileAnalysis, ImportRecord};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Lookup tables for resolving raw callee names to atom ids.
struct SymbolTable<'a> {
    ids: HashSet<AtomId>,
    by_file_name: HashMap<(&'a str, &'a str), AtomId>,
    /// file -> exported name -> atom id; the default export is keyed `default`
    exports: HashMap<&'a str, HashMap<String, AtomId>>,
    imports: HashMap<&'a str, &'a [ImportRecord]>,
}

impl<'a> SymbolTable<'a> {
    fn build(analyses: &'a BTreeMap<String, FileAnalysis>) -> Self {
        let mut table = SymbolTable {
            ids: HashSet::new(),
            by_file_name: HashMap::new(),
            exports: HashMap::new(),
            imports: HashMap::new(),
        };

        for (path, analysis) in analyses {
            let path = path.as_str();
            let mut exported: HashMap<String, AtomId> = HashMap::new();
            for atom in &analysis.atoms {
                table.ids.insert(atom.id.clone());
                table
                    .by_file_name
                    .insert((path, atom.name.as_str()), atom.id.clone());
                if atom.is_exported {
                    exported.insert(atom.name.clone(), atom.id.clone());
                }
            }
            for export in &analysis.exports {
                let Some(id) = table.by_file_name.get(&(path, export.name.as_str())).cloned()
                else {
                    continue;
                };
                match export.kind {
                    ExportKind::Default => {
                        exported.insert("default".to_string(), id);
                    }
                    ExportKind::Named => {
                        exported.insert(export.name.clone(), id);
                    }
                }
            }
            table.exports.insert(path, exported);
            table.imports.insert(path, analysis.imports.as_slice());
        }
        table
    }

    fn exported(&self, file: &str, name: &str) -> Option<AtomId> {
        self.exports.get(file).and_then(|m| m.get(name)).cloned()
    }

    fn resolve(&self, file: &str, raw: &str) -> Option<AtomId> {
        if self.ids.contains(raw) {
            return Some(raw.to_string());
        }
        if let Some(id) = self.by_file_name.get(&(file, raw)) {
            return Some(id.clone());
        }

        let imports = self.imports.get(file)?;
        for import in imports.iter() {
            for spec in &import.specifiers {
                if spec.is_namespace() {
                    let member = raw
                        .strip_prefix(spec.local.as_str())
                        .and_then(|rest| rest.strip_prefix('.'));
                    if let Some(found) = member.and_then(|m| self.exported(&import.source, m)) {
                        return Some(found);
                    }
                } else if spec.local == raw {
                    if let Some(found) = self.exported(&import.source, &spec.imported) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }
}

/// Resolves every atom's `calls` to atom ids where possible and rebuilds
/// `called_by` as their exact transpose. Unresolved names are kept as-is.
/// Returns the number of resolved call edges.
pub fn link_calls(analyses: &mut BTreeMap<String, FileAnalysis>) -> usize {
    let resolved: Vec<(String, Vec<Vec<String>>)> = {
        let table = SymbolTable::build(analyses);
        analyses
            .iter()
            .map(|(path, analysis)| {
                let per_atom = analysis
                    .atoms
                    .iter()
                    .map(|atom| {
                        let mut seen = HashSet::new();
                        atom.calls
                            .iter()
                            .map(|raw| table.resolve(path, raw).unwrap_or_else(|| raw.clone()))
                            .filter(|call| seen.insert(call.clone()))
                            .collect()
                    })
                    .collect();
                (path.clone(), per_atom)
            })
            .collect()
    };

    for (path, per_atom) in resolved {
        if let Some(analysis) = analyses.get_mut(&path) {
            for (atom, calls) in analysis.atoms.iter_mut().zip(per_atom) {
                atom.calls = calls;
            }
        }
    }

    let ids: HashSet<AtomId> = analyses
        .values()
        .flat_map(|a| a.atoms.iter().map(|atom| atom.id.clone()))
        .collect();
    let mut callers: HashMap<AtomId, BTreeSet<AtomId>> = HashMap::new();
    for atom in analyses.values().flat_map(|a| a.atoms.iter()) {
        for callee in atom.calls.iter().filter(|c| ids.contains(*c)) {
            callers
                .entry(callee.clone())
                .or_default()
                .insert(atom.id.clone());
        }
    }

    let mut edges = 0;
    for atom in analyses.values_mut().flat_map(|a| a.atoms.iter_mut()) {
        atom.called_by = callers
            .remove(&atom.id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        edges += atom.called_by.len();
    }
    edges
}
