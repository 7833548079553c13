use atomgraph_core::{ChangeType, FileCacheEntry};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one invalidation cascade.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub origin: String,
    /// Files marked stale, in visit order.
    pub invalidated: Vec<String>,
    pub cycle_detected: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    OnPath,
    Done,
}

/// File-level dependency graph. Owns every [`FileCacheEntry`].
///
/// Each mutation, including a full invalidation cascade, runs under a single
/// write lock, so readers see either the state before it or after it.
#[derive(Default)]
pub struct DependencyGraph {
    entries: RwLock<BTreeMap<String, FileCacheEntry>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fresh analysis of `file`: hash replaced, version bumped,
    /// static analysis marked done.
    pub fn record_analysis(&self, file: &str, content_hash: &str, change_type: ChangeType) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(file.to_string())
            .or_insert_with(|| FileCacheEntry::new(file));
        entry.content_hash = Some(content_hash.to_string());
        entry.static_hash = Some(content_hash.to_string());
        entry.change_type = change_type;
        entry.version += 1;
        entry.static_analyzed = true;
        if change_type >= ChangeType::Static {
            entry.llm_analyzed = false;
            entry.llm_hash = None;
        }
    }

    pub fn mark_static_analyzed(&self, file: &str) {
        if let Some(entry) = self.entries.write().get_mut(file) {
            entry.static_analyzed = true;
        }
    }

    pub fn mark_llm_analyzed(&self, file: &str, insight_hash: &str) {
        if let Some(entry) = self.entries.write().get_mut(file) {
            entry.llm_analyzed = true;
            entry.llm_hash = Some(insight_hash.to_string());
        }
    }

    /// Replaces `file`'s dependencies and keeps every `used_by` list in step.
    /// Unknown dependencies get placeholder entries.
    pub fn update_dependencies<S: AsRef<str>>(&self, file: &str, deps: &[S]) {
        let mut entries = self.entries.write();
        let new_deps: BTreeSet<String> = deps
            .iter()
            .map(|d| d.as_ref().to_string())
            .filter(|d| d != file)
            .collect();

        let old_deps = entries
            .entry(file.to_string())
            .or_insert_with(|| FileCacheEntry::new(file))
            .depends_on
            .clone();

        for removed in old_deps.difference(&new_deps) {
            if let Some(dep) = entries.get_mut(removed) {
                dep.used_by.remove(file);
            }
        }
        for dep in &new_deps {
            entries
                .entry(dep.clone())
                .or_insert_with(|| FileCacheEntry::new(dep.as_str()))
                .used_by
                .insert(file.to_string());
        }
        if let Some(entry) = entries.get_mut(file) {
            entry.depends_on = new_deps;
        }
        Self::drop_orphan_placeholders(&mut entries);
    }

    /// Marks every transitive dependent of `file` stale. `file` itself is only
    /// marked when it sits on a dependency cycle.
    pub fn invalidate_dependents(&self, file: &str) -> InvalidationReport {
        let mut entries = self.entries.write();
        let mut visits = BTreeMap::new();
        let mut report = InvalidationReport {
            origin: file.to_string(),
            ..Default::default()
        };
        Self::cascade(&mut entries, file, &mut visits, &mut report);
        Self::finish(report)
    }

    /// Removes `file`, strips it from every list and invalidates its former
    /// dependents. Returns `None` when the file was never tracked.
    pub fn remove_file(&self, file: &str) -> Option<InvalidationReport> {
        let mut entries = self.entries.write();
        let removed = entries.remove(file)?;

        for dep in &removed.depends_on {
            if let Some(entry) = entries.get_mut(dep) {
                entry.used_by.remove(file);
            }
        }
        for entry in entries.values_mut() {
            entry.depends_on.remove(file);
            entry.used_by.remove(file);
        }

        let mut visits = BTreeMap::new();
        let mut report = InvalidationReport {
            origin: file.to_string(),
            ..Default::default()
        };
        for dependent in &removed.used_by {
            if visits.contains_key(dependent.as_str()) {
                continue;
            }
            if let Some(entry) = entries.get_mut(dependent) {
                entry.invalidate();
                report.invalidated.push(dependent.clone());
            }
            Self::cascade(&mut entries, dependent, &mut visits, &mut report);
        }
        Self::drop_orphan_placeholders(&mut entries);
        Some(Self::finish(report))
    }

    /// Iterative DFS over `used_by`. A node met again while still on the
    /// current path closes a cycle.
    fn cascade(
        entries: &mut BTreeMap<String, FileCacheEntry>,
        start: &str,
        visits: &mut BTreeMap<String, Visit>,
        report: &mut InvalidationReport,
    ) {
        let children = |entries: &BTreeMap<String, FileCacheEntry>, node: &str| -> Vec<String> {
            entries
                .get(node)
                .map(|e| e.used_by.iter().rev().cloned().collect())
                .unwrap_or_default()
        };

        visits.insert(start.to_string(), Visit::OnPath);
        let mut stack: Vec<(String, Vec<String>)> =
            vec![(start.to_string(), children(entries, start))];

        while let Some((node, pending)) = stack.last_mut() {
            let Some(next) = pending.pop() else {
                visits.insert(node.clone(), Visit::Done);
                stack.pop();
                continue;
            };
            match visits.get(&next).copied() {
                None => {
                    if let Some(entry) = entries.get_mut(&next) {
                        entry.invalidate();
                    }
                    report.invalidated.push(next.clone());
                    visits.insert(next.clone(), Visit::OnPath);
                    let grandchildren = children(entries, &next);
                    stack.push((next, grandchildren));
                }
                Some(Visit::OnPath) => {
                    report.cycle_detected = true;
                    if next == report.origin && !report.invalidated.contains(&next) {
                        if let Some(entry) = entries.get_mut(&next) {
                            entry.invalidate();
                        }
                        report.invalidated.push(next);
                    }
                }
                Some(Visit::Done) => {}
            }
        }
    }

    fn finish(report: InvalidationReport) -> InvalidationReport {
        if report.cycle_detected {
            warn!(
                "Dependency cycle detected while invalidating dependents of {}",
                report.origin
            );
        }
        debug!(
            "Invalidated {} dependent(s) of {}",
            report.invalidated.len(),
            report.origin
        );
        report
    }

    /// Placeholders exist only to anchor `used_by`; drop them once nothing
    /// depends on them.
    fn drop_orphan_placeholders(entries: &mut BTreeMap<String, FileCacheEntry>) {
        entries.retain(|_, e| !(e.is_placeholder() && e.used_by.is_empty() && e.depends_on.is_empty()));
    }

    pub fn entry(&self, file: &str) -> Option<FileCacheEntry> {
        self.entries.read().get(file).cloned()
    }

    pub fn contains(&self, file: &str) -> bool {
        self.entries.read().contains_key(file)
    }

    pub fn files(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Files that directly depend on `file`.
    pub fn dependents(&self, file: &str) -> Vec<String> {
        self.entries
            .read()
            .get(file)
            .map(|e| e.used_by.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependencies(&self, file: &str) -> Vec<String> {
        self.entries
            .read()
            .get(file)
            .map(|e| e.depends_on.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Breadth-first closure over `used_by`, excluding `file` itself.
    pub fn transitive_dependents(&self, file: &str) -> Vec<String> {
        transitive_used_by(&self.entries.read(), file)
    }

    /// Consistent copy of every entry, taken under one read lock.
    pub fn entries_snapshot(&self) -> BTreeMap<String, FileCacheEntry> {
        self.entries.read().clone()
    }

    /// Pairs `(a, b)` where exactly one side of the `used_by`/`depends_on`
    /// relation records the edge `b depends on a`.
    pub fn symmetry_violations(&self) -> Vec<(String, String)> {
        let entries = self.entries.read();
        let mut violations = Vec::new();
        for (path, entry) in entries.iter() {
            for dependent in &entry.used_by {
                let ok = entries
                    .get(dependent)
                    .map(|d| d.depends_on.contains(path))
                    .unwrap_or(false);
                if !ok {
                    violations.push((path.clone(), dependent.clone()));
                }
            }
            for dep in &entry.depends_on {
                let ok = entries
                    .get(dep)
                    .map(|d| d.used_by.contains(path))
                    .unwrap_or(false);
                if !ok {
                    violations.push((dep.clone(), path.clone()));
                }
            }
        }
        violations.sort();
        violations.dedup();
        violations
    }

    /// Elementary cycles over `depends_on`, one per back edge, each starting at
    /// its smallest path.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let entries = self.entries.read();
        let mut visits: BTreeMap<&str, Visit> = BTreeMap::new();
        let mut cycles: BTreeSet<Vec<String>> = BTreeSet::new();

        for root in entries.keys() {
            if visits.contains_key(root.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = vec![root.as_str()];
            let mut stack: Vec<(&str, Vec<&str>)> = vec![(
                root.as_str(),
                entries[root].depends_on.iter().rev().map(|s| s.as_str()).collect(),
            )];
            visits.insert(root.as_str(), Visit::OnPath);

            while let Some((node, pending)) = stack.last_mut() {
                let Some(next) = pending.pop() else {
                    visits.insert(*node, Visit::Done);
                    path.pop();
                    stack.pop();
                    continue;
                };
                match visits.get(next).copied() {
                    None => {
                        visits.insert(next, Visit::OnPath);
                        path.push(next);
                        let deps = entries
                            .get(next)
                            .map(|e| e.depends_on.iter().rev().map(|s| s.as_str()).collect())
                            .unwrap_or_default();
                        stack.push((next, deps));
                    }
                    Some(Visit::OnPath) => {
                        if let Some(start) = path.iter().position(|p| *p == next) {
                            let cycle = &path[start..];
                            let min_at = cycle
                                .iter()
                                .enumerate()
                                .min_by_key(|(_, p)| **p)
                                .map(|(i, _)| i)
                                .unwrap_or(0);
                            let rotated: Vec<String> = cycle[min_at..]
                                .iter()
                                .chain(cycle[..min_at].iter())
                                .map(|s| s.to_string())
                                .collect();
                            cycles.insert(rotated);
                        }
                    }
                    Some(Visit::Done) => {}
                }
            }
        }
        cycles.into_iter().collect()
    }
}

/// Read-only handle on a graph whose mutations belong to someone else.
#[derive(Clone)]
pub struct DependencyView {
    graph: Arc<DependencyGraph>,
}

impl DependencyView {
    pub(crate) fn new(graph: Arc<DependencyGraph>) -> Self {
        Self { graph }
    }

    pub fn entry(&self, file: &str) -> Option<FileCacheEntry> {
        self.graph.entry(file)
    }

    pub fn contains(&self, file: &str) -> bool {
        self.graph.contains(file)
    }

    pub fn files(&self) -> Vec<String> {
        self.graph.files()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn dependents(&self, file: &str) -> Vec<String> {
        self.graph.dependents(file)
    }

    pub fn dependencies(&self, file: &str) -> Vec<String> {
        self.graph.dependencies(file)
    }

    pub fn transitive_dependents(&self, file: &str) -> Vec<String> {
        self.graph.transitive_dependents(file)
    }

    pub fn entries_snapshot(&self) -> BTreeMap<String, FileCacheEntry> {
        self.graph.entries_snapshot()
    }

    pub fn symmetry_violations(&self) -> Vec<(String, String)> {
        self.graph.symmetry_violations()
    }

    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        self.graph.find_cycles()
    }
}

/// Breadth-first closure over `used_by` in visit order, excluding `file`.
pub fn transitive_used_by(entries: &BTreeMap<String, FileCacheEntry>, file: &str) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(file);
    let mut queue: VecDeque<&str> = VecDeque::from([file]);
    let mut out = Vec::new();
    while let Some(node) = queue.pop_front() {
        let Some(entry) = entries.get(node) else {
            continue;
        };
        for dependent in &entry.used_by {
            if seen.insert(dependent.as_str()) {
                out.push(dependent.clone());
                queue.push_back(dependent.as_str());
            }
        }
    }
    out
}
