//! Atom purpose classification and file archetype aggregation.
//!
//! Each rule is an independent function; the cascade order lives in
//! [`PurposeClassifier::standard`] and the first rule that matches wins.

use atomgraph_core::{
    ArchetypeKind, Atom, AtomKind, FileAnalysis, FileArchetype, Purpose, PurposeInfo,
};
use std::collections::BTreeMap;

/// Role of a file inferred from its path alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Test,
    Script,
    Config,
    TypeDefinition,
    Source,
}

impl FileClass {
    pub fn of(path: &str) -> FileClass {
        let lower = path.to_lowercase().replace('\\', "/");
        let name = lower.rsplit('/').next().unwrap_or(lower.as_str());
        let in_dir = |dir: &str| lower.starts_with(&format!("{}/", dir)) || lower.contains(&format!("/{}/", dir));

        if name.contains(".test.")
            || name.contains(".spec.")
            || name.starts_with("test_")
            || in_dir("__tests__")
            || in_dir("test")
            || in_dir("tests")
        {
            FileClass::Test
        } else if name.ends_with(".d.ts") || in_dir("types") || name.starts_with("types.") {
            FileClass::TypeDefinition
        } else if in_dir("scripts") || in_dir("bin") {
            FileClass::Script
        } else if in_dir("config")
            || name.contains(".config.")
            || name.starts_with("config.")
            || name.starts_with("constants.")
            || name.starts_with("settings.")
        {
            FileClass::Config
        } else {
            FileClass::Source
        }
    }
}

/// What a purpose rule may look at.
pub struct PurposeContext<'a> {
    pub atom: &'a Atom,
    pub file_class: FileClass,
}

pub type PurposeCheck = fn(&PurposeContext<'_>) -> Option<PurposeInfo>;

#[derive(Clone)]
pub struct PurposeRule {
    pub name: &'static str,
    pub check: PurposeCheck,
}

fn exported(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    ctx.atom
        .is_exported
        .then(|| PurposeInfo::new(Purpose::ApiExport, "exported from its module", 0.95))
}

fn test_file(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    (ctx.file_class == FileClass::Test)
        .then(|| PurposeInfo::new(Purpose::TestHelper, "defined in a test file", 0.9))
}

fn script_file(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    (ctx.file_class == FileClass::Script)
        .then(|| PurposeInfo::new(Purpose::ScriptMain, "defined in a script", 0.85))
}

fn config_file(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    (ctx.file_class == FileClass::Config)
        .then(|| PurposeInfo::new(Purpose::ConfigSetup, "defined in a config module", 0.85))
}

fn class_method(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    (ctx.atom.kind == AtomKind::ClassMethod)
        .then(|| PurposeInfo::new(Purpose::ClassMethod, "class method", 0.8))
}

fn lifecycle_or_events(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    ctx.atom.temporal.is_event_driven().then(|| {
        PurposeInfo::new(
            Purpose::EventHandler,
            "registers lifecycle hooks or event listeners",
            0.85,
        )
    })
}

fn timers_or_async_effects(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    let atom = ctx.atom;
    (atom.temporal.timers || (atom.is_async && atom.side_effects.any())).then(|| {
        PurposeInfo::new(
            Purpose::TimerAsync,
            "uses timers or async side effects",
            0.8,
        )
    })
}

fn network(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    ctx.atom
        .side_effects
        .network
        .then(|| PurposeInfo::new(Purpose::NetworkHandler, "performs network calls", 0.8))
}

fn dom_or_global(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    let effects = &ctx.atom.side_effects;
    (effects.dom || effects.global_access).then(|| {
        PurposeInfo::new(
            Purpose::EventHandler,
            "manipulates the DOM or global state",
            0.7,
        )
    })
}

fn archetype_hint(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    match ctx.atom.archetype.as_ref().map(|a| &a.kind)? {
        ArchetypeKind::HotPath => Some(PurposeInfo::new(
            Purpose::ApiExport,
            "hot path archetype",
            0.75,
        )),
        ArchetypeKind::Validator | ArchetypeKind::Transformer => Some(PurposeInfo::new(
            Purpose::InternalHelper,
            "validator or transformer archetype",
            0.75,
        )),
        _ => None,
    }
}

fn has_callers(ctx: &PurposeContext<'_>) -> Option<PurposeInfo> {
    (!ctx.atom.called_by.is_empty()).then(|| {
        PurposeInfo::new(
            Purpose::InternalHelper,
            format!("called by {} atom(s)", ctx.atom.called_by.len()),
            0.75,
        )
    })
}

fn dead_code() -> PurposeInfo {
    let mut info = PurposeInfo::new(Purpose::DeadCode, "no rule matched", 0.5);
    info.is_dead = true;
    info
}

fn rule(name: &'static str, check: PurposeCheck) -> PurposeRule {
    PurposeRule { name, check }
}

pub struct PurposeClassifier {
    rules: Vec<PurposeRule>,
}

impl PurposeClassifier {
    pub fn standard() -> Self {
        Self::with_rules(vec![
            rule("exported", exported),
            rule("test-file", test_file),
            rule("script-file", script_file),
            rule("config-file", config_file),
            rule("class-method", class_method),
            rule("lifecycle-or-events", lifecycle_or_events),
            rule("timers-or-async-effects", timers_or_async_effects),
            rule("network", network),
            rule("dom-or-global", dom_or_global),
            rule("archetype-hint", archetype_hint),
            rule("has-callers", has_callers),
        ])
    }

    pub fn with_rules(rules: Vec<PurposeRule>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    pub fn classify(&self, atom: &Atom, file_class: FileClass) -> PurposeInfo {
        let ctx = PurposeContext { atom, file_class };
        self.rules
            .iter()
            .find_map(|rule| (rule.check)(&ctx))
            .unwrap_or_else(dead_code)
    }

    /// Assigns a purpose to every atom and an archetype to every file.
    /// `dependents` gives each file's `usedBy` count.
    pub fn apply<F>(&self, analyses: &mut BTreeMap<String, FileAnalysis>, dependents: F)
    where
        F: Fn(&str) -> usize,
    {
        for (path, analysis) in analyses.iter_mut() {
            let class = FileClass::of(path);
            for atom in analysis.atoms.iter_mut() {
                atom.purpose = Some(self.classify(atom, class));
            }
            analysis.file_archetype = file_archetype(analysis, dependents(path.as_str()));
        }
    }
}

/// Atoms with more callers than this make a hot path a bottleneck.
const BOTTLENECK_CALLERS: usize = 5;

pub fn file_archetype(analysis: &FileAnalysis, dependents: usize) -> Option<FileArchetype> {
    let has = |kind: ArchetypeKind| {
        analysis
            .atoms
            .iter()
            .any(|a| a.archetype.as_ref().map(|x| x.kind == kind).unwrap_or(false))
    };

    if has(ArchetypeKind::GodFunction) {
        return Some(FileArchetype::GodObject);
    }
    let bottleneck = analysis.atoms.iter().any(|a| {
        a.archetype
            .as_ref()
            .map(|x| x.kind == ArchetypeKind::HotPath)
            .unwrap_or(false)
            && a.called_by.len() > BOTTLENECK_CALLERS
    });
    if bottleneck {
        return Some(FileArchetype::CriticalBottleneck);
    }
    if has(ArchetypeKind::FragileNetwork) {
        return Some(FileArchetype::NetworkHub);
    }
    if !analysis.atoms.is_empty() && analysis.atoms.iter().all(|a| a.is_dead()) && dependents == 0 {
        return Some(FileArchetype::OrphanModule);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomgraph_core::{Archetype, ExtractionResult, SideEffects, TemporalSignals};

    fn classify(atom: &Atom) -> PurposeInfo {
        PurposeClassifier::standard().classify(atom, FileClass::of(&atom.file_path))
    }

    #[test]
    fn file_classes_from_paths() {
        assert_eq!(FileClass::of("src/auth.test.js"), FileClass::Test);
        assert_eq!(FileClass::of("tests/login.rs"), FileClass::Test);
        assert_eq!(FileClass::of("src/__tests__/a.js"), FileClass::Test);
        assert_eq!(FileClass::of("scripts/release.js"), FileClass::Script);
        assert_eq!(FileClass::of("src/config/db.js"), FileClass::Config);
        assert_eq!(FileClass::of("vite.config.ts"), FileClass::Config);
        assert_eq!(FileClass::of("src/api.d.ts"), FileClass::TypeDefinition);
        assert_eq!(FileClass::of("src/latest/utils.js"), FileClass::Source);
    }

    #[test]
    fn uncalled_private_atom_is_dead_code() {
        let info = classify(&Atom::new("src/util.js", "leftover", AtomKind::Function));
        assert_eq!(info.value, Purpose::DeadCode);
        assert_eq!(info.confidence, 0.5);
        assert!(info.is_dead);
    }

    #[test]
    fn first_matching_rule_wins() {
        let atom = Atom::new("src/auth.test.js", "login", AtomKind::Function).exported();
        assert_eq!(classify(&atom).value, Purpose::ApiExport);

        let atom = Atom::new("src/auth.test.js", "fixture", AtomKind::Function);
        assert_eq!(classify(&atom).value, Purpose::TestHelper);
    }

    #[test]
    fn behaviour_rules_in_order() {
        let events = Atom::new("src/a.js", "onClick", AtomKind::Function).with_temporal(
            TemporalSignals {
                event_listeners: true,
                ..Default::default()
            },
        );
        assert_eq!(classify(&events).value, Purpose::EventHandler);

        let net = SideEffects {
            network: true,
            ..Default::default()
        };
        let async_net = Atom::new("src/a.js", "sync", AtomKind::Function)
            .asynchronous()
            .with_side_effects(net.clone());
        assert_eq!(classify(&async_net).value, Purpose::TimerAsync);

        let sync_net = Atom::new("src/a.js", "ping", AtomKind::Function).with_side_effects(net);
        assert_eq!(classify(&sync_net).value, Purpose::NetworkHandler);

        let validator = Atom::new("src/a.js", "check", AtomKind::Function)
            .with_archetype(Archetype::new(ArchetypeKind::Validator, 2, 0.9));
        assert_eq!(classify(&validator).value, Purpose::InternalHelper);
    }

    #[test]
    fn called_atoms_are_internal_helpers() {
        let mut atom = Atom::new("src/a.js", "helper", AtomKind::Function);
        atom.called_by.push("src/a.js::main".into());
        assert_eq!(classify(&atom).value, Purpose::InternalHelper);
    }

    fn analysis_with(atoms: Vec<Atom>) -> FileAnalysis {
        FileAnalysis::from_extraction(
            "src/a.js",
            "",
            ExtractionResult {
                atoms,
                ..Default::default()
            },
        )
    }

    #[test]
    fn file_archetypes_follow_atom_archetypes() {
        let god = analysis_with(vec![Atom::new("src/a.js", "all", AtomKind::Function)
            .with_archetype(Archetype::new(ArchetypeKind::GodFunction, 9, 0.9))]);
        assert_eq!(file_archetype(&god, 3), Some(FileArchetype::GodObject));

        let mut hot = Atom::new("src/a.js", "route", AtomKind::Function)
            .with_archetype(Archetype::new(ArchetypeKind::HotPath, 6, 0.8));
        hot.called_by = (0..6).map(|i| format!("src/b.js::f{}", i)).collect();
        assert_eq!(
            file_archetype(&analysis_with(vec![hot.clone()]), 1),
            Some(FileArchetype::CriticalBottleneck)
        );
        hot.called_by.truncate(5);
        assert_eq!(file_archetype(&analysis_with(vec![hot]), 1), None);

        let net = analysis_with(vec![Atom::new("src/a.js", "fetchAll", AtomKind::Function)
            .with_archetype(Archetype::new(ArchetypeKind::FragileNetwork, 5, 0.8))]);
        assert_eq!(file_archetype(&net, 0), Some(FileArchetype::NetworkHub));
    }

    #[test]
    fn orphan_module_needs_no_dependents() {
        let mut analyses: BTreeMap<String, FileAnalysis> = BTreeMap::new();
        analyses.insert(
            "src/a.js".into(),
            analysis_with(vec![Atom::new("src/a.js", "unused", AtomKind::Function)]),
        );
        let classifier = PurposeClassifier::standard();

        classifier.apply(&mut analyses, |_| 0);
        assert_eq!(
            analyses["src/a.js"].file_archetype,
            Some(FileArchetype::OrphanModule)
        );

        classifier.apply(&mut analyses, |_| 2);
        assert_eq!(analyses["src/a.js"].file_archetype, None);
    }
}
