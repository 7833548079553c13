use crate::{AtomId, FusionConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard ceiling on any connection weight, whatever the configuration says.
pub const WEIGHT_CEILING: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemporalRelation {
    MustRunBefore,
    ConcurrentWrite,
}

impl fmt::Display for TemporalRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemporalRelation::MustRunBefore => f.write_str("must-run-before"),
            TemporalRelation::ConcurrentWrite => f.write_str("concurrent-write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Init,
    Runtime,
    Teardown,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionPhase::Init => "init",
            ExecutionPhase::Runtime => "runtime",
            ExecutionPhase::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// The kind of a connection together with the fields only that kind carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConnectionKind {
    Import {
        #[serde(default)]
        specifiers: Vec<String>,
    },
    Call,
    DataFlowChain {
        fingerprint: String,
    },
    TemporalDependency {
        relation: TemporalRelation,
        phase: ExecutionPhase,
        #[serde(default, rename = "potentialRace")]
        potential_race: bool,
    },
    Inherited {
        ancestor: AtomId,
        generation: u32,
        vibration: f64,
    },
    Ruptured {
        ancestor: AtomId,
        generation: u32,
    },
    SharedState {
        key: String,
    },
    Other {
        name: String,
    },
}

impl ConnectionKind {
    pub fn type_name(&self) -> &str {
        match self {
            ConnectionKind::Import { .. } => "import",
            ConnectionKind::Call => "call",
            ConnectionKind::DataFlowChain { .. } => "data-flow-chain",
            ConnectionKind::TemporalDependency { .. } => "temporal-dependency",
            ConnectionKind::Inherited { .. } => "inherited",
            ConnectionKind::Ruptured { .. } => "ruptured",
            ConnectionKind::SharedState { .. } => "shared-state",
            ConnectionKind::Other { name } => name.as_str(),
        }
    }

    /// Structural kinds describe wiring; everything else is semantic evidence.
    pub fn is_structural(&self) -> bool {
        matches!(self, ConnectionKind::Import { .. } | ConnectionKind::Call)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionCategory {
    Weak,
    Medium,
    Strong,
    Critical,
}

impl Default for ConnectionCategory {
    fn default() -> Self {
        ConnectionCategory::Weak
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Ok,
    Broken,
    Warning,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Ok
    }
}

/// Lineage properties of a connection's endpoints that feed the weight boost.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EndpointFlags {
    pub vibration: Option<f64>,
    pub generation: Option<u32>,
}

impl EndpointFlags {
    pub fn merge(self, other: EndpointFlags) -> EndpointFlags {
        EndpointFlags {
            vibration: max_opt(self.vibration, other.vibration),
            generation: self.generation.max(other.generation),
        }
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
    #[serde(flatten)]
    pub kind: ConnectionKind,
    #[serde(default)]
    pub relationship: String,
    pub confidence: f64,
    #[serde(default)]
    weight: f64,
    #[serde(default)]
    category: ConnectionCategory,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl Connection {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: ConnectionKind,
        confidence: f64,
    ) -> Self {
        let status = match kind {
            ConnectionKind::Ruptured { .. } => ConnectionStatus::Broken,
            ConnectionKind::TemporalDependency {
                potential_race: true,
                ..
            } => ConnectionStatus::Warning,
            _ => ConnectionStatus::Ok,
        };
        Self {
            from: from.into(),
            to: to.into(),
            kind,
            relationship: String::new(),
            confidence,
            weight: 0.0,
            category: ConnectionCategory::Weak,
            status,
            evidence: Vec::new(),
        }
    }

    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = relationship.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn type_name(&self) -> &str {
        self.kind.type_name()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn category(&self) -> ConnectionCategory {
        self.category
    }

    pub fn potential_race(&self) -> Option<ExecutionPhase> {
        match self.kind {
            ConnectionKind::TemporalDependency {
                phase,
                potential_race: true,
                ..
            } => Some(phase),
            _ => None,
        }
    }

    /// Identity used for de-duplication: endpoints plus kind name.
    pub fn key(&self) -> (String, String, String) {
        (
            self.from.clone(),
            self.to.clone(),
            self.type_name().to_string(),
        )
    }

    /// Recomputes `weight` and `category`. This is the only way either is set.
    pub fn apply_weight(&mut self, config: &FusionConfig, endpoints: EndpointFlags) {
        let flags = endpoints.merge(self.lineage_flags());
        self.weight = connection_weight(&self.kind, self.confidence, self.status, flags, config);
        self.category = categorize(self.weight, config);
    }

    fn lineage_flags(&self) -> EndpointFlags {
        match &self.kind {
            ConnectionKind::Inherited {
                generation,
                vibration,
                ..
            } => EndpointFlags {
                vibration: Some(*vibration),
                generation: Some(*generation),
            },
            ConnectionKind::Ruptured { generation, .. } => EndpointFlags {
                vibration: None,
                generation: Some(*generation),
            },
            _ => EndpointFlags::default(),
        }
    }
}

/// Deterministic weight of a connection, always within `[0, WEIGHT_CEILING]`.
pub fn connection_weight(
    kind: &ConnectionKind,
    confidence: f64,
    status: ConnectionStatus,
    flags: EndpointFlags,
    config: &FusionConfig,
) -> f64 {
    let base = config
        .base_weights
        .get(kind.type_name())
        .copied()
        .unwrap_or(config.default_weight);
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let mut boost = 1.0;
    if let Some(vibration) = flags.vibration.filter(|v| v.is_finite()) {
        let threshold = config.high_vibration_threshold;
        if vibration >= threshold {
            let span = (1.0 - threshold).max(f64::EPSILON);
            let above = (vibration.min(1.0) - threshold).max(0.0) / span;
            boost += config.vibration_boost * above.min(1.0);
        }
    }
    if let Some(generation) = flags.generation {
        boost += (generation as f64 * config.generation_boost_step).min(config.max_generation_boost);
    }
    let boost = boost.min(config.max_boost.min(WEIGHT_CEILING));

    let mut weight = base * confidence * boost;
    if status == ConnectionStatus::Broken {
        weight *= config.broken_penalty;
    }

    if !weight.is_finite() {
        return 0.0;
    }
    weight.clamp(0.0, config.max_weight.min(WEIGHT_CEILING))
}

pub fn categorize(weight: f64, config: &FusionConfig) -> ConnectionCategory {
    if weight >= config.critical_threshold {
        ConnectionCategory::Critical
    } else if weight >= config.strong_threshold {
        ConnectionCategory::Strong
    } else if weight >= config.medium_threshold {
        ConnectionCategory::Medium
    } else {
        ConnectionCategory::Weak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn call(confidence: f64) -> Connection {
        Connection::new("a.js::f", "b.js::g", ConnectionKind::Call, confidence)
    }

    #[test]
    fn weight_is_base_times_confidence() {
        let cfg = FusionConfig::default();
        let mut c = call(0.8);
        c.apply_weight(&cfg, EndpointFlags::default());
        assert_relative_eq!(c.weight(), 0.8);
        assert_eq!(c.category(), ConnectionCategory::Medium);
    }

    #[test]
    fn unknown_type_uses_default_weight() {
        let cfg = FusionConfig::default();
        let kind = ConnectionKind::Other {
            name: "emits".into(),
        };
        let w = connection_weight(
            &kind,
            1.0,
            ConnectionStatus::Ok,
            EndpointFlags::default(),
            &cfg,
        );
        assert_relative_eq!(w, cfg.default_weight);
    }

    #[test]
    fn broken_connections_are_penalized() {
        let cfg = FusionConfig::default();
        let ok = connection_weight(
            &ConnectionKind::Call,
            1.0,
            ConnectionStatus::Ok,
            EndpointFlags::default(),
            &cfg,
        );
        let broken = connection_weight(
            &ConnectionKind::Call,
            1.0,
            ConnectionStatus::Broken,
            EndpointFlags::default(),
            &cfg,
        );
        assert_relative_eq!(broken, ok * cfg.broken_penalty);
    }

    #[test]
    fn lineage_boost_is_capped() {
        let cfg = FusionConfig::default();
        let flags = EndpointFlags {
            vibration: Some(1.0),
            generation: Some(50),
        };
        let w = connection_weight(
            &ConnectionKind::SharedState { key: "k".into() },
            1.0,
            ConnectionStatus::Ok,
            flags,
            &cfg,
        );
        assert!(w <= WEIGHT_CEILING);
        assert_relative_eq!(w, WEIGHT_CEILING);
    }

    #[test]
    fn weight_is_deterministic_and_bounded() {
        let cfg = FusionConfig::default();
        let kinds = [
            ConnectionKind::Call,
            ConnectionKind::Import { specifiers: vec![] },
            ConnectionKind::DataFlowChain {
                fingerprint: "User".into(),
            },
            ConnectionKind::TemporalDependency {
                relation: TemporalRelation::MustRunBefore,
                phase: ExecutionPhase::Init,
                potential_race: false,
            },
        ];
        for kind in kinds.iter() {
            for confidence in [-1.0, 0.0, 0.3, 0.99, 1.0, 7.0, f64::NAN] {
                let flags = EndpointFlags {
                    vibration: Some(0.95),
                    generation: Some(3),
                };
                let a = connection_weight(kind, confidence, ConnectionStatus::Ok, flags, &cfg);
                let b = connection_weight(kind, confidence, ConnectionStatus::Ok, flags, &cfg);
                assert_eq!(a.to_bits(), b.to_bits());
                assert!((0.0..=WEIGHT_CEILING).contains(&a));
            }
        }
    }

    #[test]
    fn category_thresholds() {
        let cfg = FusionConfig::default();
        assert_eq!(categorize(1.2, &cfg), ConnectionCategory::Critical);
        assert_eq!(categorize(0.9, &cfg), ConnectionCategory::Strong);
        assert_eq!(categorize(0.6, &cfg), ConnectionCategory::Medium);
        assert_eq!(categorize(0.59, &cfg), ConnectionCategory::Weak);
    }

    #[test]
    fn ruptured_connections_start_broken() {
        let c = Connection::new(
            "a.js::f",
            "gone.js::g",
            ConnectionKind::Ruptured {
                ancestor: "a.js::old".into(),
                generation: 2,
            },
            0.9,
        );
        assert_eq!(c.status, ConnectionStatus::Broken);
    }

    #[test]
    fn serializes_kind_inline_with_type_tag() {
        let c = Connection::new(
            "a",
            "b",
            ConnectionKind::TemporalDependency {
                relation: TemporalRelation::MustRunBefore,
                phase: ExecutionPhase::Init,
                potential_race: true,
            },
            0.7,
        );
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "temporal-dependency");
        assert_eq!(json["relation"], "must-run-before");
        assert_eq!(json["potentialRace"], true);
        assert_eq!(json["status"], "warning");
        let back: Connection = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, c.kind);
    }
}
