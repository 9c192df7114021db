use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Feature names consulted by the stage sequencer
pub mod features {
    /// Import issue events between issues and notes
    pub const ISSUE_EVENTS: &str = "issue_events";
    /// Use the per-resource notes endpoint instead of the paginated batch one
    pub const SINGLE_ENDPOINT_NOTES: &str = "single_endpoint_notes_import";
    /// Import attachments referenced from descriptions and notes
    pub const ATTACHMENTS: &str = "attachments_import";

    pub const ALL: [&str; 3] = [ISSUE_EVENTS, SINGLE_ENDPOINT_NOTES, ATTACHMENTS];
}

/// Per-run configuration snapshot
///
/// Persisted alongside the import state. Stage branching reads only this
/// snapshot, so it stays deterministic across worker processes and resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub subject_id: String,
    /// Whether the import credentials can see repository collaborators
    pub push_access: bool,
    pub features: BTreeSet<String>,
    /// Free-form options passed through to phase importers
    pub options: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Default::default()
        }
    }

    pub fn with_push_access(mut self, push_access: bool) -> Self {
        self.push_access = push_access;
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn is_enabled(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Snapshot every known feature the gate enables for this run.
    /// Features already present in the context stay enabled.
    pub fn resolve_features(mut self, gate: &dyn FeatureGate) -> Self {
        for feature in features::ALL {
            if gate.is_enabled(feature, &self) {
                self.features.insert(feature.to_string());
            }
        }
        self
    }
}

/// Configuration / feature-flag lookup
pub trait FeatureGate: Send + Sync {
    fn is_enabled(&self, feature: &str, ctx: &RunContext) -> bool;
}

/// Fixed set of globally enabled features
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureGate {
    enabled: HashSet<String>,
}

impl StaticFeatureGate {
    pub fn new<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: enabled.into_iter().map(Into::into).collect(),
        }
    }
}

impl FeatureGate for StaticFeatureGate {
    fn is_enabled(&self, feature: &str, _ctx: &RunContext) -> bool {
        self.enabled.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PerSubjectGate;

    impl FeatureGate for PerSubjectGate {
        fn is_enabled(&self, feature: &str, ctx: &RunContext) -> bool {
            feature == features::ATTACHMENTS && ctx.subject_id == "project-1"
        }
    }

    #[test]
    fn test_resolve_features_from_static_gate() {
        let gate = StaticFeatureGate::new([features::ISSUE_EVENTS]);
        let ctx = RunContext::new("project-1").resolve_features(&gate);

        assert!(ctx.is_enabled(features::ISSUE_EVENTS));
        assert!(!ctx.is_enabled(features::ATTACHMENTS));
    }

    #[test]
    fn test_resolve_features_keeps_explicit_opt_in() {
        let gate = StaticFeatureGate::default();
        let ctx = RunContext::new("project-1")
            .with_feature(features::SINGLE_ENDPOINT_NOTES)
            .resolve_features(&gate);

        assert!(ctx.is_enabled(features::SINGLE_ENDPOINT_NOTES));
    }

    #[test]
    fn test_gate_sees_run_context() {
        let one = RunContext::new("project-1").resolve_features(&PerSubjectGate);
        let two = RunContext::new("project-2").resolve_features(&PerSubjectGate);

        assert!(one.is_enabled(features::ATTACHMENTS));
        assert!(!two.is_enabled(features::ATTACHMENTS));
    }

    #[test]
    fn test_context_serde_roundtrip() {
        let ctx = RunContext::new("project-9")
            .with_push_access(true)
            .with_feature(features::ISSUE_EVENTS)
            .with_option("source", "github.com/acme/widgets");

        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: RunContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
