use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Stage identifier
///
/// Declaration order is pipeline order; a run only ever moves to a stage that
/// compares greater than the one it is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Repository,
    BaseData,
    PullRequests,
    Collaborators,
    PullRequestsMergedBy,
    PullRequestReviewRequests,
    PullRequestReviews,
    IssuesAndDiffNotes,
    IssueEvents,
    Notes,
    SingleEndpointNotes,
    ProtectedBranches,
    Attachments,
    LfsObjects,
    Finish,
}

impl Stage {
    pub const ALL: [Stage; 15] = [
        Stage::Repository,
        Stage::BaseData,
        Stage::PullRequests,
        Stage::Collaborators,
        Stage::PullRequestsMergedBy,
        Stage::PullRequestReviewRequests,
        Stage::PullRequestReviews,
        Stage::IssuesAndDiffNotes,
        Stage::IssueEvents,
        Stage::Notes,
        Stage::SingleEndpointNotes,
        Stage::ProtectedBranches,
        Stage::Attachments,
        Stage::LfsObjects,
        Stage::Finish,
    ];

    pub fn first() -> Self {
        Stage::Repository
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Repository => "repository",
            Stage::BaseData => "base_data",
            Stage::PullRequests => "pull_requests",
            Stage::Collaborators => "collaborators",
            Stage::PullRequestsMergedBy => "pull_requests_merged_by",
            Stage::PullRequestReviewRequests => "pull_request_review_requests",
            Stage::PullRequestReviews => "pull_request_reviews",
            Stage::IssuesAndDiffNotes => "issues_and_diff_notes",
            Stage::IssueEvents => "issue_events",
            Stage::Notes => "notes",
            Stage::SingleEndpointNotes => "single_endpoint_notes",
            Stage::ProtectedBranches => "protected_branches",
            Stage::Attachments => "attachments",
            Stage::LfsObjects => "lfs_objects",
            Stage::Finish => "finish",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::parse(format!("Invalid stage: {}", s)))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Finish)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_name_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()).unwrap(), stage);
        }
    }

    #[test]
    fn test_unknown_stage_name() {
        assert!(Stage::from_str("wiki").is_err());
    }

    #[test]
    fn test_declaration_order_is_pipeline_order() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
        assert_eq!(Stage::first(), Stage::ALL[0]);
        assert!(Stage::ALL[14].is_terminal());
    }

    #[test]
    fn test_serde_uses_snake_case_names() {
        let json = serde_json::to_string(&Stage::PullRequestReviews).unwrap();
        assert_eq!(json, "\"pull_request_reviews\"");
        let parsed: Stage = serde_json::from_str("\"lfs_objects\"").unwrap();
        assert_eq!(parsed, Stage::LfsObjects);
    }
}
