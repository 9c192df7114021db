use crate::context::{features, RunContext};
use crate::error::{PipelineError, Result};
use crate::stage::Stage;
use std::collections::{BTreeMap, HashSet};

/// How a stage runs its phase importers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImporterMode {
    /// One after another on the stage's worker (cheap metadata imports)
    Inline,
    /// Each importer on its own task; siblings run concurrently
    Concurrent,
}

/// Configuration-driven successor of a stage
#[derive(Debug, Clone, Copy)]
pub struct Branch {
    /// Every stage `select` may return
    pub targets: &'static [Stage],
    /// Chosen successor, or `None` to fall back to the default one
    pub select: fn(&RunContext) -> Option<Stage>,
}

/// Reason a stage's importers do not run for this context
pub type SkipRule = fn(&RunContext) -> Option<&'static str>;

/// Static description of one stage
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub stage: Stage,
    pub name: &'static str,
    /// Successor when no configuration branch applies
    pub default_next: Option<Stage>,
    pub branch: Option<Branch>,
    pub skip: Option<SkipRule>,
    pub mode: ImporterMode,
}

impl StageDescriptor {
    pub fn new(
        stage: Stage,
        name: &'static str,
        default_next: Option<Stage>,
        mode: ImporterMode,
    ) -> Self {
        Self {
            stage,
            name,
            default_next,
            branch: None,
            skip: None,
            mode,
        }
    }

    pub fn with_branch(
        mut self,
        targets: &'static [Stage],
        select: fn(&RunContext) -> Option<Stage>,
    ) -> Self {
        self.branch = Some(Branch { targets, select });
        self
    }

    pub fn with_skip(mut self, skip: SkipRule) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Successor for this run. Pure: depends only on the run context.
    pub fn next_stage(&self, ctx: &RunContext) -> Option<Stage> {
        self.branch
            .and_then(|branch| (branch.select)(ctx).filter(|next| branch.targets.contains(next)))
            .or(self.default_next)
    }

    /// Reason the handler should skip its importers, if any
    pub fn skip_reason(&self, ctx: &RunContext) -> Option<&'static str> {
        self.skip.and_then(|skip| skip(ctx))
    }
}

fn issue_events_branch(ctx: &RunContext) -> Option<Stage> {
    if ctx.is_enabled(features::ISSUE_EVENTS) {
        Some(Stage::IssueEvents)
    } else {
        Some(notes_stage(ctx))
    }
}

fn notes_branch(ctx: &RunContext) -> Option<Stage> {
    Some(notes_stage(ctx))
}

/// Notes are imported either page by page or per resource; same logical phase
fn notes_stage(ctx: &RunContext) -> Stage {
    if ctx.is_enabled(features::SINGLE_ENDPOINT_NOTES) {
        Stage::SingleEndpointNotes
    } else {
        Stage::Notes
    }
}

fn attachments_branch(ctx: &RunContext) -> Option<Stage> {
    if ctx.is_enabled(features::ATTACHMENTS) {
        None
    } else {
        Some(Stage::LfsObjects)
    }
}

fn skip_without_push_access(ctx: &RunContext) -> Option<&'static str> {
    if ctx.push_access {
        None
    } else {
        Some("no push access")
    }
}

// The branch away from attachments covers fresh runs; this covers runs
// resumed at the attachments stage after the feature was turned off.
fn skip_disabled_attachments(ctx: &RunContext) -> Option<&'static str> {
    if ctx.is_enabled(features::ATTACHMENTS) {
        None
    } else {
        Some("attachments import disabled")
    }
}

/// Ordered stage definitions with conditional successors
#[derive(Debug, Clone)]
pub struct StageSequencer {
    descriptors: BTreeMap<Stage, StageDescriptor>,
}

impl StageSequencer {
    /// Build from descriptors. Every stage needs exactly one descriptor,
    /// successors must move forward, and only the terminal stage may end a path.
    pub fn new(descriptors: Vec<StageDescriptor>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for descriptor in descriptors {
            if map.insert(descriptor.stage, descriptor).is_some() {
                return Err(PipelineError::config("duplicate stage descriptor"));
            }
        }

        for stage in Stage::ALL {
            let descriptor = map
                .get(&stage)
                .ok_or_else(|| PipelineError::config(format!("missing descriptor for {}", stage)))?;

            match descriptor.default_next {
                Some(next) if next <= stage => {
                    return Err(PipelineError::SequenceCycle(format!("{} -> {}", stage, next)));
                }
                None if !stage.is_terminal() => {
                    return Err(PipelineError::config(format!(
                        "non-terminal stage {} has no successor",
                        stage
                    )));
                }
                _ => {}
            }

            if let Some(branch) = &descriptor.branch {
                if stage.is_terminal() {
                    return Err(PipelineError::config(format!(
                        "terminal stage {} cannot branch",
                        stage
                    )));
                }
                if let Some(next) = branch.targets.iter().find(|next| **next <= stage) {
                    return Err(PipelineError::SequenceCycle(format!("{} -> {}", stage, next)));
                }
            }
        }

        Ok(Self { descriptors: map })
    }

    /// The standard import pipeline
    pub fn standard() -> Result<Self> {
        use ImporterMode::{Concurrent, Inline};

        Self::new(vec![
            StageDescriptor::new(Stage::Repository, "Repository", Some(Stage::BaseData), Inline),
            StageDescriptor::new(
                Stage::BaseData,
                "Base Data",
                Some(Stage::PullRequests),
                Inline,
            ),
            StageDescriptor::new(
                Stage::PullRequests,
                "Pull Requests",
                Some(Stage::Collaborators),
                Concurrent,
            ),
            StageDescriptor::new(
                Stage::Collaborators,
                "Collaborators",
                Some(Stage::PullRequestsMergedBy),
                Concurrent,
            )
            .with_skip(skip_without_push_access),
            StageDescriptor::new(
                Stage::PullRequestsMergedBy,
                "Pull Requests Merged By",
                Some(Stage::PullRequestReviewRequests),
                Concurrent,
            ),
            StageDescriptor::new(
                Stage::PullRequestReviewRequests,
                "Pull Request Review Requests",
                Some(Stage::PullRequestReviews),
                Concurrent,
            ),
            StageDescriptor::new(
                Stage::PullRequestReviews,
                "Pull Request Reviews",
                Some(Stage::IssuesAndDiffNotes),
                Concurrent,
            ),
            StageDescriptor::new(
                Stage::IssuesAndDiffNotes,
                "Issues and Diff Notes",
                Some(Stage::IssueEvents),
                Concurrent,
            )
            .with_branch(
                &[Stage::IssueEvents, Stage::Notes, Stage::SingleEndpointNotes],
                issue_events_branch,
            ),
            StageDescriptor::new(
                Stage::IssueEvents,
                "Issue Events",
                Some(Stage::Notes),
                Concurrent,
            )
            .with_branch(&[Stage::Notes, Stage::SingleEndpointNotes], notes_branch),
            StageDescriptor::new(
                Stage::Notes,
                "Notes",
                Some(Stage::ProtectedBranches),
                Concurrent,
            ),
            StageDescriptor::new(
                Stage::SingleEndpointNotes,
                "Notes (single endpoint)",
                Some(Stage::ProtectedBranches),
                Concurrent,
            ),
            StageDescriptor::new(
                Stage::ProtectedBranches,
                "Protected Branches",
                Some(Stage::Attachments),
                Inline,
            )
            .with_branch(&[Stage::LfsObjects], attachments_branch),
            StageDescriptor::new(
                Stage::Attachments,
                "Attachments",
                Some(Stage::LfsObjects),
                Concurrent,
            )
            .with_skip(skip_disabled_attachments),
            StageDescriptor::new(
                Stage::LfsObjects,
                "LFS Objects",
                Some(Stage::Finish),
                Concurrent,
            ),
            StageDescriptor::new(Stage::Finish, "Finish", None, Inline),
        ])
    }

    pub fn first(&self) -> Stage {
        Stage::first()
    }

    pub fn descriptor(&self, stage: Stage) -> &StageDescriptor {
        // Construction guarantees a descriptor per stage
        &self.descriptors[&stage]
    }

    pub fn next_stage(&self, stage: Stage, ctx: &RunContext) -> Option<Stage> {
        self.descriptor(stage).next_stage(ctx)
    }

    /// Stages a run with this context walks through, in order
    pub fn path(&self, ctx: &RunContext) -> Vec<Stage> {
        let mut path = vec![self.first()];
        let mut seen: HashSet<Stage> = path.iter().copied().collect();
        let mut current = self.first();

        while let Some(next) = self.next_stage(current, ctx) {
            if !seen.insert(next) {
                break;
            }
            path.push(next);
            current = next;
        }
        path
    }

    /// Execution plan as string (for logging)
    pub fn execution_plan(&self, ctx: &RunContext) -> String {
        self.path(ctx)
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let descriptor = self.descriptor(*stage);
                match descriptor.mode {
                    ImporterMode::Concurrent => {
                        format!("Stage {}: {} (concurrent)", i + 1, descriptor.name)
                    }
                    ImporterMode::Inline => format!("Stage {}: {}", i + 1, descriptor.name),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
