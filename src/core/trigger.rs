//! Trigger matching - decides whether an event starts a pipeline run

use crate::core::pipeline::PipelineDefinition;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of repository event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
    Manual,
}

impl EventKind {
    /// Name used in the `github.event_name` context
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::Schedule => "schedule",
            EventKind::Manual => "workflow_dispatch",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" => Ok(EventKind::PullRequest),
            "schedule" => Ok(EventKind::Schedule),
            "workflow_dispatch" | "manual" => Ok(EventKind::Manual),
            other => Err(format!("unsupported event `{}`", other)),
        }
    }
}

/// A normalized repository event, as delivered by the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,

    /// Pushed ref (`refs/heads/main`, `refs/tags/v1`, or a bare branch name)
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Target branch of a pull request
    #[serde(default)]
    pub base_ref: Option<String>,

    /// Source branch of a pull request
    #[serde(default)]
    pub head_ref: Option<String>,

    #[serde(default)]
    pub sha: Option<String>,

    #[serde(default)]
    pub actor: Option<String>,

    #[serde(default)]
    pub repository: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
            base_ref: None,
            head_ref: None,
            sha: None,
            actor: None,
            repository: None,
        }
    }

    pub fn push(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::Push, git_ref)
    }

    pub fn pull_request(target_branch: impl Into<String>, source_branch: impl Into<String>) -> Self {
        let head = source_branch.into();
        Self {
            base_ref: Some(target_branch.into()),
            head_ref: Some(head.clone()),
            ..Self::new(EventKind::PullRequest, format!("refs/heads/{}", head))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Branch,
    Tag,
}

/// Ref context extracted from a matched event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefContext {
    pub event: EventKind,
    /// Fully qualified ref
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Short branch or tag name
    pub ref_name: String,
    pub ref_type: RefType,
    /// Branch the filters were matched against
    pub branch: String,
    pub base_ref: Option<String>,
    pub head_ref: Option<String>,
    pub sha: Option<String>,
    pub actor: Option<String>,
    pub repository: Option<String>,
}

impl RefContext {
    pub fn from_event(event: &Event) -> Self {
        let (ref_type, ref_name, git_ref) = split_ref(&event.git_ref);
        let branch = match (event.kind, &event.base_ref) {
            (EventKind::PullRequest, Some(base)) => short_branch(base).to_string(),
            _ => ref_name.clone(),
        };
        Self {
            event: event.kind,
            git_ref,
            ref_name,
            ref_type,
            branch,
            base_ref: event.base_ref.clone(),
            head_ref: event.head_ref.clone(),
            sha: event.sha.clone(),
            actor: event.actor.clone(),
            repository: event.repository.clone(),
        }
    }
}

fn short_branch(name: &str) -> &str {
    name.strip_prefix("refs/heads/").unwrap_or(name)
}

fn split_ref(git_ref: &str) -> (RefType, String, String) {
    if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        (RefType::Tag, tag.to_string(), git_ref.to_string())
    } else if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        (RefType::Branch, branch.to_string(), git_ref.to_string())
    } else {
        (
            RefType::Branch,
            git_ref.to_string(),
            format!("refs/heads/{}", git_ref),
        )
    }
}

/// Ref filters for one event kind
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub branches: Vec<Pattern>,
    pub branches_ignore: Vec<Pattern>,
    pub tags: Vec<Pattern>,
    pub tags_ignore: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn any_match(patterns: &[Pattern], name: &str) -> bool {
    patterns.iter().any(|p| p.matches_with(name, MATCH_OPTIONS))
}

impl EventFilter {
    fn has_branch_filters(&self) -> bool {
        !self.branches.is_empty() || !self.branches_ignore.is_empty()
    }

    fn has_tag_filters(&self) -> bool {
        !self.tags.is_empty() || !self.tags_ignore.is_empty()
    }

    fn matches(&self, ref_type: RefType, name: &str) -> bool {
        let (include, ignore, other_kind_filtered) = match ref_type {
            RefType::Branch => (&self.branches, &self.branches_ignore, self.has_tag_filters()),
            RefType::Tag => (&self.tags, &self.tags_ignore, self.has_branch_filters()),
        };

        if include.is_empty() && ignore.is_empty() {
            // Filtering only the other ref kind excludes this one entirely
            return !other_kind_filtered;
        }
        if !include.is_empty() && !any_match(include, name) {
            return false;
        }
        !any_match(ignore, name)
    }
}

/// The `on:` section of a definition
#[derive(Debug, Clone, Default)]
pub struct TriggerRules {
    pub events: BTreeMap<EventKind, EventFilter>,
    /// Cron expressions declared under `schedule`, kept for display
    pub schedules: Vec<String>,
}

impl TriggerRules {
    pub fn event_kinds(&self) -> impl Iterator<Item = &EventKind> {
        self.events.keys()
    }
}

/// Outcome of [`should_run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    pub run: bool,
    pub ref_context: RefContext,
}

/// Decide whether `definition` runs for `event`.
///
/// Pull requests are matched against their target branch, pushes against the
/// pushed ref. A non-match is the normal outcome and has no side effects.
pub fn should_run(event: &Event, definition: &PipelineDefinition) -> TriggerDecision {
    let ref_context = RefContext::from_event(event);
    let run = match definition.triggers.events.get(&event.kind) {
        None => false,
        Some(filter) => match event.kind {
            EventKind::Push => filter.matches(ref_context.ref_type, &ref_context.ref_name),
            // A pull request is matched on its target branch only
            EventKind::PullRequest => {
                ref_context.base_ref.is_some() && filter.matches(RefType::Branch, &ref_context.branch)
            }
            EventKind::Schedule | EventKind::Manual => true,
        },
    };
    TriggerDecision { run, ref_context }
}
