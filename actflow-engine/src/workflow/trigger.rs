// Workflow triggers
// Normalizes the `on:` section and decides whether an incoming event starts a run

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use glob::{MatchOptions, Pattern};

/// Raw `on:` section.
///
/// Supports multiple trigger formats:
/// - Simple: `on: push`
/// - List: `on: [push, pull_request]`
/// - Detailed: `on: { push: { branches: [main] } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum On {
    Single(String),
    Multiple(Vec<String>),
    Detailed(IndexMap<String, Option<EventSpec>>),
}

/// Per-event configuration. `schedule` takes a list of cron entries, everything else a mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventSpec {
    Schedule(Vec<CronEntry>),
    Config(EventConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    pub cron: String,
}

/// Configuration for a specific trigger event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventConfig {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, rename = "tags-ignore")]
    pub tags_ignore: Vec<String>,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default, rename = "paths-ignore")]
    pub paths_ignore: Vec<String>,

    /// Activity types, e.g. `opened`, `synchronize`
    #[serde(default)]
    pub types: Vec<String>,

    /// Inputs for workflow_dispatch / workflow_call
    #[serde(default)]
    pub inputs: IndexMap<String, WorkflowInput>,

    /// Outputs for workflow_call
    #[serde(default)]
    pub outputs: IndexMap<String, WorkflowOutput>,

    /// Secrets for workflow_call
    #[serde(default)]
    pub secrets: IndexMap<String, WorkflowSecret>,
}

/// Input definition for workflow_dispatch or workflow_call triggers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,

    /// string, boolean, number or choice
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,

    /// Allowed values for choice inputs
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutput {
    #[serde(default)]
    pub description: Option<String>,

    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowSecret {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,
}

/// Branch, tag and path filters shared by push and pull_request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefFilter {
    pub branches: Vec<String>,
    pub branches_ignore: Vec<String>,
    pub tags: Vec<String>,
    pub tags_ignore: Vec<String>,
    pub paths: Vec<String>,
    pub paths_ignore: Vec<String>,
}

impl From<&EventConfig> for RefFilter {
    fn from(config: &EventConfig) -> Self {
        Self {
            branches: config.branches.clone(),
            branches_ignore: config.branches_ignore.clone(),
            tags: config.tags.clone(),
            tags_ignore: config.tags_ignore.clone(),
            paths: config.paths.clone(),
            paths_ignore: config.paths_ignore.clone(),
        }
    }
}

/// A normalized trigger
#[derive(Debug, Clone)]
pub enum Trigger {
    Push(RefFilter),
    PullRequest {
        /// `pull_request_target` rather than `pull_request`
        target: bool,
        filter: RefFilter,
        types: Vec<String>,
    },
    Schedule {
        crons: Vec<String>,
    },
    WorkflowDispatch {
        inputs: IndexMap<String, WorkflowInput>,
    },
    WorkflowCall {
        inputs: IndexMap<String, WorkflowInput>,
        secrets: IndexMap<String, WorkflowSecret>,
        outputs: IndexMap<String, WorkflowOutput>,
    },
    Other {
        event: String,
        types: Vec<String>,
    },
}

const DEFAULT_PULL_REQUEST_TYPES: [&str; 3] = ["opened", "synchronize", "reopened"];

/// The event a run is evaluated against
#[derive(Debug, Clone, Default)]
pub struct EventInfo {
    pub name: String,
    /// Fully-qualified ref: `refs/heads/main`, `refs/tags/v1`
    pub git_ref: String,
    pub sha: String,
    pub actor: String,
    /// Activity type, e.g. `opened` for pull_request
    pub action: Option<String>,
    /// Base branch for pull requests
    pub base_ref: Option<String>,
    /// Paths touched by the event. Empty disables path filtering.
    pub changed_paths: Vec<String>,
    pub payload: Value,
}

impl EventInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = sha.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }

    pub fn with_changed_paths(mut self, paths: Vec<String>) -> Self {
        self.changed_paths = paths;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

impl On {
    pub fn triggers(&self) -> Vec<Trigger> {
        match self {
            On::Single(event) => vec![Trigger::from_event(event, None)],
            On::Multiple(events) => events.iter().map(|e| Trigger::from_event(e, None)).collect(),
            On::Detailed(events) => events
                .iter()
                .map(|(event, spec)| Trigger::from_event(event, spec.as_ref()))
                .collect(),
        }
    }
}

impl Trigger {
    fn from_event(event: &str, spec: Option<&EventSpec>) -> Self {
        let default_config = EventConfig::default();
        let config = match spec {
            Some(EventSpec::Config(config)) => config,
            _ => &default_config,
        };

        match event {
            "push" => Trigger::Push(RefFilter::from(config)),
            "pull_request" | "pull_request_target" => Trigger::PullRequest {
                target: event == "pull_request_target",
                filter: RefFilter::from(config),
                types: config.types.clone(),
            },
            "schedule" => Trigger::Schedule {
                crons: match spec {
                    Some(EventSpec::Schedule(entries)) => {
                        entries.iter().map(|e| e.cron.clone()).collect()
                    }
                    _ => Vec::new(),
                },
            },
            "workflow_dispatch" => Trigger::WorkflowDispatch {
                inputs: config.inputs.clone(),
            },
            "workflow_call" => Trigger::WorkflowCall {
                inputs: config.inputs.clone(),
                secrets: config.secrets.clone(),
                outputs: config.outputs.clone(),
            },
            other => Trigger::Other {
                event: other.to_string(),
                types: config.types.clone(),
            },
        }
    }

    pub fn event_name(&self) -> &str {
        match self {
            Trigger::Push(_) => "push",
            Trigger::PullRequest { target: false, .. } => "pull_request",
            Trigger::PullRequest { target: true, .. } => "pull_request_target",
            Trigger::Schedule { .. } => "schedule",
            Trigger::WorkflowDispatch { .. } => "workflow_dispatch",
            Trigger::WorkflowCall { .. } => "workflow_call",
            Trigger::Other { event, .. } => event,
        }
    }

    /// Declared inputs (empty for events that take none)
    pub fn inputs(&self) -> &IndexMap<String, WorkflowInput> {
        static EMPTY: std::sync::OnceLock<IndexMap<String, WorkflowInput>> =
            std::sync::OnceLock::new();
        match self {
            Trigger::WorkflowDispatch { inputs } | Trigger::WorkflowCall { inputs, .. } => inputs,
            _ => EMPTY.get_or_init(IndexMap::new),
        }
    }

    /// Whether `event` fires this trigger
    pub fn matches(&self, event: &EventInfo) -> bool {
        if event.name != self.event_name() {
            return false;
        }

        match self {
            Trigger::Push(filter) => filter.matches_push(&event.git_ref, &event.changed_paths),
            Trigger::PullRequest { filter, types, .. } => {
                let action_ok = match &event.action {
                    Some(action) if types.is_empty() => {
                        DEFAULT_PULL_REQUEST_TYPES.contains(&action.as_str())
                    }
                    Some(action) => types.iter().any(|t| t == action),
                    None => true,
                };
                let base = event.base_ref.as_deref().unwrap_or(&event.git_ref);
                action_ok
                    && filter.matches_branch(short_ref(base))
                    && filter.matches_paths(&event.changed_paths)
            }
            Trigger::Other { types, .. } => match &event.action {
                Some(action) if !types.is_empty() => types.iter().any(|t| t == action),
                _ => true,
            },
            Trigger::Schedule { .. }
            | Trigger::WorkflowDispatch { .. }
            | Trigger::WorkflowCall { .. } => true,
        }
    }
}

impl RefFilter {
    fn matches_push(&self, git_ref: &str, changed_paths: &[String]) -> bool {
        let ref_ok = if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
            let has_tag_filter = !self.tags.is_empty() || !self.tags_ignore.is_empty();
            let has_branch_filter = !self.branches.is_empty() || !self.branches_ignore.is_empty();
            if has_tag_filter {
                filter_list(tag, &self.tags, &self.tags_ignore)
            } else {
                // Branch-only filters never match tag pushes
                !has_branch_filter
            }
        } else {
            let has_tag_filter = !self.tags.is_empty() || !self.tags_ignore.is_empty();
            let has_branch_filter = !self.branches.is_empty() || !self.branches_ignore.is_empty();
            if has_branch_filter {
                filter_list(short_ref(git_ref), &self.branches, &self.branches_ignore)
            } else {
                !has_tag_filter
            }
        };

        ref_ok && self.matches_paths(changed_paths)
    }

    fn matches_branch(&self, branch: &str) -> bool {
        filter_list(branch, &self.branches, &self.branches_ignore)
    }

    fn matches_paths(&self, changed: &[String]) -> bool {
        if changed.is_empty() {
            return true;
        }
        if !self.paths.is_empty() {
            return changed.iter().any(|p| sequential_match(p, &self.paths));
        }
        if !self.paths_ignore.is_empty() {
            return changed.iter().any(|p| !sequential_match(p, &self.paths_ignore));
        }
        true
    }
}

// Include list (with `!` negations, last match wins) plus an ignore list
fn filter_list(name: &str, include: &[String], ignore: &[String]) -> bool {
    if !include.is_empty() {
        return sequential_match(name, include);
    }
    if !ignore.is_empty() {
        return !sequential_match(name, ignore);
    }
    true
}

fn sequential_match(name: &str, patterns: &[String]) -> bool {
    let mut matched = false;
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(negated) if glob_match(negated, name) => matched = false,
            None if glob_match(pattern, name) => matched = true,
            _ => {}
        }
    }
    matched
}

/// Filter globs: `*` stops at `/`, `**` crosses it
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    Pattern::new(pattern)
        .map(|p| p.matches_with(name, options))
        .unwrap_or(false)
}

fn short_ref(git_ref: &str) -> &str {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .unwrap_or(git_ref)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on(yaml: &str) -> Vec<Trigger> {
        serde_yaml::from_str::<On>(yaml).unwrap().triggers()
    }

    fn push(git_ref: &str) -> EventInfo {
        EventInfo::new("push").with_ref(git_ref)
    }

    #[test]
    fn test_trigger_forms() {
        assert_eq!(on("push")[0].event_name(), "push");
        assert_eq!(on("[push, pull_request]").len(), 2);

        let triggers = on(r#"
schedule:
  - cron: '0 4 * * *'
workflow_dispatch:
"#);
        assert!(matches!(&triggers[0], Trigger::Schedule { crons } if crons.len() == 1));
        assert_eq!(triggers[1].event_name(), "workflow_dispatch");
    }

    #[test]
    fn test_push_branch_filters() {
        let triggers = on("push:\n  branches: [main, 'releases/**', '!releases/**-alpha']\n");
        let t = &triggers[0];

        assert!(t.matches(&push("refs/heads/main")));
        assert!(t.matches(&push("refs/heads/releases/v1/hotfix")));
        assert!(!t.matches(&push("refs/heads/releases/v2-alpha")));
        assert!(!t.matches(&push("refs/heads/feature")));
        // Branch filter only: tags do not trigger
        assert!(!t.matches(&push("refs/tags/v1.0")));
        assert!(!t.matches(&EventInfo::new("pull_request").with_ref("refs/heads/main")));
    }

    #[test]
    fn test_single_star_does_not_cross_slash() {
        assert!(glob_match("feature/*", "feature/a"));
        assert!(!glob_match("feature/*", "feature/a/b"));
        assert!(glob_match("feature/**", "feature/a/b"));
    }

    #[test]
    fn test_push_tag_and_ignore_filters() {
        let triggers = on("push:\n  tags: ['v*']\n  branches-ignore: [wip]\n");
        let t = &triggers[0];
        assert!(t.matches(&push("refs/tags/v1.2")));
        assert!(!t.matches(&push("refs/tags/nightly")));
        assert!(t.matches(&push("refs/heads/main")));
        assert!(!t.matches(&push("refs/heads/wip")));
    }

    #[test]
    fn test_path_filters() {
        let triggers = on("push:\n  paths: ['src/**']\n");
        let t = &triggers[0];
        let docs = push("refs/heads/main").with_changed_paths(vec!["docs/readme.md".into()]);
        let code = push("refs/heads/main").with_changed_paths(vec![
            "docs/readme.md".into(),
            "src/lib.rs".into(),
        ]);
        assert!(!t.matches(&docs));
        assert!(t.matches(&code));
        assert!(t.matches(&push("refs/heads/main")));

        let triggers = on("push:\n  paths-ignore: ['docs/**']\n");
        assert!(!triggers[0].matches(&docs));
        assert!(triggers[0].matches(&code));
    }

    #[test]
    fn test_pull_request_types() {
        let triggers = on("pull_request:\n  branches: [main]\n  types: [opened, labeled]\n");
        let t = &triggers[0];
        let base = |action: &str| {
            EventInfo::new("pull_request")
                .with_ref("refs/pull/1/merge")
                .with_base_ref("main")
                .with_action(action)
        };
        assert!(t.matches(&base("labeled")));
        assert!(!t.matches(&base("closed")));

        let default_types = on("pull_request");
        let closed = EventInfo::new("pull_request").with_action("closed");
        assert!(!default_types[0].matches(&closed));
        assert!(default_types[0].matches(&EventInfo::new("pull_request").with_action("opened")));
    }

    #[test]
    fn test_dispatch_inputs() {
        let triggers = on(r#"
workflow_dispatch:
  inputs:
    environment:
      type: choice
      required: true
      options: [staging, production]
    dry-run:
      type: boolean
      default: true
"#);
        let inputs = triggers[0].inputs();
        assert_eq!(inputs.len(), 2);
        assert!(inputs["environment"].required);
        assert_eq!(inputs["dry-run"].default, Some(Value::Bool(true)));
        assert!(on("push")[0].inputs().is_empty());
    }
}
