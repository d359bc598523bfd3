//! Declarative resource descriptors read from the YAML configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The kind of managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Group,
    Project,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Group => write!(f, "group"),
            ResourceKind::Project => write!(f, "project"),
        }
    }
}

/// Desired remote state of a resource.
///
/// Unknown values are kept verbatim so the reconciler can report them
/// against the offending resource instead of failing the whole file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
    Archived,
    Unrecognized(String),
}

impl From<String> for DesiredState {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "present" => DesiredState::Present,
            "absent" => DesiredState::Absent,
            "archived" | "archive" => DesiredState::Archived,
            _ => DesiredState::Unrecognized(value),
        }
    }
}

impl From<DesiredState> for String {
    fn from(state: DesiredState) -> Self {
        state.to_string()
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Present => write!(f, "present"),
            DesiredState::Absent => write!(f, "absent"),
            DesiredState::Archived => write!(f, "archived"),
            DesiredState::Unrecognized(raw) => write!(f, "{}", raw),
        }
    }
}

// ============================================================================
// Resource descriptor
// ============================================================================

/// Desired-state record for one group or project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Path segment of the resource.
    pub name: String,

    /// Full path of the parent namespace; equals `name` for a root group.
    pub namespace: String,

    /// Previous namespace. When set, the resource is transferred first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_old: Option<String>,

    /// Previous name. When set, the resource is renamed first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_old: Option<String>,

    #[serde(default)]
    pub state: DesiredState,

    #[serde(default)]
    pub description: String,

    /// Visibility level applied on creation (`private`, `internal`, `public`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,

    /// Path of an avatar image uploaded on every present pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_config_path: Option<String>,

    /// Delete remote variables that are not declared here.
    #[serde(default)]
    pub clean_unmanaged_variables: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,

    #[serde(
        default,
        rename = "sched",
        alias = "schedules",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub schedules: Vec<Schedule>,

    #[serde(
        default,
        rename = "deploy_freeze",
        alias = "deploy_freezes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub deploy_freezes: Vec<FreezePeriod>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<Webhook>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables_file: Option<PathBuf>,

    #[serde(
        default,
        alias = "hooks_file",
        skip_serializing_if = "Option::is_none"
    )]
    pub webhooks_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedules_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_freeze_file: Option<PathBuf>,
}

impl ResourceDescriptor {
    /// Creates a present descriptor with only a name and namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// A root is a top-level group whose namespace is its own name.
    ///
    /// Projects always live below a group, even one sharing their name.
    pub fn is_root(&self, kind: ResourceKind) -> bool {
        kind == ResourceKind::Group && self.namespace == self.name
    }

    /// Full remote path of the resource.
    pub fn full_path(&self, kind: ResourceKind) -> String {
        if self.is_root(kind) {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// Path the resource lived at before a transfer.
    ///
    /// A group whose previous namespace is its own name was a root.
    pub fn transferred_from(&self, kind: ResourceKind) -> Option<String> {
        self.namespace_old
            .as_deref()
            .filter(|old| !old.is_empty() && *old != self.namespace)
            .map(|old| {
                if kind == ResourceKind::Group && old == self.name {
                    old.to_string()
                } else {
                    format!("{}/{}", old, self.name)
                }
            })
    }

    /// Namespace a transfer moves the resource into; `None` for the top level.
    pub fn transfer_target(&self, kind: ResourceKind) -> Option<&str> {
        (!self.is_root(kind)).then_some(self.namespace.as_str())
    }

    /// Path the resource lived at before a rename.
    pub fn renamed_from(&self, kind: ResourceKind) -> Option<String> {
        self.name_old
            .as_deref()
            .filter(|old| !old.is_empty() && *old != self.name)
            .map(|old| {
                if self.is_root(kind) {
                    old.to_string()
                } else {
                    format!("{}/{}", self.namespace, old)
                }
            })
    }

    /// Depth level: number of `/`-separated segments in the namespace.
    pub fn level(&self) -> usize {
        self.namespace.split('/').count()
    }
}

// ============================================================================
// Sub-resources
// ============================================================================

/// CI/CD variable. Identified by `(key, environment)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,

    #[serde(default)]
    pub value: String,

    #[serde(default = "default_variable_type")]
    pub variable_type: String,

    #[serde(default)]
    pub protected: bool,

    #[serde(default)]
    pub masked: bool,

    /// Environment scope.
    #[serde(default = "default_environment", alias = "environment_scope")]
    pub environment: String,
}

fn default_variable_type() -> String {
    "env_var".to_string()
}

fn default_environment() -> String {
    "*".to_string()
}

impl Variable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            variable_type: default_variable_type(),
            protected: false,
            masked: false,
            environment: default_environment(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

/// Project webhook. Carries no identity of its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_events_branch_filter: Option<String>,

    #[serde(default, alias = "push_evenets")]
    pub push_events: bool,

    #[serde(default)]
    pub issues_events: bool,

    #[serde(default)]
    pub confidential_issues_events: bool,

    #[serde(default, alias = "merge_requests_evenets")]
    pub merge_requests_events: bool,

    #[serde(default)]
    pub tag_push_events: bool,

    #[serde(default)]
    pub note_events: bool,

    #[serde(default, alias = "condidential_note_events")]
    pub confidential_note_events: bool,

    #[serde(default)]
    pub job_events: bool,

    #[serde(default)]
    pub pipeline_events: bool,

    #[serde(default)]
    pub wiki_page_events: bool,

    #[serde(default)]
    pub deployment_events: bool,

    #[serde(default)]
    pub releases_events: bool,

    #[serde(default)]
    pub enable_ssl_verification: bool,
}

/// Pipeline schedule with its own variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "ref")]
    pub git_ref: String,

    #[serde(default)]
    pub description: String,

    pub cron: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_timezone: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
}

fn default_active() -> bool {
    true
}

/// Deploy freeze window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreezePeriod {
    pub freeze_start: String,
    pub freeze_end: String,

    #[serde(default = "default_timezone")]
    pub cron_timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

// ============================================================================
// File layouts
// ============================================================================

/// Top-level layout of one configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub groups: Vec<ResourceDescriptor>,

    #[serde(default)]
    pub projects: Vec<ResourceDescriptor>,
}

/// Layout of a file referenced by `variables_file`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariablesFile {
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// Layout of a file referenced by `webhooks_file`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhooksFile {
    #[serde(default, alias = "hooks")]
    pub webhooks: Vec<Webhook>,
}

/// Layout of a file referenced by `schedules_file`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulesFile {
    #[serde(default, rename = "sched", alias = "schedules")]
    pub schedules: Vec<Schedule>,
}

/// Layout of a file referenced by `deploy_freeze_file`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FreezePeriodsFile {
    #[serde(default, rename = "deploy_freeze", alias = "deploy_freezes")]
    pub deploy_freezes: Vec<FreezePeriod>,
}
