//! Remote API boundary.
//!
//! The engine only talks to the remote hierarchy through [`ResourceProvider`].
//! [`GitLabProvider`] speaks the GitLab REST v4 API; [`InMemoryProvider`]
//! keeps a recording mirror used by the test suites.

pub mod gitlab;
pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{FreezePeriod, ResourceDescriptor, ResourceKind, Schedule, Variable, Webhook};
use crate::error::ProviderError;

pub use gitlab::{GitLabOptions, GitLabProvider};
pub use memory::{Call, InMemoryProvider, Operation};

/// Remote identifier of a group or project.
pub type ResourceId = u64;

/// Attributes sent when creating a group or project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub description: String,
    pub visibility: Option<String>,
}

impl From<&ResourceDescriptor> for CreateSpec {
    fn from(desc: &ResourceDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            description: desc.description.clone(),
            visibility: desc.visibility.clone(),
        }
    }
}

/// Project settings applied on every present pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_config_path: Option<String>,
    pub remove_source_branch_after_merge: bool,
    pub ci_forward_deployment_enabled: bool,
}

impl ProjectSettings {
    pub fn for_descriptor(desc: &ResourceDescriptor) -> Self {
        Self {
            ci_config_path: desc.ci_config_path.clone(),
            remove_source_branch_after_merge: false,
            ci_forward_deployment_enabled: false,
        }
    }
}

// ============================================================================
// Sub-resources
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubresourceKind {
    Variable,
    Webhook,
    Schedule,
    FreezePeriod,
}

impl std::fmt::Display for SubresourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubresourceKind::Variable => write!(f, "variable"),
            SubresourceKind::Webhook => write!(f, "webhook"),
            SubresourceKind::Schedule => write!(f, "schedule"),
            SubresourceKind::FreezePeriod => write!(f, "freeze period"),
        }
    }
}

/// Owner of a sub-resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubresourceParent {
    Group(ResourceId),
    Project(ResourceId),
    /// Variables of a pipeline schedule.
    Schedule { project: ResourceId, schedule: u64 },
}

impl SubresourceParent {
    /// Whether the remote offers this sub-resource kind on this owner.
    ///
    /// Groups and schedules only carry variables.
    pub fn supports(&self, kind: SubresourceKind) -> bool {
        match self {
            SubresourceParent::Project(_) => true,
            SubresourceParent::Group(_) | SubresourceParent::Schedule { .. } => {
                kind == SubresourceKind::Variable
            }
        }
    }

    pub(crate) fn unsupported(&self, kind: SubresourceKind) -> ProviderError {
        ProviderError::Unsupported(format!("{} {}s", self, kind))
    }
}

impl std::fmt::Display for SubresourceParent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubresourceParent::Group(id) => write!(f, "group {}", id),
            SubresourceParent::Project(id) => write!(f, "project {}", id),
            SubresourceParent::Schedule { project, schedule } => {
                write!(f, "schedule {} of project {}", schedule, project)
            }
        }
    }
}

/// Remote identity of a sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubresourceKey {
    /// Variables are addressed by key and environment scope.
    Variable { key: String, environment: String },
    /// Webhooks, schedules and freeze periods carry a numeric id.
    Id(u64),
}

impl SubresourceKey {
    pub fn variable(key: impl Into<String>, environment: impl Into<String>) -> Self {
        SubresourceKey::Variable {
            key: key.into(),
            environment: environment.into(),
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            SubresourceKey::Id(id) => Some(*id),
            SubresourceKey::Variable { .. } => None,
        }
    }
}

impl std::fmt::Display for SubresourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubresourceKey::Variable { key, environment } => write!(f, "{}[{}]", key, environment),
            SubresourceKey::Id(id) => write!(f, "#{}", id),
        }
    }
}

/// Desired attributes of a sub-resource.
///
/// Nested schedule variables are not part of the schedule payload; they are
/// created separately under [`SubresourceParent::Schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubresourceSpec {
    Variable(Variable),
    Webhook(Webhook),
    Schedule(Schedule),
    FreezePeriod(FreezePeriod),
}

impl SubresourceSpec {
    pub fn kind(&self) -> SubresourceKind {
        match self {
            SubresourceSpec::Variable(_) => SubresourceKind::Variable,
            SubresourceSpec::Webhook(_) => SubresourceKind::Webhook,
            SubresourceSpec::Schedule(_) => SubresourceKind::Schedule,
            SubresourceSpec::FreezePeriod(_) => SubresourceKind::FreezePeriod,
        }
    }
}

/// A sub-resource as listed from the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubresource {
    pub key: SubresourceKey,
    pub spec: SubresourceSpec,
}

// ============================================================================
// Provider trait
// ============================================================================

/// Operations the engine needs from the remote hierarchy.
///
/// Implementations are shared by every reconciliation task and must be safe
/// to call concurrently.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Resolves a full path to an id. `Ok(None)` when nothing lives there.
    async fn lookup(&self, kind: ResourceKind, path: &str)
        -> Result<Option<ResourceId>, ProviderError>;

    /// Creates a group or project. `parent` is `None` only for root groups.
    async fn create(
        &self,
        kind: ResourceKind,
        parent: Option<ResourceId>,
        spec: &CreateSpec,
    ) -> Result<ResourceId, ProviderError>;

    async fn delete(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError>;

    async fn archive(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError>;

    async fn unarchive(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError>;

    /// Moves a resource below the group at `namespace` (a full path).
    ///
    /// `None` promotes a group to the top level. Projects always need a
    /// target namespace.
    async fn transfer(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        namespace: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Changes both the display name and the path segment.
    async fn rename(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        name: &str,
    ) -> Result<(), ProviderError>;

    async fn edit_project_settings(
        &self,
        id: ResourceId,
        settings: &ProjectSettings,
    ) -> Result<(), ProviderError>;

    async fn upload_avatar(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        path: &Path,
    ) -> Result<(), ProviderError>;

    async fn list_subresources(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
    ) -> Result<Vec<RemoteSubresource>, ProviderError>;

    /// Creates a sub-resource. Variables that already exist for the same
    /// key and environment yield [`ProviderError::AlreadyExists`].
    async fn create_subresource(
        &self,
        parent: SubresourceParent,
        spec: &SubresourceSpec,
    ) -> Result<SubresourceKey, ProviderError>;

    async fn update_subresource(
        &self,
        parent: SubresourceParent,
        key: &SubresourceKey,
        spec: &SubresourceSpec,
    ) -> Result<(), ProviderError>;

    async fn delete_subresource(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
        key: &SubresourceKey,
    ) -> Result<(), ProviderError>;

    /// Direct projects of a group.
    async fn list_group_projects(&self, group: ResourceId)
        -> Result<Vec<ResourceId>, ProviderError>;

    /// Direct subgroups of a group.
    async fn list_subgroups(&self, group: ResourceId) -> Result<Vec<ResourceId>, ProviderError>;
}
