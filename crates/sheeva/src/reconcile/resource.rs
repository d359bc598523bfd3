//! Reconciliation of a single group or project.
//!
//! Relocation first (transfer, then rename), then the desired state. For a
//! present resource every attached kind is synchronised concurrently and
//! joined before the resource is reported done.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::subresource::{desired_items, sync, CleanPolicy, Managed};
use crate::config::{DesiredState, FreezePeriod, ResourceDescriptor, ResourceKind, Schedule, Variable, Webhook};
use crate::error::{Result, SheevaError};
use crate::provider::{CreateSpec, ProjectSettings, ResourceId, ResourceProvider, SubresourceParent};

/// Result of reconciling one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    /// Existed and was brought in line.
    Updated,
    Archived,
    Deleted,
    /// Desired absent and nothing was there.
    AlreadyAbsent,
    /// Desired archived but nothing was there.
    Missing,
    /// The descriptor carries an unrecognized state.
    Invalid,
}

/// Reconciles descriptors against the provider.
pub struct Reconciler {
    provider: Arc<dyn ResourceProvider>,
}

impl Reconciler {
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self { provider }
    }

    /// Brings one resource to its desired state.
    ///
    /// Sub-step failures (relocation, settings, sub-resources, avatar) are
    /// logged and do not fail the resource. Lookup, create, delete, archive
    /// and unarchive failures are returned, as is a missing parent.
    pub async fn reconcile(&self, kind: ResourceKind, desc: &ResourceDescriptor) -> Result<Outcome> {
        let path = desc.full_path(kind);

        if let DesiredState::Unrecognized(raw) = &desc.state {
            error!(resource = %path, kind = %kind, state = %raw, "Unrecognized desired state, skipping resource");
            return Ok(Outcome::Invalid);
        }

        self.relocate(kind, desc, &path).await;

        let existing = self
            .provider
            .lookup(kind, &path)
            .await
            .map_err(|e| SheevaError::provider(&path, "look up", e))?;

        let outcome = match &desc.state {
            DesiredState::Present => self.ensure_present(kind, desc, &path, existing).await?,
            DesiredState::Archived => match existing {
                Some(id) => {
                    self.provider
                        .archive(kind, id)
                        .await
                        .map_err(|e| SheevaError::provider(&path, "archive", e))?;
                    Outcome::Archived
                }
                None => {
                    warn!(resource = %path, kind = %kind, "Cannot archive, resource does not exist");
                    Outcome::Missing
                }
            },
            DesiredState::Absent => match existing {
                Some(id) => match self.provider.delete(kind, id).await {
                    Ok(()) => Outcome::Deleted,
                    Err(e) if e.is_not_found() => Outcome::AlreadyAbsent,
                    Err(e) => return Err(SheevaError::provider(&path, "delete", e)),
                },
                None => {
                    debug!(resource = %path, kind = %kind, "Already absent");
                    Outcome::AlreadyAbsent
                }
            },
            DesiredState::Unrecognized(_) => Outcome::Invalid,
        };

        info!(resource = %path, kind = %kind, outcome = ?outcome, "Resource reconciled");
        Ok(outcome)
    }

    /// Applies `namespace_old` and `name_old`. Failures are logged only.
    async fn relocate(&self, kind: ResourceKind, desc: &ResourceDescriptor, path: &str) {
        if let Some(old_path) = desc.transferred_from(kind) {
            match self.provider.lookup(kind, &old_path).await {
                Ok(Some(id)) => match self
                    .provider
                    .transfer(kind, id, desc.transfer_target(kind))
                    .await
                {
                    Ok(()) => info!(resource = %path, from = %old_path, id, "Transferred"),
                    Err(e) => warn!(resource = %path, from = %old_path, id, error = %e, "Transfer failed"),
                },
                Ok(None) => debug!(resource = %path, from = %old_path, "Nothing at previous namespace"),
                Err(e) => warn!(resource = %path, from = %old_path, error = %e, "Transfer lookup failed"),
            }
        }

        if let Some(old_path) = desc.renamed_from(kind) {
            match self.provider.lookup(kind, &old_path).await {
                Ok(Some(id)) => match self.provider.rename(kind, id, &desc.name).await {
                    Ok(()) => info!(resource = %path, from = %old_path, id, "Renamed"),
                    Err(e) => warn!(resource = %path, from = %old_path, id, error = %e, "Rename failed"),
                },
                Ok(None) => debug!(resource = %path, from = %old_path, "Nothing at previous name"),
                Err(e) => warn!(resource = %path, from = %old_path, error = %e, "Rename lookup failed"),
            }
        }
    }

    async fn ensure_present(
        &self,
        kind: ResourceKind,
        desc: &ResourceDescriptor,
        path: &str,
        existing: Option<ResourceId>,
    ) -> Result<Outcome> {
        let (id, outcome) = match existing {
            Some(id) => {
                debug!(resource = %path, kind = %kind, id, "Already exists");
                (id, Outcome::Updated)
            }
            None => {
                let parent = self.resolve_parent(kind, desc, path).await?;
                let id = self
                    .provider
                    .create(kind, parent, &CreateSpec::from(desc))
                    .await
                    .map_err(|e| SheevaError::provider(path, "create", e))?;
                info!(resource = %path, kind = %kind, id, "Created");
                (id, Outcome::Created)
            }
        };

        self.provider
            .unarchive(kind, id)
            .await
            .map_err(|e| SheevaError::provider(path, "unarchive", e))?;

        self.sync_attached(kind, id, desc, path).await;

        Ok(outcome)
    }

    async fn resolve_parent(
        &self,
        kind: ResourceKind,
        desc: &ResourceDescriptor,
        path: &str,
    ) -> Result<Option<ResourceId>> {
        if desc.is_root(kind) {
            return Ok(None);
        }

        match self
            .provider
            .lookup(ResourceKind::Group, &desc.namespace)
            .await
            .map_err(|e| SheevaError::provider(&desc.namespace, "look up", e))?
        {
            Some(id) => Ok(Some(id)),
            None => Err(SheevaError::MissingParent {
                resource: path.to_string(),
                parent: desc.namespace.clone(),
            }),
        }
    }

    async fn sync_attached(&self, kind: ResourceKind, id: ResourceId, desc: &ResourceDescriptor, path: &str) {
        match kind {
            ResourceKind::Group => {
                let parent = SubresourceParent::Group(id);
                tokio::join!(
                    self.sync_kind::<Variable>(parent, desc, CleanPolicy::for_variables(desc), path),
                    self.upload_avatar(kind, id, desc, path),
                );
            }
            ResourceKind::Project => {
                let settings = ProjectSettings::for_descriptor(desc);
                if let Err(e) = self.provider.edit_project_settings(id, &settings).await {
                    warn!(resource = %path, id, error = %e, "Failed to edit project settings");
                }

                let parent = SubresourceParent::Project(id);
                tokio::join!(
                    self.sync_kind::<Variable>(parent, desc, CleanPolicy::for_variables(desc), path),
                    self.sync_kind::<FreezePeriod>(parent, desc, CleanPolicy::ReplaceAll, path),
                    self.sync_kind::<Schedule>(parent, desc, CleanPolicy::ReplaceAll, path),
                    self.sync_kind::<Webhook>(parent, desc, CleanPolicy::ReplaceAll, path),
                    self.upload_avatar(kind, id, desc, path),
                );
            }
        }
    }

    async fn sync_kind<T: Managed>(
        &self,
        parent: SubresourceParent,
        desc: &ResourceDescriptor,
        policy: CleanPolicy,
        path: &str,
    ) {
        let desired = match desired_items::<T>(desc).await {
            Ok(items) => items,
            Err(e) => {
                warn!(resource = %path, kind = %T::KIND, error = %e, "Failed to read external list, skipping");
                return;
            }
        };

        match sync(self.provider.as_ref(), parent, &desired, policy, path).await {
            Ok(report) => debug!(
                resource = %path,
                kind = %T::KIND,
                deleted = report.deleted,
                created = report.created,
                updated = report.updated,
                failed = report.failed,
                "Synchronized"
            ),
            Err(e) => warn!(resource = %path, kind = %T::KIND, error = %e, "Failed to synchronize"),
        }
    }

    async fn upload_avatar(&self, kind: ResourceKind, id: ResourceId, desc: &ResourceDescriptor, path: &str) {
        let Some(avatar) = &desc.avatar else {
            return;
        };
        match self.provider.upload_avatar(kind, id, avatar).await {
            Ok(()) => debug!(resource = %path, file = %avatar.display(), "Avatar uploaded"),
            Err(e) => warn!(resource = %path, file = %avatar.display(), error = %e, "Failed to upload avatar"),
        }
    }
}
