//! Diff-and-replace synchronisation of sub-resource lists.
//!
//! Every kind is driven through the same [`sync`] routine. The kind's
//! [`Managed`] implementation says how items are identified and how the
//! desired list is assembled from a descriptor; the [`CleanPolicy`] says
//! what happens to remote items.

use std::collections::HashSet;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{
    read_list_file, FreezePeriod, FreezePeriodsFile, ResourceDescriptor, Schedule, SchedulesFile,
    Variable, VariablesFile, Webhook, WebhooksFile,
};
use crate::error::{ConfigError, ProviderError};
use crate::provider::{
    ResourceProvider, SubresourceKey, SubresourceKind, SubresourceParent, SubresourceSpec,
};

/// A sub-resource kind the synchronizer can manage.
pub trait Managed: Clone + Send + Sync + 'static {
    const KIND: SubresourceKind;

    /// Layout of the external list file for this kind.
    type File: DeserializeOwned + Default + Send;

    /// Desired-side identity. `None` for kinds matched by replacement only.
    fn key(&self) -> Option<SubresourceKey>;

    fn spec(&self) -> SubresourceSpec;

    /// Variables created under the item once it exists.
    fn children(&self) -> &[Variable] {
        &[]
    }

    fn inline(desc: &ResourceDescriptor) -> &[Self];

    fn file_path(desc: &ResourceDescriptor) -> Option<&Path>;

    fn from_file(file: Self::File) -> Vec<Self>;
}

impl Managed for Variable {
    const KIND: SubresourceKind = SubresourceKind::Variable;
    type File = VariablesFile;

    fn key(&self) -> Option<SubresourceKey> {
        Some(SubresourceKey::variable(&self.key, &self.environment))
    }

    fn spec(&self) -> SubresourceSpec {
        SubresourceSpec::Variable(self.clone())
    }

    fn inline(desc: &ResourceDescriptor) -> &[Self] {
        &desc.variables
    }

    fn file_path(desc: &ResourceDescriptor) -> Option<&Path> {
        desc.variables_file.as_deref()
    }

    fn from_file(file: VariablesFile) -> Vec<Self> {
        file.variables
    }
}

impl Managed for Webhook {
    const KIND: SubresourceKind = SubresourceKind::Webhook;
    type File = WebhooksFile;

    fn key(&self) -> Option<SubresourceKey> {
        None
    }

    fn spec(&self) -> SubresourceSpec {
        SubresourceSpec::Webhook(self.clone())
    }

    fn inline(desc: &ResourceDescriptor) -> &[Self] {
        &desc.webhooks
    }

    fn file_path(desc: &ResourceDescriptor) -> Option<&Path> {
        desc.webhooks_file.as_deref()
    }

    fn from_file(file: WebhooksFile) -> Vec<Self> {
        file.webhooks
    }
}

impl Managed for Schedule {
    const KIND: SubresourceKind = SubresourceKind::Schedule;
    type File = SchedulesFile;

    fn key(&self) -> Option<SubresourceKey> {
        None
    }

    fn spec(&self) -> SubresourceSpec {
        SubresourceSpec::Schedule(self.clone())
    }

    fn children(&self) -> &[Variable] {
        &self.variables
    }

    fn inline(desc: &ResourceDescriptor) -> &[Self] {
        &desc.schedules
    }

    fn file_path(desc: &ResourceDescriptor) -> Option<&Path> {
        desc.schedules_file.as_deref()
    }

    fn from_file(file: SchedulesFile) -> Vec<Self> {
        file.schedules
    }
}

impl Managed for FreezePeriod {
    const KIND: SubresourceKind = SubresourceKind::FreezePeriod;
    type File = FreezePeriodsFile;

    fn key(&self) -> Option<SubresourceKey> {
        None
    }

    fn spec(&self) -> SubresourceSpec {
        SubresourceSpec::FreezePeriod(self.clone())
    }

    fn inline(desc: &ResourceDescriptor) -> &[Self] {
        &desc.deploy_freezes
    }

    fn file_path(desc: &ResourceDescriptor) -> Option<&Path> {
        desc.deploy_freeze_file.as_deref()
    }

    fn from_file(file: FreezePeriodsFile) -> Vec<Self> {
        file.deploy_freezes
    }
}

/// Desired list for one kind: the inline items followed by the external file's.
pub async fn desired_items<T: Managed>(desc: &ResourceDescriptor) -> Result<Vec<T>, ConfigError> {
    let mut items = T::inline(desc).to_vec();
    if let Some(path) = T::file_path(desc) {
        let file: T::File = read_list_file(path).await?;
        items.extend(T::from_file(file));
    }
    Ok(items)
}

/// What happens to remote items during a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanPolicy {
    /// Leave remote items alone; create or update the desired ones.
    KeepUnmatched,
    /// Delete remote items whose key is not desired, then create or update.
    PruneUnmatched,
    /// Delete every remote item, then create every desired one.
    ReplaceAll,
}

impl CleanPolicy {
    /// Variable policy for a descriptor.
    pub fn for_variables(desc: &ResourceDescriptor) -> Self {
        if desc.clean_unmanaged_variables {
            CleanPolicy::PruneUnmatched
        } else {
            CleanPolicy::KeepUnmatched
        }
    }
}

/// Per-kind counts of a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Brings the remote list of `T` under `parent` in line with `desired`.
///
/// Deletes run before creates. Per-item failures are logged and counted;
/// only a failed listing aborts the kind.
pub async fn sync<T: Managed>(
    provider: &dyn ResourceProvider,
    parent: SubresourceParent,
    desired: &[T],
    policy: CleanPolicy,
    resource: &str,
) -> Result<SyncReport, ProviderError> {
    let mut report = SyncReport::default();

    if policy != CleanPolicy::KeepUnmatched {
        let remote = provider.list_subresources(parent, T::KIND).await?;
        let wanted: HashSet<SubresourceKey> = desired.iter().filter_map(T::key).collect();

        for item in remote {
            if policy == CleanPolicy::PruneUnmatched && wanted.contains(&item.key) {
                continue;
            }
            match provider.delete_subresource(parent, T::KIND, &item.key).await {
                Ok(()) => {
                    debug!(resource, kind = %T::KIND, key = %item.key, "Deleted unmanaged item");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(resource, kind = %T::KIND, key = %item.key, error = %e, "Failed to delete item");
                    report.failed += 1;
                }
            }
        }
    }

    for item in desired {
        let spec = item.spec();
        match provider.create_subresource(parent, &spec).await {
            Ok(key) => {
                debug!(resource, kind = %T::KIND, key = %key, "Created item");
                report.created += 1;
                create_children(provider, parent, &key, item.children(), resource, &mut report).await;
            }
            Err(e) if e.is_already_exists() && policy != CleanPolicy::ReplaceAll => {
                let Some(key) = item.key() else {
                    warn!(resource, kind = %T::KIND, error = %e, "Item already exists and has no key to update");
                    report.failed += 1;
                    continue;
                };
                match provider.update_subresource(parent, &key, &spec).await {
                    Ok(()) => {
                        debug!(resource, kind = %T::KIND, key = %key, "Updated item");
                        report.updated += 1;
                    }
                    Err(e) => {
                        warn!(resource, kind = %T::KIND, key = %key, error = %e, "Failed to update item");
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                warn!(resource, kind = %T::KIND, error = %e, "Failed to create item");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn create_children(
    provider: &dyn ResourceProvider,
    parent: SubresourceParent,
    key: &SubresourceKey,
    children: &[Variable],
    resource: &str,
    report: &mut SyncReport,
) {
    if children.is_empty() {
        return;
    }

    let (SubresourceParent::Project(project), SubresourceKey::Id(schedule)) = (parent, key) else {
        warn!(resource, key = %key, "Nested variables need a project schedule, skipping");
        report.failed += children.len();
        return;
    };
    let owner = SubresourceParent::Schedule {
        project,
        schedule: *schedule,
    };

    for variable in children {
        match provider
            .create_subresource(owner, &SubresourceSpec::Variable(variable.clone()))
            .await
        {
            Ok(_) => report.created += 1,
            Err(e) => {
                warn!(resource, schedule, variable = %variable.key, error = %e, "Failed to create schedule variable");
                report.failed += 1;
            }
        }
    }
}
