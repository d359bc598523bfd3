//! In-memory provider with a call journal.
//!
//! Mirrors the parts of the remote hierarchy the engine touches and records
//! every call with logical start and finish ticks, so tests can assert on
//! ordering, concurrency and the exact calls issued.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{
    CreateSpec, ProjectSettings, RemoteSubresource, ResourceId, ResourceProvider, SubresourceKey,
    SubresourceKind, SubresourceParent, SubresourceSpec,
};
use crate::config::ResourceKind;
use crate::error::ProviderError;

/// Provider operation, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Lookup,
    Create,
    Delete,
    Archive,
    Unarchive,
    Transfer,
    Rename,
    EditSettings,
    UploadAvatar,
    ListSubresources,
    CreateSubresource,
    UpdateSubresource,
    DeleteSubresource,
    ListGroupProjects,
    ListSubgroups,
}

impl Operation {
    pub fn is_lookup(&self) -> bool {
        matches!(self, Operation::Lookup)
    }
}

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct Call {
    pub op: Operation,
    /// Full path of the group or project the call concerns.
    pub target: String,
    /// Extra detail such as the sub-resource kind and key.
    pub detail: Option<String>,
    /// Logical tick taken when the call was entered.
    pub started: u64,
    /// Logical tick taken when the call returned.
    pub finished: u64,
    pub succeeded: bool,
}

/// A group or project held by the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub path: String,
    pub parent: Option<ResourceId>,
    pub description: String,
    pub visibility: Option<String>,
    pub archived: bool,
    pub settings: Option<ProjectSettings>,
    pub avatar: Option<PathBuf>,
}

impl RemoteResource {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Default)]
struct State {
    last_id: u64,
    resources: BTreeMap<ResourceId, RemoteResource>,
    subresources: HashMap<SubresourceParent, Vec<RemoteSubresource>>,
    journal: Vec<Call>,
    failures: Vec<(Operation, String)>,
}

impl State {
    fn allocate(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn find(&self, kind: ResourceKind, path: &str) -> Option<&RemoteResource> {
        self.resources
            .values()
            .find(|r| r.kind == kind && r.path == path)
    }

    fn get(&self, kind: ResourceKind, id: ResourceId) -> Result<&RemoteResource, ProviderError> {
        self.resources
            .get(&id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| ProviderError::NotFound(format!("{} {}", kind, id)))
    }

    fn get_mut(
        &mut self,
        kind: ResourceKind,
        id: ResourceId,
    ) -> Result<&mut RemoteResource, ProviderError> {
        self.resources
            .get_mut(&id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| ProviderError::NotFound(format!("{} {}", kind, id)))
    }

    fn path_of(&self, id: ResourceId) -> String {
        self.resources
            .get(&id)
            .map(|r| r.path.clone())
            .unwrap_or_else(|| format!("#{}", id))
    }

    fn parent_target(&self, parent: SubresourceParent) -> String {
        match parent {
            SubresourceParent::Group(id)
            | SubresourceParent::Project(id)
            | SubresourceParent::Schedule { project: id, .. } => self.path_of(id),
        }
    }

    fn injected(&self, op: Operation, target: &str) -> Option<ProviderError> {
        self.failures
            .iter()
            .any(|(o, t)| *o == op && t == target)
            .then(|| ProviderError::Status {
                operation: format!("{:?}", op),
                status: 500,
                body: format!("injected failure for '{}'", target),
            })
    }

    fn insert(
        &mut self,
        kind: ResourceKind,
        path: String,
        parent: Option<ResourceId>,
        spec: Option<&CreateSpec>,
    ) -> ResourceId {
        let id = self.allocate();
        self.resources.insert(
            id,
            RemoteResource {
                id,
                kind,
                path,
                parent,
                description: spec.map(|s| s.description.clone()).unwrap_or_default(),
                visibility: spec.and_then(|s| s.visibility.clone()),
                archived: false,
                settings: None,
                avatar: None,
            },
        );
        id
    }

    /// Re-roots a resource and everything below it at `new_path`.
    fn move_subtree(&mut self, id: ResourceId, new_path: String) {
        let old_path = self.path_of(id);
        let prefix = format!("{}/", old_path);
        for resource in self.resources.values_mut() {
            if resource.id == id {
                resource.path = new_path.clone();
            } else if let Some(rest) = resource.path.strip_prefix(&prefix) {
                resource.path = format!("{}/{}", new_path, rest);
            }
        }
    }

    fn remove_subtree(&mut self, id: ResourceId) {
        let prefix = format!("{}/", self.path_of(id));
        let removed: Vec<ResourceId> = self
            .resources
            .values()
            .filter(|r| r.id == id || r.path.starts_with(&prefix))
            .map(|r| r.id)
            .collect();
        for rid in removed {
            self.resources.remove(&rid);
            self.subresources.retain(|parent, _| match parent {
                SubresourceParent::Group(p)
                | SubresourceParent::Project(p)
                | SubresourceParent::Schedule { project: p, .. } => *p != rid,
            });
        }
    }

    fn check_parent(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
    ) -> Result<(), ProviderError> {
        if !parent.supports(kind) {
            return Err(parent.unsupported(kind));
        }
        match parent {
            SubresourceParent::Group(id) => self.get(ResourceKind::Group, id).map(|_| ()),
            SubresourceParent::Project(id) => self.get(ResourceKind::Project, id).map(|_| ()),
            SubresourceParent::Schedule { project, schedule } => {
                self.get(ResourceKind::Project, project)?;
                let known = self
                    .subresources
                    .get(&SubresourceParent::Project(project))
                    .map(|items| items.iter().any(|s| s.key == SubresourceKey::Id(schedule)))
                    .unwrap_or(false);
                if known {
                    Ok(())
                } else {
                    Err(ProviderError::NotFound(format!("schedule {}", schedule)))
                }
            }
        }
    }
}

/// Thread-safe in-memory mirror of the remote hierarchy.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    clock: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Option<Duration>,
}

/// Decrements the in-flight counter when a call returns.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` while counted as in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("In-memory provider lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    // ========== Seeding ==========

    /// Inserts a group or project at `path` without recording a call.
    ///
    /// The parent is the group at the path's namespace, if one exists.
    pub fn seed(&self, kind: ResourceKind, path: &str) -> ResourceId {
        let mut state = self.lock();
        let parent = path
            .rsplit_once('/')
            .and_then(|(ns, _)| state.find(ResourceKind::Group, ns))
            .map(|g| g.id);
        state.insert(kind, path.to_string(), parent, None)
    }

    /// Inserts a sub-resource without recording a call.
    pub fn seed_subresource(
        &self,
        parent: SubresourceParent,
        spec: SubresourceSpec,
    ) -> SubresourceKey {
        let mut state = self.lock();
        let key = match &spec {
            SubresourceSpec::Variable(v) => SubresourceKey::variable(&v.key, &v.environment),
            _ => SubresourceKey::Id(state.allocate()),
        };
        state
            .subresources
            .entry(parent)
            .or_default()
            .push(RemoteSubresource {
                key: key.clone(),
                spec,
            });
        key
    }

    pub fn set_archived(&self, id: ResourceId, archived: bool) {
        if let Some(resource) = self.lock().resources.get_mut(&id) {
            resource.archived = archived;
        }
    }

    /// Makes every `op` call concerning `target` fail with a 500 status.
    pub fn fail_on(&self, op: Operation, target: &str) {
        self.lock().failures.push((op, target.to_string()));
    }

    // ========== Inspection ==========

    pub fn resource(&self, kind: ResourceKind, path: &str) -> Option<RemoteResource> {
        self.lock().find(kind, path).cloned()
    }

    pub fn resources(&self) -> Vec<RemoteResource> {
        self.lock().resources.values().cloned().collect()
    }

    pub fn subresources(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
    ) -> Vec<RemoteSubresource> {
        self.lock()
            .subresources
            .get(&parent)
            .map(|items| {
                items
                    .iter()
                    .filter(|s| s.spec.kind() == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Journal ordered by start tick.
    pub fn calls(&self) -> Vec<Call> {
        let mut calls = self.lock().journal.clone();
        calls.sort_by_key(|c| c.started);
        calls
    }

    pub fn calls_of(&self, op: Operation) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn count(&self, op: Operation) -> usize {
        self.lock().journal.iter().filter(|c| c.op == op).count()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    // ========== Recording ==========

    async fn record<T>(
        &self,
        op: Operation,
        detail: Option<String>,
        target: impl FnOnce(&State) -> String,
        apply: impl FnOnce(&mut State) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let started = self.clock.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let target = target(&state);
        let result = match state.injected(op, &target) {
            Some(err) => Err(err),
            None => apply(&mut state),
        };
        let finished = self.clock.fetch_add(1, Ordering::SeqCst);
        state.journal.push(Call {
            op,
            target,
            detail,
            started,
            finished,
            succeeded: result.is_ok(),
        });
        result
    }
}

#[async_trait]
impl ResourceProvider for InMemoryProvider {
    async fn lookup(
        &self,
        kind: ResourceKind,
        path: &str,
    ) -> Result<Option<ResourceId>, ProviderError> {
        self.record(
            Operation::Lookup,
            None,
            |_| path.to_string(),
            |state| Ok(state.find(kind, path).map(|r| r.id)),
        )
        .await
    }

    async fn create(
        &self,
        kind: ResourceKind,
        parent: Option<ResourceId>,
        spec: &CreateSpec,
    ) -> Result<ResourceId, ProviderError> {
        let path_for = |state: &State| match parent {
            Some(pid) => format!("{}/{}", state.path_of(pid), spec.name),
            None => spec.name.clone(),
        };
        self.record(Operation::Create, None, path_for, |state| {
            if let Some(pid) = parent {
                state.get(ResourceKind::Group, pid)?;
            } else if kind == ResourceKind::Project {
                return Err(ProviderError::Status {
                    operation: "create project".to_string(),
                    status: 400,
                    body: "namespace is required".to_string(),
                });
            }
            let path = path_for(state);
            if state.find(kind, &path).is_some() {
                return Err(ProviderError::AlreadyExists(path));
            }
            Ok(state.insert(kind, path, parent, Some(spec)))
        })
        .await
    }

    async fn delete(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError> {
        self.record(
            Operation::Delete,
            None,
            |state| state.path_of(id),
            |state| {
                state.get(kind, id)?;
                state.remove_subtree(id);
                Ok(())
            },
        )
        .await
    }

    async fn archive(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError> {
        self.record(
            Operation::Archive,
            None,
            |state| state.path_of(id),
            |state| {
                state.get_mut(kind, id)?.archived = true;
                Ok(())
            },
        )
        .await
    }

    async fn unarchive(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError> {
        self.record(
            Operation::Unarchive,
            None,
            |state| state.path_of(id),
            |state| {
                state.get_mut(kind, id)?.archived = false;
                Ok(())
            },
        )
        .await
    }

    async fn transfer(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        namespace: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.record(
            Operation::Transfer,
            Some(namespace.unwrap_or("/").to_string()),
            |state| state.path_of(id),
            |state| {
                let name = state.get(kind, id)?.name().to_string();
                let (target, new_path) = match (kind, namespace) {
                    (_, Some(namespace)) => {
                        let target = state
                            .find(ResourceKind::Group, namespace)
                            .map(|g| g.id)
                            .ok_or_else(|| ProviderError::NotFound(namespace.to_string()))?;
                        (Some(target), format!("{}/{}", namespace, name))
                    }
                    (ResourceKind::Group, None) => (None, name),
                    (ResourceKind::Project, None) => {
                        return Err(ProviderError::Unsupported(
                            "transfer of a project to the top level".to_string(),
                        ));
                    }
                };
                if state.find(kind, &new_path).is_some() {
                    return Err(ProviderError::AlreadyExists(new_path));
                }
                state.move_subtree(id, new_path);
                state.get_mut(kind, id)?.parent = target;
                Ok(())
            },
        )
        .await
    }

    async fn rename(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        name: &str,
    ) -> Result<(), ProviderError> {
        self.record(
            Operation::Rename,
            Some(name.to_string()),
            |state| state.path_of(id),
            |state| {
                let old_path = state.get(kind, id)?.path.clone();
                let new_path = match old_path.rsplit_once('/') {
                    Some((ns, _)) => format!("{}/{}", ns, name),
                    None => name.to_string(),
                };
                if state.find(kind, &new_path).is_some() {
                    return Err(ProviderError::AlreadyExists(new_path));
                }
                state.move_subtree(id, new_path);
                Ok(())
            },
        )
        .await
    }

    async fn edit_project_settings(
        &self,
        id: ResourceId,
        settings: &ProjectSettings,
    ) -> Result<(), ProviderError> {
        self.record(
            Operation::EditSettings,
            None,
            |state| state.path_of(id),
            |state| {
                state.get_mut(ResourceKind::Project, id)?.settings = Some(settings.clone());
                Ok(())
            },
        )
        .await
    }

    async fn upload_avatar(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        path: &Path,
    ) -> Result<(), ProviderError> {
        let readable = tokio::fs::metadata(path)
            .await
            .map(|_| ())
            .map_err(ProviderError::from);
        self.record(
            Operation::UploadAvatar,
            Some(path.display().to_string()),
            |state| state.path_of(id),
            |state| {
                readable?;
                state.get_mut(kind, id)?.avatar = Some(path.to_path_buf());
                Ok(())
            },
        )
        .await
    }

    async fn list_subresources(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
    ) -> Result<Vec<RemoteSubresource>, ProviderError> {
        self.record(
            Operation::ListSubresources,
            Some(kind.to_string()),
            |state| state.parent_target(parent),
            |state| {
                state.check_parent(parent, kind)?;
                Ok(state
                    .subresources
                    .get(&parent)
                    .map(|items| {
                        items
                            .iter()
                            .filter(|s| s.spec.kind() == kind)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default())
            },
        )
        .await
    }

    async fn create_subresource(
        &self,
        parent: SubresourceParent,
        spec: &SubresourceSpec,
    ) -> Result<SubresourceKey, ProviderError> {
        let detail = match spec {
            SubresourceSpec::Variable(v) => format!("variable {}", v.key),
            other => other.kind().to_string(),
        };
        self.record(
            Operation::CreateSubresource,
            Some(detail),
            |state| state.parent_target(parent),
            |state| {
                state.check_parent(parent, spec.kind())?;
                let (key, stored) = match spec {
                    SubresourceSpec::Variable(v) => {
                        let key = SubresourceKey::variable(&v.key, &v.environment);
                        let taken = state
                            .subresources
                            .get(&parent)
                            .map(|items| items.iter().any(|s| s.key == key))
                            .unwrap_or(false);
                        if taken {
                            return Err(ProviderError::AlreadyExists(format!(
                                "variable {} has already been taken",
                                key
                            )));
                        }
                        (key, spec.clone())
                    }
                    SubresourceSpec::Schedule(s) => {
                        let mut schedule = s.clone();
                        schedule.variables.clear();
                        (
                            SubresourceKey::Id(state.allocate()),
                            SubresourceSpec::Schedule(schedule),
                        )
                    }
                    _ => (SubresourceKey::Id(state.allocate()), spec.clone()),
                };
                state
                    .subresources
                    .entry(parent)
                    .or_default()
                    .push(RemoteSubresource {
                        key: key.clone(),
                        spec: stored,
                    });
                Ok(key)
            },
        )
        .await
    }

    async fn update_subresource(
        &self,
        parent: SubresourceParent,
        key: &SubresourceKey,
        spec: &SubresourceSpec,
    ) -> Result<(), ProviderError> {
        self.record(
            Operation::UpdateSubresource,
            Some(format!("{} {}", spec.kind(), key)),
            |state| state.parent_target(parent),
            |state| {
                state.check_parent(parent, spec.kind())?;
                let item = state
                    .subresources
                    .get_mut(&parent)
                    .and_then(|items| items.iter_mut().find(|s| &s.key == key))
                    .ok_or_else(|| ProviderError::NotFound(key.to_string()))?;
                item.spec = spec.clone();
                Ok(())
            },
        )
        .await
    }

    async fn delete_subresource(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
        key: &SubresourceKey,
    ) -> Result<(), ProviderError> {
        self.record(
            Operation::DeleteSubresource,
            Some(format!("{} {}", kind, key)),
            |state| state.parent_target(parent),
            |state| {
                state.check_parent(parent, kind)?;
                let items = state
                    .subresources
                    .get_mut(&parent)
                    .ok_or_else(|| ProviderError::NotFound(key.to_string()))?;
                let before = items.len();
                items.retain(|s| !(s.spec.kind() == kind && &s.key == key));
                if items.len() == before {
                    return Err(ProviderError::NotFound(key.to_string()));
                }
                if let (SubresourceKind::Schedule, SubresourceParent::Project(project), SubresourceKey::Id(schedule)) =
                    (kind, parent, key)
                {
                    state.subresources.remove(&SubresourceParent::Schedule {
                        project,
                        schedule: *schedule,
                    });
                }
                Ok(())
            },
        )
        .await
    }

    async fn list_group_projects(
        &self,
        group: ResourceId,
    ) -> Result<Vec<ResourceId>, ProviderError> {
        self.record(
            Operation::ListGroupProjects,
            None,
            |state| state.path_of(group),
            |state| {
                state.get(ResourceKind::Group, group)?;
                Ok(state
                    .resources
                    .values()
                    .filter(|r| r.kind == ResourceKind::Project && r.parent == Some(group))
                    .map(|r| r.id)
                    .collect())
            },
        )
        .await
    }

    async fn list_subgroups(&self, group: ResourceId) -> Result<Vec<ResourceId>, ProviderError> {
        self.record(
            Operation::ListSubgroups,
            None,
            |state| state.path_of(group),
            |state| {
                state.get(ResourceKind::Group, group)?;
                Ok(state
                    .resources
                    .values()
                    .filter(|r| r.kind == ResourceKind::Group && r.parent == Some(group))
                    .map(|r| r.id)
                    .collect())
            },
        )
        .await
    }
}
