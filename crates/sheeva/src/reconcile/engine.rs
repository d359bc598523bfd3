//! Top-level reconciliation run.
//!
//! A run is three sequential passes: groups (level ordered), projects (flat)
//! and the propagation of group deploy freezes to every project below them.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::resource::{Outcome, Reconciler};
use super::scheduler::{FailurePolicy, LevelScheduler, PassReport};
use super::subresource::desired_items;
use crate::config::{DesiredState, FreezePeriod, LoadedConfig, ResourceDescriptor, ResourceKind};
use crate::error::{Result, SheevaError};
use crate::graph::build_forest;
use crate::provider::{ResourceId, ResourceProvider, SubresourceKind, SubresourceParent, SubresourceSpec};
use crate::settings::EngineSettings;

/// Everything an engine needs, gathered once at startup.
pub struct EngineContext {
    pub provider: Arc<dyn ResourceProvider>,
    pub settings: EngineSettings,
    pub groups: Vec<Arc<ResourceDescriptor>>,
    pub projects: Vec<Arc<ResourceDescriptor>>,
}

impl EngineContext {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        settings: EngineSettings,
        config: LoadedConfig,
    ) -> Self {
        Self {
            provider,
            settings,
            groups: config.groups.into_iter().map(Arc::new).collect(),
            projects: config.projects.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Reports of every pass that completed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub passes: Vec<PassReport>,
}

impl RunReport {
    pub fn pass(&self, name: &str) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.pass == name)
    }
}

pub struct Engine {
    provider: Arc<dyn ResourceProvider>,
    reconciler: Arc<Reconciler>,
    scheduler: LevelScheduler,
    settings: EngineSettings,
    groups: Vec<Arc<ResourceDescriptor>>,
    projects: Vec<Arc<ResourceDescriptor>>,
}

impl Engine {
    pub fn new(context: EngineContext) -> Result<Self> {
        context.settings.validate()?;

        Ok(Self {
            reconciler: Arc::new(Reconciler::new(Arc::clone(&context.provider))),
            scheduler: LevelScheduler::new(
                context.settings.max_concurrency,
                context.settings.failure_policy,
            ),
            provider: context.provider,
            settings: context.settings,
            groups: context.groups,
            projects: context.projects,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Reconciles every group, parents strictly before children.
    pub async fn reconcile_groups(&self) -> Result<PassReport> {
        let forest = build_forest(&self.groups, self.settings.namespace_matching);
        info!(
            roots = forest.roots.len(),
            unrooted = forest.unrooted.len(),
            matching = %self.settings.namespace_matching,
            "Starting group pass"
        );

        let mut report = PassReport::new("groups");
        let reconciler = Arc::clone(&self.reconciler);
        let result = self
            .scheduler
            .run_hierarchy(
                &forest,
                move |desc| {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.reconcile(ResourceKind::Group, &desc).await }
                },
                &mut report,
            )
            .await;

        log_summary(&report);
        result.map(|()| report)
    }

    /// Reconciles every project. Projects have no ordering among themselves.
    pub async fn reconcile_projects(&self) -> Result<PassReport> {
        info!(projects = self.projects.len(), "Starting project pass");

        let mut report = PassReport::new("projects");
        let reconciler = Arc::clone(&self.reconciler);
        let result = self
            .scheduler
            .run_flat(
                ResourceKind::Project,
                &self.projects,
                move |desc| {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.reconcile(ResourceKind::Project, &desc).await }
                },
                &mut report,
            )
            .await;

        log_summary(&report);
        result.map(|()| report)
    }

    /// Ensures the deploy freezes of each present group exist on every
    /// project of the group and its subgroups.
    pub async fn reconcile_freeze_periods(&self) -> Result<PassReport> {
        let groups: Vec<_> = self
            .groups
            .iter()
            .filter(|g| {
                g.state == DesiredState::Present
                    && (!g.deploy_freezes.is_empty() || g.deploy_freeze_file.is_some())
            })
            .cloned()
            .collect();
        info!(groups = groups.len(), "Starting freeze period pass");

        let mut report = PassReport::new("freeze_periods");
        let provider = Arc::clone(&self.provider);
        let result = self
            .scheduler
            .run_flat(
                ResourceKind::Group,
                &groups,
                move |desc| propagate_freezes(Arc::clone(&provider), desc),
                &mut report,
            )
            .await;

        log_summary(&report);
        result.map(|()| report)
    }

    /// Runs all passes in order.
    ///
    /// Fail-fast returns the first failing pass's error. Isolated runs every
    /// pass and returns one combined error if any of them failed.
    pub async fn run(&self) -> Result<RunReport> {
        let mut run = RunReport::default();
        let mut failed = 0;
        let mut messages = Vec::new();

        for pass in [Pass::Groups, Pass::Projects, Pass::FreezePeriods] {
            let result = match pass {
                Pass::Groups => self.reconcile_groups().await,
                Pass::Projects => self.reconcile_projects().await,
                Pass::FreezePeriods => self.reconcile_freeze_periods().await,
            };

            match result {
                Ok(report) => run.passes.push(report),
                Err(e) if self.settings.failure_policy == FailurePolicy::Isolated => {
                    error!(pass = ?pass, error = %e, "Pass finished with failures");
                    match e {
                        SheevaError::Batch { failed: n, messages: m, .. } => {
                            failed += n;
                            messages.extend(m);
                        }
                        other => {
                            failed += 1;
                            messages.push(other.to_string());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if failed > 0 {
            return Err(SheevaError::Batch {
                pass: "run",
                failed,
                messages,
            });
        }
        info!(passes = run.passes.len(), "Run complete");
        Ok(run)
    }
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    Groups,
    Projects,
    FreezePeriods,
}

fn log_summary(report: &PassReport) {
    info!(
        pass = report.pass,
        created = report.created,
        updated = report.updated,
        archived = report.archived,
        deleted = report.deleted,
        already_absent = report.already_absent,
        missing = report.missing,
        invalid = report.invalid,
        skipped = report.skipped,
        failed = report.failed,
        "Pass summary"
    );
}

async fn propagate_freezes(
    provider: Arc<dyn ResourceProvider>,
    desc: Arc<ResourceDescriptor>,
) -> Result<Outcome> {
    let path = desc.full_path(ResourceKind::Group);

    let freezes: Vec<FreezePeriod> = match desired_items(&desc).await {
        Ok(freezes) => freezes,
        Err(e) => {
            warn!(resource = %path, error = %e, "Cannot read deploy freezes, skipping");
            return Ok(Outcome::Invalid);
        }
    };
    if freezes.is_empty() {
        debug!(resource = %path, "No deploy freezes to propagate");
        return Ok(Outcome::Updated);
    }

    let Some(group) = provider
        .lookup(ResourceKind::Group, &path)
        .await
        .map_err(|e| SheevaError::provider(&path, "look up", e))?
    else {
        warn!(resource = %path, "Cannot propagate deploy freezes, group does not exist");
        return Ok(Outcome::Missing);
    };

    let projects = projects_below(provider.as_ref(), group, &path).await?;
    let mut created = 0;
    for project in &projects {
        created += ensure_freezes(provider.as_ref(), *project, &freezes, &path).await;
    }

    info!(resource = %path, projects = projects.len(), created, "Deploy freezes propagated");
    Ok(Outcome::Updated)
}

/// Breadth-first walk over the group's subgroups collecting project ids.
async fn projects_below(
    provider: &dyn ResourceProvider,
    group: ResourceId,
    path: &str,
) -> Result<Vec<ResourceId>> {
    let mut projects = Vec::new();
    let mut queue = VecDeque::from([group]);

    while let Some(current) = queue.pop_front() {
        projects.extend(
            provider
                .list_group_projects(current)
                .await
                .map_err(|e| SheevaError::provider(path, "list projects of", e))?,
        );
        queue.extend(
            provider
                .list_subgroups(current)
                .await
                .map_err(|e| SheevaError::provider(path, "list subgroups of", e))?,
        );
    }
    Ok(projects)
}

/// Creates the freezes the project lacks. Returns how many were created.
async fn ensure_freezes(
    provider: &dyn ResourceProvider,
    project: ResourceId,
    freezes: &[FreezePeriod],
    path: &str,
) -> usize {
    let parent = SubresourceParent::Project(project);
    let existing: HashSet<FreezePeriod> = match provider
        .list_subresources(parent, SubresourceKind::FreezePeriod)
        .await
    {
        Ok(remote) => remote
            .into_iter()
            .filter_map(|r| match r.spec {
                SubresourceSpec::FreezePeriod(freeze) => Some(freeze),
                _ => None,
            })
            .collect(),
        Err(e) => {
            warn!(resource = %path, project, error = %e, "Cannot list deploy freezes");
            return 0;
        }
    };

    let mut created = 0;
    for freeze in freezes.iter().filter(|f| !existing.contains(f)) {
        match provider
            .create_subresource(parent, &SubresourceSpec::FreezePeriod(freeze.clone()))
            .await
        {
            Ok(_) => created += 1,
            Err(e) => warn!(
                resource = %path,
                project,
                start = %freeze.freeze_start,
                error = %e,
                "Cannot create deploy freeze"
            ),
        }
    }
    created
}
