//! Level-ordered concurrent scheduler.
//!
//! Walks each root tree level by level. All tasks of one level are joined
//! before the next level is admitted, and admission across the whole run is
//! bounded by a single semaphore.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::resource::Outcome;
use crate::config::{ResourceDescriptor, ResourceKind};
use crate::error::{Result, SheevaError};
use crate::graph::{Forest, NamespaceMatching};

/// What a pass does when a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop admitting tasks, drain the ones in flight, return the first error.
    #[default]
    FailFast,
    /// Keep going, skip descendants of failed groups, report every failure.
    Isolated,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::Isolated => write!(f, "isolated"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail-fast" | "failfast" | "fail_fast" => Ok(FailurePolicy::FailFast),
            "isolated" => Ok(FailurePolicy::Isolated),
            _ => Err(format!("Unknown failure policy: {}", s)),
        }
    }
}

/// Per-outcome counts of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass: &'static str,
    pub created: usize,
    pub updated: usize,
    pub archived: usize,
    pub deleted: usize,
    pub already_absent: usize,
    pub missing: usize,
    pub invalid: usize,
    /// Never admitted: cancelled, or below a failed group.
    pub skipped: usize,
    pub failed: usize,
}

impl PassReport {
    pub fn new(pass: &'static str) -> Self {
        Self {
            pass,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Archived => self.archived += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::AlreadyAbsent => self.already_absent += 1,
            Outcome::Missing => self.missing += 1,
            Outcome::Invalid => self.invalid += 1,
        }
    }

    /// Number of descriptors that ran to an outcome.
    pub fn completed(&self) -> usize {
        self.created
            + self.updated
            + self.archived
            + self.deleted
            + self.already_absent
            + self.missing
            + self.invalid
    }
}

/// Bounded, level-ordered task runner.
pub struct LevelScheduler {
    semaphore: Arc<Semaphore>,
    policy: FailurePolicy,
}

/// State shared by every batch of one pass.
struct PassState {
    cancelled: Arc<AtomicBool>,
    failed_paths: Vec<String>,
    failures: Vec<SheevaError>,
}

impl PassState {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            failed_paths: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn below_failure(&self, desc: &ResourceDescriptor) -> bool {
        self.failed_paths
            .iter()
            .any(|failed| NamespaceMatching::PathPrefix.matches(&desc.namespace, failed))
    }
}

impl LevelScheduler {
    pub fn new(max_concurrency: usize, policy: FailurePolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            policy,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Runs `task` over the forest: each root alone, then its levels in
    /// ascending order, then the unrooted descriptors level by level.
    pub async fn run_hierarchy<F, Fut>(
        &self,
        forest: &Forest,
        task: F,
        report: &mut PassReport,
    ) -> Result<()>
    where
        F: Fn(Arc<ResourceDescriptor>) -> Fut,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        let mut state = PassState::new();

        for root in &forest.roots {
            let root_path = root.descriptor().full_path(ResourceKind::Group);
            self.run_batch(
                ResourceKind::Group,
                vec![Arc::clone(root.descriptor())],
                &task,
                &mut state,
                report,
            )
            .await?;

            for (level, nodes) in root.levels() {
                debug!(root = %root_path, level, nodes = nodes.len(), "Starting level");
                let batch = nodes.iter().map(|n| Arc::clone(n.descriptor())).collect();
                self.run_batch(ResourceKind::Group, batch, &task, &mut state, report)
                    .await?;
            }
        }

        for (level, batch) in forest.unrooted_levels() {
            debug!(level, nodes = batch.len(), "Starting unrooted level");
            self.run_batch(ResourceKind::Group, batch, &task, &mut state, report)
                .await?;
        }

        self.finish(report.pass, state)
    }

    /// Runs `task` over a flat list; only the admission limit applies.
    pub async fn run_flat<F, Fut>(
        &self,
        kind: ResourceKind,
        items: &[Arc<ResourceDescriptor>],
        task: F,
        report: &mut PassReport,
    ) -> Result<()>
    where
        F: Fn(Arc<ResourceDescriptor>) -> Fut,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        let mut state = PassState::new();
        self.run_batch(kind, items.to_vec(), &task, &mut state, report)
            .await?;
        self.finish(report.pass, state)
    }

    /// Spawns one task per descriptor and joins them all.
    ///
    /// Under fail-fast the first error is returned once the batch drained.
    async fn run_batch<F, Fut>(
        &self,
        kind: ResourceKind,
        batch: Vec<Arc<ResourceDescriptor>>,
        task: &F,
        state: &mut PassState,
        report: &mut PassReport,
    ) -> Result<()>
    where
        F: Fn(Arc<ResourceDescriptor>) -> Fut,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        let fail_fast = self.policy == FailurePolicy::FailFast;
        let total = batch.len();
        let mut set = JoinSet::new();

        for (index, desc) in batch.into_iter().enumerate() {
            if state.cancelled.load(Ordering::SeqCst) {
                report.skipped += total - index;
                break;
            }
            if state.below_failure(&desc) {
                warn!(resource = %desc.full_path(kind), "Skipping, a parent group failed");
                report.skipped += 1;
                continue;
            }

            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| SheevaError::Settings("admission semaphore closed".to_string()))?;

            if state.cancelled.load(Ordering::SeqCst) {
                report.skipped += total - index;
                break;
            }

            let path = desc.full_path(kind);
            let cancelled = Arc::clone(&state.cancelled);
            let work = task(desc);
            set.spawn(async move {
                let _permit = permit;
                let result = work.await;
                if fail_fast && result.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                }
                (path, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(outcome),
                Ok((path, Err(e))) => {
                    error!(resource = %path, error = %e, "Reconciliation failed");
                    report.failed += 1;
                    state.failed_paths.push(path);
                    errors.push(e);
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation task panicked");
                    report.failed += 1;
                    if fail_fast {
                        state.cancelled.store(true, Ordering::SeqCst);
                    }
                    errors.push(SheevaError::TaskPanicked(e.to_string()));
                }
            }
        }

        match self.policy {
            FailurePolicy::FailFast => match errors.into_iter().next() {
                Some(first) => Err(first),
                None => Ok(()),
            },
            FailurePolicy::Isolated => {
                state.failures.extend(errors);
                Ok(())
            }
        }
    }

    fn finish(&self, pass: &'static str, state: PassState) -> Result<()> {
        if state.failures.is_empty() {
            return Ok(());
        }
        Err(SheevaError::Batch {
            pass,
            failed: state.failures.len(),
            messages: state.failures.iter().map(|e| e.to_string()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_forest;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records task start and end order and the in-flight high-water mark.
    #[derive(Default)]
    struct Probe {
        clock: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        spans: Mutex<Vec<(String, usize, usize)>>,
    }

    impl Probe {
        fn task(
            self: &Arc<Self>,
            failing: &'static [&'static str],
        ) -> impl Fn(Arc<ResourceDescriptor>) -> std::pin::Pin<Box<dyn Future<Output = Result<Outcome>> + Send>>
        {
            let probe = Arc::clone(self);
            move |desc| {
                let probe = Arc::clone(&probe);
                Box::pin(async move {
                    let current = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    probe.max_in_flight.fetch_max(current, Ordering::SeqCst);
                    let start = probe.clock.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let end = probe.clock.fetch_add(1, Ordering::SeqCst);
                    probe.in_flight.fetch_sub(1, Ordering::SeqCst);

                    let path = desc.full_path(ResourceKind::Group);
                    probe.spans.lock().unwrap().push((path.clone(), start, end));
                    if failing.contains(&path.as_str()) {
                        Err(SheevaError::MissingParent {
                            resource: path,
                            parent: desc.namespace.clone(),
                        })
                    } else {
                        Ok(Outcome::Updated)
                    }
                })
            }
        }

        fn span(&self, path: &str) -> Option<(usize, usize)> {
            self.spans
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _, _)| p == path)
                .map(|(_, s, e)| (*s, *e))
        }

        fn ran(&self) -> usize {
            self.spans.lock().unwrap().len()
        }
    }

    fn forest(paths: &[(&str, &str)]) -> Forest {
        let descs: Vec<_> = paths
            .iter()
            .map(|(n, ns)| Arc::new(ResourceDescriptor::new(*n, *ns)))
            .collect();
        build_forest(&descs, NamespaceMatching::PathPrefix)
    }

    fn flat(count: usize) -> Vec<Arc<ResourceDescriptor>> {
        (0..count)
            .map(|i| Arc::new(ResourceDescriptor::new(format!("p{}", i), "team-a")))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_levels_are_barriers() {
        let forest = forest(&[
            ("team-a", "team-a"),
            ("be", "team-a"),
            ("fe", "team-a"),
            ("ops", "team-a"),
            ("api", "team-a/be"),
            ("web", "team-a/fe"),
        ]);
        let probe = Arc::new(Probe::default());
        let scheduler = LevelScheduler::new(2, FailurePolicy::FailFast);
        let mut report = PassReport::new("groups");

        scheduler
            .run_hierarchy(&forest, probe.task(&[]), &mut report)
            .await
            .unwrap();

        let (_, root_end) = probe.span("team-a").unwrap();
        let level1_end = ["team-a/be", "team-a/fe", "team-a/ops"]
            .iter()
            .map(|p| probe.span(p).unwrap())
            .inspect(|(start, _)| assert!(*start > root_end))
            .map(|(_, end)| end)
            .max()
            .unwrap();
        for path in ["team-a/be/api", "team-a/fe/web"] {
            let (start, _) = probe.span(path).unwrap();
            assert!(start > level1_end, "{path} started before level 1 finished");
        }
        assert_eq!(report.updated, 6);
        assert!(probe.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_limit_is_respected() {
        let probe = Arc::new(Probe::default());
        let scheduler = LevelScheduler::new(3, FailurePolicy::FailFast);
        let mut report = PassReport::new("projects");

        scheduler
            .run_flat(ResourceKind::Project, &flat(20), probe.task(&[]), &mut report)
            .await
            .unwrap();

        assert_eq!(report.completed(), 20);
        let max = probe.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "max in flight was {max}");
        assert!(max >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fail_fast_stops_admission() {
        let probe = Arc::new(Probe::default());
        let scheduler = LevelScheduler::new(1, FailurePolicy::FailFast);
        let mut report = PassReport::new("projects");

        let err = scheduler
            .run_flat(ResourceKind::Project, &flat(6), probe.task(&["team-a/p1"]), &mut report)
            .await
            .unwrap_err();

        assert!(matches!(err, SheevaError::MissingParent { .. }));
        assert!(probe.ran() < 6, "every task was admitted");
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed() + report.failed + report.skipped, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fail_fast_stops_the_walk() {
        let forest = forest(&[("team-a", "team-a"), ("be", "team-a"), ("api", "team-a/be")]);
        let probe = Arc::new(Probe::default());
        let scheduler = LevelScheduler::new(4, FailurePolicy::FailFast);
        let mut report = PassReport::new("groups");

        let result = scheduler
            .run_hierarchy(&forest, probe.task(&["team-a/be"]), &mut report)
            .await;

        assert!(result.is_err());
        assert!(probe.span("team-a/be/api").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_isolated_collects_every_failure() {
        let forest = forest(&[
            ("team-a", "team-a"),
            ("be", "team-a"),
            ("fe", "team-a"),
            ("api", "team-a/be"),
            ("web", "team-a/fe"),
            ("team-b", "team-b"),
            ("ops", "team-b"),
        ]);
        let probe = Arc::new(Probe::default());
        let scheduler = LevelScheduler::new(4, FailurePolicy::Isolated);
        let mut report = PassReport::new("groups");

        let err = scheduler
            .run_hierarchy(&forest, probe.task(&["team-a/be", "team-b/ops"]), &mut report)
            .await
            .unwrap_err();

        match err {
            SheevaError::Batch { pass, failed, messages } => {
                assert_eq!(pass, "groups");
                assert_eq!(failed, 2);
                assert_eq!(messages.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Unaffected branches ran, the failed group's subtree did not.
        assert!(probe.span("team-a/fe/web").is_some());
        assert!(probe.span("team-b").is_some());
        assert!(probe.span("team-a/be/api").is_none());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let scheduler = LevelScheduler::new(2, FailurePolicy::FailFast);
        let mut report = PassReport::new("projects");

        let err = scheduler
            .run_flat(
                ResourceKind::Project,
                &flat(1),
                |_desc| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok::<_, SheevaError>(Outcome::Updated)
                },
                &mut report,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SheevaError::TaskPanicked(_)));
    }

    #[tokio::test]
    async fn test_unrooted_levels_run_after_roots() {
        let forest = forest(&[("team-a", "team-a"), ("x", "external"), ("y", "external/x")]);
        let probe = Arc::new(Probe::default());
        let scheduler = LevelScheduler::new(4, FailurePolicy::FailFast);
        let mut report = PassReport::new("groups");

        scheduler
            .run_hierarchy(&forest, probe.task(&[]), &mut report)
            .await
            .unwrap();

        let (_, root_end) = probe.span("team-a").unwrap();
        let (x_start, x_end) = probe.span("external/x").unwrap();
        let (y_start, _) = probe.span("external/x/y").unwrap();
        assert!(x_start > root_end);
        assert!(y_start > x_end);
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("isolated".parse::<FailurePolicy>().unwrap(), FailurePolicy::Isolated);
        assert_eq!("fail-fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert!("never".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailFast);
    }
}
