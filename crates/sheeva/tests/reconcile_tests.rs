//! End-to-end runs: descriptors on disk, engine against the in-memory provider.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use sheeva::config::{ResourceKind, Variable};
use sheeva::provider::{Operation, SubresourceKind, SubresourceParent, SubresourceSpec};
use sheeva::{EngineSettings, FailurePolicy, SheevaError};

use common::{group_tree, DescriptorBuilder, TestHarness};

fn variables(harness: &TestHarness, project: &str) -> HashMap<String, String> {
    let id = harness
        .provider
        .resource(ResourceKind::Project, project)
        .expect("project exists")
        .id;
    harness
        .provider
        .subresources(SubresourceParent::Project(id), SubresourceKind::Variable)
        .into_iter()
        .filter_map(|s| match s.spec {
            SubresourceSpec::Variable(v) => Some((v.key, v.value)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_first_run_builds_hierarchy_and_second_run_is_idempotent() {
    let harness = TestHarness::new();
    harness.write_descriptors(
        "team-a.yml",
        vec![
            DescriptorBuilder::root("team-a").build(),
            DescriptorBuilder::new("be", "team-a").build(),
            DescriptorBuilder::new("api", "team-a/be").build(),
        ],
        vec![DescriptorBuilder::new("svc", "team-a/be/api")
            .variable("DATABASE_URL", "postgres://db")
            .build()],
    );

    let first = harness.run(EngineSettings::default()).await.unwrap();
    assert_eq!(first.pass("groups").unwrap().created, 3);
    assert_eq!(first.pass("projects").unwrap().created, 1);
    assert_eq!(variables(&harness, "team-a/be/api/svc").len(), 1);

    harness.provider.clear_journal();
    let second = harness.run(EngineSettings::default()).await.unwrap();

    assert_eq!(harness.provider.count(Operation::Create), 0);
    assert_eq!(second.pass("groups").unwrap().updated, 3);
    assert_eq!(second.pass("projects").unwrap().updated, 1);
    assert_eq!(variables(&harness, "team-a/be/api/svc").len(), 1);
}

#[tokio::test]
async fn test_unmanaged_variables_are_kept_by_default() {
    let harness = TestHarness::new();
    harness.provider.seed(ResourceKind::Group, "team-a");
    let id = harness.provider.seed(ResourceKind::Project, "team-a/svc");
    harness.provider.seed_subresource(
        SubresourceParent::Project(id),
        SubresourceSpec::Variable(Variable::new("LEGACY", "1")),
    );
    harness.write_descriptors(
        "svc.yml",
        vec![],
        vec![DescriptorBuilder::new("svc", "team-a")
            .variable("TOKEN", "abc")
            .build()],
    );

    harness.run(EngineSettings::default()).await.unwrap();

    let vars = variables(&harness, "team-a/svc");
    assert_eq!(vars.get("LEGACY").map(String::as_str), Some("1"));
    assert_eq!(vars.get("TOKEN").map(String::as_str), Some("abc"));
    assert_eq!(harness.provider.count(Operation::DeleteSubresource), 0);
}

#[tokio::test]
async fn test_clean_unmanaged_variables_prunes_and_updates() {
    let harness = TestHarness::new();
    harness.provider.seed(ResourceKind::Group, "team-a");
    let id = harness.provider.seed(ResourceKind::Project, "team-a/svc");
    for (key, value) in [("LEGACY", "1"), ("TOKEN", "old")] {
        harness.provider.seed_subresource(
            SubresourceParent::Project(id),
            SubresourceSpec::Variable(Variable::new(key, value)),
        );
    }
    harness.write_descriptors(
        "svc.yml",
        vec![],
        vec![DescriptorBuilder::new("svc", "team-a")
            .variable("TOKEN", "new")
            .variable("REGION", "eu")
            .clean_variables()
            .build()],
    );

    harness.run(EngineSettings::default()).await.unwrap();

    let vars = variables(&harness, "team-a/svc");
    assert_eq!(vars.len(), 2);
    assert!(!vars.contains_key("LEGACY"));
    assert_eq!(vars.get("TOKEN").map(String::as_str), Some("new"));
    assert_eq!(vars.get("REGION").map(String::as_str), Some("eu"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_children_start_after_every_parent_level_task_finished() {
    let harness = TestHarness::with_latency(Duration::from_millis(5));
    harness.write_descriptors("tree.yml", group_tree("org", 3), vec![]);

    let engine = harness.engine(EngineSettings::default().with_max_concurrency(4));
    let report = engine.reconcile_groups().await.unwrap();
    assert_eq!(report.created, 13);

    let calls = harness.provider.calls();
    let level1: Vec<String> = (0..3).map(|i| format!("org/g{}", i)).collect();
    let level1_done = calls
        .iter()
        .filter(|c| level1.contains(&c.target) && !c.op.is_lookup())
        .map(|c| c.finished)
        .max()
        .unwrap();
    let level2_start = calls
        .iter()
        .filter(|c| c.target.matches('/').count() == 2)
        .map(|c| c.started)
        .min()
        .unwrap();

    assert!(
        level1_done < level2_start,
        "level 2 started at {level2_start} before level 1 finished at {level1_done}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_never_exceed_limit() {
    let harness = TestHarness::with_latency(Duration::from_millis(5));
    let mut groups = vec![DescriptorBuilder::root("org").build()];
    groups.extend((0..12).map(|i| DescriptorBuilder::new(&format!("g{}", i), "org").build()));
    harness.write_descriptors("wide.yml", groups, vec![]);

    let engine = harness.engine(EngineSettings::default().with_max_concurrency(3));
    engine.reconcile_groups().await.unwrap();

    let max = harness.provider.max_in_flight();
    assert!(max <= 3, "observed {max} calls in flight");
    assert!(max >= 2, "groups did not run concurrently");
}

#[tokio::test]
async fn test_fail_fast_leaves_deeper_levels_untouched() {
    let harness = TestHarness::new();
    harness.write_descriptors("tree.yml", group_tree("org", 2), vec![]);
    harness.provider.fail_on(Operation::Create, "org/g0");

    let err = harness.run(EngineSettings::default()).await.unwrap_err();

    assert!(matches!(err, SheevaError::Provider { .. }));
    assert!(harness.provider.resource(ResourceKind::Group, "org/g1").is_some());
    assert!(harness.provider.resource(ResourceKind::Group, "org/g1/g10").is_none());
}

#[tokio::test]
async fn test_isolated_finishes_unaffected_branches() {
    let harness = TestHarness::new();
    harness.write_descriptors("tree.yml", group_tree("org", 2), vec![]);
    harness.provider.fail_on(Operation::Create, "org/g0");

    let settings = EngineSettings::default().with_failure_policy(FailurePolicy::Isolated);
    let err = harness.run(settings).await.unwrap_err();

    match err {
        SheevaError::Batch { failed, .. } => assert_eq!(failed, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.provider.resource(ResourceKind::Group, "org/g1/g10").is_some());
    assert!(harness.provider.resource(ResourceKind::Group, "org/g1/g11").is_some());
    assert!(harness
        .provider
        .calls()
        .iter()
        .all(|c| !c.target.starts_with("org/g0/")));
}

#[tokio::test]
async fn test_group_freezes_from_file_reach_new_projects() {
    let harness = TestHarness::new();
    harness.write(
        "files/freezes.yml",
        r#"
deploy_freeze:
  - freeze_start: "0 23 * * 5"
    freeze_end: "0 7 * * 1"
  - freeze_start: "0 0 24 12 *"
    freeze_end: "0 0 2 1 *"
    cron_timezone: Europe/Berlin
"#,
    );
    harness.write_descriptors(
        "team-a.yml",
        vec![
            DescriptorBuilder::root("team-a")
                .deploy_freeze_file("files/freezes.yml")
                .build(),
            DescriptorBuilder::new("be", "team-a").build(),
        ],
        vec![
            DescriptorBuilder::new("web", "team-a").build(),
            DescriptorBuilder::new("api", "team-a/be").build(),
        ],
    );

    let report = harness.run(EngineSettings::default()).await.unwrap();
    assert_eq!(report.pass("freeze_periods").unwrap().updated, 1);

    assert_freezes(&harness, &["team-a/web", "team-a/be/api"], 2);

    // Project freezes are replaced and the group's windows re-added, never duplicated.
    harness.run(EngineSettings::default()).await.unwrap();
    assert_freezes(&harness, &["team-a/web", "team-a/be/api"], 2);
}

fn assert_freezes(harness: &TestHarness, projects: &[&str], expected: usize) {
    for path in projects {
        let id = harness.provider.resource(ResourceKind::Project, path).unwrap().id;
        let freezes = harness
            .provider
            .subresources(SubresourceParent::Project(id), SubresourceKind::FreezePeriod);
        assert_eq!(freezes.len(), expected, "{path} has the wrong freezes");
    }
}

#[tokio::test]
async fn test_unrecognized_state_touches_nothing() {
    let harness = TestHarness::new();
    harness.write_descriptors(
        "odd.yml",
        vec![DescriptorBuilder::root("team-a").state("frozen").build()],
        vec![],
    );

    let report = harness.run(EngineSettings::default()).await.unwrap();

    assert_eq!(report.pass("groups").unwrap().invalid, 1);
    assert!(harness.provider.calls().is_empty());
}

#[tokio::test]
async fn test_archive_and_delete() {
    let harness = TestHarness::new();
    harness.provider.seed(ResourceKind::Group, "team-a");
    harness.provider.seed(ResourceKind::Project, "team-a/old");
    harness.provider.seed(ResourceKind::Project, "team-a/gone");
    harness.write_descriptors(
        "team-a.yml",
        vec![],
        vec![
            DescriptorBuilder::new("old", "team-a").state("archived").build(),
            DescriptorBuilder::new("gone", "team-a").state("absent").build(),
            DescriptorBuilder::new("never", "team-a").state("absent").build(),
        ],
    );

    let report = harness.run(EngineSettings::default()).await.unwrap();
    let projects = report.pass("projects").unwrap();

    assert_eq!(projects.archived, 1);
    assert_eq!(projects.deleted, 1);
    assert_eq!(projects.already_absent, 1);
    assert!(harness.provider.resource(ResourceKind::Project, "team-a/old").unwrap().archived);
    assert!(harness.provider.resource(ResourceKind::Project, "team-a/gone").is_none());
}

#[tokio::test]
async fn test_rename_reuses_existing_project() {
    let harness = TestHarness::new();
    harness.provider.seed(ResourceKind::Group, "team-a");
    harness.provider.seed(ResourceKind::Project, "team-a/service");
    harness.write_descriptors(
        "svc.yml",
        vec![],
        vec![DescriptorBuilder::new("svc", "team-a").renamed_from("service").build()],
    );

    let report = harness.run(EngineSettings::default()).await.unwrap();

    assert_eq!(report.pass("projects").unwrap().updated, 1);
    assert_eq!(harness.provider.count(Operation::Create), 0);
    assert!(harness.provider.resource(ResourceKind::Project, "team-a/svc").is_some());
    assert!(harness.provider.resource(ResourceKind::Project, "team-a/service").is_none());
}

#[tokio::test]
async fn test_project_named_like_its_group_lives_inside_it() {
    let harness = TestHarness::new();
    harness.write_descriptors(
        "team-a.yml",
        vec![
            DescriptorBuilder::root("team-a").build(),
            DescriptorBuilder::new("other", "team-a").build(),
        ],
        vec![DescriptorBuilder::new("team-a", "team-a")
            .variable("TOKEN", "abc")
            .build()],
    );
    harness.load().unwrap();

    let report = harness.run(EngineSettings::default()).await.unwrap();

    assert_eq!(report.pass("groups").unwrap().created, 2);
    assert_eq!(report.pass("projects").unwrap().created, 1);
    let group = harness.provider.resource(ResourceKind::Group, "team-a").unwrap();
    let project = harness
        .provider
        .resource(ResourceKind::Project, "team-a/team-a")
        .unwrap();
    assert_eq!(project.parent, Some(group.id));
    assert_eq!(variables(&harness, "team-a/team-a").len(), 1);
}

#[tokio::test]
async fn test_top_level_group_is_moved_under_a_new_parent() {
    let harness = TestHarness::new();
    harness.provider.seed(ResourceKind::Group, "org");
    harness.provider.seed(ResourceKind::Group, "x");
    harness.provider.seed(ResourceKind::Project, "x/svc");
    harness.write_descriptors(
        "org.yml",
        vec![
            DescriptorBuilder::root("org").build(),
            DescriptorBuilder::new("x", "org").transferred_from("x").build(),
        ],
        vec![],
    );

    let report = harness.run(EngineSettings::default()).await.unwrap();

    assert_eq!(report.pass("groups").unwrap().updated, 2);
    assert_eq!(harness.provider.count(Operation::Create), 0);
    assert_eq!(harness.provider.count(Operation::Transfer), 1);
    assert!(harness.provider.resource(ResourceKind::Group, "x").is_none());
    assert!(harness.provider.resource(ResourceKind::Project, "org/x/svc").is_some());
}
