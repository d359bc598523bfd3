//! Table-driven tests for loading and validating descriptor directories.

mod common;

use sheeva::config::DesiredState;
use sheeva::error::ConfigError;

use common::TestHarness;

struct LoadCase {
    name: &'static str,
    files: &'static [(&'static str, &'static str)],
    should_succeed: bool,
    expected_error: Option<&'static str>,
}

const LOAD_CASES: &[LoadCase] = &[
    LoadCase {
        name: "empty_directory",
        files: &[],
        should_succeed: true,
        expected_error: None,
    },
    LoadCase {
        name: "groups_and_projects",
        files: &[(
            "team-a.yml",
            r#"
groups:
  - name: team-a
    namespace: team-a
projects:
  - name: svc
    namespace: team-a
"#,
        )],
        should_succeed: true,
        expected_error: None,
    },
    LoadCase {
        name: "empty_file",
        files: &[("empty.yaml", "   \n")],
        should_succeed: true,
        expected_error: None,
    },
    LoadCase {
        name: "invalid_yaml",
        files: &[("broken.yml", "groups: [name: x")],
        should_succeed: false,
        expected_error: Some("Failed to parse YAML"),
    },
    LoadCase {
        name: "duplicate_group_across_files",
        files: &[
            ("a.yml", "groups:\n  - name: team-a\n    namespace: team-a\n"),
            ("b.yml", "groups:\n  - name: team-a\n    namespace: team-a\n"),
        ],
        should_succeed: false,
        expected_error: Some("Duplicate group path 'team-a'"),
    },
    LoadCase {
        name: "project_named_like_its_group",
        files: &[(
            "team-a.yml",
            "groups:\n  - name: team-a\n    namespace: team-a\nprojects:\n  - name: team-a\n    namespace: team-a\n",
        )],
        should_succeed: true,
        expected_error: None,
    },
    LoadCase {
        name: "duplicate_variable",
        files: &[(
            "p.yml",
            r#"
projects:
  - name: svc
    namespace: team-a
    variables:
      - key: A
        value: "1"
      - key: A
        value: "2"
"#,
        )],
        should_succeed: false,
        expected_error: Some("duplicate variable 'A'"),
    },
    LoadCase {
        name: "hidden_and_foreign_files_ignored",
        files: &[
            (".draft.yml", "groups: [this is not valid"),
            ("notes.txt", "groups: [this is not valid"),
        ],
        should_succeed: true,
        expected_error: None,
    },
];

#[test]
fn test_load_cases() {
    for case in LOAD_CASES {
        let harness = TestHarness::new();
        for (name, content) in case.files {
            harness.write(name, content);
        }

        let result = harness.load();

        if case.should_succeed {
            assert!(result.is_ok(), "{}: unexpected error {:?}", case.name, result.err());
        } else {
            let err = result.expect_err(case.name).to_string();
            if let Some(expected) = case.expected_error {
                assert!(
                    err.contains(expected),
                    "{}: '{}' does not contain '{}'",
                    case.name,
                    err,
                    expected
                );
            }
        }
    }
}

#[test]
fn test_files_are_read_in_name_order() {
    let harness = TestHarness::new();
    harness.write("20-b.yml", "groups:\n  - name: b\n    namespace: b\n");
    harness.write("10-a.yaml", "groups:\n  - name: a\n    namespace: a\n");

    let config = harness.load().unwrap();

    let names: Vec<_> = config.groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
    assert_eq!(config.files.len(), 2);
}

#[test]
fn test_relative_file_references_resolve_against_directory() {
    let harness = TestHarness::new();
    harness.write(
        "svc.yml",
        r#"
projects:
  - name: svc
    namespace: team-a
    variables_file: vars/svc.yml
    avatar: /srv/logo.png
"#,
    );

    let config = harness.load().unwrap();
    let project = &config.projects[0];

    assert_eq!(
        project.variables_file.as_deref(),
        Some(harness.config_dir.join("vars/svc.yml").as_path())
    );
    assert_eq!(
        project.avatar.as_deref(),
        Some(std::path::Path::new("/srv/logo.png"))
    );
}

#[test]
fn test_unknown_state_is_kept_for_the_reconciler() {
    let harness = TestHarness::new();
    harness.write("g.yml", "groups:\n  - name: a\n    namespace: a\n    state: frozen\n");

    let config = harness.load().unwrap();

    assert_eq!(
        config.groups[0].state,
        DesiredState::Unrecognized("frozen".to_string())
    );
}

#[test]
fn test_missing_directory() {
    let harness = TestHarness::new();
    let loader = sheeva::ConfigLoader::new(harness.config_dir.join("nope"));

    assert!(matches!(loader.load(), Err(ConfigError::DirectoryNotFound(_))));
}
