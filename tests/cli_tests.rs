//! CLI tests for fawkes-flow.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use chrono::Utc;
use fawkes_flow::flow::db::{FlowDb, NewTransition};
use flow_common::{TransitionSource, WorkItemType};
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const STAGES: &str = r#"
stages:
  - name: Backlog
    type: wait
    order: 1
    wip_limit: null
    description: Waiting to be picked up
  - name: Development
    type: active
    order: 2
    wip_limit: 3
    description: Being built
  - name: Production
    type: done
    order: 3
    description: Running in production
"#;

fn flow() -> Command {
    cargo_bin_cmd!("fawkes-flow")
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join(".fawkes/flow.db")
}

fn init_project(dir: &TempDir, seed: bool) {
    let mut cmd = flow();
    cmd.current_dir(dir.path()).arg("init");
    if seed {
        cmd.arg("--seed-defaults");
    }
    cmd.assert().success();
}

// =============================================================================
// Basics
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        flow()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("load-stages"))
            .stdout(predicate::str::contains("verify-projection"));
    }

    #[test]
    fn test_version() {
        flow().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();
        flow()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("flow.toml"))
            .stdout(predicate::str::contains("load-stages"));

        assert!(dir.path().join(".fawkes/flow.toml").exists());
        assert!(dir.path().join(".fawkes/stages.yaml").exists());
        assert!(db_path(&dir).exists());

        let db = FlowDb::new(&db_path(&dir)).unwrap();
        assert!(db.list_stages().unwrap().is_empty());
    }

    #[test]
    fn test_init_with_seed_loads_default_catalog() {
        let dir = TempDir::new().unwrap();
        flow()
            .current_dir(dir.path())
            .args(["init", "--seed-defaults"])
            .assert()
            .success()
            .stdout(predicate::str::contains("8 created"));

        let db = FlowDb::new(&db_path(&dir)).unwrap();
        let names: Vec<String> = db.list_stages().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names.first().map(String::as_str), Some("Backlog"));
        assert_eq!(names.last().map(String::as_str), Some("Production"));
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".fawkes")).unwrap();
        fs::write(dir.path().join(".fawkes/flow.toml"), "[server]\nport = 9100\n").unwrap();

        flow()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".fawkes/flow.toml")).unwrap();
        assert!(content.contains("9100"));
    }
}

// =============================================================================
// Stage loading
// =============================================================================

mod load_stages {
    use super::*;

    #[test]
    fn test_load_then_skip_then_update() {
        let dir = TempDir::new().unwrap();
        init_project(&dir, false);
        fs::write(dir.path().join("stages.yaml"), STAGES).unwrap();

        flow()
            .current_dir(dir.path())
            .args(["load-stages", "stages.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created: 3"));

        flow()
            .current_dir(dir.path())
            .args(["load-stages", "stages.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Skipped: 3"));

        fs::write(
            dir.path().join("stages.yaml"),
            STAGES.replace("wip_limit: 3", "wip_limit: 5"),
        )
        .unwrap();
        flow()
            .current_dir(dir.path())
            .args(["load-stages", "stages.yaml", "--update"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Updated: 3"));

        let db = FlowDb::new(&db_path(&dir)).unwrap();
        let dev = db.get_stage_by_name("Development").unwrap().unwrap();
        assert_eq!(dev.wip_limit, Some(5));
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        init_project(&dir, false);
        fs::write(dir.path().join("stages.yaml"), STAGES).unwrap();

        flow()
            .current_dir(dir.path())
            .args(["load-stages", "stages.yaml", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("DRY RUN"))
            .stdout(predicate::str::contains("Created: 3"));

        let db = FlowDb::new(&db_path(&dir)).unwrap();
        assert!(db.list_stages().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        init_project(&dir, false);
        fs::write(
            dir.path().join("bad.yaml"),
            STAGES.replace("order: 2", "order: 1"),
        )
        .unwrap();

        flow()
            .current_dir(dir.path())
            .args(["load-stages", "bad.yaml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("duplicate order 1"));
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        flow()
            .current_dir(dir.path())
            .args(["load-stages", "nope.yaml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read stages file"));
    }
}

// =============================================================================
// Config validation
// =============================================================================

mod validate_config {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let dir = TempDir::new().unwrap();
        flow()
            .current_dir(dir.path())
            .arg("validate-config")
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_unknown_policy_table_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".fawkes")).unwrap();
        fs::write(
            dir.path().join(".fawkes/flow.toml"),
            "[policy]\ntable = \"anything-goes\"\n",
        )
        .unwrap();

        flow()
            .current_dir(dir.path())
            .arg("validate-config")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown policy table"));
    }

    #[test]
    fn test_stages_cross_check_warns_on_unknown_policy_stage() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".fawkes")).unwrap();
        fs::write(
            dir.path().join(".fawkes/flow.toml"),
            "[policy]\nretry = [{ from = \"QA\", to = \"Development\" }]\n",
        )
        .unwrap();
        fs::write(dir.path().join("stages.yaml"), STAGES).unwrap();

        flow()
            .current_dir(dir.path())
            .args(["validate-config", "--stages", "stages.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("unknown stage 'QA'"));
    }

    #[test]
    fn test_invalid_stages_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("stages.yaml"),
            STAGES.replace("type: active", "type: busy"),
        )
        .unwrap();

        flow()
            .current_dir(dir.path())
            .args(["validate-config", "--stages", "stages.yaml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid type 'busy'"));
    }
}

// =============================================================================
// Projection verification
// =============================================================================

mod verify_projection {
    use super::*;

    /// One work item in Backlog, with its projection row removed.
    fn diverged_project() -> TempDir {
        let dir = TempDir::new().unwrap();
        init_project(&dir, true);

        let db = FlowDb::new(&db_path(&dir)).unwrap();
        let backlog = db.get_stage_by_name("Backlog").unwrap().unwrap();
        let now = Utc::now();
        let id = db.insert_work_item("A", WorkItemType::Feature, now).unwrap();
        db.append_transition(&NewTransition {
            work_item_id: id,
            from_stage_id: None,
            to_stage_id: backlog.id,
            timestamp: now,
            observed_at: now,
            source: TransitionSource::Api,
            timestamp_clamped: false,
        })
        .unwrap();
        db.replace_projection(&[]).unwrap();
        dir
    }

    #[test]
    fn test_consistent_projection_passes() {
        let dir = TempDir::new().unwrap();
        init_project(&dir, true);
        flow()
            .current_dir(dir.path())
            .arg("verify-projection")
            .assert()
            .success()
            .stdout(predicate::str::contains("consistent"));
    }

    #[test]
    fn test_divergence_fails_then_repairs() {
        let dir = diverged_project();

        flow()
            .current_dir(dir.path())
            .arg("verify-projection")
            .assert()
            .failure()
            .stdout(predicate::str::contains("log says Backlog"))
            .stderr(predicate::str::contains("--repair"));

        flow()
            .current_dir(dir.path())
            .args(["verify-projection", "--repair"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Repaired 1"));

        flow()
            .current_dir(dir.path())
            .arg("verify-projection")
            .assert()
            .success()
            .stdout(predicate::str::contains("consistent"));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = TempDir::new().unwrap();
        init_project(&dir, true);
        let elsewhere = TempDir::new().unwrap();
        flow()
            .current_dir(elsewhere.path())
            .arg("--project-dir")
            .arg(dir.path())
            .arg("verify-projection")
            .assert()
            .success();
    }
}
