//! Directory-level import tests: idempotence, drift and rejection of bad specs.

mod common;

use common::{Spec, setup_db, write_spec};
use task_dispatch::error::SpecError;
use task_dispatch::scanner;
use task_dispatch::types::{EventType, TaskStatus};
use tempfile::TempDir;

#[test]
fn rescanning_is_idempotent() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    write_spec(dir.path(), &Spec::new("T-1", &["src/a.rs"]));
    write_spec(dir.path(), &Spec::new("T-2", &["src/b.rs"]).after(&["T-1"]));

    let first = scanner::import(&db, "web", dir.path(), 2).unwrap();
    assert_eq!(first.inserted, vec!["T-1", "T-2"]);

    let second = scanner::import(&db, "web", dir.path(), 2).unwrap();
    assert!(second.inserted.is_empty());
    assert_eq!(second.unchanged, vec!["T-1", "T-2"]);
    assert_eq!(db.list_tasks(Some("web")).unwrap().len(), 2);
    assert_eq!(db.count_events("web", EventType::TasksScanned).unwrap(), 2);
}

#[test]
fn edited_spec_is_reported_as_drift_and_left_alone() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    write_spec(dir.path(), &Spec::new("T-1", &["src/a.rs"]));
    scanner::import(&db, "web", dir.path(), 2).unwrap();

    db.claim_task("T-1", "n1").unwrap();
    write_spec(dir.path(), &Spec::new("T-1", &["src/a.rs", "src/other.rs"]));

    let report = scanner::import(&db, "web", dir.path(), 2).unwrap();
    assert_eq!(report.drifted, vec!["T-1"]);

    let task = db.get_task("T-1").unwrap().unwrap();
    assert_eq!(task.modifies, vec!["src/a.rs"]);
    assert_eq!(task.status, TaskStatus::Claimed);
}

#[test]
fn invalid_specs_are_rejected_without_stopping_the_scan() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    write_spec(dir.path(), &Spec::new("T-1", &["src/a.rs"]));
    write_spec(dir.path(), &Spec::new("T-2", &[]));
    std::fs::write(dir.path().join("T-3.md"), "# no front matter\n").unwrap();

    let report = scanner::import(&db, "web", dir.path(), 2).unwrap();
    assert_eq!(report.inserted, vec!["T-1"]);
    assert_eq!(report.rejected.len(), 2);
    assert!(matches!(report.rejected[0], SpecError::EmptyModifies { .. }));
    assert!(matches!(report.rejected[1], SpecError::NoFrontMatter { .. }));
    assert!(db.get_task("T-2").unwrap().is_none());
}

#[test]
fn duplicate_id_keeps_the_first_file() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("T-1-a.md"), "---\nmodifies: [a]\n---\n# First\n").unwrap();
    std::fs::write(dir.path().join("T-1-b.md"), "---\nmodifies: [b]\n---\n# Second\n").unwrap();

    let report = scanner::import(&db, "web", dir.path(), 2).unwrap();
    assert_eq!(report.inserted, vec!["T-1"]);
    assert_eq!(report.rejected.len(), 1);
    assert!(matches!(&report.rejected[0], SpecError::DuplicateId { id, .. } if id == "T-1"));
    assert_eq!(db.get_task("T-1").unwrap().unwrap().title.as_deref(), Some("First"));
}

#[test]
fn non_spec_files_are_ignored() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    write_spec(dir.path(), &Spec::new("T-1", &["a"]));
    std::fs::write(dir.path().join("README.md"), "# Notes\n").unwrap();
    std::fs::write(dir.path().join("T-9.txt"), "---\nmodifies: [a]\n---\n").unwrap();

    let report = scanner::import(&db, "web", dir.path(), 2).unwrap();
    assert_eq!(report.total_valid(), 1);
    assert!(report.rejected.is_empty());
}

#[test]
fn front_matter_values_reach_the_store() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    write_spec(
        dir.path(),
        &Spec::new("T-1", &["db/schema.sql"]).with("exclusive: true\npriority: 3\nmax_retries: 5\nexecutor: gpu"),
    );

    scanner::import(&db, "web", dir.path(), 2).unwrap();
    let task = db.get_task("T-1").unwrap().unwrap();
    assert!(task.exclusive);
    assert_eq!(task.priority, 3);
    assert_eq!(task.max_retries, 5);
    assert_eq!(task.executor.as_deref(), Some("gpu"));
    assert_eq!(task.spec_hash.len(), 64);
}

#[test]
fn task_ids_are_not_shared_between_projects() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    write_spec(dir.path(), &Spec::new("T-1", &["a"]));
    scanner::import(&db, "web", dir.path(), 2).unwrap();

    let report = scanner::import(&db, "api", dir.path(), 2).unwrap();
    assert_eq!(report.total_valid(), 0);
    assert_eq!(db.get_task("T-1").unwrap().unwrap().project, "web");
}

#[test]
fn missing_directory_is_an_error() {
    let db = setup_db();
    let dir = TempDir::new().unwrap();
    assert!(scanner::import(&db, "web", &dir.path().join("nope"), 2).is_err());
}
