//! Integration tests for the database layer.
//!
//! These tests verify the store operations using an in-memory SQLite database.
//! Tests are organized by module and functionality.

mod common;

use common::setup_db;
use task_dispatch::db::Database;
use task_dispatch::db::tasks::{FailOutcome, InsertOutcome};
use task_dispatch::types::{EventType, NodeSpec, TaskDraft, TaskStatus};

fn draft(id: &str, modifies: &[&str]) -> TaskDraft {
    TaskDraft::new(
        id,
        "web",
        format!("specs/{}.md", id),
        format!("hash-{}", id),
        modifies.iter().map(|s| s.to_string()).collect(),
    )
    .unwrap()
}

fn insert(db: &Database, d: TaskDraft) {
    assert_eq!(db.insert_draft(&d).unwrap(), InsertOutcome::Inserted);
}

fn with_node(db: &Database, name: &str, slots: i32) {
    db.register_node(&NodeSpec::new(name, format!("http://{}", name), slots))
        .unwrap();
}

/// Claim and start a task on `node`.
fn start(db: &Database, id: &str, node: &str) {
    db.claim_task(id, node).unwrap().expect("task should be claimable");
    db.mark_running(id, Some(1)).unwrap().expect("task should be claimed");
}

mod task_lifecycle_tests {
    use super::*;

    #[test]
    fn completion_releases_slot_and_locks() {
        let db = setup_db();
        with_node(&db, "n1", 1);
        insert(&db, draft("T-1", &["a", "b"]));
        start(&db, "T-1", "n1");

        let duration = db.complete_task("T-1", None).unwrap();
        assert!(duration.is_some());
        assert_eq!(db.get_node("n1").unwrap().unwrap().running_count, 0);
        assert!(db.locks_for_task("T-1").unwrap().is_empty());

        // a late duplicate report changes nothing
        assert!(db.complete_task("T-1", None).unwrap().is_none());
        assert_eq!(db.count_events("web", EventType::TaskCompleted).unwrap(), 1);
    }

    #[test]
    fn failure_retries_until_budget_is_spent() {
        let db = setup_db();
        with_node(&db, "n1", 1);
        insert(&db, draft("T-1", &["a"]).with_max_retries(2));

        start(&db, "T-1", "n1");
        assert_eq!(db.fail_task("T-1", "exit 1").unwrap(), Some(FailOutcome::Retrying));
        let task = db.get_task("T-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 1);
        assert!(task.node.is_none());

        start(&db, "T-1", "n1");
        assert_eq!(db.fail_task("T-1", "exit 1").unwrap(), Some(FailOutcome::Exhausted));
        let task = db.get_task("T-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 2);
        assert_eq!(db.get_node("n1").unwrap().unwrap().running_count, 0);

        // nothing left to retry
        assert!(db.retry_failed_tasks("web", &[]).unwrap().is_empty());
    }

    #[test]
    fn zero_retry_budget_fails_on_first_error() {
        let db = setup_db();
        with_node(&db, "n1", 1);
        insert(&db, draft("T-1", &["a"]).with_max_retries(0));
        start(&db, "T-1", "n1");

        assert_eq!(db.fail_task("T-1", "exit 1").unwrap(), Some(FailOutcome::Exhausted));
        let task = db.get_task("T-1").unwrap().unwrap();
        assert_eq!(task.attempt, 0);
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn operator_reset_gives_a_fresh_budget() {
        let db = setup_db();
        with_node(&db, "n1", 1);
        insert(&db, draft("T-1", &["a"]).with_max_retries(1));
        start(&db, "T-1", "n1");
        db.fail_task("T-1", "exit 1").unwrap();

        assert_eq!(db.reset_failed_tasks("web").unwrap(), vec!["T-1"]);
        let task = db.get_task("T-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 0);
        assert!(task.error.is_none());
        assert!(db.task_event_types("T-1").unwrap().contains(&EventType::OperatorRetry));
    }

    #[test]
    fn retry_skips_blocked_tasks() {
        let db = setup_db();
        insert(&db, draft("T-1", &["a"]));
        insert(&db, draft("T-2", &["b"]));
        db.with_conn(|conn| {
            conn.execute("UPDATE tasks SET status = 'failed', attempt = 1", [])?;
            Ok(())
        })
        .unwrap();

        let reset = db.retry_failed_tasks("web", &["T-2".to_string()]).unwrap();
        assert_eq!(reset, vec!["T-1"]);
        assert_eq!(db.get_task("T-2").unwrap().unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn stale_query_uses_heartbeat() {
        let db = setup_db();
        with_node(&db, "n1", 2);
        insert(&db, draft("T-1", &["a"]));
        insert(&db, draft("T-2", &["b"]));
        start(&db, "T-1", "n1");
        start(&db, "T-2", "n1");
        db.with_conn(|conn| {
            conn.execute("UPDATE tasks SET heartbeat_at = 5 WHERE id = 'T-1'", [])?;
            Ok(())
        })
        .unwrap();

        let stale = db.stale_running_tasks("web", 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "T-1");
    }
}

mod lock_tests {
    use super::*;

    #[test]
    fn overlapping_claims_conflict() {
        let db = setup_db();
        with_node(&db, "n1", 4);
        insert(&db, draft("T-1", &["src/a.rs", "src/b.rs"]));
        insert(&db, draft("T-2", &["src/b.rs"]));
        insert(&db, draft("T-3", &["src/c.rs"]));

        db.claim_task("T-1", "n1").unwrap();

        let conflicts = db.check_conflicts(&["src/b.rs".to_string()], "T-2").unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].holder, "T-1");
        assert!(db.check_conflicts(&["src/c.rs".to_string()], "T-3").unwrap().is_empty());
        // a task never conflicts with itself
        assert!(db.check_conflicts(&["src/b.rs".to_string()], "T-1").unwrap().is_empty());
    }

    #[test]
    fn exclusive_task_keeps_locks_between_attempts() {
        let db = setup_db();
        with_node(&db, "n1", 2);
        insert(&db, draft("T-1", &["src/schema.sql"]).with_exclusive(true));
        insert(&db, draft("T-2", &["src/schema.sql"]));

        start(&db, "T-1", "n1");
        assert_eq!(db.fail_task("T-1", "exit 1").unwrap(), Some(FailOutcome::Retrying));

        assert_eq!(db.get_task("T-1").unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(db.locks_for_task("T-1").unwrap(), vec!["src/schema.sql"]);
        let conflicts = db.check_conflicts(&["src/schema.sql".to_string()], "T-2").unwrap();
        assert_eq!(conflicts.len(), 1);

        // the holder itself can be claimed again
        assert!(db.check_conflicts(&["src/schema.sql".to_string()], "T-1").unwrap().is_empty());
        start(&db, "T-1", "n1");
        db.complete_task("T-1", None).unwrap();
        assert!(db.check_conflicts(&["src/schema.sql".to_string()], "T-2").unwrap().is_empty());
    }

    #[test]
    fn non_exclusive_retry_releases_locks() {
        let db = setup_db();
        with_node(&db, "n1", 1);
        insert(&db, draft("T-1", &["a"]));
        start(&db, "T-1", "n1");
        db.fail_task("T-1", "exit 1").unwrap();
        assert!(db.locks_for_task("T-1").unwrap().is_empty());
    }

    #[test]
    fn prune_removes_orphaned_rows() {
        let db = setup_db();
        insert(&db, draft("T-1", &["a"]));
        db.acquire_locks("T-1", &["a".to_string()]).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE tasks SET status = 'completed' WHERE id = 'T-1'", [])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.prune_stale_locks("web").unwrap(), 1);
        assert!(db.list_locks().unwrap().is_empty());
        assert_eq!(db.count_events("web", EventType::LocksPruned).unwrap(), 1);
        assert_eq!(db.prune_stale_locks("web").unwrap(), 0);
    }
}

mod node_tests {
    use super::*;

    #[test]
    fn register_is_an_upsert_that_keeps_the_count() {
        let db = setup_db();
        with_node(&db, "n1", 2);
        insert(&db, draft("T-1", &["a"]));
        db.claim_task("T-1", "n1").unwrap();

        db.register_node(&NodeSpec::new("n1", "http://n1:9000", 4).with_priority(3))
            .unwrap();
        let node = db.get_node("n1").unwrap().unwrap();
        assert_eq!(node.slots, 4);
        assert_eq!(node.host, "http://n1:9000");
        assert_eq!(node.priority, 3);
        assert_eq!(node.running_count, 1);
    }

    #[test]
    fn available_nodes_order_and_filter() {
        let db = setup_db();
        db.register_node(&NodeSpec::new("b", "h", 2)).unwrap();
        db.register_node(&NodeSpec::new("a", "h", 2)).unwrap();
        db.register_node(&NodeSpec::new("big", "h", 8)).unwrap();
        db.register_node(&NodeSpec::new("low", "h", 8).with_priority(1)).unwrap();
        db.register_node(&NodeSpec::new("gpu", "h", 1).with_executor("gpu")).unwrap();
        db.set_node_enabled("b", false).unwrap();

        let names: Vec<String> = db.available_nodes(None).unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["big", "a", "gpu", "low"]);

        let gpu: Vec<String> = db.available_nodes(Some("gpu")).unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(gpu, vec!["gpu"]);
    }

    #[test]
    fn reconcile_corrects_drift() {
        let db = setup_db();
        with_node(&db, "n1", 4);
        insert(&db, draft("T-1", &["a"]));
        db.claim_task("T-1", "n1").unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE nodes SET running_count = 3 WHERE name = 'n1'", [])?;
            Ok(())
        })
        .unwrap();

        let drift = db.reconcile_running_counts("web").unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!((drift[0].cached, drift[0].actual), (3, 1));
        assert_eq!(db.get_node("n1").unwrap().unwrap().running_count, 1);
        assert!(db.reconcile_running_counts("web").unwrap().is_empty());
    }

    #[test]
    fn slot_conservation_over_a_mixed_history() {
        let db = setup_db();
        with_node(&db, "n1", 3);
        for i in 1..=4 {
            insert(&db, draft(&format!("T-{}", i), &[&format!("f{}", i)]));
        }

        start(&db, "T-1", "n1");
        start(&db, "T-2", "n1");
        db.claim_task("T-3", "n1").unwrap();
        db.complete_task("T-1", None).unwrap();
        db.fail_task("T-2", "boom").unwrap();
        db.unclaim_task("T-3", "busy").unwrap();
        start(&db, "T-4", "n1");
        db.mark_killed("T-4").unwrap();

        assert_eq!(db.get_node("n1").unwrap().unwrap().running_count, 0);
        assert!(db.reconcile_running_counts("web").unwrap().is_empty());
    }
}

mod event_tests {
    use super::*;

    #[test]
    fn history_is_append_only() {
        let db = setup_db();
        insert(&db, draft("T-1", &["a"]));
        db.append_event("web", Some("T-1"), EventType::TaskRetried, None, serde_json::json!({}))
            .unwrap();

        let update = db.with_conn(|conn| {
            conn.execute("UPDATE events SET event_type = 'task_completed'", [])?;
            Ok(())
        });
        assert!(update.is_err());
        let delete = db.with_conn(|conn| {
            conn.execute("DELETE FROM events", [])?;
            Ok(())
        });
        assert!(delete.is_err());
        assert_eq!(db.task_events("T-1").unwrap().len(), 1);
    }

    #[test]
    fn recent_events_are_oldest_first_and_limited() {
        let db = setup_db();
        for i in 0..5 {
            db.append_event("web", None, EventType::TasksScanned, None, serde_json::json!({ "n": i }))
                .unwrap();
        }
        let events = db.recent_events("web", 3).unwrap();
        let ns: Vec<i64> = events.iter().map(|e| e.details["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3, 4]);
    }
}
