//! Advisory file locks keyed by (path, task).

use super::events::append_event;
use super::{Database, now_ms, placeholders};
use crate::types::{EventType, FileLock, LockConflict};
use anyhow::Result;
use rusqlite::{Connection, params, params_from_iter};
use serde_json::json;
use std::collections::BTreeSet;

/// Insert one lock row per path for `task_id`. Re-acquiring is a no-op.
pub(crate) fn acquire_locks_internal(
    conn: &Connection,
    task_id: &str,
    paths: &[String],
    now: i64,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO file_locks (file_path, task_id, locked_at) VALUES (?1, ?2, ?3)",
    )?;
    let mut inserted = 0;
    for path in paths {
        inserted += stmt.execute(params![path, task_id, now])?;
    }
    Ok(inserted)
}

/// Delete every lock row held by `task_id`.
pub(crate) fn release_locks_internal(conn: &Connection, task_id: &str) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM file_locks WHERE task_id = ?1", params![task_id])?;
    Ok(deleted)
}

impl Database {
    /// Lock `paths` for `task_id`.
    pub fn acquire_locks(&self, task_id: &str, paths: &[String]) -> Result<usize> {
        let now = now_ms();
        self.with_conn(|conn| acquire_locks_internal(conn, task_id, paths, now))
    }

    /// Release all locks held by `task_id`.
    pub fn release_locks(&self, task_id: &str) -> Result<usize> {
        self.with_conn(|conn| release_locks_internal(conn, task_id))
    }

    /// Paths in `paths` held by some other live task.
    ///
    /// A holder blocks while it is claimed or running, and while it is an
    /// exclusive task waiting in `pending` for its next attempt.
    pub fn check_conflicts(&self, paths: &[String], requester: &str) -> Result<Vec<LockConflict>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        // Dedupe so the IN list stays small for specs that repeat a path
        let unique: Vec<&String> = paths.iter().collect::<BTreeSet<_>>().into_iter().collect();

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT l.file_path, l.task_id
                 FROM file_locks l
                 JOIN tasks t ON t.id = l.task_id
                 WHERE l.task_id != ?1
                 AND l.file_path IN ({})
                 AND (t.status IN ('claimed', 'running')
                      OR (t.status = 'pending' AND t.exclusive = 1))
                 ORDER BY l.file_path, l.task_id",
                placeholders(2, unique.len())
            );

            let mut args: Vec<&str> = Vec::with_capacity(unique.len() + 1);
            args.push(requester);
            args.extend(unique.iter().map(|p| p.as_str()));

            let mut stmt = conn.prepare(&sql)?;
            let conflicts = stmt
                .query_map(params_from_iter(args), |row| {
                    Ok(LockConflict {
                        path: row.get(0)?,
                        holder: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conflicts)
        })
    }

    /// Delete locks whose holder is terminal or no longer exists.
    ///
    /// Terminal transitions release their locks in the same transaction, so
    /// a non-zero result means some earlier write went wrong.
    pub fn prune_stale_locks(&self, project: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let stale: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT l.file_path, l.task_id FROM file_locks l
                     LEFT JOIN tasks t ON t.id = l.task_id
                     WHERE t.id IS NULL OR t.status IN ('completed', 'failed')",
                )?;
                stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            if stale.is_empty() {
                return Ok(0);
            }

            for (path, task_id) in &stale {
                tx.execute(
                    "DELETE FROM file_locks WHERE file_path = ?1 AND task_id = ?2",
                    params![path, task_id],
                )?;
            }

            let holders: BTreeSet<&str> = stale.iter().map(|(_, t)| t.as_str()).collect();
            append_event(
                &tx,
                project,
                None,
                EventType::LocksPruned,
                None,
                json!({ "count": stale.len(), "holders": holders }),
            )?;

            tx.commit()?;
            Ok(stale.len())
        })
    }

    /// All lock rows, ordered by path.
    pub fn list_locks(&self) -> Result<Vec<FileLock>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_path, task_id, locked_at FROM file_locks ORDER BY file_path, task_id",
            )?;
            let locks = stmt
                .query_map([], |row| {
                    Ok(FileLock {
                        file_path: row.get(0)?,
                        task_id: row.get(1)?,
                        locked_at: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(locks)
        })
    }

    /// Paths currently locked by one task.
    pub fn locks_for_task(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT file_path FROM file_locks WHERE task_id = ?1 ORDER BY file_path")?;
            let paths = stmt
                .query_map(params![task_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(paths)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeSpec, TaskDraft};

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.register_node(&NodeSpec::new("n1", "http://n1", 4)).unwrap();
        for (id, exclusive) in [("T-1", false), ("T-2", false), ("T-3", true)] {
            let draft = TaskDraft::new(id, "proj", format!("{}.md", id), "h", vec!["shared.rs".into()])
                .unwrap()
                .with_exclusive(exclusive);
            db.insert_draft(&draft).unwrap();
        }
        db
    }

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn acquire_is_idempotent() {
        let db = setup();
        assert_eq!(db.acquire_locks("T-1", &paths(&["a.rs", "b.rs"])).unwrap(), 2);
        assert_eq!(db.acquire_locks("T-1", &paths(&["a.rs"])).unwrap(), 0);
        assert_eq!(db.locks_for_task("T-1").unwrap(), paths(&["a.rs", "b.rs"]));
        assert_eq!(db.release_locks("T-1").unwrap(), 2);
    }

    #[test]
    fn conflict_only_against_active_holders() {
        let db = setup();
        // T-1 pending but holding a row: not a conflict
        db.acquire_locks("T-1", &paths(&["shared.rs"])).unwrap();
        assert!(db.check_conflicts(&paths(&["shared.rs"]), "T-2").unwrap().is_empty());

        db.release_locks("T-1").unwrap();
        db.claim_task("T-1", "n1").unwrap();
        let conflicts = db.check_conflicts(&paths(&["shared.rs", "other.rs"]), "T-2").unwrap();
        assert_eq!(
            conflicts,
            vec![LockConflict {
                path: "shared.rs".into(),
                holder: "T-1".into()
            }]
        );

        // requester never conflicts with itself
        assert!(db.check_conflicts(&paths(&["shared.rs"]), "T-1").unwrap().is_empty());
    }

    #[test]
    fn pending_exclusive_holder_blocks() {
        let db = setup();
        db.acquire_locks("T-3", &paths(&["shared.rs"])).unwrap();
        let conflicts = db.check_conflicts(&paths(&["shared.rs"]), "T-1").unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].holder, "T-3");
    }

    #[test]
    fn prune_removes_terminal_and_missing_holders() {
        let db = setup();
        db.acquire_locks("ghost", &paths(&["x.rs"])).unwrap();
        db.claim_task("T-1", "n1").unwrap();
        db.mark_running("T-1", None).unwrap();
        db.complete_task("T-1", None).unwrap();
        // simulate a leaked row for a completed task
        db.acquire_locks("T-1", &paths(&["shared.rs"])).unwrap();

        assert_eq!(db.prune_stale_locks("proj").unwrap(), 2);
        assert!(db.list_locks().unwrap().is_empty());
        assert_eq!(db.prune_stale_locks("proj").unwrap(), 0);
    }
}
