//! Node registry: capacity, capability tags and the slot cache.

use super::events::append_event;
use super::{Database, now_ms};
use crate::types::{EventType, Node, NodeSpec, SlotDrift};
use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::json;

fn parse_node_row(row: &Row) -> rusqlite::Result<Node> {
    let enabled: i64 = row.get("enabled")?;
    Ok(Node {
        name: row.get("name")?,
        host: row.get("host")?,
        slots: row.get("slots")?,
        running_count: row.get("running_count")?,
        enabled: enabled != 0,
        executor: row.get("executor")?,
        priority: row.get("priority")?,
        work_dir: row.get("work_dir")?,
        last_seen: row.get("last_seen")?,
        registered_at: row.get("registered_at")?,
    })
}

impl Database {
    /// Insert or update a node. The running-count cache is left untouched, and so is
    /// `enabled` once the node exists: after first registration the operator owns it.
    pub fn register_node(&self, spec: &NodeSpec) -> Result<()> {
        if spec.slots <= 0 {
            return Err(anyhow!("node {} must have at least one slot", spec.name));
        }
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO nodes (name, host, slots, enabled, executor, priority, work_dir, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(name) DO UPDATE SET
                    host = excluded.host,
                    slots = excluded.slots,
                    executor = excluded.executor,
                    priority = excluded.priority,
                    work_dir = excluded.work_dir",
                params![
                    &spec.name,
                    &spec.host,
                    spec.slots,
                    spec.enabled as i64,
                    &spec.executor,
                    spec.priority,
                    &spec.work_dir,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.with_conn(|conn| {
            let node = conn
                .query_row("SELECT * FROM nodes WHERE name = ?1", params![name], parse_node_row)
                .optional()?;
            Ok(node)
        })
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM nodes ORDER BY priority, name")?;
            let nodes = stmt
                .query_map([], parse_node_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
    }

    /// Enabled nodes with a free slot, best first.
    ///
    /// `executor = Some(tag)` restricts to nodes of that capability class.
    /// Order is (priority ASC, free slots DESC, name ASC).
    pub fn available_nodes(&self, executor: Option<&str>) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM nodes
                 WHERE enabled = 1
                 AND slots - running_count > 0
                 AND (?1 IS NULL OR executor = ?1)
                 ORDER BY priority ASC, (slots - running_count) DESC, name ASC",
            )?;
            let nodes = stmt
                .query_map(params![executor], parse_node_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
    }

    /// Recompute every node's running count from the task table.
    ///
    /// Any disagreement is corrected immediately and returned.
    pub fn reconcile_running_counts(&self, project: &str) -> Result<Vec<SlotDrift>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let rows: Vec<(String, i32, i32)> = {
                let mut stmt = tx.prepare(
                    "SELECT n.name, n.running_count,
                        (SELECT COUNT(*) FROM tasks t
                         WHERE t.node = n.name AND t.status IN ('claimed', 'running'))
                     FROM nodes n ORDER BY n.name",
                )?;
                stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            let mut drift = Vec::new();
            for (node, cached, actual) in rows {
                if cached == actual {
                    continue;
                }
                tx.execute(
                    "UPDATE nodes SET running_count = ?1 WHERE name = ?2",
                    params![actual, &node],
                )?;
                append_event(
                    &tx,
                    project,
                    None,
                    EventType::SlotDrift,
                    Some(&node),
                    json!({ "cached": cached, "actual": actual }),
                )?;
                drift.push(SlotDrift { node, cached, actual });
            }

            tx.commit()?;
            Ok(drift)
        })
    }

    /// Enable or disable a node. Returns false if it does not exist.
    pub fn set_node_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE nodes SET enabled = ?1 WHERE name = ?2",
                params![enabled as i64, name],
            )?;
            Ok(updated > 0)
        })
    }

    /// Stamp `last_seen` after a successful health check.
    pub fn touch_node(&self, name: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute("UPDATE nodes SET last_seen = ?1 WHERE name = ?2", params![now, name])?;
            Ok(())
        })
    }
}
