//! Append-only audit log.

use super::{Database, now_ms};
use crate::types::{Event, EventType};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

/// Append an event using an existing connection or transaction.
pub(crate) fn append_event(
    conn: &Connection,
    project: &str,
    task_id: Option<&str>,
    event_type: EventType,
    node: Option<&str>,
    details: serde_json::Value,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (timestamp, project, task_id, event_type, node, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![now_ms(), project, task_id, event_type, node, details.to_string()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn parse_event_row(row: &Row) -> rusqlite::Result<Event> {
    let details: String = row.get("details")?;
    Ok(Event {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        project: row.get("project")?,
        task_id: row.get("task_id")?,
        event_type: row.get("event_type")?,
        node: row.get("node")?,
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
    })
}

impl Database {
    pub fn append_event(
        &self,
        project: &str,
        task_id: Option<&str>,
        event_type: EventType,
        node: Option<&str>,
        details: serde_json::Value,
    ) -> Result<i64> {
        self.with_conn(|conn| append_event(conn, project, task_id, event_type, node, details))
    }

    /// Last `limit` events of a project, oldest first.
    pub fn recent_events(&self, project: &str, limit: usize) -> Result<Vec<Event>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM (
                    SELECT * FROM events WHERE project = ?1 ORDER BY id DESC LIMIT ?2
                 ) ORDER BY id ASC",
            )?;
            let events = stmt
                .query_map(params![project, limit as i64], parse_event_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
    }

    /// Full history of one task, oldest first.
    pub fn task_events(&self, task_id: &str) -> Result<Vec<Event>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM events WHERE task_id = ?1 ORDER BY id")?;
            let events = stmt
                .query_map(params![task_id], parse_event_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
    }

    /// Event types a task went through, in order. Mostly useful in tests.
    pub fn task_event_types(&self, task_id: &str) -> Result<Vec<EventType>> {
        Ok(self.task_events(task_id)?.into_iter().map(|e| e.event_type).collect())
    }

    /// Number of events of one type recorded for a project.
    pub fn count_events(&self, project: &str, event_type: EventType) -> Result<i64> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM events WHERE project = ?1 AND event_type = ?2",
                params![project, event_type],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }
}
