//! Aggregation queries for status and reports.

use super::Database;
use crate::types::{StatusCounts, TaskStatus};
use anyhow::Result;
use rusqlite::params;
use std::collections::BTreeMap;

impl Database {
    /// Task counts per status for one project.
    pub fn status_counts(&self, project: &str) -> Result<StatusCounts> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE project = ?1 GROUP BY status")?;
            let rows = stmt
                .query_map(params![project], |row| {
                    Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = StatusCounts::default();
            for (status, n) in rows {
                counts.add(status, n);
            }
            Ok(counts)
        })
    }

    /// Counts for every project that has tasks, keyed by project name.
    pub fn all_status_counts(&self) -> Result<BTreeMap<String, StatusCounts>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT project, status, COUNT(*) FROM tasks GROUP BY project, status")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, TaskStatus>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut out: BTreeMap<String, StatusCounts> = BTreeMap::new();
            for (project, status, n) in rows {
                out.entry(project).or_default().add(status, n);
            }
            Ok(out)
        })
    }

    /// Mean wall time of completed tasks in a project, in milliseconds.
    pub fn mean_task_duration_ms(&self, project: &str) -> Result<Option<f64>> {
        self.with_conn(|conn| {
            let mean = conn.query_row(
                "SELECT AVG(completed_at - started_at) FROM tasks
                 WHERE project = ?1 AND status = 'completed'
                 AND started_at IS NOT NULL AND completed_at IS NOT NULL",
                params![project],
                |row| row.get::<_, Option<f64>>(0),
            )?;
            Ok(mean)
        })
    }
}
