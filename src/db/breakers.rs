//! Persisted circuit-breaker state, one row per project.

use super::events::append_event;
use super::{Database, now_ms};
use crate::breaker::{BreakerState, CircuitBreaker, Transition};
use crate::types::EventType;
use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, params};
use serde_json::json;

impl Database {
    /// Load a project's breaker, or a fresh closed one.
    pub fn load_breaker(&self, project: &str) -> Result<CircuitBreaker> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT state, no_progress_cycles, last_signature, signature_repeats,
                            opened_at, cooldown_until, trips
                     FROM circuit_breakers WHERE project = ?1",
                    params![project],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, u32>(3)?,
                            row.get::<_, Option<i64>>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                            row.get::<_, u32>(6)?,
                        ))
                    },
                )
                .optional()?;

            let Some((state, no_progress_cycles, last_signature, signature_repeats, opened_at, cooldown_until, trips)) =
                row
            else {
                return Ok(CircuitBreaker::new(project));
            };

            let state = BreakerState::parse(&state)
                .ok_or_else(|| anyhow!("unknown breaker state '{}' for {}", state, project))?;

            Ok(CircuitBreaker {
                project: project.to_string(),
                state,
                no_progress_cycles,
                last_signature,
                signature_repeats,
                opened_at,
                cooldown_until,
                trips,
            })
        })
    }

    /// Persist the breaker, recording `transition` as an event in the same
    /// transaction when there was one.
    pub fn save_breaker(&self, breaker: &CircuitBreaker, transition: Option<&Transition>) -> Result<()> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO circuit_breakers (
                    project, state, no_progress_cycles, last_signature, signature_repeats,
                    opened_at, cooldown_until, trips, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(project) DO UPDATE SET
                    state = excluded.state,
                    no_progress_cycles = excluded.no_progress_cycles,
                    last_signature = excluded.last_signature,
                    signature_repeats = excluded.signature_repeats,
                    opened_at = excluded.opened_at,
                    cooldown_until = excluded.cooldown_until,
                    trips = excluded.trips,
                    updated_at = excluded.updated_at",
                params![
                    &breaker.project,
                    breaker.state.as_str(),
                    breaker.no_progress_cycles,
                    &breaker.last_signature,
                    breaker.signature_repeats,
                    breaker.opened_at,
                    breaker.cooldown_until,
                    breaker.trips,
                    now,
                ],
            )?;

            if let Some(transition) = transition {
                let (event_type, details) = match transition {
                    Transition::Opened { reason } => (
                        EventType::BreakerOpened,
                        json!({ "reason": reason, "cooldown_until": breaker.cooldown_until, "trips": breaker.trips }),
                    ),
                    Transition::HalfOpened => (EventType::BreakerHalfOpen, json!({})),
                    Transition::Closed => (EventType::BreakerClosed, json!({})),
                };
                append_event(&tx, &breaker.project, None, event_type, None, details)?;
            }

            tx.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_row_loads_closed() {
        let db = Database::open_in_memory().unwrap();
        let b = db.load_breaker("p").unwrap();
        assert_eq!(b, CircuitBreaker::new("p"));
    }

    #[test]
    fn save_and_reload() {
        let db = Database::open_in_memory().unwrap();
        let mut b = CircuitBreaker::new("p");
        b.state = BreakerState::Open;
        b.cooldown_until = Some(1234);
        b.trips = 2;
        b.last_signature = Some("exit #".into());

        let t = Transition::Opened { reason: "test".into() };
        db.save_breaker(&b, Some(&t)).unwrap();
        assert_eq!(db.load_breaker("p").unwrap(), b);
        assert_eq!(db.count_events("p", EventType::BreakerOpened).unwrap(), 1);

        b.close();
        db.save_breaker(&b, Some(&Transition::Closed)).unwrap();
        assert_eq!(db.load_breaker("p").unwrap().state, BreakerState::Closed);
    }
}
