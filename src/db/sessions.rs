//! Session registry: check-in, heartbeat, check-out and stale-session reaping.

use super::{Database, decode_list, duration_ms, now_ms};
use super::locks::reap_expired_locks_internal;
use crate::config::LeaseConfig;
use crate::error::ToolError;
use crate::types::{CapabilityProfile, ContextTier, ReleaseSummary, Session, SessionStatus};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::time::Duration;
use uuid::Uuid;

/// Maximum length for session IDs.
pub const MAX_SESSION_ID_LEN: usize = 64;

const SESSION_COLUMNS: &str = "id, name, strengths, best_for, context_tier, status, current_task, \
     active_tasks, completed_tasks, help_requests, max_claims, registered_at, last_heartbeat, \
     (SELECT COUNT(*) FROM tasks \
      WHERE tasks.assignee = sessions.id AND tasks.status = 'in_progress') AS claimed_tasks";

fn parse_session_row(row: &Row) -> rusqlite::Result<Session> {
    let strengths: String = row.get("strengths")?;
    let best_for: String = row.get("best_for")?;
    let context_tier: String = row.get("context_tier")?;
    let status: String = row.get("status")?;

    Ok(Session {
        id: row.get("id")?,
        name: row.get("name")?,
        capabilities: CapabilityProfile {
            strengths: decode_list(&strengths),
            best_for: decode_list(&best_for),
            context_tier: ContextTier::parse(&context_tier).unwrap_or_default(),
        },
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Offline),
        current_task: row.get("current_task")?,
        active_tasks: row.get("active_tasks")?,
        claimed_tasks: row.get("claimed_tasks")?,
        completed_tasks: row.get("completed_tasks")?,
        help_requests: row.get("help_requests")?,
        max_claims: row.get("max_claims")?,
        registered_at: row.get("registered_at")?,
        last_heartbeat: row.get("last_heartbeat")?,
    })
}

/// Internal helper to get a session using an existing connection (avoids deadlock).
pub(crate) fn get_session_internal(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![session_id], parse_session_row)
        .optional()?)
}

pub(crate) fn require_session_internal(conn: &Connection, session_id: &str) -> Result<Session> {
    get_session_internal(conn, session_id)?
        .ok_or_else(|| ToolError::session_not_found(session_id).into())
}

fn validate_session_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ToolError::invalid_value("session_id", "Session ID cannot be empty").into());
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(ToolError::invalid_value(
            "session_id",
            format!(
                "Session ID must be at most {} characters, got {}",
                MAX_SESSION_ID_LEN,
                id.len()
            ),
        )
        .into());
    }
    Ok(())
}

fn random_name() -> String {
    use petname::{Generator, Petnames};

    Petnames::medium()
        .generate_one(2, "-")
        .unwrap_or_else(|| format!("worker-{}", now_ms()))
}

/// Register an unseen worker (named after its id) or refresh a known one.
/// Used by the claim path, which accepts bare worker ids.
pub(crate) fn ensure_session(
    conn: &Connection,
    worker_id: &str,
    default_max_claims: i64,
    now: i64,
) -> Result<Session> {
    validate_session_id(worker_id)?;

    conn.execute(
        "INSERT INTO sessions (id, name, max_claims, status, registered_at, last_heartbeat)
         VALUES (?1, ?1, ?2, 'idle', ?3, ?3)
         ON CONFLICT(id) DO UPDATE SET
             last_heartbeat = excluded.last_heartbeat,
             status = CASE WHEN active_tasks > 0 THEN 'active' ELSE 'idle' END",
        params![worker_id, default_max_claims, now],
    )?;

    require_session_internal(conn, worker_id)
}

/// Bookkeeping for a newly held active lock.
pub(crate) fn note_active_lock_acquired(conn: &Connection, session_id: &str, task_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET active_tasks = active_tasks + 1, current_task = ?2, status = 'active'
         WHERE id = ?1",
        params![session_id, task_id],
    )?;
    Ok(())
}

/// Bookkeeping for a dropped active lock.
pub(crate) fn note_active_lock_released(conn: &Connection, session_id: &str, task_id: &str) -> Result<()> {
    // SQLite evaluates every SET expression against the pre-update row
    conn.execute(
        "UPDATE sessions SET
             active_tasks = MAX(active_tasks - 1, 0),
             current_task = CASE WHEN current_task = ?2 THEN NULL ELSE current_task END,
             status = CASE
                 WHEN status = 'offline' THEN 'offline'
                 WHEN active_tasks - 1 > 0 THEN 'active'
                 ELSE 'idle'
             END
         WHERE id = ?1",
        params![session_id, task_id],
    )?;
    Ok(())
}

/// Take a session offline and give back everything it held.
pub(crate) fn release_session_internal(
    conn: &Connection,
    session_id: &str,
    now: i64,
    summary: &mut ReleaseSummary,
) -> Result<()> {
    let requeued = {
        let mut stmt = conn.prepare(
            "SELECT id FROM tasks WHERE assignee = ?1 AND status = 'in_progress' ORDER BY seq",
        )?;
        stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?
    };

    conn.execute(
        "UPDATE tasks SET status = 'queued', assignee = NULL, started_at = NULL, updated_at = ?2
         WHERE assignee = ?1 AND status = 'in_progress'",
        params![session_id, now],
    )?;

    let locks = conn.execute("DELETE FROM task_locks WHERE session_id = ?1", params![session_id])?;

    let cancelled = conn.execute(
        "UPDATE help_requests SET status = 'cancelled', cancelled_at = ?2
         WHERE requester = ?1 AND status = 'open'",
        params![session_id, now],
    )?;

    conn.execute(
        "UPDATE sessions SET status = 'offline', active_tasks = 0, current_task = NULL WHERE id = ?1",
        params![session_id],
    )?;

    summary.sessions.push(session_id.to_string());
    summary.requeued_tasks.extend(requeued);
    summary.locks_released += locks as i64;
    summary.help_cancelled += cancelled as i64;
    Ok(())
}

impl Database {
    /// Check a worker in.
    ///
    /// If `session_id` is given and known, the session is reactivated and its
    /// profile replaced. If not given, a UUID7 (time-sortable) is generated.
    /// Omitted names become a random petname.
    pub fn check_in(
        &self,
        session_id: Option<String>,
        name: Option<String>,
        capabilities: CapabilityProfile,
        max_claims: Option<i64>,
        default_max_claims: i64,
    ) -> Result<Session> {
        let id = match session_id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => Uuid::now_v7().to_string(),
        };
        if let Some(limit) = max_claims {
            if limit < 1 {
                return Err(ToolError::invalid_value("max_claims", "max_claims must be at least 1").into());
            }
        }
        let strengths = serde_json::to_string(&capabilities.strengths)?;
        let best_for = serde_json::to_string(&capabilities.best_for)?;
        let now = now_ms();

        self.with_write_tx(|tx| {
            match get_session_internal(tx, &id)? {
                Some(existing) => {
                    let name = name.clone().unwrap_or(existing.name);
                    let max_claims = max_claims.unwrap_or(existing.max_claims);
                    tx.execute(
                        "UPDATE sessions SET
                             name = ?2, strengths = ?3, best_for = ?4, context_tier = ?5,
                             max_claims = ?6, last_heartbeat = ?7,
                             status = CASE WHEN active_tasks > 0 THEN 'active' ELSE 'idle' END
                         WHERE id = ?1",
                        params![
                            &id,
                            name,
                            strengths,
                            best_for,
                            capabilities.context_tier.as_str(),
                            max_claims,
                            now,
                        ],
                    )?;
                }
                None => {
                    let name = name.clone().unwrap_or_else(random_name);
                    tx.execute(
                        "INSERT INTO sessions (
                             id, name, strengths, best_for, context_tier, status, max_claims,
                             registered_at, last_heartbeat
                         ) VALUES (?1, ?2, ?3, ?4, ?5, 'idle', ?6, ?7, ?7)",
                        params![
                            &id,
                            name,
                            strengths,
                            best_for,
                            capabilities.context_tier.as_str(),
                            max_claims.unwrap_or(default_max_claims),
                            now,
                        ],
                    )?;
                }
            }

            require_session_internal(tx, &id)
        })
    }

    /// Record a heartbeat. Revives an offline session and renews the leases
    /// of every unexpired lock it holds; expired locks stay expired.
    pub fn heartbeat(&self, session_id: &str, leases: &LeaseConfig) -> Result<Session> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            let updated = tx.execute(
                "UPDATE sessions SET
                     last_heartbeat = ?2,
                     status = CASE WHEN active_tasks > 0 THEN 'active' ELSE 'idle' END
                 WHERE id = ?1",
                params![session_id, now],
            )?;
            if updated == 0 {
                return Err(ToolError::session_not_found(session_id).into());
            }

            tx.execute(
                "UPDATE task_locks SET
                     expires_at = MAX(expires_at, ?2 + CASE strength
                         WHEN 'active' THEN ?3
                         WHEN 'soft' THEN ?4
                         ELSE ?5
                     END),
                     last_heartbeat = ?2
                 WHERE session_id = ?1 AND expires_at > ?2",
                params![
                    session_id,
                    now,
                    duration_ms(leases.active()),
                    duration_ms(leases.soft()),
                    duration_ms(leases.helper()),
                ],
            )?;

            require_session_internal(tx, session_id)
        })
    }

    /// Check a session out: requeue its tasks, drop its locks, cancel its open help requests.
    pub fn check_out(&self, session_id: &str) -> Result<ReleaseSummary> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            require_session_internal(tx, session_id)?;
            let mut summary = ReleaseSummary::default();
            release_session_internal(tx, session_id, now, &mut summary)?;
            Ok(summary)
        })
    }

    /// Reap sessions whose last heartbeat is older than `timeout`, plus any
    /// expired locks. Running it twice in a row changes nothing the second time.
    pub fn reap_stale(&self, timeout: Duration) -> Result<ReleaseSummary> {
        let now = now_ms();
        let cutoff = now - duration_ms(timeout);

        self.with_write_tx(|tx| {
            let stale = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM sessions
                     WHERE status != 'offline' AND last_heartbeat < ?1
                     ORDER BY last_heartbeat",
                )?;
                stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?
            };

            let mut summary = ReleaseSummary::default();
            for session_id in &stale {
                release_session_internal(tx, session_id, now, &mut summary)?;
            }
            summary.locks_released += reap_expired_locks_internal(tx, None, now)?;

            Ok(summary)
        })
    }

    /// Get a session by ID.
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.with_conn(|conn| get_session_internal(conn, session_id))
    }

    /// Get a session by ID, failing with `SessionNotFound`.
    pub fn require_session(&self, session_id: &str) -> Result<Session> {
        self.with_conn(|conn| require_session_internal(conn, session_id))
    }

    /// List sessions, most recently registered first.
    pub fn list_sessions(&self, include_offline: bool) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let sql = if include_offline {
                format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY registered_at DESC, id")
            } else {
                format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status != 'offline'
                     ORDER BY registered_at DESC, id"
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let sessions = stmt
                .query_map([], parse_session_row)?
                .collect::<rusqlite::Result<Vec<Session>>>()?;
            Ok(sessions)
        })
    }

    /// Number of in-progress tasks assigned to a session.
    pub fn claim_count(&self, session_id: &str) -> Result<i64> {
        self.with_conn(|conn| claim_count_internal(conn, session_id))
    }
}

pub(crate) fn claim_count_internal(conn: &Connection, session_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE assignee = ?1 AND status = 'in_progress'",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(count)
}
