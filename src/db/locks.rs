//! Task locks: exclusive (active/soft) and shared (helper) leases.

use super::sessions::{note_active_lock_acquired, note_active_lock_released, require_session_internal};
use super::tasks::require_task_internal;
use super::{Database, duration_ms, now_ms};
use crate::error::ToolError;
use crate::types::{LockStrength, TaskLock};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::time::Duration;

fn parse_lock_row(row: &Row) -> rusqlite::Result<TaskLock> {
    let strength: String = row.get("strength")?;
    Ok(TaskLock {
        task_id: row.get("task_id")?,
        session_id: row.get("session_id")?,
        strength: LockStrength::parse(&strength).unwrap_or(LockStrength::Soft),
        acquired_at: row.get("acquired_at")?,
        expires_at: row.get("expires_at")?,
        last_heartbeat: row.get("last_heartbeat")?,
    })
}

fn get_lock_internal(conn: &Connection, task_id: &str, session_id: &str) -> Result<Option<TaskLock>> {
    Ok(conn
        .query_row(
            "SELECT task_id, session_id, strength, acquired_at, expires_at, last_heartbeat
             FROM task_locks WHERE task_id = ?1 AND session_id = ?2",
            params![task_id, session_id],
            parse_lock_row,
        )
        .optional()?)
}

/// The session holding an unexpired active/soft lock on the task, other than `except`.
pub(crate) fn exclusive_holder(
    conn: &Connection,
    task_id: &str,
    except: &str,
    now: i64,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT session_id FROM task_locks
             WHERE task_id = ?1 AND session_id != ?2
               AND strength IN ('active', 'soft') AND expires_at > ?3
             LIMIT 1",
            params![task_id, except, now],
            |row| row.get(0),
        )
        .optional()?)
}

/// Delete one lock row, keeping the holder's counters in step.
/// Returns the strength of the removed lock.
pub(crate) fn remove_lock_internal(
    conn: &Connection,
    task_id: &str,
    session_id: &str,
) -> Result<Option<LockStrength>> {
    let Some(lock) = get_lock_internal(conn, task_id, session_id)? else {
        return Ok(None);
    };

    conn.execute(
        "DELETE FROM task_locks WHERE task_id = ?1 AND session_id = ?2",
        params![task_id, session_id],
    )?;
    if lock.strength == LockStrength::Active {
        note_active_lock_released(conn, session_id, task_id)?;
    }

    Ok(Some(lock.strength))
}

/// Remove every lock on a task. Returns how many were dropped.
pub(crate) fn remove_task_locks_internal(conn: &Connection, task_id: &str) -> Result<i64> {
    let holders = {
        let mut stmt = conn.prepare("SELECT session_id FROM task_locks WHERE task_id = ?1")?;
        stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?
    };
    for session_id in &holders {
        remove_lock_internal(conn, task_id, session_id)?;
    }
    Ok(holders.len() as i64)
}

/// Drop locks whose lease has run out, on one task or everywhere.
pub(crate) fn reap_expired_locks_internal(
    conn: &Connection,
    task_id: Option<&str>,
    now: i64,
) -> Result<i64> {
    let expired = {
        let mut stmt = conn.prepare(
            "SELECT task_id, session_id FROM task_locks
             WHERE expires_at <= ?1 AND (?2 IS NULL OR task_id = ?2)",
        )?;
        stmt.query_map(params![now, task_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()?
    };
    for (task, session) in &expired {
        remove_lock_internal(conn, task, session)?;
    }
    Ok(expired.len() as i64)
}

/// Acquire or re-acquire a lock on an existing connection.
///
/// Returns `false` when an unexpired active/soft lock of another session
/// blocks an exclusive acquire. Helpers never conflict.
pub(crate) fn acquire_lock_internal(
    conn: &Connection,
    task_id: &str,
    session_id: &str,
    strength: LockStrength,
    lease_ms: i64,
    now: i64,
) -> Result<bool> {
    reap_expired_locks_internal(conn, Some(task_id), now)?;

    if strength.is_exclusive() && exclusive_holder(conn, task_id, session_id, now)?.is_some() {
        return Ok(false);
    }

    let expires_at = now.saturating_add(lease_ms);

    match get_lock_internal(conn, task_id, session_id)? {
        Some(existing) => {
            conn.execute(
                "UPDATE task_locks SET strength = ?3, expires_at = MAX(expires_at, ?4), last_heartbeat = ?5
                 WHERE task_id = ?1 AND session_id = ?2",
                params![task_id, session_id, strength.as_str(), expires_at, now],
            )?;
            match (existing.strength, strength) {
                (LockStrength::Active, LockStrength::Active) => {}
                (LockStrength::Active, _) => note_active_lock_released(conn, session_id, task_id)?,
                (_, LockStrength::Active) => note_active_lock_acquired(conn, session_id, task_id)?,
                _ => {}
            }
        }
        None => {
            conn.execute(
                "INSERT INTO task_locks (task_id, session_id, strength, acquired_at, expires_at, last_heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?4)",
                params![task_id, session_id, strength.as_str(), now, expires_at],
            )?;
            if strength == LockStrength::Active {
                note_active_lock_acquired(conn, session_id, task_id)?;
            }
        }
    }

    Ok(true)
}

impl Database {
    /// Acquire a lock on a task for a session.
    ///
    /// Expired locks on the task are reaped first. Returns `false` if another
    /// session holds an unexpired active or soft lock and `strength` is exclusive.
    pub fn acquire_lock(
        &self,
        task_id: &str,
        session_id: &str,
        strength: LockStrength,
        lease: Duration,
    ) -> Result<bool> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            require_task_internal(tx, task_id)?;
            require_session_internal(tx, session_id)?;
            acquire_lock_internal(tx, task_id, session_id, strength, duration_ms(lease), now)
        })
    }

    /// Release a session's lock on a task. Returns `false` if there was none.
    pub fn release_lock(&self, task_id: &str, session_id: &str) -> Result<bool> {
        self.with_write_tx(|tx| Ok(remove_lock_internal(tx, task_id, session_id)?.is_some()))
    }

    /// Extend a lock's expiry to at least `now + lease`; never shortens it.
    /// A lock already past its expiry counts as released.
    pub fn heartbeat_lock(&self, task_id: &str, session_id: &str, lease: Duration) -> Result<TaskLock> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            let lock = match get_lock_internal(tx, task_id, session_id)? {
                Some(lock) if !lock.is_expired_at(now) => lock,
                _ => return Err(ToolError::lease_expired(task_id, session_id).into()),
            };

            let expires_at = lock.expires_at.max(now.saturating_add(duration_ms(lease)));
            tx.execute(
                "UPDATE task_locks SET expires_at = ?3, last_heartbeat = ?4
                 WHERE task_id = ?1 AND session_id = ?2",
                params![task_id, session_id, expires_at, now],
            )?;

            Ok(TaskLock {
                expires_at,
                last_heartbeat: now,
                ..lock
            })
        })
    }

    /// Get a specific lock.
    pub fn get_lock(&self, task_id: &str, session_id: &str) -> Result<Option<TaskLock>> {
        self.with_conn(|conn| get_lock_internal(conn, task_id, session_id))
    }

    /// All locks on a task, including expired ones not yet reaped.
    pub fn locks_for_task(&self, task_id: &str) -> Result<Vec<TaskLock>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, session_id, strength, acquired_at, expires_at, last_heartbeat
                 FROM task_locks WHERE task_id = ?1 ORDER BY acquired_at, session_id",
            )?;
            let locks = stmt
                .query_map(params![task_id], parse_lock_row)?
                .collect::<rusqlite::Result<Vec<TaskLock>>>()?;
            Ok(locks)
        })
    }

    /// All locks held by a session.
    pub fn locks_for_session(&self, session_id: &str) -> Result<Vec<TaskLock>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, session_id, strength, acquired_at, expires_at, last_heartbeat
                 FROM task_locks WHERE session_id = ?1 ORDER BY acquired_at, task_id",
            )?;
            let locks = stmt
                .query_map(params![session_id], parse_lock_row)?
                .collect::<rusqlite::Result<Vec<TaskLock>>>()?;
            Ok(locks)
        })
    }

    /// Every lock in the store, oldest first.
    pub fn list_locks(&self) -> Result<Vec<TaskLock>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, session_id, strength, acquired_at, expires_at, last_heartbeat
                 FROM task_locks ORDER BY acquired_at, task_id, session_id",
            )?;
            let locks = stmt
                .query_map([], parse_lock_row)?
                .collect::<rusqlite::Result<Vec<TaskLock>>>()?;
            Ok(locks)
        })
    }

    /// Drop every expired lock. Returns how many were removed.
    pub fn reap_expired_locks(&self) -> Result<i64> {
        let now = now_ms();
        self.with_write_tx(|tx| reap_expired_locks_internal(tx, None, now))
    }
}
