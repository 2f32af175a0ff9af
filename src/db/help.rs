//! Help-request broker: open → accepted → completed, or open → cancelled.

use super::locks::{acquire_lock_internal, remove_lock_internal};
use super::sessions::require_session_internal;
use super::tasks::require_task_internal;
use super::{Database, duration_ms, now_ms};
use crate::error::ToolError;
use crate::types::{HelpRequest, HelpStatus, LockStrength, NewHelpRequest, Priority, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::time::Duration;
use uuid::Uuid;

const HELP_COLUMNS: &str = "id, task_id, requester, helper, category, urgency, context, status, \
     outcome, created_at, accepted_at, completed_at, cancelled_at";

fn parse_help_row(row: &Row) -> rusqlite::Result<HelpRequest> {
    let urgency: String = row.get("urgency")?;
    let status: String = row.get("status")?;
    Ok(HelpRequest {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        requester: row.get("requester")?,
        helper: row.get("helper")?,
        category: row.get("category")?,
        urgency: Priority::parse(&urgency).unwrap_or_default(),
        context: row.get("context")?,
        status: HelpStatus::parse(&status).unwrap_or(HelpStatus::Cancelled),
        outcome: row.get("outcome")?,
        created_at: row.get("created_at")?,
        accepted_at: row.get("accepted_at")?,
        completed_at: row.get("completed_at")?,
        cancelled_at: row.get("cancelled_at")?,
    })
}

fn get_help_internal(conn: &Connection, request_id: &str) -> Result<Option<HelpRequest>> {
    let sql = format!("SELECT {HELP_COLUMNS} FROM help_requests WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![request_id], parse_help_row)
        .optional()?)
}

fn require_help_internal(conn: &Connection, request_id: &str) -> Result<HelpRequest> {
    get_help_internal(conn, request_id)?.ok_or_else(|| ToolError::help_not_found(request_id).into())
}

fn wrong_state(request: &HelpRequest, expected: HelpStatus) -> anyhow::Error {
    ToolError::invalid_state(format!(
        "Help request {} is {}, expected {}",
        request.id,
        request.status.as_str(),
        expected.as_str()
    ))
    .into()
}

/// Is the session working the task: its assignee, or holding an unexpired lock on it?
fn is_working_task(conn: &Connection, task_id: &str, session_id: &str, now: i64) -> Result<bool> {
    let task = require_task_internal(conn, task_id)?;
    if task.status == TaskStatus::InProgress && task.assignee.as_deref() == Some(session_id) {
        return Ok(true);
    }
    let holds: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM task_locks WHERE task_id = ?1 AND session_id = ?2 AND expires_at > ?3",
            params![task_id, session_id, now],
            |row| row.get(0),
        )
        .optional()?;
    Ok(holds.is_some())
}

/// Strength of the session's lock on the task, ignoring locks expired at `now`.
fn current_strength(
    conn: &Connection,
    task_id: &str,
    session_id: &str,
    now: i64,
) -> Result<Option<LockStrength>> {
    let strength: Option<String> = conn
        .query_row(
            "SELECT strength FROM task_locks WHERE task_id = ?1 AND session_id = ?2 AND expires_at > ?3",
            params![task_id, session_id, now],
            |row| row.get(0),
        )
        .optional()?;
    Ok(strength.as_deref().and_then(LockStrength::parse))
}

impl Database {
    /// Open a help request on a task the requester is working.
    pub fn request_help(&self, input: NewHelpRequest) -> Result<HelpRequest> {
        let category = input.category.trim().to_string();
        if category.is_empty() {
            return Err(ToolError::missing_field("category").into());
        }
        let now = now_ms();
        let id = Uuid::now_v7().to_string();

        self.with_write_tx(|tx| {
            require_session_internal(tx, &input.requester)?;
            if !is_working_task(tx, &input.task_id, &input.requester, now)? {
                return Err(ToolError::not_owner(&input.task_id, &input.requester).into());
            }

            tx.execute(
                "INSERT INTO help_requests (id, task_id, requester, category, urgency, context, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7)",
                params![
                    &id,
                    &input.task_id,
                    &input.requester,
                    &category,
                    input.urgency.as_str(),
                    &input.context,
                    now,
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET help_requests = help_requests + 1 WHERE id = ?1",
                params![&input.requester],
            )?;

            require_help_internal(tx, &id)
        })
    }

    /// Accept an open request: the helper takes a helper lock on the task.
    /// The requester's own lock is left untouched.
    pub fn accept_help(&self, request_id: &str, helper: &str, lease: Duration) -> Result<HelpRequest> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            let request = require_help_internal(tx, request_id)?;
            if request.status != HelpStatus::Open {
                return Err(wrong_state(&request, HelpStatus::Open));
            }
            if request.requester == helper {
                return Err(ToolError::invalid_value(
                    "helper",
                    "A session cannot accept its own help request",
                )
                .into());
            }
            require_session_internal(tx, helper)?;

            // A helper that already holds the task exclusively keeps that lock
            let existing = current_strength(tx, &request.task_id, helper, now)?;
            if !existing.is_some_and(|s| s.is_exclusive()) {
                acquire_lock_internal(
                    tx,
                    &request.task_id,
                    helper,
                    LockStrength::Helper,
                    duration_ms(lease),
                    now,
                )?;
            }

            tx.execute(
                "UPDATE help_requests SET status = 'accepted', helper = ?2, accepted_at = ?3
                 WHERE id = ?1 AND status = 'open'",
                params![request_id, helper, now],
            )?;

            Ok(HelpRequest {
                status: HelpStatus::Accepted,
                helper: Some(helper.to_string()),
                accepted_at: Some(now),
                ..request
            })
        })
    }

    /// Close an accepted request: the helper's lock is released and the
    /// outcome summary appended to the record.
    pub fn complete_help(&self, request_id: &str, helper: &str, outcome: &str) -> Result<HelpRequest> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            let request = require_help_internal(tx, request_id)?;
            if request.status != HelpStatus::Accepted {
                return Err(wrong_state(&request, HelpStatus::Accepted));
            }
            if request.helper.as_deref() != Some(helper) {
                return Err(ToolError::not_owner(&request.task_id, helper)
                    .with_details(format!("{} is not the helper on request {}", helper, request_id))
                    .into());
            }

            // Only drop the lock if it is still the helper lease from accept
            let strength = current_strength(tx, &request.task_id, helper, i64::MIN)?;
            if strength == Some(LockStrength::Helper) {
                remove_lock_internal(tx, &request.task_id, helper)?;
            }

            let outcome = match request.outcome.as_deref() {
                Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, outcome),
                _ => outcome.to_string(),
            };
            tx.execute(
                "UPDATE help_requests SET status = 'completed', outcome = ?2, completed_at = ?3
                 WHERE id = ?1",
                params![request_id, &outcome, now],
            )?;

            Ok(HelpRequest {
                status: HelpStatus::Completed,
                outcome: Some(outcome),
                completed_at: Some(now),
                ..request
            })
        })
    }

    /// Withdraw an open request. Only the requester may cancel.
    pub fn cancel_help(&self, request_id: &str, requester: &str) -> Result<HelpRequest> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            let request = require_help_internal(tx, request_id)?;
            if request.status != HelpStatus::Open {
                return Err(wrong_state(&request, HelpStatus::Open));
            }
            if request.requester != requester {
                return Err(ToolError::not_owner(&request.task_id, requester)
                    .with_details(format!("{} did not raise request {}", requester, request_id))
                    .into());
            }

            tx.execute(
                "UPDATE help_requests SET status = 'cancelled', cancelled_at = ?2 WHERE id = ?1",
                params![request_id, now],
            )?;

            Ok(HelpRequest {
                status: HelpStatus::Cancelled,
                cancelled_at: Some(now),
                ..request
            })
        })
    }

    /// Get a help request by ID.
    pub fn get_help(&self, request_id: &str) -> Result<Option<HelpRequest>> {
        self.with_conn(|conn| get_help_internal(conn, request_id))
    }

    /// List help requests, oldest first, optionally filtered by status.
    pub fn list_help(&self, status: Option<HelpStatus>) -> Result<Vec<HelpRequest>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {HELP_COLUMNS} FROM help_requests
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let requests = stmt
                .query_map(params![status.map(|s| s.as_str())], parse_help_row)?
                .collect::<rusqlite::Result<Vec<HelpRequest>>>()?;
            Ok(requests)
        })
    }
}
