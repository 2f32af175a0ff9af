//! Claim engine: atomic task assignment and worker completion reports.

use super::locks::{acquire_lock_internal, exclusive_holder, remove_task_locks_internal};
use super::sessions::{claim_count_internal, ensure_session};
use super::tasks::{queued_tasks_in_claim_order, require_task_internal, unmet_dependencies};
use super::{Database, duration_ms, now_ms};
use crate::error::ToolError;
use crate::types::{BlockedTask, ClaimOutcome, LockStrength, Priority, Task, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, params};
use std::time::Duration;
use tracing::debug;

/// Knobs the claim path needs from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    /// Lease on the active lock written with every claim.
    pub active_lease: Duration,
    /// `max_claims` given to workers registered implicitly by a claim.
    pub default_max_claims: i64,
}

/// Mark `task` in progress for `worker_id` and take the worker's active lock.
fn assign(conn: &Connection, task: Task, worker_id: &str, lease_ms: i64, now: i64) -> Result<Task> {
    let updated = conn.execute(
        "UPDATE tasks SET status = 'in_progress', assignee = ?2, started_at = ?3, updated_at = ?3
         WHERE id = ?1 AND status = 'queued'",
        params![&task.id, worker_id, now],
    )?;
    if updated != 1 {
        return Err(ToolError::not_queued(&task.id, task.status.as_str()).into());
    }

    if !acquire_lock_internal(conn, &task.id, worker_id, LockStrength::Active, lease_ms, now)? {
        // callers check exclusive_holder under the same write lock
        let holder = exclusive_holder(conn, &task.id, worker_id, now)?.unwrap_or_default();
        return Err(ToolError::already_claimed(&task.id, &holder).into());
    }

    Ok(Task {
        status: TaskStatus::InProgress,
        assignee: Some(worker_id.to_string()),
        started_at: Some(now),
        updated_at: now,
        ..task
    })
}

impl Database {
    /// Claim a task for a worker.
    ///
    /// With `requested_task_id`, that task is claimed or the call fails with
    /// `NotQueued`/`AlreadyClaimed`; unmet dependencies yield `Blocked`.
    /// Without it, the first eligible queued task in (priority, insertion)
    /// order is taken. Unknown workers are registered on the fly.
    ///
    /// Everything happens inside one immediate transaction, so no two
    /// callers, in this process or another, can receive the same task.
    pub fn claim_task(
        &self,
        requested_task_id: Option<&str>,
        worker_id: &str,
        policy: &ClaimPolicy,
    ) -> Result<ClaimOutcome> {
        self.claim_matching(requested_task_id, None, worker_id, policy)
    }

    /// Claim the next eligible task whose priority is one of `lanes`.
    ///
    /// Queued tasks of other priorities are left alone; if none of the
    /// given priorities has anything queued the outcome is `NoneQueued`.
    pub fn claim_task_in_lanes(
        &self,
        lanes: &[Priority],
        worker_id: &str,
        policy: &ClaimPolicy,
    ) -> Result<ClaimOutcome> {
        self.claim_matching(None, Some(lanes), worker_id, policy)
    }

    fn claim_matching(
        &self,
        requested_task_id: Option<&str>,
        lanes: Option<&[Priority]>,
        worker_id: &str,
        policy: &ClaimPolicy,
    ) -> Result<ClaimOutcome> {
        if worker_id.trim().is_empty() {
            return Err(ToolError::missing_field("worker_id").into());
        }
        let now = now_ms();
        let lease_ms = duration_ms(policy.active_lease);

        self.with_write_tx(|tx| {
            let session = ensure_session(tx, worker_id, policy.default_max_claims, now)?;
            let held = claim_count_internal(tx, worker_id)?;
            if held >= session.max_claims {
                return Err(ToolError::claim_limit(worker_id, session.max_claims).into());
            }

            if let Some(task_id) = requested_task_id {
                let task = require_task_internal(tx, task_id)?;
                if task.status != TaskStatus::Queued {
                    return Err(ToolError::not_queued(task_id, task.status.as_str()).into());
                }

                let unmet = unmet_dependencies(tx, task_id)?;
                if !unmet.is_empty() {
                    return Ok(ClaimOutcome::Blocked {
                        waiting: vec![BlockedTask {
                            task_id: task_id.to_string(),
                            unmet,
                            held_by: None,
                        }],
                    });
                }

                if let Some(holder) = exclusive_holder(tx, task_id, worker_id, now)? {
                    return Err(ToolError::already_claimed(task_id, &holder).into());
                }

                let task = assign(tx, task, worker_id, lease_ms, now)?;
                return Ok(ClaimOutcome::Claimed { task });
            }

            let mut queued = queued_tasks_in_claim_order(tx)?;
            if let Some(lanes) = lanes {
                queued.retain(|task| lanes.contains(&task.priority));
            }
            if queued.is_empty() {
                return Ok(ClaimOutcome::NoneQueued);
            }

            let mut waiting = Vec::new();
            for task in queued {
                let unmet = unmet_dependencies(tx, &task.id)?;
                if !unmet.is_empty() {
                    waiting.push(BlockedTask {
                        task_id: task.id,
                        unmet,
                        held_by: None,
                    });
                    continue;
                }

                if let Some(holder) = exclusive_holder(tx, &task.id, worker_id, now)? {
                    debug!(task_id = %task.id, holder = %holder, "Skipping exclusively locked task");
                    waiting.push(BlockedTask {
                        task_id: task.id,
                        unmet,
                        held_by: Some(holder),
                    });
                    continue;
                }

                let task = assign(tx, task, worker_id, lease_ms, now)?;
                return Ok(ClaimOutcome::Claimed { task });
            }

            Ok(ClaimOutcome::Blocked { waiting })
        })
    }

    /// Report a task as done.
    pub fn complete_task(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        outcome: Option<String>,
    ) -> Result<Task> {
        self.finish_task(task_id, worker_id, TaskStatus::Done, outcome)
    }

    /// Report a task as failed.
    pub fn fail_task(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        reason: Option<String>,
    ) -> Result<Task> {
        self.finish_task(task_id, worker_id, TaskStatus::Failed, reason)
    }

    /// Move an in-progress task to a terminal state and release every lock on it.
    /// When `worker_id` is given it must be the assignee.
    fn finish_task(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        status: TaskStatus,
        outcome: Option<String>,
    ) -> Result<Task> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            let task = require_task_internal(tx, task_id)?;
            if task.status != TaskStatus::InProgress {
                return Err(ToolError::invalid_state(format!(
                    "Task {} is not in progress (status: {})",
                    task_id, task.status
                ))
                .into());
            }
            if let Some(worker) = worker_id {
                if task.assignee.as_deref() != Some(worker) {
                    return Err(ToolError::not_owner(task_id, worker).into());
                }
            }

            tx.execute(
                "UPDATE tasks SET status = ?2, outcome = ?3, completed_at = ?4, updated_at = ?4
                 WHERE id = ?1",
                params![task_id, status.as_str(), &outcome, now],
            )?;

            remove_task_locks_internal(tx, task_id)?;

            if let (TaskStatus::Done, Some(assignee)) = (status, task.assignee.as_deref()) {
                tx.execute(
                    "UPDATE sessions SET completed_tasks = completed_tasks + 1 WHERE id = ?1",
                    params![assignee],
                )?;
            }

            tx.execute(
                "UPDATE help_requests SET status = 'cancelled', cancelled_at = ?2
                 WHERE task_id = ?1 AND status = 'open'",
                params![task_id, now],
            )?;

            Ok(Task {
                status,
                outcome,
                completed_at: Some(now),
                updated_at: now,
                ..task
            })
        })
    }
}
