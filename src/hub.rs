//! The hub: one explicitly constructed context owning the store, the change
//! bus and the configuration.
//!
//! Every command of the public surface goes through here. Store errors come
//! back as [`ToolError`]s, and each successful mutation publishes a
//! [`ChangeRecord`] after its transaction has committed.

use crate::config::Config;
use crate::db::Database;
use crate::db::claims::ClaimPolicy;
use crate::error::{ToolError, ToolResult};
use crate::events::{ChangeBus, ChangeKind, ChangeRecord};
use crate::routing::{self, RouteQuery};
use crate::types::{
    CapabilityProfile, ClaimOutcome, HelpRequest, HelpStatus, LockStrength, NewHelpRequest,
    NewTask, Priority, RankedSession, ReleaseSummary, Session, Task, TaskLock, TaskStatus,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Input for [`Hub::check_in`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckIn {
    pub session_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: CapabilityProfile,
    pub max_claims: Option<i64>,
}

/// A freshly raised help request and the sessions best placed to answer it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpBroadcast {
    pub request: HelpRequest,
    pub candidates: Vec<RankedSession>,
}

#[derive(Clone)]
pub struct Hub {
    db: Arc<Database>,
    bus: ChangeBus,
    config: Arc<Config>,
}

impl Hub {
    pub fn new(db: Arc<Database>, config: Arc<Config>) -> Self {
        Self {
            db,
            bus: ChangeBus::new(),
            config,
        }
    }

    /// Open (creating if needed) the database named by the configuration.
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_db_dir()?;
        let db = Database::open(&config.server.db_path)?;
        Ok(Self::new(Arc::new(db), Arc::new(config)))
    }

    /// A hub over a private in-memory store.
    pub fn in_memory(config: Config) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::new(Arc::new(db), Arc::new(config)))
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.bus.subscribe()
    }

    fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            active_lease: self.config.locks.active(),
            default_max_claims: self.config.server.default_max_claims,
        }
    }

    fn emit(&self, task: &Task, kind: ChangeKind) {
        self.bus.publish(ChangeRecord::for_task(task, kind));
    }

    /// Publish a record for a task known only by id. The mutation already
    /// committed, so a failed lookup is logged and otherwise ignored.
    fn emit_for(&self, task_id: &str, kind: ChangeKind) {
        match self.db.get_task(task_id) {
            Ok(Some(task)) => self.emit(&task, kind),
            Ok(None) => debug!(task_id = %task_id, kind = kind.as_str(), "No task for change record"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to load task for change record"),
        }
    }

    fn emit_release(&self, summary: &ReleaseSummary) {
        for task_id in &summary.requeued_tasks {
            self.emit_for(task_id, ChangeKind::Requeued);
        }
    }

    // ---- Tasks -------------------------------------------------------------

    pub fn create_task(&self, input: NewTask) -> ToolResult<Task> {
        let task = self.db.create_task(input, &self.config.server.task_prefix)?;
        info!(task_id = %task.id, priority = %task.priority, "Task created");
        self.emit(&task, ChangeKind::Created);
        Ok(task)
    }

    /// Claim a specific task, or the next eligible one.
    pub fn claim(&self, task_id: Option<&str>, worker_id: &str) -> ToolResult<ClaimOutcome> {
        let outcome = self.db.claim_task(task_id, worker_id, &self.claim_policy())?;
        self.note_claim(worker_id, &outcome);
        Ok(outcome)
    }

    /// Claim the next eligible task among the given priorities.
    pub fn claim_in_lanes(&self, lanes: &[Priority], worker_id: &str) -> ToolResult<ClaimOutcome> {
        let outcome = self
            .db
            .claim_task_in_lanes(lanes, worker_id, &self.claim_policy())?;
        self.note_claim(worker_id, &outcome);
        Ok(outcome)
    }

    fn note_claim(&self, worker_id: &str, outcome: &ClaimOutcome) {
        match outcome {
            ClaimOutcome::Claimed { task } => {
                info!(task_id = %task.id, worker = %worker_id, priority = %task.priority, "Task claimed");
                self.emit(task, ChangeKind::Claimed);
            }
            ClaimOutcome::NoneQueued => debug!(worker = %worker_id, "Nothing queued"),
            ClaimOutcome::Blocked { waiting } => {
                debug!(worker = %worker_id, waiting = waiting.len(), "Every queued task is blocked")
            }
        }
    }

    pub fn complete(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        outcome: Option<String>,
    ) -> ToolResult<Task> {
        let task = self.db.complete_task(task_id, worker_id, outcome)?;
        info!(task_id = %task.id, assignee = ?task.assignee, "Task completed");
        self.emit(&task, ChangeKind::Completed);
        Ok(task)
    }

    pub fn fail(&self, task_id: &str, worker_id: Option<&str>, reason: Option<String>) -> ToolResult<Task> {
        let task = self.db.fail_task(task_id, worker_id, reason)?;
        warn!(task_id = %task.id, assignee = ?task.assignee, reason = ?task.outcome, "Task failed");
        self.emit(&task, ChangeKind::Failed);
        Ok(task)
    }

    pub fn unblock_task(&self, task_id: &str) -> ToolResult<Task> {
        let task = self.db.unblock_task(task_id)?;
        info!(task_id = %task.id, "Task unblocked");
        self.emit(&task, ChangeKind::Unblocked);
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> ToolResult<Task> {
        Ok(self.db.require_task(task_id)?)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, assignee: Option<&str>) -> ToolResult<Vec<Task>> {
        Ok(self.db.list_tasks(status, assignee)?)
    }

    pub fn eligible_tasks(&self) -> ToolResult<Vec<Task>> {
        Ok(self.db.eligible_tasks()?)
    }

    // ---- Sessions ----------------------------------------------------------

    pub fn check_in(&self, input: CheckIn) -> ToolResult<Session> {
        let session = self.db.check_in(
            input.session_id,
            input.name,
            input.capabilities,
            input.max_claims,
            self.config.server.default_max_claims,
        )?;
        info!(session_id = %session.id, name = %session.name, "Session checked in");
        Ok(session)
    }

    pub fn heartbeat(&self, session_id: &str) -> ToolResult<Session> {
        Ok(self.db.heartbeat(session_id, &self.config.locks)?)
    }

    pub fn check_out(&self, session_id: &str) -> ToolResult<ReleaseSummary> {
        let summary = self.db.check_out(session_id)?;
        info!(
            session_id = %session_id,
            requeued = summary.requeued_tasks.len(),
            locks = summary.locks_released,
            "Session checked out"
        );
        self.emit_release(&summary);
        Ok(summary)
    }

    pub fn get_session(&self, session_id: &str) -> ToolResult<Session> {
        Ok(self.db.require_session(session_id)?)
    }

    pub fn list_sessions(&self, include_offline: bool) -> ToolResult<Vec<Session>> {
        Ok(self.db.list_sessions(include_offline)?)
    }

    /// Reap sessions silent for longer than `timeout` (the configured stale
    /// timeout when `None`) and every expired lock.
    pub fn reap_stale(&self, timeout: Option<Duration>) -> ToolResult<ReleaseSummary> {
        let timeout = timeout.unwrap_or_else(|| self.config.server.stale_timeout());
        let summary = self.db.reap_stale(timeout)?;
        if !summary.is_empty() {
            info!(
                sessions = summary.sessions.len(),
                requeued = summary.requeued_tasks.len(),
                locks = summary.locks_released,
                help_cancelled = summary.help_cancelled,
                "Reaped stale work"
            );
        }
        self.emit_release(&summary);
        Ok(summary)
    }

    // ---- Locks -------------------------------------------------------------

    /// Acquire a lock; the lease defaults to the configured one for `strength`.
    pub fn acquire_lock(
        &self,
        task_id: &str,
        session_id: &str,
        strength: LockStrength,
        lease: Option<Duration>,
    ) -> ToolResult<bool> {
        let lease = lease.unwrap_or_else(|| self.config.locks.lease_for(strength));
        let acquired = self.db.acquire_lock(task_id, session_id, strength, lease)?;
        if acquired {
            debug!(task_id = %task_id, session_id = %session_id, strength = strength.as_str(), "Lock acquired");
            self.emit_for(task_id, ChangeKind::LockAcquired);
        }
        Ok(acquired)
    }

    pub fn release_lock(&self, task_id: &str, session_id: &str) -> ToolResult<bool> {
        let released = self.db.release_lock(task_id, session_id)?;
        if released {
            debug!(task_id = %task_id, session_id = %session_id, "Lock released");
            self.emit_for(task_id, ChangeKind::LockReleased);
        }
        Ok(released)
    }

    /// Renew a lock; the lease defaults to the configured one for its strength.
    pub fn heartbeat_lock(
        &self,
        task_id: &str,
        session_id: &str,
        lease: Option<Duration>,
    ) -> ToolResult<TaskLock> {
        let lease = match lease {
            Some(lease) => lease,
            None => {
                let lock = self
                    .db
                    .get_lock(task_id, session_id)?
                    .ok_or_else(|| ToolError::lease_expired(task_id, session_id))?;
                self.config.locks.lease_for(lock.strength)
            }
        };
        Ok(self.db.heartbeat_lock(task_id, session_id, lease)?)
    }

    /// Locks on a task, held by a session, or everywhere.
    pub fn list_locks(&self, task_id: Option<&str>, session_id: Option<&str>) -> ToolResult<Vec<TaskLock>> {
        let locks = match (task_id, session_id) {
            (Some(task), Some(session)) => self.db.get_lock(task, session)?.into_iter().collect(),
            (Some(task), None) => self.db.locks_for_task(task)?,
            (None, Some(session)) => self.db.locks_for_session(session)?,
            (None, None) => self.db.list_locks()?,
        };
        Ok(locks)
    }

    // ---- Help requests -----------------------------------------------------

    /// Raise a help request and rank the other live sessions against it.
    pub fn request_help(&self, input: NewHelpRequest) -> ToolResult<HelpBroadcast> {
        let request = self.db.request_help(input)?;
        let task = self.db.require_task(&request.task_id)?;

        let text = format!(
            "{} {} {}",
            task.description.as_deref().unwrap_or(&task.title),
            request.category,
            request.context
        );
        let query = RouteQuery::new(&text, &task.tags);
        let sessions = self.db.list_sessions(false)?;
        let candidates = routing::rank_sessions(&self.config.routing, &sessions, &query)
            .into_iter()
            .filter(|r| r.session.id != request.requester)
            .collect::<Vec<_>>();

        info!(
            request_id = %request.id,
            task_id = %request.task_id,
            requester = %request.requester,
            candidates = candidates.len(),
            "Help requested"
        );
        self.emit(&task, ChangeKind::HelpRequested);
        Ok(HelpBroadcast { request, candidates })
    }

    pub fn accept_help(&self, request_id: &str, helper: &str, lease: Option<Duration>) -> ToolResult<HelpRequest> {
        let lease = lease.unwrap_or_else(|| self.config.locks.helper());
        let request = self.db.accept_help(request_id, helper, lease)?;
        info!(request_id = %request.id, helper = %helper, "Help accepted");
        self.emit_for(&request.task_id, ChangeKind::HelpAccepted);
        Ok(request)
    }

    pub fn complete_help(&self, request_id: &str, helper: &str, outcome: &str) -> ToolResult<HelpRequest> {
        let request = self.db.complete_help(request_id, helper, outcome)?;
        info!(request_id = %request.id, helper = %helper, "Help completed");
        self.emit_for(&request.task_id, ChangeKind::HelpCompleted);
        Ok(request)
    }

    pub fn cancel_help(&self, request_id: &str, requester: &str) -> ToolResult<HelpRequest> {
        let request = self.db.cancel_help(request_id, requester)?;
        info!(request_id = %request.id, "Help cancelled");
        self.emit_for(&request.task_id, ChangeKind::HelpCancelled);
        Ok(request)
    }

    pub fn get_help(&self, request_id: &str) -> ToolResult<HelpRequest> {
        self.db
            .get_help(request_id)?
            .ok_or_else(|| ToolError::help_not_found(request_id))
    }

    pub fn list_help(&self, status: Option<HelpStatus>) -> ToolResult<Vec<HelpRequest>> {
        Ok(self.db.list_help(status)?)
    }

    // ---- Routing -----------------------------------------------------------

    /// Best live session for a task described by text and tags.
    pub fn find_best_agent(&self, description: &str, tags: &[String]) -> ToolResult<Option<RankedSession>> {
        let sessions = self.db.list_sessions(false)?;
        let query = RouteQuery::new(description, tags);
        Ok(routing::best_agent_for(&self.config.routing, &sessions, &query))
    }

    /// Best live session for an existing task.
    pub fn find_best_agent_for_task(&self, task_id: &str) -> ToolResult<Option<RankedSession>> {
        let task = self.db.require_task(task_id)?;
        let description = task.description.as_deref().unwrap_or(&task.title);
        self.find_best_agent(description, &task.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Hub {
        Hub::in_memory(Config::default()).unwrap()
    }

    #[test]
    fn created_ids_use_configured_prefix() {
        let mut config = Config::default();
        config.server.task_prefix = "OPS".to_string();
        let hub = Hub::in_memory(config).unwrap();
        let task = hub.create_task(NewTask::new(Priority::Low, "Rotate keys")).unwrap();
        assert_eq!(task.id, "OPS-1");
    }

    #[test]
    fn store_errors_surface_as_tool_errors() {
        let err = hub().get_task("T-404").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TaskNotFound);
    }

    #[tokio::test]
    async fn mutations_publish_after_commit() {
        let hub = hub();
        let mut rx = hub.subscribe();

        let task = hub.create_task(NewTask::new(Priority::High, "Ship it")).unwrap();
        hub.claim(None, "w1").unwrap();
        hub.complete(&task.id, Some("w1"), Some("shipped".into())).unwrap();

        let kinds: Vec<ChangeKind> = (0..3).map(|_| rx.try_recv().unwrap().event_type).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Created, ChangeKind::Claimed, ChangeKind::Completed]
        );
    }

    #[test]
    fn failed_commands_publish_nothing() {
        let hub = hub();
        let mut rx = hub.subscribe();
        assert!(hub.complete("T-9", None, None).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn help_candidates_exclude_requester() {
        let hub = hub();
        let task = hub
            .create_task(NewTask::new(Priority::High, "Tune queries").with_tags(["sql"]))
            .unwrap();
        for id in ["w1", "w2"] {
            hub.check_in(CheckIn {
                session_id: Some(id.to_string()),
                capabilities: CapabilityProfile {
                    strengths: vec!["sql".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        }
        hub.claim(Some(&task.id), "w1").unwrap();

        let broadcast = hub
            .request_help(NewHelpRequest {
                task_id: task.id.clone(),
                requester: "w1".to_string(),
                category: "review".to_string(),
                urgency: Priority::High,
                context: "slow join".to_string(),
            })
            .unwrap();
        let ids: Vec<&str> = broadcast.candidates.iter().map(|r| r.session.id.as_str()).collect();
        assert_eq!(ids, vec!["w2"]);
        assert_eq!(broadcast.candidates[0].score, 2.0);
    }
}
