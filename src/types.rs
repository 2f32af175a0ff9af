//! Core types for the claimboard scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task priority tier. Lower rank is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Sort rank used by the claim ordering (urgent = 0).
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Parse a priority name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "urgent" => Some(Priority::Urgent),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    InProgress,
    Done,
    Blocked,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "in_progress" => Some(TaskStatus::InProgress),
            "done" => Some(TaskStatus::Done),
            "blocked" => Some(TaskStatus::Blocked),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    /// Ordered, duplicate-free dependency ids.
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    pub outcome: Option<String>,
    /// Insertion order; the FCFS tiebreak within a priority tier.
    pub seq: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    /// Explicit id; a sequential `<prefix>-<n>` id is generated when absent.
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Only `queued` (default) or `blocked` are accepted.
    pub initial_status: Option<TaskStatus>,
}

impl NewTask {
    pub fn new(priority: Priority, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            priority,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of a claim attempt. `NoneQueued` and `Blocked` are routine, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed { task: Task },
    /// No queued tasks exist at all.
    NoneQueued,
    /// Queued tasks exist but every candidate waits on unfinished upstream work.
    Blocked { waiting: Vec<BlockedTask> },
}

impl ClaimOutcome {
    pub fn into_task(self) -> Option<Task> {
        match self {
            ClaimOutcome::Claimed { task } => Some(task),
            _ => None,
        }
    }
}

/// A queued task that could not be claimed, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: String,
    /// Dependencies not yet done.
    pub unmet: Vec<String>,
    /// Another session's exclusive lock, if that is what held it back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_by: Option<String>,
}

/// Declared context-window size of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Small,
    #[default]
    Medium,
    Large,
}

impl ContextTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextTier::Small => "small",
            ContextTier::Medium => "medium",
            ContextTier::Large => "large",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "small" => Some(ContextTier::Small),
            "medium" => Some(ContextTier::Medium),
            "large" => Some(ContextTier::Large),
            _ => None,
        }
    }
}

/// What a worker declares it is good at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub best_for: Vec<String>,
    #[serde(default)]
    pub context_tier: ContextTier,
}

/// Liveness of a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Offline,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "idle" => Some(SessionStatus::Idle),
            "offline" => Some(SessionStatus::Offline),
            _ => None,
        }
    }
}

/// A live (or formerly live) worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub capabilities: CapabilityProfile,
    pub status: SessionStatus,
    pub current_task: Option<String>,
    /// Active locks held.
    pub active_tasks: i64,
    /// In-progress tasks assigned to the session; the load `max_claims` caps.
    #[serde(default)]
    pub claimed_tasks: i64,
    pub completed_tasks: i64,
    pub help_requests: i64,
    pub max_claims: i64,
    pub registered_at: i64,
    pub last_heartbeat: i64,
}

impl Session {
    pub fn is_at_capacity(&self) -> bool {
        self.claimed_tasks >= self.max_claims
    }
}

/// Summary of a check-out or a reaper sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSummary {
    /// Sessions marked offline.
    pub sessions: Vec<String>,
    /// Tasks put back in the queue.
    pub requeued_tasks: Vec<String>,
    /// Locks dropped (owner gone or lease expired).
    pub locks_released: i64,
    /// Open help requests cancelled because their requester went away.
    pub help_cancelled: i64,
}

impl ReleaseSummary {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
            && self.requeued_tasks.is_empty()
            && self.locks_released == 0
            && self.help_cancelled == 0
    }
}

/// Lock strength. Active and soft are mutually exclusive per task; helpers stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrength {
    Active,
    Soft,
    Helper,
}

impl LockStrength {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStrength::Active => "active",
            LockStrength::Soft => "soft",
            LockStrength::Helper => "helper",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(LockStrength::Active),
            "soft" => Some(LockStrength::Soft),
            "helper" => Some(LockStrength::Helper),
            _ => None,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        !matches!(self, LockStrength::Helper)
    }
}

/// A lease on a task held by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLock {
    pub task_id: String,
    pub session_id: String,
    pub strength: LockStrength,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub last_heartbeat: i64,
}

impl TaskLock {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Help request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelpStatus {
    Open,
    Accepted,
    Completed,
    Cancelled,
}

impl HelpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelpStatus::Open => "open",
            HelpStatus::Accepted => "accepted",
            HelpStatus::Completed => "completed",
            HelpStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(HelpStatus::Open),
            "accepted" => Some(HelpStatus::Accepted),
            "completed" => Some(HelpStatus::Completed),
            "cancelled" => Some(HelpStatus::Cancelled),
            _ => None,
        }
    }
}

/// A request for cooperative assistance on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpRequest {
    pub id: String,
    pub task_id: String,
    pub requester: String,
    pub helper: Option<String>,
    pub category: String,
    pub urgency: Priority,
    pub context: String,
    pub status: HelpStatus,
    pub outcome: Option<String>,
    pub created_at: i64,
    pub accepted_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
}

/// Input for raising a help request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHelpRequest {
    pub task_id: String,
    pub requester: String,
    pub category: String,
    #[serde(default)]
    pub urgency: Priority,
    #[serde(default)]
    pub context: String,
}

/// A session paired with its capability match score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSession {
    pub session: Session,
    pub score: f64,
}
