//! In-process change notifications.
//!
//! Every mutation that succeeds through the [`Hub`](crate::hub::Hub) publishes
//! a [`ChangeRecord`]. Subscribers (the backlog mirror, tests, an embedding
//! application) receive them over a tokio broadcast channel. Publishing never
//! blocks and never fails: with no subscribers the record is simply dropped,
//! and a lagging subscriber loses the oldest records rather than stalling
//! the writer.

use crate::types::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffered records per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 256;

/// Categories of mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Claimed,
    Completed,
    Failed,
    /// Put back in the queue after its worker went away.
    Requeued,
    Unblocked,
    LockAcquired,
    LockReleased,
    HelpRequested,
    HelpAccepted,
    HelpCompleted,
    HelpCancelled,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Claimed => "claimed",
            ChangeKind::Completed => "completed",
            ChangeKind::Failed => "failed",
            ChangeKind::Requeued => "requeued",
            ChangeKind::Unblocked => "unblocked",
            ChangeKind::LockAcquired => "lock_acquired",
            ChangeKind::LockReleased => "lock_released",
            ChangeKind::HelpRequested => "help_requested",
            ChangeKind::HelpAccepted => "help_accepted",
            ChangeKind::HelpCompleted => "help_completed",
            ChangeKind::HelpCancelled => "help_cancelled",
        }
    }

    /// Does this kind of change alter a task row (status or assignee)?
    pub fn touches_backlog(&self) -> bool {
        matches!(
            self,
            ChangeKind::Created
                | ChangeKind::Claimed
                | ChangeKind::Completed
                | ChangeKind::Failed
                | ChangeKind::Requeued
                | ChangeKind::Unblocked
        )
    }
}

/// One task mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub event_type: ChangeKind,
    pub timestamp: i64,
}

impl ChangeRecord {
    pub fn for_task(task: &Task, event_type: ChangeKind) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            assignee: task.assignee.clone(),
            event_type,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Broadcast bus for [`ChangeRecord`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeRecord>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, record: ChangeRecord) {
        // Err only means nobody is listening
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn sample_task() -> Task {
        Task {
            id: "T-1".to_string(),
            title: "Write parser".to_string(),
            description: None,
            priority: Priority::High,
            status: TaskStatus::InProgress,
            assignee: Some("worker-a".to_string()),
            dependencies: vec![],
            tags: vec![],
            outcome: None,
            seq: 1,
            created_at: 0,
            updated_at: 0,
            started_at: Some(0),
            completed_at: None,
        }
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = ChangeBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(ChangeRecord::for_task(&sample_task(), ChangeKind::Claimed));
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_record() {
        let bus = ChangeBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(ChangeRecord::for_task(&sample_task(), ChangeKind::Claimed));

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.task_id, "T-1");
        assert_eq!(a.event_type, ChangeKind::Claimed);
        assert_eq!(a.assignee.as_deref(), Some("worker-a"));
    }

    #[test]
    fn lock_and_help_changes_leave_backlog_alone() {
        assert!(ChangeKind::Completed.touches_backlog());
        assert!(ChangeKind::Requeued.touches_backlog());
        assert!(!ChangeKind::LockReleased.touches_backlog());
        assert!(!ChangeKind::HelpAccepted.touches_backlog());
    }

    #[test]
    fn kinds_serialize_as_snake_case() {
        let json = serde_json::to_value(ChangeKind::HelpRequested).unwrap();
        assert_eq!(json, serde_json::json!(ChangeKind::HelpRequested.as_str()));
    }
}
