//! Integration tests for the async side: worker pool, dispatcher, reaper,
//! change bus and backlog mirror.

use anyhow::{Result, bail};
use async_trait::async_trait;
use claimboard::config::Config;
use claimboard::error::ErrorCode;
use claimboard::events::ChangeKind;
use claimboard::hub::{CheckIn, Hub};
use claimboard::mirror::{BacklogMirror, spawn_mirror};
use claimboard::pool::{TaskExecutor, WorkerPool, spawn_dispatcher};
use claimboard::reaper::spawn_reaper;
use claimboard::types::{NewTask, Priority, Task, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Succeed;

#[async_trait]
impl TaskExecutor for Succeed {
    async fn execute(&self, task: &Task) -> Result<String> {
        Ok(format!("ran {}", task.id))
    }
}

struct Fail;

#[async_trait]
impl TaskExecutor for Fail {
    async fn execute(&self, _task: &Task) -> Result<String> {
        bail!("boom")
    }
}

struct Panic;

#[async_trait]
impl TaskExecutor for Panic {
    async fn execute(&self, _task: &Task) -> Result<String> {
        panic!("executor blew up")
    }
}

/// Holds `low` tasks until the gate opens; anything else finishes at once.
struct HoldLow {
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl TaskExecutor for HoldLow {
    async fn execute(&self, task: &Task) -> Result<String> {
        if task.priority == Priority::Low {
            let mut gate = self.gate.clone();
            gate.wait_for(|open| *open).await?;
        }
        Ok(format!("ran {}", task.id))
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.dispatch_interval_ms = 10;
    config.pool.backoff_ms = 0;
    config
}

fn setup_hub() -> Hub {
    Hub::in_memory(test_config()).expect("Failed to create in-memory hub")
}

/// Poll `check` until it holds or five seconds pass.
async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn status_of(hub: &Hub, task_id: &str) -> TaskStatus {
    hub.get_task(task_id).expect("task exists").status
}

fn claim_one(hub: &Hub, worker: &str) -> Task {
    hub.claim(None, worker)
        .expect("claim")
        .into_task()
        .expect("a task was claimed")
}

mod pool_tests {
    use super::*;

    #[tokio::test]
    async fn completes_submitted_task() {
        let hub = setup_hub();
        hub.create_task(NewTask::new(Priority::High, "build")).unwrap();
        let task = claim_one(&hub, "w1");

        let pool = WorkerPool::new(hub.clone(), Arc::new(Succeed), hub.config().pool.clone());
        pool.start();
        pool.submit(&task).unwrap();

        assert!(wait_for(|| status_of(&hub, "T-1") == TaskStatus::Done).await);
        pool.stop().await;

        let done = hub.get_task("T-1").unwrap();
        assert_eq!(done.outcome.as_deref(), Some("ran T-1"));
        assert_eq!(done.assignee.as_deref(), Some("w1"));

        let high = pool
            .stats()
            .into_iter()
            .find(|s| s.lane == Priority::High)
            .unwrap();
        assert_eq!(high.processed, 1);
        assert_eq!(high.failed, 0);
        assert_eq!(pool.free_slots(), pool.total_slots());
    }

    #[tokio::test]
    async fn executor_error_fails_task() {
        let hub = setup_hub();
        hub.create_task(NewTask::new(Priority::Low, "doomed")).unwrap();
        let task = claim_one(&hub, "w1");

        let pool = WorkerPool::new(hub.clone(), Arc::new(Fail), hub.config().pool.clone());
        pool.start();
        pool.submit(&task).unwrap();

        assert!(wait_for(|| status_of(&hub, "T-1") == TaskStatus::Failed).await);
        pool.stop().await;
        assert_eq!(hub.get_task("T-1").unwrap().outcome.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn panicking_executor_fails_task_and_slot_survives() {
        let hub = setup_hub();
        hub.create_task(NewTask::new(Priority::Urgent, "first")).unwrap();
        hub.create_task(NewTask::new(Priority::Urgent, "second")).unwrap();
        let first = claim_one(&hub, "w1");
        let second = claim_one(&hub, "w1");

        let mut config = hub.config().pool.clone();
        config.urgent_slots = 1;
        let pool = WorkerPool::new(hub.clone(), Arc::new(Panic), config);
        pool.start();
        pool.submit(&first).unwrap();
        pool.submit(&second).unwrap();

        assert!(
            wait_for(|| {
                status_of(&hub, "T-1") == TaskStatus::Failed
                    && status_of(&hub, "T-2") == TaskStatus::Failed
            })
            .await
        );
        pool.stop().await;

        let reason = hub.get_task("T-1").unwrap().outcome.unwrap_or_default();
        assert!(reason.contains("panicked"), "{reason}");
    }

    #[tokio::test]
    async fn skips_tasks_no_longer_in_progress() {
        let hub = setup_hub();
        hub.create_task(NewTask::new(Priority::Medium, "gone")).unwrap();
        let task = claim_one(&hub, "w1");
        hub.complete(&task.id, Some("w1"), Some("by hand".into())).unwrap();

        let pool = WorkerPool::new(hub.clone(), Arc::new(Fail), hub.config().pool.clone());
        pool.start();
        pool.submit(&task).unwrap();
        pool.stop().await;

        let stored = hub.get_task("T-1").unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert_eq!(stored.outcome.as_deref(), Some("by hand"));
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let hub = setup_hub();
        hub.create_task(NewTask::new(Priority::Low, "late")).unwrap();
        let task = claim_one(&hub, "w1");

        let pool = WorkerPool::new(hub.clone(), Arc::new(Succeed), hub.config().pool.clone());
        assert_eq!(pool.submit(&task).unwrap_err().code, ErrorCode::InvalidState);

        pool.start();
        assert!(pool.is_running());
        pool.stop().await;
        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(pool.submit(&task).unwrap_err().code, ErrorCode::InvalidState);
    }
}

mod dispatcher_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drains_queue_including_dependents() {
        let hub = setup_hub();
        for (priority, title) in [
            (Priority::Low, "sweep"),
            (Priority::Urgent, "hotfix"),
            (Priority::Medium, "refactor"),
            (Priority::High, "feature"),
        ] {
            hub.create_task(NewTask::new(priority, title)).unwrap();
        }
        hub.create_task(NewTask::new(Priority::Urgent, "after hotfix").depends_on(["T-2"]))
            .unwrap();

        let pool = Arc::new(WorkerPool::new(
            hub.clone(),
            Arc::new(Succeed),
            hub.config().pool.clone(),
        ));
        pool.start();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = spawn_dispatcher(hub.clone(), Arc::clone(&pool), shutdown_rx);

        let all_done = wait_for(|| {
            hub.list_tasks(Some(TaskStatus::Done), None)
                .map(|done| done.len() == 5)
                .unwrap_or(false)
        })
        .await;
        assert!(all_done);

        shutdown_tx.send(true).unwrap();
        dispatcher.await.unwrap().unwrap();
        pool.stop().await;

        let worker = hub.config().pool.worker_id.clone();
        let session = hub.get_session(&worker).unwrap();
        assert_eq!(session.completed_tasks, 5);
        assert_eq!(session.max_claims, pool.total_slots() as i64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn low_backlog_never_starves_urgent() {
        let hub = setup_hub();
        for i in 0..12 {
            hub.create_task(NewTask::new(Priority::Low, format!("sweep {i}")))
                .unwrap();
        }

        let (gate_tx, gate_rx) = watch::channel(false);
        let pool = Arc::new(WorkerPool::new(
            hub.clone(),
            Arc::new(HoldLow { gate: gate_rx }),
            hub.config().pool.clone(),
        ));
        pool.start();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = spawn_dispatcher(hub.clone(), Arc::clone(&pool), shutdown_rx);

        let low_slots = hub.config().pool.slots_for(Priority::Low);
        let in_progress = || {
            hub.list_tasks(Some(TaskStatus::InProgress), None)
                .map(|tasks| tasks.len())
                .unwrap_or(0)
        };
        assert!(wait_for(|| in_progress() == low_slots).await);
        assert!(wait_for(|| pool.free_slots_in(Priority::Low) == 0).await);
        assert_eq!(
            pool.free_slots_in(Priority::Urgent),
            hub.config().pool.slots_for(Priority::Urgent)
        );

        let urgent = hub
            .create_task(NewTask::new(Priority::Urgent, "hotfix"))
            .unwrap();
        assert!(wait_for(|| status_of(&hub, &urgent.id) == TaskStatus::Done).await);

        // the low lane only ever holds what its slots can run
        assert_eq!(in_progress(), low_slots);
        assert_eq!(
            hub.list_tasks(Some(TaskStatus::Queued), None).unwrap().len(),
            12 - low_slots
        );

        shutdown_tx.send(true).unwrap();
        dispatcher.await.unwrap().unwrap();
        gate_tx.send(true).unwrap();
        pool.stop().await;
    }
}

mod background_tests {
    use super::*;

    #[tokio::test]
    async fn reaper_requeues_silent_worker() {
        let mut config = test_config();
        config.server.stale_timeout_seconds = 0;
        let hub = Hub::in_memory(config).unwrap();
        hub.create_task(NewTask::new(Priority::High, "orphan")).unwrap();
        claim_one(&hub, "ghost");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut records = hub.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = spawn_reaper(hub.clone(), shutdown_rx);

        assert!(wait_for(|| status_of(&hub, "T-1") == TaskStatus::Queued).await);
        shutdown_tx.send(true).unwrap();
        reaper.await.unwrap();

        let record = records.recv().await.unwrap();
        assert_eq!(record.event_type, ChangeKind::Requeued);
        assert_eq!(record.task_id, "T-1");
        assert!(hub.get_task("T-1").unwrap().assignee.is_none());
    }

    #[tokio::test]
    async fn bus_carries_each_mutation() {
        let hub = setup_hub();
        let mut records = hub.subscribe();

        hub.create_task(NewTask::new(Priority::Medium, "watched")).unwrap();
        hub.check_in(CheckIn {
            session_id: Some("w1".into()),
            ..Default::default()
        })
        .unwrap();
        claim_one(&hub, "w1");
        hub.complete("T-1", Some("w1"), None).unwrap();

        let mut kinds = Vec::new();
        while let Ok(record) = records.try_recv() {
            kinds.push(record.event_type);
        }
        assert_eq!(
            kinds,
            vec![ChangeKind::Created, ChangeKind::Claimed, ChangeKind::Completed]
        );
    }

    #[tokio::test]
    async fn mirror_follows_the_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BACKLOG.md");
        let hub = setup_hub();
        hub.create_task(NewTask::new(Priority::Low, "existing")).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mirror = spawn_mirror(
            Arc::clone(hub.db()),
            hub.bus(),
            BacklogMirror::new(&path),
            shutdown_rx,
        );

        hub.create_task(NewTask::new(Priority::Urgent, "fresh")).unwrap();
        claim_one(&hub, "w1");

        let read = || std::fs::read_to_string(&path).unwrap_or_default();
        assert!(wait_for(|| read().contains("| T-2 | urgent | in_progress | w1 |")).await);

        shutdown_tx.send(true).unwrap();
        mirror.await.unwrap();

        let content = read();
        assert!(content.contains("| T-1 | low | queued | - | - | existing |"));
        assert!(content.contains("2 tasks: 1 queued, 1 in progress"));
    }
}
