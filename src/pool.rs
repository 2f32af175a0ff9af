//! Priority worker pool.
//!
//! One lane per priority tier, each with its own queue and slot count, so a
//! deep `low` backlog never holds up `urgent` work. A slot takes a task id
//! off its lane, runs the [`TaskExecutor`] and reports `done` or `failed`
//! back through the hub.
//!
//! The [dispatcher](spawn_dispatcher) feeds the pool: it checks in as its
//! own session and claims only tasks whose lane has a free slot, so nothing
//! it holds sits claimed behind a busy lane.

use crate::config::PoolConfig;
use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::hub::{CheckIn, Hub};
use crate::types::{ClaimOutcome, Priority, Task, TaskStatus};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Runs one task. The returned string becomes the task's outcome.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &Task) -> Result<String>;
}

/// Lines of stdout kept as the outcome of a command run.
const OUTCOME_TAIL_LINES: usize = 20;

/// Runs a shell command per task. Exit status 0 is success.
///
/// The task is described to the command through `CLAIMBOARD_TASK_ID`,
/// `CLAIMBOARD_TASK_TITLE`, `CLAIMBOARD_TASK_DESCRIPTION` and
/// `CLAIMBOARD_TASK_PRIORITY`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn shell(&self) -> tokio::process::Command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(&self.command);
        cmd
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &Task) -> Result<String> {
        let output = self
            .shell()
            .env("CLAIMBOARD_TASK_ID", &task.id)
            .env("CLAIMBOARD_TASK_TITLE", &task.title)
            .env(
                "CLAIMBOARD_TASK_DESCRIPTION",
                task.description.as_deref().unwrap_or_default(),
            )
            .env("CLAIMBOARD_TASK_PRIORITY", task.priority.as_str())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            return Ok(tail(&stdout, OUTCOME_TAIL_LINES));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        bail!(
            "command exited with {}: {}",
            output.status,
            tail(&detail, OUTCOME_TAIL_LINES)
        )
    }
}

/// Live counters of one lane.
#[derive(Debug, Default)]
pub struct LaneStats {
    queued: AtomicU64,
    in_flight: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of a lane's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneSnapshot {
    pub lane: Priority,
    pub slots: usize,
    pub queued: u64,
    pub in_flight: u64,
    pub processed: u64,
    pub failed: u64,
}

impl LaneStats {
    fn snapshot(&self, lane: Priority, slots: usize) -> LaneSnapshot {
        LaneSnapshot {
            lane,
            slots,
            queued: self.queued.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn pending(&self) -> u64 {
        self.queued.load(Ordering::Relaxed) + self.in_flight.load(Ordering::Relaxed)
    }
}

/// How one slot step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Done,
    Failed,
    /// The task was no longer in progress when the slot got to it.
    Skipped,
}

struct Running {
    senders: Vec<mpsc::UnboundedSender<String>>,
    slots: Vec<JoinHandle<()>>,
}

/// Shared by every slot of every lane.
struct SlotContext {
    hub: Hub,
    executor: Arc<dyn TaskExecutor>,
    backoff: Duration,
}

pub struct WorkerPool {
    ctx: Arc<SlotContext>,
    config: PoolConfig,
    stats: Vec<Arc<LaneStats>>,
    running: Mutex<Option<Running>>,
}

fn lane_index(lane: Priority) -> usize {
    lane.rank() as usize
}

impl WorkerPool {
    pub fn new(hub: Hub, executor: Arc<dyn TaskExecutor>, config: PoolConfig) -> Self {
        Self {
            ctx: Arc::new(SlotContext {
                hub,
                executor,
                backoff: config.backoff(),
            }),
            stats: Priority::ALL.iter().map(|_| Arc::new(LaneStats::default())).collect(),
            config,
            running: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn every lane's slots. Calling it on a running pool does nothing.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.state();
        if state.is_some() {
            return;
        }

        let mut senders = Vec::with_capacity(Priority::ALL.len());
        let mut slots = Vec::new();
        for lane in Priority::ALL {
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            let stats = Arc::clone(&self.stats[lane_index(lane)]);
            for slot in 0..self.config.slots_for(lane) {
                slots.push(tokio::spawn(run_slot(
                    lane,
                    slot,
                    Arc::clone(&rx),
                    Arc::clone(&self.ctx),
                    Arc::clone(&stats),
                )));
            }
            senders.push(tx);
        }

        info!(slots = slots.len(), "Worker pool started");
        *state = Some(Running { senders, slots });
    }

    /// Close the lane queues and wait for the slots to drain them.
    /// Work already running is never interrupted. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.state().take() else {
            return;
        };
        drop(running.senders);
        for handle in running.slots {
            if let Err(e) = handle.await {
                error!(error = %e, "Pool slot ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    /// Queue a claimed task on the lane for its priority.
    pub fn submit(&self, task: &Task) -> ToolResult<()> {
        let state = self.state();
        let Some(running) = state.as_ref() else {
            return Err(ToolError::invalid_state("Worker pool is stopped"));
        };

        let lane = lane_index(task.priority);
        self.stats[lane].queued.fetch_add(1, Ordering::Relaxed);
        if running.senders[lane].send(task.id.clone()).is_err() {
            self.stats[lane].queued.fetch_sub(1, Ordering::Relaxed);
            return Err(ToolError::invalid_state("Worker pool is stopped"));
        }
        debug!(task_id = %task.id, lane = %task.priority, "Task submitted to pool");
        Ok(())
    }

    pub fn total_slots(&self) -> usize {
        self.config.total_slots()
    }

    /// Slots of `lane` not spoken for by queued or running work.
    pub fn free_slots_in(&self, lane: Priority) -> usize {
        let pending = self.stats[lane_index(lane)].pending() as usize;
        self.config.slots_for(lane).saturating_sub(pending)
    }

    /// Free slots across every lane.
    pub fn free_slots(&self) -> usize {
        Priority::ALL.iter().map(|lane| self.free_slots_in(*lane)).sum()
    }

    /// Lanes with at least one free slot, most urgent first.
    pub fn open_lanes(&self) -> Vec<Priority> {
        Priority::ALL
            .into_iter()
            .filter(|lane| self.free_slots_in(*lane) > 0)
            .collect()
    }

    pub fn stats(&self) -> Vec<LaneSnapshot> {
        Priority::ALL
            .iter()
            .map(|lane| self.stats[lane_index(*lane)].snapshot(*lane, self.config.slots_for(*lane)))
            .collect()
    }
}

async fn run_slot(
    lane: Priority,
    slot: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    ctx: Arc<SlotContext>,
    stats: Arc<LaneStats>,
) {
    loop {
        // Hold the receiver only while waiting; siblings take turns
        let next = { rx.lock().await.recv().await };
        let Some(task_id) = next else {
            debug!(lane = %lane, slot, "Lane closed");
            break;
        };

        // in_flight first so the lane never looks momentarily empty
        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        stats.queued.fetch_sub(1, Ordering::Relaxed);
        let result = run_step(&ctx, &task_id).await;
        stats.in_flight.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(StepOutcome::Done) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(StepOutcome::Failed) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(StepOutcome::Skipped) => {}
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(lane = %lane, slot, task_id = %task_id, error = %e, "Pool slot step failed");
                tokio::time::sleep(ctx.backoff).await;
            }
        }
    }
}

/// Execute one task and record the result.
///
/// An executor error fails the task. A panicking executor also fails the
/// task but is reported as a step error so the slot backs off.
async fn run_step(ctx: &SlotContext, task_id: &str) -> Result<StepOutcome> {
    let task = ctx.hub.get_task(task_id)?;
    if task.status != TaskStatus::InProgress {
        warn!(task_id = %task_id, status = %task.status, "Skipping task that is no longer in progress");
        return Ok(StepOutcome::Skipped);
    }
    let assignee = task.assignee.clone();

    let executor = Arc::clone(&ctx.executor);
    let job = task.clone();
    let joined = tokio::spawn(async move { executor.execute(&job).await }).await;

    match joined {
        Ok(Ok(summary)) => {
            ctx.hub.complete(&task.id, assignee.as_deref(), Some(summary))?;
            Ok(StepOutcome::Done)
        }
        Ok(Err(e)) => {
            ctx.hub.fail(&task.id, assignee.as_deref(), Some(e.to_string()))?;
            Ok(StepOutcome::Failed)
        }
        Err(join_err) => {
            let reason = format!("executor panicked: {}", join_err);
            ctx.hub.fail(&task.id, assignee.as_deref(), Some(reason.clone()))?;
            bail!(reason)
        }
    }
}

/// Claim work for the pool until `shutdown` flips to `true`.
///
/// The dispatcher checks in as `pool.worker_id` with one claim per slot and
/// heartbeats while idle. Each claim is restricted to the lanes that have a
/// free slot right now; a full `low` lane never keeps `urgent` work waiting.
pub fn spawn_dispatcher(
    hub: Hub,
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let worker_id = hub.config().pool.worker_id.clone();
        let interval = hub.config().server.dispatch_interval();
        hub.check_in(CheckIn {
            session_id: Some(worker_id.clone()),
            name: Some(worker_id.clone()),
            max_claims: Some(pool.total_slots() as i64),
            ..Default::default()
        })?;
        info!(worker = %worker_id, slots = pool.total_slots(), "Dispatcher running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let lanes = pool.open_lanes();
            if !lanes.is_empty() {
                match hub.claim_in_lanes(&lanes, &worker_id) {
                    Ok(ClaimOutcome::Claimed { task }) => {
                        if let Err(e) = pool.submit(&task) {
                            warn!(task_id = %task.id, error = %e, "Pool refused claimed task");
                            break;
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) if e.code == ErrorCode::ClaimLimitExceeded => {}
                    Err(e) => warn!(worker = %worker_id, error = %e, "Dispatcher claim failed"),
                }
            }

            if let Err(e) = hub.heartbeat(&worker_id) {
                warn!(worker = %worker_id, error = %e, "Dispatcher heartbeat failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker = %worker_id, "Dispatcher stopped");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("only", 5), "only");
        assert_eq!(tail("", 3), "");
    }

    #[test]
    fn lanes_index_by_rank() {
        assert_eq!(lane_index(Priority::Urgent), 0);
        assert_eq!(lane_index(Priority::Low), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_executor_reports_stdout_and_failures() {
        let task = Task {
            id: "T-7".to_string(),
            title: "Echo".to_string(),
            description: None,
            priority: Priority::High,
            status: TaskStatus::InProgress,
            assignee: Some("w".to_string()),
            dependencies: vec![],
            tags: vec![],
            outcome: None,
            seq: 7,
            created_at: 0,
            updated_at: 0,
            started_at: Some(0),
            completed_at: None,
        };

        let ok = CommandExecutor::new("echo \"$CLAIMBOARD_TASK_ID $CLAIMBOARD_TASK_PRIORITY\"");
        assert_eq!(ok.execute(&task).await.unwrap(), "T-7 high");

        let bad = CommandExecutor::new("echo nope >&2; exit 3");
        let err = bad.execute(&task).await.unwrap_err().to_string();
        assert!(err.contains("nope"), "{err}");
    }
}
