//! Write-only markdown mirror of the backlog.
//!
//! A listener on the change bus regenerates the whole table after every
//! change that touches a task row. The file is a projection for humans and
//! is never read back; edits to it are overwritten.

use crate::db::Database;
use crate::events::ChangeBus;
use crate::types::{Task, TaskStatus};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Escape a value for a markdown table cell.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

/// Render tasks (already in the desired order) as a markdown table.
pub fn render_markdown(tasks: &[Task]) -> String {
    let mut md = String::new();

    md.push_str("# Backlog\n\n");
    md.push_str("<!-- Generated by claimboard. Edits are overwritten. -->\n\n");

    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    md.push_str(&format!(
        "{} tasks: {} queued, {} in progress, {} blocked, {} done, {} failed\n\n",
        tasks.len(),
        count(TaskStatus::Queued),
        count(TaskStatus::InProgress),
        count(TaskStatus::Blocked),
        count(TaskStatus::Done),
        count(TaskStatus::Failed),
    ));

    md.push_str("| ID | Priority | Status | Assignee | Depends on | Title |\n");
    md.push_str("|----|----------|--------|----------|------------|-------|\n");
    for task in tasks {
        let depends_on = if task.dependencies.is_empty() {
            "-".to_string()
        } else {
            task.dependencies.join(", ")
        };
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            cell(&task.id),
            task.priority,
            task.status,
            cell(task.assignee.as_deref().unwrap_or("-")),
            cell(&depends_on),
            cell(&task.title),
        ));
    }

    md
}

/// Target file of the mirror.
#[derive(Debug, Clone)]
pub struct BacklogMirror {
    path: PathBuf,
}

impl BacklogMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file in one step: write a sibling temp file, then rename.
    pub fn write(&self, tasks: &[Task]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("md.tmp");
        std::fs::write(&tmp, render_markdown(tasks))
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Render the current store.
    pub fn refresh(&self, db: &Database) -> Result<()> {
        let tasks = db.list_tasks(None, None)?;
        self.write(&tasks)?;
        debug!(path = %self.path.display(), tasks = tasks.len(), "Backlog mirror written");
        Ok(())
    }

    fn refresh_logged(&self, db: &Database) {
        if let Err(e) = self.refresh(db) {
            warn!(path = %self.path.display(), error = %e, "Backlog mirror write failed");
        }
    }
}

/// Keep the mirror current until `shutdown` flips to `true`.
///
/// Writes once at start. A lagging receiver has missed records, so it
/// rewrites rather than guessing which ones mattered.
pub fn spawn_mirror(
    db: Arc<Database>,
    bus: &ChangeBus,
    mirror: BacklogMirror,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        info!(path = %mirror.path().display(), "Backlog mirror running");
        mirror.refresh_logged(&db);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(record) if record.event_type.touches_backlog() => mirror.refresh_logged(&db),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Backlog mirror lagged");
                        mirror.refresh_logged(&db);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Capture anything published after the last refresh
        mirror.refresh_logged(&db);
    })
}
