//! Task store: creation, lookup, listing and dependency queries.

use super::{Database, decode_list, now_ms};
use crate::error::ToolError;
use crate::types::{NewTask, Priority, Task, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{HashMap, HashSet, VecDeque};

/// Maximum length for explicit task IDs.
pub const MAX_TASK_ID_LEN: usize = 64;

/// Column list shared by every task query (dependencies are loaded separately).
pub(crate) const TASK_COLUMNS: &str = "t.seq, t.id, t.title, t.description, t.priority, t.status, \
     t.assignee, t.tags, t.outcome, t.created_at, t.updated_at, t.started_at, t.completed_at";

pub(crate) fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let priority: String = row.get("priority")?;
    let status: String = row.get("status")?;
    let tags_json: String = row.get("tags")?;

    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        priority: Priority::parse(&priority).unwrap_or_default(),
        status: TaskStatus::parse(&status).unwrap_or_default(),
        assignee: row.get("assignee")?,
        dependencies: Vec::new(),
        tags: decode_list(&tags_json),
        outcome: row.get("outcome")?,
        seq: row.get("seq")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

/// Ordered dependency ids of one task.
pub(crate) fn load_dependencies(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY ordinal",
    )?;
    let deps = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(deps)
}

/// Fill in the dependency lists for a batch of tasks with one query.
fn attach_dependencies(conn: &Connection, tasks: &mut [Task]) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "SELECT task_id, depends_on FROM task_dependencies ORDER BY task_id, ordinal",
    )?;
    let mut by_task: HashMap<String, Vec<String>> = HashMap::new();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (task_id, dep) = row?;
        by_task.entry(task_id).or_default().push(dep);
    }
    for task in tasks.iter_mut() {
        task.dependencies = by_task.remove(&task.id).unwrap_or_default();
    }
    Ok(())
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1");
    let task = conn
        .query_row(&sql, params![task_id], parse_task_row)
        .optional()?;

    match task {
        Some(mut task) => {
            task.dependencies = load_dependencies(conn, &task.id)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

pub(crate) fn require_task_internal(conn: &Connection, task_id: &str) -> Result<Task> {
    get_task_internal(conn, task_id)?.ok_or_else(|| ToolError::task_not_found(task_id).into())
}

/// Dependencies of `task_id` that are not `done`, in declared order.
/// A dependency that names no existing task counts as unmet.
pub(crate) fn unmet_dependencies(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT d.depends_on FROM task_dependencies d
         LEFT JOIN tasks u ON u.id = d.depends_on
         WHERE d.task_id = ?1 AND (u.status IS NULL OR u.status != 'done')
         ORDER BY d.ordinal",
    )?;
    let unmet = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(unmet)
}

/// Queued tasks in claim order: priority rank, then insertion sequence.
pub(crate) fn queued_tasks_in_claim_order(conn: &Connection) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks t
         WHERE t.status = 'queued'
         ORDER BY t.priority_rank ASC, t.seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut tasks = stmt
        .query_map([], parse_task_row)?
        .collect::<rusqlite::Result<Vec<Task>>>()?;
    attach_dependencies(conn, &mut tasks)?;
    Ok(tasks)
}

/// Allocate the next `<prefix>-<n>` id, skipping ids already taken explicitly.
fn next_task_id(conn: &Connection, prefix: &str) -> Result<String> {
    loop {
        let next: i64 = conn.query_row(
            "INSERT INTO task_counters (namespace, next_value) VALUES (?1, 2)
             ON CONFLICT(namespace) DO UPDATE SET next_value = next_value + 1
             RETURNING next_value - 1",
            params![prefix],
            |row| row.get(0),
        )?;
        let candidate = format!("{}-{}", prefix, next);
        if get_task_internal(conn, &candidate)?.is_none() {
            return Ok(candidate);
        }
    }
}

fn validate_dependencies(task_id: Option<&str>, deps: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for dep in deps {
        if dep.trim().is_empty() {
            return Err(ToolError::invalid_value("depends_on", "Dependency ids cannot be empty").into());
        }
        if Some(dep.as_str()) == task_id {
            return Err(ToolError::invalid_value(
                "depends_on",
                format!("Task {} cannot depend on itself", dep),
            )
            .into());
        }
        if !seen.insert(dep.as_str()) {
            return Err(ToolError::invalid_value(
                "depends_on",
                format!("Duplicate dependency: {}", dep),
            )
            .into());
        }
    }
    Ok(())
}

/// Would making `task_id` depend on `deps` close a cycle through stored edges?
/// Returns the dependency through which the cycle runs.
fn find_cycle(conn: &Connection, task_id: &str, deps: &[String]) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT depends_on FROM task_dependencies WHERE task_id = ?1")?;

    for dep in deps {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(dep.clone());

        while let Some(current) = queue.pop_front() {
            if current == task_id {
                return Ok(Some(dep.clone()));
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            let next = stmt
                .query_map(params![&current], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            queue.extend(next.into_iter().filter(|id| !visited.contains(id)));
        }
    }

    Ok(None)
}

impl Database {
    /// Create a new task.
    ///
    /// Dependencies may name tasks that do not exist yet; they stay unmet
    /// until such a task is created and reaches `done`.
    pub fn create_task(&self, input: NewTask, prefix: &str) -> Result<Task> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(ToolError::missing_field("title").into());
        }

        let status = input.initial_status.unwrap_or(TaskStatus::Queued);
        if !matches!(status, TaskStatus::Queued | TaskStatus::Blocked) {
            return Err(ToolError::invalid_value(
                "status",
                format!("Tasks can only be created as queued or blocked, not {}", status),
            )
            .into());
        }

        if let Some(ref id) = input.id {
            if id.trim().is_empty() {
                return Err(ToolError::invalid_value("id", "Task ID cannot be empty").into());
            }
            if id.len() > MAX_TASK_ID_LEN {
                return Err(ToolError::invalid_value(
                    "id",
                    format!("Task ID must be at most {} characters", MAX_TASK_ID_LEN),
                )
                .into());
            }
        }
        validate_dependencies(input.id.as_deref(), &input.depends_on)?;

        let tags_json = serde_json::to_string(&input.tags)?;
        let now = now_ms();

        self.with_write_tx(|tx| {
            let task_id = match input.id {
                Some(ref id) => {
                    if get_task_internal(tx, id)?.is_some() {
                        return Err(ToolError::already_exists("Task", id).into());
                    }
                    id.clone()
                }
                None => next_task_id(tx, prefix)?,
            };

            if input.depends_on.iter().any(|dep| dep == &task_id) {
                return Err(ToolError::invalid_value(
                    "depends_on",
                    format!("Task {} cannot depend on itself", task_id),
                )
                .into());
            }
            if let Some(through) = find_cycle(tx, &task_id, &input.depends_on)? {
                return Err(ToolError::dependency_cycle(&task_id, &through).into());
            }

            tx.execute(
                "INSERT INTO tasks (
                    id, title, description, priority, priority_rank, status, tags, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    &task_id,
                    &title,
                    &input.description,
                    input.priority.as_str(),
                    input.priority.rank(),
                    status.as_str(),
                    tags_json,
                    now,
                ],
            )?;
            let seq = tx.last_insert_rowid();

            for (ordinal, dep) in input.depends_on.iter().enumerate() {
                tx.execute(
                    "INSERT INTO task_dependencies (task_id, depends_on, ordinal) VALUES (?1, ?2, ?3)",
                    params![&task_id, dep, ordinal as i64],
                )?;
            }

            Ok(Task {
                id: task_id,
                title,
                description: input.description.clone(),
                priority: input.priority,
                status,
                assignee: None,
                dependencies: input.depends_on.clone(),
                tags: input.tags.clone(),
                outcome: None,
                seq,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            })
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Get a task by ID, failing with `TaskNotFound`.
    pub fn require_task(&self, task_id: &str) -> Result<Task> {
        self.with_conn(|conn| require_task_internal(conn, task_id))
    }

    /// List tasks with optional filters, in claim order.
    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        assignee: Option<&str>,
    ) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE 1 = 1");
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(s) = status {
                sql.push_str(" AND t.status = ?");
                params_vec.push(Box::new(s.as_str()));
            }

            if let Some(a) = assignee {
                sql.push_str(" AND t.assignee = ?");
                params_vec.push(Box::new(a.to_string()));
            }

            sql.push_str(" ORDER BY t.priority_rank ASC, t.seq ASC");

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let mut tasks = stmt
                .query_map(params_refs.as_slice(), parse_task_row)?
                .collect::<rusqlite::Result<Vec<Task>>>()?;
            attach_dependencies(conn, &mut tasks)?;

            Ok(tasks)
        })
    }

    /// Queued tasks whose dependencies are all done, in the order claims take them.
    pub fn eligible_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks t
                 WHERE t.status = 'queued'
                   AND NOT EXISTS (
                     SELECT 1 FROM task_dependencies d
                     LEFT JOIN tasks u ON u.id = d.depends_on
                     WHERE d.task_id = t.id AND (u.status IS NULL OR u.status != 'done')
                   )
                 ORDER BY t.priority_rank ASC, t.seq ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut tasks = stmt
                .query_map([], parse_task_row)?
                .collect::<rusqlite::Result<Vec<Task>>>()?;
            attach_dependencies(conn, &mut tasks)?;
            Ok(tasks)
        })
    }

    /// Dependencies of a task that are not yet done.
    pub fn blocking_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            require_task_internal(conn, task_id)?;
            unmet_dependencies(conn, task_id)
        })
    }

    /// Move a `blocked` task back into the queue.
    pub fn unblock_task(&self, task_id: &str) -> Result<Task> {
        let now = now_ms();

        self.with_write_tx(|tx| {
            let task = require_task_internal(tx, task_id)?;
            if task.status != TaskStatus::Blocked {
                return Err(ToolError::invalid_state(format!(
                    "Task {} is not blocked (status: {})",
                    task_id, task.status
                ))
                .into());
            }

            tx.execute(
                "UPDATE tasks SET status = 'queued', updated_at = ?1 WHERE id = ?2",
                params![now, task_id],
            )?;

            Ok(Task {
                status: TaskStatus::Queued,
                updated_at: now,
                ..task
            })
        })
    }
}
