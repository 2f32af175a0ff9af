//! Task creation, queries, claiming and completion reports.

use super::{
    get_parsed, get_priority, get_string, get_string_array, make_tool, require_string, to_value,
    ToolSpec,
};
use crate::error::ToolResult;
use crate::hub::Hub;
use crate::types::{ClaimOutcome, NewTask, TaskStatus};
use serde_json::{Value, json};

fn get_status(args: &Value, key: &str) -> ToolResult<Option<TaskStatus>> {
    get_parsed(
        args,
        key,
        TaskStatus::parse,
        "queued, in_progress, done, blocked or failed",
    )
}

pub fn get_tools() -> Vec<ToolSpec> {
    vec![
        make_tool(
            "create_task",
            "Add a task to the backlog. Dependencies may name tasks that do not exist yet; they stay unmet until such a task is done. Cycles are rejected.",
            json!({
                "title": { "type": "string", "description": "Short task title" },
                "description": { "type": "string", "description": "Longer description, used for routing" },
                "priority": {
                    "type": "string",
                    "enum": ["urgent", "high", "medium", "low"],
                    "description": "Priority tier (default: medium)"
                },
                "depends_on": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Task ids that must be done before this one can be claimed"
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Capability tags matched against worker profiles"
                },
                "id": { "type": "string", "description": "Explicit task id (default: next <prefix>-<n>)" },
                "status": {
                    "type": "string",
                    "enum": ["queued", "blocked"],
                    "description": "Initial status (default: queued)"
                }
            }),
            vec!["title"],
        ),
        make_tool(
            "unblock_task",
            "Move a blocked task back to the queue.",
            json!({
                "task_id": { "type": "string", "description": "Task to unblock" }
            }),
            vec!["task_id"],
        ),
        make_tool(
            "get_task",
            "Fetch one task, with the dependencies still holding it back.",
            json!({
                "task_id": { "type": "string", "description": "Task id" }
            }),
            vec!["task_id"],
        ),
        make_tool(
            "list_tasks",
            "List tasks in claim order (priority, then age). Use eligible=true for tasks claimable right now.",
            json!({
                "status": { "type": "string", "description": "Filter by status" },
                "assignee": { "type": "string", "description": "Filter by assigned worker" },
                "eligible": { "type": "boolean", "description": "Only claimable tasks (ignores other filters)" }
            }),
            vec![],
        ),
        make_tool(
            "claim",
            "Claim a task. Without task_id, takes the most urgent, oldest eligible task. Returns outcome claimed, none_queued or blocked. Unknown workers are registered on the fly.",
            json!({
                "worker_id": { "type": "string", "description": "Claiming worker (session id)" },
                "task_id": { "type": "string", "description": "Specific task to claim" }
            }),
            vec!["worker_id"],
        ),
        make_tool(
            "complete",
            "Report an in-progress task as done. Releases every lock on it.",
            json!({
                "task_id": { "type": "string", "description": "Task id" },
                "worker_id": { "type": "string", "description": "Must match the assignee when given" },
                "outcome": { "type": "string", "description": "Completion summary" }
            }),
            vec!["task_id"],
        ),
        make_tool(
            "fail",
            "Report an in-progress task as failed. Releases every lock on it.",
            json!({
                "task_id": { "type": "string", "description": "Task id" },
                "worker_id": { "type": "string", "description": "Must match the assignee when given" },
                "reason": { "type": "string", "description": "What went wrong" }
            }),
            vec!["task_id"],
        ),
    ]
}

pub fn create_task(hub: &Hub, args: Value) -> ToolResult<Value> {
    let title = require_string(&args, "title")?;
    let input = NewTask {
        id: get_string(&args, "id"),
        title,
        description: get_string(&args, "description"),
        priority: get_priority(&args, "priority")?.unwrap_or_default(),
        depends_on: get_string_array(&args, "depends_on").unwrap_or_default(),
        tags: get_string_array(&args, "tags").unwrap_or_default(),
        initial_status: get_status(&args, "status")?,
    };

    let task = hub.create_task(input)?;
    Ok(json!({ "success": true, "task": to_value(&task)? }))
}

pub fn unblock_task(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let task = hub.unblock_task(&task_id)?;
    Ok(json!({ "success": true, "task": to_value(&task)? }))
}

pub fn get_task(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let task = hub.get_task(&task_id)?;
    let blocked_by = hub.db().blocking_dependencies(&task_id)?;
    Ok(json!({ "task": to_value(&task)?, "blocked_by": blocked_by }))
}

pub fn list_tasks(hub: &Hub, args: Value) -> ToolResult<Value> {
    let tasks = if super::get_bool(&args, "eligible").unwrap_or(false) {
        hub.eligible_tasks()?
    } else {
        let status = get_status(&args, "status")?;
        let assignee = get_string(&args, "assignee");
        hub.list_tasks(status, assignee.as_deref())?
    };
    Ok(json!({ "count": tasks.len(), "tasks": to_value(&tasks)? }))
}

pub fn claim(hub: &Hub, args: Value) -> ToolResult<Value> {
    let worker_id = require_string(&args, "worker_id")?;
    let task_id = get_string(&args, "task_id");

    let outcome = hub.claim(task_id.as_deref(), &worker_id)?;
    let success = matches!(outcome, ClaimOutcome::Claimed { .. });
    let mut value = to_value(&outcome)?;
    value["success"] = json!(success);
    Ok(value)
}

pub fn complete(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let worker_id = get_string(&args, "worker_id");
    let task = hub.complete(&task_id, worker_id.as_deref(), get_string(&args, "outcome"))?;
    Ok(json!({ "success": true, "task": to_value(&task)? }))
}

pub fn fail(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let worker_id = get_string(&args, "worker_id");
    let task = hub.fail(&task_id, worker_id.as_deref(), get_string(&args, "reason"))?;
    Ok(json!({ "success": true, "task": to_value(&task)? }))
}
