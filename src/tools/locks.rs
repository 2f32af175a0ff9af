//! Lock manager tools.

use super::{get_parsed, get_seconds, get_string, make_tool, require_string, to_value, ToolSpec};
use crate::error::{ToolError, ToolResult};
use crate::hub::Hub;
use crate::types::LockStrength;
use serde_json::{Value, json};

pub fn get_tools() -> Vec<ToolSpec> {
    vec![
        make_tool(
            "acquire_lock",
            "Take or re-take a lock on a task. Active and soft locks exclude each other across sessions; helper locks never conflict. Returns acquired=false on conflict.",
            json!({
                "task_id": { "type": "string", "description": "Task id" },
                "session_id": { "type": "string", "description": "Session taking the lock" },
                "strength": {
                    "type": "string",
                    "enum": ["active", "soft", "helper"],
                    "description": "Lock strength"
                },
                "lease_seconds": { "type": "integer", "description": "Lease length (default per strength)" }
            }),
            vec!["task_id", "session_id", "strength"],
        ),
        make_tool(
            "release_lock",
            "Release a session's lock on a task.",
            json!({
                "task_id": { "type": "string", "description": "Task id" },
                "session_id": { "type": "string", "description": "Lock holder" }
            }),
            vec!["task_id", "session_id"],
        ),
        make_tool(
            "heartbeat_lock",
            "Extend a lock's expiry. Never shortens it. Fails with LEASE_EXPIRED if the lock is gone or already expired.",
            json!({
                "task_id": { "type": "string", "description": "Task id" },
                "session_id": { "type": "string", "description": "Lock holder" },
                "lease_seconds": { "type": "integer", "description": "Lease length (default per strength)" }
            }),
            vec!["task_id", "session_id"],
        ),
        make_tool(
            "list_locks",
            "List locks on a task, held by a session, or all of them.",
            json!({
                "task_id": { "type": "string", "description": "Only locks on this task" },
                "session_id": { "type": "string", "description": "Only locks held by this session" }
            }),
            vec![],
        ),
    ]
}

pub fn acquire_lock(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let session_id = require_string(&args, "session_id")?;
    let strength = get_parsed(&args, "strength", LockStrength::parse, "active, soft or helper")?
        .ok_or_else(|| ToolError::missing_field("strength"))?;
    let lease = get_seconds(&args, "lease_seconds")?;

    let acquired = hub.acquire_lock(&task_id, &session_id, strength, lease)?;
    let lock = if acquired {
        hub.db().get_lock(&task_id, &session_id)?
    } else {
        None
    };
    Ok(json!({ "acquired": acquired, "lock": to_value(&lock)? }))
}

pub fn release_lock(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let session_id = require_string(&args, "session_id")?;
    let released = hub.release_lock(&task_id, &session_id)?;
    Ok(json!({ "released": released }))
}

pub fn heartbeat_lock(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = require_string(&args, "task_id")?;
    let session_id = require_string(&args, "session_id")?;
    let lease = get_seconds(&args, "lease_seconds")?;
    let lock = hub.heartbeat_lock(&task_id, &session_id, lease)?;
    Ok(json!({ "success": true, "expires_at": lock.expires_at, "lock": to_value(&lock)? }))
}

pub fn list_locks(hub: &Hub, args: Value) -> ToolResult<Value> {
    let task_id = get_string(&args, "task_id");
    let session_id = get_string(&args, "session_id");
    let locks = hub.list_locks(task_id.as_deref(), session_id.as_deref())?;
    Ok(json!({ "count": locks.len(), "locks": to_value(&locks)? }))
}
