//! Session registry tools.

use super::{
    get_bool, get_i64, get_parsed, get_seconds, get_string, get_string_array, make_tool,
    require_string, to_value, ToolSpec,
};
use crate::error::ToolResult;
use crate::hub::{CheckIn, Hub};
use crate::types::{CapabilityProfile, ContextTier};
use serde_json::{Value, json};

pub fn get_tools() -> Vec<ToolSpec> {
    vec![
        make_tool(
            "check_in",
            "Register a worker session, or re-activate one by id and replace its capability profile.",
            json!({
                "session_id": { "type": "string", "description": "Existing or chosen session id (default: new UUIDv7)" },
                "name": { "type": "string", "description": "Display name (default: random)" },
                "strengths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Skills the worker is good at"
                },
                "best_for": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Kinds of work the worker should be routed first"
                },
                "context_tier": {
                    "type": "string",
                    "enum": ["small", "medium", "large"],
                    "description": "Context window size (default: medium)"
                },
                "max_claims": { "type": "integer", "description": "Concurrent claims allowed" }
            }),
            vec![],
        ),
        make_tool(
            "heartbeat",
            "Refresh a session's liveness and renew the leases of its unexpired locks.",
            json!({
                "session_id": { "type": "string", "description": "Session id" }
            }),
            vec!["session_id"],
        ),
        make_tool(
            "check_out",
            "Take a session offline. Its in-progress tasks are requeued, its locks dropped and its open help requests cancelled.",
            json!({
                "session_id": { "type": "string", "description": "Session id" }
            }),
            vec!["session_id"],
        ),
        make_tool(
            "get_session",
            "Fetch one session.",
            json!({
                "session_id": { "type": "string", "description": "Session id" }
            }),
            vec!["session_id"],
        ),
        make_tool(
            "list_sessions",
            "List sessions, newest first.",
            json!({
                "include_offline": { "type": "boolean", "description": "Include offline sessions (default: false)" }
            }),
            vec![],
        ),
        make_tool(
            "reap_stale",
            "Release the work of sessions whose heartbeat is older than the timeout, and drop expired locks.",
            json!({
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Staleness threshold (default: server.stale_timeout_seconds)"
                }
            }),
            vec![],
        ),
    ]
}

pub fn check_in(hub: &Hub, args: Value) -> ToolResult<Value> {
    let context_tier = get_parsed(&args, "context_tier", ContextTier::parse, "small, medium or large")?;
    let input = CheckIn {
        session_id: get_string(&args, "session_id"),
        name: get_string(&args, "name"),
        capabilities: CapabilityProfile {
            strengths: get_string_array(&args, "strengths").unwrap_or_default(),
            best_for: get_string_array(&args, "best_for").unwrap_or_default(),
            context_tier: context_tier.unwrap_or_default(),
        },
        max_claims: get_i64(&args, "max_claims"),
    };

    let session = hub.check_in(input)?;
    Ok(json!({ "success": true, "session": to_value(&session)? }))
}

pub fn heartbeat(hub: &Hub, args: Value) -> ToolResult<Value> {
    let session_id = require_string(&args, "session_id")?;
    let session = hub.heartbeat(&session_id)?;
    Ok(json!({ "success": true, "session": to_value(&session)? }))
}

pub fn check_out(hub: &Hub, args: Value) -> ToolResult<Value> {
    let session_id = require_string(&args, "session_id")?;
    let summary = hub.check_out(&session_id)?;
    Ok(json!({ "success": true, "released": to_value(&summary)? }))
}

pub fn get_session(hub: &Hub, args: Value) -> ToolResult<Value> {
    let session_id = require_string(&args, "session_id")?;
    let session = hub.get_session(&session_id)?;
    Ok(json!({ "session": to_value(&session)? }))
}

pub fn list_sessions(hub: &Hub, args: Value) -> ToolResult<Value> {
    let include_offline = get_bool(&args, "include_offline").unwrap_or(false);
    let sessions = hub.list_sessions(include_offline)?;
    Ok(json!({ "count": sessions.len(), "sessions": to_value(&sessions)? }))
}

pub fn reap_stale(hub: &Hub, args: Value) -> ToolResult<Value> {
    let timeout = get_seconds(&args, "timeout_seconds")?;
    let summary = hub.reap_stale(timeout)?;
    Ok(json!({ "success": true, "released": to_value(&summary)? }))
}
