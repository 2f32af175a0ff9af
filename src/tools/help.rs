//! Help-request and routing tools.

use super::{
    get_parsed, get_priority, get_seconds, get_string, get_string_array, make_tool,
    require_string, to_value, ToolSpec,
};
use crate::error::{ToolError, ToolResult};
use crate::hub::Hub;
use crate::types::{HelpStatus, NewHelpRequest};
use serde_json::{Value, json};

pub fn get_tools() -> Vec<ToolSpec> {
    vec![
        make_tool(
            "request_help",
            "Ask for help on a task you are working. Returns the request and the other live sessions ranked by how well they match.",
            json!({
                "task_id": { "type": "string", "description": "Task needing help" },
                "requester": { "type": "string", "description": "Session asking (assignee or lock holder)" },
                "category": { "type": "string", "description": "Kind of help, e.g. review, debugging" },
                "urgency": {
                    "type": "string",
                    "enum": ["urgent", "high", "medium", "low"],
                    "description": "Urgency (default: medium)"
                },
                "context": { "type": "string", "description": "What the helper needs to know" }
            }),
            vec!["task_id", "requester", "category"],
        ),
        make_tool(
            "accept_help",
            "Accept an open help request. The helper gets a helper lock on the task.",
            json!({
                "request_id": { "type": "string", "description": "Help request id" },
                "helper": { "type": "string", "description": "Session accepting" },
                "lease_seconds": { "type": "integer", "description": "Helper lock lease (default: locks.helper_seconds)" }
            }),
            vec!["request_id", "helper"],
        ),
        make_tool(
            "complete_help",
            "Close an accepted help request with a summary. Releases the helper lock.",
            json!({
                "request_id": { "type": "string", "description": "Help request id" },
                "helper": { "type": "string", "description": "The helper that accepted it" },
                "outcome": { "type": "string", "description": "What was done" }
            }),
            vec!["request_id", "helper", "outcome"],
        ),
        make_tool(
            "cancel_help",
            "Withdraw an open help request.",
            json!({
                "request_id": { "type": "string", "description": "Help request id" },
                "requester": { "type": "string", "description": "The session that raised it" }
            }),
            vec!["request_id", "requester"],
        ),
        make_tool(
            "get_help",
            "Fetch one help request.",
            json!({
                "request_id": { "type": "string", "description": "Help request id" }
            }),
            vec!["request_id"],
        ),
        make_tool(
            "list_help",
            "List help requests, oldest first.",
            json!({
                "status": {
                    "type": "string",
                    "enum": ["open", "accepted", "completed", "cancelled"],
                    "description": "Filter by status"
                }
            }),
            vec![],
        ),
        make_tool(
            "find_best_agent",
            "Pick the live session best matched to a task, by existing task id or by description and tags. Returns agent=null when nobody scores high enough.",
            json!({
                "task_id": { "type": "string", "description": "Existing task to route" },
                "description": { "type": "string", "description": "Task description (when no task_id)" },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Task tags (when no task_id)"
                }
            }),
            vec![],
        ),
    ]
}

pub fn request_help(hub: &Hub, args: Value) -> ToolResult<Value> {
    let input = NewHelpRequest {
        task_id: require_string(&args, "task_id")?,
        requester: require_string(&args, "requester")?,
        category: require_string(&args, "category")?,
        urgency: get_priority(&args, "urgency")?.unwrap_or_default(),
        context: get_string(&args, "context").unwrap_or_default(),
    };

    let broadcast = hub.request_help(input)?;
    Ok(json!({
        "success": true,
        "request": to_value(&broadcast.request)?,
        "candidates": to_value(&broadcast.candidates)?,
    }))
}

pub fn accept_help(hub: &Hub, args: Value) -> ToolResult<Value> {
    let request_id = require_string(&args, "request_id")?;
    let helper = require_string(&args, "helper")?;
    let lease = get_seconds(&args, "lease_seconds")?;
    let request = hub.accept_help(&request_id, &helper, lease)?;
    Ok(json!({ "success": true, "request": to_value(&request)? }))
}

pub fn complete_help(hub: &Hub, args: Value) -> ToolResult<Value> {
    let request_id = require_string(&args, "request_id")?;
    let helper = require_string(&args, "helper")?;
    let outcome = require_string(&args, "outcome")?;
    let request = hub.complete_help(&request_id, &helper, &outcome)?;
    Ok(json!({ "success": true, "request": to_value(&request)? }))
}

pub fn cancel_help(hub: &Hub, args: Value) -> ToolResult<Value> {
    let request_id = require_string(&args, "request_id")?;
    let requester = require_string(&args, "requester")?;
    let request = hub.cancel_help(&request_id, &requester)?;
    Ok(json!({ "success": true, "request": to_value(&request)? }))
}

pub fn get_help(hub: &Hub, args: Value) -> ToolResult<Value> {
    let request_id = require_string(&args, "request_id")?;
    let request = hub.get_help(&request_id)?;
    Ok(json!({ "request": to_value(&request)? }))
}

pub fn list_help(hub: &Hub, args: Value) -> ToolResult<Value> {
    let status = get_parsed(
        &args,
        "status",
        HelpStatus::parse,
        "open, accepted, completed or cancelled",
    )?;
    let requests = hub.list_help(status)?;
    Ok(json!({ "count": requests.len(), "requests": to_value(&requests)? }))
}

pub fn find_best_agent(hub: &Hub, args: Value) -> ToolResult<Value> {
    let best = match get_string(&args, "task_id") {
        Some(task_id) => hub.find_best_agent_for_task(&task_id)?,
        None => {
            let description = get_string(&args, "description").unwrap_or_default();
            let tags = get_string_array(&args, "tags").unwrap_or_default();
            if description.trim().is_empty() && tags.is_empty() {
                return Err(ToolError::missing_field("task_id")
                    .with_details("Give task_id, or a description and/or tags"));
            }
            hub.find_best_agent(&description, &tags)?
        }
    };

    Ok(match best {
        Some(ranked) => json!({
            "agent": to_value(&ranked.session)?,
            "score": ranked.score,
        }),
        None => json!({ "agent": null, "score": null }),
    })
}
