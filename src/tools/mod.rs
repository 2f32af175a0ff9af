//! JSON command surface.
//!
//! Each command takes a JSON object of arguments and returns a JSON payload.
//! Failures are reported as `{"error": {"code", "message", "field"?, "details"?}}`
//! by [`respond`]; nothing here relies on process exit codes.

pub mod help;
pub mod locks;
pub mod sessions;
pub mod tasks;

use crate::error::{ToolError, ToolResult};
use crate::hub::Hub;
use crate::types::Priority;
use serde::Serialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Name, description and argument schema of a command.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Dispatches named commands onto the hub.
#[derive(Clone)]
pub struct ToolHandler {
    pub hub: Hub,
}

impl ToolHandler {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    /// Get all available tools.
    pub fn get_tools(&self) -> Vec<ToolSpec> {
        let mut tools = Vec::new();

        // Task and claim tools
        tools.extend(tasks::get_tools());

        // Session tools
        tools.extend(sessions::get_tools());

        // Lock tools
        tools.extend(locks::get_tools());

        // Help and routing tools
        tools.extend(help::get_tools());

        tools
    }

    /// Call a tool by name.
    pub fn call_tool(&self, name: &str, arguments: Value) -> ToolResult<Value> {
        let hub = &self.hub;
        let start = Instant::now();
        let result = match name {
            // Task and claim tools
            "create_task" => tasks::create_task(hub, arguments),
            "unblock_task" => tasks::unblock_task(hub, arguments),
            "get_task" => tasks::get_task(hub, arguments),
            "list_tasks" => tasks::list_tasks(hub, arguments),
            "claim" => tasks::claim(hub, arguments),
            "complete" => tasks::complete(hub, arguments),
            "fail" => tasks::fail(hub, arguments),

            // Session tools
            "check_in" => sessions::check_in(hub, arguments),
            "heartbeat" => sessions::heartbeat(hub, arguments),
            "check_out" => sessions::check_out(hub, arguments),
            "get_session" => sessions::get_session(hub, arguments),
            "list_sessions" => sessions::list_sessions(hub, arguments),
            "reap_stale" => sessions::reap_stale(hub, arguments),

            // Lock tools
            "acquire_lock" => locks::acquire_lock(hub, arguments),
            "release_lock" => locks::release_lock(hub, arguments),
            "heartbeat_lock" => locks::heartbeat_lock(hub, arguments),
            "list_locks" => locks::list_locks(hub, arguments),

            // Help and routing tools
            "request_help" => help::request_help(hub, arguments),
            "accept_help" => help::accept_help(hub, arguments),
            "complete_help" => help::complete_help(hub, arguments),
            "cancel_help" => help::cancel_help(hub, arguments),
            "get_help" => help::get_help(hub, arguments),
            "list_help" => help::list_help(hub, arguments),
            "find_best_agent" => help::find_best_agent(hub, arguments),

            _ => Err(ToolError::unknown_tool(name)),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(tool = %name, duration_ms, "Tool call succeeded"),
            Err(e) => warn!(
                tool = %name,
                error_code = ?e.code,
                error_message = %e.message,
                duration_ms,
                "Tool call failed"
            ),
        }
        result
    }

    /// Call a tool and fold any failure into the structured error payload.
    pub fn call_tool_json(&self, name: &str, arguments: Value) -> Value {
        respond(self.call_tool(name, arguments))
    }
}

/// Success payload as is; failures as `{"error": {...}}`.
pub fn respond(result: ToolResult<Value>) -> Value {
    match result {
        Ok(value) => value,
        Err(e) => json!({ "error": e }),
    }
}

/// Helper to create a tool definition.
pub fn make_tool(name: &str, description: &str, properties: Value, required: Vec<&str>) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

/// Serialize a payload, mapping the (unlikely) failure to an internal error.
pub fn to_value<T: Serialize>(value: &T) -> ToolResult<Value> {
    serde_json::to_value(value).map_err(ToolError::internal)
}

/// Helper to get a string from arguments.
pub fn get_string(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str().map(String::from))
}

/// A string argument that must be present and non-blank.
pub fn require_string(args: &Value, key: &str) -> ToolResult<String> {
    match get_string(args, key) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(ToolError::missing_field(key)),
    }
}

/// Helper to get an i64 from arguments.
pub fn get_i64(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(|v| v.as_i64())
}

/// Helper to get a bool from arguments.
pub fn get_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

/// Helper to get a string array from arguments.
pub fn get_string_array(args: &Value, key: &str) -> Option<Vec<String>> {
    args.get(key).and_then(|v| {
        v.as_array().map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
    })
}

/// Optional enum argument; a present but unrecognized value is an error.
pub fn get_parsed<T>(
    args: &Value,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
    expected: &str,
) -> ToolResult<Option<T>> {
    match get_string(args, key) {
        None => Ok(None),
        Some(raw) => parse(&raw).map(Some).ok_or_else(|| {
            ToolError::invalid_value(key, format!("Unknown {} '{}', expected {}", key, raw, expected))
        }),
    }
}

pub fn get_priority(args: &Value, key: &str) -> ToolResult<Option<Priority>> {
    get_parsed(args, key, Priority::parse, "urgent, high, medium or low")
}

/// Optional whole-seconds duration argument, which must be positive.
pub fn get_seconds(args: &Value, key: &str) -> ToolResult<Option<Duration>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
            _ => Err(ToolError::invalid_value(key, format!("{} must be a positive integer", key))),
        },
    }
}
