//! Integration tests for the JSON command surface.

use claimboard::config::Config;
use claimboard::hub::Hub;
use claimboard::tools::ToolHandler;
use serde_json::{Value, json};

fn setup_handler() -> ToolHandler {
    let hub = Hub::in_memory(Config::default()).expect("Failed to create in-memory hub");
    ToolHandler::new(hub)
}

fn call(handler: &ToolHandler, tool: &str, args: Value) -> Value {
    handler.call_tool_json(tool, args)
}

fn error_code(payload: &Value) -> &str {
    payload["error"]["code"].as_str().unwrap_or("")
}

mod task_tool_tests {
    use super::*;

    #[test]
    fn dependency_handoff_between_workers() {
        let handler = setup_handler();
        call(&handler, "create_task", json!({ "title": "build", "priority": "high" }));
        call(
            &handler,
            "create_task",
            json!({ "title": "deploy", "priority": "urgent", "depends_on": ["T-1"] }),
        );

        let first = call(&handler, "claim", json!({ "worker_id": "w1" }));
        assert_eq!(first["outcome"], "claimed");
        assert_eq!(first["success"], true);
        assert_eq!(first["task"]["id"], "T-1");

        let waiting = call(&handler, "claim", json!({ "worker_id": "w2" }));
        assert_eq!(waiting["outcome"], "blocked");
        assert_eq!(waiting["success"], false);
        assert_eq!(waiting["waiting"][0]["task_id"], "T-2");
        assert_eq!(waiting["waiting"][0]["unmet"], json!(["T-1"]));

        let done = call(
            &handler,
            "complete",
            json!({ "task_id": "T-1", "worker_id": "w1", "outcome": "artifact ready" }),
        );
        assert_eq!(done["task"]["status"], "done");

        let second = call(&handler, "claim", json!({ "worker_id": "w2" }));
        assert_eq!(second["task"]["id"], "T-2");
        assert_eq!(second["task"]["assignee"], "w2");

        let empty = call(&handler, "claim", json!({ "worker_id": "w3" }));
        assert_eq!(empty["outcome"], "none_queued");
    }

    #[test]
    fn errors_come_back_as_structured_payloads() {
        let handler = setup_handler();
        call(&handler, "create_task", json!({ "title": "only" }));
        call(&handler, "claim", json!({ "worker_id": "w1" }));

        let taken = call(&handler, "claim", json!({ "worker_id": "w2", "task_id": "T-1" }));
        assert_eq!(error_code(&taken), "NOT_QUEUED");
        assert!(taken["error"]["message"].as_str().unwrap().contains("T-1"));

        let stranger = call(&handler, "fail", json!({ "task_id": "T-1", "worker_id": "w2" }));
        assert_eq!(error_code(&stranger), "NOT_OWNER");

        let missing = call(&handler, "create_task", json!({}));
        assert_eq!(error_code(&missing), "MISSING_REQUIRED_FIELD");
        assert_eq!(missing["error"]["field"], "title");

        let bad_priority = call(&handler, "create_task", json!({ "title": "x", "priority": "asap" }));
        assert_eq!(error_code(&bad_priority), "INVALID_FIELD_VALUE");

        let unknown = call(&handler, "get_task", json!({ "task_id": "T-9" }));
        assert_eq!(error_code(&unknown), "TASK_NOT_FOUND");
    }

    #[test]
    fn get_task_reports_blockers_and_listing_filters() {
        let handler = setup_handler();
        call(&handler, "create_task", json!({ "title": "a" }));
        call(&handler, "create_task", json!({ "title": "b", "depends_on": ["T-1", "T-7"] }));
        call(&handler, "create_task", json!({ "title": "c", "status": "blocked" }));

        let b = call(&handler, "get_task", json!({ "task_id": "T-2" }));
        assert_eq!(b["blocked_by"], json!(["T-1", "T-7"]));

        let eligible = call(&handler, "list_tasks", json!({ "eligible": true }));
        assert_eq!(eligible["count"], 1);
        assert_eq!(eligible["tasks"][0]["id"], "T-1");

        let blocked = call(&handler, "list_tasks", json!({ "status": "blocked" }));
        assert_eq!(blocked["count"], 1);

        let unblocked = call(&handler, "unblock_task", json!({ "task_id": "T-3" }));
        assert_eq!(unblocked["task"]["status"], "queued");
    }
}

mod coordination_tool_tests {
    use super::*;

    #[test]
    fn locks_through_the_command_surface() {
        let handler = setup_handler();
        call(&handler, "create_task", json!({ "title": "shared" }));
        call(&handler, "check_in", json!({ "session_id": "a" }));
        call(&handler, "check_in", json!({ "session_id": "b" }));

        let soft = call(
            &handler,
            "acquire_lock",
            json!({ "task_id": "T-1", "session_id": "a", "strength": "soft" }),
        );
        assert_eq!(soft["acquired"], true);
        assert_eq!(soft["lock"]["strength"], "soft");

        let refused = call(
            &handler,
            "acquire_lock",
            json!({ "task_id": "T-1", "session_id": "b", "strength": "active" }),
        );
        assert_eq!(refused["acquired"], false);
        assert!(refused["lock"].is_null());

        let renewed = call(
            &handler,
            "heartbeat_lock",
            json!({ "task_id": "T-1", "session_id": "a", "lease_seconds": 120 }),
        );
        assert_eq!(renewed["success"], true);

        let bad_lease = call(
            &handler,
            "heartbeat_lock",
            json!({ "task_id": "T-1", "session_id": "a", "lease_seconds": 0 }),
        );
        assert_eq!(error_code(&bad_lease), "INVALID_FIELD_VALUE");

        let listed = call(&handler, "list_locks", json!({}));
        assert_eq!(listed["count"], 1);

        let released = call(&handler, "release_lock", json!({ "task_id": "T-1", "session_id": "a" }));
        assert_eq!(released["released"], true);

        let expired = call(&handler, "heartbeat_lock", json!({ "task_id": "T-1", "session_id": "a" }));
        assert_eq!(error_code(&expired), "LEASE_EXPIRED");
    }

    #[test]
    fn help_round_trip() {
        let handler = setup_handler();
        call(&handler, "create_task", json!({ "title": "tune queries", "tags": ["sql"] }));
        call(&handler, "check_in", json!({ "session_id": "owner" }));
        call(&handler, "check_in", json!({ "session_id": "dba", "strengths": ["sql"] }));
        call(&handler, "claim", json!({ "worker_id": "owner" }));

        let raised = call(
            &handler,
            "request_help",
            json!({ "task_id": "T-1", "requester": "owner", "category": "performance" }),
        );
        assert_eq!(raised["request"]["status"], "open");
        assert_eq!(raised["candidates"][0]["session"]["id"], "dba");
        let request_id = raised["request"]["id"].as_str().unwrap().to_string();

        let accepted = call(
            &handler,
            "accept_help",
            json!({ "request_id": request_id, "helper": "dba" }),
        );
        assert_eq!(accepted["request"]["status"], "accepted");

        let completed = call(
            &handler,
            "complete_help",
            json!({ "request_id": request_id, "helper": "dba", "outcome": "added an index" }),
        );
        assert_eq!(completed["request"]["status"], "completed");

        let listed = call(&handler, "list_help", json!({ "status": "completed" }));
        assert_eq!(listed["count"], 1);
    }

    #[test]
    fn find_best_agent_by_description_or_task() {
        let handler = setup_handler();
        call(
            &handler,
            "check_in",
            json!({ "session_id": "parser-pro", "best_for": ["parsers"], "context_tier": "large" }),
        );
        call(&handler, "check_in", json!({ "session_id": "generalist" }));

        let best = call(
            &handler,
            "find_best_agent",
            json!({ "description": "Write parsers for the config format" }),
        );
        assert_eq!(best["agent"]["id"], "parser-pro");
        assert!(best["score"].as_f64().unwrap() >= 1.0);

        call(&handler, "create_task", json!({ "title": "paint the bikeshed" }));
        let nobody = call(&handler, "find_best_agent", json!({ "task_id": "T-1" }));
        assert!(nobody["agent"].is_null());

        let no_input = call(&handler, "find_best_agent", json!({}));
        assert_eq!(error_code(&no_input), "MISSING_REQUIRED_FIELD");
    }

    #[test]
    fn check_out_requeues_through_tools() {
        let handler = setup_handler();
        call(&handler, "create_task", json!({ "title": "abandoned" }));
        call(&handler, "claim", json!({ "worker_id": "w1" }));

        let out = call(&handler, "check_out", json!({ "session_id": "w1" }));
        assert_eq!(out["released"]["requeued_tasks"], json!(["T-1"]));

        let task = call(&handler, "get_task", json!({ "task_id": "T-1" }));
        assert_eq!(task["task"]["status"], "queued");

        let sessions = call(&handler, "list_sessions", json!({ "include_offline": true }));
        assert_eq!(sessions["sessions"][0]["status"], "offline");
    }
}
