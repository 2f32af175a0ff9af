//! Structured error types for command responses.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,
    InvalidState,
    DependencyCycle,

    // Not found errors
    TaskNotFound,
    SessionNotFound,
    HelpRequestNotFound,

    // Conflict errors
    AlreadyClaimed,
    AlreadyExists,
    NotQueued,
    ClaimLimitExceeded,
    NotOwner,

    // Lease errors
    LeaseExpired,

    // Internal errors
    DatabaseError,
    InternalError,
    UnknownTool,
}

impl ErrorCode {
    /// Conflicts and expired leases are routine: retry later or pick other work.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::AlreadyClaimed
                | ErrorCode::NotQueued
                | ErrorCode::ClaimLimitExceeded
                | ErrorCode::NotOwner
                | ErrorCode::LeaseExpired
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ErrorCode::TaskNotFound | ErrorCode::SessionNotFound | ErrorCode::HelpRequestNotFound
        )
    }
}

/// Structured error for command responses.
#[derive(Debug, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, reason)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("Session not found: {}", session_id),
        )
    }

    pub fn help_not_found(request_id: &str) -> Self {
        Self::new(
            ErrorCode::HelpRequestNotFound,
            format!("Help request not found: {}", request_id),
        )
    }

    pub fn already_claimed(task_id: &str, owner: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyClaimed,
            format!("Task {} already locked by {}", task_id, owner),
        )
    }

    pub fn already_exists(what: &str, id: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyExists,
            format!("{} already exists: {}", what, id),
        )
    }

    pub fn not_queued(task_id: &str, status: &str) -> Self {
        Self::new(
            ErrorCode::NotQueued,
            format!("Task {} is not queued (status: {})", task_id, status),
        )
    }

    pub fn not_owner(task_id: &str, session_id: &str) -> Self {
        Self::new(
            ErrorCode::NotOwner,
            format!("Session {} does not own task {}", session_id, task_id),
        )
    }

    pub fn claim_limit(session_id: &str, limit: i64) -> Self {
        Self::new(
            ErrorCode::ClaimLimitExceeded,
            format!("Session {} has reached claim limit of {}", session_id, limit),
        )
    }

    pub fn lease_expired(task_id: &str, session_id: &str) -> Self {
        Self::new(
            ErrorCode::LeaseExpired,
            format!("Lock on {} held by {} has expired or was released", task_id, session_id),
        )
    }

    pub fn dependency_cycle(task_id: &str, through: &str) -> Self {
        Self::new(
            ErrorCode::DependencyCycle,
            format!(
                "Dependency {} -> {} would create a cycle",
                task_id, through
            ),
        )
        .with_field("depends_on")
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorCode::UnknownTool, format!("Unknown tool: {}", name))
    }
}

// Store functions return anyhow; typed failures ride inside it as ToolError.
impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ToolError>() {
            Ok(tool_err) => tool_err,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(sql_err) => ToolError::database(sql_err),
                Err(err) => ToolError::internal(err),
            },
        }
    }
}

impl From<rusqlite::Error> for ToolError {
    fn from(err: rusqlite::Error) -> Self {
        ToolError::database(err)
    }
}

/// Result type for command operations.
pub type ToolResult<T> = std::result::Result<T, ToolError>;
