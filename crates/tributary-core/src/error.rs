// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tributary-core.

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the engine's stores, registry and API.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found in the state store.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Function was not found in the registry.
    #[error("Function '{function}' not found")]
    FunctionNotFound {
        /// Slug or ID of the function.
        function: String,
    },

    /// Pause was not found.
    #[error("Pause '{pause_id}' not found")]
    PauseNotFound {
        /// The pause ID that was not found.
        pause_id: String,
    },

    /// A compare-and-set update observed a newer version than expected.
    #[error("Run '{run_id}' was modified concurrently: expected version {expected}, found {actual}")]
    StateConflict {
        /// The run being updated.
        run_id: String,
        /// Version the caller read.
        expected: u64,
        /// Version in the store.
        actual: u64,
    },

    /// The requested status change is not allowed.
    #[error("Run '{run_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The run being updated.
        run_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A function definition failed validation.
    #[error("Invalid function '{function}': {message}")]
    InvalidFunction {
        /// Slug of the function.
        function: String,
        /// What is wrong with it.
        message: String,
    },

    /// Input validation failed.
    #[error("Validation failed for {field}: {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Queue operation failed.
    #[error("Queue error during {operation}: {details}")]
    QueueError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    #[error("Database error during {operation}: {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Self::PauseNotFound { .. } => "PAUSE_NOT_FOUND",
            Self::StateConflict { .. } => "STATE_CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidFunction { .. } => "INVALID_FUNCTION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::QueueError { .. } => "QUEUE_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a [`CoreError::DatabaseError`].
    pub fn database(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StateConflict { .. } | Self::QueueError { .. } | Self::DatabaseError { .. }
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::database("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::database("migrate", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::database("serialize", err)
    }
}
