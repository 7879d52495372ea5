//! Error types for pa-bridge

use thiserror::Error;

/// pa-bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A required action field was missing or empty
    #[error("{action}: missing required field(s): {fields}")]
    Validation { action: String, fields: String },

    /// No live helper connection or the listener is down
    #[error("Private API helper is not running")]
    HelperNotRunning,

    /// Every connection refused the write
    #[error("Failed to write '{action}' to any helper connection")]
    Write { action: String },

    /// The helper reported an error for a transaction
    #[error("{0}")]
    Remote(String),

    /// No response arrived before the deadline
    #[error("Timed out waiting for '{action}' response")]
    Timeout { action: String },

    /// The transaction was dropped without a response
    #[error("Transaction {0} was dropped before it resolved")]
    TransactionDropped(String),

    #[error("Duplicate transaction id: {0}")]
    DuplicateTransaction(String),

    #[error("Attach mode error: {0}")]
    Mode(String),

    #[error("Core error: {0}")]
    Core(#[from] pa_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Build a validation error for an action
    pub fn validation(action: &str, fields: &[&str]) -> Self {
        BridgeError::Validation {
            action: action.to_string(),
            fields: fields.join(", "),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, BridgeError>;
