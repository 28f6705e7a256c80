use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowgateError {
    // Registry errors
    #[error("Node type not found: {0}")]
    NodeNotFound(String),

    #[error("Handler construction failed: {node_type}: {message}")]
    HandlerInit { node_type: String, message: String },

    // Execution errors
    #[error("Handler execution failed: {node_type}: {message}")]
    HandlerExecution { node_type: String, message: String },

    #[error("Handler timeout after {timeout_secs}s: {node_type}")]
    HandlerTimeout { node_type: String, timeout_secs: u64 },

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    // Graph errors
    #[error("Invalid workflow graph: {0}")]
    InvalidGraph(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Backing store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store contention on key: {0}")]
    Contention(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowgateError>;
