//! Error types for the trading agent runtime

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Turn Pipeline Errors
    // =============================

    #[error("Upstream model error: {0}")]
    UpstreamModel(String),

    #[error("Turn cancelled by caller")]
    TurnCancelled,

    #[error("Tool task failed: {0}")]
    ToolTask(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
