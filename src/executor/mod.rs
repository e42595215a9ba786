pub mod http;
pub mod local;
pub mod protocol;

use async_trait::async_trait;

use protocol::VariableItem;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The script ran and raised.
    #[error("{message}")]
    Script { message: String, trace: String },

    /// The host answered with an error (unknown key, still running, ...).
    #[error("{0}")]
    Host(String),

    #[error("HTTP connection error during code execution")]
    Connection,

    #[error("Request timed out error during code execution")]
    Timeout,

    #[error("An unexpected error during code execution: {0}")]
    Unexpected(String),
}

impl From<reqwest::Error> for ExecutorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExecutorError::Timeout
        } else if e.is_connect() {
            ExecutorError::Connection
        } else {
            ExecutorError::Unexpected(e.to_string())
        }
    }
}

/// Where analysis scripts run. Keys are analysis spaces, so scripts from
/// successive analyses in one space share a namespace.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn run_script(&self, key: &str, script: &str) -> Result<(), ExecutorError>;
    async fn read_variable(&self, key: &str, name: &str) -> Result<Vec<VariableItem>, ExecutorError>;
    async fn rollback(&self, key: &str) -> Result<(), ExecutorError>;
}
