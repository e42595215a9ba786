use crate::executor::ExecutorError;
use crate::llm::LlmError;

/// Failures of one analysis. Everything except `Validation` ends a running
/// session with `done = true` and the message in its error field.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("{0}")]
    Validation(String),

    #[error("No response from model")]
    EmptyResponse,

    #[error("Script execution timed out")]
    ExecutionTimeout,

    #[error("No response from model during recovery")]
    EmptyRecovery,

    #[error("No corrected script in recovery response")]
    MissingCorrectedScript,

    #[error("Script execution failed after retry: {0}")]
    SecondExecution(String),

    #[error("Variable retrieval error for {name}: {message}")]
    VariableResolution { name: String, message: String },

    #[error(transparent)]
    Model(#[from] LlmError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl AnalysisError {
    pub fn validation(message: impl Into<String>) -> Self {
        AnalysisError::Validation(message.into())
    }

    /// Text stored in the session's error field.
    pub fn session_message(&self) -> String {
        match self {
            AnalysisError::Model(_) | AnalysisError::Executor(_) => format!("Error: {self}"),
            other => other.to_string(),
        }
    }
}
