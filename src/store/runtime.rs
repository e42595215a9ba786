use super::value::{Namespace, Value};

/// A script failure as reported back to the analysis side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    pub trace: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
        }
    }
}

/// Result of running a script against a namespace. The namespace holds
/// every binding made before a failure, so partial progress is kept.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub namespace: Namespace,
    pub output: Vec<String>,
    pub failure: Option<ScriptError>,
}

impl ExecOutput {
    pub fn failed(namespace: Namespace, failure: ScriptError) -> Self {
        Self {
            namespace,
            output: Vec::new(),
            failure: Some(failure),
        }
    }
}

/// The language that scripts are written in.
///
/// Calls are blocking; the store runs them on the blocking pool.
pub trait ScriptRuntime: Send + Sync {
    /// Bindings a brand-new namespace starts with.
    fn seed(&self) -> Namespace;

    fn execute(&self, namespace: Namespace, script: &str) -> ExecOutput;

    fn evaluate(&self, namespace: &Namespace, expression: &str) -> Result<Value, ScriptError>;

    /// Rewrite `name:.spec` into an expression producing formatted text.
    fn format_expression(&self, expression: &str) -> String {
        expression.to_string()
    }
}
