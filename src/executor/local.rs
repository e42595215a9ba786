use async_trait::async_trait;

use super::protocol::VariableItem;
use super::{ExecutorError, ScriptExecutor};
use crate::store::{ExecutionStore, StoreError};

impl From<StoreError> for ExecutorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Script { message, trace } => ExecutorError::Script { message, trace },
            StoreError::Join(msg) => ExecutorError::Unexpected(msg),
            other => ExecutorError::Host(other.to_string()),
        }
    }
}

/// Runs scripts in-process when no executor host is configured.
#[async_trait]
impl ScriptExecutor for ExecutionStore {
    async fn run_script(&self, key: &str, script: &str) -> Result<(), ExecutorError> {
        let output = self.execute(key, script).await?;
        for line in output {
            tracing::debug!(key = %key, "{line}");
        }
        Ok(())
    }

    async fn read_variable(&self, key: &str, name: &str) -> Result<Vec<VariableItem>, ExecutorError> {
        Ok(ExecutionStore::read_variable(self, key, name).await?)
    }

    async fn rollback(&self, key: &str) -> Result<(), ExecutorError> {
        Ok(ExecutionStore::rollback(self, key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::FakeRuntime;
    use std::sync::Arc;

    #[tokio::test]
    async fn store_errors_map_to_executor_errors() {
        let executor: Arc<dyn ScriptExecutor> = Arc::new(ExecutionStore::new(Arc::new(FakeRuntime)));

        let err = executor.read_variable("missing", "x").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Host(ref m) if m == "Id not found"));

        let err = executor.run_script("s", "a=1\nfail").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Script { ref message, .. } if message == "boom"));

        executor.rollback("s").await.unwrap();
        let items = executor.read_variable("s", "engine").await.unwrap();
        assert_eq!(items[0].data, "<engine>");
    }
}
