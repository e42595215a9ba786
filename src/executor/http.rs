use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::protocol::{
    AckResponse, ExecuteRequest, ExecuteResponse, ReadRequest, ReadResponse, KeyRequest,
    StatusResponse, VariableItem, escape_script,
};
use super::{ExecutorError, ScriptExecutor};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a remote executor host.
pub struct HttpExecutorClient {
    client: Client,
    base_url: String,
}

impl HttpExecutorClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, ExecutorError>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(RPC_TIMEOUT)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, path, body = %body, "executor host rejected request");
            return Err(ExecutorError::Connection);
        }
        Ok(resp.json().await?)
    }

    pub async fn status(&self) -> Result<usize, ExecutorError> {
        let url = format!("{}/status", self.base_url);
        let resp: StatusResponse = self
            .client
            .get(&url)
            .timeout(RPC_TIMEOUT)
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.que)
    }
}

#[async_trait]
impl ScriptExecutor for HttpExecutorClient {
    async fn run_script(&self, key: &str, script: &str) -> Result<(), ExecutorError> {
        let request = ExecuteRequest {
            id: key.to_string(),
            code: escape_script(script),
        };
        match self.post::<_, ExecuteResponse>("/code", &request).await? {
            ExecuteResponse::Ok { .. } => Ok(()),
            ExecuteResponse::Failed { error, trace, .. } => Err(ExecutorError::Script {
                message: error,
                trace,
            }),
        }
    }

    async fn read_variable(&self, key: &str, name: &str) -> Result<Vec<VariableItem>, ExecutorError> {
        let request = ReadRequest {
            id: key.to_string(),
            name: name.to_string(),
        };
        match self.post::<_, ReadResponse>("/var", &request).await? {
            ReadResponse::Ok { result } => Ok(result),
            ReadResponse::Failed { error } => Err(ExecutorError::Host(error)),
        }
    }

    async fn rollback(&self, key: &str) -> Result<(), ExecutorError> {
        let request = KeyRequest { id: key.to_string() };
        match self.post::<_, AckResponse>("/rollback", &request).await? {
            AckResponse::Ok { .. } => Ok(()),
            AckResponse::Failed { error } => Err(ExecutorError::Host(error)),
        }
    }
}
