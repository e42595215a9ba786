use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::{Value, json};

use super::ExecutorState;
use crate::executor::protocol::{
    AckResponse, ExecuteRequest, ExecuteResponse, ReadRequest, ReadResponse, KeyRequest,
    StatusResponse, unescape_script,
};
use crate::store::StoreError;

pub fn router() -> Router<ExecutorState> {
    Router::new()
        .route("/status", get(status))
        .route("/code", post(execute_code))
        .route("/var", post(read_variable))
        .route("/rollback", post(rollback))
        .route("/release", post(release))
}

async fn status(State(state): State<ExecutorState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        que: state.store.status(),
    })
}

#[tracing::instrument(skip_all)]
async fn execute_code(
    State(state): State<ExecutorState>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, (StatusCode, Json<Value>)> {
    if !state.backend_ready {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Database connection not available" })),
        ));
    }

    let code = unescape_script(&body.code);
    tracing::info!(key = %body.id, "executing script");
    let response = match state.store.execute(&body.id, &code).await {
        Ok(output) => ExecuteResponse::Ok {
            ok: "code executed successfully".to_string(),
            output,
        },
        Err(StoreError::Script { message, trace }) => ExecuteResponse::Failed {
            error: message,
            trace,
            id: body.id,
        },
        Err(e) => ExecuteResponse::Failed {
            error: e.to_string(),
            trace: String::new(),
            id: body.id,
        },
    };
    Ok(Json(response))
}

async fn read_variable(State(state): State<ExecutorState>, Json(body): Json<ReadRequest>) -> Json<ReadResponse> {
    match state.store.read_variable(&body.id, &body.name).await {
        Ok(result) => Json(ReadResponse::Ok { result }),
        Err(e) => {
            tracing::debug!(key = %body.id, name = %body.name, error = %e, "variable read failed");
            Json(ReadResponse::Failed { error: e.to_string() })
        }
    }
}

async fn rollback(State(state): State<ExecutorState>, Json(body): Json<KeyRequest>) -> Json<AckResponse> {
    match state.store.rollback(&body.id).await {
        Ok(()) => Json(AckResponse::Ok {
            ok: "variables rolled back successfully".to_string(),
        }),
        Err(e) => Json(AckResponse::Failed { error: e.to_string() }),
    }
}

/// Drop a key's namespace and snapshot. The next script under the key
/// starts from a fresh namespace.
async fn release(State(state): State<ExecutorState>, Json(body): Json<KeyRequest>) -> Json<AckResponse> {
    if state.store.remove(&body.id).await {
        tracing::info!(key = %body.id, "namespace released");
        Json(AckResponse::Ok {
            ok: "variables released successfully".to_string(),
        })
    } else {
        Json(AckResponse::Failed {
            error: StoreError::NotFound.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::http::HttpExecutorClient;
    use crate::executor::{ExecutorError, ScriptExecutor};
    use crate::store::ExecutionStore;
    use crate::store::tests::FakeRuntime;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_host(backend_ready: bool) -> HttpExecutorClient {
        spawn_host_at(backend_ready).await.0
    }

    async fn spawn_host_at(backend_ready: bool) -> (HttpExecutorClient, String) {
        let state = ExecutorState {
            store: Arc::new(ExecutionStore::new(Arc::new(FakeRuntime))),
            backend_ready,
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::server::create_executor_app(state))
                .await
                .unwrap();
        });
        let base = format!("http://{addr}");
        (HttpExecutorClient::new(reqwest::Client::new(), base.clone()), base)
    }

    #[tokio::test]
    async fn run_read_and_rollback_over_http() {
        let client = spawn_host(true).await;

        client.run_script("space-1", "total=12").await.unwrap();
        client.run_script("space-1", "total=40").await.unwrap();
        let items = client.read_variable("space-1", "total").await.unwrap();
        assert_eq!(items[0].data, "40");

        client.rollback("space-1").await.unwrap();
        let items = client.read_variable("space-1", "total").await.unwrap();
        assert_eq!(items[0].data, "12");
        assert_eq!(client.status().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn backslashes_reach_the_runtime() {
        let client = spawn_host(true).await;
        client.run_script("s", r"path=C:\data").await.unwrap();
        let items = client.read_variable("s", "path").await.unwrap();
        assert_eq!(items[0].data, r"C:\data");
    }

    #[tokio::test]
    async fn failures_come_back_as_errors() {
        let client = spawn_host(true).await;

        let err = client.read_variable("nobody", "x").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Host(ref m) if m == "Id not found"));

        let err = client.rollback("nobody").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Host(ref m) if m == "Id not found"));

        let err = client.run_script("s", "fail").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Script { ref message, .. } if message == "boom"));
    }

    #[tokio::test]
    async fn release_forgets_the_namespace() {
        let (client, base) = spawn_host_at(true).await;
        client.run_script("space-9", "x=1").await.unwrap();

        let release = |id: &'static str| {
            let base = base.clone();
            async move {
                reqwest::Client::new()
                    .post(format!("{base}/release"))
                    .json(&KeyRequest { id: id.to_string() })
                    .send()
                    .await
                    .unwrap()
                    .json::<AckResponse>()
                    .await
                    .unwrap()
            }
        };

        assert!(matches!(release("space-9").await, AckResponse::Ok { .. }));
        let err = client.read_variable("space-9", "x").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Host(ref m) if m == "Id not found"));
        assert_eq!(
            release("space-9").await,
            AckResponse::Failed {
                error: "Id not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn code_is_refused_without_backend() {
        let client = spawn_host(false).await;
        let err = client.run_script("s", "x=1").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Connection));
        assert_eq!(err.to_string(), "HTTP connection error during code execution");
    }
}
