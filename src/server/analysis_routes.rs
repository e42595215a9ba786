use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::analysis::{ReportView, StartAnalysisRequest};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start-analysis", post(start_analysis))
        .route("/get-report", get(get_report))
        .route("/create-space", post(create_space))
        .route("/get-space/{space_id}", get(get_space))
        .route("/get-model-list", get(get_model_list))
}

/// Validation failures are reported in the body with status 200.
#[tracing::instrument(skip_all)]
async fn start_analysis(State(state): State<AppState>, Json(body): Json<StartAnalysisRequest>) -> Json<Value> {
    match state.service.start_analysis(body).await {
        Ok(id) => Json(json!({ "id": id })),
        Err(e) => {
            tracing::info!(error = %e, "analysis rejected");
            Json(json!({ "error": e.to_string() }))
        }
    }
}

#[derive(Deserialize)]
struct ReportQuery {
    id: String,
}

async fn get_report(State(state): State<AppState>, Query(query): Query<ReportQuery>) -> Json<ReportView> {
    Json(state.service.registry().report(&query.id).await)
}

async fn create_space(State(state): State<AppState>) -> Json<Value> {
    let id = state.service.registry().create_space().await;
    Json(json!({ "id": id }))
}

async fn get_space(State(state): State<AppState>, Path(space_id): Path<String>) -> Json<Value> {
    let analysis_ids = state.service.registry().space_analyses(&space_id).await;
    Json(json!({ "analysis_ids": analysis_ids }))
}

#[derive(Deserialize)]
struct ModelListQuery {
    base_url: String,
    #[serde(default)]
    api_key: String,
}

#[tracing::instrument(skip_all)]
async fn get_model_list(State(state): State<AppState>, Query(query): Query<ModelListQuery>) -> Json<Value> {
    tracing::info!(base_url = %query.base_url, "listing models");
    let models = state
        .models
        .discover(&state.http_client, &query.base_url, &query.api_key)
        .await;
    Json(json!({ "models": models }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analysis::audit::ReportAuditor;
    use crate::analysis::{AnalysisRegistry, AnalysisService};
    use crate::backend::schema::SchemaCatalog;
    use crate::backend::tests::sample_backend;
    use crate::executor::protocol::VariableItem;
    use crate::executor::tests::FakeExecutor;
    use crate::llm::catalog::{ModelCatalog, ModelEntry};
    use crate::llm::tests::FakeModel;
    use crate::prompts::PromptSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    pub(crate) async fn spawn_app() -> String {
        let backend = Arc::new(sample_backend());
        let schema = Arc::new(SchemaCatalog::new());
        schema.refresh(&backend).unwrap();

        let models = Arc::new(ModelCatalog::new());
        models.register(ModelEntry {
            id: "m1".into(),
            model_name: "test-model".into(),
            display_name: String::new(),
            description: "scripted".into(),
            base_url: "http://localhost/v1".into(),
            client: Arc::new(FakeModel::new(&[
                "<script>n = 3</script>",
                "<report>Orders: {n}</report>",
            ])),
        });
        let executor = FakeExecutor::new().with_variable("n", vec![VariableItem::string("3".into())]);
        let service = AnalysisService::new(
            Arc::new(AnalysisRegistry::new()),
            models.clone(),
            schema.clone(),
            Arc::new(executor),
            PromptSet::new(Vec::new()),
            ReportAuditor::default(),
        );
        let state = AppState {
            service: Arc::new(service),
            models,
            schema,
            backend: Some(backend),
            http_client: Arc::new(reqwest::Client::new()),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::server::create_app(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn analysis_round_trip_over_http() {
        let base = spawn_app().await;
        let client = reqwest::Client::new();

        let space: Value = client
            .post(format!("{base}/api/create-space"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let space_id = space["id"].as_str().unwrap().to_string();

        let started: Value = client
            .post(format!("{base}/api/start-analysis"))
            .json(&json!({"space_id": space_id, "query": "How many orders are there?", "model": "m1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = started["id"].as_str().unwrap().to_string();

        let mut report = Value::Null;
        for _ in 0..50 {
            report = client
                .get(format!("{base}/api/get-report?id={id}"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if report["done"] == json!(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(report["error"], json!(""));
        assert_eq!(report["script"], json!("n = 3"));
        assert_eq!(
            report["content"],
            json!([
                {"type": "markdown", "content": "Orders:"},
                {"type": "variable", "data": "3"},
            ])
        );

        let listed: Value = client
            .get(format!("{base}/api/get-space/{space_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["analysis_ids"], json!([id]));
    }

    #[tokio::test]
    async fn rejections_are_reported_in_body() {
        let base = spawn_app().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/start-analysis"))
            .json(&json!({"space_id": "unknown", "query": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"error": "Query is too short"}));

        let report: Value = client
            .get(format!("{base}/api/get-report?id=missing"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["done"], json!(true));
        assert_eq!(report["error"], json!("Analysis ID not found"));

        let listed: Value = client
            .get(format!("{base}/api/get-space/nope"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed, json!({"analysis_ids": []}));
    }
}
