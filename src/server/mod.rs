pub mod analysis_routes;
pub mod data_routes;
pub mod executor_routes;
pub mod middleware;
pub mod routes;

use axum::Router;
use std::sync::Arc;

use crate::analysis::AnalysisService;
use crate::backend::SqliteBackend;
use crate::backend::schema::SchemaCatalog;
use crate::llm::catalog::ModelCatalog;
use crate::store::ExecutionStore;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AnalysisService>,
    pub models: Arc<ModelCatalog>,
    pub schema: Arc<SchemaCatalog>,
    pub backend: Option<Arc<SqliteBackend>>,
    pub http_client: Arc<reqwest::Client>,
}

#[derive(Clone)]
pub struct ExecutorState {
    pub store: Arc<ExecutionStore>,
    /// Scripts are refused while no data backend is attached.
    pub backend_ready: bool,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub fn create_executor_app(state: ExecutorState) -> Router {
    routes::build_executor_router(state)
}
