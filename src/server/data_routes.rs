use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Form, Json, Router};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::backend::tables::{PageRequest, TablePage};
use crate::backend::{BackendError, SqliteBackend};

/// Uploaded SQLite files are read fully into memory before import.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

type ApiError = (StatusCode, Json<Value>);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/get-table-list", get(get_table_list))
        .route("/refresh-schema", post(refresh_schema))
        .route("/table-data/{table_name}", get(table_data))
        .route("/delete-table/{table_name}", delete(delete_table))
        .route("/rename-table/{table_name}", put(rename_table))
        .route(
            "/upload-sqlite-db",
            post(upload_sqlite_db).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn backend_error(e: BackendError) -> ApiError {
    let status = match &e {
        BackendError::UnknownTable(_) => StatusCode::NOT_FOUND,
        BackendError::NameInUse(_)
        | BackendError::InvalidName(_)
        | BackendError::InvalidQuery(_)
        | BackendError::ReadOnly => StatusCode::BAD_REQUEST,
        BackendError::Sqlite(_) | BackendError::Poisoned => {
            tracing::error!(error = %e, "table operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, e.to_string())
}

fn require_backend(state: &AppState) -> Result<Arc<SqliteBackend>, ApiError> {
    state
        .backend
        .clone()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "database not configured"))
}

/// Run a backend call on the blocking pool, then rebuild the schema catalog
/// when `refresh` is set.
async fn on_backend<T, F>(state: &AppState, refresh: bool, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteBackend) -> Result<T, BackendError> + Send + 'static,
{
    let backend = require_backend(state)?;
    let schema = Arc::clone(&state.schema);
    tokio::task::spawn_blocking(move || {
        let out = f(&backend)?;
        if refresh {
            schema.refresh(&backend)?;
        }
        Ok(out)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(backend_error)
}

fn table_list(state: &AppState, message: &str) -> Json<Value> {
    let table_names = state.schema.table_names();
    Json(json!({
        "table_count": table_names.len(),
        "table_names": table_names,
        "message": message,
    }))
}

async fn get_table_list(State(state): State<AppState>) -> Json<Value> {
    table_list(&state, "Table list retrieved")
}

async fn refresh_schema(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    on_backend(&state, true, |_| Ok(())).await?;
    Ok(table_list(&state, "Schema refreshed"))
}

async fn table_data(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
    Query(page): Query<PageRequest>,
) -> Result<Json<TablePage>, ApiError> {
    let page = on_backend(&state, false, move |b| b.table_page(&table_name, &page)).await?;
    Ok(Json(page))
}

#[tracing::instrument(skip_all)]
async fn delete_table(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!(table = %table_name, "deleting table");
    let requested = table_name.clone();
    on_backend(&state, true, move |b| b.delete_table(&table_name)).await?;
    Ok(Json(json!({
        "message": format!("Table '{requested}' deleted successfully."),
    })))
}

#[derive(Deserialize)]
struct RenameForm {
    new_table_name: String,
}

#[tracing::instrument(skip_all)]
async fn rename_table(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
    Form(form): Form<RenameForm>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!(table = %table_name, to = %form.new_table_name, "renaming table");
    let message = format!(
        "Table '{table_name}' has been renamed to '{}'.",
        form.new_table_name
    );
    let new_name = on_backend(&state, true, move |b| b.rename_table(&table_name, &form.new_table_name)).await?;
    Ok(Json(json!({
        "message": message,
        "table_count": 1,
        "table_names": [new_name],
    })))
}

/// The request body is the raw SQLite file.
#[tracing::instrument(skip_all)]
async fn upload_sqlite_db(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    require_backend(&state)?;
    let path = std::env::temp_dir().join(format!("table-analyst-upload-{}.db", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Unexpected error: {e}")))?;
    tracing::info!(bytes = body.len(), "importing uploaded database");

    let source = path.clone();
    let imported = on_backend(&state, true, move |b| b.import_sqlite(&source)).await;
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove upload");
    }

    let table_names = imported.map_err(|(_, Json(payload))| {
        let detail = payload["error"].as_str().unwrap_or_default().to_string();
        api_error(StatusCode::BAD_REQUEST, format!("SQLite file processing error: {detail}"))
    })?;
    if table_names.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "No readable tables found. The SQLite file may be empty or contain no tables.",
        ));
    }

    Ok(Json(json!({
        "table_count": table_names.len(),
        "message": format!(
            "SQLite file uploaded and {} table(s) copied into the database",
            table_names.len()
        ),
        "table_names": table_names,
    })))
}
