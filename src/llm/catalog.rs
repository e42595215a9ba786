use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::openai::OpenAiCompatClient;
use super::{ChatModel, LlmError};

/// Listed when the model server cannot be reached or reports nothing.
pub const NO_MODELS: &str = "no models available";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct ModelEntry {
    pub id: String,
    pub model_name: String,
    pub display_name: String,
    pub description: String,
    pub base_url: String,
    pub client: Arc<dyn ChatModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    data: Vec<ModelListEntry>,
}

#[derive(Deserialize)]
struct ModelListEntry {
    id: String,
}

/// Strip any `/v1` segments and append exactly one.
pub fn normalize_base_url(base_url: &str) -> String {
    let stripped = base_url.replace("/v1/", "").replace("/v1", "");
    format!("{}/v1", stripped.trim_end_matches('/'))
}

/// Models that analyses can be started with, rebuilt on each discovery.
#[derive(Default)]
pub struct ModelCatalog {
    entries: RwLock<Vec<ModelEntry>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: ModelEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|e| e.id != entry.id);
            entries.push(entry);
        }
    }

    pub fn resolve(&self, id: &str) -> Result<ModelEntry, LlmError> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.iter().find(|e| e.id == id).cloned())
            .ok_or_else(|| LlmError::UnknownModel(id.to_string()))
    }

    pub fn summaries(&self) -> Vec<ModelSummary> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| ModelSummary {
                        id: e.id.clone(),
                        name: if e.display_name.is_empty() {
                            e.model_name.clone()
                        } else {
                            e.display_name.clone()
                        },
                        description: e.description.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ask the server at `base_url` for its models and replace the catalog
    /// with them. Unreachable servers yield a single placeholder entry.
    pub async fn discover(&self, http: &Client, base_url: &str, api_key: &str) -> Vec<ModelSummary> {
        let base_url = normalize_base_url(base_url);
        let names = match fetch_model_names(http, &base_url, api_key).await {
            Ok(names) if !names.is_empty() => {
                tracing::info!(base_url = %base_url, count = names.len(), "discovered models");
                names
            }
            Ok(_) => {
                tracing::warn!(base_url = %base_url, "model server reported no models");
                vec![NO_MODELS.to_string()]
            }
            Err(e) => {
                tracing::warn!(base_url = %base_url, error = %e, "model discovery failed");
                vec![NO_MODELS.to_string()]
            }
        };

        let api_key = if api_key.is_empty() { "none" } else { api_key };
        let client: Arc<dyn ChatModel> = Arc::new(OpenAiCompatClient::new(http.clone(), &base_url, api_key));
        let fresh: Vec<ModelEntry> = names
            .into_iter()
            .map(|name| ModelEntry {
                id: name.clone(),
                model_name: name.clone(),
                display_name: name,
                description: String::new(),
                base_url: base_url.clone(),
                client: client.clone(),
            })
            .collect();

        if let Ok(mut entries) = self.entries.write() {
            *entries = fresh;
        }
        self.summaries()
    }
}

async fn fetch_model_names(http: &Client, base_url: &str, api_key: &str) -> Result<Vec<String>, LlmError> {
    let resp = http
        .get(format!("{base_url}/models"))
        .bearer_auth(api_key)
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status: status.as_u16(),
            body,
        });
    }

    let list: ModelListResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Malformed(e.to_string()))?;
    Ok(list.data.into_iter().map(|m| m.id).collect())
}
