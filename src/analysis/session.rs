use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::llm::ChatMessage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Standard,
    Agentic,
}

/// Where an analysis currently is. Only `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Streaming,
    ScriptExecuting,
    Recovering,
    Rendering,
    Done,
    Failed,
}

/// One typed block of a rendered report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Markdown { content: String },
    Table { table: String },
    Image { base64: String },
    Variable { data: String },
}

impl ContentItem {
    pub fn markdown(content: impl Into<String>) -> Self {
        ContentItem::Markdown {
            content: content.into(),
        }
    }
}

/// A completed exchange replayed into later model calls of the same space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub query: String,
    pub response: String,
}

impl HistoryTurn {
    pub fn messages(&self) -> [ChatMessage; 2] {
        [
            ChatMessage::user(self.query.clone()),
            ChatMessage::assistant(self.response.clone()),
        ]
    }
}

fn default_index() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartAnalysisRequest {
    pub space_id: String,
    pub query: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default)]
    pub model: String,
    /// Revert point in the space's history; -1 appends.
    #[serde(default = "default_index")]
    pub index: i64,
}

#[derive(Debug, Clone)]
pub struct AnalysisSession {
    pub id: String,
    pub space_id: String,
    pub query: String,
    pub tables: Vec<String>,
    pub mode: AnalysisMode,
    pub model: String,
    pub phase: Phase,
    pub done: bool,
    pub progress: String,
    pub error: String,
    pub script: String,
    pub content: Vec<ContentItem>,
    pub steps: Vec<Json>,
    pub full_response: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisSession {
    pub fn new(id: String, request: &StartAnalysisRequest) -> Self {
        Self {
            id,
            space_id: request.space_id.clone(),
            query: request.query.clone(),
            tables: request.tables.clone(),
            mode: request.mode,
            model: request.model.clone(),
            phase: Phase::Started,
            done: false,
            progress: "Analysis in progress...".to_string(),
            error: String::new(),
            script: String::new(),
            content: Vec::new(),
            steps: Vec::new(),
            full_response: String::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.done = true;
        self.progress.clear();
        self.phase = Phase::Done;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: String) {
        self.error = message;
        self.finish();
        self.phase = Phase::Failed;
    }

    /// Milliseconds from creation to the terminal state, once there.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.created_at).num_milliseconds())
    }

    pub fn view(&self) -> ReportView {
        ReportView {
            done: self.done,
            progress: self.progress.clone(),
            query: self.query.clone(),
            error: self.error.clone(),
            script: self.script.clone(),
            content: self.content.clone(),
            steps: self.steps.clone(),
        }
    }
}

/// What a poller sees of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportView {
    pub done: bool,
    pub progress: String,
    pub query: String,
    pub error: String,
    pub script: String,
    pub content: Vec<ContentItem>,
    pub steps: Vec<Json>,
}

impl ReportView {
    pub fn not_found() -> Self {
        Self {
            done: true,
            progress: String::new(),
            query: String::new(),
            error: "Analysis ID not found".to_string(),
            script: String::new(),
            content: Vec::new(),
            steps: Vec::new(),
        }
    }
}
