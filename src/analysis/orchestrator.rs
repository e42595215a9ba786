use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;

use super::audit::ReportAuditor;
use super::error::AnalysisError;
use super::parser::{
    ParserEvent, REPORT_CLOSE, ResponseStreamParser, SCRIPT_CLOSE, SCRIPT_OPEN, extract_script,
    splice_script,
};
use super::registry::AnalysisRegistry;
use super::render::{ContentRenderer, RenderMode};
use super::session::{AnalysisMode, ContentItem, HistoryTurn, Phase, StartAnalysisRequest};
use crate::backend::schema::SchemaCatalog;
use crate::executor::{ExecutorError, ScriptExecutor};
use crate::llm::catalog::{ModelCatalog, ModelEntry};
use crate::llm::ChatMessage;
use crate::prompts::PromptSet;

pub const MIN_QUERY_CHARS: usize = 5;

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// How long to wait for a dispatched script once the stream has ended.
    pub join_timeout: Duration,
    pub temperature: f32,
    pub render_mode: RenderMode,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            temperature: 0.2,
            render_mode: RenderMode::Tolerant,
        }
    }
}

pub fn recovery_message(error: &str) -> String {
    format!(
        "The following error occurred.\n{error}\n\nReturn the corrected script wrapped in {SCRIPT_OPEN}{SCRIPT_CLOSE} tags."
    )
}

type PendingRun = JoinHandle<Result<(), ExecutorError>>;

/// Drives analyses from request to rendered report.
pub struct AnalysisService {
    registry: Arc<AnalysisRegistry>,
    models: Arc<ModelCatalog>,
    schema: Arc<SchemaCatalog>,
    executor: Arc<dyn ScriptExecutor>,
    prompts: PromptSet,
    auditor: ReportAuditor,
    settings: AnalysisSettings,
}

impl AnalysisService {
    pub fn new(
        registry: Arc<AnalysisRegistry>,
        models: Arc<ModelCatalog>,
        schema: Arc<SchemaCatalog>,
        executor: Arc<dyn ScriptExecutor>,
        prompts: PromptSet,
        auditor: ReportAuditor,
    ) -> Self {
        Self {
            registry,
            models,
            schema,
            executor,
            prompts,
            auditor,
            settings: AnalysisSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: AnalysisSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<AnalysisRegistry> {
        &self.registry
    }

    /// Validate and register the analysis, then run it in the background.
    #[tracing::instrument(skip_all, fields(space_id = %request.space_id, model = %request.model))]
    pub async fn start_analysis(self: &Arc<Self>, request: StartAnalysisRequest) -> Result<String, AnalysisError> {
        if !self.schema.is_registered() {
            return Err(AnalysisError::validation("Database not registered"));
        }
        if request.query.trim().chars().count() <= MIN_QUERY_CHARS {
            return Err(AnalysisError::validation("Query is too short"));
        }
        let id = self.registry.open_analysis(&request).await?;

        let service = Arc::clone(self);
        let analysis_id = id.clone();
        let task = tokio::spawn(async move { service.run(analysis_id, request).await });
        self.registry.attach_task(&id, task).await;

        tracing::info!(analysis_id = %id, "analysis started");
        Ok(id)
    }

    /// Wait for the background task of an analysis, if it is still held.
    pub async fn wait_for(&self, id: &str) {
        if let Some(task) = self.registry.take_task(id).await {
            if let Err(e) = task.await {
                tracing::error!(analysis_id = %id, error = %e, "analysis task panicked");
            }
        }
    }

    async fn run(self: Arc<Self>, id: String, request: StartAnalysisRequest) {
        let outcome = self.drive(&id, &request).await;
        if let Err(e) = &outcome {
            tracing::warn!(analysis_id = %id, error = %e, "analysis failed");
            let message = e.session_message();
            self.registry.update(&id, |s| s.fail(message)).await;
        }
        if let Some(session) = self.registry.snapshot(&id).await {
            tracing::info!(
                analysis_id = %id,
                mode = ?session.mode,
                elapsed_ms = session.elapsed_ms().unwrap_or_default(),
                failed = outcome.is_err(),
                "analysis finished"
            );
        }
    }

    // Scripts run under the space id, so concurrent analyses in one space
    // share a namespace and are not serialized against each other.
    async fn drive(&self, id: &str, request: &StartAnalysisRequest) -> Result<(), AnalysisError> {
        self.set_progress(id, Phase::Streaming, "Thinking...").await;

        let model = self.models.resolve(&request.model)?;
        match request.mode {
            AnalysisMode::Standard => {
                tracing::info!(analysis_id = %id, model = %model.model_name, base_url = %model.base_url, "standard analysis")
            }
            AnalysisMode::Agentic => {
                tracing::info!(analysis_id = %id, model = %model.model_name, base_url = %model.base_url, "agentic analysis")
            }
        }

        let mut messages = vec![ChatMessage::system(
            self.prompts
                .system_prompt(&model.model_name, &self.schema.describe(&request.tables)),
        )];
        for turn in self.registry.history(&request.space_id).await {
            messages.extend(turn.messages());
        }
        messages.push(ChatMessage::user(request.query.clone()));

        let (full, pending) = self.stream_response(id, request, &model, messages.clone()).await?;

        let outcome = match pending {
            Some(handle) => match tokio::time::timeout(self.settings.join_timeout, handle).await {
                Err(_) => return Err(AnalysisError::ExecutionTimeout),
                Ok(Err(join)) => Err(ExecutorError::Unexpected(join.to_string())),
                Ok(Ok(result)) => result,
            },
            None => Ok(()),
        };

        if full.is_empty() {
            return Err(AnalysisError::EmptyResponse);
        }

        let (mut full, recovered) = match outcome {
            Ok(()) => (full, false),
            Err(e) => {
                tracing::warn!(analysis_id = %id, error = %e, "script failed, asking model for a fix");
                let fixed = self.recover(id, request, &model, messages, full, &e).await?;
                (fixed, true)
            }
        };

        if !full.contains(REPORT_CLOSE) {
            full.push_str("\n</report>");
        }

        self.set_progress(id, Phase::Rendering, "Generating report...").await;
        let content = ContentRenderer::new(self.executor.as_ref(), self.settings.render_mode)
            .render(&request.space_id, &full)
            .await?;

        let response = full.clone();
        self.registry
            .update(id, |s| {
                s.full_response = response;
                s.content = content;
                s.finish();
            })
            .await;
        self.registry
            .append_turn(
                &request.space_id,
                HistoryTurn {
                    query: request.query.clone(),
                    response: full.clone(),
                },
            )
            .await;

        if let Err(e) = self
            .auditor
            .record(&model.model_name, &request.query, &full, recovered)
            .await
        {
            tracing::warn!(analysis_id = %id, error = %e, "report export failed");
        }
        tracing::info!(analysis_id = %id, recovered, "analysis finished");
        Ok(())
    }

    /// Consume the model stream, dispatching the script as soon as it is
    /// complete. Returns the full text and the still-running execution.
    async fn stream_response(
        &self,
        id: &str,
        request: &StartAnalysisRequest,
        model: &ModelEntry,
        messages: Vec<ChatMessage>,
    ) -> Result<(String, Option<PendingRun>), AnalysisError> {
        let mut stream = model
            .client
            .stream_chat(&model.model_name, messages, self.settings.temperature)
            .await?;
        let mut parser = ResponseStreamParser::new();
        let mut pending = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let mut progress = None;
            let mut script = None;
            for event in parser.push(&chunk) {
                match event {
                    ParserEvent::Progress(text) => progress = Some(text),
                    ParserEvent::ScriptReady(code) => {
                        tracing::debug!(analysis_id = %id, "dispatching script");
                        let executor = Arc::clone(&self.executor);
                        let key = request.space_id.clone();
                        let dispatched = code.clone();
                        pending = Some(tokio::spawn(async move {
                            executor.run_script(&key, &dispatched).await
                        }));
                        script = Some(code);
                    }
                    ParserEvent::ReportOpened => {
                        tracing::debug!(analysis_id = %id, "report opened");
                    }
                }
            }
            let provisional = parser.provisional_report();
            self.registry
                .update(id, |s| {
                    if let Some(code) = script {
                        s.script = code;
                        s.phase = Phase::ScriptExecuting;
                    }
                    if let Some(text) = progress {
                        s.progress = text;
                    }
                    if let Some(report) = provisional {
                        s.content = vec![ContentItem::markdown(report)];
                    }
                })
                .await;
        }

        Ok((parser.into_buffer(), pending))
    }

    /// One corrective round trip: ask for a fixed script, splice it into
    /// the response and run it synchronously.
    async fn recover(
        &self,
        id: &str,
        request: &StartAnalysisRequest,
        model: &ModelEntry,
        mut messages: Vec<ChatMessage>,
        full: String,
        error: &ExecutorError,
    ) -> Result<String, AnalysisError> {
        self.set_progress(id, Phase::Recovering, "Fixing script execution error...")
            .await;

        messages.push(ChatMessage::assistant(full.clone()));
        messages.push(ChatMessage::user(recovery_message(&error.to_string())));

        let reply = model
            .client
            .complete(&model.model_name, messages, self.settings.temperature)
            .await?
            .ok_or(AnalysisError::EmptyRecovery)?;
        if !reply.contains(SCRIPT_OPEN) || !reply.contains(SCRIPT_CLOSE) {
            return Err(AnalysisError::MissingCorrectedScript);
        }
        let script = extract_script(&reply).ok_or(AnalysisError::MissingCorrectedScript)?;

        let code = script.clone();
        self.registry.update(id, |s| s.script = code).await;
        let full = splice_script(&full, &script);

        self.executor
            .run_script(&request.space_id, &script)
            .await
            .map_err(|e| AnalysisError::SecondExecution(e.to_string()))?;
        tracing::info!(analysis_id = %id, "corrected script succeeded");
        Ok(full)
    }

    async fn set_progress(&self, id: &str, phase: Phase, progress: &str) {
        self.registry
            .update(id, |s| {
                s.phase = phase;
                s.progress = progress.to_string();
            })
            .await;
    }
}
