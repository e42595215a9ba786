use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::AnalysisError;
use super::session::{AnalysisSession, HistoryTurn, ReportView, StartAnalysisRequest};

#[derive(Debug, Default)]
struct Space {
    analysis_ids: Vec<String>,
    history: Vec<HistoryTurn>,
}

struct SessionEntry {
    session: AnalysisSession,
    task: Option<JoinHandle<()>>,
}

/// Spaces and the analyses started in them.
#[derive(Default)]
pub struct AnalysisRegistry {
    spaces: RwLock<HashMap<String, Space>>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_space(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.spaces.write().await.insert(id.clone(), Space::default());
        tracing::info!(space_id = %id, "space created");
        id
    }

    /// Analysis ids of a space in order. Unknown spaces are empty.
    pub async fn space_analyses(&self, space_id: &str) -> Vec<String> {
        self.spaces
            .read()
            .await
            .get(space_id)
            .map(|s| s.analysis_ids.clone())
            .unwrap_or_default()
    }

    pub async fn history(&self, space_id: &str) -> Vec<HistoryTurn> {
        self.spaces
            .read()
            .await
            .get(space_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub async fn append_turn(&self, space_id: &str, turn: HistoryTurn) {
        if let Some(space) = self.spaces.write().await.get_mut(space_id) {
            space.history.push(turn);
        }
    }

    /// Register a new analysis in its space, truncating the space back to
    /// `request.index` first unless it is -1. Nothing changes on error.
    pub async fn open_analysis(&self, request: &StartAnalysisRequest) -> Result<String, AnalysisError> {
        let id = Uuid::new_v4().to_string();
        {
            let mut spaces = self.spaces.write().await;
            let space = spaces
                .get_mut(&request.space_id)
                .ok_or_else(|| AnalysisError::validation("Space not found"))?;

            if request.index != -1 {
                let index = usize::try_from(request.index)
                    .ok()
                    .filter(|i| *i < space.history.len())
                    .ok_or_else(|| AnalysisError::validation("Invalid history index"))?;
                space.history.truncate(index);
                space.analysis_ids.truncate(index);
                tracing::info!(space_id = %request.space_id, index, "space reverted");
            }
            space.analysis_ids.push(id.clone());
        }

        self.sessions.write().await.insert(
            id.clone(),
            SessionEntry {
                session: AnalysisSession::new(id.clone(), request),
                task: None,
            },
        );
        Ok(id)
    }

    /// Apply `update` to a session. Returns false when the id is unknown.
    pub async fn update<F>(&self, id: &str, update: F) -> bool
    where
        F: FnOnce(&mut AnalysisSession),
    {
        match self.sessions.write().await.get_mut(id) {
            Some(entry) => {
                update(&mut entry.session);
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self, id: &str) -> Option<AnalysisSession> {
        self.sessions.read().await.get(id).map(|e| e.session.clone())
    }

    pub async fn report(&self, id: &str) -> ReportView {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|e| e.session.view())
            .unwrap_or_else(ReportView::not_found)
    }

    pub async fn attach_task(&self, id: &str, task: JoinHandle<()>) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.task = Some(task);
        }
    }

    pub async fn take_task(&self, id: &str) -> Option<JoinHandle<()>> {
        self.sessions.write().await.get_mut(id).and_then(|e| e.task.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(space_id: &str, index: i64) -> StartAnalysisRequest {
        serde_json::from_value(json!({"space_id": space_id, "query": "revenue by month", "index": index}))
            .unwrap()
    }

    async fn space_with_turns(registry: &AnalysisRegistry, turns: usize) -> (String, Vec<String>) {
        let space = registry.create_space().await;
        let mut ids = Vec::new();
        for n in 0..turns {
            ids.push(registry.open_analysis(&request(&space, -1)).await.unwrap());
            registry
                .append_turn(
                    &space,
                    HistoryTurn {
                        query: format!("q{n}"),
                        response: format!("r{n}"),
                    },
                )
                .await;
        }
        (space, ids)
    }

    #[tokio::test]
    async fn append_without_truncation() {
        let registry = AnalysisRegistry::new();
        let (space, ids) = space_with_turns(&registry, 2).await;
        let id = registry.open_analysis(&request(&space, -1)).await.unwrap();
        let listed = registry.space_analyses(&space).await;
        assert_eq!(listed, vec![ids[0].clone(), ids[1].clone(), id]);
        assert_eq!(registry.history(&space).await.len(), 2);
    }

    #[tokio::test]
    async fn revert_truncates_ids_and_history() {
        let registry = AnalysisRegistry::new();
        let (space, ids) = space_with_turns(&registry, 3).await;
        let id = registry.open_analysis(&request(&space, 1)).await.unwrap();
        assert_eq!(registry.space_analyses(&space).await, vec![ids[0].clone(), id]);
        let history = registry.history(&space).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query, "q0");
    }

    #[tokio::test]
    async fn out_of_range_index_changes_nothing() {
        let registry = AnalysisRegistry::new();
        let (space, ids) = space_with_turns(&registry, 2).await;
        for bad in [2, 7, -2] {
            let err = registry.open_analysis(&request(&space, bad)).await.unwrap_err();
            assert_eq!(err.to_string(), "Invalid history index");
        }
        assert_eq!(registry.space_analyses(&space).await, ids);
        assert_eq!(registry.history(&space).await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_space_is_rejected() {
        let registry = AnalysisRegistry::new();
        assert!(registry.open_analysis(&request("nope", -1)).await.is_err());
        assert!(registry.space_analyses("nope").await.is_empty());
    }

    #[tokio::test]
    async fn updates_are_visible_in_reports() {
        let registry = AnalysisRegistry::new();
        let space = registry.create_space().await;
        let id = registry.open_analysis(&request(&space, -1)).await.unwrap();
        assert!(registry.update(&id, |s| s.progress = "Thinking...".into()).await);
        assert!(!registry.update("missing", |s| s.done = true).await);
        let view = registry.report(&id).await;
        assert_eq!(view.progress, "Thinking...");
        assert_eq!(view.query, "revenue by month");
        assert_eq!(registry.report("missing").await, ReportView::not_found());
    }

    #[tokio::test]
    async fn task_handle_is_taken_once() {
        let registry = AnalysisRegistry::new();
        let space = registry.create_space().await;
        let id = registry.open_analysis(&request(&space, -1)).await.unwrap();
        registry.attach_task(&id, tokio::spawn(async {})).await;
        let handle = registry.take_task(&id).await.unwrap();
        handle.await.unwrap();
        assert!(registry.take_task(&id).await.is_none());
    }
}
