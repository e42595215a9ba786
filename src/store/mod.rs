pub mod figure;
pub mod lua;
pub mod runtime;
pub mod value;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{RwLock, watch};

use crate::executor::protocol::VariableItem;
use runtime::{ExecOutput, ScriptRuntime};
use value::{Namespace, Value};

static ENGINE_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^engine[ \t]*=.*$").unwrap());

/// How long a read or rollback waits for a running execution to finish.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Id not found")]
    NotFound,

    #[error("Code is still running, please try again later")]
    StillRunning,

    #[error("{message}")]
    Script { message: String, trace: String },

    #[error("Error: {0}")]
    Evaluation(String),

    #[error("runtime task failed: {0}")]
    Join(String),
}

#[derive(Default)]
struct SlotState {
    namespace: Option<Namespace>,
    rollback: Option<Namespace>,
}

struct Slot {
    state: Mutex<SlotState>,
    running: watch::Sender<bool>,
}

impl Slot {
    fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            state: Mutex::new(SlotState::default()),
            running,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn wait_idle(&self, timeout: Duration) -> Result<(), StoreError> {
        let mut rx = self.running.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|running| !*running)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(StoreError::StillRunning),
        }
    }
}

/// Clears the running flag and the in-flight count on every exit path.
struct RunningGuard<'a> {
    slot: &'a Slot,
    in_flight: &'a AtomicUsize,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.slot.running.send_replace(false);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keyed script namespaces with one level of rollback.
///
/// Each key owns a namespace that persists across executions, a snapshot
/// taken before the most recent execution, and a running flag that reads
/// and rollbacks wait on.
pub struct ExecutionStore {
    runtime: Arc<dyn ScriptRuntime>,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    in_flight: AtomicUsize,
    wait_timeout: Duration,
}

impl ExecutionStore {
    pub fn new(runtime: Arc<dyn ScriptRuntime>) -> Self {
        Self {
            runtime,
            slots: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Number of executions currently in progress.
    pub fn status(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots.read().await.get(key).cloned()
    }

    async fn slot_or_create(&self, key: &str) -> Arc<Slot> {
        if let Some(slot) = self.slot(key).await {
            return slot;
        }
        self.slots
            .write()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Lines assigning the data connection are dropped; scripts always use
    /// the connection the namespace was seeded with.
    pub fn strip_engine_assignments(&self, script: &str) -> String {
        ENGINE_ASSIGNMENT.replace_all(script, "").into_owned()
    }

    /// Run a script in the key's namespace, creating it on first use.
    ///
    /// The pre-execution namespace becomes the rollback snapshot. Bindings
    /// made before a failure are kept.
    pub async fn execute(&self, key: &str, script: &str) -> Result<Vec<String>, StoreError> {
        let slot = self.slot_or_create(key).await;
        let script = self.strip_engine_assignments(script);

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        slot.running.send_replace(true);
        let _guard = RunningGuard {
            slot: &slot,
            in_flight: &self.in_flight,
        };

        let namespace = {
            let mut state = slot.lock();
            let current = state.namespace.clone().unwrap_or_else(|| self.runtime.seed());
            state.rollback = Some(current.clone());
            current
        };

        let runtime = self.runtime.clone();
        let joined = tokio::task::spawn_blocking(move || runtime.execute(namespace, &script)).await;

        let ExecOutput {
            namespace,
            output,
            failure,
        } = match joined {
            Ok(out) => out,
            Err(e) => {
                let mut state = slot.lock();
                state.namespace = state.rollback.clone();
                return Err(StoreError::Join(e.to_string()));
            }
        };

        slot.lock().namespace = Some(namespace);

        match failure {
            None => {
                tracing::debug!(key = %key, lines = output.len(), "script executed");
                Ok(output)
            }
            Some(failure) => {
                tracing::info!(key = %key, error = %failure.message, "script failed");
                Err(StoreError::Script {
                    message: failure.message,
                    trace: failure.trace,
                })
            }
        }
    }

    /// Evaluate a name or expression in the key's namespace.
    pub async fn read_variable(&self, key: &str, name: &str) -> Result<Vec<VariableItem>, StoreError> {
        let slot = self.slot(key).await.ok_or(StoreError::NotFound)?;
        slot.wait_idle(self.wait_timeout).await?;

        let namespace = slot.lock().namespace.clone().ok_or(StoreError::NotFound)?;
        let expression = if name.contains(":.") {
            self.runtime.format_expression(name)
        } else {
            name.to_string()
        };

        let runtime = self.runtime.clone();
        let evaluated = tokio::task::spawn_blocking(move || runtime.evaluate(&namespace, &expression))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?;

        match evaluated {
            Ok(value) => Ok(value.to_items()),
            Err(failure) => {
                if name.contains("error") || name.contains("log") {
                    return Ok(Value::Text(String::new()).to_items());
                }
                Err(StoreError::Evaluation(failure.message))
            }
        }
    }

    /// Restore the namespace captured before the most recent execution.
    /// The snapshot is kept, so repeating a rollback is a no-op.
    pub async fn rollback(&self, key: &str) -> Result<(), StoreError> {
        let slot = self.slot(key).await.ok_or(StoreError::NotFound)?;
        slot.wait_idle(self.wait_timeout).await?;

        let mut state = slot.lock();
        let snapshot = state.rollback.clone().ok_or(StoreError::NotFound)?;
        state.namespace = Some(snapshot);
        tracing::debug!(key = %key, "namespace rolled back");
        Ok(())
    }

    /// Forget a key's namespace and snapshot. False when the key is unknown.
    pub async fn remove(&self, key: &str) -> bool {
        self.slots.write().await.remove(key).is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::runtime::ScriptError;
    use super::*;

    /// Line-oriented runtime: `name=value` binds text, `fail` stops with an
    /// error, `sleep=<ms>` blocks.
    pub(crate) struct FakeRuntime;

    impl ScriptRuntime for FakeRuntime {
        fn seed(&self) -> Namespace {
            let mut ns = Namespace::new();
            ns.insert("engine".into(), Value::Backend);
            ns
        }

        fn execute(&self, mut namespace: Namespace, script: &str) -> ExecOutput {
            let mut output = Vec::new();
            for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if line == "fail" {
                    return ExecOutput {
                        namespace,
                        output,
                        failure: Some(ScriptError::new("boom", "trace: boom")),
                    };
                }
                if let Some(ms) = line.strip_prefix("sleep=") {
                    std::thread::sleep(Duration::from_millis(ms.parse().unwrap()));
                    continue;
                }
                if let Some((name, value)) = line.split_once('=') {
                    namespace.insert(name.into(), Value::Text(value.into()));
                    output.push(format!("set {name}"));
                }
            }
            ExecOutput {
                namespace,
                output,
                failure: None,
            }
        }

        fn evaluate(&self, namespace: &Namespace, expression: &str) -> Result<Value, ScriptError> {
            namespace
                .get(expression)
                .cloned()
                .ok_or_else(|| ScriptError::new(format!("name '{expression}' is not defined"), ""))
        }

        fn format_expression(&self, expression: &str) -> String {
            format!("fmt({expression})")
        }
    }

    fn store() -> ExecutionStore {
        ExecutionStore::new(Arc::new(FakeRuntime)).with_wait_timeout(Duration::from_millis(100))
    }

    fn texts(items: &[VariableItem]) -> Vec<&str> {
        items.iter().map(|i| i.data.as_str()).collect()
    }

    #[tokio::test]
    async fn first_execute_seeds_namespace() {
        let store = store();
        let out = store.execute("space-1", "a=1").await.unwrap();
        assert_eq!(out, vec!["set a"]);
        assert_eq!(texts(&store.read_variable("space-1", "a").await.unwrap()), vec!["1"]);
        assert_eq!(
            texts(&store.read_variable("space-1", "engine").await.unwrap()),
            vec!["<engine>"]
        );
    }

    #[tokio::test]
    async fn engine_assignments_are_stripped() {
        let store = store();
        let cleaned = store.strip_engine_assignments("engine = connect()\nx=1\n  local engine=2");
        assert_eq!(cleaned, "\nx=1\n  local engine=2");
        let nested = "function f()\n  local engine = 3\n  return engine\nend";
        assert_eq!(store.strip_engine_assignments(nested), nested);
        store.execute("k", "engine=overwritten").await.unwrap();
        assert_eq!(
            texts(&store.read_variable("k", "engine").await.unwrap()),
            vec!["<engine>"]
        );
    }

    #[tokio::test]
    async fn failure_keeps_partial_namespace() {
        let store = store();
        let err = store.execute("k", "a=1\nfail\nb=2").await.unwrap_err();
        assert!(matches!(err, StoreError::Script { ref message, .. } if message == "boom"));
        assert!(store.read_variable("k", "a").await.is_ok());
        assert!(matches!(
            store.read_variable("k", "b").await,
            Err(StoreError::Evaluation(_))
        ));
    }

    #[tokio::test]
    async fn rollback_restores_and_is_idempotent() {
        let store = store();
        store.execute("k", "a=1").await.unwrap();
        store.execute("k", "a=2\nb=3").await.unwrap();

        store.rollback("k").await.unwrap();
        assert_eq!(texts(&store.read_variable("k", "a").await.unwrap()), vec!["1"]);
        assert!(store.read_variable("k", "b").await.is_err());

        store.rollback("k").await.unwrap();
        assert_eq!(texts(&store.read_variable("k", "a").await.unwrap()), vec!["1"]);
    }

    #[tokio::test]
    async fn rollback_after_first_execution_restores_seed() {
        let store = store();
        store.execute("k", "a=1").await.unwrap();
        store.rollback("k").await.unwrap();
        assert!(store.read_variable("k", "a").await.is_err());
        assert!(store.read_variable("k", "engine").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let store = store();
        assert!(matches!(store.read_variable("nope", "a").await, Err(StoreError::NotFound)));
        assert!(matches!(store.rollback("nope").await, Err(StoreError::NotFound)));
        assert_eq!(StoreError::NotFound.to_string(), "Id not found");
    }

    #[tokio::test]
    async fn error_and_log_names_read_as_empty() {
        let store = store();
        store.execute("k", "a=1").await.unwrap();
        let items = store.read_variable("k", "error_message").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "string");
        assert_eq!(items[0].data, "");
        assert!(store.read_variable("k", "run_log").await.is_ok());
    }

    #[tokio::test]
    async fn fallback_names_are_case_sensitive() {
        let store = store();
        store.execute("k", "a=1").await.unwrap();
        for name in ["ErrorX", "ERROR_RATE", "Log"] {
            assert!(
                matches!(store.read_variable("k", name).await, Err(StoreError::Evaluation(_))),
                "{name} should not fall back"
            );
        }
    }

    #[tokio::test]
    async fn format_marker_goes_through_runtime() {
        let store = store();
        store.execute("k", "fmt(ratio:.2f)=0.46").await.unwrap();
        let items = store.read_variable("k", "ratio:.2f").await.unwrap();
        assert_eq!(texts(&items), vec!["0.46"]);
    }

    #[tokio::test]
    async fn read_during_execution_reports_still_running() {
        let store = Arc::new(store());
        store.execute("k", "a=1").await.unwrap();

        let runner = {
            let store = store.clone();
            tokio::spawn(async move { store.execute("k", "sleep=600\nb=2").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.status(), 1);
        assert!(matches!(
            store.read_variable("k", "a").await,
            Err(StoreError::StillRunning)
        ));
        assert!(matches!(store.rollback("k").await, Err(StoreError::StillRunning)));

        runner.await.unwrap().unwrap();
        assert_eq!(store.status(), 0);
        assert_eq!(texts(&store.read_variable("k", "b").await.unwrap()), vec!["2"]);
    }

    #[tokio::test]
    async fn read_waits_for_short_execution() {
        let store = Arc::new(
            ExecutionStore::new(Arc::new(FakeRuntime)).with_wait_timeout(Duration::from_secs(5)),
        );
        store.execute("k", "a=1").await.unwrap();
        let runner = {
            let store = store.clone();
            tokio::spawn(async move { store.execute("k", "sleep=150\na=2").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let items = store.read_variable("k", "a").await.unwrap();
        assert_eq!(texts(&items), vec!["2"]);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remove_forgets_key() {
        let store = store();
        store.execute("k", "a=1").await.unwrap();
        assert!(store.remove("k").await);
        assert!(!store.remove("k").await);
        assert!(matches!(store.read_variable("k", "a").await, Err(StoreError::NotFound)));
    }

    #[test]
    fn store_error_messages() {
        assert_eq!(
            StoreError::StillRunning.to_string(),
            "Code is still running, please try again later"
        );
        assert_eq!(StoreError::Evaluation("bad".into()).to_string(), "Error: bad");
    }
}
