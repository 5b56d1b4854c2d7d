use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{ActionAdapter, ConnectionState};
use crate::alias::AliasRegistry;
use crate::config::SessionConfig;
use crate::context::{ContextConfig, ContextManager};
use crate::delegate::{AgentSpec, Delegator};
use crate::error::EngineError;
use crate::events::{Event, EventKind};
use crate::hooks::HooksManager;
use crate::provider::Provider;
use crate::toad::{LoopState, TaskOutcome, ToadLoop};
use crate::tools::ToolExecutor;

/// Persisted-schema version. Loads reject anything newer.
const SESSION_VERSION: u64 = 1;

/// Persists session state so a session can stop and resume later.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session_id: &str, state: Value) -> Result<(), EngineError>;
    async fn load(&self, session_id: &str) -> Result<Option<Value>, EngineError>;
}

/// No persistence. Fire-and-forget.
pub struct NoSessionStore;

#[async_trait]
impl SessionStore for NoSessionStore {
    async fn save(&self, _: &str, _: Value) -> Result<(), EngineError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<Value>, EngineError> {
        Ok(None)
    }
}

/// Saves session state to disk as JSON, one file per session.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session_id: &str, state: Value) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EngineError::Session(e.to_string()))?;
        let path = self.dir.join(format!("{session_id}.json"));
        let body = serde_json::to_string_pretty(&state)
            .map_err(|e| EngineError::Session(e.to_string()))?;
        tokio::fs::write(path, body)
            .await
            .map_err(|e| EngineError::Session(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Value>, EngineError> {
        let path = self.dir.join(format!("{session_id}.json"));
        match tokio::fs::read_to_string(path).await {
            Ok(body) => {
                let state: Value = serde_json::from_str(&body)
                    .map_err(|e| EngineError::Session(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Session(e.to_string())),
        }
    }
}

/// Monotonic per-session counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub tasks_executed: u64,
    pub tokens_used: u64,
    pub tool_calls: u64,
    pub errors: u64,
}

/// One line of task history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task: String,
    pub outcome: String,
    pub turns: u32,
    pub tokens: u32,
    pub at: DateTime<Utc>,
}

/// The user-visible wrapper: owns the context manager, hooks, aliases, and
/// the adapter/provider references; drives the loop per task; carries
/// context across turns.
pub struct Session {
    id: String,
    adapter: Arc<dyn ActionAdapter>,
    provider: Arc<dyn Provider>,
    context: ContextManager,
    hooks: Arc<HooksManager>,
    aliases: AliasRegistry,
    delegator: Delegator,
    config: SessionConfig,
    store: Option<Arc<dyn SessionStore>>,
    stats: SessionStats,
    history: Vec<HistoryEntry>,
    current_cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        adapter: Arc<dyn ActionAdapter>,
        provider: Arc<dyn Provider>,
        config: SessionConfig,
    ) -> Self {
        let hooks = Arc::new(HooksManager::new());
        let delegator = Delegator::new(
            Arc::clone(&provider),
            Arc::clone(&adapter),
            Arc::clone(&hooks),
            config.model.clone(),
        );
        let context = ContextManager::new(
            ContextConfig::default().with_max_tokens(config.token_budget),
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            adapter,
            provider,
            context,
            hooks,
            aliases: AliasRegistry::new(),
            delegator,
            config,
            store: None,
            stats: SessionStats::default(),
            history: Vec::new(),
            current_cancel: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Replace the hooks manager. Call before the first task; the delegator
    /// shares it.
    pub fn with_hooks(mut self, hooks: HooksManager) -> Self {
        let hooks = Arc::new(hooks);
        self.hooks = Arc::clone(&hooks);
        self.delegator = Delegator::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.adapter),
            hooks,
            self.config.model.clone(),
        );
        self
    }

    pub fn with_aliases(mut self, aliases: AliasRegistry) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn register_agent(&mut self, spec: AgentSpec) {
        self.delegator.register_agent(spec);
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    // -- lifecycle ----------------------------------------------------------

    /// Bring the adapter up. Idempotent.
    pub async fn connect(&self) -> Result<(), EngineError> {
        self.adapter.connect().await?;
        info!(session = %self.id, "session connected");
        Ok(())
    }

    /// Tear the adapter down and drop its caches. Idempotent.
    pub async fn disconnect(&self) {
        self.adapter.disconnect().await;
        info!(session = %self.id, "session disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        self.adapter.connection_state()
    }

    /// Cancel the task currently running, if any.
    pub fn cancel(&self, reason: &str) {
        info!(session = %self.id, reason, "cancelling current task");
        self.current_cancel.cancel();
    }

    /// A token that cancels the current task; hand it to UIs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.current_cancel.clone()
    }

    // -- task execution -----------------------------------------------------

    /// Run a task, streaming events into `tx`. The first event is `system`;
    /// the last is exactly one of complete/failed/cancelled.
    pub async fn run(&mut self, task: &str, tx: mpsc::Sender<Event>) -> TaskOutcome {
        let _ = tx
            .send(Event::now(EventKind::System {
                tools: self.adapter.available_actions(),
                model: self.config.model.resolve().to_string(),
                session_id: self.id.clone(),
                agents: self.delegator.agent_names(),
            }))
            .await;
        self.drive(task, Some(tx)).await
    }

    /// Run a task to completion without event streaming.
    pub async fn execute(&mut self, task: &str) -> TaskOutcome {
        self.drive(task, None).await
    }

    async fn drive(&mut self, task: &str, tx: Option<mpsc::Sender<Event>>) -> TaskOutcome {
        // A cancellation only ever spends itself on one task.
        if self.current_cancel.is_cancelled() {
            self.current_cancel = CancellationToken::new();
        }

        let checkpoint = self.store.as_ref().map(|store| {
            let store = Arc::clone(store);
            let session_id = self.id.clone();
            let base = self.persisted_base();
            let callback: crate::toad::CheckpointFn = Arc::new(move |snapshot, _turn| {
                let store = Arc::clone(&store);
                let session_id = session_id.clone();
                let mut state = base.clone();
                merge(&mut state, snapshot);
                tokio::spawn(async move {
                    if let Err(e) = store.save(&session_id, state).await {
                        warn!(error = %e, "checkpoint save failed");
                    }
                });
            });
            callback
        });

        let executor = ToolExecutor::new(Arc::clone(&self.adapter), Arc::clone(&self.hooks))
            .with_timeout(self.config.tool_timeout)
            .with_retries(Some(self.config.max_retries));

        let outcome = {
            let mut toad = ToadLoop::new(
                &mut self.context,
                self.provider.as_ref(),
                executor,
                Arc::clone(&self.hooks),
                self.config.clone(),
            )
            .with_cancel(self.current_cancel.clone())
            .with_aliases(&self.aliases)
            .with_delegator(&self.delegator);
            if let Some(tx) = tx {
                toad = toad.with_events(tx);
            }
            if let Some(checkpoint) = checkpoint {
                toad = toad.with_checkpoint(checkpoint);
            }
            toad.run(task).await
        };

        self.stats.tasks_executed += 1;
        self.stats.tokens_used += outcome.usage.total() as u64;
        self.stats.tool_calls += outcome.tool_calls as u64;
        if outcome.state == LoopState::Failed {
            self.stats.errors += 1;
        }

        self.history.push(HistoryEntry {
            task: task.to_string(),
            outcome: outcome.state.to_string(),
            turns: outcome.turns,
            tokens: outcome.usage.total(),
            at: Utc::now(),
        });
        if self.history.len() > self.config.max_history_entries {
            let excess = self.history.len() - self.config.max_history_entries;
            self.history.drain(..excess);
        }

        outcome
    }

    // -- observation --------------------------------------------------------

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    // -- persistence --------------------------------------------------------

    fn persisted_base(&self) -> Value {
        json!({
            "version": SESSION_VERSION,
            "sessionId": self.id,
            "createdAt": self.created_at,
            "updatedAt": Utc::now(),
            "stats": self.stats,
        })
    }

    /// Serialize the full session state.
    pub fn to_persisted(&self) -> Value {
        let mut state = self.persisted_base();
        merge(&mut state, self.context.to_snapshot());
        state
    }

    /// Persist now, through the configured store.
    pub async fn save(&self) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(&self.id, self.to_persisted()).await
    }

    /// Restore state previously written by `save`. Newer schema versions
    /// are rejected.
    pub async fn restore(&mut self) -> Result<bool, EngineError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(state) = store.load(&self.id).await? else {
            return Ok(false);
        };

        let version = state["version"].as_u64().unwrap_or(0);
        if version > SESSION_VERSION {
            return Err(EngineError::Session(format!(
                "persisted session version {version} is newer than supported {SESSION_VERSION}"
            )));
        }

        self.context.restore(&state)?;
        if let Ok(stats) = serde_json::from_value::<SessionStats>(state["stats"].clone()) {
            self.stats = stats;
        }
        info!(session = %self.id, "session restored");
        Ok(true)
    }
}

/// Shallow object merge: `extra`'s top-level keys land in `base`.
fn merge(base: &mut Value, extra: Value) {
    if let (Value::Object(base_map), Value::Object(extra_map)) = (base, extra) {
        for (k, v) in extra_map {
            base_map.insert(k, v);
        }
    }
}

/// Single-use helper: connect, run one task, disconnect.
pub async fn run_task(
    adapter: Arc<dyn ActionAdapter>,
    provider: Arc<dyn Provider>,
    task: &str,
) -> Result<TaskOutcome, EngineError> {
    let mut session = Session::new(adapter, provider, SessionConfig::default());
    session.connect().await?;
    let outcome = session.execute(task).await;
    session.disconnect().await;
    Ok(outcome)
}
