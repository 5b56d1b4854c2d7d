pub mod breaker;
pub mod http;
pub mod retry;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AdapterError;
use crate::types::{ActionResult, Awareness, StateSnapshot};

/// Adapter connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Per-call overrides for `execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

/// Shaping for `get_state`.
#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    pub format: Option<String>,
    pub depth: Option<usize>,
    pub keys: Option<Vec<String>>,
}

/// Shaping for `get_awareness`.
#[derive(Debug, Clone, Default)]
pub struct AwarenessOptions {
    pub include_skeleton: bool,
    pub include_relevant: bool,
    pub context_hint: Option<String>,
}

/// Uniform interface to a domain backend (browser, canvas, …): tool
/// discovery, execution, and state access. Implementations never raise
/// across the `execute` boundary; failures are `ActionResult` values.
#[async_trait]
pub trait ActionAdapter: Send + Sync {
    /// Bring the backend up. Idempotent; `true` when usable.
    async fn connect(&self) -> Result<bool, AdapterError>;

    /// Tear down and drop caches. Idempotent.
    async fn disconnect(&self);

    fn connection_state(&self) -> ConnectionState;

    /// Run one action. Guarantees `metadata.duration_ms` and a populated
    /// `error.recoverable` on failure. Mutating actions invalidate any
    /// state snapshot cache.
    async fn execute(&self, action: &str, params: Value, opts: ExecuteOptions) -> ActionResult;

    fn available_actions(&self) -> Vec<String>;

    fn supports(&self, action: &str) -> bool {
        self.available_actions().iter().any(|a| a == action)
    }

    fn schema(&self, action: &str) -> Option<Value>;

    /// Whether an action changes backend state. Drives snapshot-cache
    /// invalidation and awareness staleness.
    fn is_mutating(&self, action: &str) -> bool;

    /// Current backend state, cached briefly by implementations.
    async fn get_state(&self, opts: StateOptions) -> Result<StateSnapshot, AdapterError>;

    /// A bounded, prompt-sized view derived from `get_state`.
    async fn get_awareness(&self, opts: AwarenessOptions) -> Result<Awareness, AdapterError> {
        let snapshot = self.get_state(StateOptions::default()).await?;
        Ok(derive_awareness(
            &snapshot,
            self.available_actions(),
            &opts,
        ))
    }

    /// Best-effort abort of in-flight work. Default: nothing to abort.
    async fn abort_inflight(&self) {}
}

/// Build an `Awareness` from a snapshot: summary, action list, optional
/// structural skeleton (top-level children only) and hint-matched subset.
pub fn derive_awareness(
    snapshot: &StateSnapshot,
    available_actions: Vec<String>,
    opts: &AwarenessOptions,
) -> Awareness {
    let skeleton = opts.include_skeleton.then(|| skeleton_of(snapshot, 8));

    let relevant = match (&opts.context_hint, opts.include_relevant) {
        (Some(hint), true) => Some(filter_by_hint(snapshot, hint)),
        _ => None,
    };

    let tokens_used = crate::context::budget::estimate_str(&snapshot.summary)
        + skeleton
            .as_ref()
            .map(|s| crate::context::budget::estimate_str(&s.to_string()))
            .unwrap_or(0)
        + relevant
            .as_ref()
            .map(|r| crate::context::budget::estimate_str(&r.to_string()))
            .unwrap_or(0);

    Awareness {
        summary: snapshot.summary.clone(),
        available_actions,
        tokens_used,
        skeleton,
        relevant,
    }
}

/// Top-N entries of each array in the snapshot, ids and types only.
fn skeleton_of(snapshot: &StateSnapshot, top_n: usize) -> Value {
    let mut out = serde_json::Map::new();
    for (key, value) in &snapshot.data {
        if let Value::Array(items) = value {
            let trimmed: Vec<Value> = items
                .iter()
                .take(top_n)
                .map(|item| {
                    let mut entry = serde_json::Map::new();
                    for field in ["id", "type", "name"] {
                        if let Some(v) = item.get(field) {
                            entry.insert(field.to_string(), v.clone());
                        }
                    }
                    Value::Object(entry)
                })
                .collect();
            let mut wrapper = serde_json::Map::new();
            wrapper.insert("total".into(), Value::from(items.len()));
            wrapper.insert("top".into(), Value::Array(trimmed));
            out.insert(key.clone(), Value::Object(wrapper));
        }
    }
    Value::Object(out)
}

/// Entries whose serialized form mentions the hint, case-insensitively.
fn filter_by_hint(snapshot: &StateSnapshot, hint: &str) -> Value {
    let needle = hint.to_lowercase();
    let mut out = Vec::new();
    for value in snapshot.data.values() {
        if let Value::Array(items) = value {
            for item in items {
                if item.to_string().to_lowercase().contains(&needle) {
                    out.push(item.clone());
                }
            }
        }
    }
    Value::Array(out)
}

/// One-slot snapshot cache with a short TTL, invalidated by every mutating
/// action.
pub struct SnapshotCache {
    ttl: Duration,
    slot: Mutex<Option<(tokio::time::Instant, StateSnapshot)>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<StateSnapshot> {
        let slot = self.slot.lock().ok()?;
        let (at, snapshot) = slot.as_ref()?;
        (at.elapsed() < self.ttl).then(|| snapshot.clone())
    }

    pub fn put(&self, snapshot: StateSnapshot) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some((tokio::time::Instant::now(), snapshot));
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
