use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// Where a hook attaches in the loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreToolUse,
    PostToolUse,
    PreThink,
    PostThink,
    OnError,
    OnComplete,
}

/// What a handler sees.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub tool: Option<String>,
    pub input: Option<Value>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub iteration: u32,
}

/// How a handler wants the call to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Skip the underlying call; the engine substitutes a stub result.
    Skip,
    Abort { reason: String },
}

/// A handler's verdict plus optional data it wants to pass along.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub action: HookAction,
    pub data: Option<Value>,
}

impl HookOutcome {
    pub fn proceed() -> Self {
        Self {
            action: HookAction::Continue,
            data: None,
        }
    }
}

/// A lifecycle handler. Non-critical failures are logged and surfaced as
/// on-error events; critical ones propagate and abort the call.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn critical(&self) -> bool {
        false
    }

    async fn run(&self, context: &HookContext) -> Result<HookOutcome, String>;
}

/// What a dispatch pass produced: the first non-continue verdict (handlers
/// after it don't run) and any non-critical handler failures.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub action: HookAction,
    pub data: Option<Value>,
    pub failures: Vec<(String, String)>,
}

/// Registry of hooks per point, executed in registration order.
#[derive(Default)]
pub struct HooksManager {
    handlers: HashMap<HookPoint, Vec<Arc<dyn Hook>>>,
}

impl HooksManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, point: HookPoint, hook: impl Hook + 'static) {
        self.handlers.entry(point).or_default().push(Arc::new(hook));
    }

    pub fn has_handlers(&self, point: HookPoint) -> bool {
        self.handlers.get(&point).is_some_and(|h| !h.is_empty())
    }

    /// Run every handler registered at `point`. The first skip/abort verdict
    /// short-circuits. A failing critical handler propagates as `Err`.
    pub async fn dispatch(
        &self,
        point: HookPoint,
        context: &HookContext,
    ) -> Result<Dispatch, String> {
        let mut dispatch = Dispatch {
            action: HookAction::Continue,
            data: None,
            failures: Vec::new(),
        };

        let Some(handlers) = self.handlers.get(&point) else {
            return Ok(dispatch);
        };

        for hook in handlers {
            match hook.run(context).await {
                Ok(outcome) => {
                    if outcome.data.is_some() {
                        dispatch.data = outcome.data;
                    }
                    if outcome.action != HookAction::Continue {
                        dispatch.action = outcome.action;
                        break;
                    }
                }
                Err(e) => {
                    if hook.critical() {
                        return Err(format!("{}: {e}", hook.name()));
                    }
                    warn!(hook = hook.name(), error = %e, "hook failed, continuing");
                    dispatch.failures.push((hook.name().to_string(), e));
                }
            }
        }

        Ok(dispatch)
    }
}
