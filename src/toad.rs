use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alias::{AliasRegistry, ResolveContext};
use crate::config::SessionConfig;
use crate::context::tiers::Tier;
use crate::context::{AddOptions, ContextEvent, ContextManager, PrepareOptions};
use crate::delegate::Delegator;
use crate::events::{Event, EventKind, FailureReason};
use crate::hooks::{HookContext, HookPoint, HooksManager};
use crate::provider::Provider;
use crate::tools::ToolExecutor;
use crate::types::{
    priority, ContentBlock, InferenceRequest, InferenceResponse, Message, StreamChunk, Usage,
};

/// Token budget for resolving aliases in an incoming task.
const TASK_ALIAS_BUDGET: u32 = 4_000;
/// Token budget for resolving aliases inside assistant tool arguments.
const ARG_ALIAS_BUDGET: u32 = 2_000;

/// The loop's states. Think → Act → Observe → Decide, with three terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Think,
    Act,
    Observe,
    Decide,
    Complete,
    Failed,
    Cancelled,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Init => "init",
            LoopState::Think => "think",
            LoopState::Act => "act",
            LoopState::Observe => "observe",
            LoopState::Decide => "decide",
            LoopState::Complete => "complete",
            LoopState::Failed => "failed",
            LoopState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Complete | LoopState::Failed | LoopState::Cancelled
        )
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one task ended.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub state: LoopState,
    pub text: String,
    pub usage: Usage,
    pub turns: u32,
    pub tool_calls: u32,
    pub duration_ms: u64,
    pub failure: Option<FailureReason>,
    pub cancel_reason: Option<String>,
}

/// One tool call lifted out of an assistant response.
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    args: Value,
}

/// Checkpoint callback the session wires in: receives the context snapshot
/// every N iterations.
pub type CheckpointFn = Arc<dyn Fn(Value, u32) + Send + Sync>;

/// The bounded iterative control loop. Borrows the session's context,
/// provider, and executor for the duration of one task.
pub struct ToadLoop<'a> {
    context: &'a mut ContextManager,
    provider: &'a dyn Provider,
    executor: ToolExecutor,
    hooks: Arc<HooksManager>,
    config: SessionConfig,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<Event>>,
    aliases: Option<&'a AliasRegistry>,
    delegator: Option<&'a Delegator>,
    /// When set, only these tools may run (sub-agent isolation).
    whitelist: Option<HashSet<String>>,
    checkpoint: Option<CheckpointFn>,
}

impl<'a> ToadLoop<'a> {
    pub fn new(
        context: &'a mut ContextManager,
        provider: &'a dyn Provider,
        executor: ToolExecutor,
        hooks: Arc<HooksManager>,
        config: SessionConfig,
    ) -> Self {
        Self {
            context,
            provider,
            executor,
            hooks,
            config,
            cancel: CancellationToken::new(),
            events: None,
            aliases: None,
            delegator: None,
            whitelist: None,
            checkpoint: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_aliases(mut self, aliases: &'a AliasRegistry) -> Self {
        self.aliases = Some(aliases);
        self
    }

    pub fn with_delegator(mut self, delegator: &'a Delegator) -> Self {
        self.delegator = Some(delegator);
        self
    }

    pub fn with_whitelist(mut self, whitelist: HashSet<String>) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointFn) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    async fn emit(&self, kind: EventKind) {
        if let Some(tx) = &self.events {
            let _ = tx.send(Event::now(kind)).await;
        }
    }

    /// Forward context happenings as engine events.
    async fn forward_context_events(&mut self) {
        let events = self.context.drain_events();
        let mut compressed = false;
        for event in &events {
            if matches!(event, ContextEvent::CompressionCompleted { .. }) {
                compressed = true;
            }
        }
        if compressed {
            let stats = self.context.stats();
            self.emit(EventKind::Context {
                tokens_used: stats.memory.total_tokens,
                compressions: stats.compressions as u32,
            })
            .await;
        }
    }

    /// Tool schemas visible to the model: adapter tools (whitelist-filtered)
    /// plus the delegate tool when delegation is wired.
    fn tool_schemas(&self) -> Vec<Value> {
        let mut schemas: Vec<Value> = self
            .executor
            .adapter()
            .available_actions()
            .iter()
            .filter(|name| {
                self.whitelist
                    .as_ref()
                    .map(|w| w.contains(*name))
                    .unwrap_or(true)
            })
            .filter_map(|name| self.executor.adapter().schema(name))
            .collect();
        if self.delegator.is_some() {
            schemas.push(crate::delegate::delegate_tool_schema());
        }
        schemas
    }

    /// Drive the task to a terminal state. Exactly one of
    /// complete/failed/cancelled is emitted, last on the stream.
    pub async fn run(&mut self, task: &str) -> TaskOutcome {
        let started = tokio::time::Instant::now();
        let mut total_usage = Usage::default();
        let mut final_text = String::new();
        let mut turns = 0u32;
        let mut tool_calls_total = 0u32;
        let mut consecutive_errors = 0u32;

        let task = self.resolve_task_aliases(task).await;
        self.context.add_user(task);
        self.context.drain_events();

        let outcome_state;
        let mut failure = None;
        let mut cancel_reason = None;

        loop {
            // State boundary: cancellation wins over everything.
            if self.cancel.is_cancelled() {
                outcome_state = LoopState::Cancelled;
                cancel_reason = Some("cancelled by caller".to_string());
                break;
            }

            if turns >= self.config.max_iterations {
                outcome_state = LoopState::Failed;
                failure = Some(FailureReason::IterationCap);
                break;
            }

            turns += 1;
            self.emit(EventKind::Iteration { n: turns }).await;

            // ---- THINK ----------------------------------------------------
            let think = match self.think(&mut total_usage).await {
                Ok(response) => response,
                Err(ThinkFailure::Cancelled) => {
                    outcome_state = LoopState::Cancelled;
                    cancel_reason = Some("cancelled during inference".to_string());
                    break;
                }
                Err(ThinkFailure::Provider(message)) => {
                    consecutive_errors += 1;
                    self.emit(EventKind::Error {
                        code: "E_PROVIDER".into(),
                        message,
                        recoverable: false,
                    })
                    .await;
                    if consecutive_errors >= self.config.max_errors {
                        outcome_state = LoopState::Failed;
                        failure = Some(FailureReason::ErrorCap);
                        break;
                    }
                    continue;
                }
            };

            let text = think.text();
            if !text.is_empty() {
                final_text = text.clone();
            }

            let calls: Vec<PendingCall> = think
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => Some(PendingCall {
                        id: id.clone(),
                        name: name.clone(),
                        args: input.clone(),
                    }),
                    _ => None,
                })
                .collect();

            // Commit the assistant turn only after we know we weren't
            // cancelled mid-stream.
            self.context.add_assistant_blocks(think.content.clone());
            self.forward_context_events().await;

            // ---- DECIDE (fast path): text answer, no tools ---------------
            if calls.is_empty() {
                if !text.is_empty() {
                    self.emit(EventKind::Decision {
                        next: LoopState::Complete,
                        reason: "assistant answered without tool calls".into(),
                    })
                    .await;
                    outcome_state = LoopState::Complete;
                    break;
                }
                // Nothing at all came back; count it as a soft error and
                // give the model another turn.
                consecutive_errors += 1;
                if consecutive_errors >= self.config.max_errors {
                    outcome_state = LoopState::Failed;
                    failure = Some(FailureReason::ErrorCap);
                    break;
                }
                continue;
            }

            // ---- ACT ------------------------------------------------------
            let act = self
                .act(&calls, turns, &mut tool_calls_total, &mut consecutive_errors)
                .await;

            // ---- OBSERVE --------------------------------------------------
            self.observe(&calls, &act).await;

            // ---- DECIDE ---------------------------------------------------
            if self.cancel.is_cancelled() {
                outcome_state = LoopState::Cancelled;
                cancel_reason = Some("cancelled by caller".to_string());
                break;
            }
            if turns >= self.config.max_iterations {
                self.emit(EventKind::Decision {
                    next: LoopState::Failed,
                    reason: "iteration cap reached".into(),
                })
                .await;
                outcome_state = LoopState::Failed;
                failure = Some(FailureReason::IterationCap);
                break;
            }
            if total_usage.total() >= self.config.token_budget
                || self.context.total_tokens() >= self.config.token_budget
            {
                self.emit(EventKind::Decision {
                    next: LoopState::Failed,
                    reason: "token budget exhausted".into(),
                })
                .await;
                outcome_state = LoopState::Failed;
                failure = Some(FailureReason::BudgetExhausted);
                break;
            }
            if consecutive_errors >= self.config.max_errors {
                self.emit(EventKind::Decision {
                    next: LoopState::Failed,
                    reason: "consecutive error cap reached".into(),
                })
                .await;
                outcome_state = LoopState::Failed;
                failure = Some(FailureReason::ErrorCap);
                break;
            }

            self.emit(EventKind::Decision {
                next: LoopState::Think,
                reason: "tool results recorded, thinking again".into(),
            })
            .await;

            if let Some(checkpoint) = &self.checkpoint {
                if turns % self.config.checkpoint_interval.max(1) == 0 {
                    debug!(turn = turns, "checkpointing session");
                    checkpoint(self.context.to_snapshot(), turns);
                }
            }
        }

        // ---- terminal -----------------------------------------------------
        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = TaskOutcome {
            state: outcome_state,
            text: final_text.clone(),
            usage: total_usage,
            turns,
            tool_calls: tool_calls_total,
            duration_ms,
            failure,
            cancel_reason: cancel_reason.clone(),
        };

        let complete_context = HookContext {
            output: Some(final_text.clone()),
            iteration: turns,
            ..Default::default()
        };
        if let Err(e) = self
            .hooks
            .dispatch(HookPoint::OnComplete, &complete_context)
            .await
        {
            warn!(error = %e, "on-complete hook failed");
        }

        match outcome_state {
            LoopState::Complete => {
                info!(turns, tool_calls = tool_calls_total, "task complete");
                self.emit(EventKind::Complete {
                    summary: final_text,
                    usage: total_usage,
                    turns,
                    tool_calls: tool_calls_total,
                    duration_ms,
                })
                .await;
            }
            LoopState::Failed => {
                let reason = failure.unwrap_or(FailureReason::ErrorCap);
                warn!(%reason, turns, "task failed");
                self.emit(EventKind::Failed {
                    reason,
                    usage: total_usage,
                })
                .await;
            }
            _ => {
                info!(turns, "task cancelled");
                self.emit(EventKind::Cancelled {
                    reason: cancel_reason.unwrap_or_else(|| "cancelled".into()),
                })
                .await;
            }
        }

        outcome
    }

    /// One inference round: prepare context, call the provider (racing the
    /// cancellation token), emit thinking events.
    async fn think(&mut self, total_usage: &mut Usage) -> Result<InferenceResponse, ThinkFailure> {
        let pre_think = HookContext::default();
        if let Err(e) = self.hooks.dispatch(HookPoint::PreThink, &pre_think).await {
            warn!(error = %e, "pre-think hook failed");
        }

        let prepared = self.context.prepare_for_request(PrepareOptions::default());
        self.forward_context_events().await;

        // System prefix goes to the provider's dedicated slot.
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for msg in prepared.messages {
            if msg["role"] == "system" {
                if let Some(text) = msg["content"].as_str() {
                    system_parts.push(text.to_string());
                }
            } else {
                messages.push(msg);
            }
        }
        if let Some(prompt) = &self.config.system_prompt {
            system_parts.insert(0, prompt.clone());
        }

        let max_tokens = if prepared.response_tokens_available > 0 {
            self.config.max_tokens.min(prepared.response_tokens_available)
        } else {
            self.config.max_tokens
        };

        let request = InferenceRequest {
            model: self.config.model.resolve().to_string(),
            max_tokens,
            temperature: None,
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            tools: self.tool_schemas(),
            messages,
            stream: self.events.is_some(),
        };

        let response = if let Some(tx) = self.events.clone() {
            // Stream deltas to the caller while the provider works.
            let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(32);
            let forwarder = tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    if let Some(delta) = chunk.delta {
                        let _ = tx
                            .send(Event::now(EventKind::Thinking {
                                text: None,
                                delta: Some(delta),
                                token_count: None,
                            }))
                            .await;
                    }
                }
            });

            let result = tokio::select! {
                result = self.provider.generate_streaming(request, chunk_tx) => result,
                _ = self.cancel.cancelled() => {
                    forwarder.abort();
                    return Err(ThinkFailure::Cancelled);
                }
            };
            let _ = forwarder.await;
            result
        } else {
            tokio::select! {
                result = self.provider.generate(request) => result,
                _ = self.cancel.cancelled() => return Err(ThinkFailure::Cancelled),
            }
        };

        let response = response.map_err(|e| ThinkFailure::Provider(e.to_string()))?;
        total_usage.accumulate(&response.usage);

        let text = response.text();
        self.emit(EventKind::Thinking {
            text: (!text.is_empty()).then(|| text.clone()),
            delta: None,
            token_count: Some(response.usage.output_tokens),
        })
        .await;

        let post_think = HookContext {
            output: Some(text),
            ..Default::default()
        };
        if let Err(e) = self.hooks.dispatch(HookPoint::PostThink, &post_think).await {
            warn!(error = %e, "post-think hook failed");
        }

        Ok(response)
    }

    /// Execute the turn's tool calls: aliases resolved, whitelist enforced,
    /// sequential by default with bounded fan-out for independent calls.
    async fn act(
        &mut self,
        calls: &[PendingCall],
        iteration: u32,
        tool_calls_total: &mut u32,
        consecutive_errors: &mut u32,
    ) -> Vec<CallOutcome> {
        let parallel_ok = self.provider.supports_parallel_tools()
            && self.config.parallel_tool_limit > 1
            && calls.len() > 1
            && !has_dependencies(calls)
            && calls
                .iter()
                .all(|c| c.name != crate::delegate::DELEGATE_TOOL && self.whitelisted(&c.name));

        let mut outcomes = Vec::with_capacity(calls.len());

        if parallel_ok {
            for call in calls {
                self.emit(EventKind::ToolCall {
                    id: call.id.clone(),
                    tool: call.name.clone(),
                    input: call.args.clone(),
                })
                .await;
            }

            let mut set: JoinSet<(usize, CallOutcome)> = JoinSet::new();
            let mut next = 0usize;
            let mut collected: Vec<Option<CallOutcome>> = vec![None; calls.len()];

            while next < calls.len() || !set.is_empty() {
                while next < calls.len() && set.len() < self.config.parallel_tool_limit {
                    let call = calls[next].clone();
                    let call = self.resolve_call_aliases(call).await;
                    let executor = self.executor.clone();
                    let idx = next;
                    set.spawn(async move {
                        (idx, execute_one(&executor, call, iteration).await)
                    });
                    next += 1;
                }
                if let Some(Ok((idx, outcome))) = set.join_next().await {
                    collected[idx] = Some(outcome);
                }
            }
            outcomes.extend(collected.into_iter().flatten());

            for outcome in &outcomes {
                self.emit(EventKind::ToolResult {
                    id: outcome.call_id.clone(),
                    tool: outcome.tool.clone(),
                    output: outcome.output.clone(),
                    duration_ms: outcome.duration_ms,
                    success: outcome.success,
                })
                .await;
            }
        } else {
            for call in calls {
                self.emit(EventKind::ToolCall {
                    id: call.id.clone(),
                    tool: call.name.clone(),
                    input: call.args.clone(),
                })
                .await;

                let call = self.resolve_call_aliases(call.clone()).await;
                let outcome = if call.name == crate::delegate::DELEGATE_TOOL {
                    self.run_delegation(&call).await
                } else if !self.whitelisted(&call.name) {
                    CallOutcome::rejected(&call, "tool not in whitelist")
                } else {
                    execute_one(&self.executor, call, iteration).await
                };

                self.emit(EventKind::ToolResult {
                    id: outcome.call_id.clone(),
                    tool: outcome.tool.clone(),
                    output: outcome.output.clone(),
                    duration_ms: outcome.duration_ms,
                    success: outcome.success,
                })
                .await;
                outcomes.push(outcome);
            }
        }

        for outcome in &outcomes {
            *tool_calls_total += 1;
            if outcome.success {
                *consecutive_errors = 0;
            } else if outcome.counts_toward_error_cap() {
                *consecutive_errors += 1;
                self.emit(EventKind::Error {
                    code: outcome.error_code.clone().unwrap_or_else(|| "E_TOOL".into()),
                    message: outcome.output.clone(),
                    recoverable: outcome.recoverable,
                })
                .await;
            }
        }

        outcomes
    }

    fn whitelisted(&self, tool: &str) -> bool {
        self.whitelist
            .as_ref()
            .map(|w| w.contains(tool))
            .unwrap_or(true)
    }

    /// Resolve `@alias` references in the incoming user task. The inline
    /// summary rewrite becomes the committed task text; the full value
    /// blocks land in the resources tier so the model sees them once,
    /// ahead of the conversation.
    async fn resolve_task_aliases(&mut self, task: &str) -> String {
        let Some(registry) = self.aliases else {
            return task.to_string();
        };
        if registry.is_empty() || !task.contains('@') {
            return task.to_string();
        }

        let resolved = registry
            .resolve_text(task, TASK_ALIAS_BUDGET, &ResolveContext::default())
            .await;
        if resolved.tokens_used > 0 && resolved.context_text != resolved.summary_text {
            self.context.add(
                Message::user(resolved.context_text).with_priority(priority::HIGH),
                AddOptions {
                    tier: Some(Tier::Resources),
                    ..Default::default()
                },
            );
        }
        for error in &resolved.errors {
            warn!(%error, "alias resolution failed in task");
        }
        resolved.summary_text
    }

    /// Resolve `@alias` references inside string arguments.
    async fn resolve_call_aliases(&self, mut call: PendingCall) -> PendingCall {
        let Some(registry) = self.aliases else {
            return call;
        };
        if registry.is_empty() {
            return call;
        }
        if let Value::Object(args) = &mut call.args {
            for value in args.values_mut() {
                if let Value::String(s) = value {
                    if s.contains('@') {
                        let resolved = registry
                            .resolve_text(s, ARG_ALIAS_BUDGET, &ResolveContext::default())
                            .await;
                        *value = Value::String(resolved.summary_text);
                    }
                }
            }
        }
        call
    }

    async fn run_delegation(&mut self, call: &PendingCall) -> CallOutcome {
        let Some(delegator) = self.delegator else {
            return CallOutcome::rejected(call, "delegation not available");
        };
        let started = tokio::time::Instant::now();
        let report = delegator
            .run(call.args.clone(), self.cancel.clone())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let output = serde_json::to_string_pretty(&report.to_payload())
            .unwrap_or_else(|_| "delegation report unavailable".into());
        CallOutcome {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            output,
            duration_ms,
            success: report.success,
            recoverable: true,
            error_code: (!report.success).then(|| "E_DELEGATION".to_string()),
        }
    }

    /// Record results, refresh state awareness after mutations, age tool
    /// results, and run echo-poisoning checks.
    async fn observe(&mut self, calls: &[PendingCall], outcomes: &[CallOutcome]) {
        let mut notes = Vec::new();

        for outcome in outcomes {
            self.context.add_tool_result(
                outcome.call_id.as_str(),
                outcome.tool.as_str(),
                outcome.output.as_str(),
                !outcome.success,
            );

            if !outcome.success {
                if let Some(detection) =
                    self.context.record_tool_error(&outcome.tool, &outcome.output)
                {
                    notes.push(format!(
                        "repeated error loop on {} (count {})",
                        detection.tool, detection.count
                    ));
                    self.emit(EventKind::LoopDetection {
                        tool: detection.tool.clone(),
                        severity: detection.severity,
                        count: detection.count,
                    })
                    .await;
                }
            }
        }

        let mutated = calls
            .iter()
            .zip(outcomes)
            .any(|(call, outcome)| outcome.success && self.executor.adapter().is_mutating(&call.name));
        if mutated {
            notes.push("invalidated state cache".into());
            // Fresh snapshot so stale identifiers surface as corrections.
            if let Ok(snapshot) = self
                .executor
                .adapter()
                .get_state(crate::adapter::StateOptions::default())
                .await
            {
                self.context.observe_snapshot(&snapshot);
            }
        }

        self.context.age_results();
        self.forward_context_events().await;
        self.emit(EventKind::Observation { notes }).await;
    }
}

enum ThinkFailure {
    Cancelled,
    Provider(String),
}

/// What one executed call produced, flattened for events and context.
#[derive(Debug, Clone)]
pub(crate) struct CallOutcome {
    pub call_id: String,
    pub tool: String,
    pub output: String,
    pub duration_ms: u64,
    pub success: bool,
    pub recoverable: bool,
    pub error_code: Option<String>,
}

impl CallOutcome {
    fn rejected(call: &PendingCall, reason: &str) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            output: reason.to_string(),
            duration_ms: 0,
            success: false,
            recoverable: false,
            error_code: Some("E_PROTOCOL".into()),
        }
    }

    /// Hard errors: anything non-recoverable, plus transport failures that
    /// exhausted their retries inside the adapter.
    fn counts_toward_error_cap(&self) -> bool {
        if self.success {
            return false;
        }
        if !self.recoverable {
            return true;
        }
        self.error_code
            .as_deref()
            .map(|c| {
                c.starts_with("E_HTTP_5")
                    || c == "E_NETWORK"
                    || c == "E_TIMEOUT"
                    || c == "E_CIRCUIT_OPEN"
            })
            .unwrap_or(false)
    }
}

async fn execute_one(executor: &ToolExecutor, call: PendingCall, iteration: u32) -> CallOutcome {
    match executor.run(&call.name, call.args.clone(), iteration).await {
        Ok(report) => {
            let result = report.result;
            CallOutcome {
                call_id: call.id,
                tool: call.name,
                output: result.output_text(),
                duration_ms: result.metadata.duration_ms,
                success: result.success,
                recoverable: result
                    .error
                    .as_ref()
                    .map(|e| e.recoverable)
                    .unwrap_or(true),
                error_code: result.error.map(|e| e.code),
            }
        }
        Err(tool_error) => CallOutcome {
            call_id: call.id,
            tool: call.name,
            output: tool_error.to_string(),
            duration_ms: 0,
            success: false,
            recoverable: tool_error.recoverable(),
            error_code: Some("E_PROTOCOL".into()),
        },
    }
}

/// A later call that mentions an earlier call's id or identifier-valued
/// argument must run after it.
fn has_dependencies(calls: &[PendingCall]) -> bool {
    for (i, later) in calls.iter().enumerate().skip(1) {
        let later_args = later.args.to_string();
        for earlier in &calls[..i] {
            if later_args.contains(&earlier.id) {
                return true;
            }
            for id in id_values(&earlier.args) {
                if id.len() >= 3 && later_args.contains(&id) {
                    return true;
                }
            }
        }
    }
    false
}

fn id_values(args: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Value::Object(map) = args {
        for (k, v) in map {
            if k == "id" || k.ends_with("Id") || k.ends_with("_id") {
                if let Value::String(s) = v {
                    out.push(s.clone());
                }
            }
            out.extend(id_values(v));
        }
    } else if let Value::Array(items) = args {
        for v in items {
            out.extend(id_values(v));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, name: &str, args: Value) -> PendingCall {
        PendingCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn independent_calls_have_no_dependencies() {
        let calls = vec![
            call("c1", "click", json!({"selector": "#a"})),
            call("c2", "click", json!({"selector": "#b"})),
        ];
        assert!(!has_dependencies(&calls));
    }

    #[test]
    fn call_referencing_earlier_id_argument_is_dependent() {
        let calls = vec![
            call("c1", "create_element", json!({"id": "el-77", "type": "rect"})),
            call("c2", "style_element", json!({"target": "el-77", "fill": "#fff"})),
        ];
        assert!(has_dependencies(&calls));
    }

    #[test]
    fn call_referencing_earlier_call_id_is_dependent() {
        let calls = vec![
            call("call_abc", "query", json!({})),
            call("c2", "use", json!({"from": "call_abc"})),
        ];
        assert!(has_dependencies(&calls));
    }

    #[test]
    fn nested_id_values_are_collected() {
        let ids = id_values(&json!({
            "elementId": "el-1",
            "nested": {"parent_id": "el-2"},
            "list": [{"id": "el-3"}]
        }));
        assert!(ids.contains(&"el-1".to_string()));
        assert!(ids.contains(&"el-2".to_string()));
        assert!(ids.contains(&"el-3".to_string()));
    }
}
