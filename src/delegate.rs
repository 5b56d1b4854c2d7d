use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::ActionAdapter;
use crate::config::{ModelChoice, SessionConfig};
use crate::context::budget::estimate_str;
use crate::context::{ContextConfig, ContextManager};
use crate::events::{Event, EventKind};
use crate::hooks::HooksManager;
use crate::provider::Provider;
use crate::toad::{LoopState, ToadLoop};
use crate::tools::ToolExecutor;

/// Name of the tool the parent loop intercepts for delegation.
pub const DELEGATE_TOOL: &str = "delegate";

/// Sub-agent bounds: tighter than any parent task.
const SUB_MAX_ITERATIONS: u32 = 10;
const SUB_TOKEN_BUDGET: u32 = 50_000;
/// Summary cap in tokens (~4 chars each).
const SUMMARY_TOKEN_CAP: usize = 400;
/// Rough cost of inlining one tool round-trip into the parent context.
const INLINE_TOKENS_PER_CALL: u32 = 800;

/// Schema for the `delegate` tool, appended to the parent's tool list.
pub fn delegate_tool_schema() -> Value {
    json!({
        "name": DELEGATE_TOOL,
        "description": "Delegate a sub-task to an isolated agent. The agent works \
            in its own context with its own tool budget and returns only a short \
            summary plus created/modified ids. Use it for exploration or \
            multi-step work whose details you don't need verbatim.",
        "input_schema": {
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Agent to run: planner, analyzer, explorer, or a registered custom agent"
                },
                "task": {"type": "string", "description": "What the sub-agent should do"},
                "elementIds": {
                    "type": "array",
                    "description": "Identifiers the sub-agent should focus on"
                },
                "contextHint": {"type": "string"},
                "expectReturn": {
                    "type": "string",
                    "enum": ["elements", "positions", "styles", "analysis", "plan"]
                }
            },
            "required": ["agent", "task"]
        }
    })
}

// ---------------------------------------------------------------------------
// Plans (planner mode)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl Default for PlanTaskState {
    fn default() -> Self {
        PlanTaskState::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub state: PlanTaskState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanReferences {
    #[serde(default)]
    pub element_ids: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
}

/// What the plan intends to touch, declared up front.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeScope {
    #[serde(default)]
    pub creates: Vec<String>,
    #[serde(default)]
    pub updates: Vec<String>,
    #[serde(default)]
    pub deletes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub objective: String,
    #[serde(default)]
    pub references: PlanReferences,
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub change_scope: ChangeScope,
}

impl Plan {
    /// Pull a plan out of free-form agent text: the first balanced JSON
    /// object that deserializes as a plan wins.
    pub fn parse_from_text(text: &str) -> Option<Plan> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    }
}

// ---------------------------------------------------------------------------
// Delegation report
// ---------------------------------------------------------------------------

/// Token economy of one delegation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationMetrics {
    pub isolated_tokens: u32,
    pub returned_tokens: u32,
    pub estimated_inline_tokens: u32,
    pub savings_percent: f32,
}

/// The only payload that crosses the isolation boundary back into the
/// parent context.
#[derive(Debug, Clone)]
pub struct DelegationReport {
    pub success: bool,
    pub summary: String,
    pub created_ids: Vec<String>,
    pub modified_ids: Vec<String>,
    pub tokens_used: u32,
    pub metrics: DelegationMetrics,
    pub plan: Option<Plan>,
    pub error: Option<String>,
}

impl DelegationReport {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: String::new(),
            created_ids: Vec::new(),
            modified_ids: Vec::new(),
            tokens_used: 0,
            metrics: DelegationMetrics::default(),
            plan: None,
            error: Some(error.into()),
        }
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "success": self.success,
            "summary": self.summary,
            "createdIds": self.created_ids,
            "modifiedIds": self.modified_ids,
            "tokensUsed": self.tokens_used,
            "metrics": {
                "isolatedTokens": self.metrics.isolated_tokens,
                "returnedTokens": self.metrics.returned_tokens,
                "estimatedInlineTokens": self.metrics.estimated_inline_tokens,
                "savingsPercent": self.metrics.savings_percent,
            },
        });
        if let Some(plan) = &self.plan {
            payload["plan"] = serde_json::to_value(plan).unwrap_or(Value::Null);
        }
        if let Some(error) = &self.error {
            payload["error"] = Value::String(error.clone());
        }
        payload
    }
}

// ---------------------------------------------------------------------------
// Agent registry
// ---------------------------------------------------------------------------

/// A specialized sub-agent: a name and the system prompt that shapes it.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    pub system_prompt: String,
}

fn builtin_agents() -> HashMap<String, AgentSpec> {
    let mut agents = HashMap::new();
    for (name, prompt) in [
        (
            "planner",
            "You are a planning agent. Break the task into a short ordered plan. \
             Answer with a JSON object: {\"id\", \"objective\", \"tasks\": \
             [{\"id\", \"description\", \"state\": \"pending\"}], \"change_scope\": \
             {\"creates\": [], \"updates\": [], \"deletes\": []}}. Read state with \
             the available tools before planning; do not modify anything.",
        ),
        (
            "analyzer",
            "You are an analysis agent. Inspect the current state with the \
             available read tools and answer the question concisely. Report \
             concrete identifiers for anything you reference.",
        ),
        (
            "explorer",
            "You are an exploration agent. Survey the backend state broadly, \
             then summarize what exists and where. Prefer breadth over depth; \
             keep the final summary short.",
        ),
    ] {
        agents.insert(
            name.to_string(),
            AgentSpec {
                name: name.to_string(),
                system_prompt: prompt.to_string(),
            },
        );
    }
    agents
}

// ---------------------------------------------------------------------------
// Delegator
// ---------------------------------------------------------------------------

/// Spawns bounded, context-isolated sub-loops. The adapter is shared with
/// the parent; the context manager never is.
pub struct Delegator {
    provider: Arc<dyn Provider>,
    adapter: Arc<dyn ActionAdapter>,
    hooks: Arc<HooksManager>,
    model: ModelChoice,
    agents: HashMap<String, AgentSpec>,
}

impl Delegator {
    pub fn new(
        provider: Arc<dyn Provider>,
        adapter: Arc<dyn ActionAdapter>,
        hooks: Arc<HooksManager>,
        model: ModelChoice,
    ) -> Self {
        Self {
            provider,
            adapter,
            hooks,
            model,
            agents: builtin_agents(),
        }
    }

    /// Register a domain-specific agent alongside the built-ins.
    pub fn register_agent(&mut self, spec: AgentSpec) {
        self.agents.insert(spec.name.clone(), spec);
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one delegation. Boxed future: the parent loop calls this from
    /// inside its own `run`, and the sub-loop is the same machinery.
    pub fn run(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = DelegationReport> + Send + '_>> {
        Box::pin(self.run_inner(args, cancel))
    }

    async fn run_inner(&self, args: Value, cancel: CancellationToken) -> DelegationReport {
        let Some(agent_name) = args["agent"].as_str() else {
            return DelegationReport::failure("delegation requires an 'agent' field");
        };
        let Some(task) = args["task"].as_str() else {
            return DelegationReport::failure("delegation requires a 'task' field");
        };
        let Some(spec) = self.agents.get(agent_name) else {
            return DelegationReport::failure(format!(
                "unknown agent '{agent_name}'; available: {}",
                self.agent_names().join(", ")
            ));
        };
        let expect_plan = args["expectReturn"].as_str() == Some("plan");

        info!(agent = agent_name, "starting delegation");

        // Fresh, bounded context; nothing of the parent's leaks in.
        let mut context = ContextManager::new(
            ContextConfig::default().with_max_tokens(SUB_TOKEN_BUDGET),
        );
        let mut task_text = task.to_string();
        if let Some(ids) = args["elementIds"].as_array() {
            let ids: Vec<String> = ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            if !ids.is_empty() {
                task_text.push_str(&format!("\n\nFocus on these elements: {}", ids.join(", ")));
            }
        }
        if let Some(hint) = args["contextHint"].as_str() {
            task_text.push_str(&format!("\n\nContext hint: {hint}"));
        }

        // Whitelist: every adapter tool, never `delegate`. No nesting.
        let mut whitelist: HashSet<String> =
            self.adapter.available_actions().into_iter().collect();
        whitelist.remove(DELEGATE_TOOL);

        let config = SessionConfig {
            model: self.model.clone(),
            max_iterations: SUB_MAX_ITERATIONS,
            token_budget: SUB_TOKEN_BUDGET,
            system_prompt: Some(spec.system_prompt.clone()),
            ..Default::default()
        };

        // Harvest tool-call events to learn which ids the sub-agent touched.
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(64);
        let collector = tokio::spawn(async move {
            let mut created = Vec::new();
            let mut modified = Vec::new();
            while let Some(event) = event_rx.recv().await {
                if let EventKind::ToolCall { tool, input, .. } = &event.kind {
                    let ids = collect_arg_ids(&input);
                    if tool.starts_with("create") || tool.starts_with("add") {
                        created.extend(ids);
                    } else {
                        modified.extend(ids);
                    }
                }
            }
            (created, modified)
        });

        let executor = ToolExecutor::new(Arc::clone(&self.adapter), Arc::clone(&self.hooks));
        let outcome = {
            let mut sub_loop = ToadLoop::new(
                &mut context,
                self.provider.as_ref(),
                executor,
                Arc::clone(&self.hooks),
                config,
            )
            .with_cancel(cancel)
            .with_events(event_tx)
            .with_whitelist(whitelist);
            sub_loop.run(&task_text).await
        };
        // The loop dropped its sender; the collector finishes now.
        let (mut created_ids, mut modified_ids) = collector.await.unwrap_or_default();
        created_ids.sort();
        created_ids.dedup();
        modified_ids.sort();
        modified_ids.dedup();
        modified_ids.retain(|id| !created_ids.contains(id));

        if outcome.state != LoopState::Complete {
            warn!(agent = agent_name, state = %outcome.state, "delegation did not complete");
            let mut report = DelegationReport::failure(format!(
                "sub-agent ended in state '{}'",
                outcome.state
            ));
            report.tokens_used = outcome.usage.total();
            report.metrics.isolated_tokens = outcome.usage.total();
            return report;
        }

        let summary = bound_summary(&outcome.text);
        let plan = expect_plan.then(|| Plan::parse_from_text(&outcome.text)).flatten();

        let returned_tokens = estimate_str(&summary)
            + created_ids.iter().map(|s| estimate_str(s)).sum::<u32>()
            + modified_ids.iter().map(|s| estimate_str(s)).sum::<u32>();
        let estimated_inline_tokens = outcome.tool_calls * INLINE_TOKENS_PER_CALL;
        let savings_percent = if estimated_inline_tokens > 0 {
            (1.0 - returned_tokens as f32 / estimated_inline_tokens as f32).max(0.0) * 100.0
        } else {
            0.0
        };

        info!(
            agent = agent_name,
            isolated = outcome.usage.total(),
            returned = returned_tokens,
            savings = savings_percent,
            "delegation complete"
        );

        DelegationReport {
            success: true,
            summary,
            created_ids,
            modified_ids,
            tokens_used: outcome.usage.total(),
            metrics: DelegationMetrics {
                isolated_tokens: outcome.usage.total(),
                returned_tokens,
                estimated_inline_tokens,
                savings_percent,
            },
            plan,
            error: None,
        }
    }
}

/// Cap the summary at the return-payload budget.
fn bound_summary(text: &str) -> String {
    let cap_chars = SUMMARY_TOKEN_CAP * 4;
    if text.chars().count() <= cap_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(cap_chars).collect();
    out.push('…');
    out
}

fn collect_arg_ids(args: &Value) -> Vec<String> {
    let mut out = Vec::new();
    match args {
        Value::Object(map) => {
            for (k, v) in map {
                if k == "id" || k.ends_with("Id") || k.ends_with("_id") {
                    if let Value::String(s) = v {
                        out.push(s.clone());
                    }
                }
                out.extend(collect_arg_ids(v));
            }
        }
        Value::Array(items) => {
            for v in items {
                out.extend(collect_arg_ids(v));
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_excludes_nothing_but_declares_agents() {
        let schema = delegate_tool_schema();
        assert_eq!(schema["name"], DELEGATE_TOOL);
        assert!(schema["input_schema"]["required"]
            .as_array()
            .unwrap()
            .contains(&json!("task")));
        let expect: Vec<&str> = schema["input_schema"]["properties"]["expectReturn"]["enum"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(expect.contains(&"plan"));
    }

    #[test]
    fn plan_parses_from_surrounding_prose() {
        let text = r#"Here is the plan you asked for:
        {"id": "p1", "objective": "restyle header",
         "tasks": [{"id": "t1", "description": "read header", "state": "pending"}],
         "change_scope": {"creates": [], "updates": ["el-1"], "deletes": []}}
        Let me know if it needs changes."#;

        let plan = Plan::parse_from_text(text).unwrap();
        assert_eq!(plan.id, "p1");
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].state, PlanTaskState::Pending);
        assert_eq!(plan.change_scope.updates, vec!["el-1"]);
    }

    #[test]
    fn plan_parse_rejects_garbage() {
        assert!(Plan::parse_from_text("no json here").is_none());
        assert!(Plan::parse_from_text("{not valid json}").is_none());
    }

    #[test]
    fn summary_is_bounded() {
        let long = "word ".repeat(2_000);
        let bounded = bound_summary(&long);
        assert!(bounded.chars().count() <= SUMMARY_TOKEN_CAP * 4 + 1);
        assert!(bounded.ends_with('…'));

        assert_eq!(bound_summary("short"), "short");
    }

    #[test]
    fn report_payload_shape() {
        let report = DelegationReport {
            success: true,
            summary: "done".into(),
            created_ids: vec!["el-9".into()],
            modified_ids: vec![],
            tokens_used: 1234,
            metrics: DelegationMetrics {
                isolated_tokens: 1234,
                returned_tokens: 20,
                estimated_inline_tokens: 2400,
                savings_percent: 99.2,
            },
            plan: None,
            error: None,
        };
        let payload = report.to_payload();
        assert_eq!(payload["success"], true);
        assert_eq!(payload["createdIds"][0], "el-9");
        assert!(payload["metrics"]["savingsPercent"].as_f64().unwrap() > 99.0);
        assert!(payload.get("plan").is_none());
    }

    #[test]
    fn arg_id_collection_recurses() {
        let ids = collect_arg_ids(&json!({
            "elementId": "el-1",
            "children": [{"id": "el-2"}],
            "opts": {"target_id": "el-3"},
        }));
        assert_eq!(ids.len(), 3);
    }
}
