pub mod adapter;
pub mod alias;
pub mod config;
pub mod context;
pub mod delegate;
pub mod error;
pub mod events;
pub mod hooks;
pub mod provider;
pub mod session;
pub mod toad;
pub mod tools;
pub mod types;

pub use adapter::http::{HttpAdapterConfig, JsonRpcAdapter};
pub use adapter::{ActionAdapter, ConnectionState, ExecuteOptions, StateOptions};
pub use alias::{AliasDefinition, AliasRegistry, AliasResolver, ResolveContext, ResolvedAlias};
pub use config::{ModelChoice, SessionConfig};
pub use context::{ContextConfig, ContextManager, PrepareOptions};
pub use delegate::{AgentSpec, DelegationReport, Delegator, Plan};
pub use error::{AdapterError, AliasError, EngineError, ProviderError, ToolError};
pub use events::{Event, EventKind, FailureReason};
pub use hooks::{Hook, HookAction, HookContext, HookOutcome, HookPoint, HooksManager};
pub use provider::{AnthropicProvider, OpenAiProvider, Provider};
pub use session::{
    run_task, FileSessionStore, HistoryEntry, NoSessionStore, Session, SessionStats, SessionStore,
};
pub use toad::{LoopState, TaskOutcome, ToadLoop};
pub use tools::ToolExecutor;
pub use types::{
    ActionResult, Awareness, ContentBlock, InferenceRequest, InferenceResponse, Message,
    StateSnapshot, StopReason, Usage,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    // --- Mock Provider -----------------------------------------------------

    struct MockProvider {
        responses: Mutex<VecDeque<Result<InferenceResponse, ProviderError>>>,
        requests: std::sync::Mutex<Vec<InferenceRequest>>,
        parallel: bool,
    }

    impl MockProvider {
        fn new(responses: Vec<InferenceResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(Ok).collect()),
                requests: std::sync::Mutex::new(Vec::new()),
                parallel: false,
            })
        }

        fn with_results(
            results: Vec<Result<InferenceResponse, ProviderError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(results.into_iter().collect()),
                requests: std::sync::Mutex::new(Vec::new()),
                parallel: false,
            })
        }

        fn requests(&self) -> Vec<InferenceRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        async fn generate(
            &self,
            request: InferenceRequest,
        ) -> Result<InferenceResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(ProviderError::Request("no more mock responses".into())))
        }

        fn supports_parallel_tools(&self) -> bool {
            self.parallel
        }
    }

    fn text_response(text: &str) -> InferenceResponse {
        InferenceResponse {
            stop_reason: StopReason::EndTurn,
            content: vec![ContentBlock::Text { text: text.into() }],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    fn tool_response(calls: Vec<(&str, &str, Value)>) -> InferenceResponse {
        InferenceResponse {
            stop_reason: StopReason::ToolUse,
            content: calls
                .into_iter()
                .map(|(id, name, input)| ContentBlock::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input,
                })
                .collect(),
            usage: Usage {
                input_tokens: 20,
                output_tokens: 10,
            },
        }
    }

    // --- Mock Adapter ------------------------------------------------------

    struct MockAdapter {
        tools: Vec<(String, Value, bool)>,
        results: Mutex<VecDeque<ActionResult>>,
        executes: AtomicUsize,
        state_fetches: AtomicUsize,
        snapshot_data: serde_json::Map<String, Value>,
    }

    impl MockAdapter {
        fn new(tools: Vec<(&str, bool)>) -> Arc<Self> {
            let tools = tools
                .into_iter()
                .map(|(name, mutating)| {
                    (
                        name.to_string(),
                        json!({
                            "name": name,
                            "description": format!("The {name} tool"),
                            "input_schema": {"type": "object", "properties": {
                                "selector": {"type": "string"},
                                "id": {"type": "string"},
                            }},
                        }),
                        mutating,
                    )
                })
                .collect();
            Arc::new(Self {
                tools,
                results: Mutex::new(VecDeque::new()),
                executes: AtomicUsize::new(0),
                state_fetches: AtomicUsize::new(0),
                snapshot_data: serde_json::Map::from_iter([(
                    "elements".to_string(),
                    json!([{"id": "el-1"}]),
                )]),
            })
        }

        async fn queue_result(&self, result: ActionResult) {
            self.results.lock().await.push_back(result);
        }
    }

    #[async_trait]
    impl ActionAdapter for MockAdapter {
        async fn connect(&self) -> Result<bool, AdapterError> {
            Ok(true)
        }

        async fn disconnect(&self) {}

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        async fn execute(
            &self,
            _action: &str,
            _params: Value,
            _opts: ExecuteOptions,
        ) -> ActionResult {
            self.executes.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| ActionResult::ok(json!("ok"), 2))
        }

        fn available_actions(&self) -> Vec<String> {
            self.tools.iter().map(|(n, _, _)| n.clone()).collect()
        }

        fn schema(&self, action: &str) -> Option<Value> {
            self.tools
                .iter()
                .find(|(n, _, _)| n == action)
                .map(|(_, s, _)| s.clone())
        }

        fn is_mutating(&self, action: &str) -> bool {
            self.tools
                .iter()
                .find(|(n, _, _)| n == action)
                .map(|(_, _, m)| *m)
                .unwrap_or(false)
        }

        async fn get_state(&self, _opts: StateOptions) -> Result<StateSnapshot, AdapterError> {
            self.state_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(StateSnapshot {
                id: "snap".into(),
                timestamp: chrono::Utc::now(),
                summary: "1 element".into(),
                version: Some(1),
                data: self.snapshot_data.clone(),
                tokens_used: 5,
            })
        }
    }

    fn session_with(
        adapter: Arc<MockAdapter>,
        provider: Arc<MockProvider>,
        config: SessionConfig,
    ) -> Session {
        Session::new(adapter, provider, config)
    }

    async fn collect_events(mut rx: tokio::sync::mpsc::Receiver<Event>) -> Vec<EventKind> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event.kind);
        }
        out
    }

    // --- Scenarios ---------------------------------------------------------

    #[tokio::test]
    async fn smoke_text_only_task() {
        let provider = MockProvider::new(vec![text_response("Hello!")]);
        let adapter = MockAdapter::new(vec![("get_text", false)]);
        let mut session = session_with(adapter, provider, SessionConfig::default());
        session.connect().await.unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let outcome = session.run("hello", tx).await;
        let events = collect_events(rx).await;

        assert_eq!(outcome.state, LoopState::Complete);
        assert_eq!(outcome.text, "Hello!");
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.tool_calls, 0);

        assert!(events.len() <= 6, "too many events: {}", events.len());
        assert!(matches!(events[0], EventKind::System { .. }));
        assert!(matches!(events[1], EventKind::Iteration { n: 1 }));
        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "exactly one terminal event");
        assert!(events.last().unwrap().is_terminal(), "terminal event is last");
    }

    #[tokio::test]
    async fn single_tool_call_flow() {
        let provider = MockProvider::new(vec![
            tool_response(vec![("call_1", "click", json!({"selector": "#submit"}))]),
            text_response("Clicked it."),
        ]);
        let adapter = MockAdapter::new(vec![("click", true)]);
        let mut session = session_with(adapter.clone(), provider, SessionConfig::default());
        session.connect().await.unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let outcome = session.run("click #submit", tx).await;
        let events = collect_events(rx).await;

        assert_eq!(outcome.state, LoopState::Complete);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(adapter.executes.load(Ordering::SeqCst), 1);
        // Mutating call → one state refresh during observe.
        assert_eq!(adapter.state_fetches.load(Ordering::SeqCst), 1);

        let call_pos = events
            .iter()
            .position(|e| matches!(e, EventKind::ToolCall { tool, .. } if tool == "click"))
            .unwrap();
        let result_pos = events
            .iter()
            .position(|e| matches!(e, EventKind::ToolResult { success: true, .. }))
            .unwrap();
        assert!(call_pos < result_pos, "toolCall precedes toolResult");
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn termination_iteration_cap() {
        // Model never stops calling tools.
        let responses: Vec<InferenceResponse> = (0..10)
            .map(|i| tool_response(vec![(&format!("c{i}"), "click", json!({"selector": "#x"}))]))
            .collect();
        let provider = MockProvider::new(responses);
        let adapter = MockAdapter::new(vec![("click", false)]);
        let mut session = session_with(
            adapter,
            provider,
            SessionConfig {
                max_iterations: 3,
                ..Default::default()
            },
        );

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let outcome = session.run("never stop", tx).await;
        let events = collect_events(rx).await;

        assert_eq!(outcome.state, LoopState::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::IterationCap));
        assert_eq!(outcome.turns, 3);
        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(
            events.last().unwrap(),
            EventKind::Failed {
                reason: FailureReason::IterationCap,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn termination_budget_exhausted() {
        let provider = MockProvider::new(vec![
            tool_response(vec![("c1", "click", json!({"selector": "#x"}))]),
            text_response("should never be reached"),
        ]);
        let adapter = MockAdapter::new(vec![("click", false)]);
        let mut session = session_with(
            adapter,
            provider,
            SessionConfig {
                token_budget: 25,
                ..Default::default()
            },
        );

        let outcome = session.execute("expensive").await;
        assert_eq!(outcome.state, LoopState::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::BudgetExhausted));
    }

    #[tokio::test]
    async fn termination_error_cap_on_provider_failures() {
        let provider = MockProvider::with_results(vec![
            Err(ProviderError::Api {
                status: 500,
                body: "boom".into(),
            }),
            Err(ProviderError::Api {
                status: 500,
                body: "boom".into(),
            }),
            Err(ProviderError::Api {
                status: 500,
                body: "boom".into(),
            }),
        ]);
        let adapter = MockAdapter::new(vec![]);
        let mut session = session_with(adapter, provider, SessionConfig::default());

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let outcome = session.run("doomed", tx).await;
        let events = collect_events(rx).await;

        assert_eq!(outcome.state, LoopState::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::ErrorCap));
        let errors = events
            .iter()
            .filter(|e| matches!(e, EventKind::Error { .. }))
            .count();
        assert_eq!(errors, 3);
    }

    #[tokio::test]
    async fn cancellation_before_work() {
        let provider = MockProvider::new(vec![text_response("never")]);
        let adapter: Arc<dyn ActionAdapter> = MockAdapter::new(vec![]);
        let hooks = Arc::new(HooksManager::new());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let mut context = ContextManager::new(ContextConfig::default());
        let executor = ToolExecutor::new(Arc::clone(&adapter), Arc::clone(&hooks));
        let mut toad = ToadLoop::new(
            &mut context,
            provider.as_ref(),
            executor,
            hooks,
            SessionConfig::default(),
        )
        .with_cancel(cancel)
        .with_events(tx);
        let outcome = toad.run("anything").await;
        drop(toad);
        let events = collect_events(rx).await;

        assert_eq!(outcome.state, LoopState::Cancelled);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EventKind::Cancelled { .. }));
        // Nothing was committed to context beyond the task itself.
        assert_eq!(context.message_count(), 1);
        // The provider was never consulted.
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn echo_poisoning_surfaces_and_corrects() {
        let provider = MockProvider::new(vec![
            tool_response(vec![("c1", "click", json!({"selector": "#gone"}))]),
            tool_response(vec![("c2", "click", json!({"selector": "#gone"}))]),
            tool_response(vec![("c3", "click", json!({"selector": "#gone"}))]),
            text_response("I will stop clicking that."),
        ]);
        let adapter = MockAdapter::new(vec![("click", false)]);
        for _ in 0..3 {
            adapter
                .queue_result(ActionResult::fail("E_TOOL", "no such element", true, 1))
                .await;
        }
        let mut session = session_with(adapter, provider.clone(), SessionConfig::default());

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let outcome = session.run("click the ghost", tx).await;
        let events = collect_events(rx).await;

        assert_eq!(outcome.state, LoopState::Complete);

        let detections: Vec<(u32, crate::context::hygiene::Severity)> = events
            .iter()
            .filter_map(|e| match e {
                EventKind::LoopDetection {
                    count, severity, ..
                } => Some((*count, *severity)),
                _ => None,
            })
            .collect();
        assert_eq!(detections.len(), 2);
        assert_eq!(
            detections[0],
            (2, crate::context::hygiene::Severity::Warning)
        );
        assert_eq!(
            detections[1],
            (3, crate::context::hygiene::Severity::Critical)
        );

        // The fourth request carries the injected correction.
        let requests = provider.requests();
        let last = requests.last().unwrap();
        let corrected = last
            .messages
            .iter()
            .chain(std::iter::once(&json!({"content": last.system})))
            .any(|m| {
                m["content"]
                    .as_str()
                    .is_some_and(|c| c.contains("repeated_error"))
            });
        assert!(corrected, "correction missing from final request");
    }

    #[tokio::test]
    async fn delegation_isolates_sub_agent_context() {
        let summary_words = (0..120).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let provider = MockProvider::new(vec![
            // Parent turn 1: delegate.
            tool_response(vec![(
                "c1",
                "delegate",
                json!({"agent": "planner", "task": "break this down"}),
            )]),
            // Sub-agent: three reads, then a summary.
            tool_response(vec![("s1", "read_state", json!({"id": "el-1"}))]),
            tool_response(vec![("s2", "read_state", json!({"id": "el-1"}))]),
            tool_response(vec![("s3", "read_state", json!({"id": "el-1"}))]),
            text_response(&summary_words),
            // Parent turn 2: done.
            text_response("Plan received."),
        ]);
        let adapter = MockAdapter::new(vec![("read_state", false)]);
        for _ in 0..3 {
            adapter
                .queue_result(ActionResult::ok(json!("SUB_DETAIL: very long internals"), 2))
                .await;
        }
        let mut session = session_with(adapter, provider, SessionConfig::default());

        let outcome = session.execute("plan the work").await;
        assert_eq!(outcome.state, LoopState::Complete);
        assert_eq!(outcome.text, "Plan received.");

        // Parent context: task, delegate call, delegation summary, final answer.
        assert_eq!(session.context().message_count(), 4);

        // None of the sub-agent's tool output leaked across the boundary.
        let parent_dump = session.context().to_snapshot().to_string();
        assert!(
            !parent_dump.contains("SUB_DETAIL"),
            "sub-agent internals crossed the isolation boundary"
        );
        // The bounded report did.
        assert!(parent_dump.contains("savingsPercent"));
        assert!(parent_dump.contains("w119"));
    }

    #[tokio::test]
    async fn delegation_unknown_agent_fails_softly() {
        let provider = MockProvider::new(vec![
            tool_response(vec![(
                "c1",
                "delegate",
                json!({"agent": "wizard", "task": "magic"}),
            )]),
            text_response("No such agent, moving on."),
        ]);
        let adapter = MockAdapter::new(vec![]);
        let mut session = session_with(adapter, provider, SessionConfig::default());

        let outcome = session.execute("try magic").await;
        assert_eq!(outcome.state, LoopState::Complete);

        let dump = session.context().to_snapshot().to_string();
        assert!(dump.contains("unknown agent"));
    }

    #[tokio::test]
    async fn user_task_aliases_resolve_into_context() {
        struct SelectionResolver;

        #[async_trait]
        impl AliasResolver for SelectionResolver {
            async fn resolve(
                &self,
                _args: &[String],
                _context: &ResolveContext,
            ) -> Result<ResolvedAlias, String> {
                Ok(ResolvedAlias {
                    summary: "3 elements selected".into(),
                    value: "Selected elements:\n- el-1\n- el-2\n- el-3".into(),
                    token_estimate: 12,
                })
            }
        }

        let mut aliases = AliasRegistry::new();
        aliases.register(
            AliasDefinition::new("selection", "current selection"),
            SelectionResolver,
        );

        let provider = MockProvider::new(vec![text_response("Working with those.")]);
        let adapter = MockAdapter::new(vec![]);
        let mut session = session_with(adapter, provider.clone(), SessionConfig::default())
            .with_aliases(aliases);

        let outcome = session.execute("restyle @selection now").await;
        assert_eq!(outcome.state, LoopState::Complete);

        let requests = provider.requests();
        let dump = serde_json::to_string(&requests[0].messages).unwrap();
        // The inline summary replaced the alias in the task text.
        assert!(dump.contains("restyle [3 elements selected] now"));
        assert!(!dump.contains("@selection"));
        // The full value block rode along as a resource.
        assert!(dump.contains("el-2"));
    }

    #[tokio::test]
    async fn multi_turn_context_carries_over() {
        let provider = MockProvider::new(vec![
            text_response("First answer."),
            text_response("Second answer."),
        ]);
        let adapter = MockAdapter::new(vec![]);
        let mut session = session_with(adapter, provider.clone(), SessionConfig::default());

        session.execute("first question").await;
        session.execute("second question").await;

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        // Turn 2 sees turn 1's history.
        assert!(requests[1].messages.len() > requests[0].messages.len());
        let dump = serde_json::to_string(&requests[1].messages).unwrap();
        assert!(dump.contains("first question"));
        assert!(dump.contains("First answer."));

        let stats = session.stats();
        assert_eq!(stats.tasks_executed, 2);
        assert!(stats.tokens_used > 0);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn schema_violation_counts_as_hard_error() {
        let provider = MockProvider::new(vec![
            // selector must be a string.
            tool_response(vec![("c1", "click", json!({"selector": 42}))]),
            text_response("corrected"),
        ]);
        let adapter = MockAdapter::new(vec![("click", false)]);
        let mut session = session_with(adapter.clone(), provider, SessionConfig::default());

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let outcome = session.run("click it", tx).await;
        let events = collect_events(rx).await;

        assert_eq!(outcome.state, LoopState::Complete);
        // Validation failed before the adapter was reached.
        assert_eq!(adapter.executes.load(Ordering::SeqCst), 0);
        assert!(events
            .iter()
            .any(|e| matches!(e, EventKind::Error { recoverable: false, .. })));
    }

    #[tokio::test]
    async fn compression_under_sustained_load() {
        // S5 at scale: far more content than the window allows.
        let mut ctx = ContextManager::new(ContextConfig {
            max_tokens: 50_000,
            response_reserve: 0,
            tool_reserve: 0,
            ..Default::default()
        });
        ctx.add_system("the rules");
        for i in 0..300 {
            ctx.add_assistant(format!("message {i}: {}", "tokenful content ".repeat(120)));
        }

        let prepared = ctx.prepare_for_request(PrepareOptions::default());
        assert!(
            prepared.total_tokens <= 50_000,
            "window exceeded: {}",
            prepared.total_tokens
        );
        let stats = ctx.stats();
        assert!(stats.compressions > 0, "no compression happened");
        assert_eq!(stats.memory.tiers["system"].messages, 1);

        // Token conservation still holds after all that churn.
        let tier_sum: u32 = stats.memory.tiers.values().map(|t| t.tokens).sum();
        assert_eq!(stats.memory.total_tokens, tier_sum);
    }

    #[tokio::test]
    async fn session_save_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockProvider::new(vec![text_response("remembered")]);
        let adapter = MockAdapter::new(vec![]);
        let mut session = session_with(adapter, provider, SessionConfig::default())
            .with_id("persist-test")
            .with_store(FileSessionStore::new(dir.path()));

        session.execute("remember me").await;
        session.save().await.unwrap();

        let provider2 = MockProvider::new(vec![]);
        let adapter2 = MockAdapter::new(vec![]);
        let mut restored = session_with(adapter2, provider2, SessionConfig::default())
            .with_id("persist-test")
            .with_store(FileSessionStore::new(dir.path()));
        assert!(restored.restore().await.unwrap());

        assert_eq!(restored.stats().tasks_executed, 1);
        let dump = restored.context().to_snapshot().to_string();
        assert!(dump.contains("remember me"));
        assert!(dump.contains("remembered"));
    }
}
