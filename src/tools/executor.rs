use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::schema::validate_args;
use crate::adapter::{ActionAdapter, ExecuteOptions};
use crate::error::ToolError;
use crate::hooks::{HookAction, HookContext, HookPoint, HooksManager};
use crate::types::ActionResult;

/// Validates, runs pre-hooks, dispatches through the adapter, runs
/// post-hooks. Cheap to clone; shares the adapter and hooks.
#[derive(Clone)]
pub struct ToolExecutor {
    adapter: Arc<dyn ActionAdapter>,
    hooks: Arc<HooksManager>,
    timeout: Option<Duration>,
    retries: Option<u32>,
}

/// The executor's result: the action outcome plus any non-critical hook
/// failures the loop should surface as error events.
#[derive(Debug)]
pub struct ExecutionReport {
    pub result: ActionResult,
    pub hook_failures: Vec<(String, String)>,
}

impl ToolExecutor {
    pub fn new(adapter: Arc<dyn ActionAdapter>, hooks: Arc<HooksManager>) -> Self {
        Self {
            adapter,
            hooks,
            timeout: None,
            retries: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the adapter's retry budget per call.
    pub fn with_retries(mut self, retries: Option<u32>) -> Self {
        self.retries = retries;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn ActionAdapter> {
        &self.adapter
    }

    /// Run one tool call end to end. Schema violations and hook aborts are
    /// `ToolError`s; adapter-level failures come back inside the report.
    pub async fn run(
        &self,
        tool: &str,
        args: Value,
        iteration: u32,
    ) -> Result<ExecutionReport, ToolError> {
        if !self.adapter.supports(tool) {
            return Err(ToolError::Unknown(tool.to_string()));
        }
        if let Some(schema) = self.adapter.schema(tool) {
            validate_args(&schema["input_schema"], &args).map_err(|reason| {
                ToolError::InvalidArguments {
                    tool: tool.to_string(),
                    reason,
                }
            })?;
        }

        let mut hook_failures = Vec::new();
        let pre_context = HookContext {
            tool: Some(tool.to_string()),
            input: Some(args.clone()),
            iteration,
            ..Default::default()
        };
        let pre = self
            .hooks
            .dispatch(HookPoint::PreToolUse, &pre_context)
            .await
            .map_err(|reason| ToolError::HookAborted {
                hook: "pre-tool-use".into(),
                tool: tool.to_string(),
                reason,
            })?;
        hook_failures.extend(pre.failures);

        let result = match pre.action {
            HookAction::Abort { reason } => {
                return Err(ToolError::HookAborted {
                    hook: "pre-tool-use".into(),
                    tool: tool.to_string(),
                    reason,
                });
            }
            HookAction::Skip => {
                debug!(tool, "tool call skipped by hook");
                ActionResult::ok(Value::String("[skipped by hook]".into()), 0)
            }
            HookAction::Continue => {
                self.adapter
                    .execute(
                        tool,
                        args.clone(),
                        ExecuteOptions {
                            timeout: self.timeout,
                            retries: self.retries,
                        },
                    )
                    .await
            }
        };

        let post_context = HookContext {
            tool: Some(tool.to_string()),
            input: Some(args),
            output: Some(result.output_text()),
            error: result.error.as_ref().map(|e| e.message.clone()),
            iteration,
        };
        let post = self
            .hooks
            .dispatch(HookPoint::PostToolUse, &post_context)
            .await
            .map_err(|reason| ToolError::HookAborted {
                hook: "post-tool-use".into(),
                tool: tool.to_string(),
                reason,
            })?;
        hook_failures.extend(post.failures);

        Ok(ExecutionReport {
            result,
            hook_failures,
        })
    }
}
