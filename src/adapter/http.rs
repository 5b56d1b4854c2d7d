use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::breaker::CircuitBreaker;
use super::retry::RetryPolicy;
use super::{ActionAdapter, ConnectionState, ExecuteOptions, SnapshotCache, StateOptions};
use crate::context::budget::estimate_str;
use crate::error::AdapterError;
use crate::types::{ActionResult, StateSnapshot};

/// Reference adapter configuration.
#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub base_url: String,
    /// Session binding id sent as `X-Canvas-Id`.
    pub binding_id: String,
    /// URI passed to `resources/read` to fetch backend state.
    pub state_uri: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,
}

impl HttpAdapterConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            binding_id: uuid::Uuid::new_v4().to_string(),
            state_uri: "state://current".into(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_binding_id(mut self, id: impl Into<String>) -> Self {
        self.binding_id = id.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A tool as discovered from the backend's `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub mutating: bool,
}

/// Request-level counters, exposed for harnesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterStats {
    pub requests: u64,
    pub retries: u64,
    pub failures: u64,
}

/// One attempt's failure, before retry classification.
struct RpcFailure {
    code: String,
    message: String,
    retryable: bool,
}

/// Reference adapter: JSON-RPC 2.0 over HTTP POST `/mcp`, health probe at
/// `/health`, retry with backoff, circuit breaker, 1-second state cache.
pub struct JsonRpcAdapter {
    config: HttpAdapterConfig,
    client: reqwest::Client,
    state: Mutex<ConnectionState>,
    actions: Mutex<Vec<ToolDescriptor>>,
    breaker: CircuitBreaker,
    cache: SnapshotCache,
    stats: Mutex<AdapterStats>,
}

impl JsonRpcAdapter {
    pub fn new(config: HttpAdapterConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_reset_timeout,
        );
        Self {
            config,
            client: reqwest::Client::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            actions: Mutex::new(Vec::new()),
            breaker,
            cache: SnapshotCache::default(),
            stats: Mutex::new(AdapterStats::default()),
        }
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    fn bump(&self, f: impl FnOnce(&mut AdapterStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// One JSON-RPC round-trip. No retries here; `execute` owns those.
    async fn call_once(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcFailure> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        self.bump(|s| s.requests += 1);
        let response = self
            .client
            .post(format!("{}/mcp", self.config.base_url))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("X-Canvas-Id", &self.config.binding_id)
            .timeout(timeout.unwrap_or(self.config.request_timeout))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcFailure {
                code: if e.is_timeout() {
                    "E_TIMEOUT".into()
                } else {
                    "E_NETWORK".into()
                },
                message: e.to_string(),
                retryable: true,
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| RpcFailure {
            code: "E_NETWORK".into(),
            message: e.to_string(),
            retryable: true,
        })?;

        if status >= 500 {
            return Err(RpcFailure {
                code: format!("E_HTTP_{status}"),
                message: format!("server error {status}"),
                retryable: true,
            });
        }
        if status != 200 {
            return Err(RpcFailure {
                code: format!("E_HTTP_{status}"),
                message: format!("unexpected status {status}: {text}"),
                retryable: false,
            });
        }

        let envelope: Value = serde_json::from_str(&text).map_err(|e| RpcFailure {
            code: "E_PARSE".into(),
            message: format!("malformed JSON-RPC response: {e}"),
            retryable: false,
        })?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(RpcFailure {
                code: format!("E_RPC_{}", error["code"].as_i64().unwrap_or(0)),
                message: error["message"].as_str().unwrap_or("rpc error").to_string(),
                retryable: false,
            });
        }

        Ok(envelope["result"].clone())
    }

    /// Flatten a `tools/call` result payload into an `ActionResult` data
    /// value: text content joined, structured content passed through.
    fn payload_of(result: &Value) -> Value {
        if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
            return structured.clone();
        }
        let texts: Vec<&str> = result["content"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| match p["type"].as_str() {
                        Some("text") => p["text"].as_str(),
                        Some("image") => Some("[image content]"),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if texts.is_empty() {
            result.clone()
        } else {
            Value::String(texts.join("\n"))
        }
    }

    /// Read-only names never invalidate state; everything else does.
    fn name_is_readonly(name: &str) -> bool {
        ["get_", "read_", "list_", "search_", "query_", "describe_", "inspect_"]
            .iter()
            .any(|p| name.starts_with(p))
            || ["screenshot", "health"].contains(&name)
    }
}

#[async_trait]
impl ActionAdapter for JsonRpcAdapter {
    async fn connect(&self) -> Result<bool, AdapterError> {
        if self.connection_state() == ConnectionState::Connected {
            return Ok(true);
        }
        self.set_state(ConnectionState::Connecting);

        // Health probe first, before any tool discovery.
        let health = self
            .client
            .get(format!("{}/health", self.config.base_url))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| {
                self.set_state(ConnectionState::Error);
                AdapterError::Transport(format!("health probe failed: {e}"))
            })?;
        let health_body: Value = health.json().await.map_err(|e| {
            self.set_state(ConnectionState::Error);
            AdapterError::Protocol(format!("bad health response: {e}"))
        })?;
        if health_body["status"] != "ok" {
            self.set_state(ConnectionState::Error);
            return Err(AdapterError::Protocol(format!(
                "backend unhealthy: {health_body}"
            )));
        }

        // Discover tools.
        let result = self
            .call_once("tools/list", json!({}), None)
            .await
            .map_err(|f| {
                self.set_state(ConnectionState::Error);
                AdapterError::Transport(f.message)
            })?;

        let tools: Vec<ToolDescriptor> = result["tools"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|t| {
                        let name = t["name"].as_str()?.to_string();
                        let mutating = match t["annotations"]["readOnlyHint"].as_bool() {
                            Some(read_only) => !read_only,
                            None => !Self::name_is_readonly(&name),
                        };
                        Some(ToolDescriptor {
                            description: t["description"].as_str().unwrap_or("").to_string(),
                            input_schema: t
                                .get("inputSchema")
                                .cloned()
                                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                            mutating,
                            name,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        info!(tools = tools.len(), base_url = %self.config.base_url, "adapter connected");
        if let Ok(mut actions) = self.actions.lock() {
            *actions = tools;
        }
        self.set_state(ConnectionState::Connected);
        Ok(true)
    }

    async fn disconnect(&self) {
        self.cache.invalidate();
        self.set_state(ConnectionState::Disconnected);
        debug!("adapter disconnected");
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Error)
    }

    async fn execute(&self, action: &str, params: Value, opts: ExecuteOptions) -> ActionResult {
        let started = tokio::time::Instant::now();

        if let Err(remaining) = self.breaker.check() {
            return ActionResult::fail(
                "E_CIRCUIT_OPEN",
                format!(
                    "circuit open after repeated failures; retry in {}s",
                    remaining.as_secs().max(1)
                ),
                true,
                started.elapsed().as_millis() as u64,
            );
        }

        let max_retries = opts.retries.unwrap_or(self.config.retry.max_retries);
        let params_value = json!({"name": action, "arguments": params});
        let mut retries_used = 0u32;

        let failure = loop {
            match self
                .call_once("tools/call", params_value.clone(), opts.timeout)
                .await
            {
                Ok(result) => {
                    self.breaker.record_success();
                    if self.is_mutating(action) {
                        self.cache.invalidate();
                    }

                    let duration_ms = started.elapsed().as_millis() as u64;
                    let mut out = if result["isError"].as_bool().unwrap_or(false) {
                        let message = match Self::payload_of(&result) {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        // isError from the backend is a domain failure, not
                        // a transport one.
                        ActionResult::fail("E_TOOL", message, true, duration_ms)
                    } else {
                        ActionResult::ok(Self::payload_of(&result), duration_ms)
                    };
                    out.metadata.retries = retries_used;
                    return out;
                }
                Err(f) => {
                    if f.retryable {
                        self.breaker.record_failure();
                    }
                    if f.retryable && retries_used < max_retries {
                        if self.breaker.check().is_err() {
                            break f;
                        }
                        let delay = self.config.retry.delay(retries_used);
                        warn!(
                            action,
                            attempt = retries_used + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %f.message,
                            "retrying adapter call"
                        );
                        retries_used += 1;
                        self.bump(|s| s.retries += 1);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break f;
                }
            }
        };

        self.bump(|s| s.failures += 1);
        let mut out = ActionResult::fail(
            failure.code,
            failure.message,
            failure.retryable,
            started.elapsed().as_millis() as u64,
        );
        out.metadata.retries = retries_used;
        out
    }

    fn available_actions(&self) -> Vec<String> {
        self.actions
            .lock()
            .map(|a| a.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    fn schema(&self, action: &str) -> Option<Value> {
        self.actions.lock().ok()?.iter().find_map(|t| {
            (t.name == action).then(|| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
        })
    }

    fn is_mutating(&self, action: &str) -> bool {
        self.actions
            .lock()
            .ok()
            .and_then(|a| a.iter().find(|t| t.name == action).map(|t| t.mutating))
            .unwrap_or_else(|| !Self::name_is_readonly(action))
    }

    async fn get_state(&self, _opts: StateOptions) -> Result<StateSnapshot, AdapterError> {
        if let Some(cached) = self.cache.get() {
            return Ok(cached);
        }

        let result = self
            .call_once(
                "resources/read",
                json!({"uri": self.config.state_uri}),
                None,
            )
            .await
            .map_err(|f| AdapterError::Transport(f.message))?;

        // MCP resource read: {contents: [{uri, text|json}]}. Fall back to the
        // raw result if the backend answers with a bare object.
        let raw = result["contents"]
            .as_array()
            .and_then(|c| c.first())
            .and_then(|entry| {
                entry["text"]
                    .as_str()
                    .and_then(|t| serde_json::from_str::<Value>(t).ok())
                    .or_else(|| entry.get("json").cloned())
            })
            .unwrap_or(result);

        let data = raw.as_object().cloned().unwrap_or_default();
        let summary = data
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "state with {} top-level entries",
                    data.keys().len()
                )
            });
        let tokens_used = estimate_str(&Value::Object(data.clone()).to_string());

        let snapshot = StateSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            version: data.get("version").and_then(Value::as_u64),
            summary,
            data,
            tokens_used,
        };
        self.cache.put(snapshot.clone());
        Ok(snapshot)
    }

    async fn abort_inflight(&self) {
        // reqwest aborts in-flight requests when their futures drop; the
        // loop drops them on cancellation. Nothing extra to do here.
    }
}
