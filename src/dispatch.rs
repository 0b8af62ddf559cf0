//! Tool dispatch table, the bridge's public entry point.
//!
//! Maps each registered tool name to one behavior:
//! - `PassThrough`: forward verbatim, return the raw payload
//! - `UniversalSearch` / `UniversalFetch`: forward, then normalize
//! - `BatchFanout`: split a list argument into independent calls
//! - `Ping`: answered locally
//!
//! Unknown names and malformed arguments are rejected before any network
//! activity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{BridgeConfig, TransportKind};
use crate::errors::{BridgeError, DispatchKind, ErrorBody};
use crate::normalize::{normalize_fetch, normalize_search, CanonicalResult, NormalizedSearchResponse};
use crate::upstream::translator::json_type_name;
use crate::upstream::{
    translate, HttpTransport, RawPayload, SseTransport, ToolCall, Transport, UpstreamSession,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Title used by the default `fetch` tool when the upstream gives none.
pub const DEFAULT_FETCH_TITLE: &str = "BrightData fetch via scrape";

fn default_url_arg() -> String {
    "url".to_string()
}
fn default_fetch_title() -> String {
    DEFAULT_FETCH_TITLE.to_string()
}

// ─── Tool table ──────────────────────────────────────────────────────────────

/// What a registered tool does with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum ToolBehavior {
    PassThrough,
    UniversalSearch,
    UniversalFetch {
        /// Upstream argument that receives the requested id.
        #[serde(default = "default_url_arg")]
        url_arg: String,
        #[serde(default = "default_fetch_title")]
        fallback_title: String,
    },
    BatchFanout {
        /// List-valued argument to split.
        list_arg: String,
        /// Argument each item is placed under in its sub-call.
        item_arg: String,
    },
    Ping,
}

/// One registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    /// Upstream tool to invoke; defaults to `name`.
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(flatten)]
    pub behavior: ToolBehavior,
    #[serde(default)]
    pub description: String,
}

impl ToolEntry {
    pub fn new(name: &str, upstream: &str, behavior: ToolBehavior, description: &str) -> Self {
        Self {
            name: name.to_string(),
            upstream: Some(upstream.to_string()),
            behavior,
            description: description.to_string(),
        }
    }

    pub fn upstream_tool(&self) -> &str {
        self.upstream.as_deref().unwrap_or(&self.name)
    }
}

/// Closed registry of tool names → entries.
#[derive(Debug, Clone)]
pub struct ToolTable {
    tools: HashMap<String, ToolEntry>,
}

impl ToolTable {
    /// Build a table, rejecting duplicate or blank names.
    pub fn from_entries(entries: Vec<ToolEntry>) -> Result<Self, BridgeError> {
        let mut tools = HashMap::new();
        for entry in entries {
            if entry.name.trim().is_empty() {
                return Err(BridgeError::Config {
                    reason: "tool names must not be empty".into(),
                });
            }
            if let ToolBehavior::BatchFanout { list_arg, item_arg } = &entry.behavior {
                if list_arg.is_empty() || item_arg.is_empty() {
                    return Err(BridgeError::Config {
                        reason: format!("batch tool '{}' needs list_arg and item_arg", entry.name),
                    });
                }
            }
            if tools.contains_key(&entry.name) {
                return Err(BridgeError::Config {
                    reason: format!("tool '{}' registered twice", entry.name),
                });
            }
            tools.insert(entry.name.clone(), entry);
        }
        Ok(Self { tools })
    }

    /// The built-in BrightData tool surface.
    pub fn with_defaults() -> Self {
        let fetch = ToolBehavior::UniversalFetch {
            url_arg: default_url_arg(),
            fallback_title: default_fetch_title(),
        };
        let entries = vec![
            ToolEntry {
                name: "ping".into(),
                upstream: None,
                behavior: ToolBehavior::Ping,
                description: "Confirms the bridge is reachable.".into(),
            },
            ToolEntry::new(
                "search",
                "search_engine",
                ToolBehavior::UniversalSearch,
                "Web search returning {results: [{id, title, url}]}.",
            ),
            ToolEntry::new(
                "fetch",
                "scrape_as_markdown",
                fetch,
                "Fetch one document by id (URL) as {id, title, url, text}.",
            ),
            ToolEntry::new(
                "search_engine",
                "search_engine",
                ToolBehavior::PassThrough,
                "Raw search engine results.",
            ),
            ToolEntry::new(
                "scrape_as_markdown",
                "scrape_as_markdown",
                ToolBehavior::PassThrough,
                "Scrape a page as Markdown.",
            ),
            ToolEntry::new(
                "scrape_as_html",
                "scrape_as_html",
                ToolBehavior::PassThrough,
                "Scrape a page as HTML.",
            ),
            ToolEntry::new(
                "search_engine_batch",
                "search_engine",
                ToolBehavior::BatchFanout {
                    list_arg: "queries".into(),
                    item_arg: "query".into(),
                },
                "Run several searches; one result or error per query.",
            ),
            ToolEntry::new(
                "scrape_batch",
                "scrape_as_markdown",
                ToolBehavior::BatchFanout {
                    list_arg: "urls".into(),
                    item_arg: "url".into(),
                },
                "Scrape several pages; one result or error per URL.",
            ),
        ];
        let tools = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.tools.get(name)
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.tool_names()
            .into_iter()
            .filter_map(|n| self.tools.get(n))
            .map(|e| (e.name.clone(), e.description.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

/// One entry of a fan-out result. Failures are markers, not aborts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub index: usize,
    pub input: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RawPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Whatever a tool returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DispatchOutput {
    Raw(RawPayload),
    Search(NormalizedSearchResponse),
    Fetch(CanonicalResult),
    Batch(Vec<BatchItem>),
    Text(String),
}

// ─── Bridge ──────────────────────────────────────────────────────────────────

/// Dispatch tuning.
#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    pub call_timeout: Duration,
    pub batch_concurrency: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            batch_concurrency: 4,
        }
    }
}

/// The tool-invocation bridge.
pub struct Bridge {
    table: ToolTable,
    session: Arc<UpstreamSession>,
    options: BridgeOptions,
}

impl Bridge {
    pub fn new(table: ToolTable, session: Arc<UpstreamSession>, options: BridgeOptions) -> Self {
        Self {
            table,
            session,
            options: BridgeOptions {
                batch_concurrency: options.batch_concurrency.max(1),
                ..options
            },
        }
    }

    /// Build the transport, session and table a config describes.
    ///
    /// Does not connect; the session opens on the first forwarded call.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Http => Arc::new(HttpTransport::new(&config.endpoint, &config.credential)?),
            TransportKind::Sse => Arc::new(SseTransport::new(
                &config.endpoint,
                &config.credential,
                config.multiplex,
            )?),
        };
        let session = Arc::new(UpstreamSession::new(transport, config.session_options()));

        let table = match &config.tools {
            Some(entries) => ToolTable::from_entries(entries.clone())?,
            None => ToolTable::with_defaults(),
        };

        Ok(Self::new(
            table,
            session,
            BridgeOptions {
                call_timeout: config.call_timeout(),
                batch_concurrency: config.batch_concurrency,
            },
        ))
    }

    pub fn table(&self) -> &ToolTable {
        &self.table
    }

    pub fn session(&self) -> &Arc<UpstreamSession> {
        &self.session
    }

    /// Invoke a tool with the default timeout.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Result<DispatchOutput, BridgeError> {
        self.dispatch_with_timeout(name, arguments, None).await
    }

    /// Invoke a tool, overriding the per-call timeout when `timeout` is set.
    pub async fn dispatch_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<DispatchOutput, BridgeError> {
        let entry = self.table.get(name).ok_or_else(|| BridgeError::Dispatch {
            kind: DispatchKind::UnknownTool,
            name: name.to_string(),
        })?;
        let timeout = timeout.unwrap_or(self.options.call_timeout);
        let start = Instant::now();

        let result = match &entry.behavior {
            ToolBehavior::Ping => Ok(DispatchOutput::Text("pong".into())),
            ToolBehavior::PassThrough => self
                .forward(ToolCall::new(entry.upstream_tool(), arguments), timeout)
                .await
                .map(DispatchOutput::Raw),
            ToolBehavior::UniversalSearch => self.search(entry, arguments, timeout).await,
            ToolBehavior::UniversalFetch {
                url_arg,
                fallback_title,
            } => {
                self.fetch(entry, arguments, url_arg, fallback_title, timeout)
                    .await
            }
            ToolBehavior::BatchFanout { list_arg, item_arg } => {
                self.fan_out(entry, arguments, list_arg, item_arg, timeout)
                    .await
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(tool = %name, elapsed_ms, "tool call succeeded"),
            Err(e) => tracing::warn!(
                tool = %name,
                elapsed_ms,
                tag = e.tag(),
                error = %e,
                "tool call failed"
            ),
        }
        result
    }

    /// Close the upstream session, cancelling anything in flight.
    pub async fn shutdown(&self) {
        self.session.close().await;
    }

    // ─── Handlers ────────────────────────────────────────────────────────

    async fn forward(&self, call: ToolCall, timeout: Duration) -> Result<RawPayload, BridgeError> {
        let request = translate(&call)?;
        self.session.call(request, timeout).await
    }

    async fn search(
        &self,
        entry: &ToolEntry,
        arguments: Value,
        timeout: Duration,
    ) -> Result<DispatchOutput, BridgeError> {
        required_str(&entry.name, &arguments, "query")?;
        let payload = self
            .forward(ToolCall::new(entry.upstream_tool(), arguments), timeout)
            .await?;
        Ok(DispatchOutput::Search(normalize_search(&payload)))
    }

    async fn fetch(
        &self,
        entry: &ToolEntry,
        arguments: Value,
        url_arg: &str,
        fallback_title: &str,
        timeout: Duration,
    ) -> Result<DispatchOutput, BridgeError> {
        let id = required_str(&entry.name, &arguments, "id")?;

        let mut upstream_args = object_args(&entry.name, arguments)?;
        upstream_args.remove("id");
        upstream_args.insert(url_arg.to_string(), Value::String(id.clone()));

        let payload = self
            .forward(
                ToolCall::new(entry.upstream_tool(), Value::Object(upstream_args)),
                timeout,
            )
            .await?;
        Ok(DispatchOutput::Fetch(normalize_fetch(&payload, &id, fallback_title)))
    }

    async fn fan_out(
        &self,
        entry: &ToolEntry,
        arguments: Value,
        list_arg: &str,
        item_arg: &str,
        timeout: Duration,
    ) -> Result<DispatchOutput, BridgeError> {
        let mut base = object_args(&entry.name, arguments)?;
        let items = match base.remove(list_arg) {
            Some(Value::Array(items)) if !items.is_empty() => items,
            Some(Value::Array(_)) => {
                return Err(BridgeError::validation(format!(
                    "'{list_arg}' for '{}' must not be empty",
                    entry.name
                )))
            }
            Some(other) => {
                return Err(BridgeError::validation(format!(
                    "'{list_arg}' for '{}' must be an array, got {}",
                    entry.name,
                    json_type_name(&other)
                )))
            }
            None => {
                return Err(BridgeError::validation(format!(
                    "'{}' requires a '{list_arg}' array",
                    entry.name
                )))
            }
        };

        let upstream = entry.upstream_tool();
        let total = items.len();
        tracing::debug!(tool = %entry.name, total, "fanning out batch");

        let calls = items.into_iter().enumerate().map(|(index, item)| {
            let mut args = base.clone();
            args.insert(item_arg.to_string(), item.clone());
            let call = ToolCall::new(upstream, Value::Object(args));
            async move { (index, item, self.forward(call, timeout).await) }
        });

        let mut outcomes: Vec<(usize, Value, Result<RawPayload, BridgeError>)> = stream::iter(calls)
            .buffer_unordered(self.options.batch_concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|(index, _, _)| *index);

        let batch: Vec<BatchItem> = outcomes
            .into_iter()
            .map(|(index, input, outcome)| match outcome {
                Ok(payload) => BatchItem {
                    index,
                    input,
                    ok: true,
                    result: Some(payload),
                    error: None,
                },
                Err(e) => BatchItem {
                    index,
                    input,
                    ok: false,
                    result: None,
                    error: Some(e.to_body()),
                },
            })
            .collect();

        let failed = batch.iter().filter(|b| !b.ok).count();
        if failed > 0 {
            tracing::info!(tool = %entry.name, total, failed, "batch finished with failures");
        }
        Ok(DispatchOutput::Batch(batch))
    }
}

fn object_args(tool: &str, arguments: Value) -> Result<Map<String, Value>, BridgeError> {
    match arguments {
        Value::Object(map) => Ok(map),
        other => Err(BridgeError::validation(format!(
            "arguments for '{tool}' must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn required_str(tool: &str, arguments: &Value, key: &str) -> Result<String, BridgeError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            BridgeError::validation(format!("'{tool}' requires a non-empty string '{key}'"))
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
