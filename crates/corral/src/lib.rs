//! Bounded-context orchestration for long-running tool-use agents.
//!
//! `corral` drives a multi-step LLM agent through a long task — ingest many
//! documents, run compute steps, synthesize a final report — while keeping the
//! agent's retained state under a fixed ceiling. The core abstraction is the
//! [`Run`](run::Run): a state machine that plans the next action, invokes a
//! capability, then *compacts* the raw output into a size-bounded durable
//! memory before continuing. Raw capability output never survives past the
//! compaction step that consumed it; the naive alternative — appending every
//! result to history forever — saturates the model's context and degrades
//! long runs.
//!
//! # Getting started
//!
//! ```ignore
//! use corral::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = ChatClient::new(DEFAULT_BASE_URL, "EMPTY").unwrap();
//!     let invoker = ModelInvoker::new(&client, "openai/gpt-oss-120b");
//!     let capabilities = corral::sim::workload_registry();
//!     let planner = Planner::new();
//!
//!     let result = Run::new(&invoker, &capabilities, &planner, RunConfig::default())
//!         .with_event_handler(&LoggingHandler)
//!         .run(vec!["ACME_Corp".into(), "GlobalTech".into()])
//!         .await
//!         .unwrap();
//!
//!     println!("{}", result.report);
//! }
//! ```
//!
//! # Where to find things
//!
//! - **The loop:** [`Run`](run::Run) and [`RunConfig`](run::RunConfig). One
//!   planning call and one compaction call per work unit, plus one final
//!   synthesis call — `O(N)` model calls, constant retained state.
//! - **Memory compaction:** [`Compactor`](compactor::Compactor). Clips each
//!   raw output to a bounded prefix, summarizes it into the durable memory,
//!   and fails soft (retains prior memory) on any parse mismatch.
//! - **Capabilities:** the [`Capability`](capability::Capability) trait and
//!   [`CapabilityRegistry`](capability::CapabilityRegistry) for by-name
//!   dispatch. [`sim`] provides the simulated document/compute workload.
//! - **Model access:** [`ModelInvoker`](invoker::ModelInvoker) wraps one
//!   chat-completions call with a timeout and bounded retry; the
//!   [`ModelBackend`](invoker::ModelBackend) trait lets tests script replies.
//! - **Observability:** implement [`EventHandler`](events::EventHandler) to
//!   react to [`RunEvent`](events::RunEvent)s — planning, capability results,
//!   compaction, synthesis.
//!
//! # Design principles
//!
//! 1. **Retained state is bounded by construction.** The durable memory is
//!    the only thing carried forward indefinitely, and only the compactor may
//!    mutate it — always to at most `max_memory_chars` characters.
//! 2. **Capability failures are data.** A failed invocation becomes an error
//!    marker string that is compacted into memory like any other output; it
//!    never aborts the run.
//! 3. **Compaction never erases.** If the summarization response cannot be
//!    parsed, the prior memory is retained unchanged.
//! 4. **One loop, two policies.** The unbounded comparison baseline is a
//!    configuration flag on the same state machine, not a second
//!    implementation.

pub mod api;
pub mod capability;
pub mod compactor;
pub mod events;
pub mod invoker;
pub mod planner;
pub mod prelude;
pub mod run;
pub mod sim;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

/// Default OpenAI-compatible endpoint (a local vLLM server).
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/v1";

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "openai/gpt-oss-120b";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types
/// and the `serde_json::Value` the function-calling API expects.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Covers the subset of the OpenAI-compatible
/// chat completions API that the orchestration loop needs — unused optional
/// fields are omitted from serialization.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Length of the message content in characters (0 if absent).
    pub fn content_chars(&self) -> usize {
        self.content.as_deref().map_or(0, |c| c.chars().count())
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call returned by the model.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from [`ChatClient::chat`].
#[derive(Debug, Default)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

impl ChatCompletion {
    /// A text-only completion. Handy for scripted test backends.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// A completion that requests the named capability with a single
    /// string input, in the standard `{"input": ...}` calling convention.
    pub fn capability_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        input: &str,
    ) -> Self {
        Self {
            tool_calls: vec![ToolCall {
                id: call_id.into(),
                call_type: CallType::Function,
                function: FunctionCallData {
                    name: name.into(),
                    arguments: serde_json::json!({ "input": input }).to_string(),
                },
            }],
            ..Default::default()
        }
    }
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for an OpenAI-compatible chat completions endpoint.
///
/// The client itself applies no request timeout — per-call deadlines are
/// owned by the [`ModelInvoker`](invoker::ModelInvoker) so that the loop's
/// timeout policy lives in exactly one place.
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ChatClient {
    /// Create a new client for the given base URL (e.g.
    /// `http://localhost:8000/v1`). `api_key` may be a placeholder such as
    /// `"EMPTY"` for local servers that don't authenticate.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("corral/0.1")
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        let tool_count = body.tools.as_ref().map_or(0, |t| t.len());
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            tool_count,
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("model API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("model API error: {}", err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());

        match choice {
            Some(c) => {
                let content_len = c.message.content.as_ref().map_or(0, |s| s.len());
                let tc_count = c.message.tool_calls.as_ref().map_or(0, |t| t.len());
                debug!("LLM output: {content_len} chars text, {tc_count} tool call(s)");
                Ok(ChatCompletion {
                    content: c.message.content,
                    tool_calls: c.message.tool_calls.unwrap_or_default(),
                    usage: parsed.usage,
                    finish_reason: c.finish_reason,
                })
            }
            None => {
                debug!("LLM output: empty (no choices)");
                Ok(ChatCompletion {
                    usage: parsed.usage,
                    ..Default::default()
                })
            }
        }
    }
}
