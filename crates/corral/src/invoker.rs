//! Single-call model invocation with timeout and bounded retry.
//!
//! [`ModelInvoker`] wraps one chat-completions call: it builds the request,
//! applies a hard per-call deadline, retries transient failures per
//! [`RetryConfig`], and classifies the reply as either text or a batch of
//! capability requests. Semantic failures — malformed tool-call arguments,
//! unparseable summarization output — are never retried here; those belong
//! to the callers that understand them.

use crate::api::retry::{RetryConfig, is_permanent_error, is_transient_error};
use crate::capability::{CapabilityRequest, request_from_call};
use crate::{ChatClient, ChatCompletion, ChatRequest, Message, ToolDef};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Default hard deadline for a single model call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Boxed future returned by [`ModelBackend::chat`].
pub type ChatFuture<'a> = Pin<Box<dyn Future<Output = Result<ChatCompletion, String>> + Send + 'a>>;

/// Anything that can answer a chat completion request.
///
/// [`ChatClient`] is the production implementation; tests implement this
/// with scripted closures to exercise the loop without a server.
pub trait ModelBackend: Send + Sync {
    fn chat<'a>(&'a self, body: &'a ChatRequest) -> ChatFuture<'a>;
}

impl ModelBackend for ChatClient {
    fn chat<'a>(&'a self, body: &'a ChatRequest) -> ChatFuture<'a> {
        Box::pin(ChatClient::chat(self, body))
    }
}

/// Outcome of a model call, classified for the orchestration loop.
#[derive(Debug)]
pub enum ModelReply {
    /// The model answered with text (possibly empty).
    Text(String),
    /// The model requested one or more capability invocations.
    Capabilities(Vec<CapabilityRequest>),
}

/// One model call with a deadline and bounded retry.
///
/// Borrows its backend; one invoker is shared by the planning, compaction,
/// and synthesis stages of a run so they all observe the same policy.
pub struct ModelInvoker<'a> {
    backend: &'a dyn ModelBackend,
    model: String,
    timeout: Duration,
    retry: RetryConfig,
    max_tokens: u32,
    temperature: f32,
}

impl<'a> ModelInvoker<'a> {
    pub fn new(backend: &'a dyn ModelBackend, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
            retry: RetryConfig::default(),
            max_tokens: 0,
            temperature: 0.0,
        }
    }

    /// Set the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy for transient failures.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Cap completion length (0 = let the server decide).
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature (0.0 = omit from the request).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// The model name requests are issued for.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue one chat completion, retrying transient failures.
    ///
    /// Counts as a single model call from the loop's perspective no matter
    /// how many retry attempts it takes.
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        capabilities: Option<&[ToolDef]>,
    ) -> Result<ModelReply, String> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            seed: None,
            stop: None,
            tools: capabilities.map(<[ToolDef]>::to_vec),
        };

        let mut last_error = String::new();
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt - 1);
                warn!(
                    "Model call attempt {}/{} after {:?}: {last_error}",
                    attempt + 1,
                    self.retry.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = match tokio::time::timeout(self.timeout, self.backend.chat(&body)).await {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "model call timed out after {:.0}s",
                    self.timeout.as_secs_f64()
                )),
            };

            match outcome {
                Ok(completion) => return Ok(classify(completion)),
                Err(e) => {
                    if is_permanent_error(&e) {
                        debug!("Permanent model error, not retrying: {e}");
                        return Err(e);
                    }
                    if is_transient_error(&e) && attempt < self.retry.max_retries {
                        last_error = e;
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error)
    }
}

/// Classify a completion: tool calls win over text when both are present.
fn classify(completion: ChatCompletion) -> ModelReply {
    if completion.tool_calls.is_empty() {
        ModelReply::Text(completion.content.unwrap_or_default())
    } else {
        let requests = completion.tool_calls.iter().map(request_from_call).collect();
        debug!(
            "Model requested {} capability invocation(s)",
            completion.tool_calls.len()
        );
        ModelReply::Capabilities(requests)
    }
}
