//! Capability abstraction: named external functions the agent can invoke.
//!
//! A [`Capability`] is a `(input: string) -> output: string` function with a
//! name and a description. Capabilities are collected into a
//! [`CapabilityRegistry`] which handles by-name dispatch, per-invoke
//! timeouts, and definition export in the OpenAI function-calling format.
//!
//! A capability's output may be arbitrarily large — the registry imposes no
//! size limit. Boundedness is enforced downstream, at the
//! [`Compactor`](crate::compactor::Compactor).

use crate::{ToolDef, json_schema_for};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default timeout for capability invocation (60 seconds). Not applied
/// unless explicitly set via [`CapabilityRegistry::with_timeout`].
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by [`Capability::invoke`].
///
/// Type alias to keep trait signatures and implementations readable; the
/// boxed form keeps the trait dyn-compatible.
pub type CapabilityFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

// ── Calling convention ─────────────────────────────────────────────

/// Arguments for every capability: a single string input.
///
/// The orchestration loop speaks the function-calling wire format, so each
/// capability is exposed to the model with this one-field schema.
#[derive(Deserialize, JsonSchema)]
pub struct CapabilityArgs {
    /// The capability's input string.
    pub input: String,
}

/// A pending instruction to invoke a capability, produced by a planning
/// model call. Exists only transiently between the planner and the
/// invocation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    /// The capability to invoke.
    pub name: String,
    /// The input string to pass.
    pub input: String,
    /// The originating tool call id, echoed back in the result message.
    pub call_id: String,
}

fn capability_args_schema() -> &'static serde_json::Value {
    static SCHEMA: OnceLock<serde_json::Value> = OnceLock::new();
    SCHEMA.get_or_init(json_schema_for::<CapabilityArgs>)
}

/// Extract the `input` string from a raw function-call arguments payload,
/// validating it against the [`CapabilityArgs`] schema.
pub fn parse_call_input(raw_arguments: &str) -> Result<String, String> {
    let value: serde_json::Value = serde_json::from_str(raw_arguments)
        .map_err(|e| format!("invalid JSON arguments: {e}"))?;

    if let Ok(validator) = jsonschema::validator_for(capability_args_schema()) {
        let errors: Vec<String> = validator
            .iter_errors(&value)
            .map(|e| format!("{}: {e}", e.instance_path()))
            .collect();
        if !errors.is_empty() {
            return Err(format!("argument validation failed: {}", errors.join("; ")));
        }
    }

    value
        .get("input")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| "arguments missing string field 'input'".to_string())
}

/// Convert a model tool call into a [`CapabilityRequest`].
///
/// Malformed arguments are not retried (semantic failures are the caller's
/// concern, not the invoker's): the raw arguments string is passed through
/// as the input, and the capability's own error becomes data for the run.
pub fn request_from_call(call: &crate::ToolCall) -> CapabilityRequest {
    let input = match parse_call_input(&call.function.arguments) {
        Ok(input) => input,
        Err(e) => {
            warn!(
                "Capability call {} has malformed arguments ({e}); passing raw string through",
                call.function.name
            );
            call.function.arguments.trim().to_string()
        }
    };
    CapabilityRequest {
        name: call.function.name.clone(),
        input,
        call_id: call.id.clone(),
    }
}

// ── Capability trait ───────────────────────────────────────────────

/// A named external function the agent can invoke.
///
/// Implementors provide a name, a description (shown to the model), and an
/// async [`Capability::invoke`] taking a single string input. Errors are
/// returned as `Err(String)` — the orchestration loop converts them into
/// error-marker output rather than aborting the run.
pub trait Capability: Send + Sync {
    /// The capability's name, used for dispatch and in tool definitions.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// Invoke the capability with the given input.
    ///
    /// Uses a boxed future so that the trait is dyn-compatible.
    fn invoke(&self, input: &str) -> CapabilityFuture<'_>;
}

// ── FnCapability ───────────────────────────────────────────────────

/// Type-erased handler for [`FnCapability`].
type ErasedHandler =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// A closure-based capability.
///
/// Eliminates the boilerplate of a struct + `impl Capability` for
/// capabilities whose logic is a pure async function. For capabilities with
/// shared state (clients, caches), implement [`Capability`] directly.
///
/// # Example
///
/// ```ignore
/// let cap = FnCapability::new("echo", "Echo the input back.", |input| async move {
///     Ok(input)
/// });
/// let registry = CapabilityRegistry::new().with(cap);
/// ```
pub struct FnCapability {
    name: String,
    description: String,
    handler: ErasedHandler,
}

impl FnCapability {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let erased = move |input: String| -> Pin<
            Box<dyn Future<Output = Result<String, String>> + Send>,
        > { Box::pin(handler(input)) };
        Self {
            name: name.into(),
            description: description.into(),
            handler: Box::new(erased),
        }
    }
}

impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn invoke(&self, input: &str) -> CapabilityFuture<'_> {
        Box::pin((self.handler)(input.to_string()))
    }
}

impl fmt::Debug for FnCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCapability")
            .field("name", &self.name)
            .finish()
    }
}

// ── CapabilityRegistry ─────────────────────────────────────────────

/// A fixed set of capabilities dispatched by name.
///
/// # Example
///
/// ```ignore
/// let registry = CapabilityRegistry::new()
///     .with(FetchAnnualReport)
///     .with(RunMonteCarlo)
///     .with_timeout(Some(DEFAULT_INVOKE_TIMEOUT));
///
/// let defs = registry.definitions(); // for the planning model call
/// let out = registry.invoke("fetch_annual_report", "ACME_Corp").await?;
/// ```
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Box<dyn Capability>>,
    invoke_timeout: Option<Duration>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .field("invoke_timeout", &self.invoke_timeout)
            .finish()
    }
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
            invoke_timeout: None,
        }
    }

    /// Register a capability (builder pattern).
    pub fn with(mut self, capability: impl Capability + 'static) -> Self {
        self.register(capability);
        self
    }

    /// Set a per-invocation timeout. `None` disables timeouts (capabilities
    /// may be arbitrarily slow).
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Register a capability in place.
    pub fn register(&mut self, capability: impl Capability + 'static) {
        self.capabilities
            .insert(capability.name().to_string(), Box::new(capability));
    }

    /// Sorted capability names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a capability with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Export tool definitions for the planning model call, sorted by name
    /// for a stable prompt prefix.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self
            .capabilities
            .values()
            .map(|c| ToolDef::new(c.name(), c.description(), capability_args_schema().clone()))
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Invoke a capability by name.
    ///
    /// Returns `Err` for unknown names, invocation failures, and timeouts.
    /// The caller decides what a failure means — the orchestration loop
    /// treats it as data (an error-marker output), never as a loop failure.
    pub async fn invoke(&self, name: &str, input: &str) -> Result<String, String> {
        let Some(capability) = self.capabilities.get(name) else {
            return Err(format!(
                "unknown capability '{name}' (available: {})",
                self.names().join(", ")
            ));
        };

        let input_preview: String = input.chars().take(120).collect();
        info!("[capability] {name}({input_preview})");
        trace!("[capability] {name} full input: {input}");
        let start = std::time::Instant::now();

        let result = if let Some(timeout) = self.invoke_timeout {
            match tokio::time::timeout(timeout, capability.invoke(input)).await {
                Ok(r) => r,
                Err(_) => Err(format!(
                    "capability '{name}' timed out after {:.0}s",
                    timeout.as_secs_f64()
                )),
            }
        } else {
            capability.invoke(input).await
        };

        match &result {
            Ok(output) => debug!(
                "[capability] {name} completed in {:.0}ms ({} chars)",
                start.elapsed().as_secs_f64() * 1000.0,
                output.chars().count()
            ),
            Err(e) => debug!(
                "[capability] {name} failed in {:.0}ms: {e}",
                start.elapsed().as_secs_f64() * 1000.0
            ),
        }

        result
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> FnCapability {
        FnCapability::new("echo", "Echo the input back.", |input| async move {
            Ok(input)
        })
    }

    fn failing() -> FnCapability {
        FnCapability::new("fail", "Always fails.", |_input| async move {
            Err("boom".to_string())
        })
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let registry = CapabilityRegistry::new().with(echo());
        let out = registry.invoke("echo", "hello").await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn unknown_capability_is_an_error() {
        let registry = CapabilityRegistry::new().with(echo());
        let err = registry.invoke("missing", "x").await.unwrap_err();
        assert!(err.contains("unknown capability 'missing'"));
        assert!(err.contains("echo"));
    }

    #[tokio::test]
    async fn capability_failure_surfaces_as_err() {
        let registry = CapabilityRegistry::new().with(failing());
        let err = registry.invoke("fail", "x").await.unwrap_err();
        assert_eq!(err, "boom");
    }

    #[tokio::test]
    async fn invoke_timeout_applies() {
        let slow = FnCapability::new("slow", "Sleeps forever.", |_input| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        });
        let registry = CapabilityRegistry::new()
            .with(slow)
            .with_timeout(Some(Duration::from_millis(20)));
        let err = registry.invoke("slow", "x").await.unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[test]
    fn definitions_are_sorted_and_share_schema() {
        let registry = CapabilityRegistry::new().with(failing()).with(echo());
        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].function.name, "echo");
        assert_eq!(defs[1].function.name, "fail");
        assert_eq!(defs[0].function.parameters["type"], "object");
    }

    #[test]
    fn parse_call_input_extracts_string() {
        let input = parse_call_input(r#"{"input": "ACME_Corp"}"#).unwrap();
        assert_eq!(input, "ACME_Corp");
    }

    #[test]
    fn parse_call_input_rejects_wrong_shape() {
        assert!(parse_call_input(r#"{"query": "x"}"#).is_err());
        assert!(parse_call_input("not json").is_err());
        assert!(parse_call_input(r#"{"input": 42}"#).is_err());
    }

    #[test]
    fn request_from_call_falls_back_to_raw_arguments() {
        let call = crate::ToolCall {
            id: "c1".into(),
            call_type: crate::CallType::Function,
            function: crate::FunctionCallData {
                name: "echo".into(),
                arguments: "garbled".into(),
            },
        };
        let req = request_from_call(&call);
        assert_eq!(req.input, "garbled");
        assert_eq!(req.call_id, "c1");
    }
}
