//! Planning: decide the next capability invocation for a work unit.
//!
//! The planner owns the prompts. Its defining property is what goes *into*
//! a planning call: the system prompt, the unit identifier, and the current
//! durable memory — never the raw output of earlier steps. That keeps every
//! planning prompt O(memory), independent of how many units came before.

use crate::capability::{CapabilityRegistry, CapabilityRequest};
use crate::invoker::{ModelInvoker, ModelReply};
use crate::Message;
use std::fmt;

/// Default system prompt for the planning and synthesis calls.
pub const SYSTEM_PROMPT: &str = "\
You are an agent working through a long multi-step task under a strict \
context budget. You cannot see raw output from earlier steps; everything \
durable you have learned is in the memory section of each prompt. For each \
step, invoke the appropriate capability via a tool call. Do not answer in \
prose during work steps. Keep every figure and conclusion you will need \
later in mind when summarizing, because only the durable memory survives.";

/// What a planning call decided.
#[derive(Debug)]
pub enum PlannerDecision {
    /// Invoke these capabilities, in order.
    Requests(Vec<CapabilityRequest>),
    /// The model answered in text instead. The loop treats this as a
    /// skipped unit.
    Response(String),
}

/// Context handed to the unit prompt template.
#[derive(Debug, Clone, Copy)]
pub struct UnitContext<'a> {
    /// The work unit identifier.
    pub unit: &'a str,
    /// Zero-based position of this unit.
    pub index: usize,
    /// Total number of units in the run.
    pub total: usize,
    /// The current durable memory.
    pub memory: &'a str,
}

type UnitInstructions = Box<dyn Fn(&UnitContext<'_>) -> String + Send + Sync>;

/// Builds planning prompts and issues planning calls.
pub struct Planner {
    system_prompt: String,
    unit_instructions: Option<UnitInstructions>,
}

impl fmt::Debug for Planner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planner")
            .field("system_prompt_chars", &self.system_prompt.chars().count())
            .field("custom_instructions", &self.unit_instructions.is_some())
            .finish()
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

impl Planner {
    pub fn new() -> Self {
        Self {
            system_prompt: SYSTEM_PROMPT.to_string(),
            unit_instructions: None,
        }
    }

    /// Replace the system prompt (domain-specific persona and rules).
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Replace the per-unit task instructions. The closure receives the
    /// unit context and returns the instruction block appended to the
    /// standard prompt frame.
    pub fn with_unit_instructions<F>(mut self, f: F) -> Self
    where
        F: Fn(&UnitContext<'_>) -> String + Send + Sync + 'static,
    {
        self.unit_instructions = Some(Box::new(f));
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Build the user prompt for one unit. Composed only from the unit
    /// context and the durable memory.
    pub fn unit_prompt(&self, ctx: &UnitContext<'_>) -> String {
        let instructions = match &self.unit_instructions {
            Some(f) => f(ctx),
            None => format!(
                "Process work unit '{}'. Invoke the capability appropriate for this \
                 unit; its output will be summarized into your memory automatically.",
                ctx.unit
            ),
        };
        format!(
            "Step {}/{}: unit {}\n\nCurrent durable memory:\n{}\n\n{instructions}",
            ctx.index + 1,
            ctx.total,
            ctx.unit,
            if ctx.memory.is_empty() { "(empty)" } else { ctx.memory },
        )
    }

    /// Issue one planning call for the given unit.
    ///
    /// `history` is `None` in bounded runs; the unbounded baseline passes
    /// the accumulated transcript instead.
    pub async fn plan(
        &self,
        invoker: &ModelInvoker<'_>,
        registry: &CapabilityRegistry,
        ctx: &UnitContext<'_>,
        history: Option<&[Message]>,
    ) -> Result<PlannerDecision, String> {
        let mut messages = Vec::with_capacity(2 + history.map_or(0, <[Message]>::len));
        messages.push(Message::system(&self.system_prompt));
        if let Some(history) = history {
            messages.extend_from_slice(history);
        }
        messages.push(Message::user(self.unit_prompt(ctx)));

        let definitions = registry.definitions();
        match invoker.complete(messages, Some(&definitions)).await? {
            ModelReply::Capabilities(requests) => Ok(PlannerDecision::Requests(requests)),
            ModelReply::Text(text) => Ok(PlannerDecision::Response(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{ChatFuture, ModelBackend};
    use crate::{ChatCompletion, ChatRequest};

    #[test]
    fn unit_prompt_is_bounded_by_memory_not_history() {
        let planner = Planner::new();
        let memory = "m".repeat(1_200);
        let ctx = UnitContext {
            unit: "ACME_Corp",
            index: 4,
            total: 8,
            memory: &memory,
        };
        let prompt = planner.unit_prompt(&ctx);
        assert!(prompt.contains("Step 5/8"));
        assert!(prompt.contains("ACME_Corp"));
        assert!(prompt.contains(&memory));
        // memory + fixed frame only; nothing else can grow it
        assert!(prompt.chars().count() < memory.chars().count() + 500);
    }

    #[test]
    fn custom_instructions_replace_default_block() {
        let planner = Planner::new()
            .with_unit_instructions(|ctx| format!("Fetch the report for {}.", ctx.unit));
        let ctx = UnitContext {
            unit: "GlobalTech",
            index: 0,
            total: 1,
            memory: "",
        };
        let prompt = planner.unit_prompt(&ctx);
        assert!(prompt.contains("Fetch the report for GlobalTech."));
        assert!(!prompt.contains("appropriate for this"));
    }

    struct CaptureMessages;
    impl ModelBackend for CaptureMessages {
        fn chat<'a>(&'a self, body: &'a ChatRequest) -> ChatFuture<'a> {
            // first message is the system prompt, last is the unit prompt
            assert_eq!(body.messages.first().unwrap().role, crate::MessageRole::System);
            assert!(body.tools.is_some());
            Box::pin(std::future::ready(Ok(ChatCompletion::text("skip"))))
        }
    }

    #[tokio::test]
    async fn plan_sends_system_then_unit_prompt_with_tools() {
        let backend = CaptureMessages;
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = CapabilityRegistry::new().with(crate::capability::FnCapability::new(
            "echo",
            "Echo.",
            |input| async move { Ok(input) },
        ));
        let planner = Planner::new();
        let ctx = UnitContext {
            unit: "u1",
            index: 0,
            total: 1,
            memory: "",
        };
        let decision = planner.plan(&invoker, &registry, &ctx, None).await.unwrap();
        assert!(matches!(decision, PlannerDecision::Response(t) if t == "skip"));
    }
}
