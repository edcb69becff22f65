//! The orchestration loop: plan, invoke, compact, repeat, synthesize.
//!
//! [`Run`] drives a list of work units through a state machine:
//!
//! ```text
//! Planning -> AwaitingCapability -> Compacting -> Planning (next unit)
//!    |                                               |
//!    +--------------- (units exhausted) -------------+--> Synthesizing -> Done
//! ```
//!
//! Each unit costs one planning call and one compaction call; the run ends
//! with one synthesis call. For `N` units that is `2N + 1` model calls, and
//! the retained state between units is exactly the durable memory — at most
//! `max_memory_chars` characters — plus a history transcript whose raw
//! capability outputs have been replaced by short placeholder stubs.
//!
//! All run state lives in locals of [`Run::run`]; concurrent runs over the
//! same invoker and registry never share mutable state.

use crate::capability::{CapabilityRegistry, CapabilityRequest};
use crate::compactor::{Compactor, CompactorConfig};
use crate::events::{EventHandler, NoopHandler, RunEvent};
use crate::invoker::{ModelInvoker, ModelReply};
use crate::planner::{Planner, PlannerDecision, UnitContext};
use crate::{CallType, FunctionCallData, Message, ToolCall};
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::debug;

// ── Errors ─────────────────────────────────────────────────────────

/// The stage of the loop an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Planning,
    Capability,
    Compaction,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Planning => write!(f, "planning"),
            Stage::Capability => write!(f, "capability"),
            Stage::Compaction => write!(f, "compaction"),
            Stage::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// A run-fatal failure, carrying enough context to diagnose it: the unit
/// being processed, the stage that failed, and the durable memory as it
/// stood — nothing learned before the failure is lost.
#[derive(Debug)]
pub struct RunError {
    pub unit: Option<String>,
    pub stage: Stage,
    pub message: String,
    /// Durable memory at the time of failure.
    pub memory: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run failed at {} stage", self.stage)?;
        if let Some(unit) = &self.unit {
            write!(f, " (unit {unit})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for RunError {}

// ── Configuration ──────────────────────────────────────────────────

/// Configuration for a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Ceiling on durable memory, in characters.
    pub max_memory_chars: usize,
    /// Ceiling on raw output passed to the compactor, in characters.
    pub max_output_chars: usize,
    /// Compaction attempts (model errors only) before the run fails.
    pub max_compaction_attempts: u32,
    /// Consecutive units with a failed capability or retained-memory
    /// compaction before the run is declared stuck.
    pub max_consecutive_failures: u32,
    /// When false, run the unbounded baseline: no compaction, raw outputs
    /// accumulate in history, and the full transcript is sent to every
    /// planning and synthesis call.
    pub bounded: bool,
    /// Instruction block for the final synthesis call.
    pub synthesis_instructions: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_memory_chars: 1_200,
            max_output_chars: 4_000,
            max_compaction_attempts: 3,
            max_consecutive_failures: 3,
            bounded: true,
            synthesis_instructions: "All work units are complete. Produce the final report \
                for the task, using only the durable memory below."
                .to_string(),
        }
    }
}

impl RunConfig {
    pub fn with_max_memory_chars(mut self, chars: usize) -> Self {
        self.max_memory_chars = chars;
        self
    }

    pub fn with_max_output_chars(mut self, chars: usize) -> Self {
        self.max_output_chars = chars;
        self
    }

    pub fn with_bounded(mut self, bounded: bool) -> Self {
        self.bounded = bounded;
        self
    }

    pub fn with_synthesis_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.synthesis_instructions = instructions.into();
        self
    }

    fn compactor_config(&self) -> CompactorConfig {
        CompactorConfig::default()
            .with_max_output_chars(self.max_output_chars)
            .with_max_memory_chars(self.max_memory_chars)
            .with_max_attempts(self.max_compaction_attempts)
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunResult {
    /// The final synthesized report.
    pub report: String,
    /// The durable memory at the end of the run.
    pub memory: String,
    /// The full transcript. In bounded runs every raw capability output has
    /// been replaced by a placeholder stub.
    pub history: Vec<Message>,
    /// Units that completed a capability step (skipped units excluded).
    pub units_processed: usize,
    /// Model calls issued (planning + compaction + synthesis).
    pub model_calls: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ── The loop ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Planning,
    AwaitingCapability,
    Compacting,
    Synthesizing,
    Done,
}

static NOOP: NoopHandler = NoopHandler;

type StopSignal<'a> = Box<dyn Fn() -> bool + Send + Sync + 'a>;

/// A single orchestrated run over a list of work units.
///
/// Borrows its collaborators; construct one per task. See the crate docs
/// for a complete example.
pub struct Run<'a> {
    invoker: &'a ModelInvoker<'a>,
    registry: &'a CapabilityRegistry,
    planner: &'a Planner,
    config: RunConfig,
    event_handler: &'a dyn EventHandler,
    stop_signal: Option<StopSignal<'a>>,
}

impl<'a> Run<'a> {
    pub fn new(
        invoker: &'a ModelInvoker<'a>,
        registry: &'a CapabilityRegistry,
        planner: &'a Planner,
        config: RunConfig,
    ) -> Self {
        Self {
            invoker,
            registry,
            planner,
            config,
            event_handler: &NOOP,
            stop_signal: None,
        }
    }

    /// Observe the run through an [`EventHandler`].
    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    /// Install a stop signal, polled before every stage. When it returns
    /// true the run aborts with a cancellation error.
    pub fn with_stop_signal<F>(mut self, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'a,
    {
        self.stop_signal = Some(Box::new(f));
        self
    }

    fn cancelled(&self) -> bool {
        self.stop_signal.as_ref().is_some_and(|f| f())
    }

    fn cancel_error(&self, stage: Stage, unit: Option<&str>, memory: &str) -> RunError {
        self.event_handler.on_event(&RunEvent::Cancelled { stage });
        RunError {
            unit: unit.map(str::to_string),
            stage,
            message: "cancelled by stop signal".to_string(),
            memory: memory.to_string(),
        }
    }

    /// Process the given work units and synthesize a final report.
    pub async fn run(self, units: Vec<String>) -> Result<RunResult, RunError> {
        let started_at = Utc::now();
        let compactor = Compactor::new(self.config.compactor_config());
        let total = units.len();

        // Per-run state. Nothing here outlives the call.
        let mut state = RunState::Planning;
        let mut memory = String::new();
        let mut history: Vec<Message> = Vec::new();
        let mut unit_index = 0usize;
        let mut units_processed = 0usize;
        let mut model_calls = 0u32;
        let mut consecutive_failures = 0u32;
        let mut pending: Vec<CapabilityRequest> = Vec::new();
        let mut raw_indices: Vec<usize> = Vec::new();
        let mut raw_output = String::new();
        let mut step_failed: Option<Stage> = None;
        let mut report = String::new();

        loop {
            match state {
                RunState::Planning => {
                    if unit_index >= total {
                        state = RunState::Synthesizing;
                        continue;
                    }
                    let unit = &units[unit_index];
                    if self.cancelled() {
                        return Err(self.cancel_error(Stage::Planning, Some(unit.as_str()), &memory));
                    }

                    let ctx = UnitContext {
                        unit,
                        index: unit_index,
                        total,
                        memory: &memory,
                    };
                    self.event_handler.on_event(&RunEvent::PlanningStart {
                        unit,
                        index: unit_index,
                        total,
                        memory_chars: memory.chars().count(),
                    });

                    let past = (!self.config.bounded).then_some(history.as_slice());
                    let decision = self
                        .planner
                        .plan(self.invoker, self.registry, &ctx, past)
                        .await
                        .map_err(|message| RunError {
                            unit: Some(unit.clone()),
                            stage: Stage::Planning,
                            message,
                            memory: memory.clone(),
                        })?;
                    model_calls += 1;
                    history.push(Message::user(self.planner.unit_prompt(&ctx)));

                    match decision {
                        PlannerDecision::Requests(requests) => {
                            let calls: Vec<ToolCall> = requests
                                .iter()
                                .map(|r| ToolCall {
                                    id: r.call_id.clone(),
                                    call_type: CallType::Function,
                                    function: FunctionCallData {
                                        name: r.name.clone(),
                                        arguments: serde_json::json!({ "input": r.input })
                                            .to_string(),
                                    },
                                })
                                .collect();
                            history.push(Message::assistant_tool_calls(calls));
                            pending = requests;
                            state = RunState::AwaitingCapability;
                        }
                        PlannerDecision::Response(text) => {
                            // Liveness over completeness: a unit the planner
                            // declines to act on is skipped, not retried.
                            self.event_handler.on_event(&RunEvent::UnitSkipped {
                                unit,
                                response_chars: text.chars().count(),
                            });
                            history.push(Message::assistant_text(text));
                            unit_index += 1;
                        }
                    }
                }

                RunState::AwaitingCapability => {
                    let unit = &units[unit_index];
                    if self.cancelled() {
                        return Err(self.cancel_error(Stage::Capability, Some(unit.as_str()), &memory));
                    }

                    let mut pieces: Vec<String> = Vec::new();
                    raw_indices.clear();
                    for request in pending.drain(..) {
                        self.event_handler.on_event(&RunEvent::CapabilityInvoking {
                            name: &request.name,
                            input: &request.input,
                        });
                        let content = match self.registry.invoke(&request.name, &request.input).await
                        {
                            Ok(output) => {
                                self.event_handler.on_event(&RunEvent::CapabilityResult {
                                    name: &request.name,
                                    chars: output.chars().count(),
                                });
                                format!("[{}]\n{output}", request.name)
                            }
                            Err(error) => {
                                self.event_handler.on_event(&RunEvent::CapabilityFailed {
                                    name: &request.name,
                                    error: &error,
                                });
                                step_failed = Some(Stage::Capability);
                                format!("[capability error: {}: {error}]", request.name)
                            }
                        };
                        raw_indices.push(history.len());
                        history.push(Message::tool_result(request.call_id, &content));
                        pieces.push(content);
                    }
                    raw_output = pieces.join("\n\n");
                    state = RunState::Compacting;
                }

                RunState::Compacting => {
                    let unit = &units[unit_index];

                    if self.config.bounded {
                        if self.cancelled() {
                            return Err(
                                self.cancel_error(Stage::Compaction, Some(unit.as_str()), &memory)
                            );
                        }
                        let compaction = compactor
                            .compact(self.invoker, &memory, &raw_output)
                            .await
                            .map_err(|message| RunError {
                                unit: Some(unit.clone()),
                                stage: Stage::Compaction,
                                message,
                                memory: memory.clone(),
                            })?;
                        model_calls += 1;

                        if compaction.updated {
                            memory = compaction.memory;
                            self.event_handler.on_event(&RunEvent::Compacted {
                                raw_chars: compaction.raw_chars,
                                clipped_chars: compaction.clipped_chars,
                                memory_chars: memory.chars().count(),
                            });
                        } else {
                            step_failed = Some(Stage::Compaction);
                            self.event_handler.on_event(&RunEvent::CompactionRetained {
                                reason: "summarization reply did not follow the layout",
                            });
                        }
                        debug_assert!(memory.chars().count() <= self.config.max_memory_chars);

                        // Raw outputs are consumed; only stubs survive in
                        // the transcript.
                        for &idx in &raw_indices {
                            let original = history[idx].content_chars();
                            history[idx].content =
                                Some(format!("[output compacted, original length {original}]"));
                        }
                    }
                    raw_output.clear();
                    raw_indices.clear();

                    match step_failed.take() {
                        Some(stage) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= self.config.max_consecutive_failures {
                                return Err(RunError {
                                    unit: Some(unit.clone()),
                                    stage,
                                    message: format!(
                                        "{consecutive_failures} consecutive failed steps",
                                    ),
                                    memory: memory.clone(),
                                });
                            }
                        }
                        None => consecutive_failures = 0,
                    }

                    units_processed += 1;
                    self.event_handler.on_event(&RunEvent::UnitComplete {
                        unit,
                        index: unit_index,
                        total,
                    });
                    unit_index += 1;
                    state = RunState::Planning;
                }

                RunState::Synthesizing => {
                    if self.cancelled() {
                        return Err(self.cancel_error(Stage::Synthesis, None, &memory));
                    }
                    self.event_handler.on_event(&RunEvent::Synthesizing {
                        memory_chars: memory.chars().count(),
                    });

                    let mut messages = vec![Message::system(self.planner.system_prompt())];
                    if !self.config.bounded {
                        messages.extend_from_slice(&history);
                    }
                    messages.push(Message::user(format!(
                        "{}\n\nDurable memory:\n{}",
                        self.config.synthesis_instructions,
                        if memory.is_empty() { "(empty)" } else { memory.as_str() },
                    )));

                    let reply = self
                        .invoker
                        .complete(messages, None)
                        .await
                        .map_err(|message| RunError {
                            unit: None,
                            stage: Stage::Synthesis,
                            message,
                            memory: memory.clone(),
                        })?;
                    model_calls += 1;

                    match reply {
                        ModelReply::Text(text) => {
                            report = text;
                            self.event_handler.on_event(&RunEvent::Finished {
                                report_chars: report.chars().count(),
                            });
                            history.push(Message::assistant_text(report.clone()));
                            state = RunState::Done;
                        }
                        ModelReply::Capabilities(_) => {
                            return Err(RunError {
                                unit: None,
                                stage: Stage::Synthesis,
                                message: "synthesis call requested capabilities".to_string(),
                                memory: memory.clone(),
                            });
                        }
                    }
                }

                RunState::Done => break,
            }
        }

        debug!(
            "Run complete: {units_processed}/{total} unit(s), {model_calls} model call(s), \
             memory {} chars",
            memory.chars().count()
        );
        Ok(RunResult {
            report,
            memory,
            history,
            units_processed,
            model_calls,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FnCapability;
    use crate::compactor::MEMORY_DELIMITER;
    use crate::events::FnEventHandler;
    use crate::invoker::{ChatFuture, ModelBackend};
    use crate::{ChatCompletion, ChatRequest, MessageRole};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct Scripted<F>
    where
        F: Fn(u32, &ChatRequest) -> Result<ChatCompletion, String> + Send + Sync,
    {
        calls: AtomicU32,
        script: F,
    }

    impl<F> Scripted<F>
    where
        F: Fn(u32, &ChatRequest) -> Result<ChatCompletion, String> + Send + Sync,
    {
        fn new(script: F) -> Self {
            Self {
                calls: AtomicU32::new(0),
                script,
            }
        }
    }

    impl<F> ModelBackend for Scripted<F>
    where
        F: Fn(u32, &ChatRequest) -> Result<ChatCompletion, String> + Send + Sync,
    {
        fn chat<'a>(&'a self, body: &'a ChatRequest) -> ChatFuture<'a> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::ready((self.script)(n, body)))
        }
    }

    fn is_compaction(body: &ChatRequest) -> bool {
        body.messages
            .first()
            .and_then(|m| m.content.as_deref())
            .is_some_and(|c| c.contains(MEMORY_DELIMITER))
    }

    fn unit_of(body: &ChatRequest) -> String {
        let content = body
            .messages
            .last()
            .and_then(|m| m.content.as_deref())
            .unwrap_or("");
        content
            .split("UNIT=")
            .nth(1)
            .unwrap_or("")
            .lines()
            .next()
            .unwrap_or("")
            .to_string()
    }

    /// Backend that plans one capability call per unit, compacts, and
    /// synthesizes "FINAL REPORT".
    fn standard_backend()
    -> Scripted<impl Fn(u32, &ChatRequest) -> Result<ChatCompletion, String> + Send + Sync> {
        Scripted::new(|n, body| {
            if body.tools.is_some() {
                Ok(ChatCompletion::capability_call(
                    format!("call-{n}"),
                    "emit",
                    &unit_of(body),
                ))
            } else if is_compaction(body) {
                Ok(ChatCompletion::text(format!(
                    "- noted the latest output\n{MEMORY_DELIMITER}\nfacts so far"
                )))
            } else {
                Ok(ChatCompletion::text("FINAL REPORT"))
            }
        })
    }

    fn test_planner() -> Planner {
        Planner::new().with_unit_instructions(|ctx| format!("UNIT={}", ctx.unit))
    }

    fn emit_registry<F, Fut>(f: F) -> CapabilityRegistry
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        CapabilityRegistry::new().with(FnCapability::new("emit", "Emit output.", f))
    }

    fn units(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn bounded_run_makes_two_n_plus_one_model_calls() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move { Ok(format!("output for {input}")) });
        let planner = test_planner();

        let result = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(units(&["u1", "u2", "u3"]))
            .await
            .unwrap();

        assert_eq!(result.model_calls, 7);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 7);
        assert_eq!(result.units_processed, 3);
        assert_eq!(result.report, "FINAL REPORT");
        assert_eq!(result.memory, "facts so far");
    }

    #[tokio::test]
    async fn batched_requests_compact_as_one_step() {
        let backend = Scripted::new(|n, body: &ChatRequest| {
            if body.tools.is_some() {
                let unit = unit_of(body);
                Ok(ChatCompletion {
                    tool_calls: vec![
                        ToolCall {
                            id: format!("call-{n}-a"),
                            call_type: CallType::Function,
                            function: FunctionCallData {
                                name: "emit".into(),
                                arguments: serde_json::json!({ "input": &unit }).to_string(),
                            },
                        },
                        ToolCall {
                            id: format!("call-{n}-b"),
                            call_type: CallType::Function,
                            function: FunctionCallData {
                                name: "emit".into(),
                                arguments: serde_json::json!({ "input": format!("{unit}_extra") })
                                    .to_string(),
                            },
                        },
                    ],
                    ..Default::default()
                })
            } else if is_compaction(body) {
                Ok(ChatCompletion::text(format!(
                    "{MEMORY_DELIMITER}\nboth outputs noted"
                )))
            } else {
                Ok(ChatCompletion::text("FINAL REPORT"))
            }
        });
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move { Ok(format!("output for {input}")) });
        let planner = test_planner();

        let result = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(units(&["u1"]))
            .await
            .unwrap();

        // one planning call, one compaction call for both outputs, synthesis
        assert_eq!(result.model_calls, 3);
        assert_eq!(result.units_processed, 1);
        assert_eq!(result.memory, "both outputs noted");

        let stubs: Vec<&Message> = result
            .history
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .collect();
        assert_eq!(stubs.len(), 2);
        let ids: Vec<&str> = stubs
            .iter()
            .map(|m| m.tool_call_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, ["call-0-a", "call-0-b"]);
        for stub in stubs {
            assert!(
                stub.content
                    .as_deref()
                    .unwrap()
                    .starts_with("[output compacted, original length")
            );
        }
    }

    #[tokio::test]
    async fn memory_and_history_stay_bounded_with_huge_outputs() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|_| async move { Ok("x".repeat(50_000)) });
        let planner = test_planner();

        let result = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(units(&["u1", "u2"]))
            .await
            .unwrap();

        assert!(result.memory.chars().count() <= 1_200);

        // every raw output was replaced by a stub naming its original size
        let stubs: Vec<&Message> = result
            .history
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .collect();
        assert_eq!(stubs.len(), 2);
        for stub in stubs {
            let content = stub.content.as_deref().unwrap();
            assert!(
                content.starts_with("[output compacted, original length"),
                "got: {content}"
            );
            assert!(content.chars().count() < 100);
            assert!(stub.tool_call_id.is_some());
        }
    }

    #[tokio::test]
    async fn capability_failure_becomes_data_and_run_completes() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move {
            if input == "bad" {
                Err("document store unavailable".to_string())
            } else {
                Ok(format!("output for {input}"))
            }
        });
        let planner = test_planner();

        let failed = Arc::new(Mutex::new(Vec::new()));
        let failed_sink = failed.clone();
        let handler = FnEventHandler::new(move |event| {
            if let RunEvent::CapabilityFailed { name, error } = event {
                failed_sink
                    .lock()
                    .unwrap()
                    .push(format!("{name}: {error}"));
            }
        });

        let result = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .with_event_handler(&handler)
            .run(units(&["good1", "bad", "good2"]))
            .await
            .unwrap();

        assert_eq!(result.units_processed, 3);
        assert_eq!(result.report, "FINAL REPORT");
        assert_eq!(
            failed.lock().unwrap().as_slice(),
            ["emit: document store unavailable"]
        );
    }

    #[tokio::test]
    async fn compaction_failure_aborts_with_unit_and_memory() {
        let compactions = AtomicU32::new(0);
        let backend = Scripted::new(move |n, body| {
            if body.tools.is_some() {
                Ok(ChatCompletion::capability_call(
                    format!("call-{n}"),
                    "emit",
                    "x",
                ))
            } else if is_compaction(body) {
                if compactions.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(ChatCompletion::text(format!(
                        "{MEMORY_DELIMITER}\nfacts so far"
                    )))
                } else {
                    Err("model API HTTP 400: bad request".to_string())
                }
            } else {
                Ok(ChatCompletion::text("FINAL REPORT"))
            }
        });
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|_| async move { Ok("output".to_string()) });
        let planner = test_planner();

        let err = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(units(&["u1", "u2"]))
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Compaction);
        assert_eq!(err.unit.as_deref(), Some("u2"));
        assert_eq!(err.memory, "facts so far");
        assert!(err.to_string().contains("compaction"));
    }

    #[tokio::test]
    async fn empty_unit_list_goes_straight_to_synthesis() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move { Ok(input) });
        let planner = test_planner();

        let result = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(Vec::new())
            .await
            .unwrap();

        assert_eq!(result.model_calls, 1);
        assert_eq!(result.units_processed, 0);
        assert_eq!(result.report, "FINAL REPORT");
        assert!(result.memory.is_empty());
    }

    #[tokio::test]
    async fn planner_text_reply_skips_the_unit() {
        let skip_first = AtomicU32::new(0);
        let backend = Scripted::new(move |n, body| {
            if body.tools.is_some() {
                if skip_first.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(ChatCompletion::text("nothing to do here"))
                } else {
                    Ok(ChatCompletion::capability_call(
                        format!("call-{n}"),
                        "emit",
                        &unit_of(body),
                    ))
                }
            } else if is_compaction(body) {
                Ok(ChatCompletion::text(format!("{MEMORY_DELIMITER}\nm")))
            } else {
                Ok(ChatCompletion::text("FINAL REPORT"))
            }
        });
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move { Ok(input) });
        let planner = test_planner();

        let result = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(units(&["skipped", "worked"]))
            .await
            .unwrap();

        // plan + plan + compact + synthesize
        assert_eq!(result.model_calls, 4);
        assert_eq!(result.units_processed, 1);
        assert_eq!(result.report, "FINAL REPORT");
    }

    #[tokio::test]
    async fn consecutive_failures_abort_the_run() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|_| async move { Err("always down".to_string()) });
        let planner = test_planner();

        let err = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(units(&["u1", "u2", "u3", "u4", "u5"]))
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Capability);
        assert!(err.message.contains("consecutive"));
        assert_eq!(err.unit.as_deref(), Some("u3"));
    }

    #[tokio::test]
    async fn unbounded_policy_keeps_raw_history_and_skips_compaction() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|_| async move { Ok("z".repeat(10_000)) });
        let planner = test_planner();

        let config = RunConfig::default().with_bounded(false);
        let result = Run::new(&invoker, &registry, &planner, config)
            .run(units(&["u1", "u2"]))
            .await
            .unwrap();

        // plan + plan + synthesize, no compaction calls
        assert_eq!(result.model_calls, 3);
        assert!(result.memory.is_empty());
        let raw: Vec<&Message> = result
            .history
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .collect();
        assert_eq!(raw.len(), 2);
        for msg in raw {
            assert_eq!(msg.content_chars(), 10_007); // "[emit]\n" prefix
        }
    }

    #[tokio::test]
    async fn stop_signal_cancels_before_planning() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move { Ok(input) });
        let planner = test_planner();

        let err = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .with_stop_signal(|| true)
            .run(units(&["u1"]))
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Planning);
        assert!(err.message.contains("cancelled"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_signal_cancels_before_compaction() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move { Ok(input) });
        let planner = test_planner();

        // polls: planning, capability, compaction; fire on the third
        let polls = AtomicU32::new(0);
        let err = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .with_stop_signal(move || polls.fetch_add(1, Ordering::SeqCst) >= 2)
            .run(units(&["u1"]))
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Compaction);
        assert_eq!(err.unit.as_deref(), Some("u1"));
        // the planning call went out, the compaction call did not
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_signal_cancels_before_synthesis() {
        let backend = standard_backend();
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|input| async move { Ok(input) });
        let planner = test_planner();

        let polls = AtomicU32::new(0);
        let err = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .with_stop_signal(move || polls.fetch_add(1, Ordering::SeqCst) >= 3)
            .run(units(&["u1"]))
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Synthesis);
        assert!(err.unit.is_none());
        // everything learned before the cancellation survives
        assert_eq!(err.memory, "facts so far");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retained_compaction_does_not_lose_memory() {
        let compactions = AtomicU32::new(0);
        let backend = Scripted::new(move |n, body| {
            if body.tools.is_some() {
                Ok(ChatCompletion::capability_call(
                    format!("call-{n}"),
                    "emit",
                    "x",
                ))
            } else if is_compaction(body) {
                if compactions.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(ChatCompletion::text(format!(
                        "{MEMORY_DELIMITER}\nearly facts"
                    )))
                } else {
                    // layout violation: no delimiter
                    Ok(ChatCompletion::text("rambling prose"))
                }
            } else {
                Ok(ChatCompletion::text("FINAL REPORT"))
            }
        });
        let invoker = ModelInvoker::new(&backend, "test-model");
        let registry = emit_registry(|_| async move { Ok("output".to_string()) });
        let planner = test_planner();

        let result = Run::new(&invoker, &registry, &planner, RunConfig::default())
            .run(units(&["u1", "u2"]))
            .await
            .unwrap();

        assert_eq!(result.memory, "early facts");
        assert_eq!(result.units_processed, 2);
    }
}
