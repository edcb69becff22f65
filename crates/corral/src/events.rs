//! Run observability: events emitted by the orchestration loop.
//!
//! Implement [`EventHandler`] to observe a run — drive a progress bar, log
//! structured output, collect metrics. Handlers are synchronous and must be
//! cheap; the loop calls them inline.

use crate::run::Stage;
use tracing::{debug, info, warn};

/// An event emitted during a run. Borrowed data; copy out what you need.
#[derive(Debug)]
pub enum RunEvent<'a> {
    /// A planning call is about to be issued for a work unit.
    PlanningStart {
        unit: &'a str,
        index: usize,
        total: usize,
        memory_chars: usize,
    },
    /// The planner answered with text instead of capability requests; the
    /// unit is skipped and the loop moves to the next one.
    UnitSkipped { unit: &'a str, response_chars: usize },
    /// A capability invocation is starting.
    CapabilityInvoking { name: &'a str, input: &'a str },
    /// A capability returned output.
    CapabilityResult { name: &'a str, chars: usize },
    /// A capability failed; its error becomes run data.
    CapabilityFailed { name: &'a str, error: &'a str },
    /// Raw output was compacted into durable memory.
    Compacted {
        raw_chars: usize,
        clipped_chars: usize,
        memory_chars: usize,
    },
    /// The compaction reply could not be parsed; prior memory retained.
    CompactionRetained { reason: &'a str },
    /// A work unit finished (capability output compacted, history stubbed).
    UnitComplete {
        unit: &'a str,
        index: usize,
        total: usize,
    },
    /// The final synthesis call is about to be issued.
    Synthesizing { memory_chars: usize },
    /// The run produced its final report.
    Finished { report_chars: usize },
    /// The stop signal fired; the run is aborting at the given stage.
    Cancelled { stage: Stage },
}

/// Observer for [`RunEvent`]s. All methods have defaults; implement only
/// what you care about.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, _event: &RunEvent<'_>) {}
}

/// Handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

/// Handler that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &RunEvent<'_>) {
        match event {
            RunEvent::PlanningStart {
                unit,
                index,
                total,
                memory_chars,
            } => info!("[plan] unit {}/{total}: {unit} (memory {memory_chars} chars)", index + 1),
            RunEvent::UnitSkipped { unit, response_chars } => {
                warn!("[plan] unit {unit} skipped: planner answered {response_chars} chars of text")
            }
            RunEvent::CapabilityInvoking { name, input } => {
                let preview: String = input.chars().take(80).collect();
                info!("[invoke] {name}({preview})")
            }
            RunEvent::CapabilityResult { name, chars } => {
                debug!("[invoke] {name} returned {chars} chars")
            }
            RunEvent::CapabilityFailed { name, error } => warn!("[invoke] {name} failed: {error}"),
            RunEvent::Compacted {
                raw_chars,
                clipped_chars,
                memory_chars,
            } => info!("[compact] {raw_chars} raw -> {clipped_chars} clipped -> memory {memory_chars} chars"),
            RunEvent::CompactionRetained { reason } => {
                warn!("[compact] prior memory retained: {reason}")
            }
            RunEvent::UnitComplete { unit, index, total } => {
                info!("[unit] {}/{total} complete: {unit}", index + 1)
            }
            RunEvent::Synthesizing { memory_chars } => {
                info!("[synthesize] from {memory_chars} chars of memory")
            }
            RunEvent::Finished { report_chars } => info!("[done] report: {report_chars} chars"),
            RunEvent::Cancelled { stage } => warn!("[cancel] stopping at {stage} stage"),
        }
    }
}

/// Handler built from a closure.
pub struct FnEventHandler<F>
where
    F: Fn(&RunEvent<'_>) + Send + Sync,
{
    f: F,
}

impl<F> FnEventHandler<F>
where
    F: Fn(&RunEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&RunEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent<'_>) {
        (self.f)(event)
    }
}

/// Fans events out to several handlers in registration order.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler (builder-friendly for CLI flags).
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &RunEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}
