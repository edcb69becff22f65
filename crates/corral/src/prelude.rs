//! Convenience re-exports for the common case.
//!
//! ```ignore
//! use corral::prelude::*;
//! ```

pub use crate::api::RetryConfig;
pub use crate::capability::{
    Capability, CapabilityRegistry, CapabilityRequest, FnCapability,
};
pub use crate::compactor::{Compaction, Compactor, CompactorConfig, MEMORY_DELIMITER};
pub use crate::events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler, RunEvent,
};
pub use crate::invoker::{ModelBackend, ModelInvoker, ModelReply};
pub use crate::planner::{Planner, PlannerDecision, UnitContext};
pub use crate::run::{Run, RunConfig, RunError, RunResult, Stage};
pub use crate::{
    ChatClient, ChatCompletion, Message, MessageRole, ToolDef, DEFAULT_BASE_URL, DEFAULT_MODEL,
};
