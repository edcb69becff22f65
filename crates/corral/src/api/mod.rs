//! API interaction support shared by the model-facing modules.
//!
//! - [`retry`] — transient error detection (429, 5xx, network timeouts) with
//!   configurable exponential backoff and jitter. Never retries 400/401
//!   errors, and never retries semantic failures (malformed model output) —
//!   those are the caller's responsibility.

pub mod retry;

pub use retry::RetryConfig;
