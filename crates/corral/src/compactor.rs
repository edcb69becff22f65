//! Memory compaction: fold raw capability output into bounded durable memory.
//!
//! After every capability step the raw output is clipped to a bounded prefix
//! and summarized, together with the current durable memory, into a new
//! memory paragraph. The summarization response must follow a strict layout
//! (bullet lines, then [`MEMORY_DELIMITER`] on its own line, then the memory
//! paragraph); anything else fails soft — the prior memory is retained
//! unchanged and the run continues.
//!
//! Invariant: the memory returned by [`Compactor::compact`] never exceeds
//! `max_memory_chars` characters, whatever the model produced.

use crate::invoker::{ModelInvoker, ModelReply};
use crate::Message;
use tracing::{debug, warn};

/// Line separating the bullet recap from the durable memory paragraph in a
/// compaction response. Must appear alone on its own line.
pub const MEMORY_DELIMITER: &str = "===MEMORY===";

/// Configuration for the compaction step.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Maximum characters of raw output passed to the summarizer.
    pub max_output_chars: usize,
    /// Maximum characters of durable memory carried across steps.
    pub max_memory_chars: usize,
    /// Summarization attempts (model errors only) before giving up.
    pub max_attempts: u32,
    /// Bullet lines requested in the recap section.
    pub bullet_lines: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 4_000,
            max_memory_chars: 1_200,
            max_attempts: 3,
            bullet_lines: 3,
        }
    }
}

impl CompactorConfig {
    pub fn with_max_output_chars(mut self, chars: usize) -> Self {
        self.max_output_chars = chars;
        self
    }

    pub fn with_max_memory_chars(mut self, chars: usize) -> Self {
        self.max_memory_chars = chars;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// Result of one compaction step.
#[derive(Debug)]
pub struct Compaction {
    /// The durable memory after this step. Equal to the prior memory when
    /// `updated` is false.
    pub memory: String,
    /// Bullet recap lines extracted from the response (may be empty).
    pub bullets: Vec<String>,
    /// Whether the memory was replaced (false = fail-soft retention).
    pub updated: bool,
    /// Character length of the raw output before clipping.
    pub raw_chars: usize,
    /// Character length actually passed to the summarizer.
    pub clipped_chars: usize,
}

/// Return the longest prefix of `raw` that is at most `max_chars` characters.
///
/// A no-op (same slice back) when the input is already within bounds, so
/// clipping is idempotent.
pub fn clip(raw: &str, max_chars: usize) -> &str {
    match raw.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &raw[..byte_idx],
        None => raw,
    }
}

/// Truncate a string to at most `max_chars` characters, in place semantics.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    clip(s, max_chars).to_string()
}

/// The summarization stage of the loop.
#[derive(Debug, Clone, Default)]
pub struct Compactor {
    config: CompactorConfig,
}

impl Compactor {
    pub fn new(config: CompactorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    fn system_prompt(&self) -> String {
        format!(
            "You maintain the durable memory of an agent working through a multi-step task.\n\
             You are given the current memory and the latest raw step output.\n\
             Respond in EXACTLY this layout:\n\
             1. {} lines, each starting with \"- \", recapping what the latest output showed.\n\
             2. A line containing only {MEMORY_DELIMITER}\n\
             3. A single paragraph of at most {} characters: the updated durable memory.\n\
             The memory paragraph must merge the new findings into the current memory, \
             keeping only durable facts (figures, names, conclusions) and dropping \
             anything restatable from the task itself. Deduplicate aggressively.",
            self.config.bullet_lines, self.config.max_memory_chars
        )
    }

    /// Summarize `raw` output into an updated durable memory.
    ///
    /// Model errors are retried up to `max_attempts` times; a response that
    /// does not follow the layout is not retried — the prior memory is
    /// retained (`updated: false`) and the loop moves on.
    pub async fn compact(
        &self,
        invoker: &ModelInvoker<'_>,
        memory: &str,
        raw: &str,
    ) -> Result<Compaction, String> {
        let raw_chars = raw.chars().count();
        let clipped = clip(raw, self.config.max_output_chars);
        let clipped_chars = clipped.chars().count();
        if clipped_chars < raw_chars {
            debug!("Clipped raw output {raw_chars} -> {clipped_chars} chars before summarization");
        }

        let user = format!(
            "Current durable memory:\n{}\n\nLatest step output:\n{clipped}",
            if memory.is_empty() { "(empty)" } else { memory }
        );
        let messages = vec![Message::system(self.system_prompt()), Message::user(user)];

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            match invoker.complete(messages.clone(), None).await {
                Ok(ModelReply::Text(text)) => {
                    return Ok(self.parse(memory, &text, raw_chars, clipped_chars));
                }
                Ok(ModelReply::Capabilities(_)) => {
                    // No tools were offered; an unexpected tool call is a
                    // layout violation, not a transport failure.
                    warn!("Compaction reply requested capabilities; retaining prior memory");
                    return Ok(self.retained(memory, raw_chars, clipped_chars));
                }
                Err(e) => {
                    warn!(
                        "Compaction attempt {attempt}/{} failed: {e}",
                        self.config.max_attempts
                    );
                    last_error = e;
                }
            }
        }

        Err(format!(
            "compaction failed after {} attempts: {last_error}",
            self.config.max_attempts
        ))
    }

    fn retained(&self, memory: &str, raw_chars: usize, clipped_chars: usize) -> Compaction {
        Compaction {
            memory: truncate_chars(memory, self.config.max_memory_chars),
            bullets: Vec::new(),
            updated: false,
            raw_chars,
            clipped_chars,
        }
    }

    /// Parse a summarization response. Strict on the delimiter, lenient on
    /// everything around it.
    fn parse(&self, memory: &str, text: &str, raw_chars: usize, clipped_chars: usize) -> Compaction {
        let mut lines = text.lines();
        let mut bullets = Vec::new();
        let mut found_delimiter = false;
        for line in lines.by_ref() {
            let trimmed = line.trim();
            if trimmed == MEMORY_DELIMITER {
                found_delimiter = true;
                break;
            }
            if trimmed.starts_with("- ") || trimmed.starts_with("* ") {
                bullets.push(trimmed.get(2..).unwrap_or_default().trim().to_string());
            }
        }

        if !found_delimiter {
            warn!("Compaction reply missing {MEMORY_DELIMITER}; retaining prior memory");
            return self.retained(memory, raw_chars, clipped_chars);
        }

        let paragraph = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        if paragraph.is_empty() {
            warn!("Compaction reply has empty memory section; retaining prior memory");
            return self.retained(memory, raw_chars, clipped_chars);
        }

        let new_memory = truncate_chars(&paragraph, self.config.max_memory_chars);
        debug!(
            "Memory updated: {} -> {} chars ({} bullet(s))",
            memory.chars().count(),
            new_memory.chars().count(),
            bullets.len()
        );
        Compaction {
            memory: new_memory,
            bullets,
            updated: true,
            raw_chars,
            clipped_chars,
        }
    }
}
