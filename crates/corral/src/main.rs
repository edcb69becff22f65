//! Run the pension-analysis workload against an OpenAI-compatible endpoint.
//!
//! Reads the API key from the `OPENAI_API_KEY` environment variable
//! (defaults to `EMPTY` for local vLLM servers).
//!
//! # Examples
//!
//! ```sh
//! # Analyze the default company list against a local vLLM server
//! corral
//!
//! # A custom company list, different model
//! corral --company ACME_Corp --company GlobalTech \
//!   --model openai/gpt-oss-120b --base-url http://localhost:8000/v1
//!
//! # Tighter memory budget
//! corral --max-memory-chars 800 --max-output-chars 2000
//!
//! # The unbounded baseline, for comparison
//! corral --naive
//! ```

use clap::Parser;
use corral::prelude::*;
use corral::sim;
use std::process;
use std::time::Duration;

const DEFAULT_COMPANIES: &[&str] = &[
    "ACME_Corp",
    "GlobalTech",
    "SafeHaven_Insurance",
    "PensionFirst",
    "RetireWell",
    "FutureSecure",
    "StableGrowth",
    "LongHorizon",
];

const PENSION_SYSTEM_PROMPT: &str = "\
You are a financial quant agent producing a pension program masterplan. You \
analyze one company at a time under a strict context budget: raw reports and \
simulation output from earlier steps are gone, and everything durable you \
have learned is in the memory section of each prompt. During work steps, \
invoke the requested capabilities via tool calls; do not answer in prose. \
Figures you will need for the final masterplan (revenue, EBITDA, pension \
fund assets, liability ratios, simulation statistics) must survive in the \
durable memory.";

/// Run the pension-analysis workload against an OpenAI-compatible endpoint.
///
/// Reads the API key from the OPENAI_API_KEY environment variable.
#[derive(Parser)]
#[command(name = "corral")]
struct Cli {
    // ── Workload ───────────────────────────────────────────────
    /// Company to analyze (repeatable; defaults to the standard list)
    #[arg(long = "company")]
    companies: Vec<String>,

    /// Run the unbounded baseline: no compaction, full history sent to
    /// every call
    #[arg(long)]
    naive: bool,

    // ── Model ──────────────────────────────────────────────────
    /// Model to use for all calls
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.2)]
    temperature: f32,

    /// Maximum tokens per completion (0 = let the server decide)
    #[arg(long, default_value_t = 0)]
    max_tokens: u32,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,

    /// Retries for transient API failures
    #[arg(long, default_value_t = 2)]
    retries: u32,

    // ── Memory budget ──────────────────────────────────────────
    /// Ceiling on durable memory, in characters
    #[arg(long, default_value_t = 1_200)]
    max_memory_chars: usize,

    /// Ceiling on raw output passed to the compactor, in characters
    #[arg(long, default_value_t = 4_000)]
    max_output_chars: usize,

    // ── Output ─────────────────────────────────────────────────
    /// Log every loop event
    #[arg(long, short)]
    verbose: bool,
}

// ── Helpers ────────────────────────────────────────────────────────

/// Render a fixed-width progress bar, e.g. `[████░░░░░░] 3/8 (38%)`.
fn progress_bar(current: usize, total: usize, width: usize) -> String {
    let filled = if total == 0 {
        width
    } else {
        (current * width) / total
    };
    let percent = if total == 0 {
        100
    } else {
        (current * 100) / total
    };
    format!(
        "[{}{}] {current}/{total} ({percent}%)",
        "█".repeat(filled),
        "░".repeat(width - filled)
    )
}

fn pension_planner() -> Planner {
    Planner::new()
        .with_system_prompt(PENSION_SYSTEM_PROMPT)
        .with_unit_instructions(|ctx| {
            format!(
                "Analyze {company}. Call fetch_annual_report with input '{company}' to get \
                 the annual report, and call run_monte_carlo with input \
                 '{company}_portfolio' to simulate its pension portfolio. Both outputs \
                 will be summarized into your memory automatically.",
                company = ctx.unit
            )
        })
}

fn run_config(cli: &Cli) -> RunConfig {
    RunConfig::default()
        .with_max_memory_chars(cli.max_memory_chars)
        .with_max_output_chars(cli.max_output_chars)
        .with_bounded(!cli.naive)
        .with_synthesis_instructions(
            "All companies are analyzed. Write the pension program masterplan: for each \
             company, its key financials and simulation results, then a comparative \
             ranking and an overall allocation recommendation.",
        )
}

async fn execute(cli: &Cli, client: &ChatClient) -> Result<(), RunError> {
    let companies: Vec<String> = if cli.companies.is_empty() {
        DEFAULT_COMPANIES.iter().map(|s| s.to_string()).collect()
    } else {
        cli.companies.clone()
    };

    let invoker = ModelInvoker::new(client, &cli.model)
        .with_timeout(Duration::from_secs(cli.timeout_secs))
        .with_retry(RetryConfig::with_retries(cli.retries))
        .with_temperature(cli.temperature)
        .with_max_tokens(cli.max_tokens);

    let registry = sim::workload_registry();
    let planner = pension_planner();

    let progress = FnEventHandler::new(|event| match event {
        RunEvent::UnitComplete { unit, index, total } => {
            eprintln!("  {} {unit}", progress_bar(index + 1, *total, 30));
        }
        RunEvent::Synthesizing { memory_chars } => {
            eprintln!("  synthesizing masterplan from {memory_chars} chars of memory");
        }
        _ => {}
    });
    let handler = CompositeEventHandler::new()
        .with(progress)
        .with_if(cli.verbose, LoggingHandler);

    let result = Run::new(&invoker, &registry, &planner, run_config(cli))
        .with_event_handler(&handler)
        .run(companies)
        .await?;

    println!("{}", result.report);
    eprintln!(
        "\n  {} unit(s), {} model call(s), memory {} chars, {}s",
        result.units_processed,
        result.model_calls,
        result.memory.chars().count(),
        (result.finished_at - result.started_at).num_seconds(),
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "EMPTY".to_string());
    let client = match ChatClient::new(&cli.base_url, api_key) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = execute(&cli, &client).await {
        eprintln!("Error: {e}");
        if !e.memory.is_empty() {
            eprintln!("Durable memory at failure:\n{}", e.memory);
        }
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_renders_proportionally() {
        assert_eq!(progress_bar(0, 8, 8), "[░░░░░░░░] 0/8 (0%)");
        assert_eq!(progress_bar(4, 8, 8), "[████░░░░] 4/8 (50%)");
        assert_eq!(progress_bar(8, 8, 8), "[████████] 8/8 (100%)");
    }

    #[test]
    fn progress_bar_handles_zero_total() {
        assert_eq!(progress_bar(0, 0, 4), "[████] 0/0 (100%)");
    }

    #[test]
    fn pension_planner_instructions_name_both_capabilities() {
        let planner = pension_planner();
        let ctx = UnitContext {
            unit: "ACME_Corp",
            index: 0,
            total: 8,
            memory: "",
        };
        let prompt = planner.unit_prompt(&ctx);
        assert!(prompt.contains("fetch_annual_report"));
        assert!(prompt.contains("ACME_Corp_portfolio"));
    }
}
