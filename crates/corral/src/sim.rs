//! Simulated workload capabilities for demos and benchmarks.
//!
//! Three capabilities exercise the loop without external services:
//!
//! - `fetch_annual_report` produces a deliberately huge (~150k character)
//!   document with a handful of real figures buried in filler, forcing the
//!   compaction path.
//! - `run_monte_carlo` produces 100 rows of simulated portfolio statistics.
//! - `quick_math` evaluates an arithmetic expression.
//!
//! All output is deterministic: the generator is seeded from the input
//! string, so the same request always yields the same document.

use crate::capability::{Capability, CapabilityFuture, CapabilityRegistry};

// ── Deterministic generator ────────────────────────────────────────

/// SplitMix64 generator seeded from a string. Deterministic filler text is
/// all this needs; not worth pulling in rand.
struct Gen {
    state: u64,
}

impl Gen {
    fn seeded_from(input: &str) -> Self {
        // FNV-1a over the input bytes
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in input.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Self { state: hash }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform value in `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform value in `[lo, hi)`.
    fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + self.next_f64() * (hi - lo)
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[(self.next_u64() % items.len() as u64) as usize]
    }
}

const FILLER_WORDS: &[&str] = &[
    "pursuant", "thereof", "fiscal", "allocation", "actuarial", "statement", "herein",
    "disclosure", "liability", "consolidated", "portfolio", "benchmark", "annuity",
    "covenant", "amortized", "notwithstanding", "fiduciary", "indexation", "solvency",
    "derivative", "provision", "valuation", "accrued", "custodian",
];

// ── fetch_annual_report ────────────────────────────────────────────

/// Simulated document ingestion: returns a very large annual report for the
/// named company.
pub struct FetchAnnualReport;

const REPORT_PAGES: usize = 50;
const WORDS_PER_PAGE: usize = 400;

fn generate_report(company: &str) -> String {
    let mut generator = Gen::seeded_from(company);
    let mut pages = Vec::with_capacity(REPORT_PAGES);
    for page in 1..=REPORT_PAGES {
        let quarter = 1 + (generator.next_u64() % 4);
        let year = 2020 + (generator.next_u64() % 6);
        let mut text = format!("PAGE {page} - Q{quarter} {year} REPORT\n");
        text.push_str(&format!(
            "Revenue: ${:.1}M\nEBITDA: ${:.1}M\nPension Fund Assets: ${:.1}M\nLiability Ratio: {:.2}\n",
            generator.range(50.0, 950.0),
            generator.range(10.0, 190.0),
            generator.range(100.0, 2_100.0),
            generator.range(0.5, 1.5),
        ));
        let filler: Vec<&str> = (0..WORDS_PER_PAGE)
            .map(|_| generator.pick(FILLER_WORDS))
            .collect();
        text.push_str(&filler.join(" "));
        pages.push(text);
    }
    format!(
        "PARSED_REPORT for {company}:\n<ANNUAL_REPORT company='{company}'>\n{}\n</ANNUAL_REPORT>",
        pages.join("\n\n---\n\n")
    )
}

impl Capability for FetchAnnualReport {
    fn name(&self) -> &str {
        "fetch_annual_report"
    }

    fn description(&self) -> &str {
        "Fetch the full annual report for a company. Input: the company name. \
         Returns the complete report text (very large)."
    }

    fn invoke(&self, input: &str) -> CapabilityFuture<'_> {
        let company = input.trim().to_string();
        Box::pin(async move {
            if company.is_empty() {
                return Err("fetch_annual_report requires a company name".to_string());
            }
            Ok(generate_report(&company))
        })
    }
}

// ── run_monte_carlo ────────────────────────────────────────────────

/// Simulated compute step: 100 rows of portfolio simulation statistics for
/// the named scenario.
pub struct RunMonteCarlo;

const SIMULATION_RUNS: usize = 100;

fn generate_simulation(scenario: &str) -> String {
    let mut generator = Gen::seeded_from(scenario);
    let mut rows = Vec::with_capacity(SIMULATION_RUNS + 1);
    rows.push(format!("MONTE_CARLO_RESULTS for {scenario} ({SIMULATION_RUNS} runs):"));
    for run in 0..SIMULATION_RUNS {
        rows.push(format!(
            "Run_{run:03}: mean_return={:.4}, var={:.4}, sharpe={:.3}, max_drawdown={:.3}",
            generator.range(-0.05, 0.15),
            generator.range(0.001, 0.05),
            generator.range(-0.5, 2.5),
            generator.range(0.05, 0.6),
        ));
    }
    rows.join("\n")
}

impl Capability for RunMonteCarlo {
    fn name(&self) -> &str {
        "run_monte_carlo"
    }

    fn description(&self) -> &str {
        "Run a Monte Carlo portfolio simulation. Input: a scenario name. \
         Returns per-run statistics."
    }

    fn invoke(&self, input: &str) -> CapabilityFuture<'_> {
        let scenario = input.trim().to_string();
        Box::pin(async move {
            if scenario.is_empty() {
                return Err("run_monte_carlo requires a scenario name".to_string());
            }
            Ok(generate_simulation(&scenario))
        })
    }
}

// ── quick_math ─────────────────────────────────────────────────────

/// Arithmetic expression evaluator: `+ - * /`, parentheses, unary minus.
pub struct QuickMath;

impl Capability for QuickMath {
    fn name(&self) -> &str {
        "quick_math"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Input: the expression, e.g. \
         '(4100 + 3800) / 2'."
    }

    fn invoke(&self, input: &str) -> CapabilityFuture<'_> {
        let expr = input.trim().to_string();
        Box::pin(async move {
            let value = eval(&expr)?;
            Ok(format!("{expr} = {value}"))
        })
    }
}

/// Evaluate an infix arithmetic expression.
pub fn eval(expr: &str) -> Result<f64, String> {
    let tokens: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "unexpected character '{}' at position {}",
            parser.tokens[parser.pos], parser.pos
        ));
    }
    Ok(value)
}

struct Parser {
    tokens: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expression(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek()
            && (op == '+' || op == '-')
        {
            self.pos += 1;
            let rhs = self.term()?;
            if op == '+' {
                value += rhs;
            } else {
                value -= rhs;
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek()
            && (op == '*' || op == '/')
        {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    return Err("division by zero".to_string());
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some('(') => {
                self.pos += 1;
                let value = self.expression()?;
                if self.peek() != Some(')') {
                    return Err("missing closing parenthesis".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) => Err(format!("unexpected character '{c}'")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn number(&mut self) -> Result<f64, String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        let literal: String = self.tokens[start..self.pos].iter().collect();
        literal
            .parse::<f64>()
            .map_err(|_| format!("invalid number '{literal}'"))
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// The standard simulated workload: document fetch, simulation, calculator.
pub fn workload_registry() -> CapabilityRegistry {
    CapabilityRegistry::new()
        .with(FetchAnnualReport)
        .with(RunMonteCarlo)
        .with(QuickMath)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_is_large_and_deterministic() {
        let a = FetchAnnualReport.invoke("ACME_Corp").await.unwrap();
        let b = FetchAnnualReport.invoke("ACME_Corp").await.unwrap();
        assert_eq!(a, b);
        assert!(a.chars().count() > 100_000, "got {} chars", a.chars().count());
        assert!(a.starts_with("PARSED_REPORT for ACME_Corp:"));
        assert!(a.contains("Pension Fund Assets"));
        assert_eq!(a.matches("PAGE ").count(), REPORT_PAGES);
    }

    #[tokio::test]
    async fn different_companies_get_different_reports() {
        let a = FetchAnnualReport.invoke("ACME_Corp").await.unwrap();
        let b = FetchAnnualReport.invoke("GlobalTech").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn empty_company_rejected() {
        assert!(FetchAnnualReport.invoke("  ").await.is_err());
    }

    #[tokio::test]
    async fn monte_carlo_has_one_row_per_run() {
        let out = RunMonteCarlo.invoke("ACME_portfolio").await.unwrap();
        assert_eq!(out.lines().count(), SIMULATION_RUNS + 1);
        assert!(out.contains("Run_099:"));
        assert!(out.contains("sharpe="));
    }

    #[test]
    fn eval_handles_precedence_and_parens() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), 7.0);
        assert_eq!(eval("(1 + 2) * 3").unwrap(), 9.0);
        assert_eq!(eval("-4 + 10 / 2").unwrap(), 1.0);
        assert_eq!(eval("(4100 + 3800) / 2").unwrap(), 3950.0);
    }

    #[test]
    fn eval_rejects_bad_input() {
        assert!(eval("").is_err());
        assert!(eval("1 +").is_err());
        assert!(eval("(1 + 2").is_err());
        assert!(eval("1 / 0").is_err());
        assert!(eval("2 ^ 3").is_err());
    }

    #[test]
    fn workload_registry_exposes_three_capabilities() {
        let registry = workload_registry();
        assert_eq!(
            registry.names(),
            ["fetch_annual_report", "quick_math", "run_monte_carlo"]
        );
    }
}
