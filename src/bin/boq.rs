//! CLI binary for boq-offer.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs one job and prints the results.

use anyhow::{Context, Result};
use boq_offer::job::Stage;
use boq_offer::{
    process_document, purge_expired_jobs, CostFactorConfig, ExtractionOptions, FsJobStore,
    InMemoryCatalog, JobOutput, JobStats, PipelineConfig, PipelineProgressCallback,
    ProgressCallback,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one spinner whose prefix tracks the current stage, a
/// log line per finished stage, and an image counter while downloads run.
/// Image completions arrive out of order from the resolver's worker pool.
struct CliProgressCallback {
    bar: ProgressBar,
    images_seen: AtomicUsize,
    images_done: AtomicUsize,
    images_failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Reading document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            images_seen: AtomicUsize::new(0),
            images_done: AtomicUsize::new(0),
            images_failed: AtomicUsize::new(0),
        })
    }

    fn stage_label(stage: Stage) -> &'static str {
        match stage {
            Stage::Extract => "Extracting",
            Stage::ResolveImages => "Images",
            Stage::Stitch => "Stitching",
            Stage::Cost => "Costing",
        }
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_job_start(&self, job_id: &str, document: &str) {
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(&format!("Job for {document}")),
            dim(job_id)
        ));
    }

    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_prefix(Self::stage_label(stage));
        self.bar.set_message(match stage {
            Stage::Extract => "waiting for the layout service…".to_string(),
            Stage::ResolveImages => "scanning markup…".to_string(),
            Stage::Stitch | Stage::Cost => String::new(),
        });
    }

    fn on_stage_complete(&self, stage: Stage, summary: &str) {
        self.bar.println(format!(
            "  {} {:<10}  {}",
            green("✓"),
            Self::stage_label(stage),
            summary
        ));
    }

    fn on_images_start(&self, _page_index: usize, references: usize) {
        let seen = self.images_seen.fetch_add(references, Ordering::SeqCst) + references;
        let done = self.images_done.load(Ordering::SeqCst);
        self.bar.set_message(format!("{done}/{seen} images"));
    }

    fn on_image_done(&self, reference: &str, resolved: bool) {
        let done = self.images_done.fetch_add(1, Ordering::SeqCst) + 1;
        if !resolved {
            self.images_failed.fetch_add(1, Ordering::SeqCst);
            self.bar
                .println(format!("  {} image {}", red("✗"), dim(reference)));
        }
        let seen = self.images_seen.load(Ordering::SeqCst);
        self.bar.set_message(format!("{done}/{seen} images"));
    }

    fn on_job_complete(&self, stats: &JobStats) {
        self.bar.finish_and_clear();
        let clean = stats.pages_failed == 0 && stats.images_failed == 0;
        eprintln!(
            "{} {}/{} pages, {}/{} images, {} rows priced  {}",
            if clean { green("✔") } else { cyan("⚠") },
            bold(&stats.pages_succeeded.to_string()),
            stats.pages_total,
            stats.images_resolved,
            stats.images_total,
            bold(&stats.rows_priced.to_string()),
            dim(&format!("{}ms", stats.total_ms)),
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract and price a BOQ with default factors
  boq tender.pdf

  # Apply margin, freight and customs from a JSON file
  boq tender.pdf --cost-config factors.json

  # Budgetary / mid-range / high-end variants from a product catalog
  boq tender.pdf --cost-config factors.json --catalog catalog.json --tiers

  # Photo of a single page, JSON output for scripting
  boq page.jpg --json > offer.json

  # Ask the layout service for seal and chart recognition too
  boq tender.pdf --seal --chart

COST CONFIG (JSON, every field optional):
  {
    "margin_pct": "12.5", "freight_pct": "4", "customs_pct": "8",
    "installation_pct": "3", "exchange_rate": "0.92",
    "exchange_scope": "total",
    "additional_costs": [{"name": "Site survey", "amount": "350", "scope": "per_table"}],
    "currency": {"code": "EUR", "minor_units": 2}
  }

CATALOG (JSON):
  {"entries": [{"tier": "mid_range", "product_id": "CH-01",
                "name": "Task chair", "brand": "Acme", "unit_price": "150"}]}

ENVIRONMENT VARIABLES:
  BOQ_LAYOUT_API_URL      Layout service base URL
  BOQ_LAYOUT_API_TOKEN    Layout service access token
  BOQ_WORKDIR             Job store directory
  RUST_LOG                Overrides the log filter
"#;

/// Turn scanned bills of quantities into priced offers.
#[derive(Parser, Debug)]
#[command(
    name = "boq",
    version,
    about = "Turn scanned bills of quantities into priced offers",
    long_about = "Extract the line-item table from a BOQ document (PDF or image, local file or \
URL) with a layout-analysis service, stitch the pages into one table, download embedded \
product images, and cost every row with margin, freight, customs, installation and exchange \
factors. Optionally derive budgetary, mid-range and high-end variants from a product catalog.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF/image path or HTTP/HTTPS URL.
    input: String,

    /// JSON file with cost factors.
    #[arg(long, env = "BOQ_COST_CONFIG")]
    cost_config: Option<PathBuf>,

    /// JSON product catalog used for tier variants.
    #[arg(long, env = "BOQ_CATALOG")]
    catalog: Option<PathBuf>,

    /// Derive budgetary / mid-range / high-end variants (needs --catalog).
    #[arg(long, env = "BOQ_TIERS", requires = "catalog")]
    tiers: bool,

    /// Directory holding one sub-directory per job.
    #[arg(long, env = "BOQ_WORKDIR", default_value = "./boq-jobs")]
    workdir: PathBuf,

    /// Layout service base URL.
    #[arg(long, env = "BOQ_LAYOUT_API_URL")]
    api_url: Option<String>,

    /// Layout service access token.
    #[arg(long, env = "BOQ_LAYOUT_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Recognise formulas.
    #[arg(long, env = "BOQ_FORMULA")]
    formula: bool,

    /// Recognise charts.
    #[arg(long, env = "BOQ_CHART")]
    chart: bool,

    /// Recognise seals and stamps.
    #[arg(long, env = "BOQ_SEAL")]
    seal: bool,

    /// Detect layout regions.
    #[arg(long, env = "BOQ_REGION")]
    region: bool,

    /// Concurrent image downloads (1–8).
    #[arg(long, env = "BOQ_IMAGE_CONCURRENCY", default_value_t = 4,
          value_parser = clap::value_parser!(u64).range(1..=8))]
    image_concurrency: u64,

    /// Per-attempt image download timeout in seconds.
    #[arg(long, env = "BOQ_IMAGE_TIMEOUT", default_value_t = 60)]
    image_timeout: u64,

    /// Download attempts per image reference.
    #[arg(long, env = "BOQ_IMAGE_RETRIES", default_value_t = 3)]
    image_retries: u32,

    /// Delete jobs older than this many hours before running.
    #[arg(long, env = "BOQ_RETENTION_HOURS", default_value_t = 168,
          value_parser = clap::value_parser!(u64).range(1..=87_600))]
    retention_hours: u64,

    /// Output the full JobOutput as JSON instead of a summary.
    #[arg(long, env = "BOQ_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "BOQ_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "BOQ_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "BOQ_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; -v always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    // ── Housekeeping ─────────────────────────────────────────────────────
    let store = FsJobStore::new(&cli.workdir);
    let purged = purge_expired_jobs(&store, &config)
        .await
        .with_context(|| format!("Failed to purge expired jobs in {:?}", cli.workdir))?;
    if !purged.is_empty() && !cli.quiet {
        eprintln!("{}", dim(&format!("purged {} expired job(s)", purged.len())));
    }

    // ── Run job ──────────────────────────────────────────────────────────
    let output = process_document(&cli.input, &store, &config)
        .await
        .with_context(|| format!("Job for '{}' failed", cli.input))?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&output);
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let cost_factors = match cli.cost_config {
        Some(ref path) => read_json::<CostFactorConfig>(path, "cost config").await?,
        None => CostFactorConfig::default(),
    };

    let mut builder = PipelineConfig::builder()
        .extraction(ExtractionOptions {
            formula: cli.formula,
            chart: cli.chart,
            seal: cli.seal,
            region: cli.region,
        })
        .image_concurrency(cli.image_concurrency as usize)
        .image_timeout_secs(cli.image_timeout)
        .image_max_attempts(cli.image_retries)
        .cost_factors(cost_factors)
        .tiers(cli.tiers)
        .retention(Duration::from_secs(cli.retention_hours.saturating_mul(3600)));

    if let Some(ref path) = cli.catalog {
        let catalog = read_json::<InMemoryCatalog>(path, "catalog").await?;
        builder = builder.catalog(Arc::new(catalog));
    }
    if let Some(ref url) = cli.api_url {
        builder = builder.api_url(url);
    }
    if let Some(ref token) = cli.api_token {
        builder = builder.api_token(token);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {what} from {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid {what} in {:?}", path))
}

fn print_summary(output: &JobOutput) {
    let stats = &output.stats;
    let costs = &output.costs;

    println!("Job:        {}", output.job.id);
    println!("Artifacts:  {}", output.artifact_dir.display());
    println!(
        "Pages:      {}/{} extracted{}",
        stats.pages_succeeded,
        stats.pages_total,
        if stats.failed_pages.is_empty() {
            String::new()
        } else {
            red(&format!("  (failed: {:?})", stats.failed_pages))
        }
    );
    println!(
        "Images:     {}/{} resolved",
        stats.images_resolved, stats.images_total
    );
    println!(
        "Rows:       {} total, {} priced, {} unpriced",
        stats.rows_total, stats.rows_priced, stats.rows_unpriced
    );
    println!(
        "Cleanup:    {} repeated header(s), {} separator row(s) dropped, {} row(s) padded",
        stats.headers_dropped, stats.separators_dropped, stats.rows_padded
    );
    println!("Subtotal:   {} {}", costs.subtotal, costs.currency.code);
    println!(
        "Total:      {}",
        bold(&format!("{} {}", costs.grand_total, costs.currency.code))
    );

    if let Some(ref tiers) = output.tiers {
        for variant in tiers.iter() {
            println!(
                "  {:<10} {} {}  {}",
                variant.tier.to_string(),
                variant.sheet.grand_total,
                variant.sheet.currency.code,
                dim(&format!(
                    "{} matched, {} unmatched",
                    variant.matched, variant.unmatched
                )),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_hours_are_bounded() {
        let parse = |hours: &str| Cli::try_parse_from(["boq", "boq.pdf", "--retention-hours", hours]);
        assert_eq!(parse("87600").unwrap().retention_hours, 87_600);
        assert!(parse("87601").is_err());
        assert!(parse("0").is_err());
        assert!(parse("18446744073709551615").is_err());
    }
}
