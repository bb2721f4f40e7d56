//! Job orchestration: the four pipeline stages with full barriers between
//! them.
//!
//! ```text
//! extract ──▶ resolve_images ──▶ stitch ──▶ cost (+ tiers)
//! ```
//!
//! ## Why barriers?
//!
//! Stitching needs every page before it can decide which rows are repeated
//! headers, and costing needs the stitched table. Running the stages
//! strictly one after another keeps each stage pure with respect to the
//! previous one's output and makes the persisted artifacts line up with the
//! stage that produced them. Concurrency lives inside a stage (image
//! downloads, tier costing), never across stages.
//!
//! Every stage entry checks the job's cancellation token. Any fatal error
//! marks the job `failed` in the store before it is returned.

use crate::config::{PipelineConfig, ENV_LAYOUT_API_TOKEN, ENV_LAYOUT_API_URL};
use crate::error::{ExtractionError, PageError, PipelineError, StoreError};
use crate::job::{ExtractionJob, JobId, JobStatus, Stage};
use crate::output::{JobOutput, JobStats};
use crate::pipeline::extract::{HttpLayoutClient, LayoutService, DEFAULT_LAYOUT_API_URL};
use crate::pipeline::images::{HttpImageFetcher, ImageFetcher, ImageResolver};
use crate::pipeline::input::{self, Document};
use crate::pipeline::{costing, stitch, tiers};
use crate::store::{JobStore, PRICED_FILE, STITCHED_FILE, TIERS_FILE};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Run the whole pipeline for a local file path or HTTP(S) URL.
///
/// # Returns
/// `Ok(JobOutput)` when the job completed, even if some pages failed
/// extraction or some images could not be resolved (check `output.stats`).
///
/// # Errors
/// Returns `Err(PipelineError)` only for fatal errors:
/// - the input cannot be read or is not a PDF/image
/// - the layout service is unreachable or rejects the document
/// - a page's markup is structurally corrupt
/// - the job was cancelled
pub async fn process_document(
    input_str: impl AsRef<str>,
    store: &dyn JobStore,
    config: &PipelineConfig,
) -> Result<JobOutput, PipelineError> {
    let input_str = input_str.as_ref();
    info!("Starting job for: {}", input_str);
    let document = input::resolve_input(input_str, config.download_timeout_secs).await?;
    run_document(document, store, config).await
}

/// Run the pipeline on an in-memory document.
pub async fn process_bytes(
    name: impl Into<String>,
    bytes: Vec<u8>,
    store: &dyn JobStore,
    config: &PipelineConfig,
) -> Result<JobOutput, PipelineError> {
    let document = Document::from_bytes(name, bytes)?;
    run_document(document, store, config).await
}

/// Synchronous wrapper around [`process_document`].
///
/// Creates a temporary tokio runtime internally.
pub fn process_document_sync(
    input_str: impl AsRef<str>,
    store: &dyn JobStore,
    config: &PipelineConfig,
) -> Result<JobOutput, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(process_document(input_str, store, config))
}

/// Delete every job in `store` older than `config.retention`.
///
/// Returns the purged ids. Jobs still running are never old enough to match
/// because every stage transition refreshes `updated_at`.
pub async fn purge_expired_jobs(
    store: &dyn JobStore,
    config: &PipelineConfig,
) -> Result<Vec<JobId>, StoreError> {
    let purged = store.purge_expired(config.retention).await?;
    if !purged.is_empty() {
        info!(
            "Purged {} job(s) older than {}h",
            purged.len(),
            config.retention.as_secs() / 3600
        );
    }
    Ok(purged)
}

/// Create the job record, run every stage, and persist the outcome.
pub async fn run_document(
    document: Document,
    store: &dyn JobStore,
    config: &PipelineConfig,
) -> Result<JobOutput, PipelineError> {
    let mut job = ExtractionJob::new(document.name.clone(), config.extraction);
    let artifact_dir = store.claim_artifact_dir(&job.id).await?;
    store.put(&job).await?;
    info!("Job {} created for '{}'", job.id, document.name);
    if let Some(ref cb) = config.progress_callback {
        cb.on_job_start(&job.id.to_string(), &document.name);
    }

    match execute(&document, &mut job, &artifact_dir, store, config).await {
        Ok(output) => Ok(output),
        Err(e) => {
            warn!("Job {} failed: {}", job.id, e);
            job.fail(e.to_string());
            if let Err(store_err) = store.put(&job).await {
                warn!("Job {}: could not persist failure: {}", job.id, store_err);
            }
            Err(e)
        }
    }
}

async fn execute(
    document: &Document,
    job: &mut ExtractionJob,
    artifact_dir: &Path,
    store: &dyn JobStore,
    config: &PipelineConfig,
) -> Result<JobOutput, PipelineError> {
    let total_start = Instant::now();
    let mut stats = JobStats::default();
    job.transition(JobStatus::InProgress)?;
    store.put(job).await?;

    // ── Stage 1: Extract ─────────────────────────────────────────────────
    enter(Stage::Extract, config)?;
    let stage_start = Instant::now();
    let service = resolve_layout_service(config)?;
    let handle = service
        .submit(document, &job.options)
        .await
        .map_err(fatal_extraction)?;
    debug!("Job {}: remote job {}", job.id, handle.remote_id);

    let (fragments, page_errors): (_, Vec<PageError>) = match service.fetch(&handle).await {
        Ok(fragments) => (fragments, Vec::new()),
        Err(ExtractionError::PartialResult { fragments, failed }) => {
            for e in &failed {
                warn!("Job {}: {}", job.id, e);
            }
            (fragments, failed)
        }
        Err(e) => return Err(fatal_extraction(e)),
    };

    let mut pages: Vec<usize> = fragments
        .iter()
        .map(|f| f.page_index)
        .chain(page_errors.iter().map(|e| e.page().saturating_sub(1)))
        .collect();
    pages.sort_unstable();
    pages.dedup();
    job.pages = pages;
    store.put(job).await?;

    stats.pages_succeeded = fragments.len();
    stats.pages_failed = page_errors.len();
    stats.pages_total = stats.pages_succeeded + stats.pages_failed;
    stats.failed_pages = page_errors.iter().map(PageError::page).collect();
    stats.extract_ms = elapsed_ms(stage_start);
    complete(
        Stage::Extract,
        config,
        format!(
            "{}/{} page(s) extracted",
            stats.pages_succeeded, stats.pages_total
        ),
    );

    // ── Stage 2: Resolve images ──────────────────────────────────────────
    enter(Stage::ResolveImages, config)?;
    let stage_start = Instant::now();
    let mut resolver = ImageResolver::new(resolve_image_fetcher(config)?, config.retry_policy())
        .with_concurrency(config.image_concurrency)
        .with_cancellation(config.cancellation.clone());
    if let Some(ref cb) = config.progress_callback {
        resolver = resolver.with_progress(Arc::clone(cb));
    }
    let resolution = resolver.resolve_fragments(&fragments, artifact_dir).await;
    stats.images_total = resolution.total;
    stats.images_resolved = resolution.resolved;
    stats.images_failed = resolution.total - resolution.resolved;
    stats.resolve_ms = elapsed_ms(stage_start);
    complete(
        Stage::ResolveImages,
        config,
        format!(
            "{}/{} image(s) resolved",
            stats.images_resolved, stats.images_total
        ),
    );

    // ── Stage 3: Stitch ──────────────────────────────────────────────────
    enter(Stage::Stitch, config)?;
    let stage_start = Instant::now();
    let (table, stitch_stats) = stitch::stitch(&resolution.fragments, &config.stitch)?;
    store
        .write_artifact(&job.id, STITCHED_FILE, to_json(&table, artifact_dir, STITCHED_FILE)?)
        .await?;
    stats.headers_dropped = stitch_stats.headers_dropped;
    stats.separators_dropped = stitch_stats.separators_dropped;
    stats.rows_padded = stitch_stats.rows_padded;
    stats.stitch_ms = elapsed_ms(stage_start);
    complete(
        Stage::Stitch,
        config,
        format!("{} row(s) × {} column(s)", table.rows.len(), table.width),
    );

    // ── Stage 4: Cost ────────────────────────────────────────────────────
    enter(Stage::Cost, config)?;
    let stage_start = Instant::now();
    let costs = costing::cost(&table, &config.cost_factors)?;
    store
        .write_artifact(&job.id, PRICED_FILE, to_json(&costs, artifact_dir, PRICED_FILE)?)
        .await?;

    let tier_set = match (&config.catalog, config.tiers) {
        (Some(catalog), true) => {
            let set = tiers::derive_tiers(&table, &config.cost_factors, catalog.as_ref())?;
            store
                .write_artifact(&job.id, TIERS_FILE, to_json(&set, artifact_dir, TIERS_FILE)?)
                .await?;
            Some(set)
        }
        _ => None,
    };

    stats.rows_total = costs.rows.len();
    stats.rows_priced = costs.priced_rows;
    stats.rows_unpriced = costs.unpriced_rows;
    stats.cost_ms = elapsed_ms(stage_start);
    complete(
        Stage::Cost,
        config,
        format!(
            "{} priced, {} unpriced, total {} {}",
            costs.priced_rows, costs.unpriced_rows, costs.grand_total, costs.currency.code
        ),
    );

    job.transition(JobStatus::Completed)?;
    store.put(job).await?;
    stats.total_ms = elapsed_ms(total_start);

    info!(
        "Job {} complete: {}/{} pages, {}/{} images, {} rows in {}ms",
        job.id,
        stats.pages_succeeded,
        stats.pages_total,
        stats.images_resolved,
        stats.images_total,
        stats.rows_total,
        stats.total_ms
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_job_complete(&stats);
    }

    Ok(JobOutput {
        job: job.clone(),
        artifact_dir: artifact_dir.to_path_buf(),
        table,
        costs,
        tiers: tier_set,
        images: resolution.references,
        page_errors,
        stats,
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn enter(stage: Stage, config: &PipelineConfig) -> Result<(), PipelineError> {
    if config.cancellation.is_cancelled() {
        return Err(PipelineError::Cancelled { stage });
    }
    debug!("Stage {} started", stage);
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(stage);
    }
    Ok(())
}

fn complete(stage: Stage, config: &PipelineConfig, summary: String) {
    info!("Stage {}: {}", stage, summary);
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(stage, &summary);
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn to_json<T: Serialize>(value: &T, dir: &Path, name: &str) -> Result<Vec<u8>, PipelineError> {
    serde_json::to_vec_pretty(value).map_err(|source| {
        PipelineError::Store(StoreError::Serde {
            path: dir.join(name),
            source,
        })
    })
}

/// Map an extraction failure that stops the job.
fn fatal_extraction(e: ExtractionError) -> PipelineError {
    match e {
        ExtractionError::Unreachable { detail } => PipelineError::UpstreamUnavailable { detail },
        ExtractionError::Rejected { detail } => PipelineError::MalformedInput { detail },
        other @ ExtractionError::PartialResult { .. } => {
            PipelineError::Internal(format!("unexpected partial result: {other}"))
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve the layout service, from most-specific to least-specific:
///
/// 1. **Pre-built service** (`config.layout_service`), used as-is. Tests and
///    alternative backends plug in here.
/// 2. **Configured URL** (`config.api_url`), with `config.api_token` or
///    `BOQ_LAYOUT_API_TOKEN`.
/// 3. **Environment** (`BOQ_LAYOUT_API_URL`).
/// 4. [`DEFAULT_LAYOUT_API_URL`], a locally running service.
fn resolve_layout_service(config: &PipelineConfig) -> Result<Arc<dyn LayoutService>, PipelineError> {
    if let Some(ref service) = config.layout_service {
        return Ok(Arc::clone(service));
    }

    let url = config
        .api_url
        .clone()
        .or_else(|| env_non_empty(ENV_LAYOUT_API_URL))
        .unwrap_or_else(|| DEFAULT_LAYOUT_API_URL.to_string());
    let token = config
        .api_token
        .clone()
        .or_else(|| env_non_empty(ENV_LAYOUT_API_TOKEN));
    debug!("Using layout service at {}", url);

    let client = HttpLayoutClient::new(
        url,
        token,
        Duration::from_secs(config.request_timeout_secs),
        Duration::from_millis(config.poll_interval_ms),
        Duration::from_secs(config.extraction_deadline_secs),
    )
    .map_err(fatal_extraction)?;
    Ok(Arc::new(client))
}

fn resolve_image_fetcher(config: &PipelineConfig) -> Result<Arc<dyn ImageFetcher>, PipelineError> {
    if let Some(ref fetcher) = config.image_fetcher {
        return Ok(Arc::clone(fetcher));
    }
    let fetcher = HttpImageFetcher::new()
        .map_err(|e| PipelineError::Internal(format!("cannot build image fetcher: {e}")))?;
    Ok(Arc::new(fetcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;

    #[test]
    fn unreachable_maps_to_retryable_upstream_error() {
        let e = fatal_extraction(ExtractionError::Unreachable {
            detail: "connection refused".into(),
        });
        assert!(matches!(e, PipelineError::UpstreamUnavailable { .. }));
        assert!(e.is_retryable());
    }

    #[test]
    fn rejected_maps_to_malformed_input() {
        let e = fatal_extraction(ExtractionError::Rejected {
            detail: "not a document".into(),
        });
        assert!(matches!(e, PipelineError::MalformedInput { .. }));
        assert!(!e.is_retryable());
    }

    #[tokio::test]
    async fn purge_uses_configured_retention() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MemoryJobStore::new(dir.path());
        let mut old = ExtractionJob::new("old.pdf", Default::default());
        old.updated_at = chrono::Utc::now() - chrono::Duration::hours(3);
        store.put(&old).await.unwrap();
        let fresh = ExtractionJob::new("fresh.pdf", Default::default());
        store.put(&fresh).await.unwrap();

        let keep_all = PipelineConfig::default();
        assert!(purge_expired_jobs(&store, &keep_all).await.unwrap().is_empty());

        let two_hours = PipelineConfig::builder()
            .retention(Duration::from_secs(2 * 3600))
            .build()
            .unwrap();
        let purged = purge_expired_jobs(&store, &two_hours).await.unwrap();
        assert_eq!(purged, vec![old.id]);
        assert!(store.get(&fresh.id).await.is_ok());
    }

    #[test]
    fn prebuilt_service_takes_precedence() {
        struct Never;
        #[async_trait::async_trait]
        impl LayoutService for Never {
            async fn submit(
                &self,
                _document: &Document,
                _options: &crate::job::ExtractionOptions,
            ) -> Result<crate::pipeline::extract::JobHandle, ExtractionError> {
                Err(ExtractionError::Rejected {
                    detail: "never".into(),
                })
            }

            async fn fetch(
                &self,
                _handle: &crate::pipeline::extract::JobHandle,
            ) -> Result<Vec<crate::pipeline::extract::PageFragment>, ExtractionError> {
                Ok(Vec::new())
            }
        }

        let service: Arc<dyn LayoutService> = Arc::new(Never);
        let config = PipelineConfig::builder()
            .layout_service(Arc::clone(&service))
            .build()
            .unwrap();
        let resolved = resolve_layout_service(&config).unwrap();
        assert!(Arc::ptr_eq(&resolved, &service));
    }
}
