//! Error types for the boq-offer library.
//!
//! Failures are absorbed at the finest granularity that can still produce a
//! useful result:
//!
//! * [`PipelineError`]: **Fatal**: the job cannot proceed at all (document
//!   rejected, layout service unreachable, structurally corrupt markup).
//!   Returned as `Err(PipelineError)` from [`crate::run::process_document`].
//!
//! * [`PageError`]: **Non-fatal**: one page failed extraction but the rest of
//!   the document is fine. Stored in [`crate::output::JobOutput`] so callers
//!   can judge a partial result themselves.
//!
//! Per-image and per-row failures are not errors at the job level at all:
//! they are recorded on the [`crate::pipeline::images::ImageReference`] and
//! the [`crate::pipeline::costing::PricedRow`] they belong to.

use crate::job::{JobStatus, Stage};
use crate::pipeline::extract::PageFragment;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the boq-offer library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The document was rejected, locally or by the layout service. Not retryable.
    #[error("Document rejected: {detail}")]
    MalformedInput { detail: String },

    // ── Upstream errors ───────────────────────────────────────────────────
    /// The layout service could not be reached. Retrying the job later may help.
    #[error("Layout service unavailable: {detail}")]
    UpstreamUnavailable { detail: String },

    // ── Table errors ──────────────────────────────────────────────────────
    /// A page's markup cannot be read as a table at all.
    #[error("Page {page}: markup is structurally corrupt: {detail}")]
    StructuralCorruption { page: usize, detail: String },

    // ── Control flow ──────────────────────────────────────────────────────
    /// The job was cancelled before the given stage started.
    #[error("Job cancelled before stage '{stage}'")]
    Cancelled { stage: Stage },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The cost-factor configuration is inconsistent.
    #[error(transparent)]
    CostConfig(#[from] CostConfigError),

    // ── Storage errors ────────────────────────────────────────────────────
    /// The job store failed to read or write a record or artifact.
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether re-running the same job later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamUnavailable { .. }
                | PipelineError::DownloadFailed { .. }
                | PipelineError::DownloadTimeout { .. }
        )
    }
}

impl From<StitchError> for PipelineError {
    fn from(e: StitchError) -> Self {
        match e {
            StitchError::Corrupt { page, detail } => {
                PipelineError::StructuralCorruption { page, detail }
            }
            StitchError::DuplicatePage { page } => PipelineError::StructuralCorruption {
                page,
                detail: "page delivered twice".to_string(),
            },
        }
    }
}

/// A non-fatal error for a single page.
///
/// Page numbers are 1-based, matching what a reader of the document sees.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The layout service reported a failure for this page.
    #[error("Page {page}: extraction failed: {detail}")]
    ExtractionFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ExtractionFailed { page, .. } => *page,
        }
    }
}

/// Failure taxonomy of the extraction client.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Network or HTTP-layer failure; the service may recover.
    #[error("layout service unreachable: {detail}")]
    Unreachable { detail: String },

    /// The service refused the document. Retrying will not help.
    #[error("layout service rejected the document: {detail}")]
    Rejected { detail: String },

    /// Some pages succeeded, some failed. The succeeded pages are carried along.
    #[error("{} page(s) failed extraction, {} succeeded", .failed.len(), .fragments.len())]
    PartialResult {
        fragments: Vec<PageFragment>,
        failed: Vec<PageError>,
    },
}

/// A single image download attempt failed.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("write to '{path}' failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The artifact is missing or zero bytes after the write.
    #[error("artifact '{path}' failed verification")]
    EmptyArtifact { path: PathBuf },

    /// The token is neither a URL nor listed in the page's image map.
    #[error("no remote location for reference")]
    NoRemoteLocation,

    #[error("cancelled before download")]
    Cancelled,
}

/// Irrecoverable structural problems found while stitching.
///
/// Page numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StitchError {
    #[error("page {page}: {detail}")]
    Corrupt { page: usize, detail: String },

    #[error("page {page} appears more than once")]
    DuplicatePage { page: usize },
}

/// Validation failures of a [`crate::pipeline::costing::CostFactorConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CostConfigError {
    #[error("factor '{name}' is {value}%; percentages must be greater than -100")]
    PercentageOutOfRange { name: String, value: String },

    #[error("exchange rate must be positive, got {0}")]
    InvalidExchangeRate(String),

    #[error("currency precision of {0} minor units is not supported (max 6)")]
    InvalidMinorUnits(u32),

    #[error("additional cost #{0} has an empty name")]
    UnnamedCost(usize),

    /// A table-level cost or the total exchange pushed the grand total out
    /// of the representable range.
    #[error("'{0}' takes the grand total out of range")]
    TotalOutOfRange(String),
}

/// Errors raised by a [`crate::store::JobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not (de)serialise '{path}': {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another job already owns this artifact directory.
    #[error("artifact directory '{path}' is already owned by another job")]
    AlreadyClaimed { path: PathBuf },

    #[error("job {0} not found")]
    NotFound(String),

    #[error("illegal job transition {from} → {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}
