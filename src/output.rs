//! Result types returned by [`crate::run::process_document`].

use crate::error::PageError;
use crate::job::ExtractionJob;
use crate::pipeline::costing::CostSheet;
use crate::pipeline::images::ImageReference;
use crate::pipeline::stitch::StitchedTable;
use crate::pipeline::tiers::TierVariantSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Counts describing one finished job. Never a single success flag: callers
/// judge partial results from these numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pages_total: usize,
    pub pages_succeeded: usize,
    pub pages_failed: usize,
    /// 1-based page numbers that failed extraction.
    pub failed_pages: Vec<usize>,

    pub images_total: usize,
    pub images_resolved: usize,
    pub images_failed: usize,

    /// Data rows in the stitched table.
    pub rows_total: usize,
    pub rows_priced: usize,
    pub rows_unpriced: usize,

    pub headers_dropped: usize,
    pub separators_dropped: usize,
    pub rows_padded: usize,

    // Stage wall-clock times.
    pub extract_ms: u64,
    pub resolve_ms: u64,
    pub stitch_ms: u64,
    pub cost_ms: u64,
    pub total_ms: u64,
}

/// Everything a completed job produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    pub job: ExtractionJob,
    /// Directory holding the persisted artifacts.
    pub artifact_dir: PathBuf,
    pub table: StitchedTable,
    pub costs: CostSheet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiers: Option<TierVariantSet>,
    pub images: Vec<ImageReference>,
    /// Pages that failed extraction. Empty on a clean run.
    pub page_errors: Vec<PageError>,
    pub stats: JobStats,
}
