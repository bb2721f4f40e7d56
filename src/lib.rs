//! # boq-offer
//!
//! Turn scanned bills of quantities (BOQs) into priced offers.
//!
//! ## Why this crate?
//!
//! A BOQ arrives as a PDF or a photo: a long table of line items split
//! across pages, with the header repeated on every page, product pictures
//! embedded in cells, and prices that still need margin, freight, customs,
//! installation and currency applied. This crate sends the document to a
//! layout-analysis service, stitches the per-page tables back into one
//! clean table, downloads the embedded images next to it, and produces an
//! auditable cost sheet, optionally in three catalog-backed pricing tiers.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Extract   layout service → per-page table markup (partial ok)
//!  ├─ 3. Images    concurrent download, retry with backoff, rewrite refs
//!  ├─ 4. Stitch    one table, repeated headers and blank rows removed
//!  ├─ 5. Cost      compounded factors, per-row breakdown, grand total
//!  └─ 6. Tiers     budgetary / mid-range / high-end from a catalog
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use boq_offer::{process_document, FsJobStore, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Layout service URL from BOQ_LAYOUT_API_URL, or a local default
//!     let config = PipelineConfig::builder().build()?;
//!     let store = FsJobStore::new("./boq-jobs");
//!     let output = process_document("tender.pdf", &store, &config).await?;
//!     println!("{} {}", output.costs.grand_total, output.costs.currency.code);
//!     eprintln!("pages: {}/{} ok, images: {}/{} resolved",
//!         output.stats.pages_succeeded, output.stats.pages_total,
//!         output.stats.images_resolved, output.stats.images_total);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `boq` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! boq-offer = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod run;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{
    CostConfigError, ExtractionError, ImageError, PageError, PipelineError, StitchError,
    StoreError,
};
pub use job::{CancellationToken, ExtractionJob, ExtractionOptions, JobId, JobStatus, Stage};
pub use output::{JobOutput, JobStats};
pub use pipeline::costing::{cost, AdditionalCost, CostFactorConfig, CostSheet, PricedRow};
pub use pipeline::stitch::{stitch, StitchOptions, StitchedTable};
pub use pipeline::tiers::{derive_tiers, CatalogLookup, InMemoryCatalog, Tier, TierVariantSet};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::{process_bytes, process_document, process_document_sync, purge_expired_jobs};
pub use store::{FsJobStore, JobStore, MemoryJobStore};
