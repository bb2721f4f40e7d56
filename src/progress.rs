//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as a job moves through its stages.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a channel, a job record or a terminal
//! progress bar without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because image resolutions run
//! concurrently and report as they finish.
//!
//! # Example
//!
//! ```rust
//! use boq_offer::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     resolved: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_image_done(&self, reference: &str, resolved: bool) {
//!         if resolved {
//!             self.resolved.fetch_add(1, Ordering::SeqCst);
//!         } else {
//!             eprintln!("could not resolve {reference}");
//!         }
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { resolved: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::job::Stage;
use crate::output::JobStats;
use std::sync::Arc;

/// Called by the pipeline as a job advances.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_image_done` may be called concurrently from several tasks.
/// Implementations must protect shared mutable state with `Mutex`, atomics
/// or similar.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once, after the job record is created.
    fn on_job_start(&self, job_id: &str, document: &str) {
        let _ = (job_id, document);
    }

    /// Called when a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes, with a short human-readable summary.
    fn on_stage_complete(&self, stage: Stage, summary: &str) {
        let _ = (stage, summary);
    }

    /// Called before image downloads start for one page.
    ///
    /// # Arguments
    /// * `page_index`: 0-based page index
    /// * `references`: distinct image references found on the page
    fn on_images_start(&self, page_index: usize, references: usize) {
        let _ = (page_index, references);
    }

    /// Called when one image reference reaches a terminal state.
    fn on_image_done(&self, reference: &str, resolved: bool) {
        let _ = (reference, resolved);
    }

    /// Called once when the job completes successfully.
    fn on_job_complete(&self, stats: &JobStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        stages: Mutex<Vec<Stage>>,
        resolved: AtomicUsize,
        failed: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage_start(&self, stage: Stage) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_image_done(&self, _reference: &str, resolved: bool) {
            if resolved {
                self.resolved.fetch_add(1, Ordering::SeqCst);
            } else {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_job_start("id", "boq.pdf");
        cb.on_stage_start(Stage::Extract);
        cb.on_stage_complete(Stage::Extract, "3 pages");
        cb.on_images_start(0, 2);
        cb.on_image_done("imgs/a.jpg", false);
        cb.on_job_complete(&JobStats::default());
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_stage_start(Stage::Extract);
        tracker.on_stage_start(Stage::ResolveImages);
        tracker.on_image_done("a", true);
        tracker.on_image_done("b", true);
        tracker.on_image_done("c", false);

        assert_eq!(
            *tracker.stages.lock().unwrap(),
            vec![Stage::Extract, Stage::ResolveImages]
        );
        assert_eq!(tracker.resolved.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_complete(Stage::Cost, "12 rows priced");
    }
}
