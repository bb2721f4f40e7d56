//! Configuration for a pipeline run.
//!
//! All behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it easy
//! to share a config between jobs and to log what a run was started with.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on the
//! documented defaults for the rest. Setters clamp; [`PipelineConfigBuilder::build`]
//! rejects combinations that cannot work.

use crate::error::PipelineError;
use crate::job::{CancellationToken, ExtractionOptions};
use crate::pipeline::costing::CostFactorConfig;
use crate::pipeline::extract::LayoutService;
use crate::pipeline::images::{ImageFetcher, RetryPolicy, DEFAULT_IMAGE_CONCURRENCY, MAX_IMAGE_CONCURRENCY};
use crate::pipeline::stitch::StitchOptions;
use crate::pipeline::tiers::CatalogLookup;
use crate::progress::ProgressCallback;
use crate::store::DEFAULT_RETENTION;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Env var consulted when no layout API URL is configured.
pub const ENV_LAYOUT_API_URL: &str = "BOQ_LAYOUT_API_URL";
/// Env var consulted when no layout API token is configured.
pub const ENV_LAYOUT_API_TOKEN: &str = "BOQ_LAYOUT_API_TOKEN";

/// Configuration for one document run.
///
/// # Example
/// ```rust
/// use boq_offer::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .api_url("http://layout.internal:8080/layout-parsing")
///     .image_concurrency(6)
///     .image_max_attempts(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Layout service base URL. Falls back to `BOQ_LAYOUT_API_URL`, then to
    /// [`crate::pipeline::extract::DEFAULT_LAYOUT_API_URL`].
    pub api_url: Option<String>,

    /// Bearer token for the layout service. Falls back to `BOQ_LAYOUT_API_TOKEN`.
    pub api_token: Option<String>,

    /// Recognition features requested at submission. Tables are always on.
    pub extraction: ExtractionOptions,

    /// Timeout for each single HTTP exchange with the layout service. Default: 120.
    pub request_timeout_secs: u64,

    /// Interval between job-status polls, in milliseconds. Default: 2000.
    pub poll_interval_ms: u64,

    /// Total time to wait for the layout service to finish a job. Default: 600.
    ///
    /// When it runs out the job fails as upstream-unavailable, which is
    /// retryable.
    pub extraction_deadline_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Per-attempt timeout for one image download, in seconds. Default: 60.
    pub image_timeout_secs: u64,

    /// Total attempts per image, first included. Range: 1–10. Default: 3.
    pub image_max_attempts: u32,

    /// Backoff before the second attempt, doubling afterwards. Default: 1000.
    pub image_backoff_ms: u64,

    /// Concurrent image downloads. Range: 1–8. Default: 4.
    pub image_concurrency: usize,

    pub stitch: StitchOptions,

    pub cost_factors: CostFactorConfig,

    /// Catalog used for tier variants.
    pub catalog: Option<Arc<dyn CatalogLookup>>,

    /// Produce budgetary / mid-range / high-end variants. Requires `catalog`.
    pub tiers: bool,

    /// How long finished jobs are kept before `purge_expired` removes them.
    pub retention: Duration,

    /// Pre-constructed layout service. Takes precedence over `api_url`.
    pub layout_service: Option<Arc<dyn LayoutService>>,

    /// Pre-constructed image fetcher. Default: plain HTTP.
    pub image_fetcher: Option<Arc<dyn ImageFetcher>>,

    pub progress_callback: Option<ProgressCallback>,

    /// Checked at every stage entry and before each image download attempt.
    pub cancellation: CancellationToken,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            extraction: ExtractionOptions::default(),
            request_timeout_secs: 120,
            poll_interval_ms: 2000,
            extraction_deadline_secs: 600,
            download_timeout_secs: 120,
            image_timeout_secs: 60,
            image_max_attempts: 3,
            image_backoff_ms: 1000,
            image_concurrency: DEFAULT_IMAGE_CONCURRENCY,
            stitch: StitchOptions::default(),
            cost_factors: CostFactorConfig::default(),
            catalog: None,
            tiers: false,
            retention: DEFAULT_RETENTION,
            layout_service: None,
            image_fetcher: None,
            progress_callback: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("extraction", &self.extraction)
            .field("extraction_deadline_secs", &self.extraction_deadline_secs)
            .field("image_timeout_secs", &self.image_timeout_secs)
            .field("image_max_attempts", &self.image_max_attempts)
            .field("image_concurrency", &self.image_concurrency)
            .field("stitch", &self.stitch)
            .field("cost_factors", &self.cost_factors)
            .field("catalog", &self.catalog.as_ref().map(|_| "<dyn CatalogLookup>"))
            .field("tiers", &self.tiers)
            .field("retention", &self.retention)
            .field(
                "layout_service",
                &self.layout_service.as_ref().map(|_| "<dyn LayoutService>"),
            )
            .field(
                "image_fetcher",
                &self.image_fetcher.as_ref().map(|_| "<dyn ImageFetcher>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.image_max_attempts,
            base_backoff: Duration::from_millis(self.image_backoff_ms),
            timeout: Duration::from_secs(self.image_timeout_secs),
        }
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = Some(url.into());
        self
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.config.api_token = Some(token.into());
        self
    }

    pub fn extraction(mut self, options: ExtractionOptions) -> Self {
        self.config.extraction = options;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms.max(10);
        self
    }

    pub fn extraction_deadline_secs(mut self, secs: u64) -> Self {
        self.config.extraction_deadline_secs = secs.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn image_timeout_secs(mut self, secs: u64) -> Self {
        self.config.image_timeout_secs = secs.max(1);
        self
    }

    pub fn image_max_attempts(mut self, n: u32) -> Self {
        self.config.image_max_attempts = n.clamp(1, 10);
        self
    }

    pub fn image_backoff_ms(mut self, ms: u64) -> Self {
        self.config.image_backoff_ms = ms;
        self
    }

    pub fn image_concurrency(mut self, n: usize) -> Self {
        self.config.image_concurrency = n.clamp(1, MAX_IMAGE_CONCURRENCY);
        self
    }

    pub fn stitch(mut self, options: StitchOptions) -> Self {
        self.config.stitch = options;
        self
    }

    pub fn cost_factors(mut self, factors: CostFactorConfig) -> Self {
        self.config.cost_factors = factors;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn CatalogLookup>) -> Self {
        self.config.catalog = Some(catalog);
        self
    }

    pub fn tiers(mut self, v: bool) -> Self {
        self.config.tiers = v;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn layout_service(mut self, service: Arc<dyn LayoutService>) -> Self {
        self.config.layout_service = Some(service);
        self
    }

    pub fn image_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.config.image_fetcher = Some(fetcher);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = token;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if let Some(url) = &c.api_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(PipelineError::InvalidConfig(format!(
                    "layout API URL must be http(s), got '{}'",
                    url
                )));
            }
        }
        if c.image_concurrency == 0 || c.image_concurrency > MAX_IMAGE_CONCURRENCY {
            return Err(PipelineError::InvalidConfig(format!(
                "image concurrency must be 1–{}, got {}",
                MAX_IMAGE_CONCURRENCY, c.image_concurrency
            )));
        }
        if c.tiers && c.catalog.is_none() {
            return Err(PipelineError::InvalidConfig(
                "tier variants need a catalog".into(),
            ));
        }
        c.cost_factors.validate()?;
        Ok(self.config)
    }
}
