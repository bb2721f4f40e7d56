//! Image resolution: download every image a table cell refers to, verify it
//! on disk, and point the cell at the local copy.
//!
//! ## Retry strategy
//!
//! Each distinct remote location is driven through an explicit state machine:
//!
//! ```text
//! pending ──▶ attempting(1) ──▶ resolved
//!                  │
//!                  ▼ (failure, attempts left)
//!             attempting(n) ──▶ resolved | failed
//! ```
//!
//! Before attempt `n ≥ 2` we sleep `base × 2^(n-2)` (1 s, then 2 s by
//! default). A reference that runs out of attempts is `failed`, its token
//! stays in the markup verbatim, and sibling references are unaffected.
//!
//! ## Why slots instead of string replacement?
//!
//! The same token can appear in several cells, and a token may be a prefix of
//! another. Rewriting through [`ImageSlot`]s touches exactly the segments that
//! were resolved, and nothing else.

use crate::error::ImageError;
use crate::job::CancellationToken;
use crate::pipeline::extract::PageFragment;
use crate::pipeline::input::is_url;
use crate::pipeline::markup::{self, ParsedMarkup};
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default number of concurrent downloads.
pub const DEFAULT_IMAGE_CONCURRENCY: usize = 4;
/// Upper bound on concurrent downloads.
pub const MAX_IMAGE_CONCURRENCY: usize = 8;

/// Subdirectory of a job's artifact directory that holds resolved images.
pub const IMAGES_DIR: &str = "imgs";

// ── Reference state machine ──────────────────────────────────────────────

/// Where one image reference is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Pending,
    Attempting(u32),
    Resolved,
    Failed,
}

/// One image token found in a page's markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReference {
    /// The token exactly as it appears in the markup.
    pub reference: String,
    /// 0-based page the token was found on.
    pub page_index: usize,
    /// Remote location to download from, if one is known.
    pub remote: Option<String>,
    pub state: ResolutionState,
    /// Present only once the reference is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageReference {
    pub fn new(reference: impl Into<String>, page_index: usize, remote: Option<String>) -> Self {
        Self {
            reference: reference.into(),
            page_index,
            remote,
            state: ResolutionState::Pending,
            local_path: None,
            attempts: 0,
            error: None,
        }
    }

    /// Enter the next attempt and return its 1-based number.
    fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.state = ResolutionState::Attempting(self.attempts);
        self.attempts
    }

    fn mark_resolved(&mut self, path: PathBuf) {
        self.state = ResolutionState::Resolved;
        self.local_path = Some(path);
        self.error = None;
    }

    fn mark_failed(&mut self, reason: String) {
        self.state = ResolutionState::Failed;
        self.local_path = None;
        self.error = Some(reason);
    }

    /// Copy the outcome of a shared download onto this reference.
    fn adopt(&mut self, outcome: &ImageReference) {
        self.state = outcome.state;
        self.local_path = outcome.local_path.clone();
        self.attempts = outcome.attempts;
        self.error = outcome.error.clone();
    }

    pub fn is_resolved(&self) -> bool {
        self.state == ResolutionState::Resolved
    }
}

/// Bounds on how hard we try to fetch one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// Per-attempt timeout covering the whole transfer.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.base_backoff * 2u32.saturating_pow(attempt - 2)
        }
    }
}

// ── Fetcher seam ─────────────────────────────────────────────────────────

/// Downloads one remote image to a local path.
///
/// Implementations must not leave a partial file at `dest`: either the
/// complete payload is there when `Ok` is returned, or nothing new is.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Returns the number of bytes written.
    async fn fetch(&self, remote: &str, dest: &Path, timeout: Duration) -> Result<u64, ImageError>;
}

/// Plain HTTP GET, streamed to `<dest>.part` and renamed when complete.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ImageError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, remote: &str, dest: &Path, timeout: Duration) -> Result<u64, ImageError> {
        let resp = self
            .client
            .get(remote)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transfer_error(e, timeout))?;
        if !resp.status().is_success() {
            return Err(ImageError::Http {
                status: resp.status().as_u16(),
            });
        }

        let part = part_path(dest);
        match stream_to_file(resp, &part, timeout).await {
            Ok(written) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .map_err(|source| ImageError::Io {
                        path: dest.to_path_buf(),
                        source,
                    })?;
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

async fn stream_to_file(
    resp: reqwest::Response,
    part: &Path,
    timeout: Duration,
) -> Result<u64, ImageError> {
    let io_err = |source| ImageError::Io {
        path: part.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(part).await.map_err(io_err)?;
    let mut body = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| transfer_error(e, timeout))?;
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    Ok(written)
}

fn transfer_error(e: reqwest::Error, timeout: Duration) -> ImageError {
    if e.is_timeout() {
        ImageError::Timeout {
            secs: timeout.as_secs(),
        }
    } else if let Some(status) = e.status() {
        ImageError::Http {
            status: status.as_u16(),
        }
    } else {
        ImageError::Transport(e.to_string())
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

// ── Naming ───────────────────────────────────────────────────────────────

fn extension_of(location: &str) -> Option<&str> {
    let path = location.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    let plausible =
        !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    plausible.then_some(ext)
}

/// Local file name for a remote image: MD5 of the location plus the
/// reference's extension (falling back to the remote's, then `jpg`).
pub fn local_file_name(remote: &str, reference: &str) -> String {
    let ext = extension_of(reference)
        .or_else(|| extension_of(remote))
        .unwrap_or("jpg")
        .to_ascii_lowercase();
    format!("{:x}.{}", Md5::digest(remote.as_bytes()), ext)
}

/// The page's image map entry for a token, or the token itself if it is a URL.
fn remote_for(token: &str, images: &BTreeMap<String, String>) -> Option<String> {
    images
        .get(token)
        .cloned()
        .or_else(|| is_url(token).then(|| token.to_string()))
}

// ── Resolver ─────────────────────────────────────────────────────────────

/// Outcome of resolving one page's markup.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Rewritten markup, or the input unchanged when nothing resolved.
    pub markup: String,
    pub resolved: usize,
    pub total: usize,
    pub references: Vec<ImageReference>,
}

/// Outcome of resolving every page of a job.
#[derive(Debug, Clone, Default)]
pub struct FragmentResolution {
    pub fragments: Vec<PageFragment>,
    pub references: Vec<ImageReference>,
    pub resolved: usize,
    pub total: usize,
}

/// Downloads images referenced by table markup, with bounded concurrency.
#[derive(Clone)]
pub struct ImageResolver {
    fetcher: Arc<dyn ImageFetcher>,
    policy: RetryPolicy,
    concurrency: usize,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl ImageResolver {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            policy,
            concurrency: DEFAULT_IMAGE_CONCURRENCY,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Concurrent downloads (clamped to 1–8).
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.clamp(1, MAX_IMAGE_CONCURRENCY);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    /// Resolve every image in one page's markup into `<base_dir>/imgs/`.
    pub async fn resolve(
        &self,
        markup: &str,
        images: &BTreeMap<String, String>,
        base_dir: &Path,
    ) -> Resolution {
        let fragment = PageFragment {
            page_index: 0,
            markup: markup.to_string(),
            images: images.clone(),
            regions: Vec::new(),
        };
        let mut out = self
            .resolve_fragments(std::slice::from_ref(&fragment), base_dir)
            .await;
        let markup = out
            .fragments
            .pop()
            .map(|f| f.markup)
            .unwrap_or_else(|| markup.to_string());
        Resolution {
            markup,
            resolved: out.resolved,
            total: out.total,
            references: out.references,
        }
    }

    /// Resolve images across all pages of a job.
    ///
    /// Downloads are shared between pages: a remote location referenced
    /// several times is fetched once. Pages whose markup does not parse are
    /// passed through untouched; the stitcher reports them.
    pub async fn resolve_fragments(
        &self,
        fragments: &[PageFragment],
        base_dir: &Path,
    ) -> FragmentResolution {
        let mut parsed_pages: Vec<Option<ParsedMarkup>> = Vec::with_capacity(fragments.len());
        let mut references: Vec<ImageReference> = Vec::new();

        for fragment in fragments {
            let parsed = match markup::parse(&fragment.markup) {
                Ok(p) => p,
                Err(e) => {
                    debug!(
                        "Page {}: skipping image resolution, markup unreadable: {}",
                        fragment.page_index + 1,
                        e
                    );
                    parsed_pages.push(None);
                    continue;
                }
            };

            let mut seen = Vec::new();
            for slot in parsed.image_slots() {
                if !seen.contains(&slot.reference) {
                    seen.push(slot.reference.clone());
                }
            }
            if let Some(cb) = &self.progress {
                cb.on_images_start(fragment.page_index, seen.len());
            }
            references.extend(seen.into_iter().map(|token| {
                let remote = remote_for(&token, &fragment.images);
                ImageReference::new(token, fragment.page_index, remote)
            }));
            parsed_pages.push(Some(parsed));
        }

        let references = self
            .download_all(references, &base_dir.join(IMAGES_DIR))
            .await;

        let mut out = FragmentResolution {
            total: references.len(),
            resolved: references.iter().filter(|r| r.is_resolved()).count(),
            ..Default::default()
        };

        for (fragment, parsed) in fragments.iter().zip(parsed_pages) {
            let rewritten = parsed.and_then(|mut parsed| {
                let mut changed = false;
                for slot in parsed.image_slots() {
                    let local = references.iter().find(|r| {
                        r.page_index == fragment.page_index && r.reference == slot.reference
                    });
                    if let Some(path) = local.and_then(|r| r.local_path.as_ref()) {
                        changed |= parsed.set_image_src(&slot, &path.to_string_lossy());
                    }
                }
                changed.then(|| parsed.splice(&fragment.markup))
            });
            out.fragments.push(PageFragment {
                markup: rewritten.unwrap_or_else(|| fragment.markup.clone()),
                ..fragment.clone()
            });
        }

        info!(
            "Image resolution: {}/{} reference(s) resolved",
            out.resolved, out.total
        );
        out.references = references;
        out
    }

    /// Drive every distinct remote location to a terminal state and copy the
    /// outcome onto each reference that shares it.
    async fn download_all(
        &self,
        mut references: Vec<ImageReference>,
        imgs_dir: &Path,
    ) -> Vec<ImageReference> {
        let mut plan: BTreeMap<String, (PathBuf, ImageReference)> = BTreeMap::new();
        for r in &references {
            if let Some(remote) = &r.remote {
                plan.entry(remote.clone()).or_insert_with(|| {
                    let dest = imgs_dir.join(local_file_name(remote, &r.reference));
                    (dest, ImageReference::new(r.reference.clone(), r.page_index, r.remote.clone()))
                });
            }
        }

        let mut dir_error = None;
        if !plan.is_empty() {
            if let Err(e) = tokio::fs::create_dir_all(imgs_dir).await {
                dir_error = Some(format!("cannot create '{}': {}", imgs_dir.display(), e));
            }
        }

        let outcomes: HashMap<String, ImageReference> = match dir_error {
            Some(reason) => plan
                .into_iter()
                .map(|(remote, (_, mut r))| {
                    r.mark_failed(reason.clone());
                    (remote, r)
                })
                .collect(),
            None => {
                stream::iter(plan.into_iter().map(|(remote, (dest, r))| async move {
                    let outcome = self.drive(r, &remote, dest).await;
                    (remote, outcome)
                }))
                .buffer_unordered(self.concurrency)
                .collect()
                .await
            }
        };

        for r in references.iter_mut() {
            match r.remote.as_ref().and_then(|remote| outcomes.get(remote)) {
                Some(outcome) => r.adopt(outcome),
                None => r.mark_failed(ImageError::NoRemoteLocation.to_string()),
            }
            if !r.is_resolved() {
                warn!(
                    "Page {}: image '{}' unresolved after {} attempt(s): {}",
                    r.page_index + 1,
                    r.reference,
                    r.attempts,
                    r.error.as_deref().unwrap_or("unknown error")
                );
            }
            if let Some(cb) = &self.progress {
                cb.on_image_done(&r.reference, r.is_resolved());
            }
        }
        references
    }

    /// Run the retry state machine for one remote location.
    async fn drive(&self, mut r: ImageReference, remote: &str, dest: PathBuf) -> ImageReference {
        if verified_len(&dest).await.is_ok() {
            debug!("Image already on disk: {}", dest.display());
            r.mark_resolved(dest);
            return r;
        }

        loop {
            let next = r.attempts + 1;
            let backoff = self.policy.backoff_before(next);
            if !backoff.is_zero() {
                debug!(
                    "Image '{}': retry {}/{} after {}ms",
                    r.reference,
                    next,
                    self.policy.max_attempts,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }
            if self.cancel.is_cancelled() {
                r.mark_failed(ImageError::Cancelled.to_string());
                return r;
            }

            let attempt = r.begin_attempt();
            let result = match self.fetcher.fetch(remote, &dest, self.policy.timeout).await {
                Ok(_) => verified_len(&dest).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(len) => {
                    debug!("Image '{}': {} bytes → {}", r.reference, len, dest.display());
                    r.mark_resolved(dest);
                    return r;
                }
                Err(e) => {
                    debug!("Image '{}': attempt {} failed: {}", r.reference, attempt, e);
                    if attempt >= self.policy.max_attempts {
                        r.mark_failed(e.to_string());
                        return r;
                    }
                }
            }
        }
    }
}

/// Size of a written artifact; missing or empty files fail verification.
async fn verified_len(path: &Path) -> Result<u64, ImageError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(_) => {
            let _ = tokio::fs::remove_file(path).await;
            Err(ImageError::EmptyArtifact {
                path: path.to_path_buf(),
            })
        }
        Err(_) => Err(ImageError::EmptyArtifact {
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Fails the first `fail_first` calls, then writes `payload`.
    struct FlakyFetcher {
        fail_first: usize,
        payload: Vec<u8>,
        calls: AtomicUsize,
    }

    impl FlakyFetcher {
        fn new(fail_first: usize, payload: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                payload: payload.to_vec(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageFetcher for FlakyFetcher {
        async fn fetch(
            &self,
            _remote: &str,
            dest: &Path,
            _timeout: Duration,
        ) -> Result<u64, ImageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(ImageError::Http { status: 503 });
            }
            tokio::fs::write(dest, &self.payload)
                .await
                .map_err(|source| ImageError::Io {
                    path: dest.to_path_buf(),
                    source,
                })?;
            Ok(self.payload.len() as u64)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn images(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const MARKUP: &str =
        r#"<table><tr><td>Chair</td><td><img src="imgs/chair.jpg"></td></tr></table>"#;

    #[test]
    fn backoff_doubles_from_second_attempt() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_before(1), Duration::ZERO);
        assert_eq!(p.backoff_before(2), Duration::from_secs(1));
        assert_eq!(p.backoff_before(3), Duration::from_secs(2));
        assert_eq!(p.backoff_before(4), Duration::from_secs(4));
    }

    #[test]
    fn local_names_are_stable_and_keep_extension() {
        let a = local_file_name("https://cdn.test/x?sig=1", "imgs/box_1.png");
        let b = local_file_name("https://cdn.test/x?sig=1", "imgs/box_1.png");
        assert_eq!(a, b);
        assert!(a.ends_with(".png"));
        assert_eq!(a.len(), 32 + 4);
        assert!(local_file_name("https://cdn.test/photo.webp", "token").ends_with(".webp"));
        assert!(local_file_name("https://cdn.test/blob", "token").ends_with(".jpg"));
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_takes_three_attempts() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(2, b"jpeg-bytes");
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy());

        let out = resolver
            .resolve(
                MARKUP,
                &images(&[("imgs/chair.jpg", "https://cdn.test/chair.jpg")]),
                dir.path(),
            )
            .await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!((out.resolved, out.total), (1, 1));
        let r = &out.references[0];
        assert_eq!(r.state, ResolutionState::Resolved);
        assert_eq!(r.attempts, 3);
        let local = r.local_path.as_ref().unwrap();
        assert!(local.starts_with(dir.path().join(IMAGES_DIR)));
        assert!(out.markup.contains(&*local.to_string_lossy()));
        assert!(!out.markup.contains("imgs/chair.jpg\""));
    }

    #[tokio::test]
    async fn exhausted_reference_leaves_markup_unchanged() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(usize::MAX, b"");
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy());

        let out = resolver
            .resolve(
                MARKUP,
                &images(&[("imgs/chair.jpg", "https://cdn.test/chair.jpg")]),
                dir.path(),
            )
            .await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.markup, MARKUP);
        assert_eq!((out.resolved, out.total), (0, 1));
        assert_eq!(out.references[0].state, ResolutionState::Failed);
        assert!(out.references[0].local_path.is_none());
    }

    #[tokio::test]
    async fn token_without_remote_fails_without_attempts() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(0, b"x");
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy());

        let out = resolver.resolve(MARKUP, &BTreeMap::new(), dir.path()).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.references[0].attempts, 0);
        assert_eq!(out.references[0].state, ResolutionState::Failed);
        assert_eq!(out.markup, MARKUP);
    }

    #[tokio::test]
    async fn empty_artifact_fails_verification() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(0, b"");
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy());

        let out = resolver
            .resolve(
                MARKUP,
                &images(&[("imgs/chair.jpg", "https://cdn.test/chair.jpg")]),
                dir.path(),
            )
            .await;

        assert_eq!(out.resolved, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert!(out.references[0]
            .error
            .as_deref()
            .unwrap()
            .contains("verification"));
    }

    #[tokio::test]
    async fn shared_remote_is_downloaded_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(0, b"png");
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy()).with_concurrency(8);
        let markup = r#"<table>
            <tr><td><img src="https://cdn.test/logo.png"></td><td>A</td></tr>
            <tr><td><img src="https://cdn.test/logo.png"></td><td>B</td></tr>
            <tr><td><img src="imgs/other.jpg"></td><td>C</td></tr>
        </table>"#;

        let out = resolver
            .resolve(
                markup,
                &images(&[("imgs/other.jpg", "https://cdn.test/other.jpg")]),
                dir.path(),
            )
            .await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!((out.resolved, out.total), (2, 2));
        let parsed = markup::parse(&out.markup).unwrap();
        let srcs: Vec<String> = parsed
            .image_slots()
            .into_iter()
            .map(|s| s.reference)
            .collect();
        assert_eq!(srcs[0], srcs[1]);
        assert!(srcs.iter().all(|s| s.starts_with(&*dir.path().to_string_lossy())));
    }

    #[tokio::test]
    async fn cancelled_resolver_makes_no_attempts() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(0, b"x");
        let token = CancellationToken::new();
        token.cancel();
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy()).with_cancellation(token);

        let out = resolver
            .resolve(
                MARKUP,
                &images(&[("imgs/chair.jpg", "https://cdn.test/chair.jpg")]),
                dir.path(),
            )
            .await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.references[0].state, ResolutionState::Failed);
    }

    #[tokio::test]
    async fn same_token_on_two_pages_uses_each_page_map() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(0, b"img");
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy());
        let fragments = vec![
            PageFragment::new(0, MARKUP).with_image("imgs/chair.jpg", "https://cdn.test/p1.jpg"),
            PageFragment::new(1, MARKUP).with_image("imgs/chair.jpg", "https://cdn.test/p2.jpg"),
        ];

        let out = resolver.resolve_fragments(&fragments, dir.path()).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.resolved, 2);
        assert_ne!(out.fragments[0].markup, out.fragments[1].markup);
        assert_eq!(out.fragments[1].page_index, 1);
    }

    #[tokio::test]
    async fn unparsable_page_passes_through() {
        let dir = TempDir::new().unwrap();
        let fetcher = FlakyFetcher::new(0, b"img");
        let resolver = ImageResolver::new(fetcher, fast_policy());
        let broken = "<table><tr><td><img src=\"imgs/a.jpg\"></td></tr>";
        let fragments = vec![PageFragment::new(0, broken)];

        let out = resolver.resolve_fragments(&fragments, dir.path()).await;

        assert_eq!(out.total, 0);
        assert_eq!(out.fragments[0].markup, broken);
    }

    #[tokio::test]
    async fn rewrite_keeps_page_text_outside_tables() {
        let dir = TempDir::new().unwrap();
        let resolver = ImageResolver::new(FlakyFetcher::new(0, b"img"), fast_policy());
        let page = "<h2>Section B</h2>\n<table><tr><td>Chair</td><td><img src=\"https://cdn.test/c.jpg\"></td></tr></table>\n<p>Note: prices exclude VAT</p>";

        let out = resolver.resolve(page, &BTreeMap::new(), dir.path()).await;

        assert_eq!(out.resolved, 1);
        assert!(out.markup.starts_with("<h2>Section B</h2>\n"));
        assert!(out.markup.ends_with("\n<p>Note: prices exclude VAT</p>"));
        let local = out.references[0].local_path.as_ref().unwrap();
        assert!(out.markup.contains(&*local.to_string_lossy()));
    }

    /// Records the highest number of fetches running at once.
    struct GaugedFetcher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ImageFetcher for GaugedFetcher {
        async fn fetch(
            &self,
            _remote: &str,
            dest: &Path,
            _timeout: Duration,
        ) -> Result<u64, ImageError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            tokio::fs::write(dest, b"img")
                .await
                .map_err(|source| ImageError::Io {
                    path: dest.to_path_buf(),
                    source,
                })?;
            Ok(3)
        }
    }

    #[tokio::test]
    async fn downloads_never_exceed_the_worker_limit() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(GaugedFetcher {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let resolver = ImageResolver::new(fetcher.clone(), fast_policy()).with_concurrency(2);
        let rows: String = (0..10)
            .map(|i| format!(r#"<tr><td>{i}</td><td><img src="https://cdn.test/{i}.jpg"></td></tr>"#))
            .collect();
        let page = format!("<table>{rows}</table>");

        let out = resolver.resolve(&page, &BTreeMap::new(), dir.path()).await;

        assert_eq!((out.resolved, out.total), (10, 10));
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {peak}");
        assert!(peak > 1, "downloads ran serially");
    }
}
