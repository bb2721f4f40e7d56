//! Extraction client: submit a document to the layout service, wait for the
//! job, and collect one [`PageFragment`] per page.
//!
//! ## Wire protocol
//!
//! ```text
//! POST {base}/jobs            {file, fileType, fileName, optionalPayload}
//!   -> {data: {jobId}}
//! GET  {base}/jobs/{jobId}    (polled)
//!   -> {data: {state: pending|running|done|failed, errorMsg?, resultUrl?}}
//! GET  {resultUrl.jsonUrl}    JSONL, one line per page or batch of pages
//!   -> {result: {layoutParsingResults: [{markdown: {text, images}, prunedResult}]}}
//!   |  {pageIndex?, errorMsg}
//! ```
//!
//! ## Why a trait?
//!
//! The rest of the pipeline only needs "document in, fragments out". Keeping
//! the HTTP details behind [`LayoutService`] lets tests drive the whole job
//! with a scripted double and lets deployments point at a different backend.

use crate::error::{ExtractionError, PageError};
use crate::job::ExtractionOptions;
use crate::pipeline::input::Document;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ── Fragment model ───────────────────────────────────────────────────────

/// The extraction output for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFragment {
    /// 0-based position of the page in the source document.
    pub page_index: usize,
    /// Table markup (HTML or pipe tables) for the page.
    pub markup: String,
    /// Image token found in the markup → remote location of the image.
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    /// Detected layout regions, kept for provenance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<Region>,
}

impl PageFragment {
    pub fn new(page_index: usize, markup: impl Into<String>) -> Self {
        Self {
            page_index,
            markup: markup.into(),
            images: BTreeMap::new(),
            regions: Vec::new(),
        }
    }

    pub fn with_image(mut self, token: impl Into<String>, remote: impl Into<String>) -> Self {
        self.images.insert(token.into(), remote.into());
        self
    }
}

/// A layout region as reported by the service.
///
/// Fields we do not interpret are kept in `extra` so the record survives a
/// store round trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    #[serde(default, alias = "block_label")]
    pub label: String,
    #[serde(default, alias = "block_bbox")]
    pub bbox: Vec<f64>,
    #[serde(default, alias = "block_content")]
    pub content: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Service-side identity of a submitted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub remote_id: String,
}

// ── Service seam ─────────────────────────────────────────────────────────

/// A layout-analysis backend.
///
/// `fetch` returns every page that succeeded. When some pages failed it
/// returns [`ExtractionError::PartialResult`] carrying both lists; when every
/// page failed it returns [`ExtractionError::Rejected`].
#[async_trait]
pub trait LayoutService: Send + Sync {
    async fn submit(
        &self,
        document: &Document,
        options: &ExtractionOptions,
    ) -> Result<JobHandle, ExtractionError>;

    async fn fetch(&self, handle: &JobHandle) -> Result<Vec<PageFragment>, ExtractionError>;
}

/// Fold per-page outcomes into the [`LayoutService::fetch`] contract.
pub fn collect_outcome(
    fragments: Vec<PageFragment>,
    failed: Vec<PageError>,
) -> Result<Vec<PageFragment>, ExtractionError> {
    if failed.is_empty() {
        return Ok(fragments);
    }
    if fragments.is_empty() {
        let first = failed
            .first()
            .map(|e| e.to_string())
            .unwrap_or_default();
        return Err(ExtractionError::Rejected {
            detail: format!("all {} page(s) failed; first: {}", failed.len(), first),
        });
    }
    Err(ExtractionError::PartialResult { fragments, failed })
}

// ── HTTP client ──────────────────────────────────────────────────────────

/// Default layout service endpoint, used when nothing else is configured.
pub const DEFAULT_LAYOUT_API_URL: &str = "http://127.0.0.1:8080/layout-parsing";

/// [`LayoutService`] over the asynchronous HTTP jobs API.
#[derive(Debug, Clone)]
pub struct HttpLayoutClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    poll_interval: Duration,
    deadline: Duration,
}

impl HttpLayoutClient {
    /// Build a client.
    ///
    /// `request_timeout` bounds every single HTTP exchange; `deadline` bounds
    /// the whole wait for a submitted job to finish.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ExtractionError::Unreachable {
                detail: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            poll_interval,
            deadline,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_job(&self, remote_id: &str) -> Result<JobData, ExtractionError> {
        let url = format!("{}/jobs/{}", self.base_url, remote_id);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: Envelope<JobData> = checked(resp).await?.json().await.map_err(|e| {
            ExtractionError::Unreachable {
                detail: format!("unreadable job status: {e}"),
            }
        })?;
        envelope.into_data()
    }
}

#[async_trait]
impl LayoutService for HttpLayoutClient {
    async fn submit(
        &self,
        document: &Document,
        options: &ExtractionOptions,
    ) -> Result<JobHandle, ExtractionError> {
        let body = SubmitRequest {
            file: base64::engine::general_purpose::STANDARD.encode(&document.bytes),
            file_type: document.kind.wire_code(),
            file_name: &document.name,
            optional_payload: OptionalPayload::from(options),
        };

        info!(
            "Submitting '{}' ({} bytes) to layout service",
            document.name,
            document.bytes.len()
        );
        let url = format!("{}/jobs", self.base_url);
        let resp = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let envelope: Envelope<SubmitData> =
            checked(resp)
                .await?
                .json()
                .await
                .map_err(|e| ExtractionError::Unreachable {
                    detail: format!("unreadable submit response: {e}"),
                })?;
        let data = envelope.into_data()?;
        debug!("Layout job accepted: {}", data.job_id);
        Ok(JobHandle {
            remote_id: data.job_id,
        })
    }

    async fn fetch(&self, handle: &JobHandle) -> Result<Vec<PageFragment>, ExtractionError> {
        let started = Instant::now();
        let result_url = loop {
            let job = self.get_job(&handle.remote_id).await?;
            match job.state {
                RemoteState::Done => {
                    break job.result_url.map(|r| r.json_url).ok_or_else(|| {
                        ExtractionError::Rejected {
                            detail: "job finished without a result location".to_string(),
                        }
                    })?;
                }
                RemoteState::Failed => {
                    return Err(ExtractionError::Rejected {
                        detail: job
                            .error_msg
                            .unwrap_or_else(|| "job failed without a message".to_string()),
                    });
                }
                RemoteState::Pending | RemoteState::Running => {
                    if started.elapsed() >= self.deadline {
                        return Err(ExtractionError::Unreachable {
                            detail: format!(
                                "job {} not finished after {}s",
                                handle.remote_id,
                                self.deadline.as_secs()
                            ),
                        });
                    }
                    debug!("Layout job {} still {:?}", handle.remote_id, job.state);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };

        let resp = self
            .authorized(self.client.get(&result_url))
            .send()
            .await
            .map_err(transport_error)?;
        let body = checked(resp)
            .await?
            .text()
            .await
            .map_err(transport_error)?;

        let (fragments, failed) = parse_result_lines(&body);
        info!(
            "Layout job {}: {} page(s) extracted, {} failed",
            handle.remote_id,
            fragments.len(),
            failed.len()
        );
        collect_outcome(fragments, failed)
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    file: String,
    file_type: u8,
    file_name: &'a str,
    optional_payload: OptionalPayload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OptionalPayload {
    use_table_recognition: bool,
    use_formula_recognition: bool,
    use_chart_recognition: bool,
    use_seal_recognition: bool,
    use_region_detection: bool,
}

impl From<&ExtractionOptions> for OptionalPayload {
    fn from(o: &ExtractionOptions) -> Self {
        Self {
            use_table_recognition: true,
            use_formula_recognition: o.formula,
            use_chart_recognition: o.chart,
            use_seal_recognition: o.seal,
            use_region_detection: o.region,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    error_msg: Option<String>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ExtractionError> {
        match self.data {
            Some(data) => Ok(data),
            None => Err(ExtractionError::Rejected {
                detail: self
                    .error_msg
                    .unwrap_or_else(|| "response carried no data".to_string()),
            }),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitData {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobData {
    state: RemoteState,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    result_url: Option<ResultUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RemoteState {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultUrl {
    json_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultLine {
    #[serde(default)]
    page_index: Option<usize>,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    result: Option<LineResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineResult {
    #[serde(default)]
    layout_parsing_results: Vec<LayoutParsingResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutParsingResult {
    #[serde(default)]
    markdown: MarkdownBlock,
    #[serde(default)]
    pruned_result: Option<PrunedResult>,
}

#[derive(Default, Deserialize)]
struct MarkdownBlock {
    #[serde(default)]
    text: String,
    #[serde(default)]
    images: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct PrunedResult {
    #[serde(default)]
    parsing_res_list: Vec<Region>,
}

/// Split a JSONL result body into page fragments and page errors.
///
/// Pages are numbered in arrival order unless a line names its own index.
/// A line that cannot be decoded counts as one failed page.
fn parse_result_lines(body: &str) -> (Vec<PageFragment>, Vec<PageError>) {
    let mut fragments = Vec::new();
    let mut failed = Vec::new();
    let mut next_index = 0usize;

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parsed: ResultLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                warn!("Page {}: unreadable result line: {}", next_index + 1, e);
                failed.push(PageError::ExtractionFailed {
                    page: next_index + 1,
                    detail: format!("unreadable result line: {e}"),
                });
                next_index += 1;
                continue;
            }
        };

        let start = parsed.page_index.unwrap_or(next_index);
        match parsed.result {
            Some(result) if parsed.error_msg.is_none() => {
                for (offset, page) in result.layout_parsing_results.into_iter().enumerate() {
                    fragments.push(PageFragment {
                        page_index: start + offset,
                        markup: page.markdown.text,
                        images: page.markdown.images,
                        regions: page
                            .pruned_result
                            .map(|p| p.parsing_res_list)
                            .unwrap_or_default(),
                    });
                    next_index = start + offset + 1;
                }
            }
            _ => {
                let detail = parsed
                    .error_msg
                    .unwrap_or_else(|| "no result for page".to_string());
                warn!("Page {}: extraction failed: {}", start + 1, detail);
                failed.push(PageError::ExtractionFailed {
                    page: start + 1,
                    detail,
                });
                next_index = start + 1;
            }
        }
    }

    (fragments, failed)
}

fn transport_error(e: reqwest::Error) -> ExtractionError {
    ExtractionError::Unreachable {
        detail: e.to_string(),
    }
}

/// Map non-success statuses: 5xx, 408 and 429 may clear up, other 4xx won't.
async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, ExtractionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        Err(ExtractionError::Unreachable { detail })
    } else {
        Err(ExtractionError::Rejected { detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pages_in_arrival_order() {
        let body = r#"
{"result":{"layoutParsingResults":[{"markdown":{"text":"<table><tr><td>A</td></tr></table>","images":{"imgs/a.jpg":"https://cdn.test/a.jpg"}}}]}}
{"result":{"layoutParsingResults":[{"markdown":{"text":"<table><tr><td>B</td></tr></table>"}}]}}
"#;
        let (fragments, failed) = parse_result_lines(body);
        assert!(failed.is_empty());
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].page_index, 0);
        assert_eq!(fragments[1].page_index, 1);
        assert_eq!(
            fragments[0].images.get("imgs/a.jpg").map(String::as_str),
            Some("https://cdn.test/a.jpg")
        );
    }

    #[test]
    fn error_lines_become_one_based_page_errors() {
        let body = r#"
{"result":{"layoutParsingResults":[{"markdown":{"text":"p1"}}]}}
{"errorMsg":"OCR timeout"}
{"result":{"layoutParsingResults":[{"markdown":{"text":"p3"}}]}}
"#;
        let (fragments, failed) = parse_result_lines(body);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].page_index, 2);
        assert_eq!(
            failed,
            vec![PageError::ExtractionFailed {
                page: 2,
                detail: "OCR timeout".into()
            }]
        );
    }

    #[test]
    fn regions_keep_unknown_fields() {
        let body = r#"{"result":{"layoutParsingResults":[{"markdown":{"text":"t"},"prunedResult":{"parsing_res_list":[{"block_label":"table","block_bbox":[1.0,2.0,3.0,4.0],"block_content":"x","block_id":7}]}}]}}"#;
        let (fragments, _) = parse_result_lines(body);
        let region = &fragments[0].regions[0];
        assert_eq!(region.label, "table");
        assert_eq!(region.bbox, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(region.extra.get("block_id"), Some(&serde_json::json!(7)));

        let json = serde_json::to_string(&fragments[0]).unwrap();
        let back: PageFragment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fragments[0]);
    }

    #[test]
    fn garbage_line_counts_as_failed_page() {
        let (fragments, failed) = parse_result_lines("not json\n");
        assert!(fragments.is_empty());
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].page(), 1);
    }

    #[test]
    fn outcome_all_failed_is_rejected() {
        let err = collect_outcome(
            vec![],
            vec![PageError::ExtractionFailed {
                page: 1,
                detail: "blank".into(),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::Rejected { .. }));
    }

    #[test]
    fn outcome_some_failed_is_partial() {
        let err = collect_outcome(
            vec![PageFragment::new(0, "x")],
            vec![PageError::ExtractionFailed {
                page: 2,
                detail: "blank".into(),
            }],
        )
        .unwrap_err();
        match err {
            ExtractionError::PartialResult { fragments, failed } => {
                assert_eq!(fragments.len(), 1);
                assert_eq!(failed[0].page(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn outcome_no_pages_is_ok_and_empty() {
        assert!(collect_outcome(vec![], vec![]).unwrap().is_empty());
    }

    #[test]
    fn payload_always_requests_tables() {
        let payload = OptionalPayload::from(&ExtractionOptions {
            seal: true,
            ..Default::default()
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["useTableRecognition"], true);
        assert_eq!(json["useSealRecognition"], true);
        assert_eq!(json["useChartRecognition"], false);
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_unreachable() {
        let client = HttpLayoutClient::new(
            "http://127.0.0.1:9",
            None,
            Duration::from_secs(2),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .unwrap();
        let doc = Document::from_bytes("a.pdf", b"%PDF-1.4".to_vec()).unwrap();
        let err = client
            .submit(&doc, &ExtractionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Unreachable { .. }));
    }
}
