//! Input resolution: turn a user-supplied path or URL into a [`Document`].
//!
//! The layout service accepts PDFs and page images. We sniff the magic bytes
//! here so an unsupported upload is rejected locally as
//! [`PipelineError::MalformedInput`] instead of costing a round trip to the
//! service.

use crate::error::PipelineError;
use std::path::Path;
use tracing::{debug, info};

/// Kind of document, as far as the layout service is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Image,
}

impl DocumentKind {
    /// Detect the kind from leading magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        const IMAGE_MAGICS: [&[u8]; 5] = [
            b"\x89PNG\r\n\x1a\n",
            b"\xff\xd8\xff",
            b"II*\0",
            b"MM\0*",
            b"BM",
        ];
        if bytes.starts_with(b"%PDF") {
            Some(DocumentKind::Pdf)
        } else if IMAGE_MAGICS.iter().any(|m| bytes.starts_with(m)) {
            Some(DocumentKind::Image)
        } else {
            None
        }
    }

    /// File-type code understood by the layout service.
    pub fn wire_code(self) -> u8 {
        match self {
            DocumentKind::Pdf => 0,
            DocumentKind::Image => 1,
        }
    }
}

/// An uploaded document held in memory.
#[derive(Clone)]
pub struct Document {
    pub name: String,
    pub kind: DocumentKind,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl Document {
    /// Wrap in-memory bytes, validating that the service can read them.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, PipelineError> {
        let name = name.into();
        let kind = DocumentKind::detect(&bytes).ok_or_else(|| PipelineError::MalformedInput {
            detail: format!(
                "'{}' is neither a PDF nor a supported image (first bytes: {:?})",
                name,
                &bytes[..bytes.len().min(4)]
            ),
        })?;
        Ok(Self { name, kind, bytes })
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to an in-memory document.
///
/// URLs are downloaded with the given timeout; anything else is read as a
/// local path.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<Document, PipelineError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

async fn read_local(path: &Path) -> Result<Document, PipelineError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PipelineError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    debug!("Read local document: {} ({} bytes)", path.display(), bytes.len());
    Document::from_bytes(name, bytes)
}

/// Download a URL into memory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<Document, PipelineError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PipelineError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    Document::from_bytes(extract_filename(url), bytes.to_vec())
}

/// Extract a reasonable filename from the URL path.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded-document".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/boq.pdf"));
        assert!(is_url("http://example.com/boq.pdf"));
        assert!(!is_url("/tmp/boq.pdf"));
        assert!(!is_url("boq.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn detects_supported_kinds() {
        assert_eq!(DocumentKind::detect(b"%PDF-1.7\n"), Some(DocumentKind::Pdf));
        assert_eq!(
            DocumentKind::detect(b"\x89PNG\r\n\x1a\n...."),
            Some(DocumentKind::Image)
        );
        assert_eq!(DocumentKind::detect(b"\xff\xd8\xff\xe0"), Some(DocumentKind::Image));
        assert_eq!(DocumentKind::detect(b"PK\x03\x04"), None);
        assert_eq!(DocumentKind::detect(b""), None);
    }

    #[test]
    fn rejects_unsupported_bytes() {
        let err = Document::from_bytes("sheet.xlsx", b"PK\x03\x04rest".to_vec()).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn filename_from_url() {
        assert_eq!(extract_filename("https://h.test/files/boq.pdf"), "boq.pdf");
        assert_eq!(extract_filename("https://h.test/files/"), "downloaded-document");
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn reads_local_pdf() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("boq.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%%EOF").unwrap();
        let doc = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(doc.name, "boq.pdf");
        assert_eq!(doc.kind, DocumentKind::Pdf);
    }
}
