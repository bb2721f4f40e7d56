//! Job persistence.
//!
//! Every job owns one directory, `<root>/<job-id>/`:
//!
//! ```text
//! job.json        the ExtractionJob record
//! imgs/           resolved images
//! stitched.json   the stitched table
//! priced.json     the cost sheet
//! tiers.json      tier variants, when requested
//! ```
//!
//! The directory is created exclusively when the job claims it, so two jobs
//! can never write into the same place. Artifacts are written to a temp file
//! in the same directory and renamed into place, so a reader sees either the
//! old file or the complete new one.

use crate::error::StoreError;
use crate::job::{ExtractionJob, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name of the job record inside its artifact directory.
pub const JOB_FILE: &str = "job.json";
pub const STITCHED_FILE: &str = "stitched.json";
pub const PRICED_FILE: &str = "priced.json";
pub const TIERS_FILE: &str = "tiers.json";

/// Default artifact retention: one week.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(168 * 3600);

/// Storage for job records and their artifacts.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: &JobId) -> Result<ExtractionJob, StoreError>;

    async fn put(&self, job: &ExtractionJob) -> Result<(), StoreError>;

    /// Remove the record and every artifact of the job.
    async fn delete(&self, id: &JobId) -> Result<(), StoreError>;

    /// Directory that holds (or will hold) the job's artifacts.
    fn artifact_dir(&self, id: &JobId) -> PathBuf;

    /// Create the job's artifact directory. Fails with
    /// [`StoreError::AlreadyClaimed`] if it already exists.
    async fn claim_artifact_dir(&self, id: &JobId) -> Result<PathBuf, StoreError>;

    /// Atomically write `bytes` as `name` inside the job's artifact directory.
    async fn write_artifact(
        &self,
        id: &JobId,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<PathBuf, StoreError>;

    /// Delete every job last updated longer than `retention` ago. Returns the
    /// purged ids.
    async fn purge_expired(&self, retention: Duration) -> Result<Vec<JobId>, StoreError>;
}

// ── Shared helpers ───────────────────────────────────────────────────────

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn claim_dir(root: &Path, id: &JobId) -> Result<PathBuf, StoreError> {
    tokio::fs::create_dir_all(root).await.map_err(io_error(root))?;
    let dir = root.join(id.to_string());
    match tokio::fs::create_dir(&dir).await {
        Ok(()) => {
            debug!("Claimed artifact directory {}", dir.display());
            Ok(dir)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(StoreError::AlreadyClaimed { path: dir })
        }
        Err(e) => Err(io_error(&dir)(e)),
    }
}

/// Write through a temp file in the target directory, then rename.
async fn atomic_write(dir: PathBuf, name: String, bytes: Vec<u8>) -> Result<PathBuf, StoreError> {
    tokio::task::spawn_blocking(move || {
        let target = dir.join(&name);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_error(&dir))?;
        tmp.write_all(&bytes).map_err(io_error(&target))?;
        tmp.as_file().sync_all().map_err(io_error(&target))?;
        tmp.persist(&target)
            .map_err(|e| io_error(&target)(e.error))?;
        Ok::<_, StoreError>(target)
    })
    .await
    .map_err(|e| StoreError::Io {
        path: PathBuf::new(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?
}

fn cutoff(retention: Duration) -> Option<DateTime<Utc>> {
    let retention = chrono::Duration::from_std(retention).ok()?;
    Utc::now().checked_sub_signed(retention)
}

fn serialize(job: &ExtractionJob, path: &Path) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(job).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })
}

// ── Filesystem store ─────────────────────────────────────────────────────

/// Job records and artifacts under one root directory.
#[derive(Debug, Clone)]
pub struct FsJobStore {
    root: PathBuf,
}

impl FsJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_job(path: &Path) -> Result<ExtractionJob, StoreError> {
        let bytes = tokio::fs::read(path).await.map_err(io_error(path))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn get(&self, id: &JobId) -> Result<ExtractionJob, StoreError> {
        let path = self.artifact_dir(id).join(JOB_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Self::read_job(&path).await
    }

    async fn put(&self, job: &ExtractionJob) -> Result<(), StoreError> {
        let dir = self.artifact_dir(&job.id);
        let bytes = serialize(job, &dir.join(JOB_FILE))?;
        atomic_write(dir, JOB_FILE.to_string(), bytes).await?;
        Ok(())
    }

    async fn delete(&self, id: &JobId) -> Result<(), StoreError> {
        let dir = self.artifact_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => Err(io_error(&dir)(e)),
        }
    }

    fn artifact_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id.to_string())
    }

    async fn claim_artifact_dir(&self, id: &JobId) -> Result<PathBuf, StoreError> {
        claim_dir(&self.root, id).await
    }

    async fn write_artifact(
        &self,
        id: &JobId,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<PathBuf, StoreError> {
        atomic_write(self.artifact_dir(id), name.to_string(), bytes).await
    }

    async fn purge_expired(&self, retention: Duration) -> Result<Vec<JobId>, StoreError> {
        let Some(cutoff) = cutoff(retention) else {
            return Ok(Vec::new());
        };
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.root)(e)),
        };

        let mut purged = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.root))? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(JobId::parse) else {
                continue;
            };
            let updated_at = match Self::read_job(&entry.path().join(JOB_FILE)).await {
                Ok(job) => job.updated_at,
                Err(e) => {
                    // Directory without a readable record: fall back to its mtime.
                    debug!("Job {}: {}", id, e);
                    match entry.metadata().await.and_then(|m| m.modified()) {
                        Ok(mtime) => DateTime::<Utc>::from(mtime),
                        Err(_) => continue,
                    }
                }
            };
            if updated_at < cutoff {
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => purged.push(id),
                    Err(e) => warn!("Could not purge job {}: {}", id, e),
                }
            }
        }

        if !purged.is_empty() {
            info!("Purged {} expired job(s) from {}", purged.len(), self.root.display());
        }
        Ok(purged)
    }
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Records in memory, artifacts under a caller-provided directory.
#[derive(Debug)]
pub struct MemoryJobStore {
    artifact_root: PathBuf,
    jobs: Mutex<HashMap<JobId, ExtractionJob>>,
}

impl MemoryJobStore {
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, ExtractionJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: &JobId) -> Result<ExtractionJob, StoreError> {
        self.jobs()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put(&self, job: &ExtractionJob) -> Result<(), StoreError> {
        self.jobs().insert(job.id, job.clone());
        Ok(())
    }

    async fn delete(&self, id: &JobId) -> Result<(), StoreError> {
        if self.jobs().remove(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let dir = self.artifact_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir)(e)),
        }
    }

    fn artifact_dir(&self, id: &JobId) -> PathBuf {
        self.artifact_root.join(id.to_string())
    }

    async fn claim_artifact_dir(&self, id: &JobId) -> Result<PathBuf, StoreError> {
        claim_dir(&self.artifact_root, id).await
    }

    async fn write_artifact(
        &self,
        id: &JobId,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<PathBuf, StoreError> {
        atomic_write(self.artifact_dir(id), name.to_string(), bytes).await
    }

    async fn purge_expired(&self, retention: Duration) -> Result<Vec<JobId>, StoreError> {
        let Some(cutoff) = cutoff(retention) else {
            return Ok(Vec::new());
        };
        let expired: Vec<JobId> = self
            .jobs()
            .values()
            .filter(|j| j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();
        for id in &expired {
            self.delete(id).await?;
        }
        Ok(expired)
    }
}
