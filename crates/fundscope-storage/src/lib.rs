//! Raw-report archive, HTTP fetch plumbing, and the snapshot repository.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundscope_core::{AnalysisSnapshot, OpportunityRecord};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundscope-storage";

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of raw upstream report payloads, hash-addressed so
/// re-fetching an unchanged report costs nothing.
#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn report_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        category: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(category)
            .join(format!("{content_hash}.json"))
    }

    /// Store payload bytes immutably using a hash-addressed path and atomic
    /// temp-file rename.
    pub async fn store_report(
        &self,
        fetched_at: DateTime<Utc>,
        category: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredReport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.report_relative_path(fetched_at, category, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(StoredReport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = parent.join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredReport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredReport {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Bounded HTTP fetcher with a primary content-negotiating client and a plain
/// fallback client for upstreams that misbehave under compression or strict
/// accept headers.
#[derive(Debug)]
pub struct HttpFetcher {
    primary: reqwest::Client,
    fallback: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut primary = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        let mut fallback = reqwest::Client::builder()
            .no_gzip()
            .no_brotli()
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            primary = primary.user_agent(user_agent.clone());
            fallback = fallback.user_agent(user_agent.clone());
        }

        Ok(Self {
            primary: primary.build().context("building primary http client")?,
            fallback: fallback.build().context("building fallback http client")?,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url, client = "primary");
        let _guard = span.enter();
        Self::execute(self.primary.get(url), url).await
    }

    /// Secondary decoding strategy: plain transfer with an explicit JSON
    /// accept header, used when the primary response fails to decode.
    pub async fn fetch_bytes_fallback(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url, client = "fallback");
        let _guard = span.enter();
        Self::execute(
            self.fallback
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json"),
            url,
        )
        .await
    }

    async fn execute(
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }
        Ok(body)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot {0} not found")]
    SnapshotNotFound(i64),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Replace/read/delete surface over snapshots and their records.
///
/// `replace_snapshot` is the single write path: it atomically swaps the
/// snapshot occupying the fixed identity slot together with every record
/// attached to it.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn replace_snapshot(
        &self,
        snapshot: AnalysisSnapshot,
        records: Vec<OpportunityRecord>,
    ) -> Result<(), StorageError>;

    async fn find_snapshot(&self, id: i64) -> Result<Option<AnalysisSnapshot>, StorageError>;

    async fn snapshots(&self) -> Result<Vec<AnalysisSnapshot>, StorageError>;

    async fn records_for(&self, snapshot_id: i64)
        -> Result<Vec<OpportunityRecord>, StorageError>;

    async fn relevant_records_for(
        &self,
        snapshot_id: i64,
    ) -> Result<Vec<OpportunityRecord>, StorageError>;

    async fn records_by_source(
        &self,
        snapshot_id: i64,
        data_source: &str,
    ) -> Result<Vec<OpportunityRecord>, StorageError>;

    async fn search_records(&self, term: &str) -> Result<Vec<OpportunityRecord>, StorageError>;

    async fn delete_all(&self) -> Result<(), StorageError>;

    async fn snapshot_count(&self) -> Result<u64, StorageError>;

    async fn record_count(&self) -> Result<u64, StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: BTreeMap<i64, AnalysisSnapshot>,
    records: Vec<OpportunityRecord>,
}

/// In-process repository. Snapshots live in a small fixed keyspace, so a
/// single RwLock over both maps is enough; per-category write serialization
/// happens one layer up in the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<RwLock<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRepository for MemoryRepository {
    async fn replace_snapshot(
        &self,
        snapshot: AnalysisSnapshot,
        records: Vec<OpportunityRecord>,
    ) -> Result<(), StorageError> {
        let mut state = self.inner.write().await;
        let id = snapshot.id;
        state.records.retain(|r| r.snapshot_id != id);
        state.snapshots.insert(id, snapshot);
        state.records.extend(records);
        Ok(())
    }

    async fn find_snapshot(&self, id: i64) -> Result<Option<AnalysisSnapshot>, StorageError> {
        let state = self.inner.read().await;
        Ok(state.snapshots.get(&id).cloned())
    }

    async fn snapshots(&self) -> Result<Vec<AnalysisSnapshot>, StorageError> {
        let state = self.inner.read().await;
        Ok(state.snapshots.values().cloned().collect())
    }

    async fn records_for(
        &self,
        snapshot_id: i64,
    ) -> Result<Vec<OpportunityRecord>, StorageError> {
        let state = self.inner.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.snapshot_id == snapshot_id)
            .cloned()
            .collect())
    }

    async fn relevant_records_for(
        &self,
        snapshot_id: i64,
    ) -> Result<Vec<OpportunityRecord>, StorageError> {
        let state = self.inner.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.snapshot_id == snapshot_id && r.is_relevant())
            .cloned()
            .collect())
    }

    async fn records_by_source(
        &self,
        snapshot_id: i64,
        data_source: &str,
    ) -> Result<Vec<OpportunityRecord>, StorageError> {
        let state = self.inner.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.snapshot_id == snapshot_id && r.data_source == data_source)
            .cloned()
            .collect())
    }

    async fn search_records(&self, term: &str) -> Result<Vec<OpportunityRecord>, StorageError> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let matches = |field: &Option<String>| {
            field
                .as_deref()
                .map(|v| v.to_lowercase().contains(&needle))
                .unwrap_or(false)
        };
        let state = self.inner.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| matches(&r.title) || matches(&r.main_title) || matches(&r.description))
            .cloned()
            .collect())
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        let mut state = self.inner.write().await;
        state.snapshots.clear();
        state.records.clear();
        Ok(())
    }

    async fn snapshot_count(&self) -> Result<u64, StorageError> {
        let state = self.inner.read().await;
        Ok(state.snapshots.len() as u64)
    }

    async fn record_count(&self) -> Result<u64, StorageError> {
        let state = self.inner.read().await;
        Ok(state.records.len() as u64)
    }
}
