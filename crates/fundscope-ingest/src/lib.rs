//! Ingestion orchestration: fetch, parse, normalize, replace, schedule.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use fundscope_core::{AnalysisCategory, AnalysisSnapshot};
use fundscope_report::{normalize_row, parse_last_update, parse_report, parse_report_lenient, ParseError};
use fundscope_storage::{
    FetchError, HttpClientConfig, HttpFetcher, ReportArchive, SnapshotRepository, StorageError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "fundscope-ingest";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub cron_uk: String,
    pub cron_eu: String,
    pub cooldown_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub startup_purge: bool,
    pub startup_fetch: bool,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("FUNDSCOPE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string()),
            http_timeout_secs: std::env::var("FUNDSCOPE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("FUNDSCOPE_USER_AGENT")
                .unwrap_or_else(|_| "fundscope/0.1".to_string()),
            scheduler_enabled: env_flag("FUNDSCOPE_SCHEDULER_ENABLED", true),
            cron_uk: std::env::var("FUNDSCOPE_CRON_UK")
                .unwrap_or_else(|_| "0 0 8 * * *".to_string()),
            cron_eu: std::env::var("FUNDSCOPE_CRON_EU")
                .unwrap_or_else(|_| "0 5 8 * * *".to_string()),
            cooldown_secs: std::env::var("FUNDSCOPE_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            archive_dir: match std::env::var("FUNDSCOPE_ARCHIVE_DIR") {
                Ok(v) if v.is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => Some(PathBuf::from("./archive")),
            },
            startup_purge: env_flag("FUNDSCOPE_STARTUP_PURGE", true),
            startup_fetch: env_flag("FUNDSCOPE_STARTUP_FETCH", true),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Fetch collaborator resolved per category. The fallback path uses a
/// different content-negotiation strategy for upstreams whose primary
/// responses fail to decode.
#[async_trait]
pub trait ReportFetch: Send + Sync {
    fn report_url(&self, category: AnalysisCategory) -> String;

    async fn fetch(&self, category: AnalysisCategory) -> Result<Vec<u8>, FetchError>;

    async fn fetch_fallback(&self, category: AnalysisCategory) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpReportFetcher {
    http: HttpFetcher,
    base_url: String,
}

impl HttpReportFetcher {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReportFetch for HttpReportFetcher {
    fn report_url(&self, category: AnalysisCategory) -> String {
        format!("{}{}", self.base_url, category.endpoint_path())
    }

    async fn fetch(&self, category: AnalysisCategory) -> Result<Vec<u8>, FetchError> {
        self.http.fetch_bytes(&self.report_url(category)).await
    }

    async fn fetch_fallback(&self, category: AnalysisCategory) -> Result<Vec<u8>, FetchError> {
        self.http
            .fetch_bytes_fallback(&self.report_url(category))
            .await
    }
}

/// Everything that can abort one ingestion cycle. Each variant is fatal for
/// the cycle: no partial snapshot is ever written, and nothing is retried
/// within a single invocation.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetching {category} report from {url}: {source}")]
    Fetch {
        category: AnalysisCategory,
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding {category} report from {url}: {source}")]
    Parse {
        category: AnalysisCategory,
        url: String,
        #[source]
        source: ParseError,
    },
    #[error("persisting {category} snapshot: {source}")]
    Storage {
        category: AnalysisCategory,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub snapshot: AnalysisSnapshot,
    pub total_rows: u64,
    pub retained: u64,
    pub filtered_out: u64,
}

/// Drives one full ingestion cycle per category and serializes cycles for
/// the same category behind a per-key lock, so a scheduled trigger and a
/// manual trigger can never interleave partial writes on one identity slot.
pub struct Ingestor {
    fetcher: Arc<dyn ReportFetch>,
    repository: Arc<dyn SnapshotRepository>,
    archive: Option<ReportArchive>,
    locks: [Mutex<()>; 2],
}

impl Ingestor {
    pub fn new(
        fetcher: Arc<dyn ReportFetch>,
        repository: Arc<dyn SnapshotRepository>,
        archive: Option<ReportArchive>,
    ) -> Self {
        Self {
            fetcher,
            repository,
            archive,
            locks: [Mutex::new(()), Mutex::new(())],
        }
    }

    pub fn repository(&self) -> &Arc<dyn SnapshotRepository> {
        &self.repository
    }

    fn lock_for(&self, category: AnalysisCategory) -> &Mutex<()> {
        &self.locks[(category.snapshot_id() - 1) as usize]
    }

    /// Run one ingestion cycle: fetch, parse (with one fallback attempt),
    /// normalize and filter every row, then atomically replace the
    /// category's snapshot.
    pub async fn ingest(&self, category: AnalysisCategory) -> Result<IngestSummary, IngestError> {
        let _cycle = self.lock_for(category).lock().await;

        let url = self.fetcher.report_url(category);
        info!(%category, %url, "starting ingestion cycle");

        let fetched_at = Utc::now();
        let body = self
            .fetcher
            .fetch(category)
            .await
            .map_err(|source| IngestError::Fetch {
                category,
                url: url.clone(),
                source,
            })?;

        self.archive_raw(category, fetched_at, &body).await;

        let payload = match parse_report(&body) {
            Ok(payload) => payload,
            Err(primary_err) => {
                warn!(
                    %category,
                    error = %primary_err,
                    "strict report decode failed, retrying via fallback client"
                );
                let fallback_body = self.fetcher.fetch_fallback(category).await.map_err(
                    |source| IngestError::Fetch {
                        category,
                        url: url.clone(),
                        source,
                    },
                )?;
                self.archive_raw(category, Utc::now(), &fallback_body).await;
                parse_report_lenient(&fallback_body).map_err(|source| IngestError::Parse {
                    category,
                    url: url.clone(),
                    source,
                })?
            }
        };

        let mut snapshot = AnalysisSnapshot::shell(category);
        snapshot.status = payload.status.clone();
        snapshot.last_update = payload
            .last_update
            .as_deref()
            .and_then(|raw| best_effort_last_update(category, raw));
        if let Some(stats) = &payload.statistics {
            snapshot.llm_analyzed_count = stats.llm_analyzed_count;
            snapshot.projects_count = stats.projects_count;
            snapshot.relevant_count = stats.relevant_count;
        }

        let mut records = Vec::new();
        let mut total_rows = 0u64;
        let mut filtered_out = 0u64;
        for (segment_name, segment) in &payload.results {
            for row in &segment.data {
                total_rows += 1;
                match normalize_row(row, segment_name, snapshot.id) {
                    Some(record) => records.push(record),
                    None => filtered_out += 1,
                }
            }
        }
        let retained = records.len() as u64;
        info!(
            %category,
            total_rows,
            filtered_out,
            retained,
            "normalized report rows"
        );

        // Upstream-reported statistics win; otherwise compute from what we
        // actually kept.
        if snapshot.projects_count.is_none() {
            snapshot.projects_count = Some(retained);
        }
        if snapshot.relevant_count.is_none() {
            snapshot.relevant_count =
                Some(records.iter().filter(|r| r.is_relevant()).count() as u64);
        }

        self.repository
            .replace_snapshot(snapshot.clone(), records)
            .await
            .map_err(|source| IngestError::Storage { category, source })?;

        info!(
            %category,
            snapshot_id = snapshot.id,
            projects = ?snapshot.projects_count,
            relevant = ?snapshot.relevant_count,
            "ingestion cycle completed"
        );

        Ok(IngestSummary {
            snapshot,
            total_rows,
            retained,
            filtered_out,
        })
    }

    /// Archiving the raw payload is best-effort bookkeeping; it never fails
    /// a cycle.
    async fn archive_raw(
        &self,
        category: AnalysisCategory,
        fetched_at: DateTime<Utc>,
        body: &[u8],
    ) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.store_report(fetched_at, category.as_str(), body).await {
            Ok(stored) if stored.deduplicated => {
                info!(%category, hash = %stored.content_hash, "raw report unchanged, deduplicated");
            }
            Ok(stored) => {
                info!(%category, path = %stored.relative_path.display(), "archived raw report");
            }
            Err(err) => {
                warn!(%category, error = %err, "failed to archive raw report");
            }
        }
    }

    /// On-demand "run everything": UK strictly before EU with a cooldown gap
    /// so the upstream never sees back-to-back requests. A failed category
    /// never blocks the other.
    pub async fn run_all(&self, cooldown: Duration) -> RunAllReport {
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(AnalysisCategory::ALL.len());

        for (idx, category) in AnalysisCategory::ALL.into_iter().enumerate() {
            if idx > 0 {
                sleep(cooldown).await;
            }
            match self.ingest(category).await {
                Ok(summary) => outcomes.push(CategoryRunOutcome::success(category, &summary)),
                Err(err) => {
                    error!(%category, error = %err, "on-demand ingestion failed");
                    outcomes.push(CategoryRunOutcome::failure(category, &err));
                }
            }
        }

        RunAllReport {
            started_at,
            finished_at: Utc::now(),
            outcomes,
        }
    }
}

fn best_effort_last_update(category: AnalysisCategory, raw: &str) -> Option<NaiveDateTime> {
    let parsed = parse_last_update(raw);
    if parsed.is_none() {
        warn!(%category, raw, "could not parse upstream last_update, leaving empty");
    }
    parsed
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryRunOutcome {
    pub category: AnalysisCategory,
    pub success: bool,
    pub snapshot_id: Option<i64>,
    pub projects_count: Option<u64>,
    pub relevant_count: Option<u64>,
    pub error: Option<String>,
}

impl CategoryRunOutcome {
    fn success(category: AnalysisCategory, summary: &IngestSummary) -> Self {
        Self {
            category,
            success: true,
            snapshot_id: Some(summary.snapshot.id),
            projects_count: summary.snapshot.projects_count,
            relevant_count: summary.snapshot.relevant_count,
            error: None,
        }
    }

    fn failure(category: AnalysisCategory, err: &IngestError) -> Self {
        Self {
            category,
            success: false,
            snapshot_id: None,
            projects_count: None,
            relevant_count: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunAllReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<CategoryRunOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub cron_uk: String,
    pub cron_eu: String,
}

impl SchedulerSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            enabled: config.scheduler_enabled,
            cron_uk: config.cron_uk.clone(),
            cron_eu: config.cron_eu.clone(),
        }
    }
}

/// Register one independent cron job per category. Scheduled failures are
/// logged and dropped; the next window retries naturally.
pub async fn build_scheduler(
    ingestor: Arc<Ingestor>,
    config: &IngestConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let jobs = [
        (AnalysisCategory::Uk, config.cron_uk.clone()),
        (AnalysisCategory::Eu, config.cron_eu.clone()),
    ];
    for (category, cron) in jobs {
        let ingestor = ingestor.clone();
        let job = Job::new_async(cron.as_str(), move |_id, _lock| {
            let ingestor = ingestor.clone();
            Box::pin(async move {
                info!(%category, "scheduled ingestion triggered");
                match ingestor.ingest(category).await {
                    Ok(summary) => info!(
                        %category,
                        snapshot_id = summary.snapshot.id,
                        retained = summary.retained,
                        "scheduled ingestion completed"
                    ),
                    Err(err) => error!(%category, error = %err, "scheduled ingestion failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Startup housekeeping: wipe prior state so fixed snapshot identities start
/// from a clean slate.
pub async fn startup_cleanup(repository: &Arc<dyn SnapshotRepository>) -> Result<(), StorageError> {
    let snapshots = repository.snapshot_count().await?;
    let records = repository.record_count().await?;
    if snapshots == 0 && records == 0 {
        info!("storage already empty, no startup cleanup needed");
        return Ok(());
    }
    info!(snapshots, records, "clearing prior state on startup");
    repository.delete_all().await
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStatistics {
    pub category: AnalysisCategory,
    pub snapshot_id: i64,
    pub created_at: DateTime<Utc>,
    pub last_update: Option<NaiveDateTime>,
    pub status: Option<String>,
    pub total_records: u64,
    pub relevant_records: u64,
    pub relevance_percentage: f64,
    pub by_data_source: BTreeMap<String, u64>,
    pub by_pertinence: BTreeMap<String, u64>,
}

/// Computed per-category view over the stored snapshot and its records.
pub async fn category_statistics(
    repository: &dyn SnapshotRepository,
    category: AnalysisCategory,
) -> Result<Option<CategoryStatistics>, StorageError> {
    let Some(snapshot) = repository.find_snapshot(category.snapshot_id()).await? else {
        return Ok(None);
    };
    let records = repository.records_for(snapshot.id).await?;

    let total = records.len() as u64;
    let relevant = records.iter().filter(|r| r.is_relevant()).count() as u64;
    let mut by_data_source = BTreeMap::new();
    let mut by_pertinence = BTreeMap::new();
    for record in &records {
        *by_data_source.entry(record.data_source.clone()).or_default() += 1;
        if let Some(pertinence) = &record.pertinence {
            *by_pertinence.entry(pertinence.clone()).or_default() += 1;
        }
    }

    Ok(Some(CategoryStatistics {
        category,
        snapshot_id: snapshot.id,
        created_at: snapshot.created_at,
        last_update: snapshot.last_update,
        status: snapshot.status,
        total_records: total,
        relevant_records: relevant,
        relevance_percentage: if total > 0 {
            relevant as f64 * 100.0 / total as f64
        } else {
            0.0
        },
        by_data_source,
        by_pertinence,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundscope_storage::MemoryRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::Mutex as AsyncMutex;

    const SAMPLE_REPORT: &str = r#"{
        "analysis_type": "uk_analysis",
        "last_update": "2026-08-29T08:00:00",
        "status": "completed",
        "results": {
            "A": {
                "columns": ["Title", "Matching Word(s)"],
                "count": 1,
                "data": [{"Title": "X", "Matching Word(s)": "grant", "Pertinence": "Yes"}]
            },
            "B": {
                "columns": ["Title", "Matching Word(s)"],
                "count": 1,
                "data": [{"Title": "Y", "Matching Word(s)": "NaN"}]
            }
        }
    }"#;

    struct StubFetch {
        bodies: Vec<Vec<u8>>,
        fallback_body: Option<Vec<u8>>,
        calls: AtomicUsize,
        fallback_calls: AtomicUsize,
    }

    impl StubFetch {
        fn returning(body: &str) -> Self {
            Self {
                bodies: vec![body.as_bytes().to_vec()],
                fallback_body: None,
                calls: AtomicUsize::new(0),
                fallback_calls: AtomicUsize::new(0),
            }
        }

        fn with_fallback(primary: &str, fallback: &str) -> Self {
            Self {
                fallback_body: Some(fallback.as_bytes().to_vec()),
                ..Self::returning(primary)
            }
        }
    }

    #[async_trait]
    impl ReportFetch for StubFetch {
        fn report_url(&self, category: AnalysisCategory) -> String {
            format!("stub:{}", category.endpoint_path())
        }

        async fn fetch(&self, category: AnalysisCategory) -> Result<Vec<u8>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self.bodies[call.min(self.bodies.len() - 1)].clone();
            if body.is_empty() {
                return Err(FetchError::EmptyBody {
                    url: self.report_url(category),
                });
            }
            Ok(body)
        }

        async fn fetch_fallback(&self, category: AnalysisCategory) -> Result<Vec<u8>, FetchError> {
            self.fallback_calls.fetch_add(1, Ordering::SeqCst);
            match &self.fallback_body {
                Some(body) => Ok(body.clone()),
                None => Err(FetchError::EmptyBody {
                    url: self.report_url(category),
                }),
            }
        }
    }

    fn ingestor_with(fetch: StubFetch) -> (Ingestor, Arc<StubFetch>) {
        let fetch = Arc::new(fetch);
        let repo: Arc<dyn SnapshotRepository> = Arc::new(MemoryRepository::new());
        (Ingestor::new(fetch.clone(), repo, None), fetch)
    }

    #[tokio::test]
    async fn end_to_end_filters_invalid_segment_rows() {
        let (ingestor, fetch) = ingestor_with(StubFetch::returning(SAMPLE_REPORT));
        let summary = ingestor.ingest(AnalysisCategory::Uk).await.expect("ingest");

        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.retained, 1);
        assert_eq!(summary.filtered_out, 1);
        assert_eq!(summary.snapshot.id, 1);
        assert_eq!(summary.snapshot.projects_count, Some(1));
        assert_eq!(summary.snapshot.relevant_count, Some(1));
        assert!(summary.snapshot.last_update.is_some());
        assert_eq!(fetch.fallback_calls.load(Ordering::SeqCst), 0);

        let records = ingestor.repository().records_for(1).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title.as_deref(), Some("X"));
        assert_eq!(records[0].data_source, "A");
    }

    #[tokio::test]
    async fn upstream_statistics_win_over_local_counts() {
        let body = r#"{
            "status": "completed",
            "statistics": {"llm_analyzed_count": 40, "projects_count": 120, "relevant_count": 30},
            "results": {
                "A": {"data": [{"Title": "X", "Matching Word(s)": "grant", "Pertinence": "No"}]}
            }
        }"#;
        let (ingestor, _) = ingestor_with(StubFetch::returning(body));
        let summary = ingestor.ingest(AnalysisCategory::Eu).await.expect("ingest");

        assert_eq!(summary.snapshot.id, 2);
        assert_eq!(summary.snapshot.projects_count, Some(120));
        assert_eq!(summary.snapshot.relevant_count, Some(30));
        assert_eq!(summary.snapshot.llm_analyzed_count, Some(40));
        assert_eq!(summary.retained, 1);
    }

    #[tokio::test]
    async fn bare_nan_payload_engages_fallback_decode() {
        let primary = r#"{"results": {"A": {"data": [{"Title": "X", "Matching Word(s)": "ai", "Deadline": NaN}]}}}"#;
        let (ingestor, fetch) = ingestor_with(StubFetch::with_fallback(primary, primary));

        let summary = ingestor.ingest(AnalysisCategory::Uk).await.expect("ingest");
        assert_eq!(fetch.fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.retained, 1);

        let records = ingestor.repository().records_for(1).await.unwrap();
        assert_eq!(records[0].deadline, None);
    }

    #[tokio::test]
    async fn both_decodes_failing_aborts_without_partial_write() {
        let (ingestor, _) =
            ingestor_with(StubFetch::with_fallback("<html>down</html>", "<html>down</html>"));
        let err = ingestor.ingest(AnalysisCategory::Uk).await.unwrap_err();
        assert!(matches!(err, IngestError::Parse { .. }));
        assert_eq!(ingestor.repository().snapshot_count().await.unwrap(), 0);
        assert_eq!(ingestor.repository().record_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_body_is_a_fetch_error() {
        let (ingestor, _) = ingestor_with(StubFetch::returning(""));
        let err = ingestor.ingest(AnalysisCategory::Uk).await.unwrap_err();
        assert!(matches!(err, IngestError::Fetch { .. }));
    }

    #[tokio::test]
    async fn reingesting_replaces_rather_than_appends() {
        let fetch = Arc::new(StubFetch::returning(SAMPLE_REPORT));
        let repo: Arc<dyn SnapshotRepository> = Arc::new(MemoryRepository::new());
        let ingestor = Ingestor::new(fetch, repo.clone(), None);

        ingestor.ingest(AnalysisCategory::Uk).await.expect("first");
        ingestor.ingest(AnalysisCategory::Uk).await.expect("second");

        assert_eq!(repo.snapshot_count().await.unwrap(), 1);
        assert_eq!(repo.records_for(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_all_is_sequential_with_cooldown_and_isolated_failures() {
        struct PerCategoryFetch {
            log: AsyncMutex<Vec<(AnalysisCategory, Instant)>>,
        }

        #[async_trait]
        impl ReportFetch for PerCategoryFetch {
            fn report_url(&self, category: AnalysisCategory) -> String {
                format!("stub:{}", category.endpoint_path())
            }

            async fn fetch(&self, category: AnalysisCategory) -> Result<Vec<u8>, FetchError> {
                self.log.lock().await.push((category, Instant::now()));
                match category {
                    AnalysisCategory::Uk => Err(FetchError::EmptyBody {
                        url: self.report_url(category),
                    }),
                    AnalysisCategory::Eu => Ok(SAMPLE_REPORT.as_bytes().to_vec()),
                }
            }

            async fn fetch_fallback(
                &self,
                category: AnalysisCategory,
            ) -> Result<Vec<u8>, FetchError> {
                self.fetch(category).await
            }
        }

        let fetch = Arc::new(PerCategoryFetch {
            log: AsyncMutex::new(Vec::new()),
        });
        let repo: Arc<dyn SnapshotRepository> = Arc::new(MemoryRepository::new());
        let ingestor = Ingestor::new(fetch.clone(), repo, None);

        let cooldown = Duration::from_millis(50);
        let report = ingestor.run_all(cooldown).await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes[0].success);
        assert!(report.outcomes[0].error.is_some());
        assert!(report.outcomes[1].success);
        assert_eq!(report.outcomes[1].snapshot_id, Some(2));

        let log = fetch.log.lock().await;
        assert_eq!(log[0].0, AnalysisCategory::Uk);
        assert_eq!(log[1].0, AnalysisCategory::Eu);
        assert!(log[1].1.duration_since(log[0].1) >= cooldown);
    }

    #[tokio::test]
    async fn statistics_breakdowns_cover_source_and_pertinence() {
        let body = r#"{
            "status": "completed",
            "results": {
                "innovate": {"data": [
                    {"Title": "A", "Matching Word(s)": "ai", "Pertinence": "Yes"},
                    {"Title": "B", "Matching Word(s)": "ml", "Pertinence": "No"}
                ]},
                "horizon": {"data": [
                    {"Titre": "C", "Matching Word(s)": "ia", "Pertinence": "Oui"}
                ]}
            }
        }"#;
        let (ingestor, _) = ingestor_with(StubFetch::returning(body));
        ingestor.ingest(AnalysisCategory::Uk).await.expect("ingest");

        let stats = category_statistics(ingestor.repository().as_ref(), AnalysisCategory::Uk)
            .await
            .unwrap()
            .expect("statistics exist");
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.relevant_records, 2);
        assert!(stats.relevant_records <= stats.total_records);
        assert_eq!(stats.by_data_source["innovate"], 2);
        assert_eq!(stats.by_data_source["horizon"], 1);
        assert_eq!(stats.by_pertinence["Yes"], 1);
        assert_eq!(stats.by_pertinence["Oui"], 1);
        assert!((stats.relevance_percentage - 66.666).abs() < 0.1);
    }

    #[tokio::test]
    async fn missing_snapshot_yields_no_statistics() {
        let repo = MemoryRepository::new();
        let stats = category_statistics(&repo, AnalysisCategory::Eu).await.unwrap();
        assert!(stats.is_none());
    }

    #[tokio::test]
    async fn startup_cleanup_purges_prior_state() {
        let repo: Arc<dyn SnapshotRepository> = Arc::new(MemoryRepository::new());
        repo.replace_snapshot(AnalysisSnapshot::shell(AnalysisCategory::Uk), vec![])
            .await
            .unwrap();
        startup_cleanup(&repo).await.unwrap();
        assert_eq!(repo.snapshot_count().await.unwrap(), 0);
    }
}
