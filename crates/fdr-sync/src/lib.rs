//! Pipeline orchestration + metadata store for the disclosure mirror.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use fdr_adapters::{
    discover_documents, extract_members, sanitize_for_filename, DiscoveredDocument, ExtractError,
};
use fdr_core::{DocumentKind, FilingRecord, FilingTypeDescriptor, NaturalKey};
use fdr_storage::{
    fetch_decision, fetch_to_file, unpack, ArtifactStore, FetchDecision, FetchError,
    HttpClientConfig, HttpFetcher, Probe, ProbeError, RemoteSource, UnpackError,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fdr-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub first_year: i64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FDR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let database_url = std::env::var("FDR_DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}", data_dir.join("fdr.db").display()));
        Self {
            base_url: std::env::var("FDR_BASE_URL")
                .unwrap_or_else(|_| "https://disclosures-clerk.house.gov".to_string()),
            data_dir,
            database_url,
            user_agent: std::env::var("FDR_USER_AGENT")
                .unwrap_or_else(|_| "fdr-mirror/0.1".to_string()),
            http_timeout_secs: std::env::var("FDR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            probe_timeout_secs: std::env::var("FDR_PROBE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            first_year: std::env::var("FDR_FIRST_YEAR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2008),
        }
    }

    /// The archive publishes yearly bulk files from 2008 onward.
    pub fn covered_years(&self) -> RangeInclusive<i64> {
        self.first_year..=i64::from(Utc::now().year())
    }
}

pub fn bulk_archive_url(base_url: &str, year: i64) -> String {
    format!("{base_url}/public_disc/financial-pdfs/{year}FD.zip")
}

pub fn document_url(base_url: &str, year: i64, kind: DocumentKind, doc_id: &str) -> String {
    format!(
        "{base_url}/public_disc/{}/{year}/{doc_id}.pdf",
        kind.url_segment()
    )
}

pub fn bulk_archive_rel(year: i64) -> PathBuf {
    PathBuf::from("fd_zips").join(format!("{year}FD.zip"))
}

pub fn bulk_xml_dir_rel(year: i64) -> PathBuf {
    PathBuf::from("fd_xml").join(year.to_string())
}

pub fn bulk_xml_rel(year: i64) -> PathBuf {
    bulk_xml_dir_rel(year).join(format!("{year}FD.xml"))
}

pub fn document_rel(year: i64, kind: DocumentKind, doc_id: &str) -> PathBuf {
    PathBuf::from("documents")
        .join(year.to_string())
        .join(format!("{}.{doc_id}.pdf", kind.file_stem()))
}

fn search_document_rel(doc: &DiscoveredDocument) -> PathBuf {
    let folder = format!(
        "{}_{}",
        sanitize_for_filename(&doc.name),
        sanitize_for_filename(&doc.office)
    );
    let file = format!(
        "{}_{}_{}_{}.pdf",
        doc.filing_year,
        doc.kind().label(),
        sanitize_for_filename(&doc.filing_type),
        doc.doc_id().unwrap_or("unknown")
    );
    PathBuf::from("search_pdfs").join(folder).join(file)
}

fn join_url(base_url: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else if link.starts_with('/') {
        format!("{base_url}{link}")
    } else {
        format!("{base_url}/{link}")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Metadata-store seam used by the ingestion engine and the document
/// fetcher. The handle is passed explicitly to every consumer; nothing in
/// the pipeline holds global connection state.
#[async_trait]
pub trait FilingStore: Send + Sync {
    async fn exists<'a>(&self, key: NaturalKey<'a>) -> Result<bool, StoreError>;
    async fn insert(&self, record: &FilingRecord) -> Result<(), StoreError>;
    async fn select_all(&self) -> Result<Vec<FilingRecord>, StoreError>;
    async fn filing_types(&self) -> Result<Vec<FilingTypeDescriptor>, StoreError>;
}

/// SQLite-backed metadata store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        Self::with_options(options).await
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::with_options(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // Single writer model: the check-then-insert sequence in `ingest`
        // is only safe without concurrent writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Create the schema and seed the filing-type reference table. Safe to
    /// run repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS filings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                year INTEGER NOT NULL,
                prefix TEXT NOT NULL,
                last_name TEXT NOT NULL,
                first_name TEXT NOT NULL,
                suffix TEXT NOT NULL,
                filing_type TEXT NOT NULL,
                state_district TEXT NOT NULL,
                filing_date TEXT NOT NULL,
                UNIQUE (doc_id, filing_date, year, filing_type, last_name, first_name, state_district)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS filing_types (
                code TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                meaning TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for descriptor in FilingTypeDescriptor::known() {
            sqlx::query(
                "INSERT OR IGNORE INTO filing_types (code, description, meaning) VALUES (?1, ?2, ?3)",
            )
            .bind(&descriptor.code)
            .bind(&descriptor.description)
            .bind(&descriptor.meaning)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FilingStore for SqliteStore {
    async fn exists<'a>(&self, key: NaturalKey<'a>) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM filings
             WHERE doc_id = ?1 AND filing_date = ?2 AND year = ?3 AND filing_type = ?4
               AND last_name = ?5 AND first_name = ?6 AND state_district = ?7",
        )
        .bind(key.doc_id)
        .bind(key.filing_date)
        .bind(key.year)
        .bind(key.filing_type)
        .bind(key.last_name)
        .bind(key.first_name)
        .bind(key.state_district)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert(&self, record: &FilingRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO filings
                (doc_id, year, prefix, last_name, first_name, suffix, filing_type, state_district, filing_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&record.doc_id)
        .bind(record.year)
        .bind(&record.prefix)
        .bind(&record.last_name)
        .bind(&record.first_name)
        .bind(&record.suffix)
        .bind(&record.filing_type)
        .bind(&record.state_district)
        .bind(&record.filing_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_all(&self) -> Result<Vec<FilingRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc_id, year, prefix, last_name, first_name, suffix, filing_type, state_district, filing_date
             FROM filings ORDER BY year, doc_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(FilingRecord {
                    doc_id: row.try_get("doc_id")?,
                    year: row.try_get("year")?,
                    prefix: row.try_get("prefix")?,
                    last_name: row.try_get("last_name")?,
                    first_name: row.try_get("first_name")?,
                    suffix: row.try_get("suffix")?,
                    filing_type: row.try_get("filing_type")?,
                    state_district: row.try_get("state_district")?,
                    filing_date: row.try_get("filing_date")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn filing_types(&self) -> Result<Vec<FilingTypeDescriptor>, StoreError> {
        let rows =
            sqlx::query("SELECT code, description, meaning FROM filing_types ORDER BY code")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                Ok(FilingTypeDescriptor {
                    code: row.try_get("code")?,
                    description: row.try_get("description")?,
                    meaning: row.try_get("meaning")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub inserted: usize,
    pub failed: usize,
    pub duplicate: usize,
}

impl IngestCounts {
    pub fn merge(&mut self, other: IngestCounts) {
        self.inserted += other.inserted;
        self.failed += other.failed;
        self.duplicate += other.duplicate;
    }
}

/// Persist one archive's records, one at a time, skipping anything already
/// stored under its natural key.
///
/// The existence check is the primary dedup mechanism; the store's UNIQUE
/// constraint is only a backstop, so an insert rejected by it lands in
/// `failed` like any other per-record failure and never aborts the batch.
/// Errors from the existence check itself are infrastructure failures and
/// do propagate.
pub async fn ingest<S>(
    store: &S,
    records: impl IntoIterator<Item = FilingRecord>,
) -> Result<IngestCounts, StoreError>
where
    S: FilingStore + ?Sized,
{
    let mut counts = IngestCounts::default();
    for record in records {
        if store.exists(record.natural_key()).await? {
            debug!(doc_id = %record.doc_id, year = record.year, "already stored, skipping");
            counts.duplicate += 1;
            continue;
        }
        match store.insert(&record).await {
            Ok(()) => counts.inserted += 1,
            Err(err) => {
                warn!(doc_id = %record.doc_id, year = record.year, error = %err, "insert failed");
                counts.failed += 1;
            }
        }
    }
    Ok(counts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DocumentOutcome {
    Fetched,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DocumentCounts {
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArchiveAction {
    Fetched,
    UpToDate,
    Absent,
}

#[derive(Debug, Clone, Serialize)]
pub struct YearReport {
    pub year: i64,
    pub action: ArchiveAction,
    pub counts: IngestCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub years: Vec<YearReport>,
    pub failed_years: Vec<i64>,
    pub totals: IngestCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: DocumentCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum YearError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Unpack(#[from] UnpackError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("bulk index missing at {path} after unpack")]
    MissingIndex { path: PathBuf },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl YearError {
    /// Local-storage failures abort the run; everything else is isolated to
    /// the year it happened in.
    pub fn is_fatal(&self) -> bool {
        match self {
            YearError::Io { .. } => true,
            YearError::Fetch(err) => err.is_fatal(),
            _ => false,
        }
    }
}

pub struct MirrorPipeline<S> {
    config: SyncConfig,
    artifacts: ArtifactStore,
    remote: Box<dyn RemoteSource>,
    store: S,
}

impl<S: FilingStore> MirrorPipeline<S> {
    pub fn new(config: SyncConfig, store: S) -> Result<Self> {
        let artifacts = ArtifactStore::new(config.data_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })
        .context("building http client")?;
        Ok(Self {
            config,
            artifacts,
            remote: Box::new(http),
            store,
        })
    }

    pub fn with_remote(mut self, remote: Box<dyn RemoteSource>) -> Self {
        self.remote = remote;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mirror and ingest the bulk archive for every year in `years`,
    /// sequentially. A failed year is logged and counted; the run only
    /// aborts on an unrecoverable local-storage failure.
    pub async fn sync_archives(&self, years: RangeInclusive<i64>) -> Result<ArchiveRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut year_reports = Vec::new();
        let mut failed_years = Vec::new();
        let mut totals = IngestCounts::default();

        for year in years {
            match self.sync_year(year).await {
                Ok(report) => {
                    info!(
                        year,
                        action = ?report.action,
                        inserted = report.counts.inserted,
                        duplicate = report.counts.duplicate,
                        failed = report.counts.failed,
                        "year synced"
                    );
                    totals.merge(report.counts);
                    year_reports.push(report);
                }
                Err(err) if err.is_fatal() => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("unrecoverable storage failure syncing year {year}")));
                }
                Err(err) => {
                    warn!(year, error = %err, "skipping year");
                    failed_years.push(year);
                }
            }
        }

        Ok(ArchiveRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            years: year_reports,
            failed_years,
            totals,
        })
    }

    async fn sync_year(&self, year: i64) -> Result<YearReport, YearError> {
        let url = bulk_archive_url(&self.config.base_url, year);
        let Probe::Present { size } = self.remote.probe(&url).await? else {
            info!(year, %url, "bulk archive not published");
            return Ok(YearReport {
                year,
                action: ArchiveAction::Absent,
                counts: IngestCounts::default(),
            });
        };

        let archive_rel = bulk_archive_rel(year);
        let local_size =
            self.artifacts
                .file_size(&archive_rel)
                .await
                .map_err(|source| YearError::Io {
                    path: self.artifacts.absolute(&archive_rel),
                    source,
                })?;
        let action = match fetch_decision(local_size, size) {
            FetchDecision::NeedsFetch => {
                let written = fetch_to_file(
                    self.remote.as_ref(),
                    &self.artifacts,
                    &url,
                    &archive_rel,
                    Some(size),
                )
                .await?;
                debug!(year, bytes = written, "bulk archive fetched");
                ArchiveAction::Fetched
            }
            FetchDecision::UpToDate => {
                debug!(year, "bulk archive unchanged");
                ArchiveAction::UpToDate
            }
        };

        unpack(
            &self.artifacts.absolute(&archive_rel),
            &self.artifacts.absolute(bulk_xml_dir_rel(year)),
        )?;

        let xml_path = self.artifacts.absolute(bulk_xml_rel(year));
        let xml = match tokio::fs::read_to_string(&xml_path).await {
            Ok(xml) => xml,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(YearError::MissingIndex { path: xml_path });
            }
            Err(source) => {
                return Err(YearError::Io {
                    path: xml_path,
                    source,
                });
            }
        };
        let records = extract_members(&xml, year)?;
        let counts = ingest(&self.store, records).await?;
        Ok(YearReport {
            year,
            action,
            counts,
        })
    }

    /// Retrieve the individual PDF for every persisted filing record, one
    /// record at a time.
    pub async fn fetch_documents(&self) -> Result<DocumentRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let filings = self
            .store
            .select_all()
            .await
            .context("loading persisted filings")?;

        let mut counts = DocumentCounts::default();
        for record in &filings {
            match self.resolve_and_fetch(record).await? {
                DocumentOutcome::Fetched => counts.fetched += 1,
                DocumentOutcome::Skipped => counts.skipped += 1,
                DocumentOutcome::Failed => counts.failed += 1,
            }
        }

        info!(
            fetched = counts.fetched,
            skipped = counts.skipped,
            failed = counts.failed,
            "document run complete"
        );
        Ok(DocumentRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            counts,
        })
    }

    /// Locate and retrieve one filing's PDF.
    ///
    /// The bulk index records a filing under the fiscal year it covers, but
    /// the document endpoint sometimes files the PDF under the following
    /// calendar year. Exactly one offset is tried: two probes maximum, then
    /// the record is given up on until the next run.
    pub async fn resolve_and_fetch(&self, record: &FilingRecord) -> Result<DocumentOutcome> {
        let kind = record.document_kind();
        for offset in 0..=1 {
            let year = record.year + offset;
            let url = document_url(&self.config.base_url, year, kind, &record.doc_id);
            let probe = match self.remote.probe(&url).await {
                Ok(probe) => probe,
                Err(err) => {
                    debug!(%url, error = %err, "probe failed");
                    continue;
                }
            };
            let Probe::Present { size } = probe else {
                debug!(%url, "absent");
                continue;
            };

            let rel = document_rel(year, kind, &record.doc_id);
            let local_size = self.artifacts.file_size(&rel).await.with_context(|| {
                format!("inspecting {}", self.artifacts.absolute(&rel).display())
            })?;
            match fetch_decision(local_size, size) {
                FetchDecision::UpToDate => {
                    debug!(doc_id = %record.doc_id, year, "document unchanged");
                    return Ok(DocumentOutcome::Skipped);
                }
                FetchDecision::NeedsFetch => {
                    return match fetch_to_file(
                        self.remote.as_ref(),
                        &self.artifacts,
                        &url,
                        &rel,
                        Some(size),
                    )
                    .await
                    {
                        Ok(bytes) => {
                            info!(doc_id = %record.doc_id, year, bytes, "document fetched");
                            Ok(DocumentOutcome::Fetched)
                        }
                        Err(err) if err.is_fatal() => Err(anyhow::Error::new(err)),
                        Err(err) => {
                            warn!(doc_id = %record.doc_id, year, error = %err, "document fetch failed");
                            Ok(DocumentOutcome::Failed)
                        }
                    };
                }
            }
        }

        warn!(
            doc_id = %record.doc_id,
            year = record.year,
            "document absent at recorded and following year"
        );
        Ok(DocumentOutcome::Failed)
    }

    /// Supplementary path: run the search-form discovery flow and download
    /// every listed PDF that is not already on disk.
    pub async fn discover(&self) -> Result<DiscoveryRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let documents = discover_documents(self.remote.as_ref(), &self.config.base_url)
            .await
            .context("running the search-form discovery flow")?;

        let mut downloaded = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for doc in &documents {
            let rel = search_document_rel(doc);
            let existing = self.artifacts.file_size(&rel).await.with_context(|| {
                format!("inspecting {}", self.artifacts.absolute(&rel).display())
            })?;
            if existing.is_some() {
                debug!(link = %doc.link, "already downloaded");
                skipped += 1;
                continue;
            }

            let url = join_url(&self.config.base_url, &doc.link);
            match self.remote.fetch(&url).await {
                Ok(body) => {
                    self.artifacts.write_file(&rel, &body).await.with_context(|| {
                        format!("writing {}", self.artifacts.absolute(&rel).display())
                    })?;
                    downloaded += 1;
                }
                Err(err) => {
                    warn!(%url, error = %err, "search document fetch failed");
                    failed += 1;
                }
            }
        }

        Ok(DiscoveryRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            discovered: documents.len(),
            downloaded,
            skipped,
            failed,
        })
    }
}
