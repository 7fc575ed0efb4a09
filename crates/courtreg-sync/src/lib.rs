//! Import pipeline for court-case registry exports.
//!
//! Files are normalized in parallel, appended one at a time into a per-run
//! staging batch, then merged once into the permanent `cases` table.

mod export;
mod store;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use courtreg_normalize::normalize_file;
use courtreg_storage::{
    unpack_zip, DownloadReport, HttpClientConfig, RegistryClient, ResourceDownloader,
    DEFAULT_REGISTRY_URL,
};
use futures::future::join_all;
use serde::Serialize;
use sqlx::PgPool;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use export::{export_cases, read_case_numbers, write_cases_csv, CASE_NUMBER_HEADER_ALIASES};
pub use store::{
    staging_csv, CaseStore, MemoryCaseStore, MemoryStagingRun, MergeOutcome, PgCaseStore,
    PgStagingRun, StagingRun,
};

pub const CRATE_NAME: &str = "courtreg-sync";

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const REPORT_FILE_NAME: &str = "import_summary.json";

/// What to do with the staged batch when some files failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Merge whatever was staged successfully.
    #[default]
    MergePartial,
    /// Roll the whole run back if any file failed.
    AbortOnFileFailure,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "merge-partial" | "merge_partial" | "partial" => Ok(Self::MergePartial),
            "abort" | "abort-on-file-failure" | "abort_on_file_failure" => {
                Ok(Self::AbortOnFileFailure)
            }
            other => bail!("unknown failure policy {other:?} (expected merge-partial or abort)"),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MergePartial => f.write_str("merge-partial"),
            Self::AbortOnFileFailure => f.write_str("abort"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Server-side limit for every statement of a run, including each COPY.
    pub statement_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub reports_dir: Option<PathBuf>,
}

impl ImportConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            statement_timeout: None,
            failure_policy: FailurePolicy::default(),
            reports_dir: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, which maps variable names to values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let database_url = var("DATABASE_URL")
            .or_else(|| var("DATABASE_URL_SYNC"))
            .unwrap_or_else(|| {
                format!(
                    "postgres://{}:{}@{}:{}/{}",
                    var("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string()),
                    var("POSTGRES_PASSWORD").unwrap_or_default(),
                    var("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
                    var("POSTGRES_DB_PORT").unwrap_or_else(|| "5432".to_string()),
                    var("POSTGRES_DB").unwrap_or_else(|| "postgres".to_string()),
                )
            });

        let max_connections = match var("COURTREG_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("COURTREG_MAX_CONNECTIONS={raw:?} is not a number"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        let statement_timeout = match var("COURTREG_STATEMENT_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().with_context(|| {
                    format!("COURTREG_STATEMENT_TIMEOUT_SECS={raw:?} is not a number")
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };
        let failure_policy = match var("COURTREG_FAILURE_POLICY") {
            Some(raw) => raw.parse()?,
            None => FailurePolicy::default(),
        };

        Ok(Self {
            database_url: sqlx_database_url(&database_url),
            max_connections,
            statement_timeout,
            failure_policy,
            reports_dir: var("COURTREG_REPORTS_DIR").map(PathBuf::from),
        })
    }
}

/// Drops a driver suffix such as `+asyncpg` from the url scheme.
fn sqlx_database_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match scheme.split_once('+') {
            Some((base, _driver)) => format!("{base}://{rest}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

/// Settings for a full registry sync: fetch, download, unpack, import.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub import: ImportConfig,
    pub dataset_id: String,
    pub data_dir: PathBuf,
    pub registry_base_url: String,
    pub download_workers: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let import = ImportConfig::from_lookup(&lookup)?;
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let dataset_id = var("DATASET_ID").ok_or_else(|| anyhow!("DATASET_ID is not set"))?;

        Ok(Self {
            import,
            dataset_id: dataset_id.trim().to_string(),
            data_dir: var("COURTREG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            registry_base_url: var("COURTREG_REGISTRY_URL")
                .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
            download_workers: var("COURTREG_DOWNLOAD_WORKERS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8),
            user_agent: var("COURTREG_USER_AGENT")
                .unwrap_or_else(|| format!("courtreg/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: var("COURTREG_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(600),
        })
    }

    /// Directory the import stage reads: plain CSV downloads and unpacked archives.
    pub fn unpacked_dir(&self) -> PathBuf {
        self.data_dir.join("unpacked")
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.download_workers.max(1),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Loaded { rows: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: FileStatus,
}

impl FileOutcome {
    pub fn rows(&self) -> Option<u64> {
        match self.status {
            FileStatus::Loaded { rows } => Some(rows),
            FileStatus::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, FileStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeStatus {
    Merged(MergeOutcome),
    /// The run was rolled back because files failed.
    Aborted { failed_files: usize },
    /// Nothing to import.
    NoInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_dir: PathBuf,
    pub failure_policy: FailurePolicy,
    pub files: Vec<FileOutcome>,
    pub merge: MergeStatus,
}

impl ImportSummary {
    /// False only when staged data was thrown away.
    pub fn merge_completed(&self) -> bool {
        !matches!(self.merge, MergeStatus::Aborted { .. })
    }

    pub fn staged_rows(&self) -> u64 {
        self.files.iter().filter_map(FileOutcome::rows).sum()
    }

    pub fn failed_files(&self) -> usize {
        self.files.iter().filter(|f| f.is_failed()).count()
    }
}

/// CSV files directly inside `dir`, sorted by path. Subdirectories are not visited.
pub async fn discover_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading input directory {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv && entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub struct ImportPipeline<S: CaseStore> {
    store: S,
    failure_policy: FailurePolicy,
    reports_dir: Option<PathBuf>,
}

impl<S: CaseStore> ImportPipeline<S> {
    pub fn new(store: S, config: &ImportConfig) -> Self {
        Self {
            store,
            failure_policy: config.failure_policy,
            reports_dir: config.reports_dir.clone(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Imports every CSV file in `input_dir` as one run.
    ///
    /// Per-file failures end up in the summary. Errors are returned only when
    /// the run itself cannot proceed (store unavailable, merge failed), in which
    /// case nothing was written to the permanent store.
    pub async fn run(&self, input_dir: &Path) -> Result<ImportSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import_run", %run_id, input = %input_dir.display());
        self.run_inner(run_id, input_dir).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, input_dir: &Path) -> Result<ImportSummary> {
        let started_at = Utc::now();
        let files = discover_csv_files(input_dir).await?;

        let (files, merge) = if files.is_empty() {
            info!("no CSV files to import");
            (Vec::new(), MergeStatus::NoInput)
        } else {
            info!(files = files.len(), policy = %self.failure_policy, "import started");
            self.stage_and_merge(&files).await?
        };

        let summary = ImportSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_dir: input_dir.to_path_buf(),
            failure_policy: self.failure_policy,
            files,
            merge,
        };

        if let Some(dir) = &self.reports_dir {
            match write_run_report(dir, &summary).await {
                Ok(path) => info!(report = %path.display(), "run report written"),
                Err(err) => warn!(error = %format!("{err:#}"), "writing run report failed"),
            }
        }
        Ok(summary)
    }

    async fn stage_and_merge(&self, files: &[PathBuf]) -> Result<(Vec<FileOutcome>, MergeStatus)> {
        let run = self
            .store
            .begin_import()
            .await
            .context("starting import run")?;
        let gate = Mutex::new(run);

        let outcomes = join_all(files.iter().map(|path| stage_file(&gate, path))).await;
        let run = gate.into_inner();

        let failed_files = outcomes.iter().filter(|o| o.is_failed()).count();
        if failed_files > 0 && self.failure_policy == FailurePolicy::AbortOnFileFailure {
            warn!(failed_files, "aborting run, staged rows discarded");
            run.abort().await.context("aborting import run")?;
            return Ok((outcomes, MergeStatus::Aborted { failed_files }));
        }

        let merged = run.merge().await.context("merging staged rows")?;
        info!(
            staged_rows = merged.staged_rows,
            merged_rows = merged.merged_rows,
            failed_files,
            "merge completed"
        );
        Ok((outcomes, MergeStatus::Merged(merged)))
    }
}

async fn stage_file<R: StagingRun>(gate: &Mutex<R>, path: &Path) -> FileOutcome {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let status = match normalize_and_append(gate, path).await {
        Ok(rows) => {
            info!(file = %name, rows, "file staged");
            FileStatus::Loaded { rows }
        }
        Err(err) => {
            let error = format!("{err:#}");
            warn!(file = %name, %error, "file skipped");
            FileStatus::Failed { error }
        }
    };

    FileOutcome {
        name,
        path: path.to_path_buf(),
        status,
    }
}

async fn normalize_and_append<R: StagingRun>(gate: &Mutex<R>, path: &Path) -> Result<u64> {
    let owned = path.to_path_buf();
    let normalized = tokio::task::spawn_blocking(move || normalize_file(&owned))
        .await
        .context("normalization task failed")??;

    // Only the append holds the gate.
    let mut run = gate.lock().await;
    run.append(&normalized.rows)
        .await
        .with_context(|| format!("staging {}", path.display()))?;
    Ok(normalized.row_count() as u64)
}

/// Writes `{dir}/{run_id}/import_summary.json`.
pub async fn write_run_report(dir: &Path, summary: &ImportSummary) -> Result<PathBuf> {
    let run_dir = dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let bytes = serde_json::to_vec_pretty(summary).context("serializing import summary")?;
    let path = run_dir.join(REPORT_FILE_NAME);
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running database migrations")
}

#[derive(Debug)]
pub struct ArchiveSummary {
    pub archive: String,
    pub csv_files: usize,
}

#[derive(Debug)]
pub struct SyncSummary {
    pub dataset_id: String,
    pub dataset_title: Option<String>,
    pub downloads: Vec<DownloadReport>,
    pub archives: Vec<ArchiveSummary>,
    pub import: ImportSummary,
}

/// Fetches the dataset's resources, unpacks archives and imports the result.
pub async fn run_sync(config: &SyncConfig) -> Result<SyncSummary> {
    let http = config.http_config();
    let registry = RegistryClient::new(config.registry_base_url.clone(), &http)?;
    let metadata = registry
        .fetch_dataset(&config.dataset_id)
        .await
        .with_context(|| format!("fetching metadata for dataset {}", config.dataset_id))?;
    let resources = metadata.supported_resources();
    info!(dataset = %config.dataset_id, resources = resources.len(), "dataset metadata fetched");

    let unpacked_dir = config.unpacked_dir();
    fs::create_dir_all(&unpacked_dir)
        .await
        .with_context(|| format!("creating {}", unpacked_dir.display()))?;

    let downloader = ResourceDownloader::new(http)?;
    let downloads = downloader
        .download_all(&resources, &config.data_dir, &unpacked_dir)
        .await;

    let mut archives = Vec::new();
    for report in &downloads {
        let Ok(outcome) = &report.result else { continue };
        if !report.is_zip {
            continue;
        }
        let archive = outcome.path.clone();
        let out_dir = unpacked_dir.clone();
        let csv_files = match tokio::task::spawn_blocking(move || unpack_zip(&archive, &out_dir))
            .await
            .context("unpack task failed")
            .and_then(|result| result)
        {
            Ok(files) => files.len(),
            Err(err) => {
                warn!(archive = %report.name, error = %format!("{err:#}"), "unpacking failed");
                0
            }
        };
        archives.push(ArchiveSummary {
            archive: report.name.clone(),
            csv_files,
        });
    }

    let store = PgCaseStore::connect(
        &config.import.database_url,
        config.import.max_connections,
        config.import.statement_timeout,
    )
    .await?;
    let import = ImportPipeline::new(store, &config.import)
        .run(&unpacked_dir)
        .await?;

    Ok(SyncSummary {
        dataset_id: metadata.id.clone().unwrap_or_else(|| config.dataset_id.clone()),
        dataset_title: metadata.title.clone(),
        downloads,
        archives,
        import,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use courtreg_core::CaseRecord;
    use tempfile::tempdir;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    const HEADER: &str = "court_name;case_number;stage_date;stage_name\n";

    #[test]
    fn failure_policy_parses_known_names() {
        assert_eq!("abort".parse::<FailurePolicy>().unwrap(), FailurePolicy::AbortOnFileFailure);
        assert_eq!(
            " Merge-Partial ".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::MergePartial
        );
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn import_config_prefers_explicit_urls() {
        let config = ImportConfig::from_lookup(lookup(&[
            ("DATABASE_URL_SYNC", "postgresql+asyncpg://u:p@db:5433/courts"),
            ("COURTREG_STATEMENT_TIMEOUT_SECS", "30"),
            ("COURTREG_FAILURE_POLICY", "abort"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "postgresql://u:p@db:5433/courts");
        assert_eq!(config.statement_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.failure_policy, FailurePolicy::AbortOnFileFailure);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.reports_dir.is_none());
    }

    #[test]
    fn import_config_assembles_url_from_parts() {
        let config = ImportConfig::from_lookup(lookup(&[
            ("POSTGRES_USER", "court"),
            ("POSTGRES_PASSWORD", "secret"),
            ("POSTGRES_HOST", "pg"),
            ("POSTGRES_DB_PORT", "6543"),
            ("POSTGRES_DB", "registry"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "postgres://court:secret@pg:6543/registry");
    }

    #[test]
    fn import_config_rejects_bad_numbers() {
        let err = ImportConfig::from_lookup(lookup(&[("COURTREG_MAX_CONNECTIONS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("COURTREG_MAX_CONNECTIONS"));
    }

    #[test]
    fn sync_config_requires_dataset() {
        assert!(SyncConfig::from_lookup(lookup(&[])).is_err());
        let config = SyncConfig::from_lookup(lookup(&[("DATASET_ID", "court-cases")])).unwrap();
        assert_eq!(config.unpacked_dir(), PathBuf::from(DEFAULT_DATA_DIR).join("unpacked"));
        assert_eq!(config.registry_base_url, DEFAULT_REGISTRY_URL);
        assert_eq!(config.http_config().concurrency, 8);
    }

    #[tokio::test]
    async fn discovery_is_flat_and_sorted() {
        let dir = tempdir().unwrap();
        write(dir.path(), "b.csv", HEADER);
        write(dir.path(), "A.CSV", HEADER);
        write(dir.path(), "notes.txt", "x");
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write(&dir.path().join("nested"), "c.csv", HEADER);

        let files = discover_csv_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["A.CSV", "b.csv"]);
    }

    #[tokio::test]
    async fn duplicate_case_across_files_keeps_latest_stage() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.csv", &format!("{HEADER}Court A;DUP-1;01.02.2020;Old Stage\n"));
        write(dir.path(), "b.csv", &format!("{HEADER}Court A;DUP-1;05.02.2020;New Stage\n"));

        let store = MemoryCaseStore::new();
        let pipeline = ImportPipeline::new(store.clone(), &ImportConfig::new("unused"));
        let summary = pipeline.run(dir.path()).await.unwrap();

        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.staged_rows(), 2);
        assert!(summary.merge_completed());
        let stored = store.get("DUP-1").unwrap();
        assert_eq!(stored.stage_name.as_deref(), Some("New Stage"));
        assert_eq!(stored.stage_date, NaiveDate::from_ymd_opt(2020, 2, 5));
    }

    #[tokio::test]
    async fn rerunning_same_input_is_idempotent() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "cases.csv",
            &format!("{HEADER}Court A;1;01.01.2021;Filed\nCourt B;2;;Registered\n"),
        );
        let store = MemoryCaseStore::new();
        let pipeline = ImportPipeline::new(store.clone(), &ImportConfig::new("unused"));

        pipeline.run(dir.path()).await.unwrap();
        let first = store.snapshot();
        let second = pipeline.run(dir.path()).await.unwrap();

        assert_eq!(store.snapshot(), first);
        assert_eq!(
            second.merge,
            MergeStatus::Merged(MergeOutcome { staged_rows: 2, merged_rows: 0 })
        );
    }

    #[tokio::test]
    async fn failed_file_is_isolated_under_merge_partial() {
        let dir = tempdir().unwrap();
        write(dir.path(), "empty.csv", "");
        write(dir.path(), "good.csv", &format!("{HEADER}Court A;OK-1;01.01.2021;Filed\n"));

        let store = MemoryCaseStore::new();
        let summary = ImportPipeline::new(store.clone(), &ImportConfig::new("unused"))
            .run(dir.path())
            .await
            .unwrap();

        assert_eq!(summary.failed_files(), 1);
        let failed = summary.files.iter().find(|f| f.is_failed()).unwrap();
        assert_eq!(failed.name, "empty.csv");
        assert!(summary.merge_completed());
        assert!(store.get("OK-1").is_some());
    }

    #[tokio::test]
    async fn failed_file_discards_run_under_abort_policy() {
        let dir = tempdir().unwrap();
        write(dir.path(), "empty.csv", "");
        write(dir.path(), "good.csv", &format!("{HEADER}Court A;OK-1;01.01.2021;Filed\n"));

        let store = MemoryCaseStore::new();
        let summary = ImportPipeline::new(store.clone(), &ImportConfig::new("unused"))
            .with_failure_policy(FailurePolicy::AbortOnFileFailure)
            .run(dir.path())
            .await
            .unwrap();

        assert_eq!(summary.merge, MergeStatus::Aborted { failed_files: 1 });
        assert!(!summary.merge_completed());
        assert_eq!(summary.files.iter().filter_map(FileOutcome::rows).sum::<u64>(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_directory_is_not_an_error() {
        let dir = tempdir().unwrap();
        let summary = ImportPipeline::new(MemoryCaseStore::new(), &ImportConfig::new("unused"))
            .run(dir.path())
            .await
            .unwrap();
        assert_eq!(summary.merge, MergeStatus::NoInput);
        assert!(summary.merge_completed());
    }

    #[tokio::test]
    async fn missing_directory_fails_the_run() {
        let dir = tempdir().unwrap();
        let result = ImportPipeline::new(MemoryCaseStore::new(), &ImportConfig::new("unused"))
            .run(&dir.path().join("absent"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_report_is_written_per_run() {
        let input = tempdir().unwrap();
        let reports = tempdir().unwrap();
        write(input.path(), "a.csv", &format!("{HEADER}Court A;R-1;01.01.2021;Filed\n"));

        let summary = ImportPipeline::new(MemoryCaseStore::new(), &ImportConfig::new("unused"))
            .with_reports_dir(reports.path())
            .run(input.path())
            .await
            .unwrap();

        let path = reports
            .path()
            .join(summary.run_id.to_string())
            .join(REPORT_FILE_NAME);
        let report: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(report["files"][0]["name"], "a.csv");
        assert_eq!(report["files"][0]["status"], "loaded");
        assert_eq!(report["files"][0]["rows"], 1);
        assert_eq!(report["merge"]["status"], "merged");
        assert_eq!(report["merge"]["merged_rows"], 1);
        assert_eq!(report["failure_policy"], "merge-partial");
    }

    /// Wraps the memory store and records how many appends overlap.
    #[derive(Clone, Default)]
    struct ProbeStore {
        inner: MemoryCaseStore,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        appends: Arc<AtomicUsize>,
    }

    struct ProbeRun {
        inner: MemoryStagingRun,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        appends: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CaseStore for ProbeStore {
        type Run = ProbeRun;

        async fn begin_import(&self) -> Result<ProbeRun> {
            Ok(ProbeRun {
                inner: self.inner.begin_import().await?,
                active: Arc::clone(&self.active),
                peak: Arc::clone(&self.peak),
                appends: Arc::clone(&self.appends),
            })
        }

        async fn fetch_cases(&self, case_numbers: &[String]) -> Result<Vec<CaseRecord>> {
            self.inner.fetch_cases(case_numbers).await
        }
    }

    #[async_trait]
    impl StagingRun for ProbeRun {
        async fn append(&mut self, rows: &[CaseRecord]) -> Result<u64> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let appended = self.inner.append(rows).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.appends.fetch_add(1, Ordering::SeqCst);
            appended
        }

        async fn merge(self) -> Result<MergeOutcome> {
            self.inner.merge().await
        }

        async fn abort(self) -> Result<()> {
            self.inner.abort().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn appends_never_overlap() {
        let dir = tempdir().unwrap();
        for idx in 0..12 {
            let mut content = HEADER.to_string();
            for row in 0..50 {
                content.push_str(&format!("Court {idx};C-{idx}-{row};01.01.2021;Filed\n"));
            }
            write(dir.path(), &format!("part-{idx:02}.csv"), &content);
        }

        let store = ProbeStore::default();
        let summary = ImportPipeline::new(store.clone(), &ImportConfig::new("unused"))
            .run(dir.path())
            .await
            .unwrap();

        assert_eq!(summary.failed_files(), 0);
        assert_eq!(store.appends.load(Ordering::SeqCst), 12);
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.len(), 600);
    }
}
