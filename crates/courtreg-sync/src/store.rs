//! Case stores: the Postgres target and an in-memory stand-in with identical merge semantics.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use courtreg_core::{collapse_batch, CaseRecord, CANONICAL_COLUMNS};
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

/// Counts reported by a completed merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Rows sitting in the staging batch when the merge started.
    pub staged_rows: u64,
    /// Case records inserted or updated.
    pub merged_rows: u64,
}

/// One import run: an ephemeral staging batch plus the merge that consumes it.
///
/// Nothing reaches the permanent store before [`StagingRun::merge`] succeeds.
#[async_trait]
pub trait StagingRun: Send {
    /// Appends one file's canonical rows atomically. Returns the rows appended.
    async fn append(&mut self, rows: &[CaseRecord]) -> Result<u64>;

    /// Merges the staging batch into the permanent store and ends the run.
    async fn merge(self) -> Result<MergeOutcome>;

    /// Discards the staging batch without touching the permanent store.
    async fn abort(self) -> Result<()>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    type Run: StagingRun;

    async fn begin_import(&self) -> Result<Self::Run>;

    /// Records whose case number is in `case_numbers`; unknown numbers are skipped.
    async fn fetch_cases(&self, case_numbers: &[String]) -> Result<Vec<CaseRecord>>;
}

const CREATE_STAGING_SQL: &str = r#"
    CREATE TEMP TABLE tmp_cases
    (
        staged_seq        bigserial,
        court_name        text,
        case_number       text,
        case_proc         text,
        registration_date date,
        judge             text,
        judges            text,
        participants      text,
        stage_date        date,
        stage_name        text,
        cause_result      text,
        cause_dep         text,
        type              text,
        description       text
    ) ON COMMIT DROP
"#;

/// One representative per case number (latest stage, undated last, earliest staged
/// on ties), then an upsert that only fires for a strictly newer stage date.
const MERGE_SQL: &str = r#"
    INSERT INTO cases (court_name, case_number, case_proc, registration_date,
                       judge, judges, participants, stage_date, stage_name,
                       cause_result, cause_dep, type, description)
    SELECT DISTINCT ON (case_number)
           court_name, case_number, case_proc, registration_date,
           judge, judges, participants, stage_date, stage_name,
           cause_result, cause_dep, type, description
      FROM tmp_cases
     WHERE case_number IS NOT NULL AND case_number <> ''
     ORDER BY case_number, stage_date DESC NULLS LAST, staged_seq
    ON CONFLICT (case_number) DO UPDATE
       SET court_name        = COALESCE(EXCLUDED.court_name, cases.court_name),
           case_proc         = COALESCE(EXCLUDED.case_proc, cases.case_proc),
           registration_date = COALESCE(EXCLUDED.registration_date, cases.registration_date),
           judge             = COALESCE(EXCLUDED.judge, cases.judge),
           judges            = COALESCE(EXCLUDED.judges, cases.judges),
           participants      = COALESCE(EXCLUDED.participants, cases.participants),
           stage_date        = EXCLUDED.stage_date,
           stage_name        = COALESCE(EXCLUDED.stage_name, cases.stage_name),
           cause_result      = COALESCE(EXCLUDED.cause_result, cases.cause_result),
           cause_dep         = COALESCE(EXCLUDED.cause_dep, cases.cause_dep),
           type              = COALESCE(EXCLUDED.type, cases.type),
           description       = COALESCE(EXCLUDED.description, cases.description)
     WHERE EXCLUDED.stage_date IS NOT NULL
       AND (cases.stage_date IS NULL OR EXCLUDED.stage_date > cases.stage_date)
"#;

fn staging_copy_statement() -> String {
    format!(
        "COPY tmp_cases ({}) FROM STDIN WITH (FORMAT csv, DELIMITER ',', NULL '')",
        CANONICAL_COLUMNS.join(", ")
    )
}

/// Header-less comma-separated payload for the staging COPY. Absent values are
/// written as unquoted empty fields, which the COPY reads as NULL.
pub fn staging_csv(rows: &[CaseRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .delimiter(b',')
        .from_writer(Vec::new());
    for row in rows {
        writer
            .write_record(row.to_csv_row())
            .with_context(|| format!("encoding staging row for case {}", row.case_number))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing staging payload: {}", err.error()))
}

#[derive(Debug, Clone)]
pub struct PgCaseStore {
    pool: PgPool,
    statement_timeout: Option<Duration>,
}

impl PgCaseStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        statement_timeout: Option<Duration>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::from_pool(pool, statement_timeout))
    }

    pub fn from_pool(pool: PgPool, statement_timeout: Option<Duration>) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open transaction holding the `tmp_cases` staging table.
pub struct PgStagingRun {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CaseStore for PgCaseStore {
    type Run = PgStagingRun;

    async fn begin_import(&self) -> Result<PgStagingRun> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning import transaction")?;

        if let Some(timeout) = self.statement_timeout {
            let statement = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .context("setting statement timeout")?;
        }

        sqlx::query(CREATE_STAGING_SQL)
            .execute(&mut *tx)
            .await
            .context("creating staging table tmp_cases")?;

        Ok(PgStagingRun { tx })
    }

    async fn fetch_cases(&self, case_numbers: &[String]) -> Result<Vec<CaseRecord>> {
        if case_numbers.is_empty() {
            return Ok(Vec::new());
        }
        let statement = format!(
            "SELECT {} FROM cases WHERE case_number = ANY($1)",
            CANONICAL_COLUMNS.join(", ")
        );
        let rows = sqlx::query(&statement)
            .bind(case_numbers)
            .fetch_all(&self.pool)
            .await
            .context("fetching cases by number")?;

        rows.iter()
            .map(case_from_row)
            .collect::<Result<Vec<_>, _>>()
            .context("decoding case rows")
    }
}

fn case_from_row(row: &PgRow) -> Result<CaseRecord, sqlx::Error> {
    Ok(CaseRecord {
        court_name: row.try_get("court_name")?,
        case_number: row.try_get("case_number")?,
        case_proc: row.try_get("case_proc")?,
        registration_date: row.try_get("registration_date")?,
        judge: row.try_get("judge")?,
        judges: row.try_get("judges")?,
        participants: row.try_get("participants")?,
        stage_date: row.try_get("stage_date")?,
        stage_name: row.try_get("stage_name")?,
        cause_result: row.try_get("cause_result")?,
        cause_dep: row.try_get("cause_dep")?,
        case_type: row.try_get("type")?,
        description: row.try_get("description")?,
    })
}

async fn copy_into_staging(conn: &mut PgConnection, payload: Vec<u8>) -> Result<u64> {
    let mut copy = conn
        .copy_in_raw(&staging_copy_statement())
        .await
        .context("starting COPY into tmp_cases")?;
    if let Err(err) = copy.send(payload).await {
        let message = err.to_string();
        if let Err(abort_err) = copy.abort(message.clone()).await {
            debug!(error = %abort_err, "COPY abort reported an error");
        }
        return Err(anyhow!("streaming rows into tmp_cases: {message}"));
    }
    copy.finish().await.context("finishing COPY into tmp_cases")
}

#[async_trait]
impl StagingRun for PgStagingRun {
    /// Each append runs under its own savepoint, so a rejected file leaves the
    /// run transaction usable for the remaining files.
    async fn append(&mut self, rows: &[CaseRecord]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let payload = staging_csv(rows)?;

        let mut savepoint = Connection::begin(&mut *self.tx)
            .await
            .context("opening staging savepoint")?;
        match copy_into_staging(&mut savepoint, payload).await {
            Ok(copied) => {
                savepoint
                    .commit()
                    .await
                    .context("releasing staging savepoint")?;
                Ok(copied)
            }
            Err(err) => {
                if let Err(rollback_err) = savepoint.rollback().await {
                    warn!(error = %rollback_err, "rolling back staging savepoint failed");
                }
                Err(err)
            }
        }
    }

    async fn merge(mut self) -> Result<MergeOutcome> {
        let staged: i64 = sqlx::query_scalar("SELECT count(*) FROM tmp_cases")
            .fetch_one(&mut *self.tx)
            .await
            .context("counting staged rows")?;
        let merged = sqlx::query(MERGE_SQL)
            .execute(&mut *self.tx)
            .await
            .context("merging tmp_cases into cases")?
            .rows_affected();
        self.tx.commit().await.context("committing import run")?;

        Ok(MergeOutcome {
            staged_rows: u64::try_from(staged).unwrap_or_default(),
            merged_rows: merged,
        })
    }

    async fn abort(self) -> Result<()> {
        self.tx.rollback().await.context("rolling back import run")
    }
}

/// Process-local case store used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCaseStore {
    cases: Arc<Mutex<BTreeMap<String, CaseRecord>>>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds or overwrites a record directly, bypassing the merge rules.
    pub fn insert(&self, record: CaseRecord) {
        let mut cases = self.cases.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cases.insert(record.case_number.clone(), record);
    }

    pub fn get(&self, case_number: &str) -> Option<CaseRecord> {
        let cases = self.cases.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cases.get(case_number).cloned()
    }

    /// All records ordered by case number.
    pub fn snapshot(&self) -> Vec<CaseRecord> {
        let cases = self.cases.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cases.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let cases = self.cases.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MemoryStagingRun {
    staged: Vec<CaseRecord>,
    cases: Arc<Mutex<BTreeMap<String, CaseRecord>>>,
}

impl MemoryStagingRun {
    pub fn staged_rows(&self) -> usize {
        self.staged.len()
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    type Run = MemoryStagingRun;

    async fn begin_import(&self) -> Result<MemoryStagingRun> {
        Ok(MemoryStagingRun {
            staged: Vec::new(),
            cases: Arc::clone(&self.cases),
        })
    }

    async fn fetch_cases(&self, case_numbers: &[String]) -> Result<Vec<CaseRecord>> {
        let cases = self
            .cases
            .lock()
            .map_err(|_| anyhow!("case store lock poisoned"))?;
        Ok(case_numbers
            .iter()
            .filter_map(|number| cases.get(number).cloned())
            .collect())
    }
}

#[async_trait]
impl StagingRun for MemoryStagingRun {
    async fn append(&mut self, rows: &[CaseRecord]) -> Result<u64> {
        self.staged.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn merge(self) -> Result<MergeOutcome> {
        let staged_rows = self.staged.len() as u64;
        let mut cases = self
            .cases
            .lock()
            .map_err(|_| anyhow!("case store lock poisoned"))?;

        let mut merged_rows = 0u64;
        for incoming in collapse_batch(self.staged) {
            match cases.get_mut(&incoming.case_number) {
                Some(existing) => {
                    if existing.absorb(incoming) {
                        merged_rows += 1;
                    }
                }
                None => {
                    cases.insert(incoming.case_number.clone(), incoming);
                    merged_rows += 1;
                }
            }
        }

        Ok(MergeOutcome {
            staged_rows,
            merged_rows,
        })
    }

    async fn abort(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    fn case(number: &str, stage: Option<NaiveDate>, stage_name: &str) -> CaseRecord {
        CaseRecord {
            stage_date: stage,
            stage_name: Some(stage_name.to_string()),
            ..CaseRecord::new("Court X", number)
        }
    }

    async fn merge_batch(store: &MemoryCaseStore, rows: Vec<CaseRecord>) -> MergeOutcome {
        let mut run = store.begin_import().await.unwrap();
        run.append(&rows).await.unwrap();
        run.merge().await.unwrap()
    }

    #[test]
    fn staging_payload_is_headerless_with_empty_nulls() {
        let record = CaseRecord {
            registration_date: ymd(2020, 1, 1),
            description: Some("says \"hi\", twice".into()),
            ..CaseRecord::new("Court A", "CASE-1")
        };
        let payload = String::from_utf8(staging_csv(&[record]).unwrap()).unwrap();
        assert_eq!(
            payload,
            "Court A,CASE-1,,2020-01-01,,,,,,,,,\"says \"\"hi\"\", twice\"\n"
        );
    }

    #[test]
    fn copy_statement_lists_canonical_columns() {
        let statement = staging_copy_statement();
        assert!(statement.starts_with("COPY tmp_cases (court_name, case_number, case_proc,"));
        assert!(statement.ends_with("NULL '')"));
    }

    #[tokio::test]
    async fn latest_stage_wins_within_batch() {
        let store = MemoryCaseStore::new();
        let outcome = merge_batch(
            &store,
            vec![
                case("DUP-1", ymd(2020, 2, 1), "Old Stage"),
                case("DUP-1", ymd(2020, 2, 5), "New Stage"),
            ],
        )
        .await;

        assert_eq!(outcome, MergeOutcome { staged_rows: 2, merged_rows: 1 });
        let stored = store.get("DUP-1").unwrap();
        assert_eq!(stored.stage_name.as_deref(), Some("New Stage"));
        assert_eq!(stored.stage_date, ymd(2020, 2, 5));
    }

    #[tokio::test]
    async fn remerging_same_batch_is_idempotent() {
        let store = MemoryCaseStore::new();
        let batch = vec![
            case("A-1", ymd(2021, 1, 1), "Filed"),
            case("B-2", None, "Registered"),
        ];
        merge_batch(&store, batch.clone()).await;
        let once = store.snapshot();

        let second = merge_batch(&store, batch).await;
        assert_eq!(second.merged_rows, 0);
        assert_eq!(store.snapshot(), once);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn stage_date_only_moves_forward() {
        let store = MemoryCaseStore::new();
        merge_batch(&store, vec![case("C-1", ymd(2022, 6, 1), "Appeal")]).await;
        merge_batch(&store, vec![case("C-1", ymd(2021, 1, 1), "Filed")]).await;
        merge_batch(&store, vec![case("C-1", None, "Undated")]).await;

        let stored = store.get("C-1").unwrap();
        assert_eq!(stored.stage_date, ymd(2022, 6, 1));
        assert_eq!(stored.stage_name.as_deref(), Some("Appeal"));
    }

    #[tokio::test]
    async fn accepted_update_coalesces_missing_fields() {
        let store = MemoryCaseStore::new();
        store.insert(CaseRecord {
            judge: Some("Old Judge".into()),
            participants: Some("A v. B".into()),
            ..case("C-2", ymd(2020, 1, 1), "Filed")
        });
        merge_batch(
            &store,
            vec![CaseRecord {
                judge: Some("New Judge".into()),
                ..case("C-2", ymd(2020, 5, 1), "Hearing")
            }],
        )
        .await;

        let stored = store.get("C-2").unwrap();
        assert_eq!(stored.judge.as_deref(), Some("New Judge"));
        assert_eq!(stored.participants.as_deref(), Some("A v. B"));
        assert_eq!(stored.stage_name.as_deref(), Some("Hearing"));
    }

    #[tokio::test]
    async fn aborted_run_leaves_store_untouched() {
        let store = MemoryCaseStore::new();
        let mut run = store.begin_import().await.unwrap();
        run.append(&[case("X-1", ymd(2020, 1, 1), "Filed")]).await.unwrap();
        assert_eq!(run.staged_rows(), 1);
        run.abort().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn poisoned_lock_still_reports_contents() {
        let store = MemoryCaseStore::new();
        store.insert(case("P-1", None, "Filed"));

        let shared = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.cases.lock().unwrap();
            panic!("poison the case map");
        })
        .join();
        assert!(store.cases.is_poisoned());

        assert_eq!(store.len(), 1);
        assert!(!store.is_empty());
        assert!(store.get("P-1").is_some());
    }

    #[tokio::test]
    async fn fetch_skips_unknown_numbers() {
        let store = MemoryCaseStore::new();
        store.insert(case("X-1", None, "a"));
        store.insert(case("Y-2", None, "b"));
        let found = store
            .fetch_cases(&["X-1".to_string(), "Z-9".to_string(), "Y-2".to_string()])
            .await
            .unwrap();
        let numbers = found.iter().map(|c| c.case_number.as_str()).collect::<Vec<_>>();
        assert_eq!(numbers, vec!["X-1", "Y-2"]);
    }
}
