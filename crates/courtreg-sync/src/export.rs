//! Re-extracts stored cases by case number into a fresh CSV.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use courtreg_core::{CaseRecord, CANONICAL_COLUMNS};
use tokio::fs;
use tracing::info;

use crate::store::CaseStore;

/// First-cell values recognized as a header row in an export request file.
pub const CASE_NUMBER_HEADER_ALIASES: [&str; 4] = ["case_number", "number", "case", "case_no"];

/// Case numbers from the first column of `bytes`, trimmed, blank cells skipped,
/// a leading header alias dropped and duplicates removed in first-seen order.
pub fn read_case_numbers(bytes: &[u8]) -> Result<Vec<String>> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut numbers = Vec::new();
    for record in reader.records() {
        let record = record.context("reading case number list")?;
        if let Some(value) = record.get(0).map(str::trim).filter(|v| !v.is_empty()) {
            numbers.push(value.to_string());
        }
    }

    let is_header = numbers.first().is_some_and(|first| {
        CASE_NUMBER_HEADER_ALIASES
            .iter()
            .any(|alias| first.eq_ignore_ascii_case(alias))
    });
    if is_header {
        numbers.remove(0);
    }

    let mut seen = HashSet::new();
    numbers.retain(|number| seen.insert(number.clone()));
    Ok(numbers)
}

/// Writes `records` with a header row in canonical column order.
pub async fn write_cases_csv(path: &Path, records: &[CaseRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CANONICAL_COLUMNS)
        .context("writing export header")?;
    for record in records {
        writer
            .write_record(record.to_csv_row())
            .with_context(|| format!("writing case {}", record.case_number))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow!("flushing export: {}", err.error()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Exports the cases listed in `input` to `output`. Returns the rows written.
///
/// Unknown case numbers are left out silently.
pub async fn export_cases<S: CaseStore>(store: &S, input: &Path, output: &Path) -> Result<usize> {
    let bytes = fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let numbers = read_case_numbers(&bytes)
        .with_context(|| format!("parsing {}", input.display()))?;
    let records = store.fetch_cases(&numbers).await?;
    write_cases_csv(output, &records).await?;

    info!(
        requested = numbers.len(),
        exported = records.len(),
        output = %output.display(),
        "cases exported"
    );
    Ok(records.len())
}
