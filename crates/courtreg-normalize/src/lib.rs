//! Turns raw registry CSV files of unknown encoding and delimiter into canonical case rows.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use courtreg_core::{parse_date, CaseRecord, CANONICAL_COLUMNS};
use csv::{ReaderBuilder, StringRecord};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1251};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "courtreg-normalize";

/// Used when the delimiter cannot be inferred from the file.
pub const FALLBACK_DELIMITER: u8 = b';';

/// Used when the encoding cannot be detected at all.
pub static FALLBACK_ENCODING: &Encoding = &encoding_rs::UTF_8_INIT;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];
const SNIFF_LINES: usize = 20;
const NULL_LIKE_TOKENS: [&str; 3] = ["nan", "null", "none"];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} has no header row", path.display())]
    MissingHeader { path: PathBuf },
    #[error("parsing header of {}: {source}", path.display())]
    Header {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Canonical rows extracted from one raw file.
#[derive(Debug, Clone)]
pub struct NormalizedFile {
    pub rows: Vec<CaseRecord>,
    pub encoding: &'static str,
    pub delimiter: u8,
    pub skipped_lines: usize,
}

impl NormalizedFile {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Best-effort encoding guess over the whole file. Never fails; falls back to UTF-8.
pub fn detect_encoding(path: &Path) -> &'static Encoding {
    match std::fs::read(path) {
        Ok(bytes) => detect_encoding_bytes(&bytes),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot detect encoding, assuming {}", FALLBACK_ENCODING.name());
            FALLBACK_ENCODING
        }
    }
}

/// BOM first, then strict UTF-8, then the legacy Cyrillic code page.
pub fn detect_encoding_bytes(sample: &[u8]) -> &'static Encoding {
    if let Some((encoding, _bom_len)) = Encoding::for_bom(sample) {
        return encoding;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => UTF_8,
        // A multi-byte sequence cut off by the sample boundary is still UTF-8.
        Err(err) if err.error_len().is_none() => UTF_8,
        Err(_) => WINDOWS_1251,
    }
}

/// Picks the delimiter that splits the header into the most columns while
/// staying consistent across most of the sampled lines.
pub fn sniff_delimiter(text: &str) -> Option<u8> {
    let lines = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(SNIFF_LINES)
        .collect::<Vec<_>>();
    let header = lines.first()?;

    let mut best: Option<(usize, usize, u8)> = None;
    for delimiter in CANDIDATE_DELIMITERS {
        let expected = count_unquoted(header, delimiter);
        if expected == 0 {
            continue;
        }
        let consistent = lines
            .iter()
            .filter(|line| count_unquoted(line, delimiter) == expected)
            .count();
        if consistent * 2 < lines.len() {
            continue;
        }
        let better = best.map_or(true, |(c, e, _)| (consistent, expected) > (c, e));
        if better {
            best = Some((consistent, expected, delimiter));
        }
    }
    best.map(|(_, _, delimiter)| delimiter)
}

fn count_unquoted(line: &str, delimiter: u8) -> usize {
    let mut quoted = false;
    let mut count = 0;
    for byte in line.bytes() {
        if byte == b'"' {
            quoted = !quoted;
        } else if byte == delimiter && !quoted {
            count += 1;
        }
    }
    count
}

/// `"\u{feff}Case Number"` -> `case_number`
pub fn normalize_header(name: &str) -> String {
    name.replace('\u{feff}', "")
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

/// Removes non-breaking spaces anywhere in the cell, then surrounding whitespace.
pub fn clean_cell(value: &str) -> String {
    value.replace('\u{a0}', "").trim().to_string()
}

/// [`clean_cell`] plus null-like placeholder tokens collapse to empty.
pub fn clean_key_cell(value: &str) -> String {
    let cleaned = clean_cell(value);
    if NULL_LIKE_TOKENS
        .iter()
        .any(|token| cleaned.eq_ignore_ascii_case(token))
    {
        String::new()
    } else {
        cleaned
    }
}

fn optional_cell(value: &str) -> Option<String> {
    let cleaned = clean_cell(value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Reads, decodes and normalizes one raw file.
///
/// Encoding and delimiter detection degrade to defaults and malformed lines are
/// skipped; only an unreadable file or a missing header is an error.
pub fn normalize_file(path: &Path) -> Result<NormalizedFile, NormalizeError> {
    let bytes = std::fs::read(path).map_err(|source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    // Detection sees every byte that gets decoded.
    let encoding = detect_encoding_bytes(&bytes);
    let (text, used, had_errors) = encoding.decode(&bytes);
    if had_errors {
        warn!(path = %path.display(), encoding = used.name(), "undecodable bytes replaced");
    }
    normalize_text(path, &text, used.name())
}

/// Normalizes already-decoded text. `origin` is only used for diagnostics.
pub fn normalize_text(
    origin: &Path,
    text: &str,
    encoding: &'static str,
) -> Result<NormalizedFile, NormalizeError> {
    let delimiter = match sniff_delimiter(text) {
        Some(delimiter) => {
            debug!(path = %origin.display(), delimiter = %(delimiter as char), "delimiter detected");
            delimiter
        }
        None => {
            warn!(path = %origin.display(), "delimiter detection failed, falling back to ';'");
            FALLBACK_DELIMITER
        }
    };

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|source| NormalizeError::Header {
            path: origin.to_path_buf(),
            source,
        })?
        .clone();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(NormalizeError::MissingHeader {
            path: origin.to_path_buf(),
        });
    }

    let mapping = column_mapping(&headers);
    let width = headers.len();

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    let mut skipped_lines = 0usize;

    for result in reader.records() {
        let record = match result {
            Ok(record) if record.len() <= width => record,
            Ok(_) | Err(_) => {
                skipped_lines += 1;
                continue;
            }
        };

        let Some(row) = canonical_row(&record, &mapping) else {
            continue;
        };
        if seen.insert(row.case_number.clone()) {
            rows.push(row);
        }
    }

    if skipped_lines > 0 {
        warn!(path = %origin.display(), skipped_lines, "skipped malformed lines");
    }

    Ok(NormalizedFile {
        rows,
        encoding,
        delimiter,
        skipped_lines,
    })
}

/// Source column index for every canonical column, `None` when absent.
fn column_mapping(headers: &StringRecord) -> [Option<usize>; 13] {
    let normalized = headers.iter().map(normalize_header).collect::<Vec<_>>();
    CANONICAL_COLUMNS.map(|column| normalized.iter().position(|h| h == column))
}

fn canonical_row(record: &StringRecord, mapping: &[Option<usize>; 13]) -> Option<CaseRecord> {
    let cell = |column: usize| mapping[column].and_then(|idx| record.get(idx)).unwrap_or("");

    let court_name = clean_key_cell(cell(0));
    let case_number = clean_key_cell(cell(1));
    if court_name.is_empty() || case_number.is_empty() {
        return None;
    }

    Some(CaseRecord {
        court_name,
        case_number,
        case_proc: optional_cell(cell(2)),
        registration_date: parse_date(&clean_cell(cell(3))),
        judge: optional_cell(cell(4)),
        judges: optional_cell(cell(5)),
        participants: optional_cell(cell(6)),
        stage_date: parse_date(&clean_cell(cell(7))),
        stage_name: optional_cell(cell(8)),
        cause_result: optional_cell(cell(9)),
        cause_dep: optional_cell(cell(10)),
        case_type: optional_cell(cell(11)),
        description: optional_cell(cell(12)),
    })
}
