//! Canonical case-record model, date normalization, and merge rules for courtreg.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "courtreg-core";

/// Fixed target schema. Every canonical row, staging relation and export uses this order.
pub const CANONICAL_COLUMNS: [&str; 13] = [
    "court_name",
    "case_number",
    "case_proc",
    "registration_date",
    "judge",
    "judges",
    "participants",
    "stage_date",
    "stage_name",
    "cause_result",
    "cause_dep",
    "type",
    "description",
];

/// Textual date layout used by the registry exports (`31.12.2020`).
pub const SOURCE_DATE_FORMAT: &str = "%d.%m.%Y";

/// Layout used when a date leaves the process (staging CSV, exports).
pub const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// Parses a `dd.mm.yyyy` value. Anything else, including blank input and
/// impossible calendar dates, is `None`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if !has_source_date_shape(value) {
        return None;
    }
    NaiveDate::parse_from_str(value, SOURCE_DATE_FORMAT).ok()
}

fn has_source_date_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(idx, b)| match idx {
            2 | 5 => *b == b'.',
            _ => b.is_ascii_digit(),
        })
}

pub fn format_date(value: Option<NaiveDate>) -> String {
    value
        .map(|d| d.format(ISO_DATE_FORMAT).to_string())
        .unwrap_or_default()
}

/// One court case, keyed by `case_number`.
///
/// `court_name` and `case_number` are always non-empty once a row has passed
/// normalization; every other attribute may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CaseRecord {
    pub court_name: String,
    pub case_number: String,
    pub case_proc: Option<String>,
    pub registration_date: Option<NaiveDate>,
    pub judge: Option<String>,
    pub judges: Option<String>,
    pub participants: Option<String>,
    pub stage_date: Option<NaiveDate>,
    pub stage_name: Option<String>,
    pub cause_result: Option<String>,
    pub cause_dep: Option<String>,
    #[serde(rename = "type")]
    pub case_type: Option<String>,
    pub description: Option<String>,
}

impl CaseRecord {
    pub fn new(court_name: impl Into<String>, case_number: impl Into<String>) -> Self {
        Self {
            court_name: court_name.into(),
            case_number: case_number.into(),
            ..Default::default()
        }
    }

    /// Cells in [`CANONICAL_COLUMNS`] order. Absent values become empty strings,
    /// dates are rendered as ISO dates.
    pub fn to_csv_row(&self) -> [String; 13] {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        [
            self.court_name.clone(),
            self.case_number.clone(),
            text(&self.case_proc),
            format_date(self.registration_date),
            text(&self.judge),
            text(&self.judges),
            text(&self.participants),
            format_date(self.stage_date),
            text(&self.stage_name),
            text(&self.cause_result),
            text(&self.cause_dep),
            text(&self.case_type),
            text(&self.description),
        ]
    }

    /// True when `incoming` carries a strictly newer stage than `self`.
    pub fn is_superseded_by(&self, incoming: &CaseRecord) -> bool {
        match (incoming.stage_date, self.stage_date) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(new), Some(old)) => new > old,
        }
    }

    /// Applies `incoming` on top of the stored record.
    ///
    /// Nothing changes unless `incoming` has a strictly newer stage date. When it
    /// does, the stage date is replaced and every other field takes the incoming
    /// value if present, keeping the stored one otherwise. Returns whether the
    /// record changed.
    pub fn absorb(&mut self, incoming: CaseRecord) -> bool {
        if !self.is_superseded_by(&incoming) {
            return false;
        }

        if !incoming.court_name.is_empty() {
            self.court_name = incoming.court_name;
        }
        coalesce(&mut self.case_proc, incoming.case_proc);
        coalesce(&mut self.registration_date, incoming.registration_date);
        coalesce(&mut self.judge, incoming.judge);
        coalesce(&mut self.judges, incoming.judges);
        coalesce(&mut self.participants, incoming.participants);
        self.stage_date = incoming.stage_date;
        coalesce(&mut self.stage_name, incoming.stage_name);
        coalesce(&mut self.cause_result, incoming.cause_result);
        coalesce(&mut self.cause_dep, incoming.cause_dep);
        coalesce(&mut self.case_type, incoming.case_type);
        coalesce(&mut self.description, incoming.description);
        true
    }
}

fn coalesce<T>(current: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

/// Reduces a staging batch to one representative per case number.
///
/// Rows with an empty case number are dropped. Among rows sharing a case number
/// the latest stage date wins, absent stage dates rank last, and on a tie the
/// row that came first in the batch is kept. Output is ordered by case number.
pub fn collapse_batch(rows: impl IntoIterator<Item = CaseRecord>) -> Vec<CaseRecord> {
    let mut picked: BTreeMap<String, CaseRecord> = BTreeMap::new();
    for row in rows {
        if row.case_number.is_empty() {
            continue;
        }
        match picked.get_mut(&row.case_number) {
            Some(current) => {
                if current.is_superseded_by(&row) {
                    *current = row;
                }
            }
            None => {
                picked.insert(row.case_number.clone(), row);
            }
        }
    }
    picked.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn staged(case_number: &str, stage: Option<NaiveDate>, stage_name: &str) -> CaseRecord {
        CaseRecord {
            stage_date: stage,
            stage_name: Some(stage_name.to_string()),
            ..CaseRecord::new("Court X", case_number)
        }
    }

    #[test]
    fn parses_dotted_dates_only() {
        assert_eq!(parse_date("01.02.2020"), Some(ymd(2020, 2, 1)));
        assert_eq!(parse_date("  05.02.2020 "), Some(ymd(2020, 2, 5)));
        assert_eq!(parse_date("31.04.2020"), None);
        assert_eq!(parse_date("32.01.2020"), None);
        assert_eq!(parse_date("2020-02-01"), None);
        assert_eq!(parse_date("01/02/2020"), None);
        assert_eq!(parse_date("1.2.2020"), None);
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("   "), None);
    }

    #[test]
    fn csv_row_follows_canonical_order() {
        let record = CaseRecord {
            registration_date: Some(ymd(2020, 1, 1)),
            case_type: Some("civil".into()),
            ..CaseRecord::new("Court A", "CASE-1")
        };
        let row = record.to_csv_row();
        assert_eq!(row.len(), CANONICAL_COLUMNS.len());
        assert_eq!(row[0], "Court A");
        assert_eq!(row[1], "CASE-1");
        assert_eq!(row[3], "2020-01-01");
        assert_eq!(row[7], "");
        assert_eq!(row[11], "civil");
    }

    #[test]
    fn collapse_keeps_latest_stage_per_case() {
        let rows = vec![
            staged("DUP-1", Some(ymd(2020, 2, 1)), "Old Stage"),
            staged("DUP-1", Some(ymd(2020, 2, 5)), "New Stage"),
            staged("DUP-1", None, "Undated"),
            staged("", Some(ymd(2021, 1, 1)), "Orphan"),
        ];
        let collapsed = collapse_batch(rows);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].stage_name.as_deref(), Some("New Stage"));
        assert_eq!(collapsed[0].stage_date, Some(ymd(2020, 2, 5)));
    }

    #[test]
    fn collapse_prefers_first_row_on_equal_stage() {
        let rows = vec![
            staged("A", Some(ymd(2020, 2, 1)), "first"),
            staged("A", Some(ymd(2020, 2, 1)), "second"),
        ];
        assert_eq!(collapse_batch(rows)[0].stage_name.as_deref(), Some("first"));
    }

    #[test]
    fn absorb_coalesces_on_newer_stage() {
        let mut stored = CaseRecord {
            judge: Some("J1".into()),
            description: Some("kept".into()),
            ..staged("C-1", Some(ymd(2020, 1, 1)), "Filed")
        };
        let incoming = CaseRecord {
            judge: Some("J2".into()),
            description: None,
            ..staged("C-1", Some(ymd(2020, 3, 1)), "Hearing")
        };
        assert!(stored.absorb(incoming));
        assert_eq!(stored.judge.as_deref(), Some("J2"));
        assert_eq!(stored.description.as_deref(), Some("kept"));
        assert_eq!(stored.stage_name.as_deref(), Some("Hearing"));
        assert_eq!(stored.stage_date, Some(ymd(2020, 3, 1)));
    }

    #[test]
    fn absorb_never_regresses_stage() {
        let original = staged("C-1", Some(ymd(2020, 3, 1)), "Hearing");
        let mut stored = original.clone();

        let older = CaseRecord {
            judge: Some("late judge".into()),
            ..staged("C-1", Some(ymd(2020, 1, 1)), "Filed")
        };
        assert!(!stored.absorb(older));
        assert!(!stored.absorb(staged("C-1", Some(ymd(2020, 3, 1)), "Same day")));
        assert!(!stored.absorb(staged("C-1", None, "Undated")));
        assert_eq!(stored, original);
    }

    #[test]
    fn absorb_fills_missing_stored_stage() {
        let mut stored = staged("C-1", None, "Registered");
        assert!(stored.absorb(staged("C-1", Some(ymd(2019, 5, 5)), "Closed")));
        assert_eq!(stored.stage_date, Some(ymd(2019, 5, 5)));
    }
}
