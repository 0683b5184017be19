#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Bulk ingest of police accident CSV exports.
//!
//! The exports use localized column headers, ROC dates, compact times,
//! and carry summary/footer rows whose year column is not numeric.
//! Rows survive a per-field cleanup, a Taiwan-area coordinate sanity
//! check, and an in-memory first-occurrence dedup before being handed
//! to the batched storage upsert.

use std::collections::HashSet;
use std::io::Read;

use civic_map_database::{DbError, accidents};
use civic_map_models::AccidentRecord;
use civic_map_parse as parse;
use duckdb::Connection;

const HEADER_YEAR: &str = "發生年度";
const HEADER_MONTH: &str = "發生月份";
const HEADER_DATE: &str = "發生日期";
const HEADER_TIME: &str = "發生時間";
const HEADER_TYPE: &str = "事故類別名稱";
const HEADER_DEPARTMENT: &str = "處理單位名稱警局層";
const HEADER_LOCATION: &str = "發生地點";
const HEADER_LONGITUDE: &str = "經度";
const HEADER_LATITUDE: &str = "緯度";

const MAX_TYPE_LEN: usize = 10;
const MAX_DEPARTMENT_LEN: usize = 100;
const MAX_LOCATION_LEN: usize = 500;

// Coordinates outside this box cannot be in the service area; they are
// data errors (swapped columns, TWD97 values, zeros).
const MIN_LATITUDE: f64 = 16.0;
const MAX_LATITUDE: f64 = 30.0;
const MIN_LONGITUDE: f64 = 116.0;
const MAX_LONGITUDE: f64 = 126.0;

/// Errors that can occur during a bulk import.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The CSV stream is malformed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The storage upsert failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// A required column header is missing.
    #[error("Missing column '{name}'")]
    MissingColumn {
        /// The localized header that was not found.
        name: String,
    },
}

/// Counters describing one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Rows written to storage (after dedup).
    pub written: usize,
    /// Data rows read from the CSV.
    pub raw: usize,
    /// Duplicates dropped by the natural-key dedup.
    pub deduped: usize,
    /// Rows dropped as unparseable, footer, or out of the service area.
    pub skipped: usize,
}

struct Columns {
    year: usize,
    month: usize,
    date: usize,
    time: usize,
    accident_type: usize,
    department: usize,
    location: usize,
    longitude: usize,
    latitude: usize,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, IngestError> {
        let find = |name: &str| -> Result<usize, IngestError> {
            headers
                .iter()
                .position(|h| parse::normalize(h) == name)
                .ok_or_else(|| IngestError::MissingColumn {
                    name: name.to_owned(),
                })
        };

        Ok(Self {
            year: find(HEADER_YEAR)?,
            month: find(HEADER_MONTH)?,
            date: find(HEADER_DATE)?,
            time: find(HEADER_TIME)?,
            accident_type: find(HEADER_TYPE)?,
            department: find(HEADER_DEPARTMENT)?,
            location: find(HEADER_LOCATION)?,
            longitude: find(HEADER_LONGITUDE)?,
            latitude: find(HEADER_LATITUDE)?,
        })
    }
}

/// Imports accident rows from a CSV stream and upserts them in batches.
///
/// Rows whose year column is not numeric (dataset footers), whose date,
/// time, or coordinates fail to parse, whose bytes are unreadable, or
/// whose coordinates fall outside the service area are skipped; no
/// single row can abort the import. Duplicates of an already-accepted
/// natural key keep the first occurrence.
///
/// # Errors
///
/// Returns [`IngestError`] when the header row lacks a required column
/// or cannot be read, or when the storage upsert fails.
pub fn import_from_csv<R: Read>(conn: &Connection, input: R) -> Result<ImportOutcome, IngestError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(input);
    let columns = Columns::from_headers(reader.headers()?)?;

    let mut outcome = ImportOutcome::default();
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for row in reader.records() {
        outcome.raw += 1;

        // A bad row (e.g. invalid UTF-8 mid-file) must not abort the
        // import; the csv reader can keep going past it.
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                log::warn!("skipping unreadable CSV row: {e}");
                outcome.skipped += 1;
                continue;
            }
        };

        let Some(record) = parse_row(&columns, &row) else {
            outcome.skipped += 1;
            continue;
        };

        if seen.insert(record.natural_key()) {
            records.push(record);
        } else {
            outcome.deduped += 1;
        }
    }

    outcome.written = accidents::upsert_batch(conn, &records)?;

    log::info!(
        "import finished: {} written, {} raw, {} deduped, {} skipped",
        outcome.written,
        outcome.raw,
        outcome.deduped,
        outcome.skipped
    );

    Ok(outcome)
}

fn parse_row(columns: &Columns, row: &csv::StringRecord) -> Option<AccidentRecord> {
    let cell = |idx: usize| row.get(idx).unwrap_or("");

    // Footer/summary rows carry text in the year column.
    let year = parse::parse_i16(cell(columns.year))?;
    let month = parse::parse_i8(cell(columns.month))?;
    if !(1..=12).contains(&month) {
        return None;
    }

    let date = parse::parse_date(cell(columns.date))?;
    let time = parse::parse_time(cell(columns.time))?;
    let longitude = parse::parse_decimal(cell(columns.longitude))?;
    let latitude = parse::parse_decimal(cell(columns.latitude))?;

    if !(MIN_LATITUDE..=MAX_LATITUDE).contains(&latitude)
        || !(MIN_LONGITUDE..=MAX_LONGITUDE).contains(&longitude)
    {
        return None;
    }

    Some(AccidentRecord {
        year,
        month,
        date,
        time,
        accident_type: parse::normalize_text(cell(columns.accident_type), MAX_TYPE_LEN),
        police_department: parse::normalize_text(cell(columns.department), MAX_DEPARTMENT_LEN),
        location: parse::normalize_text(cell(columns.location), MAX_LOCATION_LEN),
        longitude,
        latitude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_map_database::open_in_memory;

    const HEADERS: &str =
        "發生年度,發生月份,發生日期,發生時間,事故類別名稱,處理單位名稱警局層,發生地點,經度,緯度";

    fn import(conn: &Connection, body: &str) -> ImportOutcome {
        let csv = format!("{HEADERS}\n{body}");
        import_from_csv(conn, csv.as_bytes()).unwrap()
    }

    #[test]
    fn dirty_export_is_cleaned_deduped_and_counted() {
        let conn = open_in_memory().unwrap();
        let outcome = import(
            &conn,
            "113,1,113/01/15,0830,A2,臺北市政府警察局,中山北路一段,121.52,25.05\n\
             113,1,0113-01-15,08:30,A2,臺北市政府警察局,中山北路一段,121.52,25.05\n\
             總計,,,,,,,,",
        );

        assert_eq!(
            outcome,
            ImportOutcome {
                written: 1,
                raw: 3,
                deduped: 1,
                skipped: 1,
            }
        );
        assert_eq!(accidents::count(&conn).unwrap(), 1);
    }

    #[test]
    fn reimport_is_idempotent() {
        let conn = open_in_memory().unwrap();
        let body = "113,2,113/02/03,1200,A1,新北市政府警察局,,121.46,25.01";

        assert_eq!(import(&conn, body).written, 1);
        assert_eq!(import(&conn, body).written, 1);
        assert_eq!(accidents::count(&conn).unwrap(), 1);
    }

    #[test]
    fn roc_date_lands_on_the_absolute_calendar() {
        let conn = open_in_memory().unwrap();
        import(&conn, "113,1,113年1月15日,0830,A2,警局,某路,121.52,25.05");

        let date: String = conn
            .query_row("SELECT occur_date FROM accidents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(date, "2024-01-15");
    }

    #[test]
    fn out_of_area_coordinates_are_skipped() {
        let conn = open_in_memory().unwrap();
        let outcome = import(
            &conn,
            "113,1,113/01/15,0830,A2,警局,某路,0.0,0.0\n\
             113,1,113/01/15,0830,A2,警局,某路,25.05,121.52",
        );

        // Both rows fail the service-area check (the second has swapped
        // columns).
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.written, 0);
    }

    #[test]
    fn unparseable_date_or_time_is_skipped() {
        let conn = open_in_memory().unwrap();
        let outcome = import(
            &conn,
            "113,1,garbage,0830,A2,警局,某路,121.52,25.05\n\
             113,1,113/01/15,9999,A2,警局,某路,121.52,25.05",
        );

        assert_eq!(outcome.skipped, 2);
    }

    #[test]
    fn long_text_fields_are_truncated() {
        let conn = open_in_memory().unwrap();
        let long_location = "路".repeat(600);
        import(
            &conn,
            &format!("113,1,113/01/15,0830,A2,警局,{long_location},121.52,25.05"),
        );

        let stored: String = conn
            .query_row("SELECT location FROM accidents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored.chars().count(), 500);
    }

    #[test]
    fn invalid_utf8_row_does_not_abort_the_import() {
        let conn = open_in_memory().unwrap();
        let mut csv =
            format!("{HEADERS}\n113,1,113/01/15,0830,A2,警局,某路,121.52,25.05\n").into_bytes();
        csv.extend_from_slice(b"113,1,113/01/16,0900,A2,\xFF\xFE,bad,121.53,25.06\n");
        csv.extend_from_slice("113,1,113/01/17,0930,A2,警局,另路,121.54,25.07\n".as_bytes());

        let outcome = import_from_csv(&conn, csv.as_slice()).unwrap();
        assert_eq!(
            outcome,
            ImportOutcome {
                written: 2,
                raw: 3,
                deduped: 0,
                skipped: 1,
            }
        );
        assert_eq!(accidents::count(&conn).unwrap(), 2);
    }

    #[test]
    fn missing_header_is_an_error() {
        let conn = open_in_memory().unwrap();
        let result = import_from_csv(&conn, "發生年度,發生月份\n113,1".as_bytes());
        assert!(matches!(
            result,
            Err(IngestError::MissingColumn { name }) if name == HEADER_DATE
        ));
    }
}
