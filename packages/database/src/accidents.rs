//! Accident record storage: batched natural-key upsert and the
//! bounding-box prefilter query used by the proximity search.

use civic_map_models::{AccidentRecord, AccidentSummary};
use duckdb::Connection;

use crate::{DATE_FORMAT, DbError, TIME_FORMAT};

/// Rows written per transaction during a bulk upsert.
///
/// Independent of the total import size so one huge CSV cannot produce
/// an unbounded transaction.
pub const UPSERT_BATCH_SIZE: usize = 5000;

/// Upserts accident records in batches of [`UPSERT_BATCH_SIZE`].
///
/// Rows matched by the natural key `(year, month, date, time, longitude,
/// latitude)` are updated in place; new keys are inserted. Returns the
/// number of rows processed.
///
/// # Errors
///
/// Returns [`DbError`] if any batch fails; earlier batches stay
/// committed (the storage engine's batch semantics are the only
/// partial-commit guarantee).
pub fn upsert_batch(conn: &Connection, records: &[AccidentRecord]) -> Result<usize, DbError> {
    if records.is_empty() {
        return Ok(0);
    }

    for chunk in records.chunks(UPSERT_BATCH_SIZE) {
        conn.execute_batch("BEGIN TRANSACTION")?;
        let result = upsert_chunk(conn, chunk);
        if let Err(e) = result {
            conn.execute_batch("ROLLBACK")?;
            return Err(e);
        }
        conn.execute_batch("COMMIT")?;
    }

    Ok(records.len())
}

fn upsert_chunk(conn: &Connection, chunk: &[AccidentRecord]) -> Result<(), DbError> {
    let mut stmt = conn.prepare(
        "INSERT INTO accidents (occur_year, occur_month, occur_date, occur_time,
                                accident_type, police_department, location,
                                longitude, latitude)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (occur_year, occur_month, occur_date, occur_time,
                      longitude, latitude)
         DO UPDATE SET
             accident_type = EXCLUDED.accident_type,
             police_department = EXCLUDED.police_department,
             location = EXCLUDED.location",
    )?;

    for record in chunk {
        stmt.execute(duckdb::params![
            record.year,
            record.month,
            record.date.format(DATE_FORMAT).to_string(),
            record.time.format(TIME_FORMAT).to_string(),
            record.accident_type.as_deref(),
            record.police_department.as_deref(),
            record.location.as_deref(),
            record.longitude,
            record.latitude,
        ])?;
    }

    Ok(())
}

/// Returns all accidents inside the rectangle for the exact year and
/// month. The rectangle is a prefilter; callers apply the exact distance
/// cut afterwards.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
#[allow(clippy::similar_names)]
pub fn query_bounding_box(
    conn: &Connection,
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
    year: i16,
    month: i8,
) -> Result<Vec<AccidentSummary>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, occur_year, occur_month, accident_type, longitude, latitude
         FROM accidents
         WHERE latitude >= ? AND latitude <= ?
           AND longitude >= ? AND longitude <= ?
           AND occur_year = ? AND occur_month = ?",
    )?;

    let rows = stmt.query_map(
        duckdb::params![min_lat, max_lat, min_lon, max_lon, year, month],
        |row| {
            Ok(AccidentSummary {
                id: row.get(0)?,
                year: row.get(1)?,
                month: row.get(2)?,
                accident_type: row.get(3)?,
                longitude: row.get(4)?,
                latitude: row.get(5)?,
            })
        },
    )?;

    let mut summaries = Vec::new();
    for row in rows {
        summaries.push(row?);
    }
    Ok(summaries)
}

/// Counts all stored accident records.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn count(conn: &Connection) -> Result<i64, DbError> {
    let count = conn.query_row("SELECT COUNT(*) FROM accidents", [], |row| row.get(0))?;
    Ok(count)
}
