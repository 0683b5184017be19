//! Tender row storage.
//!
//! Tenders are insert-once: the external `tpam_pk` is unique and rows
//! whose key already exists are skipped, both by the crawler's in-memory
//! snapshot and by the `ON CONFLICT DO NOTHING` safety net here.

use std::collections::BTreeSet;

use civic_map_models::TenderRecord;
use duckdb::Connection;

use crate::{DATE_FORMAT, DbError};

/// Loads a snapshot of every known external tender key.
///
/// The crawler reads this once per invocation and treats it as
/// read-only; the unique constraint remains the final arbiter.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn existing_keys(conn: &Connection) -> Result<BTreeSet<String>, DbError> {
    let mut stmt = conn.prepare("SELECT tpam_pk FROM tenders")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut keys = BTreeSet::new();
    for row in rows {
        keys.insert(row?);
    }
    Ok(keys)
}

/// Inserts new tender rows, silently skipping keys that already exist.
/// Returns the number of rows actually inserted.
///
/// # Errors
///
/// Returns [`DbError`] if the insert fails.
pub fn insert_batch(conn: &Connection, tenders: &[TenderRecord]) -> Result<usize, DbError> {
    if tenders.is_empty() {
        return Ok(0);
    }

    let mut stmt = conn.prepare(
        "INSERT INTO tenders (tpam_pk, category, case_no, case_no_init, name,
                              notice_date, bid_deadline, budget_amount,
                              detail_url, geo_location_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (tpam_pk) DO NOTHING",
    )?;

    let mut inserted = 0;
    for tender in tenders {
        inserted += stmt.execute(duckdb::params![
            tender.tpam_pk,
            tender.category.as_deref(),
            tender.case_no.as_deref(),
            tender.case_no_init.as_deref(),
            tender.name.as_deref(),
            tender
                .notice_date
                .map(|d| d.format(DATE_FORMAT).to_string()),
            tender
                .bid_deadline
                .map(|d| d.format(DATE_FORMAT).to_string()),
            tender.budget_amount,
            tender.detail_url.as_deref(),
            tender.geo_location_id,
        ])?;
    }

    Ok(inserted)
}
