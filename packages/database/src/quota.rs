//! Usage-quota ledger row primitives.
//!
//! The consumption logic lives in `civic_map_quota`; this module only
//! reads and writes rows. Optional key parts are stored as empty strings
//! so the `(provider, api_name, client_id, ip_address, date)` uniqueness
//! constraint covers them.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use civic_map_models::{QuotaKey, QuotaRow};
use duckdb::Connection;

use crate::{DATE_FORMAT, DbError, TIMESTAMP_FORMAT};

fn key_part(part: Option<&str>) -> &str {
    part.unwrap_or("")
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, DbError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| DbError::Conversion {
            message: format!("bad timestamp '{text}': {e}"),
        })
}

/// Formats an instant the way TEXT timestamp columns store it.
#[must_use]
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format(TIMESTAMP_FORMAT).to_string()
}

/// Finds the ledger row for a key on a tracking day.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn find(
    conn: &Connection,
    key: &QuotaKey,
    date: NaiveDate,
) -> Result<Option<QuotaRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, provider, api_name, client_id, ip_address, user_agent,
                date, hour, usage_count, limit_per_day, limit_per_hour,
                blocked_until
         FROM api_usage_quota
         WHERE provider = ? AND api_name = ? AND client_id = ?
           AND ip_address = ? AND date = ?",
    )?;

    let mut rows = stmt.query_map(
        duckdb::params![
            key.provider,
            key.api_name,
            key_part(key.client_id.as_deref()),
            key_part(key.ip_address.as_deref()),
            date.format(DATE_FORMAT).to_string(),
        ],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<i8>>(7)?,
                row.get::<_, i32>(8)?,
                row.get::<_, i32>(9)?,
                row.get::<_, Option<i32>>(10)?,
                row.get::<_, Option<String>>(11)?,
            ))
        },
    )?;

    let Some(row) = rows.next().transpose()? else {
        return Ok(None);
    };

    let (
        id,
        provider,
        api_name,
        client_id,
        ip_address,
        user_agent,
        date_text,
        hour,
        usage_count,
        limit_per_day,
        limit_per_hour,
        blocked_until,
    ) = row;

    let date = NaiveDate::parse_from_str(&date_text, DATE_FORMAT).map_err(|e| {
        DbError::Conversion {
            message: format!("bad quota date '{date_text}': {e}"),
        }
    })?;
    let blocked_until = blocked_until
        .filter(|text| !text.is_empty())
        .map(|text| parse_timestamp(&text))
        .transpose()?;

    Ok(Some(QuotaRow {
        id,
        provider,
        api_name,
        client_id: Some(client_id).filter(|s| !s.is_empty()),
        ip_address: Some(ip_address).filter(|s| !s.is_empty()),
        user_agent,
        date,
        hour,
        usage_count,
        limit_per_day,
        limit_per_hour,
        blocked_until,
    }))
}

/// Creates a fresh ledger row with zero usage for a key and day.
///
/// # Errors
///
/// Returns [`DbError`] if the insert fails.
#[allow(clippy::too_many_arguments)]
pub fn insert(
    conn: &Connection,
    key: &QuotaKey,
    user_agent: Option<&str>,
    date: NaiveDate,
    hour: i8,
    limit_per_day: i32,
    limit_per_hour: Option<i32>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO api_usage_quota (provider, api_name, client_id, ip_address,
                                      user_agent, date, hour, usage_count,
                                      limit_per_day, limit_per_hour, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
         ON CONFLICT (provider, api_name, client_id, ip_address, date)
         DO NOTHING",
        duckdb::params![
            key.provider,
            key.api_name,
            key_part(key.client_id.as_deref()),
            key_part(key.ip_address.as_deref()),
            user_agent,
            date.format(DATE_FORMAT).to_string(),
            hour,
            limit_per_day,
            limit_per_hour,
            format_timestamp(now),
        ],
    )?;
    Ok(())
}

/// Writes back the counters after a consumption attempt.
///
/// # Errors
///
/// Returns [`DbError`] if the update fails.
pub fn update_usage(
    conn: &Connection,
    id: i64,
    usage_count: i32,
    blocked_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "UPDATE api_usage_quota
         SET usage_count = ?, blocked_until = ?, updated_at = ?
         WHERE id = ?",
        duckdb::params![
            usage_count,
            blocked_until.map(format_timestamp),
            format_timestamp(now),
            id,
        ],
    )?;
    Ok(())
}

/// Clears every expired block. Returns the number of rows touched.
///
/// This is the ledger's only bulk mutation; it backs the hourly
/// unblock sweep.
///
/// # Errors
///
/// Returns [`DbError`] if the update fails.
pub fn clear_expired_blocks(conn: &Connection, now: DateTime<Utc>) -> Result<usize, DbError> {
    let changed = conn.execute(
        "UPDATE api_usage_quota
         SET blocked_until = NULL
         WHERE blocked_until IS NOT NULL AND blocked_until <= ?",
        duckdb::params![format_timestamp(now)],
    )?;
    Ok(changed)
}
