#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `DuckDB` storage layer for the civic map.
//!
//! One database file holds all four tables: accident records, the
//! geocoding cache, tender rows, and the usage-quota ledger. The schema
//! is created at open time; uniqueness constraints enforce the natural
//! keys at the storage layer so concurrent writers cannot duplicate
//! rows the in-memory snapshots missed.
//!
//! `duckdb::Connection` is `Send` but not `Sync`, so callers share one
//! connection behind an `Arc<Mutex<_>>` (see [`SharedDb`]). The mutex
//! also serves as the serialization point the quota ledger's
//! read-modify-write sequence requires.

pub mod accidents;
pub mod geolocations;
pub mod quota;
pub mod tenders;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use duckdb::Connection;

/// Shared handle to the single `DuckDB` connection.
pub type SharedDb = Arc<Mutex<Connection>>;

/// Timestamp format stored in TEXT columns.
///
/// Fixed-width UTC so lexicographic comparison in SQL matches
/// chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Date format stored in TEXT columns.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Time format stored in TEXT columns.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    /// An I/O operation failed (e.g., creating the database directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// Opens (or creates) the civic map database at `path` and ensures the
/// schema exists.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or schema creation fails.
pub fn open(path: &Path) -> Result<Connection, DbError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    log::debug!("opening database at {}", path.display());
    let conn = Connection::open(path)?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Opens an in-memory database with the full schema (used by tests).
///
/// # Errors
///
/// Returns [`DbError`] if the connection or schema creation fails.
pub fn open_in_memory() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Wraps a connection in the [`SharedDb`] handle.
#[must_use]
pub fn into_shared(conn: Connection) -> SharedDb {
    Arc::new(Mutex::new(conn))
}

/// Acquires the shared connection.
///
/// # Panics
///
/// Panics if the mutex is poisoned.
pub fn acquire(db: &SharedDb) -> MutexGuard<'_, Connection> {
    db.lock().expect("database mutex poisoned")
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE SEQUENCE IF NOT EXISTS accidents_id_seq;
        CREATE TABLE IF NOT EXISTS accidents (
            id BIGINT PRIMARY KEY DEFAULT nextval('accidents_id_seq'),
            occur_year SMALLINT NOT NULL,
            occur_month TINYINT NOT NULL,
            occur_date TEXT NOT NULL,
            occur_time TEXT NOT NULL,
            accident_type TEXT,
            police_department TEXT,
            location TEXT,
            longitude DOUBLE NOT NULL,
            latitude DOUBLE NOT NULL,
            UNIQUE (occur_year, occur_month, occur_date, occur_time,
                    longitude, latitude)
        );

        CREATE SEQUENCE IF NOT EXISTS geo_locations_id_seq;
        CREATE TABLE IF NOT EXISTS geo_locations (
            id BIGINT PRIMARY KEY DEFAULT nextval('geo_locations_id_seq'),
            place_name TEXT NOT NULL UNIQUE,
            formatted_address TEXT,
            postal_code TEXT,
            country TEXT,
            admin_area_level1 TEXT,
            admin_area_level2 TEXT,
            admin_area_level3 TEXT,
            route TEXT,
            street_number TEXT,
            latitude DOUBLE,
            longitude DOUBLE,
            location_type TEXT,
            place_id TEXT,
            partial_match BOOLEAN,
            types TEXT,
            raw_json TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE SEQUENCE IF NOT EXISTS tenders_id_seq;
        CREATE TABLE IF NOT EXISTS tenders (
            id BIGINT PRIMARY KEY DEFAULT nextval('tenders_id_seq'),
            tpam_pk TEXT NOT NULL UNIQUE,
            category TEXT,
            case_no TEXT,
            case_no_init TEXT,
            name TEXT,
            notice_date TEXT,
            bid_deadline TEXT,
            budget_amount DOUBLE,
            detail_url TEXT,
            geo_location_id BIGINT
        );

        CREATE SEQUENCE IF NOT EXISTS api_usage_quota_id_seq;
        CREATE TABLE IF NOT EXISTS api_usage_quota (
            id BIGINT PRIMARY KEY DEFAULT nextval('api_usage_quota_id_seq'),
            provider TEXT NOT NULL,
            api_name TEXT NOT NULL,
            client_id TEXT NOT NULL DEFAULT '',
            ip_address TEXT NOT NULL DEFAULT '',
            user_agent TEXT,
            date TEXT NOT NULL,
            hour TINYINT,
            usage_count INTEGER NOT NULL DEFAULT 0,
            limit_per_day INTEGER NOT NULL,
            limit_per_hour INTEGER,
            blocked_until TEXT,
            updated_at TEXT,
            UNIQUE (provider, api_name, client_id, ip_address, date)
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creation_is_idempotent() {
        let conn = open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM accidents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
