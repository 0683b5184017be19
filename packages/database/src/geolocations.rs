//! Geocoding cache rows keyed by place name.
//!
//! Caches both successful geocodes (with coordinates) and failed lookups
//! (null coordinates, non-empty raw payload) so the same place name is
//! never sent to the provider twice. The crawler also creates placeholder
//! rows (no payload at all) for agencies awaiting resolution.

use civic_map_models::GeoLocationRecord;
use duckdb::Connection;

use crate::DbError;

/// A cache hit: coordinates and match flag from a previous lookup.
#[derive(Debug, Clone, Copy)]
pub struct CachedCoordinates {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub partial_match: bool,
}

/// Looks up a previously-resolved place name.
///
/// Returns `Some` only when a non-empty raw payload is stored, i.e. the
/// provider was actually queried before. A negative cache entry yields
/// `Some` with absent coordinates.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn find_cached(
    conn: &Connection,
    place_name: &str,
) -> Result<Option<CachedCoordinates>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT latitude, longitude, partial_match
         FROM geo_locations
         WHERE place_name = ? AND raw_json IS NOT NULL AND raw_json <> ''",
    )?;

    let mut rows = stmt.query_map(duckdb::params![place_name], |row| {
        Ok(CachedCoordinates {
            latitude: row.get(0)?,
            longitude: row.get(1)?,
            partial_match: row.get::<_, Option<bool>>(2)?.unwrap_or(false),
        })
    })?;

    rows.next().transpose().map_err(DbError::from)
}

/// Returns the row id for a place name, if any row exists (placeholder
/// or resolved).
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn find_id(conn: &Connection, place_name: &str) -> Result<Option<i64>, DbError> {
    let mut stmt = conn.prepare("SELECT id FROM geo_locations WHERE place_name = ?")?;
    let mut rows = stmt.query_map(duckdb::params![place_name], |row| row.get::<_, i64>(0))?;
    rows.next().transpose().map_err(DbError::from)
}

/// Returns whether the place name has a stored provider payload.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn has_payload(conn: &Connection, place_name: &str) -> Result<bool, DbError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM geo_locations
         WHERE place_name = ? AND raw_json IS NOT NULL AND raw_json <> ''",
        duckdb::params![place_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Creates a placeholder row for a place name awaiting resolution.
/// Existing rows are left untouched. Returns the row id.
///
/// # Errors
///
/// Returns [`DbError`] if the insert or the id lookup fails.
pub fn insert_placeholder(conn: &Connection, place_name: &str) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO geo_locations (place_name)
         VALUES (?)
         ON CONFLICT (place_name) DO NOTHING",
        duckdb::params![place_name],
    )?;

    find_id(conn, place_name)?.ok_or_else(|| DbError::Conversion {
        message: format!("placeholder row missing for '{place_name}'"),
    })
}

/// Writes (or overwrites) the resolved fields for a place name,
/// including the raw provider payload used as the cache sentinel.
///
/// # Errors
///
/// Returns [`DbError`] if the upsert fails.
pub fn upsert_resolved(conn: &Connection, record: &GeoLocationRecord) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO geo_locations (place_name, formatted_address, postal_code,
             country, admin_area_level1, admin_area_level2, admin_area_level3,
             route, street_number, latitude, longitude, location_type,
             place_id, partial_match, types, raw_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (place_name) DO UPDATE SET
             formatted_address = EXCLUDED.formatted_address,
             postal_code = EXCLUDED.postal_code,
             country = EXCLUDED.country,
             admin_area_level1 = EXCLUDED.admin_area_level1,
             admin_area_level2 = EXCLUDED.admin_area_level2,
             admin_area_level3 = EXCLUDED.admin_area_level3,
             route = EXCLUDED.route,
             street_number = EXCLUDED.street_number,
             latitude = EXCLUDED.latitude,
             longitude = EXCLUDED.longitude,
             location_type = EXCLUDED.location_type,
             place_id = EXCLUDED.place_id,
             partial_match = EXCLUDED.partial_match,
             types = EXCLUDED.types,
             raw_json = EXCLUDED.raw_json",
        duckdb::params![
            record.place_name,
            record.formatted_address.as_deref(),
            record.postal_code.as_deref(),
            record.country.as_deref(),
            record.admin_area_level1.as_deref(),
            record.admin_area_level2.as_deref(),
            record.admin_area_level3.as_deref(),
            record.route.as_deref(),
            record.street_number.as_deref(),
            record.latitude,
            record.longitude,
            record.location_type.as_deref(),
            record.place_id.as_deref(),
            record.partial_match,
            record.types.as_deref(),
            record.raw_json.as_deref(),
        ],
    )?;
    Ok(())
}

/// Lists place names with no stored provider payload, oldest first.
/// These are the rows the daily fill job resolves.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn unresolved_place_names(conn: &Connection) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT place_name FROM geo_locations
         WHERE raw_json IS NULL OR raw_json = ''
         ORDER BY id",
    )?;

    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}
