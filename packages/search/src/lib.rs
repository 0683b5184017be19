#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Proximity search over accident records.
//!
//! A cheap rectangular bounding box narrows the candidate set in SQL,
//! then the exact haversine distance removes the rectangle's false
//! positives and orders the survivors. The flat-Earth longitude delta
//! is adequate for the service area (Taiwan, ~22-26°N); it is kept
//! as-is for reproducibility rather than generalized.

use civic_map_database::{DbError, accidents};
use civic_map_models::{AccidentSummary, NearbyQuery};
use duckdb::Connection;

/// Mean Earth radius in kilometres, fixed for reproducible distances.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometres per degree of latitude.
const KM_PER_DEGREE_LAT: f64 = 111.0;

/// Errors that can occur during a proximity search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The storage query failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// The query parameters are unusable.
    #[error("Invalid query: {message}")]
    InvalidQuery {
        /// Description of what is wrong with the parameters.
        message: String,
    },
}

/// Rectangular prefilter around a centre point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// Computes the bounding box for a radius around a centre point.
///
/// Latitude delta is `radius / 111`; longitude delta additionally
/// divides by the cosine of the latitude. The box may admit points
/// outside the true circle; the exact distance filter removes them.
#[must_use]
pub fn bounding_box(lat: f64, lon: f64, radius_km: f64) -> BoundingBox {
    let lat_delta = radius_km / KM_PER_DEGREE_LAT;
    let lon_delta = radius_km / (KM_PER_DEGREE_LAT * lat.to_radians().cos());
    BoundingBox {
        min_lat: lat - lat_delta,
        max_lat: lat + lat_delta,
        min_lon: lon - lon_delta,
        max_lon: lon + lon_delta,
    }
}

/// Great-circle distance between two coordinates in kilometres.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Finds accidents within `radius_km` of the query point for the exact
/// year and month, ordered nearest first.
///
/// The distance itself is not part of the returned projection.
///
/// # Errors
///
/// Returns [`SearchError`] if the parameters are out of range or the
/// storage query fails.
pub fn find_nearby(
    conn: &Connection,
    query: &NearbyQuery,
) -> Result<Vec<AccidentSummary>, SearchError> {
    if query.radius_km <= 0.0 || !query.radius_km.is_finite() {
        return Err(SearchError::InvalidQuery {
            message: format!("radius must be positive, got {}", query.radius_km),
        });
    }
    if !(-90.0..=90.0).contains(&query.lat) || !(-180.0..=180.0).contains(&query.lon) {
        return Err(SearchError::InvalidQuery {
            message: format!("coordinates out of range: ({}, {})", query.lat, query.lon),
        });
    }

    let bbox = bounding_box(query.lat, query.lon, query.radius_km);
    let candidates = accidents::query_bounding_box(
        conn,
        bbox.min_lat,
        bbox.max_lat,
        bbox.min_lon,
        bbox.max_lon,
        query.year,
        query.month,
    )?;

    let mut nearby: Vec<(f64, AccidentSummary)> = candidates
        .into_iter()
        .map(|summary| {
            let distance = haversine_km(query.lat, query.lon, summary.latitude, summary.longitude);
            (distance, summary)
        })
        .filter(|(distance, _)| *distance <= query.radius_km)
        .collect();

    nearby.sort_by(|a, b| a.0.total_cmp(&b.0));

    log::debug!(
        "nearby query ({}, {}) r={}km matched {} of bbox candidates",
        query.lat,
        query.lon,
        query.radius_km,
        nearby.len()
    );

    Ok(nearby.into_iter().map(|(_, summary)| summary).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use civic_map_database::open_in_memory;
    use civic_map_models::AccidentRecord;

    fn record(lon: f64, lat: f64, time: &str) -> AccidentRecord {
        AccidentRecord {
            year: 2024,
            month: 1,
            date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            time: NaiveTime::parse_from_str(time, "%H:%M:%S").unwrap(),
            accident_type: Some("A2".to_owned()),
            police_department: None,
            location: None,
            longitude: lon,
            latitude: lat,
        }
    }

    fn query(radius_km: f64) -> NearbyQuery {
        NearbyQuery {
            year: 2024,
            month: 1,
            lat: 25.0,
            lon: 121.5,
            radius_km,
        }
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Taipei Main Station to Taipei 101 is roughly 5 km.
        let d = haversine_km(25.0478, 121.5170, 25.0330, 121.5654);
        assert!((4.0..6.0).contains(&d), "got {d}");
    }

    #[test]
    fn haversine_is_zero_at_same_point() {
        assert!(haversine_km(25.0, 121.5, 25.0, 121.5) < 1e-9);
    }

    #[test]
    fn bounding_box_widens_longitude_with_latitude() {
        let equator = bounding_box(0.0, 121.5, 10.0);
        let taiwan = bounding_box(25.0, 121.5, 10.0);
        let eq_width = equator.max_lon - equator.min_lon;
        let tw_width = taiwan.max_lon - taiwan.min_lon;
        assert!(tw_width > eq_width);
    }

    #[test]
    fn record_at_query_point_is_always_returned() {
        let conn = open_in_memory().unwrap();
        civic_map_database::accidents::upsert_batch(&conn, &[record(121.5, 25.0, "08:30:00")])
            .unwrap();

        for radius in [0.001, 1.0, 30.0] {
            let hits = find_nearby(&conn, &query(radius)).unwrap();
            assert_eq!(hits.len(), 1, "radius {radius}");
        }
    }

    #[test]
    fn record_beyond_radius_is_never_returned() {
        let conn = open_in_memory().unwrap();
        // ~5 km north of the query point (verified via haversine below).
        let far = record(121.5, 25.045, "09:00:00");
        assert!(haversine_km(25.0, 121.5, far.latitude, far.longitude) > 1.0);
        civic_map_database::accidents::upsert_batch(
            &conn,
            &[record(121.5, 25.0, "08:30:00"), far],
        )
        .unwrap();

        let hits = find_nearby(&conn, &query(1.0)).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].latitude - 25.0).abs() < 1e-9);
    }

    #[test]
    fn results_are_ordered_by_distance() {
        let conn = open_in_memory().unwrap();
        civic_map_database::accidents::upsert_batch(
            &conn,
            &[
                record(121.52, 25.0, "08:00:00"),
                record(121.5, 25.0, "08:30:00"),
                record(121.51, 25.0, "09:00:00"),
            ],
        )
        .unwrap();

        let hits = find_nearby(&conn, &query(30.0)).unwrap();
        let lons: Vec<f64> = hits.iter().map(|h| h.longitude).collect();
        assert_eq!(lons, vec![121.5, 121.51, 121.52]);
    }

    #[test]
    fn year_month_filters_are_exact() {
        let conn = open_in_memory().unwrap();
        let mut other = record(121.5, 25.0, "10:00:00");
        other.year = 2023;
        civic_map_database::accidents::upsert_batch(&conn, &[other]).unwrap();

        assert!(find_nearby(&conn, &query(30.0)).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_parameters() {
        let conn = open_in_memory().unwrap();
        assert!(find_nearby(&conn, &query(0.0)).is_err());
        assert!(find_nearby(&conn, &query(-1.0)).is_err());

        let mut bad = query(1.0);
        bad.lat = 95.0;
        assert!(find_nearby(&conn, &bad).is_err());
    }
}
