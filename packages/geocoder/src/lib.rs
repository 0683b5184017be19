#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Quota-gated, cached place-name geocoding.
//!
//! Every lookup goes through the usage-quota ledger first, then the
//! persistent cache, and only then the Google Maps Geocoding API (with
//! the "find place from text" endpoint as a fallback for names the
//! geocoder cannot match). Failed lookups are cached too, so a place
//! name never costs more than one provider round trip over the
//! database's lifetime.

pub mod google;

use std::time::Duration;

use civic_map_database::{DbError, SharedDb, acquire, geolocations};
use civic_map_models::{GeoLocationRecord, QuotaKey};
use civic_map_quota::{QuotaError, QuotaLimits, try_consume};
use google::GeocodePayload;

const GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const FIND_PLACE_URL: &str = "https://maps.googleapis.com/maps/api/place/findplacefromtext/json";

const QUOTA_PROVIDER: &str = "google";
const QUOTA_API_NAME: &str = "geocode";
const QUOTA_CLIENT_ID: &str = "civic-map-api";
const QUOTA_USER_AGENT: &str = "server-job";

const HOURLY_LIMIT: i32 = 10_000;
const BLOCK_THRESHOLD: i32 = 10_000;
const BLOCK_MINUTES: i64 = 1440;

/// Provider access settings.
#[derive(Debug, Clone)]
pub struct GeocodeConfig {
    /// Google Maps API key.
    pub api_key: String,
    /// Daily cap on provider calls.
    pub daily_limit: i32,
    /// Pause before each provider call.
    pub request_delay_ms: u64,
}

impl GeocodeConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            daily_limit: 2000,
            request_delay_ms: 100,
        }
    }

    fn quota_key() -> QuotaKey {
        QuotaKey::new(QUOTA_PROVIDER, QUOTA_API_NAME).with_client_id(QUOTA_CLIENT_ID)
    }

    const fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            daily_limit: self.daily_limit,
            hourly_limit: Some(HOURLY_LIMIT),
            block_threshold: BLOCK_THRESHOLD,
            block_minutes: BLOCK_MINUTES,
        }
    }
}

/// Errors that can occur while resolving a place name.
#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    /// The place name is empty after trimming.
    #[error("Place name is blank")]
    BlankPlaceName,

    /// The provider request failed at the transport or HTTP level.
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Cache or quota storage failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// The quota ledger failed.
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

/// Outcome of one place-name resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    /// Coordinates from the cache or the provider.
    Found {
        latitude: f64,
        longitude: f64,
        /// Whether the provider flagged the match as partial.
        partial_match: bool,
    },
    /// The provider was queried (now or previously) and found nothing.
    NotFound,
    /// The daily quota or an abuse block rejected the provider call.
    QuotaDenied,
}

/// Resolves a place name to coordinates.
///
/// Order of checks: quota ledger, persistent cache, then the provider.
/// The quota is consumed up front, before the cache is consulted.
/// A provider miss on the geocoding endpoint falls back to "find place
/// from text" before the (possibly negative) result is cached.
///
/// # Errors
///
/// Returns [`GeocodeError`] for a blank name or when storage or the
/// provider transport fails. Quota rejection and provider misses are
/// reported through [`Resolution`], not as errors.
pub async fn resolve(
    client: &reqwest::Client,
    db: &SharedDb,
    config: &GeocodeConfig,
    place_name: &str,
) -> Result<Resolution, GeocodeError> {
    let place_name = place_name.trim();
    if place_name.is_empty() {
        return Err(GeocodeError::BlankPlaceName);
    }

    {
        let conn = acquire(db);
        let outcome = try_consume(
            &conn,
            &GeocodeConfig::quota_key(),
            Some(QUOTA_USER_AGENT),
            &config.quota_limits(),
            chrono::Utc::now(),
        )?;
        if !outcome.allowed {
            log::warn!("geocode quota denied for '{place_name}'");
            return Ok(Resolution::QuotaDenied);
        }

        if let Some(hit) = geolocations::find_cached(&conn, place_name)? {
            log::debug!("geocode cache hit for '{place_name}'");
            return Ok(match (hit.latitude, hit.longitude) {
                (Some(latitude), Some(longitude)) => Resolution::Found {
                    latitude,
                    longitude,
                    partial_match: hit.partial_match,
                },
                _ => Resolution::NotFound,
            });
        }
    }

    if config.request_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.request_delay_ms)).await;
    }

    let (payload, raw_json) = query_provider(client, config, place_name).await?;

    let record = to_record(place_name, payload.as_ref(), raw_json);
    {
        let conn = acquire(db);
        geolocations::upsert_resolved(&conn, &record)?;
    }

    Ok(match payload {
        Some(GeocodePayload {
            lat: Some(latitude),
            lng: Some(longitude),
            partial_match,
            ..
        }) => Resolution::Found {
            latitude,
            longitude,
            partial_match,
        },
        _ => {
            log::info!("no geocode result for '{place_name}'");
            Resolution::NotFound
        }
    })
}

/// Geocoding endpoint first, find-place fallback on an empty result.
/// The raw body that produced the final answer becomes the cached
/// payload.
async fn query_provider(
    client: &reqwest::Client,
    config: &GeocodeConfig,
    place_name: &str,
) -> Result<(Option<GeocodePayload>, String), GeocodeError> {
    let body: serde_json::Value = client
        .get(GEOCODE_URL)
        .query(&[
            ("address", place_name),
            ("language", "zh-TW"),
            ("region", "tw"),
            ("key", &config.api_key),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if let Some(payload) = google::parse_geocode_response(&body) {
        return Ok((Some(payload), body.to_string()));
    }

    log::debug!("geocode miss for '{place_name}', trying find-place");
    let fallback: serde_json::Value = client
        .get(FIND_PLACE_URL)
        .query(&[
            ("input", place_name),
            ("inputtype", "textquery"),
            ("fields", "formatted_address,geometry,place_id"),
            ("language", "zh-TW"),
            ("key", &config.api_key),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let payload = google::parse_find_place_response(&fallback);
    Ok((payload, fallback.to_string()))
}

fn to_record(place_name: &str, payload: Option<&GeocodePayload>, raw_json: String) -> GeoLocationRecord {
    let mut record = GeoLocationRecord {
        place_name: place_name.to_owned(),
        raw_json: Some(raw_json),
        ..GeoLocationRecord::default()
    };

    if let Some(payload) = payload {
        record.formatted_address.clone_from(&payload.formatted_address);
        record.postal_code.clone_from(&payload.postal_code);
        record.country.clone_from(&payload.country);
        record.admin_area_level1.clone_from(&payload.admin_area_level1);
        record.admin_area_level2.clone_from(&payload.admin_area_level2);
        record.admin_area_level3.clone_from(&payload.admin_area_level3);
        record.route.clone_from(&payload.route);
        record.street_number.clone_from(&payload.street_number);
        record.latitude = payload.lat;
        record.longitude = payload.lng;
        record.location_type.clone_from(&payload.location_type);
        record.place_id.clone_from(&payload.place_id);
        record.partial_match = Some(payload.partial_match);
        record.types.clone_from(&payload.types);
    }

    record
}

/// Result of a coordinate back-fill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    /// Names that now have coordinates.
    pub success: usize,
    /// Names the run attempted.
    pub total: usize,
}

/// Resolves every cached place name that has no provider payload yet.
///
/// Stops early when the quota is denied; individual failures are logged
/// and skipped so one bad name cannot stall the run.
///
/// # Errors
///
/// Returns [`GeocodeError`] only when listing the unresolved names
/// fails.
pub async fn fill_missing_coordinates(
    client: &reqwest::Client,
    db: &SharedDb,
    config: &GeocodeConfig,
) -> Result<FillOutcome, GeocodeError> {
    let names = {
        let conn = acquire(db);
        geolocations::unresolved_place_names(&conn)?
    };

    let total = names.len();
    let mut success = 0;

    for name in names {
        match resolve(client, db, config, &name).await {
            Ok(Resolution::Found { .. }) => success += 1,
            Ok(Resolution::NotFound) => {}
            Ok(Resolution::QuotaDenied) => {
                log::warn!("fill job stopped: geocode quota exhausted");
                break;
            }
            Err(e) => log::error!("fill job failed on '{name}': {e}"),
        }
    }

    log::info!("coordinate fill resolved {success}/{total} place names");
    Ok(FillOutcome { success, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_map_database::{into_shared, open_in_memory};

    fn shared_db() -> SharedDb {
        into_shared(open_in_memory().unwrap())
    }

    fn cache(db: &SharedDb, place: &str, lat: Option<f64>) {
        let conn = acquire(db);
        geolocations::upsert_resolved(
            &conn,
            &GeoLocationRecord {
                place_name: place.to_owned(),
                latitude: lat,
                longitude: lat.map(|_| 121.5),
                partial_match: Some(false),
                raw_json: Some("{\"results\":[]}".to_owned()),
                ..GeoLocationRecord::default()
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let db = shared_db();
        let client = reqwest::Client::new();
        let config = GeocodeConfig::new("test-key");

        let result = resolve(&client, &db, &config, "  ").await;
        assert!(matches!(result, Err(GeocodeError::BlankPlaceName)));
    }

    #[tokio::test]
    async fn cached_name_never_reaches_the_provider() {
        let db = shared_db();
        let client = reqwest::Client::new();
        let config = GeocodeConfig::new("test-key");
        cache(&db, "台北市政府", Some(25.03));

        // No HTTP server exists in this test; a provider call would fail.
        let resolution = resolve(&client, &db, &config, "台北市政府").await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Found {
                latitude: 25.03,
                longitude: 121.5,
                partial_match: false,
            }
        );
    }

    #[tokio::test]
    async fn negative_cache_resolves_to_not_found() {
        let db = shared_db();
        let client = reqwest::Client::new();
        let config = GeocodeConfig::new("test-key");
        cache(&db, "查無此地", None);

        let resolution = resolve(&client, &db, &config, "查無此地").await.unwrap();
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[tokio::test]
    async fn exhausted_quota_denies_uncached_names() {
        let db = shared_db();
        let client = reqwest::Client::new();
        let mut config = GeocodeConfig::new("test-key");
        config.daily_limit = 0;

        let resolution = resolve(&client, &db, &config, "未快取機關").await.unwrap();
        assert_eq!(resolution, Resolution::QuotaDenied);

        // The miss must not be cached: quota denial is not an answer.
        let conn = acquire(&db);
        assert!(geolocations::find_cached(&conn, "未快取機關").unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_is_consumed_before_the_cache_is_consulted() {
        let db = shared_db();
        let client = reqwest::Client::new();
        let mut config = GeocodeConfig::new("test-key");
        config.daily_limit = 0;
        cache(&db, "台北市政府", Some(25.03));

        // Even a cached name is denied once the budget is gone.
        let resolution = resolve(&client, &db, &config, "台北市政府").await.unwrap();
        assert_eq!(resolution, Resolution::QuotaDenied);
    }

    #[tokio::test]
    async fn fill_job_counts_cached_rows_without_payload() {
        let db = shared_db();
        let client = reqwest::Client::new();
        let mut config = GeocodeConfig::new("test-key");
        config.daily_limit = 0;

        {
            let conn = acquire(&db);
            geolocations::insert_placeholder(&conn, "甲機關").unwrap();
            geolocations::insert_placeholder(&conn, "乙機關").unwrap();
        }

        // Quota denial stops the run on the first name.
        let outcome = fill_missing_coordinates(&client, &db, &config).await.unwrap();
        assert_eq!(outcome, FillOutcome { success: 0, total: 2 });
    }
}
