#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared record and query types for the civic map.
//!
//! Plain data structs passed between the storage, search, ingest,
//! geocoding, and server crates. No behavior lives here beyond natural-key
//! derivation for accident records.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Scale factor used to compare coordinates at 8 fractional digits.
///
/// Coordinates are stored rounded to 8 decimals; scaling to an integer
/// gives the dedup key `Eq`/`Hash` semantics that raw `f64` lacks.
const COORD_SCALE: f64 = 100_000_000.0;

/// A police traffic-accident record as held in storage.
///
/// The natural key is `(year, month, date, time, longitude, latitude)`;
/// it is unique in storage and drives both upsert matching and the
/// in-memory dedup pass during bulk import.
#[derive(Debug, Clone, PartialEq)]
pub struct AccidentRecord {
    /// Year of occurrence (absolute, not ROC).
    pub year: i16,
    /// Month of occurrence (1-12).
    pub month: i8,
    /// Date of occurrence.
    pub date: NaiveDate,
    /// Time of occurrence.
    pub time: NaiveTime,
    /// Severity class code, e.g. `A1` (fatality) or `A2` (injury).
    pub accident_type: Option<String>,
    /// Reporting police department name.
    pub police_department: Option<String>,
    /// Free-text location description.
    pub location: Option<String>,
    /// Longitude, rounded to 8 fractional digits.
    pub longitude: f64,
    /// Latitude, rounded to 8 fractional digits.
    pub latitude: f64,
}

impl AccidentRecord {
    /// Returns the natural key for dedup and upsert matching.
    ///
    /// Coordinates are scaled to integers so the key is hashable and
    /// two records differing only below the stored 8-decimal precision
    /// compare equal.
    #[must_use]
    pub fn natural_key(&self) -> AccidentKey {
        #[allow(clippy::cast_possible_truncation)]
        AccidentKey {
            year: self.year,
            month: self.month,
            date: self.date,
            time: self.time,
            longitude_e8: (self.longitude * COORD_SCALE).round() as i64,
            latitude_e8: (self.latitude * COORD_SCALE).round() as i64,
        }
    }
}

/// Natural key of an [`AccidentRecord`] with integer-scaled coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccidentKey {
    pub year: i16,
    pub month: i8,
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// Longitude scaled by 1e8.
    pub longitude_e8: i64,
    /// Latitude scaled by 1e8.
    pub latitude_e8: i64,
}

/// Minimal accident projection returned by the proximity search.
///
/// Distance is used for ordering only and is deliberately not part of
/// the projection.
#[derive(Debug, Clone, Serialize)]
pub struct AccidentSummary {
    pub id: i64,
    pub year: i16,
    pub month: i8,
    #[serde(rename = "accidentType")]
    pub accident_type: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
}

/// Proximity search parameters.
#[derive(Debug, Clone, Copy)]
pub struct NearbyQuery {
    pub year: i16,
    pub month: i8,
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

/// A cached geocoding result keyed by the original place name.
///
/// `raw_json` doubles as the cache-presence sentinel: a non-empty value
/// means the provider was already queried for this name, even if the
/// lookup found nothing (negative cache).
#[derive(Debug, Clone, Default)]
pub struct GeoLocationRecord {
    pub id: i64,
    pub place_name: String,
    pub formatted_address: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub admin_area_level1: Option<String>,
    pub admin_area_level2: Option<String>,
    pub admin_area_level3: Option<String>,
    pub route: Option<String>,
    pub street_number: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Provider precision classifier (`ROOFTOP`, `APPROXIMATE`, ...).
    pub location_type: Option<String>,
    pub place_id: Option<String>,
    pub partial_match: Option<bool>,
    /// Comma-joined provider place types.
    pub types: Option<String>,
    /// Raw provider response payload; non-empty means "already queried".
    pub raw_json: Option<String>,
}

/// A procurement tender row scraped from the government tender site.
///
/// `tpam_pk` is the external system's primary key and the crawl dedup
/// key; rows whose key already exists are never touched again.
#[derive(Debug, Clone)]
pub struct TenderRecord {
    /// External primary key extracted from the detail URL.
    pub tpam_pk: String,
    pub category: Option<String>,
    pub case_no: Option<String>,
    /// Case number with the correction-notice suffix stripped.
    pub case_no_init: Option<String>,
    pub name: Option<String>,
    pub notice_date: Option<NaiveDate>,
    pub bid_deadline: Option<NaiveDate>,
    pub budget_amount: Option<f64>,
    pub detail_url: Option<String>,
    /// Reference to the agency's [`GeoLocationRecord`].
    pub geo_location_id: Option<i64>,
}

/// Lookup key of a usage-quota ledger row for one tracking day.
///
/// Optional parts are normalized to empty strings in storage so the
/// uniqueness constraint covers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaKey {
    pub provider: String,
    pub api_name: String,
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
}

impl QuotaKey {
    #[must_use]
    pub fn new(provider: &str, api_name: &str) -> Self {
        Self {
            provider: provider.to_owned(),
            api_name: api_name.to_owned(),
            client_id: None,
            ip_address: None,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_owned());
        self
    }

    #[must_use]
    pub fn with_ip_address(mut self, ip: &str) -> Self {
        self.ip_address = Some(ip.to_owned());
        self
    }
}

/// One usage-quota ledger row.
#[derive(Debug, Clone)]
pub struct QuotaRow {
    pub id: i64,
    pub provider: String,
    pub api_name: String,
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Tracking day (UTC).
    pub date: NaiveDate,
    /// Tracking hour (0-23) at creation time.
    pub hour: Option<i8>,
    pub usage_count: i32,
    pub limit_per_day: i32,
    pub limit_per_hour: Option<i32>,
    /// Non-null means the key is blocked until this instant (UTC).
    pub blocked_until: Option<chrono::DateTime<chrono::Utc>>,
}

/// Outcome of a quota consumption attempt.
///
/// Both `false` flags mean the call was rejected for quota exhaustion
/// without an active block; `blocked` distinguishes the abuse block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub blocked: bool,
}

/// Trigger payload for the tender crawler.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlRequest {
    /// ROC year to crawl, e.g. `114` for 2025.
    #[serde(rename = "timeRange")]
    pub time_range: i32,
    /// Tender search keywords; one crawl pass runs per keyword.
    #[serde(rename = "querySentence", default = "default_query_sentence")]
    pub query_sentence: Vec<String>,
}

/// Default tender search keywords (public-works vocabulary).
#[must_use]
pub fn default_query_sentence() -> Vec<String> {
    [
        "道路",
        "橋梁",
        "捷運",
        "污水",
        "排水",
        "管線",
        "建設",
        "工程",
        "新建",
        "整建",
        "擴建",
        "改善",
        "下水道",
        "停車場",
        "社會住宅",
        "公共設施",
        "堤防",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}
