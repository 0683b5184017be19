//! HTTP handler functions for the civic map API.

use actix_web::{HttpRequest, HttpResponse, web};
use civic_map_database::acquire;
use civic_map_models::{CrawlRequest, NearbyQuery, QuotaKey};
use civic_map_quota::try_consume;
use serde::Deserialize;

use crate::{ApiResponse, AppState, THROTTLE_LIMITS};

const THROTTLE_PROVIDER: &str = "civic_map_api";
const THROTTLE_API: &str = "api";

/// Checks the per-IP throttle. Returns the rejection response when the
/// caller is over limit or blocked.
fn throttle(state: &AppState, req: &HttpRequest) -> Option<HttpResponse> {
    let ip = req
        .peer_addr()
        .map_or_else(|| "unknown".to_owned(), |addr| addr.ip().to_string());
    let user_agent = req
        .headers()
        .get("User-Agent")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let key = QuotaKey::new(THROTTLE_PROVIDER, THROTTLE_API).with_ip_address(&ip);
    let outcome = {
        let conn = acquire(&state.db);
        try_consume(
            &conn,
            &key,
            user_agent.as_deref(),
            &THROTTLE_LIMITS,
            chrono::Utc::now(),
        )
    };

    match outcome {
        Ok(outcome) if outcome.allowed => None,
        Ok(outcome) => {
            let message = if outcome.blocked {
                "Temporarily blocked for excessive requests"
            } else {
                "Daily request limit reached"
            };
            Some(HttpResponse::TooManyRequests().json(ApiResponse::<()>::fail(message)))
        }
        Err(e) => {
            log::error!("throttle check failed: {e}");
            Some(
                HttpResponse::InternalServerError()
                    .json(ApiResponse::<()>::fail("Internal error")),
            )
        }
    }
}

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

#[derive(Debug, Deserialize)]
pub struct NearbyParams {
    pub year: i16,
    pub month: i8,
    pub lat: f64,
    pub lon: f64,
    #[serde(rename = "radiusKm", default = "default_radius_km")]
    pub radius_km: f64,
}

const fn default_radius_km() -> f64 {
    30.0
}

/// `GET /api/accidents/nearby`
///
/// Accidents within `radiusKm` of the query point for the given year
/// and month, nearest first.
pub async fn nearby(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<NearbyParams>,
) -> HttpResponse {
    if let Some(rejection) = throttle(&state, &req) {
        return rejection;
    }

    let query = NearbyQuery {
        year: params.year,
        month: params.month,
        lat: params.lat,
        lon: params.lon,
        radius_km: params.radius_km,
    };

    let result = {
        let conn = acquire(&state.db);
        civic_map_search::find_nearby(&conn, &query)
    };

    match result {
        Ok(hits) => HttpResponse::Ok().json(ApiResponse::ok(hits)),
        Err(civic_map_search::SearchError::InvalidQuery { message }) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::fail(message))
        }
        Err(e) => {
            log::error!("nearby search failed: {e}");
            HttpResponse::InternalServerError().json(ApiResponse::<()>::fail("Search failed"))
        }
    }
}

/// `POST /api/accidents/import`
///
/// Bulk CSV import; the body is the raw CSV file. Responds with the
/// number of rows written after dedup.
pub async fn import(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if let Some(rejection) = throttle(&state, &req) {
        return rejection;
    }

    let result = {
        let conn = acquire(&state.db);
        civic_map_ingest::import_from_csv(&conn, body.as_ref())
    };

    match result {
        Ok(outcome) => HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({
            "count": outcome.written,
            "raw": outcome.raw,
            "deduped": outcome.deduped,
            "skipped": outcome.skipped,
        }))),
        Err(e @ civic_map_ingest::IngestError::MissingColumn { .. }) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::fail(e.to_string()))
        }
        Err(e) => {
            log::error!("import failed: {e}");
            HttpResponse::InternalServerError().json(ApiResponse::<()>::fail("Import failed"))
        }
    }
}

/// `POST /api/tenders/crawler`
///
/// Triggers a tender crawl for the requested ROC year and keywords.
pub async fn crawler(
    state: web::Data<AppState>,
    req: HttpRequest,
    request: web::Json<CrawlRequest>,
) -> HttpResponse {
    if let Some(rejection) = throttle(&state, &req) {
        return rejection;
    }

    match civic_map_scraper::crawl(&state.http, &state.db, &state.geocode, &state.crawl, &request)
        .await
    {
        Ok(count) => {
            HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "count": count })))
        }
        Err(e @ civic_map_scraper::CrawlError::InvalidYear { .. }) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::fail(e.to_string()))
        }
        Err(e) => {
            log::error!("crawl failed: {e}");
            HttpResponse::InternalServerError().json(ApiResponse::<()>::fail("Crawl failed"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddressParams {
    pub address: String,
}

/// `GET /api/search/nearby`
///
/// Geocode passthrough: resolves a free-text address to coordinates.
pub async fn search_nearby(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<AddressParams>,
) -> HttpResponse {
    if let Some(rejection) = throttle(&state, &req) {
        return rejection;
    }

    use civic_map_geocoder::{GeocodeError, Resolution};

    match civic_map_geocoder::resolve(&state.http, &state.db, &state.geocode, &params.address)
        .await
    {
        Ok(Resolution::Found {
            latitude,
            longitude,
            ..
        }) => HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({
            "lat": latitude,
            "lng": longitude,
        }))),
        Ok(Resolution::NotFound) => {
            HttpResponse::Ok().json(ApiResponse::<()>::fail("No match for address"))
        }
        Ok(Resolution::QuotaDenied) => HttpResponse::TooManyRequests()
            .json(ApiResponse::<()>::fail("Geocoding quota exhausted")),
        Err(GeocodeError::BlankPlaceName) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::fail("Address is blank"))
        }
        Err(e) => {
            log::error!("geocode failed: {e}");
            HttpResponse::InternalServerError().json(ApiResponse::<()>::fail("Geocoding failed"))
        }
    }
}

/// `POST /api/jobs/fill-coordinates`
///
/// Scheduler entry point: resolves every cached place name that has no
/// provider payload yet.
pub async fn fill_coordinates(state: web::Data<AppState>) -> HttpResponse {
    match civic_map_geocoder::fill_missing_coordinates(&state.http, &state.db, &state.geocode)
        .await
    {
        Ok(outcome) => HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({
            "success": outcome.success,
            "total": outcome.total,
        }))),
        Err(e) => {
            log::error!("coordinate fill failed: {e}");
            HttpResponse::InternalServerError().json(ApiResponse::<()>::fail("Fill failed"))
        }
    }
}

/// `POST /api/jobs/unblock-expired`
///
/// Scheduler entry point: clears expired quota blocks.
pub async fn unblock_expired(state: web::Data<AppState>) -> HttpResponse {
    let result = {
        let conn = acquire(&state.db);
        civic_map_quota::unblock_expired(&conn)
    };

    match result {
        Ok(cleared) => {
            HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "cleared": cleared })))
        }
        Err(e) => {
            log::error!("unblock sweep failed: {e}");
            HttpResponse::InternalServerError().json(ApiResponse::<()>::fail("Sweep failed"))
        }
    }
}
