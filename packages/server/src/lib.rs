#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the civic map backend.
//!
//! Exposes the accident proximity search, the bulk CSV import, the
//! tender crawler trigger, the geocode passthrough, and the two
//! scheduler entry points (coordinate fill, quota unblock). Every
//! response is wrapped in the `{success, message, result}` envelope;
//! public routes pass through a per-IP throttle backed by the quota
//! ledger.

mod handlers;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use civic_map_database::{SharedDb, into_shared};
use civic_map_geocoder::GeocodeConfig;
use civic_map_quota::QuotaLimits;
use civic_map_scraper::CrawlConfig;
use serde::Serialize;

/// Upload cap for the CSV import route.
const MAX_PAYLOAD_BYTES: usize = 200 * 1024 * 1024;

/// Per-IP limits applied to public routes.
const THROTTLE_LIMITS: QuotaLimits = QuotaLimits {
    daily_limit: 5000,
    hourly_limit: Some(500),
    block_threshold: 1000,
    block_minutes: 30,
};

/// Shared application state.
pub struct AppState {
    /// Shared database connection.
    pub db: SharedDb,
    /// HTTP client reused across geocode and crawl requests.
    pub http: reqwest::Client,
    /// Geocoding provider settings.
    pub geocode: GeocodeConfig,
    /// Tender crawler settings.
    pub crawl: CrawlConfig,
}

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: Option<String>,
    pub result: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            message: None,
            result: Some(result),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            result: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Builds the application state from environment variables.
///
/// # Panics
///
/// Panics if the database cannot be opened or the HTTP client cannot be
/// built.
#[must_use]
pub fn state_from_env() -> AppState {
    let db_path =
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| "data/civic_map.duckdb".to_owned());
    let conn = civic_map_database::open(std::path::Path::new(&db_path))
        .expect("Failed to open database");

    let mut geocode =
        GeocodeConfig::new(std::env::var("GOOGLE_MAPS_API_KEY").unwrap_or_default());
    geocode.daily_limit = env_or("GEOCODE_DAILY_LIMIT", geocode.daily_limit);
    geocode.request_delay_ms = env_or("GEOCODE_REQUEST_DELAY_MS", geocode.request_delay_ms);

    let mut crawl = CrawlConfig::default();
    if let Ok(base_url) = std::env::var("PCC_BASE_URL") {
        crawl.base_url = base_url;
    }

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("Failed to build HTTP client");

    AppState {
        db: into_shared(conn),
        http,
        geocode,
        crawl,
    }
}

/// Starts the civic map API server.
///
/// This is a regular async function — the caller provides the async
/// runtime (e.g. via `#[actix_web::main]`).
///
/// # Errors
///
/// Returns an error if the HTTP server fails to bind or encounters a
/// runtime error.
///
/// # Panics
///
/// Panics if the database cannot be opened.
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let state = web::Data::new(state_from_env());

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_owned());
    let port: u16 = env_or("PORT", 8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(MAX_PAYLOAD_BYTES))
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(handlers::health))
                    .route("/accidents/nearby", web::get().to(handlers::nearby))
                    .route("/accidents/import", web::post().to(handlers::import))
                    .route("/tenders/crawler", web::post().to(handlers::crawler))
                    .route("/search/nearby", web::get().to(handlers::search_nearby))
                    .route(
                        "/jobs/fill-coordinates",
                        web::post().to(handlers::fill_coordinates),
                    )
                    .route(
                        "/jobs/unblock-expired",
                        web::post().to(handlers::unblock_expired),
                    ),
            )
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
