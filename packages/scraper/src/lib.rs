#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Paginated crawler for the government procurement tender site.
//!
//! One crawl pass runs per search keyword: fetch a listing page (with a
//! bounded retry loop), parse the results table, store the rows whose
//! external key is new, then follow the "next page" link until it
//! disappears or its page-number parameter stops advancing. A rotating
//! user agent and randomized inter-page delays keep the pacing
//! human-like. Agency names found along the way are pushed through the
//! geocode resolver; a resolution failure never aborts the crawl.

pub mod listing;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::NaiveDate;
use civic_map_database::{DbError, SharedDb, acquire, geolocations, tenders};
use civic_map_geocoder::{GeocodeConfig, Resolution};
use civic_map_models::{CrawlRequest, TenderRecord};
use civic_map_parse::roc_to_ad;
use listing::{ListingPage, ListingRow};
use rand::Rng as _;

const SEARCH_PATH: &str = "/prkms/tender/common/proctrg/readTenderProctrg";
const REFERER_PATH: &str = "/prkms/tender/common/proctrg/indexTenderProctrg";
const PAGE_PARAM: &str = "d-49738-p";

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
];

const MAX_FETCH_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: std::ops::Range<u64> = 3000..7000;
const PAGE_DELAY_MS: std::ops::Range<u64> = 2000..5000;

/// Crawler settings.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Tender site origin, without a trailing slash.
    pub base_url: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            base_url: "https://web.pcc.gov.tw".to_owned(),
        }
    }
}

/// Errors that can abort a crawl.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// The requested year does not map to a calendar window.
    #[error("Invalid crawl year: {year}")]
    InvalidYear {
        /// The offending ROC year from the request.
        year: i32,
    },

    /// Storage failed.
    #[error(transparent)]
    Database(#[from] DbError),
}

/// Crawls the tender site for the requested ROC year, one pass per
/// search keyword. Returns the number of newly stored tender rows.
///
/// # Errors
///
/// Returns [`CrawlError`] when the year is invalid or storage fails.
/// Fetch failures end the current keyword's pass after the retry budget
/// is spent; they do not abort the crawl.
pub async fn crawl(
    client: &reqwest::Client,
    db: &SharedDb,
    geocode_config: &GeocodeConfig,
    config: &CrawlConfig,
    request: &CrawlRequest,
) -> Result<usize, CrawlError> {
    let year = roc_to_ad(request.time_range);
    let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or(CrawlError::InvalidYear {
        year: request.time_range,
    })?;
    let end = NaiveDate::from_ymd_opt(year, 12, 31).ok_or(CrawlError::InvalidYear {
        year: request.time_range,
    })?;

    log::info!(
        "tender crawl for {} ({} keywords)",
        year,
        request.query_sentence.len()
    );

    let mut total = 0;
    for keyword in &request.query_sentence {
        total += crawl_keyword(client, db, geocode_config, config, keyword, start, end).await?;
    }

    log::info!("tender crawl finished with {total} new rows");
    Ok(total)
}

async fn crawl_keyword(
    client: &reqwest::Client,
    db: &SharedDb,
    geocode_config: &GeocodeConfig,
    config: &CrawlConfig,
    keyword: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<usize, CrawlError> {
    let user_agent = USER_AGENTS[rand::thread_rng().gen_range(0..USER_AGENTS.len())];

    let mut known_keys = {
        let conn = acquire(db);
        tenders::existing_keys(&conn)?
    };

    let mut page = 1_u32;
    let mut total = 0;

    loop {
        let Some(html) =
            fetch_page(client, config, keyword, start, end, page, user_agent).await
        else {
            log::error!("giving up on keyword '{keyword}' at page {page}");
            break;
        };

        let Some(listing) = listing::parse_listing(&html, &config.base_url) else {
            log::warn!("no results table for '{keyword}' on page {page}");
            break;
        };

        total += store_page(db, geocode_config, client, &listing, &mut known_keys).await?;

        let Some(href) = listing.next_href.as_deref() else {
            log::debug!("keyword '{keyword}' exhausted after {page} pages");
            break;
        };

        // The next link must carry a strictly larger page number;
        // anything else means the paginator is stuck.
        match advance_page(page, href) {
            Some(next) => {
                page = next;
                let wait = rand::thread_rng().gen_range(PAGE_DELAY_MS);
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            None => {
                log::warn!("pagination stuck at page {page} for '{keyword}'");
                break;
            }
        }
    }

    Ok(total)
}

/// Page number carried by a pagination href's page parameter.
fn page_param(href: &str) -> Option<u32> {
    let rest = href.split_once(&format!("{PAGE_PARAM}="))?.1;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Returns the next page number iff the link actually advances past
/// `current`.
fn advance_page(current: u32, href: &str) -> Option<u32> {
    page_param(href).filter(|next| *next > current)
}

/// Fetches one listing page, retrying with a randomized backoff.
/// Returns `None` once the retry budget is spent.
async fn fetch_page(
    client: &reqwest::Client,
    config: &CrawlConfig,
    keyword: &str,
    start: NaiveDate,
    end: NaiveDate,
    page: u32,
    user_agent: &str,
) -> Option<String> {
    let url = format!("{}{SEARCH_PATH}", config.base_url);
    let referer = format!("{}{REFERER_PATH}", config.base_url);
    let page_number = page.to_string();
    let start_date = start.format("%Y/%m/%d").to_string();
    let end_date = end.format("%Y/%m/%d").to_string();

    for attempt in 1..=MAX_FETCH_ATTEMPTS {
        let response = client
            .get(&url)
            .header("User-Agent", user_agent)
            .header("Accept-Language", "zh-TW,zh;q=0.9,en;q=0.8")
            .header("Referer", &referer)
            .query(&[
                ("pageSize", "100"),
                ("firstSearch", "false"),
                ("searchType", "tpam"),
                ("isBinding", "N"),
                ("isLogIn", "N"),
                ("level_1", "on"),
                ("tenderStatus", "TENDER_STATUS_0"),
                ("tenderWay", "TENDER_WAY_ALL_DECLARATION"),
                ("dateType", "isDate"),
                ("tenderStartDate", &start_date),
                ("tenderEndDate", &end_date),
                ("querySentence", keyword),
                (PAGE_PARAM, &page_number),
            ])
            .send()
            .await;

        match response {
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.text().await {
                    Ok(html) => return Some(html),
                    Err(e) => log::warn!("page {page} body read failed: {e}"),
                },
                Err(e) => log::warn!("page {page} returned an error status: {e}"),
            },
            Err(e) => log::warn!("page {page} fetch attempt {attempt} failed: {e}"),
        }

        if attempt < MAX_FETCH_ATTEMPTS {
            let wait = rand::thread_rng().gen_range(RETRY_BACKOFF_MS);
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    None
}

/// Stores the novel rows of one listing page and geocodes any agency
/// that has no cached coordinates yet.
async fn store_page(
    db: &SharedDb,
    geocode_config: &GeocodeConfig,
    client: &reqwest::Client,
    listing: &ListingPage,
    known_keys: &mut BTreeSet<String>,
) -> Result<usize, CrawlError> {
    let mut records = Vec::new();

    for row in &listing.rows {
        if known_keys.contains(&row.tpam_pk) {
            continue;
        }

        let (geo_location_id, needs_geocode) = {
            let conn = acquire(db);
            let id = geolocations::insert_placeholder(&conn, &row.agency_name)?;
            (id, !geolocations::has_payload(&conn, &row.agency_name)?)
        };

        if needs_geocode {
            match civic_map_geocoder::resolve(client, db, geocode_config, &row.agency_name).await {
                Ok(Resolution::QuotaDenied) => {
                    log::warn!("geocode quota denied for agency '{}'", row.agency_name);
                }
                Ok(_) => {}
                Err(e) => log::error!("geocode failed for '{}': {e}", row.agency_name),
            }
        }

        records.push(to_record(row, geo_location_id));
        known_keys.insert(row.tpam_pk.clone());
    }

    let inserted = {
        let conn = acquire(db);
        tenders::insert_batch(&conn, &records)?
    };

    if inserted > 0 {
        log::info!("stored {inserted} new tenders");
    }
    Ok(inserted)
}

fn to_record(row: &ListingRow, geo_location_id: i64) -> TenderRecord {
    TenderRecord {
        tpam_pk: row.tpam_pk.clone(),
        category: row.category.clone(),
        case_no: row.case_no.clone(),
        case_no_init: row.case_no.as_deref().map(listing::initial_case_no),
        name: row.name.clone(),
        notice_date: row.notice_date,
        bid_deadline: row.bid_deadline,
        budget_amount: row.budget_amount,
        detail_url: Some(row.detail_url.clone()),
        geo_location_id: Some(geo_location_id),
    }
}
