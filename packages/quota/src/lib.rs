#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Usage-quota and anti-scraping throttle ledger.
//!
//! Tracks per-provider/per-API/per-caller daily usage and blocks keys
//! that burn through the abuse threshold. A rejection is a defined
//! outcome ([`ConsumeOutcome`]), not an error; callers translate it to
//! an HTTP 429 or simply skip the external call.
//!
//! The lookup-then-mutate sequence runs inside a transaction on the
//! shared connection, whose mutex already serializes concurrent
//! callers, so two requests can never both pass the threshold check on
//! a stale count.

use chrono::{DateTime, Duration, Timelike as _, Utc};
use civic_map_database::{DbError, quota};
use civic_map_models::{ConsumeOutcome, QuotaKey};
use duckdb::Connection;

pub use civic_map_database::quota::clear_expired_blocks;

/// Errors that can occur in the quota ledger.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The underlying storage operation failed.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<duckdb::Error> for QuotaError {
    fn from(e: duckdb::Error) -> Self {
        Self::Database(DbError::from(e))
    }
}

/// Limits applied to one consumption attempt.
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    /// Maximum calls per tracking day.
    pub daily_limit: i32,
    /// Recorded for monitoring; not enforced (preserved behavior of the
    /// original ledger).
    pub hourly_limit: Option<i32>,
    /// Usage count that triggers the self-inflicted abuse block.
    pub block_threshold: i32,
    /// Block duration once the threshold is hit.
    pub block_minutes: i64,
}

/// Attempts to consume one unit of quota for `key` at `now`.
///
/// Creates the day's row lazily, rejects while a block is active or the
/// daily limit is exhausted, otherwise increments usage and, when the
/// new count reaches the block threshold, sets `blocked_until`.
///
/// # Errors
///
/// Returns [`QuotaError`] if storage fails; quota rejection is reported
/// through the returned [`ConsumeOutcome`], never as an error.
pub fn try_consume(
    conn: &Connection,
    key: &QuotaKey,
    user_agent: Option<&str>,
    limits: &QuotaLimits,
    now: DateTime<Utc>,
) -> Result<ConsumeOutcome, QuotaError> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    match consume_inner(conn, key, user_agent, limits, now) {
        Ok(outcome) => {
            conn.execute_batch("COMMIT")?;
            Ok(outcome)
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK")?;
            Err(e)
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn consume_inner(
    conn: &Connection,
    key: &QuotaKey,
    user_agent: Option<&str>,
    limits: &QuotaLimits,
    now: DateTime<Utc>,
) -> Result<ConsumeOutcome, QuotaError> {
    let today = now.date_naive();
    let hour = now.hour() as i8;

    let row = match quota::find(conn, key, today)? {
        Some(row) => row,
        None => {
            quota::insert(
                conn,
                key,
                user_agent,
                today,
                hour,
                limits.daily_limit,
                limits.hourly_limit,
                now,
            )?;
            quota::find(conn, key, today)?.ok_or_else(|| {
                DbError::Conversion {
                    message: format!(
                        "quota row missing after insert for {}/{}",
                        key.provider, key.api_name
                    ),
                }
            })?
        }
    };

    if let Some(until) = row.blocked_until {
        if until > now {
            log::warn!(
                "{}/{} blocked until {until} for {:?}",
                key.provider,
                key.api_name,
                key.ip_address
            );
            return Ok(ConsumeOutcome {
                allowed: false,
                blocked: true,
            });
        }
    }

    if row.usage_count >= row.limit_per_day {
        log::warn!(
            "{}/{} daily limit ({}) exhausted for {:?}",
            key.provider,
            key.api_name,
            row.limit_per_day,
            key.ip_address
        );
        return Ok(ConsumeOutcome {
            allowed: false,
            blocked: false,
        });
    }

    let new_count = row.usage_count + 1;
    let blocked_until = if new_count >= limits.block_threshold {
        let until = now + Duration::minutes(limits.block_minutes);
        log::warn!(
            "burst detected on {}/{}, blocking {:?} for {} minutes",
            key.provider,
            key.api_name,
            key.ip_address,
            limits.block_minutes
        );
        Some(until)
    } else {
        row.blocked_until
    };

    quota::update_usage(conn, row.id, new_count, blocked_until, now)?;

    log::debug!(
        "{}/{} usage {new_count}/{} on {}",
        key.provider,
        key.api_name,
        row.limit_per_day,
        today.format("%Y-%m-%d"),
    );

    Ok(ConsumeOutcome {
        allowed: true,
        blocked: false,
    })
}

/// Clears expired blocks across the whole ledger and logs the count.
///
/// Idempotent, argument-less apart from the clock; intended for an
/// external hourly scheduler.
///
/// # Errors
///
/// Returns [`QuotaError`] if storage fails.
pub fn unblock_expired(conn: &Connection) -> Result<usize, QuotaError> {
    let cleared = clear_expired_blocks(conn, Utc::now())?;
    if cleared > 0 {
        log::info!("cleared {cleared} expired quota blocks");
    }
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;
    use civic_map_database::open_in_memory;

    fn key() -> QuotaKey {
        QuotaKey::new("google", "geocode").with_client_id("civic-map-api")
    }

    fn limits(daily: i32, threshold: i32) -> QuotaLimits {
        QuotaLimits {
            daily_limit: daily,
            hourly_limit: Some(10_000),
            block_threshold: threshold,
            block_minutes: 30,
        }
    }

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap()
    }

    #[test]
    fn usage_grows_by_one_per_call() {
        let conn = open_in_memory().unwrap();
        for _ in 0..5 {
            let outcome = try_consume(&conn, &key(), None, &limits(100, 1000), instant()).unwrap();
            assert!(outcome.allowed);
        }

        let row = quota::find(&conn, &key(), instant().date_naive())
            .unwrap()
            .unwrap();
        assert_eq!(row.usage_count, 5);
    }

    #[test]
    fn daily_limit_rejects_without_block() {
        let conn = open_in_memory().unwrap();
        let lim = limits(3, 1000);
        for _ in 0..3 {
            assert!(try_consume(&conn, &key(), None, &lim, instant()).unwrap().allowed);
        }

        let outcome = try_consume(&conn, &key(), None, &lim, instant()).unwrap();
        assert!(!outcome.allowed);
        assert!(!outcome.blocked);
    }

    #[test]
    fn threshold_triggers_block_on_next_call() {
        let conn = open_in_memory().unwrap();
        let lim = limits(100, 2);

        // Calls 1 and 2 are allowed; call 2 reaches the threshold.
        assert!(try_consume(&conn, &key(), None, &lim, instant()).unwrap().allowed);
        assert!(try_consume(&conn, &key(), None, &lim, instant()).unwrap().allowed);

        // Call 3 is rejected as blocked even though the limit has room.
        let outcome = try_consume(&conn, &key(), None, &lim, instant()).unwrap();
        assert!(!outcome.allowed);
        assert!(outcome.blocked);
    }

    #[test]
    fn block_expires_by_timestamp() {
        let conn = open_in_memory().unwrap();
        let lim = limits(100, 1);
        assert!(try_consume(&conn, &key(), None, &lim, instant()).unwrap().allowed);

        let later = instant() + Duration::minutes(31);
        let outcome = try_consume(&conn, &key(), None, &lim, later).unwrap();
        // Threshold 1 re-blocks immediately on this consumption, but the
        // expired block itself no longer rejects the call.
        assert!(outcome.allowed);
    }

    #[test]
    fn sweep_clears_expired_blocks_only() {
        let conn = open_in_memory().unwrap();
        let lim = limits(100, 1);
        try_consume(&conn, &key(), None, &lim, instant()).unwrap();

        assert_eq!(
            clear_expired_blocks(&conn, instant() + Duration::minutes(31)).unwrap(),
            1
        );
        assert_eq!(
            clear_expired_blocks(&conn, instant() + Duration::minutes(31)).unwrap(),
            0
        );
    }

    #[test]
    fn separate_keys_do_not_share_counters() {
        let conn = open_in_memory().unwrap();
        let lim = limits(1, 1000);
        let other = QuotaKey::new("google", "geocode").with_ip_address("203.0.113.9");

        assert!(try_consume(&conn, &key(), None, &lim, instant()).unwrap().allowed);
        assert!(try_consume(&conn, &other, None, &lim, instant()).unwrap().allowed);
        assert!(!try_consume(&conn, &key(), None, &lim, instant()).unwrap().allowed);
    }
}
