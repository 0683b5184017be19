#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Flexible parsing for dirty civic-dataset text.
//!
//! Police CSV exports and scraped tender pages mix absolute and
//! ROC-calendar dates, fullwidth digits, compact `HHmm` times, and
//! stray BOM/zero-width characters. Every function here is total:
//! bad input yields `None`, never a panic or an error value.
//!
//! ROC ("Republic of China") years are offset from the common era by
//! 1911. Any 2-3 digit leading year component is treated as a ROC year;
//! this is a deliberate disambiguation rule for this domain, not a
//! general heuristic.

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;

/// Separator or unit-marker date form: `2024-01-15`, `114/11/3`,
/// `0114.11.03`, `114年11月3日`.
static DATE_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<y>\d{1,4})[-/.年](?P<m>\d{1,2})[-/.月](?P<d>\d{1,2})日?$")
        .expect("invalid date regex")
});

/// Any run of digits, for last-resort date extraction.
static DIGIT_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("invalid digit regex"));

/// Converts a ROC year to an absolute year by adding 1911.
///
/// Years already at or above 1911 are assumed absolute and returned
/// unchanged.
#[must_use]
pub const fn roc_to_ad(year: i32) -> i32 {
    if year >= 1911 { year } else { year + 1911 }
}

/// Cleans a raw field: trims whitespace, surrounding quotes, BOM and
/// zero-width characters, folds fullwidth digits to ASCII, and collapses
/// internal whitespace runs to single spaces.
#[must_use]
pub fn normalize(input: &str) -> String {
    let trimmed = input
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{FEFF}' | '\u{200B}'));

    let mut out = String::with_capacity(trimmed.len());
    let mut last_was_space = false;
    for ch in trimmed.chars() {
        if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        if ('０'..='９').contains(&ch) {
            // Fullwidth digit -> ASCII.
            let offset = u32::from(ch) - u32::from('０');
            if let Some(ascii) = char::from_u32(u32::from('0') + offset) {
                out.push(ascii);
                continue;
            }
        }
        out.push(ch);
    }
    out.trim_end().to_owned()
}

/// Parses a date from compact, separated, ROC, or free-form text.
///
/// Tried in order:
///
/// 1. 8-digit compact `YYYYMMDD`.
/// 2. Separator / unit-marker forms (`-`, `/`, `.`, `年月日`). A leading
///    year component of 2-3 significant digits (leading zeros stripped,
///    so `0114` counts) is read as a ROC year and shifted by +1911.
/// 3. Digit-run extraction for noisy text such as `民國114年10月1日`;
///    a first run below 1000 is again treated as ROC.
///
/// Calendar validity (month 1-12, day within the month) is enforced by
/// construction.
#[must_use]
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let s = normalize(input);
    if s.is_empty() {
        return None;
    }

    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        let year: i32 = s.get(..4)?.parse().ok()?;
        let month: u32 = s.get(4..6)?.parse().ok()?;
        let day: u32 = s.get(6..8)?.parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    if let Some(caps) = DATE_PARTS.captures(&s) {
        let year_token = caps.name("y")?.as_str();
        let mut year: i32 = year_token.parse().ok()?;
        // Significant digits decide the calendar: 2-3 means ROC.
        let significant = year_token.trim_start_matches('0');
        if significant.is_empty() {
            return None;
        }
        if significant.len() <= 3 {
            year = roc_to_ad(year);
        }
        let month: u32 = caps.name("m")?.as_str().parse().ok()?;
        let day: u32 = caps.name("d")?.as_str().parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    // Last resort: pull out the first three digit runs.
    let runs: Vec<&str> = DIGIT_RUNS.find_iter(&s).map(|m| m.as_str()).collect();
    if runs.len() >= 3 {
        let mut year: i32 = runs[0].parse().ok()?;
        if year < 1000 {
            year = roc_to_ad(year);
        }
        let month: u32 = runs[1].parse().ok()?;
        let day: u32 = runs[2].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    None
}

/// Parses a time from compact `HHmm`/`HHmmss`, colon-delimited, or noisy
/// text. Rejects hour >= 24 and minute/second >= 60.
#[must_use]
pub fn parse_time(input: &str) -> Option<NaiveTime> {
    let s = normalize(input);
    if s.is_empty() {
        return None;
    }

    if s.bytes().all(|b| b.is_ascii_digit()) && s.len() <= 6 {
        return parse_compact_time(&s);
    }

    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 2 || parts.len() == 3 {
            let hour: u32 = parts[0].trim().parse().ok()?;
            let minute: u32 = parts[1].trim().parse().ok()?;
            let second: u32 = if parts.len() == 3 {
                parts[2].trim().parse().ok()?
            } else {
                0
            };
            return NaiveTime::from_hms_opt(hour, minute, second);
        }
    }

    // Strip everything but digits and retry the compact forms.
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 4 || digits.len() == 6 {
        return parse_compact_time(&digits);
    }

    None
}

fn parse_compact_time(digits: &str) -> Option<NaiveTime> {
    // Bare integers shorter than 4 digits are zero-padded, so "830"
    // reads as 08:30.
    let padded = if digits.len() < 4 {
        format!("{:0>4}", digits.parse::<u32>().ok()?)
    } else {
        digits.to_owned()
    };

    let hour: u32 = padded.get(..2)?.parse().ok()?;
    let minute: u32 = padded.get(2..4)?.parse().ok()?;
    let second: u32 = if padded.len() >= 6 {
        padded.get(4..6)?.parse().ok()?
    } else {
        0
    };
    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Parses a locale-invariant decimal, rounded to 8 fractional digits.
///
/// Thousands separators are tolerated. Blank or non-numeric input
/// yields `None`.
#[must_use]
pub fn parse_decimal(input: &str) -> Option<f64> {
    let s = normalize(input).replace(',', "");
    if s.is_empty() {
        return None;
    }
    let value: f64 = s.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some((value * 1e8).round() / 1e8)
}

/// Parses a small integer field (e.g. the year column of the accident CSV).
#[must_use]
pub fn parse_i16(input: &str) -> Option<i16> {
    normalize(input).parse().ok()
}

/// Parses a tiny integer field (e.g. the month column).
#[must_use]
pub fn parse_i8(input: &str) -> Option<i8> {
    normalize(input).parse().ok()
}

/// Normalizes free text and truncates it to `max_len` characters.
///
/// Returns `None` when the cleaned text is empty.
#[must_use]
pub fn normalize_text(input: &str, max_len: usize) -> Option<String> {
    let s = normalize(input);
    if s.is_empty() {
        return None;
    }
    if s.chars().count() > max_len {
        return Some(s.chars().take(max_len).collect());
    }
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_date() {
        assert_eq!(
            parse_date("20240115"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
    }

    #[test]
    fn parses_separated_absolute_date() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15);
        assert_eq!(parse_date("2024-01-15"), expected);
        assert_eq!(parse_date("2024/1/15"), expected);
        assert_eq!(parse_date("2024.01.15"), expected);
    }

    #[test]
    fn roc_year_shifts_by_1911() {
        let expected = NaiveDate::from_ymd_opt(2025, 11, 3);
        assert_eq!(parse_date("114/11/03"), expected);
        assert_eq!(parse_date("114-11-3"), expected);
        assert_eq!(parse_date("0114-11-03"), expected);
    }

    #[test]
    fn parses_unit_marker_date() {
        assert_eq!(
            parse_date("114年11月3日"),
            NaiveDate::from_ymd_opt(2025, 11, 3)
        );
        assert_eq!(
            parse_date("民國114年10月1日"),
            NaiveDate::from_ymd_opt(2025, 10, 1)
        );
    }

    #[test]
    fn parses_fullwidth_digits() {
        assert_eq!(
            parse_date("２０２４-０１-１５"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
    }

    #[test]
    fn rejects_invalid_calendar_dates() {
        assert!(parse_date("20240230").is_none());
        assert!(parse_date("2024-13-01").is_none());
        assert!(parse_date("garbage").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn parses_compact_times() {
        assert_eq!(parse_time("0830"), NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(parse_time("830"), NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(parse_time("083015"), NaiveTime::from_hms_opt(8, 30, 15));
    }

    #[test]
    fn parses_colon_times() {
        assert_eq!(parse_time("8:30"), NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(parse_time("08:30:15"), NaiveTime::from_hms_opt(8, 30, 15));
    }

    #[test]
    fn rejects_out_of_range_times() {
        assert!(parse_time("2460").is_none());
        assert!(parse_time("0860").is_none());
        assert!(parse_time("25:00").is_none());
        assert!(parse_time("").is_none());
    }

    #[test]
    fn parses_decimal_to_eight_digits() {
        assert_eq!(parse_decimal("121.123456789"), Some(121.123_456_79));
        assert_eq!(parse_decimal("25.0"), Some(25.0));
        assert_eq!(parse_decimal("-87.6298"), Some(-87.6298));
        assert_eq!(parse_decimal("1,234.5"), Some(1234.5));
    }

    #[test]
    fn rejects_bad_decimals() {
        assert!(parse_decimal("").is_none());
        assert!(parse_decimal("abc").is_none());
        assert!(parse_decimal("NaN").is_none());
    }

    #[test]
    fn parses_integer_fields() {
        assert_eq!(parse_i16("2024"), Some(2024));
        assert_eq!(parse_i16(" 2024 "), Some(2024));
        assert_eq!(parse_i8("7"), Some(7));
        assert!(parse_i16("abc").is_none());
    }

    #[test]
    fn normalizes_text() {
        assert_eq!(
            normalize_text("  台北市  中山區 ", 100),
            Some("台北市 中山區".to_owned())
        );
        assert_eq!(normalize_text("\u{FEFF}hello", 100), Some("hello".to_owned()));
        assert_eq!(normalize_text("abcdef", 3), Some("abc".to_owned()));
        assert!(normalize_text("   ", 10).is_none());
    }

    #[test]
    fn roc_conversion_is_idempotent_above_epoch() {
        assert_eq!(roc_to_ad(114), 2025);
        assert_eq!(roc_to_ad(2025), 2025);
    }
}
