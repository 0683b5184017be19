//! Tender listing page parsing.
//!
//! The procurement site renders search results as a `table#tpam.tb_01`
//! whose rows mix several facts into one cell: the case number sits
//! before a `<br>`, the tender name is either the argument of an
//! embedded `pageCode2Img("...")` script call or the link text, and the
//! detail link carries the external primary key in its `pk` query
//! parameter. Everything here is pure; the crawl loop does the I/O.

use std::sync::LazyLock;

use chrono::NaiveDate;
use civic_map_parse as parse;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static PAGE_CODE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"pageCode2Img\("(?P<name>[^"]+)"\)"#).expect("invalid name regex")
});

static DETAIL_PK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pk=([^&]+)").expect("invalid pk regex"));

static HTML_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("invalid tag regex"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("invalid CSS selector")
}

/// One extracted results row.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRow {
    pub agency_name: String,
    pub category: Option<String>,
    pub case_no: Option<String>,
    pub name: Option<String>,
    pub notice_date: Option<NaiveDate>,
    pub bid_deadline: Option<NaiveDate>,
    pub budget_amount: Option<f64>,
    /// Absolute detail-page URL.
    pub detail_url: String,
    /// External primary key from the detail URL's `pk` parameter.
    pub tpam_pk: String,
}

/// One parsed listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub rows: Vec<ListingRow>,
    /// `href` of the "next page" link, when present.
    pub next_href: Option<String>,
}

/// Parses a listing page. Returns `None` when the results table is
/// absent (empty result set, or the site bounced the request back to
/// its landing page).
#[must_use]
pub fn parse_listing(html: &str, base_url: &str) -> Option<ListingPage> {
    let document = Html::parse_document(html);
    let table = document.select(&selector("table#tpam.tb_01")).next()?;

    let row_selector = selector("tr");
    let cell_selector = selector("td");

    let mut rows = Vec::new();
    for row in table.select(&row_selector) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_selector).collect();
        // The header row has no <td> cells; short rows are notices.
        if cells.len() < 9 {
            continue;
        }
        if let Some(parsed) = parse_row(&cells, base_url) {
            rows.push(parsed);
        } else {
            log::warn!("skipping unparseable tender row");
        }
    }

    Some(ListingPage {
        rows,
        next_href: next_page_href(&document),
    })
}

fn parse_row(cells: &[ElementRef<'_>], base_url: &str) -> Option<ListingRow> {
    let agency_name = cell_text(cells[1]);
    if agency_name.is_empty() {
        return None;
    }

    let link = cells[2].select(&selector("a")).next()?;
    let detail_url = absolutize(link.attr("href")?.trim(), base_url);
    let tpam_pk = DETAIL_PK
        .captures(&detail_url)
        .map(|caps| caps[1].to_owned())?;
    if tpam_pk.is_empty() {
        return None;
    }

    let name = tender_name(link);

    Some(ListingRow {
        agency_name,
        category: non_empty(cell_text(cells[5])),
        case_no: case_number(cells[2]),
        name,
        notice_date: parse::parse_date(&cell_text(cells[6])),
        bid_deadline: parse::parse_date(&cell_text(cells[7])),
        budget_amount: parse::parse_decimal(&cell_text(cells[8])),
        detail_url,
        tpam_pk,
    })
}

/// The case number is the cell content preceding the first `<br>`, with
/// markup stripped.
fn case_number(cell: ElementRef<'_>) -> Option<String> {
    let inner = cell.inner_html();
    let before_br = inner.split("<br").next()?;
    let stripped = HTML_TAGS.replace_all(before_br, "");
    non_empty(fragment_text(&stripped))
}

/// Tender name: the `pageCode2Img("...")` script argument when present,
/// otherwise the link text.
fn tender_name(link: ElementRef<'_>) -> Option<String> {
    for script in link.select(&selector("script")) {
        let body: String = script.text().collect();
        if let Some(caps) = PAGE_CODE_NAME.captures(&body) {
            return non_empty(caps["name"].trim().to_owned());
        }
    }
    non_empty(link.text().collect::<String>().trim().to_owned())
}

/// Collapsed, entity-decoded text content of a cell.
fn cell_text(cell: ElementRef<'_>) -> String {
    parse::normalize(&cell.text().collect::<String>())
}

/// Decodes entities in an already-tag-stripped HTML fragment.
fn fragment_text(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    parse::normalize(&parsed.root_element().text().collect::<String>())
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

fn absolutize(href: &str, base_url: &str) -> String {
    if href.starts_with("http") {
        href.to_owned()
    } else {
        format!("{base_url}{href}")
    }
}

/// Finds the pagination link labelled 下一頁 ("next page").
fn next_page_href(document: &Html) -> Option<String> {
    document
        .select(&selector("span#pagelinks a"))
        .find(|link| link.text().collect::<String>().contains("下一頁"))
        .and_then(|link| link.attr("href"))
        .map(|href| href.trim().to_owned())
}

/// Strips the correction-notice suffix from a case number.
#[must_use]
pub fn initial_case_no(case_no: &str) -> String {
    case_no.replace("(更正公告)", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://web.pcc.gov.tw";

    fn page(rows: &str, pagelinks: &str) -> String {
        format!(
            "<html><body>\
             <table id=\"tpam\" class=\"tb_01\">\
             <tr><th>項次</th><th>機關名稱</th><th>標案案號</th></tr>\
             {rows}\
             </table>\
             <span id=\"pagelinks\">{pagelinks}</span>\
             </body></html>"
        )
    }

    fn row(agency: &str, case_cell: &str) -> String {
        format!(
            "<tr><td>1</td><td>{agency}</td><td>{case_cell}</td>\
             <td>-</td><td>-</td><td>工程類</td>\
             <td>114/01/10</td><td>114/02/01</td><td>1,500,000</td></tr>"
        )
    }

    #[test]
    fn extracts_a_full_row() {
        let case_cell = "113-001(更正公告)<br>\
            <a href=\"/tps/detail?pk=ABC123&amp;os=new\">\
            <script>pageCode2Img(\"道路改善工程\")</script></a>";
        let html = page(&row("臺北市政府工務局", case_cell), "");

        let listing = parse_listing(&html, BASE).unwrap();
        assert_eq!(listing.rows.len(), 1);

        let row = &listing.rows[0];
        assert_eq!(row.agency_name, "臺北市政府工務局");
        assert_eq!(row.case_no.as_deref(), Some("113-001(更正公告)"));
        assert_eq!(row.name.as_deref(), Some("道路改善工程"));
        assert_eq!(row.category.as_deref(), Some("工程類"));
        assert_eq!(row.tpam_pk, "ABC123");
        assert_eq!(row.detail_url, "https://web.pcc.gov.tw/tps/detail?pk=ABC123&os=new");
        assert_eq!(row.notice_date, NaiveDate::from_ymd_opt(2025, 1, 10));
        assert_eq!(row.bid_deadline, NaiveDate::from_ymd_opt(2025, 2, 1));
        assert_eq!(row.budget_amount, Some(1_500_000.0));
    }

    #[test]
    fn name_falls_back_to_link_text() {
        let case_cell = "113-002<br><a href=\"/tps/detail?pk=DEF456\">橋梁補強工程</a>";
        let html = page(&row("新北市政府", case_cell), "");

        let listing = parse_listing(&html, BASE).unwrap();
        assert_eq!(listing.rows[0].name.as_deref(), Some("橋梁補強工程"));
    }

    #[test]
    fn rows_without_a_detail_link_are_skipped() {
        let html = page(&row("某機關", "113-003<br>無連結"), "");
        let listing = parse_listing(&html, BASE).unwrap();
        assert!(listing.rows.is_empty());
    }

    #[test]
    fn missing_table_yields_none() {
        assert!(parse_listing("<html><body>查無資料</body></html>", BASE).is_none());
    }

    #[test]
    fn finds_the_next_page_link() {
        let next = "<a href=\"/list?d-49738-p=2\">下一頁</a><a href=\"/list?d-49738-p=9\">最後一頁</a>";
        let html = page(&row("機關", "1<br><a href=\"/d?pk=X\">n</a>"), next);

        let listing = parse_listing(&html, BASE).unwrap();
        assert_eq!(listing.next_href.as_deref(), Some("/list?d-49738-p=2"));
    }

    #[test]
    fn last_page_has_no_next_link() {
        let html = page(
            &row("機關", "1<br><a href=\"/d?pk=X\">n</a>"),
            "<a href=\"/list?d-49738-p=1\">上一頁</a>",
        );

        let listing = parse_listing(&html, BASE).unwrap();
        assert!(listing.next_href.is_none());
    }

    #[test]
    fn correction_suffix_is_stripped() {
        assert_eq!(initial_case_no("113-001(更正公告)"), "113-001");
        assert_eq!(initial_case_no("113-001"), "113-001");
    }
}
