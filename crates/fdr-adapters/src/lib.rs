//! Parsers for the clerk's bulk XML index and the search-results listing.

use fdr_core::{DocumentKind, FilingRecord};
use fdr_storage::RemoteSource;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fdr-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("malformed bulk index document: {0}")]
    Xml(#[from] quick_xml::DeError),
}

#[derive(Debug, Deserialize)]
struct BulkIndex {
    #[serde(rename = "Member", default)]
    members: Vec<MemberEntry>,
}

#[derive(Debug, Deserialize)]
struct MemberEntry {
    #[serde(rename = "Prefix")]
    prefix: Option<String>,
    #[serde(rename = "Last")]
    last: Option<String>,
    #[serde(rename = "First")]
    first: Option<String>,
    #[serde(rename = "Suffix")]
    suffix: Option<String>,
    #[serde(rename = "FilingType")]
    filing_type: Option<String>,
    #[serde(rename = "StateDst")]
    state_district: Option<String>,
    #[serde(rename = "FilingDate")]
    filing_date: Option<String>,
    #[serde(rename = "DocID")]
    doc_id: Option<String>,
    #[serde(rename = "Year")]
    year: Option<String>,
}

impl MemberEntry {
    fn into_record(self, archive_year: i64) -> FilingRecord {
        let year = self
            .year
            .as_deref()
            .and_then(|y| y.trim().parse::<i64>().ok())
            .unwrap_or(archive_year);
        FilingRecord {
            doc_id: self.doc_id.unwrap_or_default(),
            year,
            prefix: self.prefix.unwrap_or_default(),
            last_name: self.last.unwrap_or_default(),
            first_name: self.first.unwrap_or_default(),
            suffix: self.suffix.unwrap_or_default(),
            filing_type: self.filing_type.unwrap_or_default(),
            state_district: self.state_district.unwrap_or_default(),
            filing_date: self.filing_date.unwrap_or_default(),
        }
    }
}

/// Parse one bulk archive's XML index into filing records.
///
/// Missing sub-fields degrade to empty strings rather than dropping the
/// record; a missing or unparseable per-record `Year` falls back to the
/// enclosing archive's year. Only a malformed top-level document is an
/// error, and it fails the whole file.
pub fn extract_members(xml: &str, archive_year: i64) -> Result<Vec<FilingRecord>, ExtractError> {
    let index: BulkIndex = quick_xml::de::from_str(xml)?;
    Ok(index
        .members
        .into_iter()
        .map(|member| member.into_record(archive_year))
        .collect())
}

pub const SEARCH_FORM_PATH: &str = "/FinancialDisclosure/ViewSearch";
pub const SEARCH_RESULT_PATH: &str = "/FinancialDisclosure/ViewMemberSearchResult";
pub const TOKEN_FIELD: &str = "__RequestVerificationToken";

/// One row of the search-results table: a document discoverable through the
/// clerk's search form, described only by what the listing shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDocument {
    pub name: String,
    pub link: String,
    pub office: String,
    pub filing_year: String,
    pub filing_type: String,
}

impl DiscoveredDocument {
    pub fn kind(&self) -> DocumentKind {
        DocumentKind::from_link(&self.link)
    }

    /// Numeric document id from the link's final `NNNN.pdf` segment.
    pub fn doc_id(&self) -> Option<&str> {
        let stem = self.link.rsplit('/').next()?.strip_suffix(".pdf")?;
        (!stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit())).then_some(stem)
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{0}")]
    Selector(String),
    #[error("verification token input not found in search form page")]
    TokenMissing,
    #[error(transparent)]
    Fetch(#[from] fdr_storage::FetchError),
}

fn parse_selector(selector: &str) -> Result<Selector, SearchError> {
    Selector::parse(selector).map_err(|e| SearchError::Selector(e.to_string()))
}

/// Pull the anti-forgery token out of the search form page.
pub fn extract_verification_token(html: &str) -> Result<String, SearchError> {
    let document = Html::parse_document(html);
    let selector = parse_selector(&format!("input[name=\"{TOKEN_FIELD}\"]"))?;
    document
        .select(&selector)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::to_string)
        .ok_or(SearchError::TokenMissing)
}

/// Form body for an unfiltered member search, token included.
pub fn search_form_payload(token: &str) -> Vec<(&'static str, String)> {
    vec![
        ("LastName", String::new()),
        ("FilingYear", String::new()),
        ("State", String::new()),
        ("District", String::new()),
        (TOKEN_FIELD, token.to_string()),
    ]
}

/// Parse the `library-table` of search results into document descriptors.
/// Rows that do not have the expected four cells are ignored.
pub fn parse_search_results(html: &str) -> Result<Vec<DiscoveredDocument>, SearchError> {
    let document = Html::parse_document(html);
    let row_selector = parse_selector("table.library-table tbody tr")?;
    let cell_selector = parse_selector("td")?;
    let link_selector = parse_selector("a")?;

    let mut results = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<_> = row.select(&cell_selector).collect();
        if cells.len() != 4 {
            continue;
        }
        let anchor = cells[0].select(&link_selector).next();
        let name = anchor
            .map(|a| a.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        let link = anchor
            .and_then(|a| a.value().attr("href"))
            .unwrap_or_default()
            .to_string();
        results.push(DiscoveredDocument {
            name,
            link,
            office: cells[1].text().collect::<String>().trim().to_string(),
            filing_year: cells[2].text().collect::<String>().trim().to_string(),
            filing_type: cells[3].text().collect::<String>().trim().to_string(),
        });
    }
    Ok(results)
}

/// Run the full discovery flow: load the form page, replay its token in an
/// unfiltered POST, and parse the resulting listing.
pub async fn discover_documents(
    remote: &dyn RemoteSource,
    base_url: &str,
) -> Result<Vec<DiscoveredDocument>, SearchError> {
    let form_page = remote
        .fetch_text(&format!("{base_url}{SEARCH_FORM_PATH}"))
        .await?;
    let token = extract_verification_token(&form_page)?;
    let payload = search_form_payload(&token);
    let listing = remote
        .post_form(&format!("{base_url}{SEARCH_RESULT_PATH}"), &payload)
        .await?;
    parse_search_results(&listing)
}

/// Reduce a member name or office to something safe as a path component,
/// following the archive mirror's folder-naming rules: collapse dot runs,
/// drop quote characters, map reserved characters to single underscores,
/// and trim leading/trailing separators.
pub fn sanitize_for_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = match ch {
            '"' | '\u{201C}' | '\u{201D}' | '\u{2018}' | '\u{2019}' => continue,
            '<' | '>' | ':' | '/' | '\\' | '|' | '?' | '*' | '\n' | '\r' | '\t' => '_',
            other => other,
        };
        if (mapped == '.' && out.ends_with('.')) || (mapped == '_' && out.ends_with('_')) {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches(|c: char| matches!(c, ' ' | '.' | '_')).to_string()
}
