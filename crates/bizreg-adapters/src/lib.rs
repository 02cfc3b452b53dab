//! FirstStop registry client: search protocol, detail URL template and
//! agent/owner extraction from detail pages.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bizreg_core::{CompanyDetail, CompanyId, CompanyListing, FieldValue, InvalidCompanyId};
use bizreg_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bizreg-adapters";

pub const DEFAULT_SEARCH_URL: &str = "https://firststop.sos.nd.gov/api/Records/businesssearch";
pub const DEFAULT_DETAIL_URL_TEMPLATE: &str =
    "https://firststop.sos.nd.gov/api/FilingDetail/business/{}/false";

pub const AGENT_LABEL: &str = "Registered Agent";
pub const OWNER_LABEL: &str = "Owner Name";
pub const OWNERS_LABEL: &str = "Owners";

const LABEL_CLOSE: &str = "</LABEL><VALUE>";
const VALUE_CLOSE: &str = "</VALUE><ALERT_YN>";

pub const SEARCH_ENDPOINT: &str = "search";
pub const DETAIL_ENDPOINT: &str = "detail";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("search response is not valid JSON: {0}")]
    SearchJson(#[from] serde_json::Error),
    #[error("search row {row_key} has no TITLE")]
    MissingTitle { row_key: String },
    #[error(transparent)]
    InvalidId(#[from] InvalidCompanyId),
    #[error("url {url} does not match detail template {template}")]
    UrlMismatch { url: String, template: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Body of the business search POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    #[serde(rename = "SEARCH_VALUE")]
    pub search_value: String,
    #[serde(rename = "STARTS_WITH_YN", serialize_with = "yes_no")]
    pub starts_with: bool,
    #[serde(rename = "ACTIVE_ONLY_YN", serialize_with = "yes_no")]
    pub active_only: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            search_value: "X".to_string(),
            starts_with: true,
            active_only: true,
        }
    }
}

fn yes_no<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *value { "true" } else { "false" })
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    rows: BTreeMap<String, SearchRow>,
}

#[derive(Debug, Deserialize)]
struct SearchRow {
    #[serde(rename = "TITLE", default)]
    title: Vec<String>,
}

/// One listing per entry of `rows`; the name is the first `TITLE` element.
pub fn parse_search_response(body: &[u8]) -> Result<Vec<CompanyListing>, AdapterError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    response
        .rows
        .into_iter()
        .map(|(row_key, row)| -> Result<CompanyListing, AdapterError> {
            let id = row_key.parse::<CompanyId>()?;
            let name = row
                .title
                .into_iter()
                .next()
                .ok_or(AdapterError::MissingTitle { row_key })?;
            Ok(CompanyListing { id, name })
        })
        .collect()
}

/// URL pattern with a single `{}` placeholder for the company id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailUrlTemplate {
    template: String,
}

impl Default for DetailUrlTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_DETAIL_URL_TEMPLATE)
    }
}

impl DetailUrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    fn parts(&self) -> (&str, &str) {
        self.template
            .split_once("{}")
            .unwrap_or((self.template.as_str(), ""))
    }

    pub fn url_for(&self, id: CompanyId) -> String {
        let (prefix, suffix) = self.parts();
        format!("{prefix}{id}{suffix}")
    }

    /// Recovers the id from a stored URL. Only the last path segment before the
    /// placeholder has to match, so a URL from another host or scheme still parses.
    pub fn id_from_url(&self, url: &str) -> Result<CompanyId, AdapterError> {
        let mismatch = || AdapterError::UrlMismatch {
            url: url.to_string(),
            template: self.template.clone(),
        };
        let (prefix, suffix) = self.parts();
        let anchor = prefix
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .map(|segment| format!("{segment}/"))
            .unwrap_or_default();

        let (_, after) = url.rsplit_once(anchor.as_str()).ok_or_else(mismatch)?;
        let raw_id = match suffix {
            "" => after,
            suffix => after.split_once(suffix).map(|(id, _)| id).ok_or_else(mismatch)?,
        };
        Ok(raw_id.parse()?)
    }
}

/// How a detail field was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    Delimited,
    Structured,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedField {
    pub value: FieldValue,
    pub via: Extraction,
}

impl ExtractedField {
    fn missing() -> Self {
        Self {
            value: FieldValue::Absent,
            via: Extraction::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailFields {
    pub agent: ExtractedField,
    pub owner: ExtractedField,
}

/// Returns the text strictly between the first `open` and the next `close` after it.
pub fn extract_between<'a>(body: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = body.find(open)? + open.len();
    let len = body[start..].find(close)?;
    Some(&body[start..start + len])
}

/// Literal-marker lookup: `{label}</LABEL><VALUE>` up to `</VALUE><ALERT_YN>`.
pub fn delimited_field<'a>(body: &'a str, label: &str) -> Option<&'a str> {
    extract_between(body, &format!("{label}{LABEL_CLOSE}"), VALUE_CLOSE)
}

/// Element lookup: the first `VALUE` sibling after a `LABEL` whose text is `label`.
pub fn structured_field(document: &Html, label: &str) -> Option<String> {
    let label_selector = Selector::parse("label").ok()?;
    document
        .select(&label_selector)
        .filter(|el| el.text().collect::<String>().trim().eq_ignore_ascii_case(label))
        .find_map(|el| {
            el.next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|sibling| sibling.value().name() == "value")
                .map(|value| value.text().collect::<String>())
        })
}

fn extract_field(body: &str, document: &Html, label: &str) -> ExtractedField {
    let value = FieldValue::from_extracted(structured_field(document, label).as_deref());
    if value.is_found() {
        return ExtractedField {
            value,
            via: Extraction::Structured,
        };
    }
    // Markup the parser does not expose as elements (comments, raw-text blocks)
    // still matches the literal markers.
    let value = FieldValue::from_extracted(delimited_field(body, label));
    if value.is_found() {
        return ExtractedField {
            value,
            via: Extraction::Delimited,
        };
    }
    ExtractedField::missing()
}

/// Pulls the registered agent and owner out of a detail page body. The owner
/// falls back to the `Owners` label when `Owner Name` is absent.
pub fn extract_detail_fields(body: &str) -> DetailFields {
    let document = Html::parse_document(body);
    let agent = extract_field(body, &document, AGENT_LABEL);
    let owner = match extract_field(body, &document, OWNER_LABEL) {
        field if field.value.is_found() => field,
        _ => extract_field(body, &document, OWNERS_LABEL),
    };
    DetailFields { agent, owner }
}

pub fn parse_detail_page(id: CompanyId, page: &FetchedPage) -> CompanyDetail {
    let fields = extract_detail_fields(&page.text());
    debug!(
        %id,
        agent_via = ?fields.agent.via,
        owner_via = ?fields.owner.via,
        "extracted detail fields"
    );
    CompanyDetail {
        id,
        source_url: page.url.clone(),
        agent: fields.agent.value,
        owner: fields.owner.value,
    }
}

/// Network seam for the two crawl stages.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    fn detail_template(&self) -> &DetailUrlTemplate;

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        query: &SearchQuery,
    ) -> Result<FetchedPage, AdapterError>;

    async fn fetch_detail(
        &self,
        ctx: &AdapterContext,
        id: CompanyId,
    ) -> Result<FetchedPage, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct FirstStopClient {
    http: Arc<HttpFetcher>,
    search_url: String,
    detail_template: DetailUrlTemplate,
}

impl FirstStopClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        search_url: impl Into<String>,
        detail_template: DetailUrlTemplate,
    ) -> Self {
        Self {
            http,
            search_url: search_url.into(),
            detail_template,
        }
    }
}

#[async_trait]
impl RegistryClient for FirstStopClient {
    fn detail_template(&self) -> &DetailUrlTemplate {
        &self.detail_template
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        query: &SearchQuery,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = self
            .http
            .post_json(ctx.run_id, SEARCH_ENDPOINT, &self.search_url, query)
            .await?;
        Ok(FetchedPage {
            url: self.search_url.clone(),
            content_type: "application/json".to_string(),
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_detail(
        &self,
        ctx: &AdapterContext,
        id: CompanyId,
    ) -> Result<FetchedPage, AdapterError> {
        let url = self.detail_template.url_for(id);
        let resp = self.http.get(ctx.run_id, DETAIL_ENDPOINT, &url).await?;
        Ok(FetchedPage {
            url,
            content_type: "application/xml".to_string(),
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_BODY: &str = "<DRAWER_DETAIL><LABEL>Registered Agent</LABEL><VALUE>Jane Doe\r123 Main St</VALUE><ALERT_YN>false</ALERT_YN></DRAWER_DETAIL>";

    #[test]
    fn search_query_serializes_to_registry_field_names() {
        let json = serde_json::to_value(SearchQuery::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "SEARCH_VALUE": "X",
                "STARTS_WITH_YN": "true",
                "ACTIVE_ONLY_YN": "true",
            })
        );
    }

    #[test]
    fn every_search_row_becomes_one_listing() {
        let body = br#"{"rows": {
            "1": {"TITLE": ["X Corp", "(0000001)"], "STATUS": ["Active"]},
            "2": {"TITLE": ["Xylo Inc"]},
            "30": {"TITLE": ["Xenon LLC", "extra"]}
        }}"#;
        let listings = parse_search_response(body).unwrap();
        assert_eq!(listings.len(), 3);
        let names: Vec<_> = listings.iter().map(|l| (l.id.0, l.name.as_str())).collect();
        assert!(names.contains(&(1, "X Corp")));
        assert!(names.contains(&(2, "Xylo Inc")));
        assert!(names.contains(&(30, "Xenon LLC")));
    }

    #[test]
    fn empty_title_is_an_error() {
        let err = parse_search_response(br#"{"rows": {"5": {"TITLE": []}}}"#).unwrap_err();
        assert!(matches!(err, AdapterError::MissingTitle { row_key } if row_key == "5"));
    }

    #[test]
    fn response_without_rows_is_an_error() {
        assert!(matches!(
            parse_search_response(br#"{"count": 0}"#),
            Err(AdapterError::SearchJson(_))
        ));
    }

    #[test]
    fn detail_template_round_trips_ids() {
        let template = DetailUrlTemplate::default();
        let url = template.url_for(CompanyId(48213));
        assert_eq!(
            url,
            "https://firststop.sos.nd.gov/api/FilingDetail/business/48213/false"
        );
        assert_eq!(template.id_from_url(&url).unwrap(), CompanyId(48213));
        assert_eq!(
            template
                .id_from_url("http://127.0.0.1:9/api/FilingDetail/business/7/false")
                .unwrap(),
            CompanyId(7)
        );
    }

    #[test]
    fn unrelated_url_does_not_parse() {
        let template = DetailUrlTemplate::default();
        assert!(matches!(
            template.id_from_url("https://example.test/other/7"),
            Err(AdapterError::UrlMismatch { .. })
        ));
        assert!(matches!(
            template.id_from_url("https://x/business/abc/false"),
            Err(AdapterError::InvalidId(_))
        ));
    }

    #[test]
    fn delimited_extraction_returns_exact_substring() {
        assert_eq!(
            delimited_field(AGENT_BODY, AGENT_LABEL),
            Some("Jane Doe\r123 Main St")
        );
        assert_eq!(delimited_field(AGENT_BODY, OWNER_LABEL), None);
        assert_eq!(extract_between("a[x]b", "[", "]"), Some("x"));
        assert_eq!(extract_between("a[x", "[", "]"), None);
    }

    #[test]
    fn missing_markers_yield_absent() {
        let fields = extract_detail_fields("<DRAWER_DETAIL><LABEL>Status</LABEL><VALUE>Active</VALUE><ALERT_YN>false</ALERT_YN></DRAWER_DETAIL>");
        assert_eq!(fields.agent.value, FieldValue::Absent);
        assert_eq!(fields.agent.via, Extraction::Missing);
        assert_eq!(fields.owner.value, FieldValue::Absent);
    }

    #[test]
    fn owner_falls_back_to_owners_label() {
        let body = "<LABEL>Owners</LABEL><VALUE>John Roe\r456 Oak Ave</VALUE><ALERT_YN>false</ALERT_YN>";
        let fields = extract_detail_fields(body);
        assert_eq!(
            fields.owner.value.first_line(),
            FieldValue::Found("John Roe".to_string())
        );
        assert_eq!(fields.owner.via, Extraction::Structured);
    }

    #[test]
    fn structured_parse_survives_reformatted_markup() {
        let body = "<DRAWER_DETAIL>\n  <LABEL>Registered Agent</LABEL>\n  <VALUE>Jane Doe</VALUE>\n  <ALERT_YN>false</ALERT_YN>\n</DRAWER_DETAIL>";
        let fields = extract_detail_fields(body);
        assert_eq!(fields.agent.value, FieldValue::Found("Jane Doe".to_string()));
        assert_eq!(fields.agent.via, Extraction::Structured);
    }

    #[test]
    fn structured_values_are_trimmed_and_entity_decoded() {
        let body = "<LABEL>Registered Agent</LABEL><VALUE>  Smith &amp; Sons\r1 Main St</VALUE><ALERT_YN>false</ALERT_YN>";
        assert_eq!(
            delimited_field(body, AGENT_LABEL),
            Some("  Smith &amp; Sons\r1 Main St")
        );

        let fields = extract_detail_fields(body);
        assert_eq!(fields.agent.via, Extraction::Structured);
        assert_eq!(fields.agent.value.first_line().as_found(), Some("Smith & Sons"));
    }

    #[test]
    fn delimited_markers_cover_markup_hidden_from_parser() {
        let body = "<!-- <LABEL>Registered Agent</LABEL><VALUE>Jane Doe</VALUE><ALERT_YN>false</ALERT_YN> -->";
        let fields = extract_detail_fields(body);
        assert_eq!(fields.agent.value, FieldValue::Found("Jane Doe".to_string()));
        assert_eq!(fields.agent.via, Extraction::Delimited);
    }

    #[test]
    fn parse_detail_page_keeps_source_url() {
        let page = FetchedPage {
            url: DetailUrlTemplate::default().url_for(CompanyId(1)),
            content_type: "application/xml".to_string(),
            body: AGENT_BODY.as_bytes().to_vec(),
            fetched_at: Utc::now(),
        };
        let detail = parse_detail_page(CompanyId(1), &page);
        assert_eq!(detail.source_url, page.url);
        assert_eq!(detail.agent.first_line().as_found(), Some("Jane Doe"));
        assert_eq!(detail.owner, FieldValue::Absent);
    }
}
