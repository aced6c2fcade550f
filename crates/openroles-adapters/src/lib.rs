//! Source adapter contract, per-pass session state and the configurable adapter variants.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use openroles_core::ObservedListing;
pub use openroles_storage::{FetchError, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "openroles-adapters";

/// Request state for one source pass. Created by the caller of the pass and
/// dropped with it; nothing here outlives a single `fetch_listings` cycle.
#[derive(Debug, Clone)]
pub struct SourceSession {
    pub run_id: Uuid,
    pub source_id: String,
    headers: HeaderMap,
    cookies: BTreeMap<String, String>,
}

impl SourceSession {
    pub fn new(run_id: Uuid, source_id: impl Into<String>) -> Self {
        Self {
            run_id,
            source_id: source_id.into(),
            headers: HeaderMap::new(),
            cookies: BTreeMap::new(),
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), FetchError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Headers for the next request: configured headers plus accumulated cookies.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if !self.cookies.is_empty() {
            let jar = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = HeaderValue::from_str(&jar) {
                headers.insert(COOKIE, value);
            }
        }
        headers
    }

    /// Remember cookies set by a response for the rest of this pass.
    pub fn absorb_response(&mut self, headers: &HeaderMap) {
        for raw in headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else {
                continue;
            };
            let pair = raw.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.cookies.insert(name.to_string(), value.trim().to_string());
                }
            }
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> &'static str;

    /// Produce this cycle's listings in source order. Repeated `external_id`s
    /// are passed through; reconciliation keeps the first and reports the rest.
    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        session: &mut SourceSession,
    ) -> Result<Vec<ObservedListing>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    JsonApi(JsonApiConfig),
    HtmlCards(HtmlCardConfig),
    Fixture(FixtureConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonApiConfig {
    pub url: String,
    /// JSON pointer to the listings array; empty means the document root.
    #[serde(default)]
    pub listings_pointer: String,
    #[serde(default)]
    pub url_prefix: Option<String>,
    #[serde(default)]
    pub fields: JsonFieldMap,
    /// Extra values kept as raw JSON, keyed by attribute name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// JSON pointers, relative to one listing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFieldMap {
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub description: Option<String>,
    pub department: Option<String>,
    pub posted_date: Option<String>,
    pub compensation_low: Option<String>,
    pub compensation_mid: Option<String>,
    pub compensation_high: Option<String>,
}

impl Default for JsonFieldMap {
    fn default() -> Self {
        Self {
            external_id: "/id".to_string(),
            title: "/title".to_string(),
            url: "/url".to_string(),
            location: None,
            employment_type: None,
            description: None,
            department: None,
            posted_date: None,
            compensation_low: None,
            compensation_mid: None,
            compensation_high: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRule {
    pub selector: String,
    /// Attribute to read instead of text. `class` yields the last class token.
    #[serde(default)]
    pub attr: Option<String>,
}

impl ExtractRule {
    pub fn text(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            attr: None,
        }
    }

    pub fn attr(selector: impl Into<String>, attr: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            attr: Some(attr.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlCardConfig {
    pub url: String,
    pub card: String,
    pub external_id: ExtractRule,
    pub title: ExtractRule,
    pub link: ExtractRule,
    #[serde(default)]
    pub location: Option<ExtractRule>,
    #[serde(default)]
    pub description: Option<ExtractRule>,
    #[serde(default)]
    pub department: Option<ExtractRule>,
    #[serde(default)]
    pub employment_type: Option<ExtractRule>,
    /// Selector for the "next page" anchor, read via `href`.
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_max_pages() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub path: PathBuf,
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn apply_headers(session: &mut SourceSession, headers: &BTreeMap<String, String>) -> Result<(), FetchError> {
    for (name, value) in headers {
        session.set_header(name, value)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON API
// ---------------------------------------------------------------------------

fn json_text(item: &JsonValue, pointer: &str) -> Option<String> {
    match item.pointer(pointer)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_amount(item: &JsonValue, pointer: &str) -> Option<f64> {
    match item.pointer(pointer)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn optional_text(item: &JsonValue, pointer: &Option<String>) -> Option<String> {
    pointer.as_deref().and_then(|p| json_text(item, p))
}

fn optional_amount(item: &JsonValue, pointer: &Option<String>) -> Option<f64> {
    pointer.as_deref().and_then(|p| json_amount(item, p))
}

/// Map one search API response body to listings. Items missing required
/// values come through with empty fields and are rejected by validation.
pub fn parse_json_listings(
    source_id: &str,
    config: &JsonApiConfig,
    body: &[u8],
) -> Result<Vec<ObservedListing>, FetchError> {
    let doc: JsonValue = serde_json::from_slice(body).map_err(|e| FetchError::Parse(e.to_string()))?;
    let items = doc
        .pointer(&config.listings_pointer)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            FetchError::Parse(format!(
                "response has no listings array at `{}`",
                config.listings_pointer
            ))
        })?;

    let f = &config.fields;
    let listings = items
        .iter()
        .map(|item| {
            let url = json_text(item, &f.url)
                .map(|v| match &config.url_prefix {
                    Some(prefix) => format!("{prefix}{v}"),
                    None => v,
                })
                .unwrap_or_default();
            let mut listing = ObservedListing {
                external_id: json_text(item, &f.external_id).unwrap_or_default(),
                source: source_id.to_string(),
                title: json_text(item, &f.title).unwrap_or_default(),
                url,
                location: optional_text(item, &f.location),
                employment_type: optional_text(item, &f.employment_type),
                description: optional_text(item, &f.description),
                department: optional_text(item, &f.department),
                posted_date: optional_text(item, &f.posted_date),
                compensation_low: optional_amount(item, &f.compensation_low),
                compensation_mid: optional_amount(item, &f.compensation_mid),
                compensation_high: optional_amount(item, &f.compensation_high),
                ..Default::default()
            };
            for (name, pointer) in &config.attributes {
                if let Some(value) = item.pointer(pointer) {
                    listing.attributes.insert(name.clone(), value.clone());
                }
            }
            listing
        })
        .collect();
    Ok(listings)
}

#[derive(Debug, Clone)]
pub struct JsonApiAdapter {
    source_id: String,
    config: JsonApiConfig,
}

impl JsonApiAdapter {
    pub fn new(source_id: impl Into<String>, config: JsonApiConfig) -> Self {
        Self {
            source_id: source_id.into(),
            config,
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> &'static str {
        "json_api"
    }

    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        session: &mut SourceSession,
    ) -> Result<Vec<ObservedListing>, FetchError> {
        apply_headers(session, &self.config.headers)?;
        let resp = http
            .fetch_bytes(&self.source_id, &self.config.url, &session.request_headers())
            .await?;
        session.absorb_response(&resp.headers);

        let listings = parse_json_listings(&self.source_id, &self.config, &resp.body)?;
        info!(source = %self.source_id, count = listings.len(), "fetched listings from json api");
        Ok(listings)
    }
}

// ---------------------------------------------------------------------------
// HTML cards
// ---------------------------------------------------------------------------

fn parse_selector(selector: &str) -> Result<Selector, FetchError> {
    Selector::parse(selector).map_err(|e| FetchError::Parse(format!("selector `{selector}`: {e}")))
}

/// An [`ExtractRule`] with its selector already parsed.
#[derive(Debug, Clone)]
struct CompiledRule {
    selector: Selector,
    attr: Option<String>,
}

impl CompiledRule {
    fn new(rule: &ExtractRule) -> Result<Self, FetchError> {
        Ok(Self {
            selector: parse_selector(&rule.selector)?,
            attr: rule.attr.clone(),
        })
    }

    fn optional(rule: &Option<ExtractRule>) -> Result<Option<Self>, FetchError> {
        rule.as_ref().map(Self::new).transpose()
    }

    fn extract(&self, card: ElementRef<'_>) -> Option<String> {
        let node = card.select(&self.selector).next()?;
        match self.attr.as_deref() {
            None => text_or_none(&node.text().collect::<String>()),
            Some("class") => node
                .value()
                .attr("class")
                .and_then(|c| c.split_whitespace().last())
                .map(ToString::to_string),
            Some(attr) => node.value().attr(attr).and_then(text_or_none),
        }
    }
}

fn extract_optional(card: ElementRef<'_>, rule: &Option<CompiledRule>) -> Option<String> {
    rule.as_ref().and_then(|r| r.extract(card))
}

fn resolve_link(page_url: &str, href: &str) -> String {
    Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct HtmlPage {
    pub listings: Vec<ObservedListing>,
    pub next_url: Option<String>,
}

/// Every selector of an [`HtmlCardConfig`], parsed once.
#[derive(Debug, Clone)]
pub struct CardSelectors {
    card: Selector,
    external_id: CompiledRule,
    title: CompiledRule,
    link: CompiledRule,
    location: Option<CompiledRule>,
    description: Option<CompiledRule>,
    department: Option<CompiledRule>,
    employment_type: Option<CompiledRule>,
    next_page: Option<Selector>,
}

impl CardSelectors {
    pub fn new(config: &HtmlCardConfig) -> Result<Self, FetchError> {
        Ok(Self {
            card: parse_selector(&config.card)?,
            external_id: CompiledRule::new(&config.external_id)?,
            title: CompiledRule::new(&config.title)?,
            link: CompiledRule::new(&config.link)?,
            location: CompiledRule::optional(&config.location)?,
            description: CompiledRule::optional(&config.description)?,
            department: CompiledRule::optional(&config.department)?,
            employment_type: CompiledRule::optional(&config.employment_type)?,
            next_page: config.next_page.as_deref().map(parse_selector).transpose()?,
        })
    }

    /// Parse one listing page. Relative links resolve against `page_url`.
    pub fn parse_page(&self, source_id: &str, page_url: &str, html: &str) -> HtmlPage {
        let document = Html::parse_document(html);

        let listings = document
            .select(&self.card)
            .map(|card| ObservedListing {
                external_id: self.external_id.extract(card).unwrap_or_default(),
                source: source_id.to_string(),
                title: self.title.extract(card).unwrap_or_default(),
                url: self
                    .link
                    .extract(card)
                    .map(|href| resolve_link(page_url, &href))
                    .unwrap_or_default(),
                location: extract_optional(card, &self.location),
                description: extract_optional(card, &self.description),
                department: extract_optional(card, &self.department),
                employment_type: extract_optional(card, &self.employment_type),
                ..Default::default()
            })
            .collect();

        let next_url = self.next_page.as_ref().and_then(|sel| {
            document
                .select(sel)
                .next()
                .and_then(|n| n.value().attr("href"))
                .and_then(text_or_none)
                .map(|href| resolve_link(page_url, &href))
        });

        HtmlPage { listings, next_url }
    }
}

/// One-off parse of a listing page; adapters keep a [`CardSelectors`] instead.
pub fn parse_html_cards(
    source_id: &str,
    config: &HtmlCardConfig,
    page_url: &str,
    html: &str,
) -> Result<HtmlPage, FetchError> {
    Ok(CardSelectors::new(config)?.parse_page(source_id, page_url, html))
}

#[derive(Debug, Clone)]
pub struct HtmlCardAdapter {
    source_id: String,
    config: HtmlCardConfig,
    selectors: CardSelectors,
}

impl HtmlCardAdapter {
    /// Rejects configs whose selectors do not parse.
    pub fn new(source_id: impl Into<String>, config: HtmlCardConfig) -> Result<Self, FetchError> {
        let selectors = CardSelectors::new(&config)?;
        Ok(Self {
            source_id: source_id.into(),
            config,
            selectors,
        })
    }
}

#[async_trait]
impl SourceAdapter for HtmlCardAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> &'static str {
        "html_cards"
    }

    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        session: &mut SourceSession,
    ) -> Result<Vec<ObservedListing>, FetchError> {
        apply_headers(session, &self.config.headers)?;

        let mut visited = HashSet::new();
        let mut next = Some(self.config.url.clone());
        let mut listings = Vec::new();

        while let Some(page_url) = next.take() {
            if visited.len() >= self.config.max_pages.max(1) || !visited.insert(page_url.clone()) {
                break;
            }
            let resp = http
                .fetch_bytes(&self.source_id, &page_url, &session.request_headers())
                .await?;
            session.absorb_response(&resp.headers);

            let html = String::from_utf8_lossy(&resp.body).into_owned();
            let page = self.selectors.parse_page(&self.source_id, &resp.final_url, &html);
            debug!(
                source = %self.source_id,
                page = visited.len(),
                cards = page.listings.len(),
                "parsed listing page"
            );
            listings.extend(page.listings);
            next = page.next_url;
        }

        info!(source = %self.source_id, pages = visited.len(), count = listings.len(), "fetched listings from html");
        Ok(listings)
    }
}

// ---------------------------------------------------------------------------
// Fixture file
// ---------------------------------------------------------------------------

/// Reads a JSON array of listings from disk. Listings without a `source`
/// are stamped with this adapter's source id.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_id: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_listings(
        &self,
        _http: &HttpFetcher,
        _session: &mut SourceSession,
    ) -> Result<Vec<ObservedListing>, FetchError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut listings: Vec<ObservedListing> = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Parse(format!("{}: {e}", self.path.display())))?;
        for listing in &mut listings {
            if listing.source.is_empty() {
                listing.source = self.source_id.clone();
            }
        }
        debug!(source = %self.source_id, count = listings.len(), path = %self.path.display(), "read fixture listings");
        Ok(listings)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Build one adapter. Relative fixture paths resolve against `root`.
pub fn build_adapter(source_id: &str, config: &AdapterConfig, root: &Path) -> Result<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match config {
        AdapterConfig::JsonApi(cfg) => Arc::new(JsonApiAdapter::new(source_id, cfg.clone())),
        AdapterConfig::HtmlCards(cfg) => Arc::new(
            HtmlCardAdapter::new(source_id, cfg.clone())
                .with_context(|| format!("configuring html adapter for {source_id}"))?,
        ),
        AdapterConfig::Fixture(cfg) => {
            let path = if cfg.path.is_absolute() {
                cfg.path.clone()
            } else {
                root.join(&cfg.path)
            };
            Arc::new(FixtureAdapter::new(source_id, path))
        }
    };
    Ok(adapter)
}

/// Explicit `source_id -> adapter` table, built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        let id = adapter.source_id().to_string();
        if self.adapters.contains_key(&id) {
            bail!("adapter for source `{id}` registered twice");
        }
        self.adapters.insert(id, adapter);
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
