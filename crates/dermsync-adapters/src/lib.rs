//! Source adapter contracts, fixture bundles, and the two registry adapters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dermsync_core::{Provenance, SourceFamily, TrialDraft};
use dermsync_storage::{ArtifactStore, FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub mod ctgov;
pub mod ctis;
pub mod identifier;

pub use identifier::{extract_eudract, nct_from_field};

pub const CRATE_NAME: &str = "dermsync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Crawlability {
    Api,
    Rss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Search parameters for one poll of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTarget {
    pub url: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub statuses: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_page_size() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    10
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed {source_id} payload: {reason}")]
    Malformed { source_id: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn family(&self) -> SourceFamily;
    fn crawlability(&self) -> Crawlability;
    fn extractor_version(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &FetchTarget,
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    /// Normalize one raw page. Fails only when the envelope itself is
    /// unreadable; missing fields degrade to unavailable values.
    fn parse(&self, page: &FetchedPage) -> Result<Vec<TrialDraft>, AdapterError>;

    fn provenance_for(&self, page: &FetchedPage) -> Provenance {
        Provenance {
            raw_artifact_id: ArtifactStore::artifact_id(
                self.source_id(),
                &ArtifactStore::sha256_hex(&page.body),
            ),
            source_url: page.url.clone(),
            fetched_at: page.fetched_at,
            extractor_version: self.extractor_version().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClinicalTrialsGovAdapter {
    source_id: String,
}

impl ClinicalTrialsGovAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }

    fn search_query(target: &FetchTarget, page_token: Option<&str>) -> Vec<(String, String)> {
        let mut query = vec![
            ("countTotal".to_string(), "true".to_string()),
            ("pageSize".to_string(), target.page_size.to_string()),
        ];
        if !target.keywords.is_empty() {
            query.push(("query.cond".to_string(), target.keywords.join(" OR ")));
        }
        if let Some(country) = &target.country {
            query.push(("query.locn".to_string(), country.clone()));
        }
        if !target.statuses.is_empty() {
            query.push(("filter.overallStatus".to_string(), target.statuses.join(",")));
        }
        if let Some(token) = page_token {
            query.push(("pageToken".to_string(), token.to_string()));
        }
        query
    }
}

#[async_trait]
impl SourceAdapter for ClinicalTrialsGovAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::ClinicalTrialsGov
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    fn extractor_version(&self) -> &'static str {
        ctgov::EXTRACTOR_VERSION
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &FetchTarget,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..target.max_pages.max(1) {
            let query = Self::search_query(target, page_token.as_deref());
            let resp = http
                .fetch_bytes(ctx.run_id, &self.source_id, &target.url, &query)
                .await?;
            page_token = ctgov::next_page_token(&resp.body);
            pages.push(FetchedPage {
                url: resp.final_url,
                content_type: resp
                    .content_type
                    .unwrap_or_else(|| "application/json".to_string()),
                body: resp.body,
                fetched_at: ctx.fetched_at,
            });
            if page_token.is_none() {
                break;
            }
        }
        info!(source_id = %self.source_id, pages = pages.len(), "fetched search pages");
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<TrialDraft>, AdapterError> {
        ctgov::parse_page(&self.source_id, page, self.provenance_for(page))
    }
}

#[derive(Debug, Clone)]
pub struct CtisRssAdapter {
    source_id: String,
    country: String,
}

impl CtisRssAdapter {
    pub fn new(source_id: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            country: country.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for CtisRssAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Ctis
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Rss
    }

    fn extractor_version(&self) -> &'static str {
        ctis::EXTRACTOR_VERSION
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &FetchTarget,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let resp = http
            .fetch_bytes(ctx.run_id, &self.source_id, &target.url, &[])
            .await?;
        Ok(vec![FetchedPage {
            url: resp.final_url,
            content_type: resp
                .content_type
                .unwrap_or_else(|| "application/rss+xml".to_string()),
            body: resp.body,
            fetched_at: ctx.fetched_at,
        }])
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<TrialDraft>, AdapterError> {
        ctis::parse_feed(&self.source_id, &self.country, page, self.provenance_for(page))
    }
}

/// Adapter for a configured source. CTIS sources need the member state whose
/// status column is tracked.
pub fn adapter_for(family: SourceFamily, source_id: &str, country: Option<&str>) -> Box<dyn SourceAdapter> {
    match family {
        SourceFamily::ClinicalTrialsGov => Box::new(ClinicalTrialsGovAdapter::new(source_id)),
        SourceFamily::Ctis => Box::new(CtisRssAdapter::new(source_id, country.unwrap_or("Ireland"))),
    }
}

/// A captured payload checked into `fixtures/`, used for offline runs and
/// golden tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub crawlability: Crawlability,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_artifact: FixtureRawArtifact,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRawArtifact {
    pub content_type: String,
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

impl FixtureBundle {
    pub fn into_page(self) -> FetchedPage {
        FetchedPage {
            url: self.captured_from_url,
            content_type: self.raw_artifact.content_type,
            body: self.raw_artifact.inline_text.unwrap_or_default().into_bytes(),
            fetched_at: self.fetched_at,
        }
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    hydrate_inline_raw_artifact(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_inline_raw_artifact(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    if bundle.raw_artifact.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &bundle.raw_artifact.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture raw artifact {}", raw_path.display()))?;
    bundle.raw_artifact.inline_text = Some(raw);
    Ok(())
}
