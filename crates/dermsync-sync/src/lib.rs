//! Sync pipeline: load the source registry, fetch or replay each source,
//! archive the raw payloads, normalize, reconcile into the record store and
//! write a run report.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dermsync_adapters::{adapter_for, load_fixture_bundle, AdapterContext, FetchTarget, FetchedPage, SourceAdapter};
use dermsync_core::SourceFamily;
use dermsync_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, JsonDocumentStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub mod classify;
pub mod reconcile;

pub use classify::{StatusClass, StatusClassifier, StatusPolicy};
pub use reconcile::{Outcome, PurgeReport, ReconcileFailure, ReconcileReport, Reconciler};

pub const CRATE_NAME: &str = "dermsync-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source id `{0}` is declared more than once")]
    DuplicateSource(String),
    #[error("enabled source `{0}` has an empty keep_statuses list")]
    EmptyAllowList(String),
    #[error("sources `{first}` and `{second}` disagree on the {family} allow-list")]
    ConflictingAllowList {
        family: SourceFamily,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Replay `fixtures/<source_id>/sample/bundle.json`.
    Fixture,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub family: SourceFamily,
    pub enabled: bool,
    pub mode: SourceMode,
    pub url: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub query_statuses: Vec<String>,
    #[serde(default)]
    pub keep_statuses: Vec<String>,
}

fn default_page_size() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    10
}

impl SourceConfig {
    pub fn fetch_target(&self) -> FetchTarget {
        FetchTarget {
            url: self.url.clone(),
            keywords: self.keywords.clone(),
            country: self.country.clone(),
            statuses: self.query_statuses.clone(),
            page_size: self.page_size,
            max_pages: self.max_pages,
        }
    }

    pub fn adapter(&self) -> Box<dyn SourceAdapter> {
        adapter_for(self.family, &self.source_id, self.country.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        let mut lists: BTreeMap<SourceFamily, &SourceConfig> = BTreeMap::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
            if source.keep_statuses.is_empty() {
                if source.enabled {
                    return Err(ConfigError::EmptyAllowList(source.source_id.clone()));
                }
                continue;
            }
            match lists.get(&source.family) {
                Some(first) if !same_statuses(&first.keep_statuses, &source.keep_statuses) => {
                    return Err(ConfigError::ConflictingAllowList {
                        family: source.family,
                        first: first.source_id.clone(),
                        second: source.source_id.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    lists.insert(source.family, source);
                }
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// One policy per family, taken from the first source that declares a
    /// non-empty allow-list.
    pub fn classifier(&self) -> StatusClassifier {
        let mut policies: BTreeMap<SourceFamily, StatusPolicy> = BTreeMap::new();
        for source in self.sources.iter().filter(|s| !s.keep_statuses.is_empty()) {
            policies
                .entry(source.family)
                .or_insert_with(|| StatusPolicy::new(source.family, source.keep_statuses.iter().cloned()));
        }
        StatusClassifier::new(policies.into_values())
    }
}

fn same_statuses(a: &[String], b: &[String]) -> bool {
    let norm = |list: &[String]| {
        list.iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .collect::<BTreeSet<_>>()
    };
    norm(a) == norm(b)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub collection: String,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub purge_inactive: bool,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_dir: std::env::var("DERMSYNC_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./store")),
            collection: std::env::var("DERMSYNC_COLLECTION").unwrap_or_else(|_| "derm".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            user_agent: std::env::var("DERMSYNC_USER_AGENT")
                .unwrap_or_else(|_| "dermsync-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("DERMSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            purge_inactive: std::env::var("DERMSYNC_PURGE_INACTIVE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            workspace_root: std::env::var("DERMSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn fixture_bundle_path(&self, source_id: &str) -> PathBuf {
        self.workspace_root
            .join("fixtures")
            .join(source_id)
            .join("sample")
            .join("bundle.json")
    }

    pub fn load_registry(&self) -> Result<SourceRegistry> {
        let path = self.registry_path();
        SourceRegistry::load(&path).with_context(|| format!("loading source registry {}", path.display()))
    }

    pub fn open_store(&self) -> Result<JsonDocumentStore> {
        JsonDocumentStore::open(&self.store_dir, &self.collection).with_context(|| {
            format!(
                "opening record store {}/{}",
                self.store_dir.display(),
                self.collection
            )
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub family: SourceFamily,
    pub mode: SourceMode,
    pub pages: usize,
    pub archived: Vec<String>,
    pub drafts: usize,
    pub reconcile: ReconcileReport,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: SyncConfig,
    pub enabled_sources: usize,
    pub fetched_pages: usize,
    pub parsed_drafts: usize,
    pub totals: ReconcileReport,
    pub purge: PurgeReport,
    /// Families whose purge sweep could not enumerate the store.
    pub purge_errors: Vec<String>,
    pub sources: Vec<SourceRunReport>,
    pub reports_dir: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    artifact_store: ArtifactStore,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            artifact_store,
            http,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = self.config.load_registry()?;
        let classifier = registry.classifier();
        let store = self.config.open_store()?;
        let enabled_sources = registry.enabled().cloned().collect::<Vec<_>>();
        info!(sources = enabled_sources.len(), "starting sync run");

        let mut sources = Vec::new();
        let mut totals = ReconcileReport::default();
        for source in &enabled_sources {
            let mut report = SourceRunReport {
                source_id: source.source_id.clone(),
                family: source.family,
                mode: source.mode,
                pages: 0,
                archived: Vec::new(),
                drafts: 0,
                reconcile: ReconcileReport::default(),
                error: None,
            };
            if let Err(err) = self
                .sync_source(run_id, source, &classifier, &store, &mut report)
                .await
            {
                let message = format!("{err:#}");
                warn!(source_id = %source.source_id, error = %message, "source failed");
                report.error = Some(message);
            }
            totals.merge(report.reconcile.clone());
            sources.push(report);
        }

        let (purge, purge_errors) = if self.config.purge_inactive {
            let families = enabled_sources.iter().map(|s| s.family).collect::<BTreeSet<_>>();
            let mut store = store.clone();
            let classifier = classifier.clone();
            let span = Span::current();
            tokio::task::spawn_blocking(move || {
                span.in_scope(|| purge_families(&mut store, &classifier, families))
            })
                .await
                .context("purge task aborted")?
        } else {
            (PurgeReport::default(), Vec::new())
        };

        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            config: self.config.clone(),
            enabled_sources: enabled_sources.len(),
            fetched_pages: sources.iter().map(|s| s.pages).sum(),
            parsed_drafts: sources.iter().map(|s| s.drafts).sum(),
            totals,
            purge,
            purge_errors,
            sources,
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &summary).await?;
        info!(
            inserted = summary.totals.inserted,
            updated = summary.totals.updated,
            deleted = summary.totals.deleted,
            purged = summary.purge.deleted.len(),
            "sync run complete"
        );
        Ok(summary)
    }

    async fn sync_source(
        &self,
        run_id: Uuid,
        source: &SourceConfig,
        classifier: &StatusClassifier,
        store: &JsonDocumentStore,
        report: &mut SourceRunReport,
    ) -> Result<()> {
        let adapter = source.adapter();
        let pages = self.collect_pages(run_id, source, adapter.as_ref()).await?;
        report.pages = pages.len();

        for page in &pages {
            let archived = self
                .artifact_store
                .archive(
                    page.fetched_at,
                    &source.source_id,
                    extension_for(&page.content_type),
                    &page.body,
                )
                .await?;
            report.archived.push(archived.relative_path.display().to_string());

            let drafts = adapter
                .parse(page)
                .with_context(|| format!("parsing page {} from {}", page.url, source.source_id))?;
            report.drafts += drafts.len();
            // document store I/O is blocking
            let mut store = store.clone();
            let classifier = classifier.clone();
            let span = Span::current();
            let batch = tokio::task::spawn_blocking(move || {
                span.in_scope(|| Reconciler::new(&mut store, &classifier).reconcile_batch(drafts))
            })
            .await
            .context("reconcile task aborted")?;
            report.reconcile.merge(batch);
        }
        Ok(())
    }

    async fn collect_pages(
        &self,
        run_id: Uuid,
        source: &SourceConfig,
        adapter: &dyn SourceAdapter,
    ) -> Result<Vec<FetchedPage>> {
        match source.mode {
            SourceMode::Fixture => {
                let path = self.config.fixture_bundle_path(&source.source_id);
                let bundle = load_fixture_bundle(&path)?;
                Ok(vec![bundle.into_page()])
            }
            SourceMode::Live => {
                let ctx = AdapterContext {
                    run_id,
                    fetched_at: Utc::now(),
                };
                Ok(adapter.fetch(&self.http, &ctx, &source.fetch_target()).await?)
            }
        }
    }
}

fn purge_families(
    store: &mut JsonDocumentStore,
    classifier: &StatusClassifier,
    families: BTreeSet<SourceFamily>,
) -> (PurgeReport, Vec<String>) {
    let mut purge = PurgeReport::default();
    let mut errors = Vec::new();
    let mut reconciler = Reconciler::new(store, classifier);
    for family in families {
        match reconciler.purge_inactive(family) {
            Ok(report) => purge.merge(report),
            Err(err) => {
                warn!(%family, error = %err, "purge sweep could not list stored trials");
                errors.push(format!("{family}: {err}"));
            }
        }
    }
    (purge, errors)
}

fn extension_for(content_type: &str) -> &'static str {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("json") {
        "json"
    } else if content_type.contains("rss") {
        "rss"
    } else if content_type.contains("xml") {
        "xml"
    } else {
        "bin"
    }
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;
    Ok(())
}

fn render_brief(summary: &SyncRunSummary) -> String {
    let source_lines = summary
        .sources
        .iter()
        .map(|s| {
            let status = match &s.error {
                Some(err) => format!("failed: {err}"),
                None => format!(
                    "{} inserted, {} updated, {} deleted, {} unchanged, {} skipped, {} unlinked",
                    s.reconcile.inserted,
                    s.reconcile.updated,
                    s.reconcile.deleted,
                    s.reconcile.unchanged,
                    s.reconcile.skipped_inactive,
                    s.reconcile.unlinked.len()
                ),
            };
            format!("- {} ({}): {}", s.source_id, s.family, status)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let unlinked = summary
        .totals
        .unlinked
        .iter()
        .map(|u| format!("- [{}] {} <{}>", u.source, u.title, u.source_url))
        .collect::<Vec<_>>();
    let failures = summary
        .totals
        .failures
        .iter()
        .chain(&summary.purge.failures)
        .map(|f| format!("- {}: {}", f.identifier, f.error))
        .chain(summary.purge_errors.iter().map(|e| format!("- purge {e}")))
        .collect::<Vec<_>>();

    let mut brief = format!(
        "# Dermatology Trial Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Enabled sources: {}\n- Parsed trials: {}\n- Purged: {}\n\n## Sources\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.enabled_sources,
        summary.parsed_drafts,
        summary.purge.deleted.len(),
        source_lines
    );
    if !unlinked.is_empty() {
        brief.push_str(&format!("\n## Unlinked entries\n{}\n", unlinked.join("\n")));
    }
    if !failures.is_empty() {
        brief.push_str(&format!("\n## Store failures\n{}\n", failures.join("\n")));
    }
    brief
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once().await
}
