//! Ingestion pipeline: normalizer, sync writer, and the per-pass
//! orchestration across all configured sources.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reu_core::logger::ChannelLogger;
use reu_core::{Program, ProgramDraft};
use reu_extract::{CandidateRecord, SiteProfile};
use reu_fetch::{FetchConfig, FetchError, Fetcher};
use reu_store::{PgStore, ProgramStore, StoreError};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "reu-sync";

/// Two url-less titles this similar refer to the same program.
const TITLE_SIMILARITY_THRESHOLD: f64 = 0.92;

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value `{value}` for {var}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_path: PathBuf,
    pub log_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl SyncConfig {
    /// Read configuration from the process environment. A missing
    /// `DATABASE_URL` is fatal; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: get("DATABASE_URL").ok_or(ConfigError::MissingVar("DATABASE_URL"))?,
            sources_path: get("REU_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            log_dir: get("REU_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./logs")),
            user_agent: get("REU_USER_AGENT")
                .unwrap_or_else(|| "reu-cafe-bot/0.1".to_string()),
            http_timeout_secs: parse_var(&get, "REU_HTTP_TIMEOUT_SECS", 20)?,
            web_port: parse_var(&get, "REU_WEB_PORT", 8000)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

// ---------------------------------------------------------------------------
// Source registry

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SiteProfile>,
}

pub fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Normalizer

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub drafts: Vec<ProgramDraft>,
    /// Candidates dropped for carrying neither url nor title.
    pub dropped: usize,
}

/// Reconcile a batch of extracted candidates into deduplicated drafts.
///
/// String fields are trimmed; candidates sharing a normalized url merge,
/// later non-empty fields filling earlier empty ones; url-less candidates
/// merge on case-insensitive or fuzzy title equality; candidates with
/// neither url nor title are dropped and counted, never an error.
pub fn normalize(source_id: &str, candidates: &[CandidateRecord]) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    for candidate in candidates {
        let draft = draft_from_candidate(source_id, candidate);
        if !draft.is_matchable() {
            outcome.dropped += 1;
            continue;
        }

        let existing = if let Some(url) = draft.url.as_deref() {
            let key = normalize_url(url);
            outcome
                .drafts
                .iter()
                .position(|d| d.url.as_deref().map(normalize_url).as_deref() == Some(key.as_str()))
        } else {
            let title = draft.title.as_deref().unwrap_or_default();
            outcome.drafts.iter().position(|d| {
                d.url.is_none() && titles_match(d.title.as_deref().unwrap_or_default(), title)
            })
        };

        match existing {
            Some(index) => merge_draft(&mut outcome.drafts[index], &draft),
            None => outcome.drafts.push(draft),
        }
    }
    outcome
}

fn draft_from_candidate(source_id: &str, candidate: &CandidateRecord) -> ProgramDraft {
    let mut draft = ProgramDraft::new(source_id);
    draft.title = trimmed(candidate.text("title"));
    draft.url = trimmed(candidate.text("url"));
    draft.deadline = trimmed(candidate.text("deadline"));
    draft.description = trimmed(candidate.text("description"));
    draft.institution = trimmed(candidate.text("institution"));
    draft.field = match candidate.list("field") {
        Some(items) => items
            .iter()
            .filter_map(|s| trimmed(Some(s)))
            .collect(),
        // A scalar "field" value is treated as a comma-separated tag list.
        None => candidate
            .text("field")
            .map(|s| {
                s.split(',')
                    .filter_map(|part| trimmed(Some(part)))
                    .collect()
            })
            .unwrap_or_default(),
    };
    draft
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(ToString::to_string)
}

/// Dedup key for urls: trimmed, one trailing slash stripped.
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    url.strip_suffix('/').unwrap_or(url).to_string()
}

fn titles_match(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    jaro_winkler(&title_key(a), &title_key(b)) >= TITLE_SIMILARITY_THRESHOLD
}

fn title_key(title: &str) -> String {
    title
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fill `target`'s empty fields from `incoming`; established non-empty
/// values are never overwritten during normalization.
fn merge_draft(target: &mut ProgramDraft, incoming: &ProgramDraft) {
    fill_option(&mut target.title, &incoming.title);
    fill_option(&mut target.url, &incoming.url);
    fill_option(&mut target.deadline, &incoming.deadline);
    fill_option(&mut target.description, &incoming.description);
    fill_option(&mut target.institution, &incoming.institution);
    if target.field.is_empty() && !incoming.field.is_empty() {
        target.field = incoming.field.clone();
    }
}

fn fill_option(target: &mut Option<String>, incoming: &Option<String>) {
    if target.is_none() {
        if let Some(value) = incoming {
            *target = Some(value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Sync writer

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl SyncSummary {
    fn absorb(&mut self, other: SyncSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

enum SyncOutcome {
    Inserted,
    Updated,
}

/// Upsert each draft independently: a store rejection is logged and counted,
/// never aborts the batch. Best-effort, non-transactional.
pub async fn sync_drafts(
    store: &dyn ProgramStore,
    drafts: &[ProgramDraft],
    logger: &ChannelLogger,
) -> SyncSummary {
    let mut summary = SyncSummary::default();
    for draft in drafts {
        if !draft.is_matchable() {
            continue;
        }
        match sync_one(store, draft).await {
            Ok(SyncOutcome::Inserted) => summary.inserted += 1,
            Ok(SyncOutcome::Updated) => summary.updated += 1,
            Err(err) => {
                summary.failed += 1;
                logger.error(&format!(
                    "store rejected record from {} ({}): {err}",
                    draft.source_id,
                    draft.display_title().unwrap_or("<unkeyed>"),
                ));
            }
        }
    }
    summary
}

async fn sync_one(store: &dyn ProgramStore, draft: &ProgramDraft) -> Result<SyncOutcome, StoreError> {
    // Url equality first, then case-insensitive title; first match wins.
    let mut existing = match draft.url.as_deref() {
        Some(url) => store.find_by_url(url).await?,
        None => None,
    };
    if existing.is_none() {
        if let Some(title) = draft.title.as_deref() {
            existing = store.find_by_title_ci(title).await?;
        }
    }

    let now = Utc::now();
    match existing {
        Some(mut program) => {
            apply_draft(&mut program, draft);
            program.updated_at = now;
            store.update(&program).await?;
            Ok(SyncOutcome::Updated)
        }
        None => {
            let program = Program {
                id: Uuid::new_v4(),
                title: draft.display_title().unwrap_or_default().to_string(),
                url: draft.url.clone(),
                field: draft.field.clone(),
                deadline: draft.deadline.clone(),
                description: draft.description.clone(),
                institution: draft.institution.clone(),
                created_at: now,
                updated_at: now,
            };
            store.insert(&program).await?;
            Ok(SyncOutcome::Inserted)
        }
    }
}

/// Field refresh only: incoming non-empty values replace stored ones, absent
/// incoming fields leave the row untouched. Nothing is ever removed here;
/// that is reserved for the administrative clear operations.
fn apply_draft(program: &mut Program, draft: &ProgramDraft) {
    if let Some(title) = &draft.title {
        program.title = title.clone();
    }
    if let Some(url) = &draft.url {
        program.url = Some(url.clone());
    }
    if !draft.field.is_empty() {
        program.field = draft.field.clone();
    }
    if let Some(deadline) = &draft.deadline {
        program.deadline = Some(deadline.clone());
    }
    if let Some(description) = &draft.description {
        program.description = Some(description.clone());
    }
    if let Some(institution) = &draft.institution {
        program.institution = Some(institution.clone());
    }
}

// ---------------------------------------------------------------------------
// Pipeline

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_total: usize,
    pub sources_failed: usize,
    pub extracted: usize,
    pub dropped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

struct SourceStats {
    extracted: usize,
    dropped: usize,
    summary: SyncSummary,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: Fetcher,
    logger: ChannelLogger,
    store: Arc<dyn ProgramStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn ProgramStore>) -> Result<Self> {
        let logger = ChannelLogger::create(&config.log_dir)
            .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;
        let fetcher = Fetcher::new(&FetchConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            default_headers: BTreeMap::new(),
        })?;
        Ok(Self {
            config,
            fetcher,
            logger,
            store,
        })
    }

    pub fn logger(&self) -> &ChannelLogger {
        &self.logger
    }

    /// One sync pass, sequentially over all enabled sources. A failing
    /// source is logged and skipped; the pass itself only fails on setup
    /// problems (unreadable registry).
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let registry = load_source_registry(&self.config.sources_path)?;
        let enabled: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.logger.general(&format!(
            "sync pass {run_id} started over {} source(s)",
            enabled.len()
        ));

        let mut extracted = 0usize;
        let mut dropped = 0usize;
        let mut sources_failed = 0usize;
        let mut totals = SyncSummary::default();

        for profile in &enabled {
            match self.sync_source(profile).await {
                Some(stats) => {
                    extracted += stats.extracted;
                    dropped += stats.dropped;
                    totals.absorb(stats.summary);
                }
                None => sources_failed += 1,
            }
        }

        let finished_at = Utc::now();
        self.logger.general(&format!(
            "sync pass {run_id} finished: {} inserted, {} updated, {} failed, {} dropped, {}/{} sources ok",
            totals.inserted,
            totals.updated,
            totals.failed,
            dropped,
            enabled.len() - sources_failed,
            enabled.len(),
        ));

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            sources_total: enabled.len(),
            sources_failed,
            extracted,
            dropped,
            inserted: totals.inserted,
            updated: totals.updated,
            failed: totals.failed,
        })
    }

    /// Fetch + ingest one source. Returns `None` when the source's sub-run
    /// was aborted; the error is already on the log channels.
    async fn sync_source(&self, profile: &SiteProfile) -> Option<SourceStats> {
        self.logger
            .scraper(&format!("fetching {} ({})", profile.source_id, profile.url));

        let response = match self
            .fetcher
            .get(&profile.url, &profile.headers, &profile.query)
            .await
        {
            Ok(response) => response,
            Err(err @ FetchError::Network { .. }) => {
                self.logger
                    .error(&format!("{}: {err}; skipping source", profile.source_id));
                return None;
            }
            Err(FetchError::Http {
                status,
                url,
                body_snippet,
            }) => {
                self.logger.error(&format!(
                    "{}: http status {status} for {url}; body: {body_snippet}; skipping source",
                    profile.source_id
                ));
                return None;
            }
        };

        self.ingest_payload(profile, &response.body).await
    }

    /// Extract, normalize and sync one fetched payload. Returns `None` when
    /// the payload did not match the profile; the source counts as failed.
    async fn ingest_payload(&self, profile: &SiteProfile, body: &str) -> Option<SourceStats> {
        let candidates = match reu_extract::extract(profile, body) {
            Ok(candidates) => candidates,
            Err(err) => {
                self.logger
                    .error(&format!("{}: {err}; skipping source", profile.source_id));
                return None;
            }
        };

        if candidates.is_empty() {
            // Suspicious but valid; usually means the page structure changed.
            self.logger.scraper(&format!(
                "warning: 0 records extracted from {}; page structure may have changed",
                profile.source_id
            ));
        }

        let outcome = normalize(&profile.source_id, &candidates);
        if outcome.dropped > 0 {
            self.logger.scraper(&format!(
                "{}: dropped {} record(s) with neither url nor title",
                profile.source_id, outcome.dropped
            ));
        }

        let summary = sync_drafts(self.store.as_ref(), &outcome.drafts, &self.logger).await;
        self.logger.scraper(&format!(
            "{}: {} extracted, {} inserted, {} updated, {} failed",
            profile.source_id,
            candidates.len(),
            summary.inserted,
            summary.updated,
            summary.failed
        ));

        Some(SourceStats {
            extracted: candidates.len(),
            dropped: outcome.dropped,
            summary,
        })
    }
}

/// Convenience entry point for the CLI: config from the environment, store
/// from `DATABASE_URL`, one pass.
pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to program store")?;
    let pipeline = SyncPipeline::new(config, Arc::new(store))?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reu_core::logger::LogChannel;
    use reu_extract::{FieldRule, PayloadKind};
    use reu_store::MemoryStore;
    use tempfile::tempdir;

    fn candidate(fields: &[(&str, &str)]) -> CandidateRecord {
        let mut record = CandidateRecord::default();
        for (name, value) in fields {
            record.set_text(name, *value);
        }
        record
    }

    #[test]
    fn keyless_candidates_are_dropped_and_counted() {
        let candidates = vec![
            candidate(&[("title", "Coastal REU"), ("url", "https://x.org/a")]),
            candidate(&[("description", "no key at all")]),
            candidate(&[("deadline", "Feb 1")]),
        ];
        let outcome = normalize("nsf-reu", &candidates);
        assert_eq!(outcome.drafts.len(), 1);
        assert_eq!(outcome.dropped, 2);
    }

    #[test]
    fn whitespace_is_trimmed_everywhere() {
        let candidates = vec![candidate(&[
            ("title", "  Coastal REU \n"),
            ("url", " https://x.org/a "),
            ("deadline", "\tFeb 1 "),
        ])];
        let outcome = normalize("nsf-reu", &candidates);
        let draft = &outcome.drafts[0];
        assert_eq!(draft.title.as_deref(), Some("Coastal REU"));
        assert_eq!(draft.url.as_deref(), Some("https://x.org/a"));
        assert_eq!(draft.deadline.as_deref(), Some("Feb 1"));
    }

    #[test]
    fn same_url_merges_with_non_empty_preference() {
        let a = candidate(&[("url", "https://x.org/a/"), ("title", "Coastal REU")]);
        let b = candidate(&[("url", "https://x.org/a"), ("deadline", "Feb 1")]);

        // Either order yields one merged draft with both values present.
        for order in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
            let outcome = normalize("nsf-reu", &order);
            assert_eq!(outcome.drafts.len(), 1, "order: {order:?}");
            let draft = &outcome.drafts[0];
            assert_eq!(draft.title.as_deref(), Some("Coastal REU"));
            assert_eq!(draft.deadline.as_deref(), Some("Feb 1"));
        }
    }

    #[test]
    fn merged_url_keeps_established_values() {
        let first = candidate(&[("url", "https://x.org/a"), ("title", "Original Title")]);
        let second = candidate(&[("url", "https://x.org/a"), ("title", "Later Title")]);
        let outcome = normalize("nsf-reu", &[first, second]);
        assert_eq!(outcome.drafts.len(), 1);
        // Normalizer fills empties only; it does not overwrite.
        assert_eq!(outcome.drafts[0].title.as_deref(), Some("Original Title"));
    }

    #[test]
    fn urlless_candidates_merge_on_fuzzy_title() {
        let candidates = vec![
            candidate(&[("title", "AI Data Contributor")]),
            candidate(&[("title", "AI Data Contributer"), ("deadline", "Mar 1")]),
            candidate(&[("title", "Completely Different Program")]),
        ];
        let outcome = normalize("nsf-reu", &candidates);
        assert_eq!(outcome.drafts.len(), 2);
        assert_eq!(outcome.drafts[0].deadline.as_deref(), Some("Mar 1"));
    }

    #[test]
    fn field_tags_accept_list_or_comma_separated_text() {
        let mut listed = CandidateRecord::default();
        listed.set_text("title", "A");
        listed.set_list("field", vec!["Biology".into(), " Ecology ".into()]);
        let mut scalar = CandidateRecord::default();
        scalar.set_text("title", "B");
        scalar.set_text("field", "Chemistry, Materials ");

        let outcome = normalize("nsf-reu", &[listed, scalar]);
        assert_eq!(outcome.drafts[0].field, vec!["Biology", "Ecology"]);
        assert_eq!(outcome.drafts[1].field, vec!["Chemistry", "Materials"]);
    }

    fn draft(title: Option<&str>, url: Option<&str>) -> ProgramDraft {
        let mut draft = ProgramDraft::new("nsf-reu");
        draft.title = title.map(ToString::to_string);
        draft.url = url.map(ToString::to_string);
        draft
    }

    fn test_logger() -> (tempfile::TempDir, ChannelLogger) {
        let dir = tempdir().expect("tempdir");
        let logger = ChannelLogger::create(dir.path()).expect("logger");
        (dir, logger)
    }

    #[tokio::test]
    async fn sync_is_idempotent_on_row_count() {
        let store = MemoryStore::new();
        let (_dir, logger) = test_logger();
        let drafts = vec![
            draft(Some("A"), Some("https://x.org/a")),
            draft(Some("B"), Some("https://x.org/b")),
        ];

        let first = sync_drafts(&store, &drafts, &logger).await;
        assert_eq!(first, SyncSummary { inserted: 2, updated: 0, failed: 0 });

        let before = store.list().await.expect("list");
        let second = sync_drafts(&store, &drafts, &logger).await;
        assert_eq!(second, SyncSummary { inserted: 0, updated: 2, failed: 0 });

        let after = store.list().await.expect("list");
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.created_at, a.created_at);
            assert!(a.updated_at >= b.updated_at);
        }
    }

    #[tokio::test]
    async fn url_match_updates_title_and_keeps_created_at() {
        let store = MemoryStore::new();
        let (_dir, logger) = test_logger();

        sync_drafts(&store, &[draft(Some("A"), Some("https://x.org/a"))], &logger).await;
        let original = store
            .find_by_url("https://x.org/a")
            .await
            .expect("lookup")
            .expect("row");

        sync_drafts(
            &store,
            &[draft(Some("A (Updated)"), Some("https://x.org/a"))],
            &logger,
        )
        .await;

        let refreshed = store
            .find_by_url("https://x.org/a")
            .await
            .expect("lookup")
            .expect("row");
        assert_eq!(refreshed.id, original.id);
        assert_eq!(refreshed.title, "A (Updated)");
        assert_eq!(refreshed.created_at, original.created_at);
        assert!(refreshed.updated_at >= original.updated_at);
    }

    #[tokio::test]
    async fn title_match_is_fallback_when_url_absent() {
        let store = MemoryStore::new();
        let (_dir, logger) = test_logger();

        sync_drafts(&store, &[draft(Some("Coastal REU"), None)], &logger).await;
        let mut incoming = draft(Some("coastal reu"), None);
        incoming.deadline = Some("Feb 1".to_string());
        let summary = sync_drafts(&store, &[incoming], &logger).await;

        assert_eq!(summary.updated, 1);
        let rows = store.list().await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].deadline.as_deref(), Some("Feb 1"));
    }

    #[tokio::test]
    async fn absent_incoming_fields_do_not_clear_stored_ones() {
        let store = MemoryStore::new();
        let (_dir, logger) = test_logger();

        let mut full = draft(Some("A"), Some("https://x.org/a"));
        full.description = Some("Ten weeks".to_string());
        full.field = vec!["Biology".to_string()];
        sync_drafts(&store, &[full], &logger).await;

        // Second pass sees the record with fewer populated fields.
        sync_drafts(&store, &[draft(Some("A"), Some("https://x.org/a"))], &logger).await;
        let row = store
            .find_by_url("https://x.org/a")
            .await
            .expect("lookup")
            .expect("row");
        assert_eq!(row.description.as_deref(), Some("Ten weeks"));
        assert_eq!(row.field, vec!["Biology"]);
    }

    /// Store wrapper that rejects writes for one url, for batch-continuation
    /// tests.
    struct RejectingStore {
        inner: MemoryStore,
        poison_url: String,
    }

    #[async_trait]
    impl ProgramStore for RejectingStore {
        async fn list(&self) -> Result<Vec<Program>, StoreError> {
            self.inner.list().await
        }
        async fn get(&self, id: Uuid) -> Result<Option<Program>, StoreError> {
            self.inner.get(id).await
        }
        async fn find_by_url(&self, url: &str) -> Result<Option<Program>, StoreError> {
            self.inner.find_by_url(url).await
        }
        async fn find_by_title_ci(&self, title: &str) -> Result<Option<Program>, StoreError> {
            self.inner.find_by_title_ci(title).await
        }
        async fn insert(&self, program: &Program) -> Result<(), StoreError> {
            if program.url.as_deref() == Some(self.poison_url.as_str()) {
                return Err(StoreError::DuplicateUrl(self.poison_url.clone()));
            }
            self.inner.insert(program).await
        }
        async fn update(&self, program: &Program) -> Result<(), StoreError> {
            self.inner.update(program).await
        }
        async fn clear_all(&self) -> Result<u64, StoreError> {
            self.inner.clear_all().await
        }
        async fn clear_field_attribute(&self) -> Result<u64, StoreError> {
            self.inner.clear_field_attribute().await
        }
    }

    #[tokio::test]
    async fn one_rejected_write_does_not_abort_the_batch() {
        let store = RejectingStore {
            inner: MemoryStore::new(),
            poison_url: "https://x.org/poison".to_string(),
        };
        let (_dir, logger) = test_logger();
        let drafts = vec![
            draft(Some("A"), Some("https://x.org/a")),
            draft(Some("Poison"), Some("https://x.org/poison")),
            draft(Some("B"), Some("https://x.org/b")),
        ];

        let summary = sync_drafts(&store, &drafts, &logger).await;
        assert_eq!(summary, SyncSummary { inserted: 2, updated: 0, failed: 1 });

        let errors =
            std::fs::read_to_string(logger.path(LogChannel::Error)).expect("error log");
        assert!(errors.contains("store rejected record"));
        assert!(errors.contains("Poison"));
    }

    fn pipeline_with(
        store: Arc<dyn ProgramStore>,
        sources_yaml: &str,
    ) -> (tempfile::TempDir, SyncPipeline) {
        let dir = tempdir().expect("tempdir");
        let sources_path = dir.path().join("sources.yaml");
        std::fs::write(&sources_path, sources_yaml).expect("write sources");
        let config = SyncConfig {
            database_url: "unused".to_string(),
            sources_path,
            log_dir: dir.path().join("logs"),
            user_agent: "reu-cafe-bot/test".to_string(),
            http_timeout_secs: 2,
            web_port: 0,
        };
        let pipeline = SyncPipeline::new(config, store).expect("pipeline");
        (dir, pipeline)
    }

    #[tokio::test]
    async fn unreachable_source_is_logged_and_skipped() {
        // Port 9 on loopback refuses connections immediately.
        let yaml = r#"
sources:
  - source_id: dead-source
    display_name: Dead Source
    url: "http://127.0.0.1:9/listing"
    payload: html
    records: "div.program"
    fields:
      title: { kind: text, selector: "h3" }
"#;
        let (_dir, pipeline) = pipeline_with(Arc::new(MemoryStore::new()), yaml);
        let summary = pipeline.run_once().await.expect("run completes");

        assert_eq!(summary.sources_total, 1);
        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.inserted, 0);
        let errors = std::fs::read_to_string(pipeline.logger().path(LogChannel::Error))
            .expect("error log");
        assert!(errors.contains("network error"));
        assert!(errors.contains("skipping source"));
    }

    #[tokio::test]
    async fn disabled_sources_are_not_fetched() {
        let yaml = r#"
sources:
  - source_id: off-source
    display_name: Off Source
    enabled: false
    url: "http://127.0.0.1:9/listing"
    payload: html
    records: "div.program"
    fields:
      title: { kind: text, selector: "h3" }
"#;
        let (_dir, pipeline) = pipeline_with(Arc::new(MemoryStore::new()), yaml);
        let summary = pipeline.run_once().await.expect("run completes");
        assert_eq!(summary.sources_total, 0);
        assert_eq!(summary.sources_failed, 0);
    }

    fn html_profile() -> SiteProfile {
        let mut fields = BTreeMap::new();
        fields.insert(
            "title".to_string(),
            FieldRule::Text {
                selector: "h3".to_string(),
            },
        );
        fields.insert(
            "url".to_string(),
            FieldRule::Attr {
                selector: "a".to_string(),
                attr: "href".to_string(),
            },
        );
        SiteProfile {
            source_id: "nsf-reu".to_string(),
            display_name: "NSF REU".to_string(),
            enabled: true,
            url: "https://example.org/reu".to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            payload: PayloadKind::Html,
            records: "div.program".to_string(),
            fields,
        }
    }

    #[tokio::test]
    async fn zero_extracted_records_logs_a_warning_and_proceeds() {
        let store: Arc<dyn ProgramStore> = Arc::new(MemoryStore::new());
        let (_dir, pipeline) = pipeline_with(store, "sources: []\n");

        let stats = pipeline
            .ingest_payload(&html_profile(), "<html><body><p>redesigned</p></body></html>")
            .await
            .expect("zero records is not a failure");
        assert_eq!(stats.extracted, 0);
        assert_eq!(stats.summary, SyncSummary::default());

        let scraper = std::fs::read_to_string(pipeline.logger().path(LogChannel::Scraper))
            .expect("scraper log");
        assert!(scraper.contains("warning: 0 records extracted"));
        let error_path = pipeline.logger().path(LogChannel::Error);
        assert!(
            !error_path.exists()
                || !std::fs::read_to_string(error_path).unwrap().contains("nsf-reu")
        );
    }

    #[tokio::test]
    async fn ingest_payload_syncs_extracted_records() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pipeline) = pipeline_with(store.clone(), "sources: []\n");

        let body = r#"<html><body>
            <div class="program"><h3>Coastal REU</h3><a href="https://x.org/a">apply</a></div>
            <div class="program"><h3>Marine REU</h3><a href="https://x.org/b">apply</a></div>
        </body></html>"#;
        let stats = pipeline
            .ingest_payload(&html_profile(), body)
            .await
            .expect("stats");
        assert_eq!(stats.extracted, 2);
        assert_eq!(stats.summary.inserted, 2);
        assert_eq!(store.list().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn unparsable_payload_counts_the_source_as_failed() {
        let store: Arc<dyn ProgramStore> = Arc::new(MemoryStore::new());
        let (_dir, pipeline) = pipeline_with(store, "sources: []\n");

        let mut profile = html_profile();
        profile.records = ":::".to_string();
        let stats = pipeline
            .ingest_payload(&profile, "<html><body></body></html>")
            .await;
        assert!(stats.is_none());

        let errors = std::fs::read_to_string(pipeline.logger().path(LogChannel::Error))
            .expect("error log");
        assert!(errors.contains("skipping source"));
    }

    #[test]
    fn config_requires_database_url() {
        let err = SyncConfig::from_lookup(|_| None).expect_err("missing url");
        assert!(matches!(err, ConfigError::MissingVar("DATABASE_URL")));
    }

    #[test]
    fn config_rejects_unparsable_timeout() {
        let err = SyncConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/reu".to_string()),
            "REU_HTTP_TIMEOUT_SECS" => Some("soon".to_string()),
            _ => None,
        })
        .expect_err("bad timeout");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "REU_HTTP_TIMEOUT_SECS",
                ..
            }
        ));
    }

    #[test]
    fn config_defaults_are_applied() {
        let config = SyncConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/reu".to_string()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.sources_path, PathBuf::from("sources.yaml"));
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.web_port, 8000);
    }

    #[test]
    fn registry_yaml_round_trip() {
        let yaml = r#"
sources:
  - source_id: nsf-reu-bio
    display_name: NSF REU Biology
    url: "https://example.org/reu"
    headers:
      Accept: "text/html"
    payload: html
    records: "div.program"
    fields:
      title: { kind: text, selector: "h3" }
      url: { kind: attr, selector: "a", attr: "href" }
      field: { kind: text_all, selector: ".tags li" }
  - source_id: reu-api
    display_name: REU JSON API
    enabled: false
    url: "https://api.example.org/programs"
    payload: json
    records: "/data/programs"
    fields:
      title: { kind: pointer, pointer: "/name" }
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(registry.sources.len(), 2);
        assert!(registry.sources[0].enabled);
        assert!(!registry.sources[1].enabled);
        assert_eq!(registry.sources[0].headers["Accept"], "text/html");
    }
}
