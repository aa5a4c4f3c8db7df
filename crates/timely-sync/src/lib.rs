//! Scrape cycle orchestration: fetch, extract, normalize, store, review.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use timely_adapters::{DeadlineExtractor, SectionListExtractor};
use timely_core::{CategoryRules, Clock};
use timely_storage::{
    DeadlineStore, FetchError, HttpClientConfig, HttpFetcher, HttpPageSource, PageArchive, PageSource,
    StoreError, UpsertOutcome,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dedup;
pub mod normalize;

pub use dedup::{ReviewCandidate, ReviewConfig, ReviewEngine};
pub use normalize::{is_critical, load_category_rules, NormalizeError, NormalizeReport, Normalizer};

pub const CRATE_NAME: &str = "timely-sync";

pub const DEFAULT_SOURCE_URL: &str = "https://firstyear.mit.edu/orientation/countdown-to-campus-before-you-arrive/critical-summer-actions-and-deadlines/";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub source_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub rules_path: Option<PathBuf>,
    pub timezone: String,
    pub scheduler_enabled: bool,
    pub scrape_interval_hours: u64,
    pub review_threshold: f64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/deadlines.db".to_string()),
            source_url: std::env::var("TIMELY_SOURCE_URL")
                .unwrap_or_else(|_| DEFAULT_SOURCE_URL.to_string()),
            user_agent: std::env::var("TIMELY_USER_AGENT")
                .unwrap_or_else(|_| "timely-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("TIMELY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            archive_dir: std::env::var("TIMELY_ARCHIVE_DIR").ok().map(PathBuf::from),
            rules_path: std::env::var("TIMELY_RULES_PATH").ok().map(PathBuf::from),
            timezone: std::env::var("TIMELY_TIMEZONE")
                .unwrap_or_else(|_| "America/New_York".to_string()),
            scheduler_enabled: std::env::var("TIMELY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            scrape_interval_hours: std::env::var("SCRAPE_INTERVAL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|hours| *hours > 0)
                .unwrap_or(6),
            review_threshold: std::env::var("TIMELY_REVIEW_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.88),
        }
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("unknown timezone {:?}: {e}", self.timezone))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Fetching,
    Parsing,
    Normalizing,
    Storing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    Scheduled,
    Admin,
    Cli,
}

impl fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerOrigin::Scheduled => "scheduled",
            TriggerOrigin::Admin => "admin",
            TriggerOrigin::Cli => "cli",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub origin: TriggerOrigin,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extracted: usize,
    pub normalized: usize,
    pub discarded: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub flagged_for_review: usize,
    pub parse_failure: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    pub stage: Stage,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_summary: Option<ScrapeSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completed(ScrapeSummary),
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("network failure: {0}")]
    Network(#[from] FetchError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

// Clears the busy flag however the cycle ends. A cycle dropped mid-run
// (caller went away) also returns the stage to idle.
struct CycleGuard<'a> {
    pipeline: &'a ScrapePipeline,
}

impl<'a> CycleGuard<'a> {
    fn acquire(pipeline: &'a ScrapePipeline) -> Option<Self> {
        pipeline
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { pipeline })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        {
            let mut status = self.pipeline.lock_status();
            if status.stage != Stage::Idle {
                warn!(stage = ?status.stage, "scrape cycle abandoned");
                status.stage = Stage::Idle;
                status.last_error = Some("scrape cycle cancelled".to_string());
            }
        }
        self.pipeline.busy.store(false, Ordering::Release);
    }
}

pub struct ScrapePipeline {
    source: Arc<dyn PageSource>,
    extractor: Arc<dyn DeadlineExtractor>,
    normalizer: Normalizer,
    store: DeadlineStore,
    review: ReviewEngine,
    archive: Option<PageArchive>,
    clock: Arc<dyn Clock>,
    status: Mutex<PipelineStatus>,
    busy: AtomicBool,
}

impl ScrapePipeline {
    pub fn new(
        source: Arc<dyn PageSource>,
        extractor: Arc<dyn DeadlineExtractor>,
        normalizer: Normalizer,
        store: DeadlineStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            extractor,
            normalizer,
            store,
            review: ReviewEngine::default(),
            archive: None,
            clock,
            status: Mutex::new(PipelineStatus::default()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn with_review(mut self, review: ReviewEngine) -> Self {
        self.review = review;
        self
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &DeadlineStore {
        &self.store
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PipelineStatus {
        self.lock_status().clone()
    }

    fn lock_status(&self) -> MutexGuard<'_, PipelineStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_stage(&self, stage: Stage) {
        self.lock_status().stage = stage;
    }

    /// Runs one cycle unless one is already in flight, in which case this is
    /// a no-op reporting `AlreadyRunning`.
    pub async fn trigger(&self, origin: TriggerOrigin) -> Result<TriggerOutcome, ScrapeError> {
        let Some(_guard) = CycleGuard::acquire(self) else {
            info!(%origin, "scrape already in flight; trigger ignored");
            return Ok(TriggerOutcome::AlreadyRunning);
        };

        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        self.lock_status().last_started_at = Some(started_at);

        let span = info_span!("scrape_cycle", %run_id, %origin);
        let result = self
            .run_cycle(run_id, origin, started_at)
            .instrument(span)
            .await;

        let mut status = self.lock_status();
        status.stage = Stage::Idle;
        match &result {
            Ok(summary) if summary.parse_failure => {
                status.last_error = Some("parse failure: no deadline items extracted".to_string());
                status.last_summary = Some(summary.clone());
            }
            Ok(summary) => {
                status.last_success_at = Some(summary.finished_at);
                status.last_error = None;
                status.last_summary = Some(summary.clone());
            }
            Err(err) => {
                status.last_error = Some(err.to_string());
            }
        }
        drop(status);

        result.map(TriggerOutcome::Completed)
    }

    /// Timer entry point: failures are logged and left for the next tick.
    pub async fn run_scheduled(&self) {
        match self.trigger(TriggerOrigin::Scheduled).await {
            Ok(TriggerOutcome::Completed(summary)) => info!(
                run_id = %summary.run_id,
                inserted = summary.inserted,
                updated = summary.updated,
                parse_failure = summary.parse_failure,
                "scheduled scrape finished"
            ),
            Ok(TriggerOutcome::AlreadyRunning) => info!("scheduled scrape skipped; cycle in flight"),
            Err(err) => error!(error = %err, "scheduled scrape failed"),
        }
    }

    async fn run_cycle(
        &self,
        run_id: Uuid,
        origin: TriggerOrigin,
        started_at: DateTime<Utc>,
    ) -> Result<ScrapeSummary, ScrapeError> {
        let mut summary = ScrapeSummary {
            run_id,
            origin,
            started_at,
            finished_at: started_at,
            extracted: 0,
            normalized: 0,
            discarded: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            flagged_for_review: 0,
            parse_failure: false,
        };

        self.set_stage(Stage::Fetching);
        let page = self.source.fetch_page(run_id).await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.keep(&page).await {
                warn!(error = %err, "archiving fetched page failed");
            }
        }

        self.set_stage(Stage::Parsing);
        let raws = self.extractor.extract(&page);
        summary.extracted = raws.len();
        if raws.is_empty() {
            warn!(
                extractor = self.extractor.name(),
                url = %page.url,
                "parse failure; store left untouched"
            );
            summary.parse_failure = true;
            summary.finished_at = self.clock.now();
            return Ok(summary);
        }

        self.set_stage(Stage::Normalizing);
        let report = self.normalizer.normalize_all(&raws, started_at);
        summary.normalized = report.drafts.len();
        summary.discarded = report.discarded;

        self.set_stage(Stage::Storing);
        for draft in &report.drafts {
            match self.store.upsert(draft).await? {
                UpsertOutcome::Inserted(_) => summary.inserted += 1,
                UpsertOutcome::Updated(_) => summary.updated += 1,
                UpsertOutcome::Unchanged(_) => summary.unchanged += 1,
            }
        }

        let now = self.clock.now();
        let upcoming = self.store.list_upcoming(now).await?;
        for candidate in self.review.candidates(&upcoming) {
            if self
                .store
                .flag_for_review(candidate.first, candidate.second, candidate.confidence, now)
                .await?
            {
                summary.flagged_for_review += 1;
            }
        }

        summary.finished_at = self.clock.now();
        info!(
            extracted = summary.extracted,
            normalized = summary.normalized,
            discarded = summary.discarded,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            flagged = summary.flagged_for_review,
            "scrape cycle complete"
        );
        Ok(summary)
    }
}

pub fn http_source(config: &SyncConfig) -> Result<Arc<dyn PageSource>> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    Ok(Arc::new(HttpPageSource::new(fetcher, config.source_url.clone())))
}

pub fn build_pipeline(
    config: &SyncConfig,
    store: DeadlineStore,
    clock: Arc<dyn Clock>,
    source: Arc<dyn PageSource>,
) -> Result<ScrapePipeline> {
    let rules = match &config.rules_path {
        Some(path) => load_category_rules(path)?,
        None => CategoryRules::builtin(),
    };
    let normalizer = Normalizer::new(rules, config.timezone()?);
    let mut pipeline = ScrapePipeline::new(
        source,
        Arc::new(SectionListExtractor::new()),
        normalizer,
        store,
        clock,
    )
    .with_review(ReviewEngine::new(ReviewConfig {
        review_threshold: config.review_threshold,
    }));
    if let Some(dir) = &config.archive_dir {
        pipeline = pipeline.with_archive(PageArchive::new(dir.clone()));
    }
    Ok(pipeline)
}

/// Starts the fixed-interval scrape job plus one run right away. Returns
/// `None` when the scheduler is disabled.
pub async fn maybe_start_scheduler(
    pipeline: Arc<ScrapePipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        info!("scheduler disabled");
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let interval = Duration::from_secs(config.scrape_interval_hours.saturating_mul(3600));
    let job_pipeline = pipeline.clone();
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let pipeline = job_pipeline.clone();
        Box::pin(async move {
            pipeline.run_scheduled().await;
        })
    })
    .context("creating scrape job")?;
    sched.add(job).await.context("adding scrape job")?;
    sched.start().await.context("starting scheduler")?;

    tokio::spawn(async move {
        pipeline.run_scheduled().await;
    });

    info!(interval_hours = config.scrape_interval_hours, "scheduler started");
    Ok(Some(sched))
}
