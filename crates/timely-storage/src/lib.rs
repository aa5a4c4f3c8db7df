//! Page fetching, page archive and the SQLite deadline store for Timely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod store;

pub use store::{DeadlineStore, DueReminder, MergeOutcome, NewReminder, StoreError, UpsertOutcome};

pub const CRATE_NAME: &str = "timely-storage";

/// Document as retrieved from the source page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reading fixture page {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-shot HTTP GET. Failures are returned as-is; the scheduler's next
/// tick is the only retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| map_request_error(err, url))?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .text()
                .await
                .map_err(|err| map_request_error(err, url))?;
            debug!(bytes = body.len(), "fetched page");
            Ok(FetchedPage {
                url: final_url,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

fn map_request_error(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}

/// Where a scrape cycle gets its document from.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn url(&self) -> &str;
    async fn fetch_page(&self, run_id: Uuid) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpPageSource {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpPageSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_page(&self, run_id: Uuid) -> Result<FetchedPage, FetchError> {
        self.fetcher.fetch_page(run_id, &self.url).await
    }
}

/// Serves a fixed document; used for fixture-driven scrapes and tests.
#[derive(Debug, Clone)]
pub struct StaticPageSource {
    url: String,
    body: String,
}

impl StaticPageSource {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
        }
    }

    pub fn from_file(url: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|source| FetchError::Fixture {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(url, body))
    }
}

#[async_trait]
impl PageSource for StaticPageSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_page(&self, _run_id: Uuid) -> Result<FetchedPage, FetchError> {
        Ok(FetchedPage {
            url: self.url.clone(),
            body: self.body.clone(),
            fetched_at: Utc::now(),
        })
    }
}

/// SHA-256 hex digest of a page body.
pub fn content_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Copies of fetched pages under `<root>/<fetch date>/<content hash>.html`,
/// kept so parser fixtures can be rebuilt from real layouts.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, page: &FetchedPage) -> PathBuf {
        self.root
            .join(page.fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{}.html", content_hash(&page.body)))
    }

    /// Returns the new file's path, or `None` when this page was already
    /// archived that day. Readers never see a partially written file.
    pub async fn keep(&self, page: &FetchedPage) -> anyhow::Result<Option<PathBuf>> {
        let path = self.path_for(page);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating archive directory {}", dir.display()))?;
        }
        let partial = path.with_extension("html.part");
        fs::write(&partial, page.body.as_bytes())
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        fs::rename(&partial, &path)
            .await
            .with_context(|| format!("moving archived page into {}", path.display()))?;
        debug!(path = %path.display(), "archived fetched page");
        Ok(Some(path))
    }
}
