//! Chat, reminders and digest: everything that reads deadlines on behalf of a
//! user instead of writing them.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::Duration;
use chrono_tz::Tz;

pub mod ai;
pub mod cache;
pub mod context;
pub mod digest;
pub mod reminders;
pub mod responder;

pub use ai::{clean_response, AiError, ChatRequest, ChatRole, ChatTurn, DisabledGenerator, GeminiClient, GeminiConfig, TextGenerator};
pub use cache::{DeadlineSnapshot, SnapshotCache};
pub use context::ContextBuilder;
pub use digest::{build_digest, Digest, DigestEntry, EventEntry};
pub use reminders::{
    render_reminder, run_reminder_loop, DispatchReport, LogSink, ReminderError, ReminderService, ReminderSink,
    WebhookSink,
};
pub use responder::{ChatReply, ChatResponder, FALLBACK_REPLY};

pub const CRATE_NAME: &str = "timely-chat";

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-lite";

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub ai_timeout_secs: u64,
    pub urgency_days: i64,
    pub cache_ttl_secs: u64,
    pub reminder_check_secs: u64,
    pub reminder_webhook_url: Option<String>,
    pub timezone: String,
}

impl ChatConfig {
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string()),
            ai_timeout_secs: std::env::var("TIMELY_AI_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            urgency_days: std::env::var("TIMELY_URGENCY_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|days| *days > 0)
                .unwrap_or(3),
            cache_ttl_secs: std::env::var("TIMELY_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            reminder_check_secs: std::env::var("TIMELY_REMINDER_CHECK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(300),
            reminder_webhook_url: std::env::var("TIMELY_REMINDER_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            timezone: std::env::var("TIMELY_TIMEZONE")
                .unwrap_or_else(|_| "America/New_York".to_string()),
        }
    }

    pub fn urgency_window(&self) -> Result<Duration> {
        Duration::try_days(self.urgency_days)
            .ok_or_else(|| anyhow!("TIMELY_URGENCY_DAYS out of range: {}", self.urgency_days))
    }

    pub fn cache_ttl(&self) -> Result<Duration> {
        i64::try_from(self.cache_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| anyhow!("TIMELY_CACHE_TTL_SECS out of range: {}", self.cache_ttl_secs))
    }

    pub fn reminder_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.reminder_check_secs)
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("unknown timezone {:?}: {e}", self.timezone))
    }

    /// Gemini when a key is configured, otherwise a generator that always
    /// fails so every reply is the fallback.
    pub fn build_generator(&self) -> Result<Arc<dyn TextGenerator>> {
        match &self.gemini_api_key {
            Some(key) => {
                let client = GeminiClient::new(GeminiConfig {
                    api_key: key.clone(),
                    model: self.gemini_model.clone(),
                    base_url: self.gemini_base_url.clone(),
                    timeout: StdDuration::from_secs(self.ai_timeout_secs),
                    ..GeminiConfig::default()
                })?;
                Ok(Arc::new(client))
            }
            None => {
                tracing::warn!("GEMINI_API_KEY not set; chat replies will use the fallback");
                Ok(Arc::new(DisabledGenerator))
            }
        }
    }

    pub fn build_sink(&self) -> Result<Arc<dyn ReminderSink>> {
        match &self.reminder_webhook_url {
            Some(url) => Ok(Arc::new(WebhookSink::new(url.clone())?)),
            None => Ok(Arc::new(LogSink)),
        }
    }
}
