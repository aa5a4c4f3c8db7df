//! One-shot personal reminders: scheduling, delivery sinks and the check loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use timely_core::{Clock, ReminderRequest, ReminderTarget};
use timely_storage::{DeadlineStore, DueReminder, NewReminder, StoreError};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Longest lead time a reminder may be scheduled with.
pub const MAX_LEAD_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum ReminderError {
    #[error("deadline {0} not found")]
    DeadlineNotFound(i64),
    #[error("reminder {0} not found")]
    ReminderNotFound(i64),
    #[error("lead time must be between one minute and 365 days")]
    InvalidLead,
    #[error("reminder time {remind_at} has already passed")]
    AlreadyDue { remind_at: DateTime<Utc> },
    #[error("reminder delivery failed: {0}")]
    Delivery(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReminderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DeadlineNotFound(id) => ReminderError::DeadlineNotFound(id),
            StoreError::ReminderNotFound(id) => ReminderError::ReminderNotFound(id),
            other => ReminderError::Store(other),
        }
    }
}

/// Where reminder messages go.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn deliver(&self, target: ReminderTarget, message: &str) -> Result<(), ReminderError>;
}

/// Writes reminders to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl ReminderSink for LogSink {
    async fn deliver(&self, target: ReminderTarget, message: &str) -> Result<(), ReminderError> {
        info!(%target, message, "reminder");
        Ok(())
    }
}

/// Posts reminders to a chat webhook as `{"content": ...}`.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(10))
            .build()
            .context("building webhook HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReminderSink for WebhookSink {
    async fn deliver(&self, target: ReminderTarget, message: &str) -> Result<(), ReminderError> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "content": message }))
            .send()
            .await
            .map_err(|e| ReminderError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReminderError::Delivery(format!(
                "webhook for {target} returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Delivered but still stored; these will be sent again.
    pub not_cleared: usize,
}

pub struct ReminderService {
    store: DeadlineStore,
    sink: Arc<dyn ReminderSink>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
}

impl ReminderService {
    pub fn new(store: DeadlineStore, sink: Arc<dyn ReminderSink>, clock: Arc<dyn Clock>, timezone: Tz) -> Self {
        Self {
            store,
            sink,
            clock,
            timezone,
        }
    }

    /// Schedules a reminder `lead` before the deadline is due.
    pub async fn schedule(
        &self,
        target: ReminderTarget,
        deadline_id: i64,
        lead: Duration,
    ) -> Result<ReminderRequest, ReminderError> {
        if lead < Duration::minutes(1) || lead > Duration::days(MAX_LEAD_DAYS) {
            return Err(ReminderError::InvalidLead);
        }
        let deadline = self
            .store
            .get(deadline_id)
            .await?
            .ok_or(ReminderError::DeadlineNotFound(deadline_id))?;

        let now = self.clock.now();
        let remind_at = deadline
            .due_at
            .checked_sub_signed(lead)
            .ok_or(ReminderError::InvalidLead)?;
        if remind_at <= now {
            return Err(ReminderError::AlreadyDue { remind_at });
        }

        let request = self
            .store
            .add_reminder(&NewReminder {
                target,
                deadline_id,
                lead_minutes: lead.num_minutes(),
                remind_at,
                created_at: now,
            })
            .await?;
        info!(%target, deadline_id, %remind_at, "reminder scheduled");
        Ok(request)
    }

    pub async fn list_for(&self, target: ReminderTarget) -> Result<Vec<ReminderRequest>, ReminderError> {
        Ok(self.store.reminders_for_target(target).await?)
    }

    pub async fn cancel(&self, id: i64) -> Result<(), ReminderError> {
        Ok(self.store.delete_reminder(id).await?)
    }

    /// Delivers every reminder whose time has come. Delivered reminders are
    /// deleted; failed ones stay and are retried on the next pass.
    pub async fn dispatch_due(&self) -> Result<DispatchReport, ReminderError> {
        let now = self.clock.now();
        let mut report = DispatchReport::default();
        for due in self.store.due_reminders(now).await? {
            let message = render_reminder(&due, self.timezone, now);
            match self.sink.deliver(due.request.target, &message).await {
                Ok(()) => {
                    report.delivered += 1;
                    if let Err(err) = self.store.delete_reminder(due.request.id).await {
                        warn!(reminder_id = due.request.id, error = %err, "delivered reminder not cleared");
                        report.not_cleared += 1;
                    }
                }
                Err(err) => {
                    warn!(reminder_id = due.request.id, error = %err, "reminder delivery failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

pub fn render_reminder(due: &DueReminder, timezone: Tz, now: DateTime<Utc>) -> String {
    let deadline = &due.deadline;
    let local = deadline.due_at.with_timezone(&timezone);
    let mut message = format!(
        "{} reminder: **{}** is due {} ({})",
        due.request.target.mention(),
        deadline.title,
        local.format("%a %b %-d at %-I:%M %p %Z"),
        time_left(deadline.due_at - now)
    );
    if let Some(link) = &deadline.link {
        message.push_str(&format!("\n{link}"));
    }
    message
}

fn time_left(left: Duration) -> String {
    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("in 1 {unit}")
        } else {
            format!("in {n} {unit}s")
        }
    };
    if left <= Duration::zero() {
        "now".to_string()
    } else if left >= Duration::days(1) {
        plural(left.num_days(), "day")
    } else if left >= Duration::hours(1) {
        plural(left.num_hours(), "hour")
    } else {
        plural(left.num_minutes().max(1), "minute")
    }
}

/// Dispatches due reminders every `every`, logging failures.
pub async fn run_reminder_loop(service: Arc<ReminderService>, every: StdDuration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match service.dispatch_due().await {
            Ok(report) if report.delivered + report.failed > 0 => {
                info!(
                    delivered = report.delivered,
                    failed = report.failed,
                    not_cleared = report.not_cleared,
                    "reminders dispatched"
                );
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "reminder check failed"),
        }
    }
}
