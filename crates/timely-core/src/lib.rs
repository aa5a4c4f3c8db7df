//! Core domain model for Timely: deadlines, categories, reminders, identity keys.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "timely-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Medical,
    Housing,
    Financial,
    Academic,
    Registration,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Medical,
        Category::Housing,
        Category::Financial,
        Category::Academic,
        Category::Registration,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Medical => "Medical",
            Category::Housing => "Housing",
            Category::Financial => "Financial",
            Category::Academic => "Academic",
            Category::Registration => "Registration",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownCategory(trimmed.to_string()))
    }
}

/// Field tuple pulled out of the page markup, before any date or category work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeadline {
    pub title: String,
    pub date_text: Option<String>,
    pub description: String,
    pub link: Option<String>,
    #[serde(default)]
    pub category_hint: Option<String>,
    /// Heading text of the page section the item was found under.
    #[serde(default)]
    pub section: Option<String>,
}

/// Normalized deadline ready for the store. `observed_at` becomes the
/// created/updated timestamp of the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineDraft {
    pub identity_key: String,
    pub title: String,
    pub category: Category,
    pub due_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub description: String,
    pub link: Option<String>,
    pub is_critical: bool,
    pub is_event: bool,
    pub observed_at: DateTime<Utc>,
}

/// Persisted deadline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    pub id: i64,
    pub identity_key: String,
    pub title: String,
    pub category: Category,
    pub due_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub description: String,
    pub link: Option<String>,
    pub is_critical: bool,
    pub is_event: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deadline {
    pub fn time_until(&self, now: DateTime<Utc>) -> Duration {
        self.due_at - now
    }

    pub fn is_due_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.due_at >= now && self.due_at <= now + window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ReminderTarget {
    User(u64),
    Channel(u64),
}

impl ReminderTarget {
    /// Mention markup understood by the chat platform.
    pub fn mention(&self) -> String {
        match self {
            ReminderTarget::User(id) => format!("<@{id}>"),
            ReminderTarget::Channel(id) => format!("<#{id}>"),
        }
    }
}

impl fmt::Display for ReminderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReminderTarget::User(id) => write!(f, "user:{id}"),
            ReminderTarget::Channel(id) => write!(f, "channel:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid reminder target: {0} (expected user:<id> or channel:<id>)")]
pub struct InvalidReminderTarget(pub String);

impl FromStr for ReminderTarget {
    type Err = InvalidReminderTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidReminderTarget(s.to_string());
        let (kind, id) = s.trim().split_once(':').ok_or_else(invalid)?;
        let id: u64 = id.trim().parse().map_err(|_| invalid())?;
        match kind.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(ReminderTarget::User(id)),
            "channel" => Ok(ReminderTarget::Channel(id)),
            _ => Err(invalid()),
        }
    }
}

/// One-shot reminder, deleted after it has been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRequest {
    pub id: i64,
    pub target: ReminderTarget,
    pub deadline_id: i64,
    pub lead_minutes: i64,
    pub remind_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Open,
    Dismissed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Open => "open",
            ReviewStatus::Dismissed => "dismissed",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ReviewStatus::Open),
            "dismissed" => Ok(ReviewStatus::Dismissed),
            other => Err(other.to_string()),
        }
    }
}

/// Pair of stored deadlines with different identity keys but near-identical
/// titles, waiting for an admin to merge or dismiss them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: i64,
    pub deadline_a: i64,
    pub title_a: String,
    pub deadline_b: i64,
    pub title_b: String,
    pub confidence: f64,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

/// Keyword rules that map free text onto a [`Category`]. Rules are checked in
/// order and the first rule with a matching keyword wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub rules: Vec<CategoryRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: Category,
    pub keywords: Vec<String>,
}

impl CategoryRules {
    pub fn builtin() -> Self {
        let rule = |category, keywords: &[&str]| CategoryRule {
            category,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        };
        Self {
            rules: vec![
                rule(
                    Category::Medical,
                    &[
                        "medical",
                        "health",
                        "vaccination",
                        "vaccinations",
                        "vaccine",
                        "immunization",
                        "immunizations",
                    ],
                ),
                rule(
                    Category::Housing,
                    &["housing", "residence", "room", "roommate", "dorm"],
                ),
                rule(
                    Category::Financial,
                    &[
                        "tuition",
                        "payment",
                        "bill",
                        "billing",
                        "financial",
                        "fee",
                        "fees",
                        "meal plan",
                    ],
                ),
                rule(
                    Category::Academic,
                    &[
                        "academic",
                        "transcript",
                        "transcripts",
                        "essay",
                        "test",
                        "exam",
                        "exams",
                        "placement",
                        "ap",
                        "ib",
                    ],
                ),
                rule(
                    Category::Registration,
                    &["registration", "register", "sign up", "application", "enroll"],
                ),
            ],
        }
    }

    /// First matching category, or `None` when no keyword appears.
    pub fn categorize(&self, text: &str) -> Option<Category> {
        let haystack = padded_tokens(text);
        self.rules
            .iter()
            .find(|rule| rule.matches(&haystack))
            .map(|rule| rule.category)
    }

    /// Every category mentioned by name or keyword, in rule order.
    pub fn mentioned(&self, text: &str) -> Vec<Category> {
        let haystack = padded_tokens(text);
        let mut out: Vec<Category> = self
            .rules
            .iter()
            .filter(|rule| {
                rule.matches(&haystack)
                    || haystack.contains(&padded_tokens(rule.category.as_str()))
            })
            .map(|rule| rule.category)
            .collect();
        out.dedup();
        out
    }
}

impl CategoryRule {
    fn matches(&self, padded_haystack: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| padded_haystack.contains(&padded_tokens(keyword)))
    }
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Lower-case, map non-alphanumerics to spaces and collapse whitespace.
pub fn normalize_title(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// Surrounding spaces turn substring search into whole-word search.
fn padded_tokens(input: &str) -> String {
    format!(" {} ", normalize_title(input))
}

/// Stable identity for a deadline: SHA-256 over the normalized title and the
/// UTC due date.
pub fn identity_key(title: &str, due_at: DateTime<Utc>) -> String {
    let material = format!("{}|{}", normalize_title(title), due_at.format("%Y-%m-%d"));
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

/// Source of the current time, injected wherever behaviour depends on "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
