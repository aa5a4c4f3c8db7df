//! Raw tuple to deadline: date resolution, category rules, identity key.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;
use timely_adapters::{month_from_text, parse_due, DateError};
use timely_core::{identity_key, normalize_title, Category, CategoryRule, CategoryRules, DeadlineDraft, RawDeadline};
use tracing::warn;

pub const CRITICAL_KEYWORDS: &[&str] = &[
    "must",
    "required",
    "mandatory",
    "deadline",
    "due",
    "final",
    "important",
    "critical",
    "essential",
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("item has an empty title")]
    EmptyTitle,
    #[error("no date found for {title:?}")]
    MissingDate { title: String },
    #[error("date parse failure for {title:?}: {source}")]
    Date {
        title: String,
        #[source]
        source: DateError,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

/// Reads category rules from YAML:
///
/// ```yaml
/// version: 1
/// rules:
///   - category: Medical
///     keywords: [health, immunization]
/// ```
pub fn load_category_rules(path: &Path) -> anyhow::Result<CategoryRules> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading category rules {}", path.display()))?;
    let file: CategoryRulesFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing category rules {}", path.display()))?;
    anyhow::ensure!(
        !file.rules.is_empty(),
        "category rules {} define no rules",
        path.display()
    );
    Ok(CategoryRules { rules: file.rules })
}

pub fn is_critical(text: &str) -> bool {
    let padded = format!(" {} ", normalize_title(text));
    CRITICAL_KEYWORDS
        .iter()
        .any(|keyword| padded.contains(&format!(" {keyword} ")))
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub drafts: Vec<DeadlineDraft>,
    pub discarded: usize,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: CategoryRules,
    timezone: Tz,
}

impl Normalizer {
    pub fn new(rules: CategoryRules, timezone: Tz) -> Self {
        Self { rules, timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn rules(&self) -> &CategoryRules {
        &self.rules
    }

    /// An explicit hint naming a category wins; otherwise the first rule that
    /// matches title or description, otherwise `Other`.
    pub fn categorize(&self, raw: &RawDeadline) -> Category {
        if let Some(category) = raw
            .category_hint
            .as_deref()
            .and_then(|hint| hint.parse::<Category>().ok())
        {
            return category;
        }
        self.rules
            .categorize(&format!("{} {}", raw.title, raw.description))
            .unwrap_or(Category::Other)
    }

    pub fn normalize(
        &self,
        raw: &RawDeadline,
        reference: DateTime<Utc>,
    ) -> Result<DeadlineDraft, NormalizeError> {
        let title = raw.title.trim();
        if title.is_empty() {
            return Err(NormalizeError::EmptyTitle);
        }
        let date_text = raw
            .date_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NormalizeError::MissingDate {
                title: title.to_string(),
            })?;

        let fallback_month = raw.section.as_deref().and_then(month_from_text);
        let resolved = parse_due(date_text, reference, self.timezone, fallback_month).map_err(
            |source| NormalizeError::Date {
                title: title.to_string(),
                source,
            },
        )?;

        let description = raw.description.trim().to_string();
        Ok(DeadlineDraft {
            identity_key: identity_key(title, resolved.due_at),
            title: title.to_string(),
            category: self.categorize(raw),
            due_at: resolved.due_at,
            start_at: resolved.start_at,
            is_critical: is_critical(&format!("{title} {description}")),
            is_event: resolved.start_at.is_some(),
            description,
            link: raw.link.clone(),
            observed_at: reference,
        })
    }

    /// Normalizes every tuple; each one either becomes a draft or is counted
    /// as discarded with a warning.
    pub fn normalize_all(&self, raws: &[RawDeadline], reference: DateTime<Utc>) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        for raw in raws {
            match self.normalize(raw, reference) {
                Ok(draft) => report.drafts.push(draft),
                Err(err) => {
                    warn!(
                        title = %raw.title,
                        date_text = raw.date_text.as_deref().unwrap_or(""),
                        error = %err,
                        "discarding deadline item"
                    );
                    report.discarded += 1;
                }
            }
        }
        report
    }
}
