//! Picks the deadlines worth showing the model for a given message.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use timely_core::{normalize_title, CategoryRules, Deadline};

use crate::cache::DeadlineSnapshot;

pub const URGENCY_WORDS: &[&str] = &[
    "due",
    "deadline",
    "deadlines",
    "soon",
    "urgent",
    "when",
    "this week",
    "upcoming",
    "next",
];

const MAX_CONTEXT_LINES: usize = 8;

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    rules: CategoryRules,
    urgency_window: Duration,
    timezone: Tz,
}

impl ContextBuilder {
    pub fn new(rules: CategoryRules, urgency_window: Duration, timezone: Tz) -> Self {
        Self {
            rules,
            urgency_window,
            timezone,
        }
    }

    pub fn urgency_window(&self) -> Duration {
        self.urgency_window
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn mentions_urgency(message: &str) -> bool {
        let padded = format!(" {} ", normalize_title(message));
        URGENCY_WORDS
            .iter()
            .any(|word| padded.contains(&format!(" {word} ")))
    }

    /// Whether `build` could return anything for this message. Lets callers
    /// skip the snapshot entirely for small talk.
    pub fn wants_context(&self, message: &str) -> bool {
        Self::mentions_urgency(message) || !self.rules.mentioned(message).is_empty()
    }

    pub fn build(&self, message: &str, snapshot: &DeadlineSnapshot, now: DateTime<Utc>) -> Option<String> {
        let categories = self.rules.mentioned(message);
        let urgent = Self::mentions_urgency(message);
        if categories.is_empty() && !urgent {
            return None;
        }

        let mut picked: Vec<&Deadline> = Vec::new();
        for category in &categories {
            picked.extend(snapshot.by_category(*category, now));
        }
        if urgent {
            picked.extend(snapshot.urgent(now, self.urgency_window));
        }
        picked.sort_by_key(|d| (d.due_at, d.id));
        picked.dedup_by_key(|d| d.id);

        if picked.is_empty() {
            return Some("No matching upcoming deadlines are on record.".to_string());
        }

        let mut lines = vec!["Upcoming deadlines:".to_string()];
        lines.extend(
            picked
                .iter()
                .take(MAX_CONTEXT_LINES)
                .map(|deadline| self.line(deadline)),
        );
        if picked.len() > MAX_CONTEXT_LINES {
            lines.push(format!("(and {} more)", picked.len() - MAX_CONTEXT_LINES));
        }
        Some(lines.join("\n"))
    }

    fn line(&self, deadline: &Deadline) -> String {
        let due = deadline
            .due_at
            .with_timezone(&self.timezone)
            .format("%a %b %-d, %-I:%M %p %Z");
        let mut line = format!("- {} [{}] due {due}", deadline.title, deadline.category);
        if deadline.is_critical {
            line.push_str(" (critical)");
        }
        if let Some(link) = &deadline.link {
            line.push_str(&format!(" {link}"));
        }
        line
    }
}
