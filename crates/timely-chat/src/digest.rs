//! Daily digest: what is urgent, what is coming up, which events start soon.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use timely_core::{Category, Deadline};

pub const URGENT_LIMIT: usize = 5;
pub const COMING_UP_LIMIT: usize = 8;
const LOOKAHEAD_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestEntry {
    pub id: i64,
    pub title: String,
    pub category: Category,
    pub due_at: DateTime<Utc>,
    pub days_left: i64,
    pub is_critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEntry {
    pub id: i64,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub starts_in_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    #[serde(skip)]
    timezone: Tz,
    pub urgent: Vec<DigestEntry>,
    pub urgent_total: usize,
    pub coming_up: Vec<DigestEntry>,
    pub coming_up_total: usize,
    pub events: Vec<EventEntry>,
}

// Whole calendar days between two instants in the campus timezone.
fn days_between(from: DateTime<Utc>, to: DateTime<Utc>, timezone: Tz) -> i64 {
    (to.with_timezone(&timezone).date_naive() - from.with_timezone(&timezone).date_naive()).num_days()
}

/// Splits deadlines due in the next seven days into urgent (inside the
/// urgency window) and coming up. Events are listed by start instead.
pub fn build_digest(deadlines: &[Deadline], now: DateTime<Utc>, urgency_window: Duration, timezone: Tz) -> Digest {
    let lookahead = Duration::days(LOOKAHEAD_DAYS);
    let mut sorted: Vec<&Deadline> = deadlines.iter().collect();
    sorted.sort_by_key(|d| (d.due_at, d.id));

    let mut urgent = Vec::new();
    let mut coming_up = Vec::new();
    let mut events = Vec::new();
    for deadline in sorted {
        if deadline.is_event {
            if let Some(start_at) = deadline.start_at {
                if start_at >= now && start_at <= now + lookahead {
                    events.push(EventEntry {
                        id: deadline.id,
                        title: deadline.title.clone(),
                        start_at,
                        end_at: deadline.due_at,
                        starts_in_days: days_between(now, start_at, timezone),
                    });
                }
            }
            continue;
        }
        if !deadline.is_due_within(now, lookahead) {
            continue;
        }
        let entry = DigestEntry {
            id: deadline.id,
            title: deadline.title.clone(),
            category: deadline.category,
            due_at: deadline.due_at,
            days_left: days_between(now, deadline.due_at, timezone),
            is_critical: deadline.is_critical,
        };
        if deadline.is_due_within(now, urgency_window) {
            urgent.push(entry);
        } else {
            coming_up.push(entry);
        }
    }
    events.sort_by_key(|e| (e.start_at, e.id));

    let urgent_total = urgent.len();
    let coming_up_total = coming_up.len();
    urgent.truncate(URGENT_LIMIT);
    coming_up.truncate(COMING_UP_LIMIT);
    Digest {
        generated_at: now,
        timezone,
        urgent,
        urgent_total,
        coming_up,
        coming_up_total,
        events,
    }
}

fn when(days: i64) -> String {
    match days {
        i64::MIN..=0 => "today".to_string(),
        1 => "tomorrow".to_string(),
        n => format!("in {n} days"),
    }
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.urgent_total == 0 && self.coming_up_total == 0 && self.events.is_empty()
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return "Nothing due in the next 7 days.".to_string();
        }
        let mut out = vec![format!(
            "Deadline digest for {}",
            self.generated_at.with_timezone(&self.timezone).format("%A, %B %-d")
        )];

        if !self.urgent.is_empty() {
            out.push(String::new());
            out.push("Urgent:".to_string());
            for entry in &self.urgent {
                let flag = if entry.is_critical { " (critical)" } else { "" };
                out.push(format!("- {} - due {}{flag}", entry.title, when(entry.days_left)));
            }
            if self.urgent_total > self.urgent.len() {
                out.push(format!("  ...and {} more", self.urgent_total - self.urgent.len()));
            }
        }

        if !self.coming_up.is_empty() {
            out.push(String::new());
            out.push("Coming up:".to_string());
            for entry in &self.coming_up {
                let date = entry.due_at.with_timezone(&self.timezone).format("%a %b %-d");
                out.push(format!("- {} - {date} ({})", entry.title, when(entry.days_left)));
            }
            if self.coming_up_total > self.coming_up.len() {
                out.push(format!("  ...and {} more", self.coming_up_total - self.coming_up.len()));
            }
        }

        if !self.events.is_empty() {
            out.push(String::new());
            out.push("Events:".to_string());
            for event in &self.events {
                let until = event.end_at.with_timezone(&self.timezone).format("%B %-d");
                let starts = match event.starts_in_days {
                    i64::MIN..=0 => "starts today".to_string(),
                    1 => "starts tomorrow".to_string(),
                    n => format!("starts in {n} days"),
                };
                out.push(format!("- {} {starts} (until {until})", event.title));
            }
        }
        out.join("\n")
    }
}
