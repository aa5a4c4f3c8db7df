//! Date phrases found on the deadlines page and their resolution to UTC.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use regex::{Captures, Regex};
use thiserror::Error;

const MONTH: &str = r"(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?";
const DAY: &str = r"(\d{1,2})(?:st|nd|rd|th)?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePhrase {
    /// `today`, `tomorrow`, `in N days`, `in N weeks`.
    Relative { days: i64 },
    /// A single day; the month may come from the section heading.
    Day {
        month: Option<u32>,
        day: u32,
        year: Option<i32>,
    },
    /// `June 1 - June 5`, `June 1 - 5`, `May 30 to June 2, 2026`.
    Range {
        start_month: u32,
        start_day: u32,
        start_year: Option<i32>,
        end_month: Option<u32>,
        end_day: u32,
        end_year: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateMatch {
    pub phrase: DatePhrase,
    pub start: usize,
    pub end: usize,
}

impl DateMatch {
    pub fn as_str<'a>(&self, haystack: &'a str) -> &'a str {
        &haystack[self.start..self.end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    pub due_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateError {
    #[error("no date phrase in {0:?}")]
    NoDate(String),
    #[error("{0:?} names a day but no month")]
    MissingMonth(String),
    #[error("{0:?} is not a valid calendar date")]
    InvalidDate(String),
}

struct Patterns {
    range: Regex,
    iso: Regex,
    full: Regex,
    month_day: Regex,
    relative_word: Regex,
    relative_count: Regex,
    ordinal: Regex,
    month: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let build = |pattern: String| {
            Regex::new(&format!("(?i){pattern}")).expect("valid date regex")
        };
        Patterns {
            range: build(format!(
                r"\b{MONTH}\s+{DAY}(?:\s*,\s*(\d{{4}}))?\s*(?:-|–|—|\bto\b|\bthrough\b)\s*(?:{MONTH}\s+)?{DAY}(?:\s*,\s*(\d{{4}}))?\b"
            )),
            iso: build(r"\b(\d{4})-(\d{2})-(\d{2})\b".to_string()),
            full: build(format!(r"\b{MONTH}\s+{DAY}\s*,?\s*(\d{{4}})\b")),
            month_day: build(format!(r"\b{MONTH}\s+{DAY}\b")),
            relative_word: build(r"\b(today|tomorrow)\b".to_string()),
            relative_count: build(r"\bin\s+(\d{1,3})\s+(days?|weeks?)\b".to_string()),
            ordinal: build(r"\b(?:the\s+)?(\d{1,2})(?:st|nd|rd|th)\b".to_string()),
            month: build(format!(r"\b{MONTH}(?:\s|$|\b)")),
        }
    })
}

/// Month number named in `text`, e.g. a section heading such as "June".
/// "May" only counts when it is the whole text or precedes a day or year,
/// so "What you may need" names no month.
pub fn month_from_text(text: &str) -> Option<u32> {
    patterns().month.captures_iter(text).find_map(|caps| {
        let name = caps.get(1)?;
        if name.as_str().eq_ignore_ascii_case("may") {
            let whole = text.trim().eq_ignore_ascii_case("may");
            let dated = text[name.end()..]
                .trim_start()
                .starts_with(|c: char| c.is_ascii_digit());
            if !whole && !dated {
                return None;
            }
        }
        month_number(name.as_str())
    })
}

fn month_number(name: &str) -> Option<u32> {
    let lower = name.trim_end_matches('.').to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn capture_u32(caps: &Captures<'_>, index: usize) -> Option<u32> {
    caps.get(index).and_then(|m| m.as_str().parse().ok())
}

fn capture_i32(caps: &Captures<'_>, index: usize) -> Option<i32> {
    caps.get(index).and_then(|m| m.as_str().parse().ok())
}

fn capture_month(caps: &Captures<'_>, index: usize) -> Option<u32> {
    caps.get(index).and_then(|m| month_number(m.as_str()))
}

/// First date phrase in `text`. Forms are tried from most to least specific,
/// so a range wins over the single day it starts with.
pub fn find_date_phrase(text: &str) -> Option<DateMatch> {
    let p = patterns();

    if let Some(caps) = p.range.captures(text) {
        let whole = caps.get(0)?;
        if let (Some(start_month), Some(start_day), Some(end_day)) =
            (capture_month(&caps, 1), capture_u32(&caps, 2), capture_u32(&caps, 5))
        {
            return Some(DateMatch {
                phrase: DatePhrase::Range {
                    start_month,
                    start_day,
                    start_year: capture_i32(&caps, 3),
                    end_month: capture_month(&caps, 4),
                    end_day,
                    end_year: capture_i32(&caps, 6),
                },
                start: whole.start(),
                end: whole.end(),
            });
        }
    }

    if let Some(caps) = p.iso.captures(text) {
        let whole = caps.get(0)?;
        if let (Some(year), Some(month), Some(day)) =
            (capture_i32(&caps, 1), capture_u32(&caps, 2), capture_u32(&caps, 3))
        {
            return Some(DateMatch {
                phrase: DatePhrase::Day {
                    month: Some(month),
                    day,
                    year: Some(year),
                },
                start: whole.start(),
                end: whole.end(),
            });
        }
    }

    for (pattern, has_year) in [(&p.full, true), (&p.month_day, false)] {
        if let Some(caps) = pattern.captures(text) {
            let whole = caps.get(0)?;
            if let (Some(month), Some(day)) = (capture_month(&caps, 1), capture_u32(&caps, 2)) {
                return Some(DateMatch {
                    phrase: DatePhrase::Day {
                        month: Some(month),
                        day,
                        year: if has_year { capture_i32(&caps, 3) } else { None },
                    },
                    start: whole.start(),
                    end: whole.end(),
                });
            }
        }
    }

    if let Some(caps) = p.relative_count.captures(text) {
        let whole = caps.get(0)?;
        let count: i64 = caps[1].parse().ok()?;
        let unit = caps[2].to_ascii_lowercase();
        let days = if unit.starts_with("week") { count * 7 } else { count };
        return Some(DateMatch {
            phrase: DatePhrase::Relative { days },
            start: whole.start(),
            end: whole.end(),
        });
    }

    if let Some(m) = p.relative_word.find(text) {
        let days = if m.as_str().eq_ignore_ascii_case("tomorrow") { 1 } else { 0 };
        return Some(DateMatch {
            phrase: DatePhrase::Relative { days },
            start: m.start(),
            end: m.end(),
        });
    }

    let caps = p.ordinal.captures(text)?;
    let whole = caps.get(0)?;
    Some(DateMatch {
        phrase: DatePhrase::Day {
            month: None,
            day: capture_u32(&caps, 1)?,
            year: None,
        },
        start: whole.start(),
        end: whole.end(),
    })
}

fn end_of_day(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_hms_opt(23, 59, 59)?)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn start_of_day(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolves a date phrase in `text` against `reference`.
///
/// Absolute dates land on 23:59:59 local time in `tz`. A day without a year
/// takes the calendar year of `reference` in `tz`. A day without a month
/// takes `fallback_month`.
pub fn parse_due(
    text: &str,
    reference: DateTime<Utc>,
    tz: Tz,
    fallback_month: Option<u32>,
) -> Result<ResolvedDate, DateError> {
    let found = find_date_phrase(text).ok_or_else(|| DateError::NoDate(text.to_string()))?;
    let invalid = || DateError::InvalidDate(text.to_string());
    let current_year = reference.with_timezone(&tz).year();

    match found.phrase {
        DatePhrase::Relative { days } => Ok(ResolvedDate {
            due_at: reference + Duration::days(days),
            start_at: None,
        }),
        DatePhrase::Day { month, day, year } => {
            let month = month
                .or(fallback_month)
                .ok_or_else(|| DateError::MissingMonth(text.to_string()))?;
            let date = NaiveDate::from_ymd_opt(year.unwrap_or(current_year), month, day)
                .ok_or_else(invalid)?;
            Ok(ResolvedDate {
                due_at: end_of_day(tz, date).ok_or_else(invalid)?,
                start_at: None,
            })
        }
        DatePhrase::Range {
            start_month,
            start_day,
            start_year,
            end_month,
            end_day,
            end_year,
        } => {
            let end_month = end_month.unwrap_or(start_month);
            let wraps = (end_month, end_day) < (start_month, start_day);
            let (start_year, end_year) = match (start_year, end_year) {
                (Some(s), Some(e)) => (s, e),
                (Some(s), None) => (s, if wraps { s + 1 } else { s }),
                (None, Some(e)) => (if wraps { e - 1 } else { e }, e),
                (None, None) => (current_year, if wraps { current_year + 1 } else { current_year }),
            };
            let start = NaiveDate::from_ymd_opt(start_year, start_month, start_day)
                .ok_or_else(invalid)?;
            let end = NaiveDate::from_ymd_opt(end_year, end_month, end_day).ok_or_else(invalid)?;
            Ok(ResolvedDate {
                due_at: end_of_day(tz, end).ok_or_else(invalid)?,
                start_at: Some(start_of_day(tz, start).ok_or_else(invalid)?),
            })
        }
    }
}
