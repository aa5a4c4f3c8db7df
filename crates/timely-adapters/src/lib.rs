//! Deadline extraction from the fetched page.

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use timely_core::RawDeadline;
use timely_storage::FetchedPage;
use tracing::{debug, warn};
use url::Url;

pub mod dates;

pub use dates::{find_date_phrase, month_from_text, parse_due, DateError, DateMatch, DatePhrase, ResolvedDate};

pub const CRATE_NAME: &str = "timely-adapters";

pub const TITLE_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 500;
const MIN_ITEM_CHARS: usize = 10;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
}

/// Turns a fetched document into raw deadline tuples.
///
/// Implementations never fail: a page they cannot make sense of yields an
/// empty list and a warning.
pub trait DeadlineExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, page: &FetchedPage) -> Vec<RawDeadline>;
}

/// Reads month headings (`h2`-`h4`) and the list that follows each one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionListExtractor;

impl SectionListExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn try_extract(&self, page: &FetchedPage) -> Result<Vec<RawDeadline>, ExtractError> {
        let document = Html::parse_document(&page.body);
        let headings = selector("h2, h3, h4")?;
        let lists = selector("ul")?;
        let anchors = selector("a[href]")?;
        let base = Url::parse(&page.url).ok();

        let mut out = Vec::new();
        for heading in document.select(&headings) {
            let section = collapse_whitespace(&heading.text().collect::<String>());
            if month_from_text(&section).is_none() {
                continue;
            }
            let Some(list) = following_list(heading, &lists) else {
                debug!(section, "month heading without a list");
                continue;
            };

            for item in list
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|el| el.value().name() == "li")
            {
                let text = collapse_whitespace(&item.text().collect::<String>());
                if text.chars().count() < MIN_ITEM_CHARS {
                    continue;
                }

                let parts = split_item(&text);
                let link = item
                    .select(&anchors)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .and_then(|href| resolve_link(base.as_ref(), href));
                let category_hint = item
                    .value()
                    .attr("data-category")
                    .or_else(|| list.value().attr("data-category"))
                    .and_then(|s| text_or_none(s.to_string()));

                out.push(RawDeadline {
                    title: parts.title,
                    date_text: parts.date_text,
                    description: parts.description,
                    link,
                    category_hint,
                    section: Some(section.clone()),
                });
            }
        }
        Ok(out)
    }
}

impl DeadlineExtractor for SectionListExtractor {
    fn name(&self) -> &'static str {
        "section-list"
    }

    fn extract(&self, page: &FetchedPage) -> Vec<RawDeadline> {
        match self.try_extract(page) {
            Ok(items) if items.is_empty() => {
                warn!(url = %page.url, "parse failure: no deadline items under month headings");
                items
            }
            Ok(items) => {
                debug!(url = %page.url, count = items.len(), "extracted deadline items");
                items
            }
            Err(err) => {
                warn!(url = %page.url, error = %err, "parse failure");
                Vec::new()
            }
        }
    }
}

fn selector(css: &'static str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn is_heading(name: &str) -> bool {
    matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

// The first `ul` after the heading, searching into wrapper elements, but
// never past the next heading.
fn following_list<'a>(heading: ElementRef<'a>, lists: &Selector) -> Option<ElementRef<'a>> {
    for sibling in heading.next_siblings().filter_map(ElementRef::wrap) {
        let name = sibling.value().name();
        if is_heading(name) {
            return None;
        }
        if name == "ul" {
            return Some(sibling);
        }
        if let Some(inner) = sibling.select(lists).next() {
            return Some(inner);
        }
    }
    None
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let resolved = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    Some(resolved.to_string())
}

/// Cuts `input` to `max` characters, marking the cut with "...".
pub fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ItemParts {
    title: String,
    description: String,
    date_text: Option<String>,
}

// Title is the sentence holding the date phrase (or the first sentence when
// there is none); the rest becomes the description.
fn split_item(text: &str) -> ItemParts {
    let date = find_date_phrase(text);
    let spans = sentence_spans(text, date.map(|d| (d.start, d.end)));
    let title_index = date
        .and_then(|d| spans.iter().position(|&(s, e)| s <= d.start && d.end <= e))
        .unwrap_or(0);

    let mut title = String::new();
    let mut rest = Vec::new();
    for (index, &(start, end)) in spans.iter().enumerate() {
        let sentence = clean_sentence(&text[start..end]);
        if sentence.is_empty() {
            continue;
        }
        if index == title_index {
            title = sentence.to_string();
        } else {
            rest.push(sentence);
        }
    }
    if title.is_empty() {
        title = text.to_string();
    }

    ItemParts {
        title: truncate_chars(&title, TITLE_MAX_CHARS),
        description: truncate_chars(&rest.join(". "), DESCRIPTION_MAX_CHARS),
        date_text: date.map(|d| d.as_str(text).to_string()),
    }
}

fn clean_sentence(sentence: &str) -> &str {
    sentence
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .trim_end()
}

// Byte spans of sentences. A terminator only counts when followed by
// whitespace or the end of text, and never inside `protected`.
fn sentence_spans(text: &str, protected: Option<(usize, usize)>) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if protected.is_some_and(|(s, e)| index >= s && index < e) {
            continue;
        }
        let at_break = chars.peek().map_or(true, |&(_, next)| next.is_whitespace());
        if at_break {
            let end = index + c.len_utf8();
            spans.push((start, end));
            start = end;
        }
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn page(body: &str) -> FetchedPage {
        FetchedPage {
            url: "https://firstyear.example.edu/summer/deadlines".into(),
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn date_sentence_becomes_title() {
        let parts = split_item("Bring your ID. Pay the tuition bill by Sept. 5. Late fees apply!");
        assert_eq!(parts.title, "Pay the tuition bill by Sept. 5");
        assert_eq!(parts.description, "Bring your ID. Late fees apply");
        assert_eq!(parts.date_text.as_deref(), Some("Sept. 5"));
    }

    #[test]
    fn item_without_date_keeps_first_sentence_as_title() {
        let parts = split_item("Check the portal often. Updates are posted weekly.");
        assert_eq!(parts.title, "Check the portal often");
        assert_eq!(parts.description, "Updates are posted weekly");
        assert_eq!(parts.date_text, None);
    }

    #[test]
    fn long_titles_are_truncated() {
        let long = format!("Submit {} by June 1", "the form ".repeat(20));
        let parts = split_item(&long);
        assert_eq!(parts.title.chars().count(), TITLE_MAX_CHARS);
        assert!(parts.title.ends_with("..."));
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn list_is_not_taken_from_a_later_section() {
        let html = r#"
            <h3>June</h3>
            <p>Nothing listed yet.</p>
            <h3>Before you arrive</h3>
            <ul><li>Label your luggage by August 20.</li></ul>
        "#;
        assert!(SectionListExtractor::new().extract(&page(html)).is_empty());
    }

    #[test]
    fn links_resolve_against_page_url_and_hints_are_read() {
        let html = r##"
            <h2>July</h2>
            <ul data-category="Academic">
              <li>Take the math placement test by July 9. <a href="../placement">Details</a></li>
              <li data-category="Housing"><a href="#top">Top</a> Roommate form due July 12.</li>
            </ul>
        "##;
        let items = SectionListExtractor::new().extract(&page(html));
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].link.as_deref(),
            Some("https://firstyear.example.edu/placement")
        );
        assert_eq!(items[0].category_hint.as_deref(), Some("Academic"));
        assert_eq!(items[1].link, None);
        assert_eq!(items[1].category_hint.as_deref(), Some("Housing"));
        assert_eq!(items[1].section.as_deref(), Some("July"));
    }

    #[test]
    fn page_without_month_headings_yields_nothing() {
        let html = "<div><p>Deadlines moved to the new portal.</p></div>";
        assert!(SectionListExtractor::new().extract(&page(html)).is_empty());
    }
}
