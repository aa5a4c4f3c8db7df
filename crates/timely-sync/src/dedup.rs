//! Near-duplicate detection for stored deadlines. Pairs are only flagged for
//! an admin; nothing is merged here.

use strsim::jaro_winkler;
use timely_core::{normalize_title, Deadline};

#[derive(Debug, Clone, Copy)]
pub struct ReviewConfig {
    pub review_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.88,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReviewCandidate {
    pub first: i64,
    pub second: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewEngine {
    config: ReviewConfig,
}

impl ReviewEngine {
    pub fn new(config: ReviewConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.review_threshold
    }

    pub fn similarity(a: &str, b: &str) -> f64 {
        jaro_winkler(&normalize_title(a), &normalize_title(b))
    }

    /// Pairs in the same category with different identity keys whose titles
    /// score at or above the review threshold.
    pub fn candidates(&self, deadlines: &[Deadline]) -> Vec<ReviewCandidate> {
        let mut out = Vec::new();
        for i in 0..deadlines.len() {
            for j in (i + 1)..deadlines.len() {
                let (a, b) = (&deadlines[i], &deadlines[j]);
                if a.category != b.category || a.identity_key == b.identity_key {
                    continue;
                }
                let score = Self::similarity(&a.title, &b.title);
                if score >= self.config.review_threshold {
                    out.push(ReviewCandidate {
                        first: a.id,
                        second: b.id,
                        confidence: score,
                    });
                }
            }
        }
        out
    }
}
