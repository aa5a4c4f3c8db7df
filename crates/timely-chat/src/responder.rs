//! Chat boundary: context lookup, generation, cleanup, fallback.

use std::sync::Arc;

use serde::Serialize;
use timely_core::Clock;
use tracing::{debug, warn};

use crate::ai::{clean_response, ChatRequest, ChatTurn, TextGenerator};
use crate::cache::SnapshotCache;
use crate::context::ContextBuilder;

pub const FALLBACK_REPLY: &str =
    "my brain is having some issues right now. the deadline list still works while i reboot.";

pub const DEFAULT_PERSONA: &str = "You are Timely, a dry-witted assistant for incoming first-year \
students. Keep replies short and casual, lowercase is fine. When deadline data is provided, \
quote its dates exactly and never invent deadlines that are not listed. If you do not know, \
say so and point people at the official deadlines page.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub reply: String,
    pub used_fallback: bool,
    pub context_included: bool,
}

pub struct ChatResponder {
    generator: Arc<dyn TextGenerator>,
    cache: Arc<SnapshotCache>,
    context: ContextBuilder,
    clock: Arc<dyn Clock>,
    persona: String,
}

impl ChatResponder {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        cache: Arc<SnapshotCache>,
        context: ContextBuilder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            generator,
            cache,
            context,
            clock,
            persona: DEFAULT_PERSONA.to_string(),
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn context_builder(&self) -> &ContextBuilder {
        &self.context
    }

    /// Never fails: generator or store errors become the fallback reply or a
    /// reply without context.
    pub async fn respond(&self, message: &str, history: &[ChatTurn]) -> ChatReply {
        let context = if self.context.wants_context(message) {
            match self.cache.get().await {
                Ok(snapshot) => self.context.build(message, &snapshot, self.clock.now()),
                Err(err) => {
                    warn!(error = %err, "deadline snapshot unavailable; replying without context");
                    None
                }
            }
        } else {
            None
        };
        let context_included = context.is_some();

        let request = ChatRequest {
            system: self.persona.clone(),
            history: history.to_vec(),
            message: message.to_string(),
            context,
        };

        let reply = match self.generator.generate(&request).await {
            Ok(text) => clean_response(&text),
            Err(err) => {
                warn!(generator = self.generator.name(), error = %err, "text generation failed; using fallback reply");
                String::new()
            }
        };

        if reply.is_empty() {
            return ChatReply {
                reply: FALLBACK_REPLY.to_string(),
                used_fallback: true,
                context_included,
            };
        }
        debug!(context_included, chars = reply.chars().count(), "chat reply generated");
        ChatReply {
            reply,
            used_fallback: false,
            context_included,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiError, DisabledGenerator};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::America::New_York;
    use std::sync::Mutex;
    use timely_core::{identity_key, Category, CategoryRules, DeadlineDraft, ManualClock};
    use timely_storage::DeadlineStore;

    // Records each request and answers with a canned string.
    struct Recording {
        answer: String,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl TextGenerator for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn generate(&self, request: &ChatRequest) -> Result<String, AiError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.answer.clone())
        }
    }

    async fn responder(generator: Arc<dyn TextGenerator>) -> ChatResponder {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 16, 0, 0).unwrap();
        let store = DeadlineStore::in_memory().await.unwrap();
        let due_at = now + Duration::days(2);
        store
            .upsert(&DeadlineDraft {
                identity_key: identity_key("Submit health forms", due_at),
                title: "Submit health forms".into(),
                category: Category::Medical,
                due_at,
                start_at: None,
                description: String::new(),
                link: None,
                is_critical: true,
                is_event: false,
                observed_at: now,
            })
            .await
            .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
        let cache = Arc::new(SnapshotCache::new(store, clock.clone(), Duration::minutes(5)));
        let context = ContextBuilder::new(CategoryRules::builtin(), Duration::days(3), New_York);
        ChatResponder::new(generator, cache, context, clock)
    }

    #[tokio::test]
    async fn generator_failure_yields_fallback() {
        let reply = responder(Arc::new(DisabledGenerator))
            .await
            .respond("what's due soon?", &[])
            .await;
        assert_eq!(reply.reply, FALLBACK_REPLY);
        assert!(reply.used_fallback);
        assert!(reply.context_included);
    }

    #[tokio::test]
    async fn deadline_question_carries_context_and_reply_is_cleaned() {
        let generator = Arc::new(Recording {
            answer: "\"Timely: health forms are due wednesday.\"".into(),
            seen: Mutex::new(Vec::new()),
        });
        let responder = responder(generator.clone()).await;
        let reply = responder.respond("when are medical forms due?", &[]).await;

        assert_eq!(reply.reply, "health forms are due wednesday.");
        assert!(!reply.used_fallback);
        let seen = generator.seen.lock().unwrap();
        let context = seen[0].context.as_deref().unwrap();
        assert!(context.contains("Submit health forms [Medical]"));
        assert_eq!(seen[0].system, DEFAULT_PERSONA);
    }

    #[tokio::test]
    async fn small_talk_skips_the_snapshot() {
        let generator = Arc::new(Recording {
            answer: "hi".into(),
            seen: Mutex::new(Vec::new()),
        });
        let responder = responder(generator.clone()).await;
        let reply = responder.respond("hello!", &[]).await;
        assert_eq!(reply.reply, "hi");
        assert!(!reply.context_included);
        assert_eq!(responder.cache().load_count(), 0);
    }

    #[tokio::test]
    async fn blank_generation_falls_back() {
        let generator = Arc::new(Recording {
            answer: "\"  \"".into(),
            seen: Mutex::new(Vec::new()),
        });
        let reply = responder(generator).await.respond("hello!", &[]).await;
        assert!(reply.used_fallback);
    }
}
