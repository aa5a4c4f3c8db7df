//! Text generation behind a trait, with a Gemini `generateContent` client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("text generation is not configured")]
    NotConfigured,
    #[error("text generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("text generation API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("text generation returned no text")]
    EmptyResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: String,
    pub history: Vec<ChatTurn>,
    pub message: String,
    pub context: Option<String>,
}

impl ChatRequest {
    /// Persona plus, when present, the deadline context the model must rely on.
    pub fn system_instruction(&self) -> String {
        match &self.context {
            Some(context) => format!(
                "{}\n\nDeadline data from the official page (use only this for dates):\n{}",
                self.system, context
            ),
            None => self.system.clone(),
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, request: &ChatRequest) -> Result<String, AiError>;
}

/// Generator used when no API key is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &ChatRequest) -> Result<String, AiError> {
        Err(AiError::NotConfigured)
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: crate::DEFAULT_GEMINI_MODEL.to_string(),
            base_url: crate::DEFAULT_GEMINI_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            temperature: 0.8,
            max_output_tokens: 400,
        }
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let mut key = HeaderValue::from_str(&config.api_key)
            .context("GEMINI_API_KEY is not a valid header value")?;
        key.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", key);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .context("building Gemini HTTP client")?;
        Ok(Self { http, config })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.config.base_url = url.to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn body(&self, request: &ChatRequest) -> GenerateRequest {
        let mut contents: Vec<Content> = request
            .history
            .iter()
            .map(|turn| Content::text(Some(turn.role), &turn.text))
            .collect();
        contents.push(Content::text(Some(ChatRole::User), &request.message));

        GenerateRequest {
            system_instruction: Content::text(None, &request.system_instruction()),
            contents,
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        }
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &ChatRequest) -> Result<String, AiError> {
        debug!(model = %self.config.model, history = request.history.len(), "Gemini generate request");

        let response = self
            .http
            .post(self.endpoint())
            .json(&self.body(request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Api { status, body });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }
        Ok(text)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<ChatRole>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<ChatRole>, text: &str) -> Self {
        Self {
            role,
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

const SPEAKER_PREFIXES: &[&str] = &[
    "timely says:",
    "timely:",
    "assistant:",
    "bot:",
    "as timely,",
    "i would say:",
];

/// Strips wrapping quotes and speaker prefixes the model sometimes adds.
pub fn clean_response(text: &str) -> String {
    let mut current = text.trim();
    loop {
        let before = current;
        current = strip_quotes(current);
        for prefix in SPEAKER_PREFIXES {
            if current.len() >= prefix.len()
                && current.is_char_boundary(prefix.len())
                && current[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                current = current[prefix.len()..].trim_start();
                break;
            }
        }
        if current == before {
            return current.to_string();
        }
    }
}

fn strip_quotes(text: &str) -> &str {
    let text = text.trim();
    for (open, close) in [('"', '"'), ('\u{201c}', '\u{201d}')] {
        if text.len() > open.len_utf8() + close.len_utf8()
            && text.starts_with(open)
            && text.ends_with(close)
        {
            return text[open.len_utf8()..text.len() - close.len_utf8()].trim();
        }
    }
    text
}
