//! Chat-completion producer for inline completions, plan questions and math
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::{ProduceRequest, Producer, ProducerError};
use crate::cards::{Card, CardCategory};
use crate::config::ProducersConfig;

/// Characters of document kept on each side of the cursor for completions
const CURSOR_WINDOW_CHARS: usize = 150;
const MAX_COMPLETION_LINES: usize = 6;
const MAX_QUESTIONS: usize = 3;
const MAX_EQUATIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    /// Short inline continuation at the cursor
    Completion,
    /// Open questions and ambiguities in the document
    Questions,
    /// MathJax completions of partially written expressions
    Math,
}

#[derive(Clone, Debug)]
pub struct ChatProducer {
    mode: ChatMode,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl ChatProducer {
    pub fn new(
        mode: ChatMode,
        api_base: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout_ms: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            mode,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    pub fn from_config(config: &ProducersConfig, mode: ChatMode) -> anyhow::Result<Self> {
        Self::new(
            mode,
            &config.chat_api_base,
            config.chat_model.clone(),
            config.chat_api_key.clone(),
            config.chat_timeout_ms,
        )
    }

    fn messages(&self, request: &ProduceRequest) -> Value {
        match self.mode {
            ChatMode::Completion => json!([
                {
                    "role": "system",
                    "content": "You complete text inline in an editor. Reply with only the text to insert at <cursor>. \
                                Preserve indentation, add no explanations, and use at most six lines."
                },
                {"role": "user", "content": cursor_window(request)}
            ]),
            ChatMode::Questions => json!([
                {
                    "role": "system",
                    "content": "You review plan documents. List the most important open questions or ambiguities \
                                as a JSON array of strings, at most three, and nothing else."
                },
                {"role": "user", "content": request.document_text}
            ]),
            ChatMode::Math => json!([
                {
                    "role": "system",
                    "content": "Find incomplete math expressions in the document and complete them as MathJax \
                                delimited with $...$ or $$...$$. Reply with a JSON array of strings, at most three, \
                                or an empty array when nothing needs completing."
                },
                {"role": "user", "content": request.document_text}
            ]),
        }
    }

    async fn complete(&self, api_key: &str, messages: Value) -> Result<String, ProducerError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.2,
            "max_tokens": 300
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(ProducerError::Http(format!("{} returned {}: {}", self.endpoint, status, text)));
        }

        let val: Value = resp
            .json()
            .await
            .map_err(|e| ProducerError::Parse(e.to_string()))?;
        val.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| ProducerError::Parse("response has no message content".to_string()))
    }
}

/// Document excerpt around the cursor with a literal `<cursor>` marker
pub fn cursor_window(request: &ProduceRequest) -> String {
    let text = &request.document_text;
    let offset = request.cursor.byte_offset(text);
    let (before, after) = text.split_at(offset);
    let before_start = before
        .char_indices()
        .rev()
        .nth(CURSOR_WINDOW_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let after: String = after.chars().take(CURSOR_WINDOW_CHARS).collect();
    format!("{}<cursor>{}", &before[before_start..], after)
}

/// Strip code fences and cap the number of lines of a completion
pub fn clean_completion(raw: &str) -> String {
    raw.lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .take(MAX_COMPLETION_LINES)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Questions from a model reply: a JSON array when possible, else bullet lines
pub fn parse_questions(raw: &str) -> Vec<String> {
    parse_list(raw, MAX_QUESTIONS)
}

/// Equations from a model reply; entries without a `$` delimiter are dropped
pub fn parse_equations(raw: &str) -> Vec<String> {
    parse_list(raw, usize::MAX)
        .into_iter()
        .filter(|e| e.starts_with('$') && e.ends_with('$') && e.len() > 1)
        .take(MAX_EQUATIONS)
        .collect()
}

fn parse_list(raw: &str, limit: usize) -> Vec<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let parsed: Vec<String> = match serde_json::from_str::<Vec<String>>(trimmed) {
        Ok(list) => list,
        Err(_) => trimmed
            .lines()
            .map(|l| {
                l.trim()
                    .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_ascii_digit() || c == '.' || c == ')')
                    .trim()
                    .to_string()
            })
            .collect(),
    };

    parsed
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .take(limit)
        .collect()
}

#[async_trait]
impl Producer for ChatProducer {
    fn name(&self) -> &str {
        match self.mode {
            ChatMode::Completion => "chat_completion",
            ChatMode::Questions => "chat_questions",
            ChatMode::Math => "chat_math",
        }
    }

    async fn available(&self) -> Result<bool, ProducerError> {
        Ok(self.api_key.is_some())
    }

    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProducerError::Unavailable("no API key configured".to_string()))?;
        if request.document_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let reply = self.complete(api_key, self.messages(request)).await?;
        let cards = match self.mode {
            ChatMode::Completion => {
                let completion = clean_completion(&reply);
                if completion.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![
                        Card::new("Inline Completion", completion, CardCategory::Completion)
                            .with_metadata("source", self.name())
                            .with_metadata("trigger", "ghost_text")
                            .with_metadata("model", self.model.clone()),
                    ]
                }
            }
            ChatMode::Questions => parse_questions(&reply)
                .into_iter()
                .map(|q| {
                    Card::new("Open Question", q, CardCategory::Question)
                        .with_metadata("source", self.name())
                        .with_metadata("model", self.model.clone())
                })
                .collect(),
            ChatMode::Math => parse_equations(&reply)
                .into_iter()
                .map(|eq| {
                    Card::new("Math Completion", eq, CardCategory::Math)
                        .with_metadata("source", self.name())
                        .with_metadata("model", self.model.clone())
                })
                .collect(),
        };
        Ok(cards)
    }
}
