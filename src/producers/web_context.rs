//! Web context producer backed by Gemini with Google Search grounding
//!
//! Sends one grounded query built from the document and turns the answer into
//! up to three Context cards. Citation links from the grounding metadata are
//! inlined into the text and also kept in card metadata.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::{ProduceRequest, Producer, ProducerError};
use crate::cards::{Card, CardCategory};
use crate::config::ProducersConfig;

const MAX_CARDS: usize = 3;
const MAX_CARD_WORDS: usize = 60;
/// Characters of document used to build the search query
const QUERY_CONTEXT_CHARS: usize = 600;

/// Grounded answer with citation links inlined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedAnswer {
    pub content: String,
    pub citations: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct WebContextProducer {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl WebContextProducer {
    pub fn new(
        api_base: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout_ms: u64,
    ) -> anyhow::Result<Self> {
        let model = model.into();
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            endpoint: format!(
                "{}/models/{}:generateContent",
                api_base.trim_end_matches('/'),
                model
            ),
            model,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    pub fn from_config(config: &ProducersConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.web_api_base,
            config.web_model.clone(),
            config.web_api_key.clone(),
            config.web_timeout_ms,
        )
    }

    async fn search(&self, api_key: &str, query: &str) -> Result<GroundedAnswer, ProducerError> {
        let body = json!({
            "system_instruction": {"parts": [{"text":
                "Find authoritative documentation, references and known pitfalls relevant to this plan. \
                 Answer in at most three short paragraphs."}]},
            "contents": [{"parts": [{"text": query}]}],
            "tools": [{"google_search": {}}],
            "generationConfig": {"maxOutputTokens": 1024, "temperature": 0.2}
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", api_key)
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
        parse_grounded(&val)
    }
}

/// Query text: the document around the cursor, trimmed to a bounded excerpt
pub fn search_query(request: &ProduceRequest) -> String {
    let text = &request.document_text;
    let offset = request.cursor.byte_offset(text);
    let start = text[..offset]
        .char_indices()
        .rev()
        .nth(QUERY_CONTEXT_CHARS / 2)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let excerpt: String = text[start..].chars().take(QUERY_CONTEXT_CHARS).collect();
    format!("Relevant web context for this plan:\n\n{}", excerpt.trim())
}

/// Text and citations of the first candidate of a `generateContent` reply
pub fn parse_grounded(val: &Value) -> Result<GroundedAnswer, ProducerError> {
    let candidate = val
        .pointer("/candidates/0")
        .ok_or_else(|| ProducerError::Parse("response has no candidates".to_string()))?;
    let text: String = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();
    Ok(insert_citations(text, candidate.get("groundingMetadata")))
}

/// Inline `[n](uri)` links after each grounded segment, numbering sources in
/// order of first use from the end of the text
fn insert_citations(mut text: String, metadata: Option<&Value>) -> GroundedAnswer {
    let chunks: Vec<&str> = metadata
        .and_then(|m| m.get("groundingChunks"))
        .and_then(|c| c.as_array())
        .map(|chunks| {
            chunks
                .iter()
                .map(|c| c.pointer("/web/uri").and_then(|u| u.as_str()).unwrap_or(""))
                .collect()
        })
        .unwrap_or_default();
    let mut supports: Vec<(usize, Vec<usize>)> = metadata
        .and_then(|m| m.get("groundingSupports"))
        .and_then(|s| s.as_array())
        .map(|supports| {
            supports
                .iter()
                .map(|s| {
                    let end = s.pointer("/segment/endIndex").and_then(|e| e.as_u64()).unwrap_or(0);
                    let indices = s
                        .get("groundingChunkIndices")
                        .and_then(|i| i.as_array())
                        .map(|i| i.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect())
                        .unwrap_or_default();
                    (end as usize, indices)
                })
                .collect()
        })
        .unwrap_or_default();
    supports.sort_by(|a, b| b.0.cmp(&a.0));

    let mut citations: Vec<String> = Vec::new();
    for (end, indices) in supports {
        let mut links = Vec::new();
        for idx in indices {
            let Some(uri) = chunks.get(idx).filter(|u| !u.is_empty()) else {
                continue;
            };
            let number = match citations.iter().position(|c| c == uri) {
                Some(pos) => pos + 1,
                None => {
                    citations.push(uri.to_string());
                    citations.len()
                }
            };
            links.push(format!("[{number}]({uri})"));
        }
        if !links.is_empty() && end <= text.len() && text.is_char_boundary(end) {
            text.insert_str(end, &links.join(", "));
        }
    }
    GroundedAnswer {
        content: text,
        citations,
    }
}

/// Non-empty paragraphs, each capped at `MAX_CARD_WORDS` words
pub fn paragraphs(content: &str) -> Vec<String> {
    content
        .split("\n\n")
        .map(|p| {
            let words: Vec<&str> = p.split_whitespace().collect();
            if words.len() > MAX_CARD_WORDS {
                format!("{}...", words[..MAX_CARD_WORDS].join(" "))
            } else {
                words.join(" ")
            }
        })
        .filter(|p| !p.is_empty())
        .take(MAX_CARDS)
        .collect()
}

#[async_trait]
impl Producer for WebContextProducer {
    fn name(&self) -> &str {
        "web_context"
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

        let answer = self.search(api_key, &search_query(request)).await?;
        tracing::debug!(citations = answer.citations.len(), "grounded search answered");
        let cards = paragraphs(&answer.content)
            .into_iter()
            .map(|text| {
                Card::new("Web Context", text, CardCategory::Context)
                    .with_metadata("source", self.name())
                    .with_metadata("model", self.model.clone())
                    .with_metadata("citations", answer.citations.clone())
            })
            .collect();
        Ok(cards)
    }
}
