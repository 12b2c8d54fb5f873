//! Code search producer backed by ripgrep
//!
//! Looks up the identifier under the cursor across the scope root and turns
//! each hit into a Context card with a few lines of surrounding code.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;

use super::{ProduceRequest, Producer, ProducerError};
use crate::cards::{Card, CardCategory};
use crate::config::ProducersConfig;

const MIN_QUERY_CHARS: usize = 3;

#[derive(Debug, Clone)]
pub struct CodeSearchProducer {
    rg_binary: String,
    max_results: usize,
    context_lines: usize,
    timeout: Duration,
}

/// One ripgrep hit with its surrounding lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub file_path: String,
    pub line_number: u64,
    pub line: String,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

impl CodeSearchProducer {
    pub fn new(rg_binary: impl Into<String>, max_results: usize, timeout_ms: u64) -> Self {
        Self {
            rg_binary: rg_binary.into(),
            max_results,
            context_lines: 2,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn from_config(config: &ProducersConfig) -> Self {
        Self::new(
            config.rg_binary.clone(),
            config.code_search_max_results,
            config.code_search_timeout_ms,
        )
    }

    fn build_command(&self, query: &str, request: &ProduceRequest) -> Command {
        let mut cmd = Command::new(&self.rg_binary);
        cmd.kill_on_drop(true)
            .arg("--json")
            .arg("--line-number")
            .arg(format!("--context={}", self.context_lines))
            .arg("--max-count")
            .arg((self.max_results * 2).to_string())
            .arg("--ignore-case")
            .arg("--word-regexp")
            .arg("--fixed-strings")
            .arg(query)
            .arg(&request.global_context.scope_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier regex"));

/// Identifier touching the cursor, or the last identifier before it on the same line.
pub fn query_at_cursor(request: &ProduceRequest) -> Option<String> {
    let text = &request.document_text;
    let offset = request.cursor.byte_offset(text);
    let line_start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = text[offset..]
        .find('\n')
        .map(|i| offset + i)
        .unwrap_or(text.len());
    let line = &text[line_start..line_end];
    let cursor_in_line = offset - line_start;

    let candidates: Vec<_> = IDENTIFIER_RE
        .find_iter(line)
        .filter(|m| m.as_str().chars().count() >= MIN_QUERY_CHARS)
        .collect();

    candidates
        .iter()
        .find(|m| m.start() <= cursor_in_line && cursor_in_line <= m.end())
        .or_else(|| candidates.iter().rev().find(|m| m.end() <= cursor_in_line))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
struct RgEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<RgData>,
}

#[derive(Debug, Deserialize)]
struct RgData {
    #[serde(default)]
    path: Option<RgText>,
    #[serde(default)]
    lines: Option<RgText>,
    #[serde(default)]
    line_number: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RgText {
    #[serde(default)]
    text: Option<String>,
}

/// Parse ripgrep's `--json` output (one JSON object per line).
pub fn parse_rg_json(output: &str, context_lines: usize) -> Vec<SearchMatch> {
    let mut matches: Vec<SearchMatch> = Vec::new();
    let mut pending: Vec<(u64, String)> = Vec::new();

    for raw in output.lines().filter(|l| !l.trim().is_empty()) {
        let event: RgEvent = match serde_json::from_str(raw) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable ripgrep line");
                continue;
            }
        };
        let Some(data) = event.data else {
            continue;
        };
        let path = data.path.and_then(|p| p.text).unwrap_or_default();
        let line_number = data.line_number.unwrap_or(0);
        let content = data
            .lines
            .and_then(|l| l.text)
            .unwrap_or_default()
            .trim_end_matches(['\n', '\r'])
            .to_string();

        match event.kind.as_str() {
            "begin" | "end" => pending.clear(),
            "context" => {
                if let Some(last) = matches.last_mut()
                    && last.file_path == path
                    && line_number > last.line_number
                    && line_number <= last.line_number + context_lines as u64
                {
                    last.context_after.push(content.clone());
                }
                pending.push((line_number, content));
                if pending.len() > context_lines {
                    pending.remove(0);
                }
            }
            "match" => {
                let context_before = pending
                    .drain(..)
                    .filter(|(n, _)| *n < line_number)
                    .map(|(_, l)| l)
                    .collect();
                matches.push(SearchMatch {
                    file_path: path,
                    line_number,
                    line: content,
                    context_before,
                    context_after: Vec::new(),
                });
            }
            _ => {}
        }
    }
    matches
}

fn match_to_card(m: &SearchMatch, query: &str) -> Card {
    let mut lines: Vec<String> = m.context_before.iter().map(|l| format!("  {l}")).collect();
    lines.push(format!("> {}", m.line));
    lines.extend(m.context_after.iter().map(|l| format!("  {l}")));

    Card::new(
        format!("{}:{}", m.file_path, m.line_number),
        lines.join("\n"),
        CardCategory::Context,
    )
    .with_metadata("source", "code_search")
    .with_metadata("file_path", m.file_path.clone())
    .with_metadata("line_number", m.line_number)
    .with_metadata("query", query.to_string())
}

#[async_trait]
impl Producer for CodeSearchProducer {
    fn name(&self) -> &str {
        "code_search"
    }

    async fn available(&self) -> Result<bool, ProducerError> {
        let probe = Command::new(&self.rg_binary)
            .arg("--version")
            .kill_on_drop(true)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match tokio::time::timeout(Duration::from_secs(2), probe).await {
            Ok(Ok(status)) => Ok(status.success()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Ok(Err(e)) => Err(ProducerError::Process(e.to_string())),
            Err(_) => Err(ProducerError::Timeout { timeout_ms: 2000 }),
        }
    }

    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
        let Some(query) = query_at_cursor(request) else {
            tracing::debug!("no identifier near cursor; skipping code search");
            return Ok(Vec::new());
        };

        let output = tokio::time::timeout(self.timeout, self.build_command(&query, request).output())
            .await
            .map_err(|_| ProducerError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| ProducerError::Process(format!("failed to run {}: {e}", self.rg_binary)))?;

        // ripgrep exits 1 when nothing matched
        match output.status.code() {
            Some(0) | Some(1) => {}
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ProducerError::Process(format!(
                    "ripgrep failed: {}",
                    stderr.trim()
                )));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let cards: Vec<Card> = parse_rg_json(&stdout, self.context_lines)
            .iter()
            .take(self.max_results)
            .map(|m| match_to_card(m, &query))
            .collect();
        tracing::debug!(query = %query, hits = cards.len(), "code search finished");
        Ok(cards)
    }
}
