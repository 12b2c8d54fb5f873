//! Information producers and the registry the orchestrator fans out to

pub mod chat;
pub mod code_search;
pub mod emails;
pub mod placeholder;
pub mod web_context;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cards::{Card, GlobalContext};
use crate::config::ProducersConfig;

pub use chat::{ChatMode, ChatProducer};
pub use code_search::CodeSearchProducer;
pub use emails::EmailProducer;
pub use placeholder::PlaceholderProducer;
pub use web_context::WebContextProducer;

/// Zero-based (line, column) of the editor cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorPosition {
    pub line: usize,
    pub column: usize,
}

impl CursorPosition {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Byte offset of the cursor in `text`, clamped to the text
    pub fn byte_offset(&self, text: &str) -> usize {
        let mut offset = 0;
        for (i, line) in text.split_inclusive('\n').enumerate() {
            if i == self.line {
                let content = line.trim_end_matches(['\n', '\r']);
                return offset
                    + content
                        .char_indices()
                        .nth(self.column)
                        .map(|(b, _)| b)
                        .unwrap_or(content.len());
            }
            offset += line.len();
        }
        text.len()
    }
}

/// Everything a producer gets to look at for one trigger
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub document_text: String,
    pub cursor: CursorPosition,
    pub global_context: GlobalContext,
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("producer unavailable: {0}")]
    Unavailable(String),
    #[error("producer timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ProducerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProducerError::Http(format!("request timed out: {err}"))
        } else {
            ProducerError::Http(err.to_string())
        }
    }
}

/// A possibly slow, possibly failing source of cards.
///
/// Producers never see the cache; they turn a document and cursor into cards
/// and bound their own latency. A producer that never returns keeps its
/// user's run in the processing state.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Name used in logs and the health report
    fn name(&self) -> &str;

    /// Cheap readiness probe. `Ok(false)` or an error skips this producer for one run.
    async fn available(&self) -> Result<bool, ProducerError>;

    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Card>, ProducerError>;
}

/// Typed collection of producers assembled at startup
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    producers: Vec<Arc<dyn Producer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, producer: Arc<dyn Producer>) {
        tracing::info!(producer = producer.name(), "registered producer");
        self.producers.push(producer);
    }

    pub fn with(mut self, producer: Arc<dyn Producer>) -> Self {
        self.register(producer);
        self
    }

    /// Build the registry from configuration
    pub fn from_config(config: &ProducersConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        if config.placeholder {
            registry.register(Arc::new(PlaceholderProducer::new()));
        }
        if config.code_search {
            registry.register(Arc::new(CodeSearchProducer::from_config(config)));
        }
        if config.chat_completion {
            registry.register(Arc::new(ChatProducer::from_config(
                config,
                ChatMode::Completion,
            )?));
        }
        if config.chat_questions {
            registry.register(Arc::new(ChatProducer::from_config(
                config,
                ChatMode::Questions,
            )?));
        }
        if config.chat_math {
            registry.register(Arc::new(ChatProducer::from_config(config, ChatMode::Math)?));
        }
        if config.web_context {
            registry.register(Arc::new(WebContextProducer::from_config(config)?));
        }
        if config.emails {
            registry.register(Arc::new(EmailProducer::from_config(config)));
        }
        if registry.is_empty() {
            tracing::warn!("No producers enabled; triggers will only return cached cards");
        }
        Ok(registry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Producer>> {
        self.producers.iter()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}
