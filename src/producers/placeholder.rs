//! Placeholder producer for local development and demos

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{ProduceRequest, Producer, ProducerError};
use crate::cards::{Card, CardCategory};

const SAMPLES: &[(&str, &str, CardCategory)] = &[
    (
        "Code Suggestion",
        "Consider adding type hints to improve code clarity and catch type-related bugs early.",
        CardCategory::Context,
    ),
    (
        "Refactoring Tip",
        "This function is getting long. Consider breaking it into smaller, more focused functions.",
        CardCategory::Context,
    ),
    (
        "Style Guide",
        "Follow the project formatter settings for consistent code layout.",
        CardCategory::Context,
    ),
    (
        "Clarification Needed",
        "Should this function handle empty input? What should the return value be in that case?",
        CardCategory::Question,
    ),
    (
        "Design Question",
        "Do you want this to be synchronous or asynchronous? Consider the performance implications.",
        CardCategory::Question,
    ),
    (
        "Testing Strategy",
        "How should we test this component? Unit tests, integration tests, or both?",
        CardCategory::Question,
    ),
    (
        "Inline Completion",
        "    return result.unwrap_or(default_value);",
        CardCategory::Completion,
    ),
    (
        "Inline Completion",
        "    tracing::debug!(count = items.len(), \"processing items\");",
        CardCategory::Completion,
    ),
];

/// Returns one to three canned cards per call, rotating through a fixed list.
#[derive(Debug, Default)]
pub struct PlaceholderProducer {
    calls: AtomicUsize,
}

impl PlaceholderProducer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Producer for PlaceholderProducer {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn available(&self) -> Result<bool, ProducerError> {
        Ok(true)
    }

    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let count = call % 3 + 1;
        let cards: Vec<Card> = (0..count)
            .map(|i| {
                let (header, text, category) = SAMPLES[(call + i * 3) % SAMPLES.len()];
                Card::new(header, text, category)
                    .with_metadata("source", "placeholder")
                    .with_metadata("line", request.cursor.line as u64)
            })
            .collect();
        tracing::debug!(count = cards.len(), "placeholder cards");
        Ok(cards)
    }
}
