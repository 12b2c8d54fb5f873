//! Similarity-aware merge of freshly produced cards into a user's feed
//!
//! The merge is a pure function over card lists so it can be exercised
//! without any store, runtime or producer involved.

use std::collections::HashMap;

use crate::cards::{Card, CardCategory};
use crate::utils::similarity::overlap_score;

pub const DEFAULT_MAX_PER_CATEGORY: usize = 3;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.5;

/// Capacity and de-duplication settings applied on every merge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergePolicy {
    pub max_per_category: usize,
    pub similarity_threshold: f64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            max_per_category: DEFAULT_MAX_PER_CATEGORY,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// What a merge did, for logging and tests
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    pub cards: Vec<Card>,
    pub admitted: usize,
    pub rejected: usize,
    pub evicted: usize,
}

impl MergePolicy {
    pub fn apply(&self, existing: &[Card], incoming: &[Card]) -> MergeOutcome {
        merge_with_stats(
            existing,
            incoming,
            self.max_per_category,
            self.similarity_threshold,
        )
    }
}

/// True when `candidate` overlaps any card already in `bucket` at or above `threshold`
pub fn is_duplicate(bucket: &[Card], candidate: &Card, threshold: f64) -> bool {
    bucket
        .iter()
        .any(|existing| overlap_score(existing.text(), candidate.text()) >= threshold)
}

/// Merge `incoming` into `existing`.
///
/// Each incoming card is compared against the cards of its category as they
/// stand at that moment (including cards admitted earlier in the same call).
/// Duplicates are dropped. Admitted cards are appended and each category keeps
/// only its newest `max_per_category` entries. The result is grouped in
/// [`CardCategory::ALL`] order with insertion order kept inside a category.
pub fn merge(
    existing: &[Card],
    incoming: &[Card],
    max_per_category: usize,
    threshold: f64,
) -> Vec<Card> {
    merge_with_stats(existing, incoming, max_per_category, threshold).cards
}

pub fn merge_with_stats(
    existing: &[Card],
    incoming: &[Card],
    max_per_category: usize,
    threshold: f64,
) -> MergeOutcome {
    let mut buckets: HashMap<CardCategory, Vec<Card>> = HashMap::new();
    for card in existing {
        buckets.entry(card.category()).or_default().push(card.clone());
    }

    let mut outcome = MergeOutcome::default();

    // Stored state may predate a lowered limit
    for bucket in buckets.values_mut() {
        outcome.evicted += trim_oldest(bucket, max_per_category);
    }

    for card in incoming {
        let bucket = buckets.entry(card.category()).or_default();
        if is_duplicate(bucket, card, threshold) {
            outcome.rejected += 1;
            continue;
        }
        bucket.push(card.clone());
        outcome.admitted += 1;
        outcome.evicted += trim_oldest(bucket, max_per_category);
    }

    outcome.cards = CardCategory::ALL
        .iter()
        .filter_map(|category| buckets.remove(category))
        .flatten()
        .collect();
    outcome
}

fn trim_oldest(bucket: &mut Vec<Card>, max: usize) -> usize {
    if bucket.len() <= max {
        return 0;
    }
    let excess = bucket.len() - max;
    bucket.drain(..excess);
    excess
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(text: &str) -> Card {
        Card::new("Tip", text, CardCategory::Context)
    }

    fn texts(cards: &[Card], category: CardCategory) -> Vec<&str> {
        cards
            .iter()
            .filter(|c| c.category() == category)
            .map(|c| c.text())
            .collect()
    }

    #[test]
    fn walkthrough_of_dedup_and_fifo_eviction() {
        let policy = MergePolicy::default();

        let feed = policy.apply(&[], &[context("Consider adding type hints")]).cards;
        let feed = policy.apply(&feed, &[context("Consider adding type annotations")]).cards;
        assert_eq!(texts(&feed, CardCategory::Context), vec!["Consider adding type hints"]);

        let feed = policy.apply(&feed, &[context("Follow PEP 8")]).cards;
        assert_eq!(feed.len(), 2);

        let feed = policy.apply(&feed, &[context("Add unit tests for edge cases")]).cards;
        assert_eq!(feed.len(), 3);

        let outcome = policy.apply(&feed, &[context("Extract the parser into a module")]);
        assert_eq!(outcome.evicted, 1);
        assert_eq!(
            texts(&outcome.cards, CardCategory::Context),
            vec![
                "Follow PEP 8",
                "Add unit tests for edge cases",
                "Extract the parser into a module"
            ]
        );
    }

    #[test]
    fn identical_text_never_grows_a_category() {
        let feed = merge(&[], &[context("Follow PEP 8")], 3, 0.5);
        let again = merge(&feed, &[context("Follow PEP 8"), context("follow pep 8 ")], 3, 0.5);
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn duplicates_only_checked_within_a_category() {
        let feed = merge(&[], &[context("Follow PEP 8")], 3, 0.5);
        let question = Card::new("Q", "Follow PEP 8", CardCategory::Question);
        let feed = merge(&feed, &[question], 3, 0.5);
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn duplicates_inside_one_batch_are_rejected() {
        let outcome = merge_with_stats(
            &[],
            &[context("Cache the parsed AST"), context("cache the parsed ast")],
            3,
            0.5,
        );
        assert_eq!(outcome.admitted, 1);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn output_is_grouped_by_category_priority() {
        let incoming = vec![
            Card::new("c", "x = 1", CardCategory::Completion),
            context("Related code in parser.rs"),
            Card::new("q", "Which database?", CardCategory::Question),
            Card::new("m", "e^{i\\pi} + 1 = 0", CardCategory::Math),
        ];
        let feed = merge(&[], &incoming, 3, 0.5);
        let order: Vec<CardCategory> = feed.iter().map(|c| c.category()).collect();
        assert_eq!(
            order,
            vec![
                CardCategory::Question,
                CardCategory::Context,
                CardCategory::Completion,
                CardCategory::Math
            ]
        );
    }

    #[test]
    fn capacity_holds_for_every_category_after_each_merge() {
        let words = [
            "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
            "juliet", "kilo", "lima",
        ];
        let mut feed = Vec::new();
        for (i, word) in words.iter().enumerate() {
            let category = CardCategory::ALL[i % CardCategory::ALL.len()];
            feed = merge(&feed, &[Card::new("h", *word, category)], 2, 0.5);
            for category in CardCategory::ALL {
                assert!(feed.iter().filter(|c| c.category() == category).count() <= 2);
            }
        }
    }

    #[test]
    fn lowered_limit_trims_existing_cards() {
        let feed = merge(
            &[],
            &[context("first note"), context("second remark"), context("third item")],
            3,
            0.9,
        );
        let outcome = merge_with_stats(&feed, &[], 1, 0.9);
        assert_eq!(texts(&outcome.cards, CardCategory::Context), vec!["third item"]);
        assert_eq!(outcome.evicted, 2);
    }

    #[test]
    fn threshold_is_configurable() {
        let a = context("Consider adding type hints");
        let b = context("Consider adding type annotations");
        // overlap is ~0.81, so a stricter threshold admits both
        assert_eq!(merge(&[a.clone()], &[b.clone()], 3, 0.9).len(), 2);
        assert_eq!(merge(&[a], &[b], 3, 0.8).len(), 1);
    }
}
