//! Per-user feed caches
//!
//! The store maps user ids to shared [`UserCache`] records. The outer map lock
//! is only held to look up, insert or remove records; card merges lock a
//! single user's record, so producers of different users (and of the same
//! user) never wait on each other for longer than one merge.
//!
//! Neither the capacity bound nor the TTL sweep removes a record whose
//! `processing` flag is set; the in-flight run still owns it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;

use crate::cards::Card;
use crate::merge::{MergeOutcome, MergePolicy};

/// Bounded, timestamped card feed of one user
#[derive(Debug, Clone)]
pub struct UserCache {
    pub user_id: String,
    pub cards: Vec<Card>,
    pub last_updated: DateTime<Utc>,
    /// True while an orchestration run for this user is in flight
    pub processing: bool,
    pub request_count: u64,
}

impl UserCache {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            cards: Vec::new(),
            last_updated: Utc::now(),
            processing: false,
            request_count: 0,
        }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            user_id: self.user_id.clone(),
            cards: self.cards.clone(),
            last_updated: self.last_updated,
            processing: self.processing,
            request_count: self.request_count,
        }
    }
}

pub type SharedUserCache = Arc<Mutex<UserCache>>;

/// Point-in-time copy of a user's feed handed to readers
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot {
    pub user_id: String,
    pub cards: Vec<Card>,
    pub last_updated: DateTime<Utc>,
    pub processing: bool,
    pub request_count: u64,
}

impl FeedSnapshot {
    /// What an unknown user sees: nothing cached, nothing running
    pub fn empty(user_id: impl Into<String>) -> Self {
        UserCache::new(user_id).snapshot()
    }
}

/// True when nobody holds the record and no run owns it
fn is_idle(handle: &SharedUserCache) -> bool {
    handle.try_lock().map(|cache| !cache.processing).unwrap_or(false)
}

pub struct UserCacheStore {
    caches: Mutex<LruCache<String, SharedUserCache>>,
    policy: MergePolicy,
    ttl: Duration,
    max_users: usize,
}

impl UserCacheStore {
    pub fn new(policy: MergePolicy, ttl: Duration, max_users: usize) -> Self {
        Self {
            caches: Mutex::new(LruCache::unbounded()),
            policy,
            ttl,
            max_users: max_users.max(1),
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Existing record for `user_id`, or a fresh empty one inserted atomically
    pub async fn get_or_create(&self, user_id: &str) -> SharedUserCache {
        let mut caches = self.caches.lock().await;
        if let Some(existing) = caches.get(user_id) {
            return existing.clone();
        }
        while caches.len() >= self.max_users {
            // least recently used first
            let victim = caches
                .iter()
                .rev()
                .find(|(_, handle)| is_idle(handle))
                .map(|(id, _)| id.clone());
            match victim {
                Some(evicted) => {
                    caches.pop(&evicted);
                    tracing::debug!(user_id = %evicted, "user cache evicted (capacity)");
                }
                None => {
                    tracing::warn!(
                        max_users = self.max_users,
                        users = caches.len(),
                        "every user cache is busy; store grows past max_users"
                    );
                    break;
                }
            }
        }
        let created = Arc::new(Mutex::new(UserCache::new(user_id)));
        caches.put(user_id.to_string(), created.clone());
        tracing::debug!(user_id, "user cache created");
        created
    }

    pub async fn get(&self, user_id: &str) -> Option<SharedUserCache> {
        self.caches.lock().await.get(user_id).cloned()
    }

    /// Snapshot of an existing record; never creates one
    pub async fn snapshot(&self, user_id: &str) -> Option<FeedSnapshot> {
        let handle = self.get(user_id).await?;
        let cache = handle.lock().await;
        Some(cache.snapshot())
    }

    /// Merge `cards` into the user's feed, creating the record if needed
    pub async fn apply_cards(&self, user_id: &str, cards: &[Card]) -> FeedSnapshot {
        let handle = self.get_or_create(user_id).await;
        self.merge_into(&handle, cards).await;
        let cache = handle.lock().await;
        cache.snapshot()
    }

    /// Merge into a record the caller already holds.
    ///
    /// Only this user's lock is taken, and only for the merge itself.
    pub async fn merge_into(&self, handle: &SharedUserCache, cards: &[Card]) -> MergeOutcome {
        let mut cache = handle.lock().await;
        let outcome = self.policy.apply(&cache.cards, cards);
        cache.cards = outcome.cards.clone();
        cache.last_updated = Utc::now();
        tracing::debug!(
            user_id = %cache.user_id,
            admitted = outcome.admitted,
            rejected = outcome.rejected,
            evicted = outcome.evicted,
            total = cache.cards.len(),
            "cards merged"
        );
        outcome
    }

    /// Remove records idle for longer than `ttl`; returns the removed ids
    pub async fn sweep_expired(&self, ttl: Duration) -> Vec<String> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.sweep_expired_before(cutoff).await
    }

    /// Remove records whose `last_updated` is strictly before `cutoff`.
    /// Records with a run in flight are kept however old they are.
    pub async fn sweep_expired_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut caches = self.caches.lock().await;
        let entries: Vec<(String, SharedUserCache)> = caches
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut removed = Vec::new();
        for (user_id, handle) in entries {
            let expired = {
                let cache = handle.lock().await;
                !cache.processing && cache.last_updated < cutoff
            };
            if expired {
                caches.pop(&user_id);
                removed.push(user_id);
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "expired user caches removed");
        }
        removed
    }

    /// Delete a user's record; false when there was none
    pub async fn clear(&self, user_id: &str) -> bool {
        self.caches.lock().await.pop(user_id).is_some()
    }

    /// Drop every record; returns how many were dropped
    pub async fn shutdown(&self) -> usize {
        let mut caches = self.caches.lock().await;
        let count = caches.len();
        caches.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.caches.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
