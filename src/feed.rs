//! Trigger / Poll / Clear over the user cache store
//!
//! `FeedService` is what transports talk to. Every call sweeps expired caches
//! first, so no background timer is needed to keep the store bounded in time.

use std::sync::Arc;

use serde::Serialize;

use crate::cards::Card;
use crate::config::Config;
use crate::error::{ParallizerError, Result};
use crate::orchestrator::{Dispatch, Orchestrator};
use crate::producers::{ProduceRequest, ProducerRegistry};
use crate::store::{FeedSnapshot, UserCacheStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearStatus {
    Success,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerHealth {
    pub name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub producers: Vec<ProducerHealth>,
    pub active_users: usize,
    pub runs_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub aborted_runs: usize,
    pub dropped_caches: usize,
}

pub struct FeedService {
    orchestrator: Orchestrator,
    store: Arc<UserCacheStore>,
}

fn require_user_id(user_id: &str) -> Result<&str> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(ParallizerError::validation("user_id must not be empty"));
    }
    Ok(trimmed)
}

impl FeedService {
    pub fn new(producers: ProducerRegistry, store: UserCacheStore) -> Self {
        let store = Arc::new(store);
        Self {
            orchestrator: Orchestrator::new(producers, store.clone()),
            store,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let producers = ProducerRegistry::from_config(&config.producers)?;
        let store = UserCacheStore::new(
            config.cache.merge_policy(),
            config.cache.ttl(),
            config.cache.max_users,
        );
        Ok(Self::new(producers, store))
    }

    pub fn store(&self) -> &Arc<UserCacheStore> {
        &self.store
    }

    pub fn producer_count(&self) -> usize {
        self.orchestrator.producers().len()
    }

    async fn sweep(&self) {
        self.store.sweep_expired(self.store.ttl()).await;
    }

    /// Current snapshot right away; a background run starts unless one is
    /// already in flight for this user
    pub async fn trigger(&self, user_id: &str, request: ProduceRequest) -> Result<Dispatch> {
        let user_id = require_user_id(user_id)?;
        self.sweep().await;
        let dispatch = self.orchestrator.dispatch(user_id, request).await;
        tracing::info!(
            user_id,
            started = dispatch.started(),
            cached = dispatch.snapshot.cards.len(),
            "trigger"
        );
        Ok(dispatch)
    }

    /// Latest snapshot. Unknown users get an empty idle one and no cache is created.
    pub async fn poll(&self, user_id: &str) -> Result<FeedSnapshot> {
        let user_id = require_user_id(user_id)?;
        self.sweep().await;
        let snapshot = self
            .store
            .snapshot(user_id)
            .await
            .unwrap_or_else(|| FeedSnapshot::empty(user_id));
        tracing::debug!(
            user_id,
            cards = snapshot.cards.len(),
            processing = snapshot.processing,
            "poll"
        );
        Ok(snapshot)
    }

    pub async fn clear(&self, user_id: &str) -> Result<ClearStatus> {
        let user_id = require_user_id(user_id)?;
        self.sweep().await;
        let status = if self.store.clear(user_id).await {
            ClearStatus::Success
        } else {
            ClearStatus::NotFound
        };
        tracing::info!(user_id, ?status, "clear");
        Ok(status)
    }

    /// Manual insertion through the same merge policy producers go through
    pub async fn push_cards(&self, user_id: &str, cards: Vec<Card>) -> Result<FeedSnapshot> {
        let user_id = require_user_id(user_id)?;
        self.sweep().await;
        let snapshot = self.store.apply_cards(user_id, &cards).await;
        tracing::info!(user_id, pushed = cards.len(), total = snapshot.cards.len(), "cards pushed");
        Ok(snapshot)
    }

    pub async fn active_users(&self) -> usize {
        self.store.len().await
    }

    pub async fn health(&self) -> HealthReport {
        let mut producers = Vec::with_capacity(self.producer_count());
        for producer in self.orchestrator.producers().iter() {
            let (available, error) = match producer.available().await {
                Ok(available) => (available, None),
                Err(err) => (false, Some(err.to_string())),
            };
            producers.push(ProducerHealth {
                name: producer.name().to_string(),
                available,
                error,
            });
        }
        HealthReport {
            producers,
            active_users: self.active_users().await,
            runs_in_flight: self.orchestrator.runs().len(),
        }
    }

    /// Abort in-flight runs and drop every cache
    pub async fn shutdown(&self) -> ShutdownReport {
        let aborted_runs = self.orchestrator.runs().abort_all();
        let dropped_caches = self.store.shutdown().await;
        tracing::info!(aborted_runs, dropped_caches, "feed service shut down");
        ShutdownReport {
            aborted_runs,
            dropped_caches,
        }
    }
}
