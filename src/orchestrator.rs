//! Background fan-out of one trigger across every registered producer
//!
//! A run is single-flight per user: the `processing` flag on the user's cache
//! is checked and set under that cache's lock, so a second trigger that
//! arrives while a run is in flight returns the current snapshot and spawns
//! nothing. The run is also registered per user in [`RunRegistry`], so a run
//! whose cache was cleared or swept still blocks a new one until it finishes.
//! Producer results are merged one at a time as they complete; no lock is held
//! while a producer is running.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::Instrument;
use uuid::Uuid;

use crate::cards::Card;
use crate::producers::{ProduceRequest, Producer, ProducerError, ProducerRegistry};
use crate::registry::RunRegistry;
use crate::store::{FeedSnapshot, SharedUserCache, UserCacheStore};

/// Tally of one finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Producers a task was spawned for
    pub producers: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cards_admitted: usize,
}

/// Handle to a spawned run. Dropping it detaches the run.
pub struct RunHandle {
    pub run_id: Uuid,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Wait for the run to finish; `Err` if it was aborted
    pub async fn wait(self) -> Result<RunReport, JoinError> {
        self.join.await
    }
}

/// Result of a trigger: the snapshot at trigger time and, if this trigger
/// started a run, its handle
pub struct Dispatch {
    pub snapshot: FeedSnapshot,
    pub run: Option<RunHandle>,
}

impl Dispatch {
    pub fn started(&self) -> bool {
        self.run.is_some()
    }
}

enum ProducerOutcome {
    Cards(Vec<Card>),
    Skipped,
    Failed(ProducerError),
}

pub struct Orchestrator {
    producers: ProducerRegistry,
    store: Arc<UserCacheStore>,
    runs: Arc<RunRegistry>,
}

impl Orchestrator {
    pub fn new(producers: ProducerRegistry, store: Arc<UserCacheStore>) -> Self {
        Self {
            producers,
            store,
            runs: Arc::new(RunRegistry::new()),
        }
    }

    pub fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }

    pub fn store(&self) -> &Arc<UserCacheStore> {
        &self.store
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    /// Start a run for `user_id` unless one is already in flight.
    ///
    /// Returns as soon as the run is spawned; producer latency never reaches
    /// the caller.
    pub async fn dispatch(&self, user_id: &str, request: ProduceRequest) -> Dispatch {
        let cache = self.store.get_or_create(user_id).await;
        let mut guard = cache.lock().await;
        if guard.processing {
            tracing::debug!(user_id, "run already in flight; returning cached cards");
            return Dispatch {
                snapshot: guard.snapshot(),
                run: None,
            };
        }
        // a run can outlive its cache (clear, expiry) and still be registered
        if self.runs.is_running(user_id) {
            tracing::debug!(user_id, "earlier run still registered; returning cached cards");
            return Dispatch {
                snapshot: guard.snapshot(),
                run: None,
            };
        }

        let run_id = Uuid::new_v4();
        let run = Run {
            run_id,
            user_id: user_id.to_string(),
            request: Arc::new(request),
            producers: self.producers.clone(),
            store: self.store.clone(),
            runs: self.runs.clone(),
            cache: cache.clone(),
        };
        let span = tracing::info_span!("run", %run_id, user_id);
        // the cache guard is still held, so the run cannot touch it before
        // `processing` is set below
        let Some(join) = self.runs.spawn(run_id, user_id, run.execute().instrument(span)) else {
            return Dispatch {
                snapshot: guard.snapshot(),
                run: None,
            };
        };
        guard.processing = true;
        guard.request_count += 1;
        let snapshot = guard.snapshot();
        drop(guard);
        tracing::info!(%run_id, user_id, producers = self.producers.len(), "run dispatched");

        Dispatch {
            snapshot,
            run: Some(RunHandle { run_id, join }),
        }
    }
}

struct Run {
    run_id: Uuid,
    user_id: String,
    request: Arc<ProduceRequest>,
    producers: ProducerRegistry,
    store: Arc<UserCacheStore>,
    runs: Arc<RunRegistry>,
    /// Held for the whole run; a run that outlives a clear keeps writing here
    cache: SharedUserCache,
}

impl Run {
    async fn execute(self) -> RunReport {
        let mut report = RunReport {
            run_id: self.run_id,
            ..RunReport::default()
        };

        let mut tasks = JoinSet::new();
        for producer in self.producers.iter() {
            let producer = producer.clone();
            let request = self.request.clone();
            let span = tracing::debug_span!("producer", name = producer.name());
            tasks.spawn(
                async move {
                    let name = producer.name().to_string();
                    let outcome = run_producer(producer.as_ref(), &request).await;
                    (name, outcome)
                }
                .instrument(span),
            );
        }
        report.producers = tasks.len();

        while let Some(joined) = tasks.join_next().await {
            let cards = match joined {
                Ok((name, ProducerOutcome::Cards(cards))) => {
                    tracing::debug!(producer = %name, count = cards.len(), "producer finished");
                    report.succeeded += 1;
                    cards
                }
                Ok((_, ProducerOutcome::Skipped)) => {
                    report.skipped += 1;
                    continue;
                }
                Ok((name, ProducerOutcome::Failed(err))) => {
                    tracing::warn!(producer = %name, error = %err, "producer failed");
                    report.failed += 1;
                    Vec::new()
                }
                Err(err) => {
                    tracing::warn!(error = %err, "producer task did not complete");
                    report.failed += 1;
                    Vec::new()
                }
            };
            let outcome = self.store.merge_into(&self.cache, &cards).await;
            report.cards_admitted += outcome.admitted;
        }

        // unregister first: once `processing` is false a new run may start,
        // and it must not find this one still registered
        self.runs.unregister(&self.user_id, &self.run_id);
        self.cache.lock().await.processing = false;
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            admitted = report.cards_admitted,
            "run finished"
        );
        report
    }
}

async fn run_producer(producer: &dyn Producer, request: &ProduceRequest) -> ProducerOutcome {
    match producer.available().await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("producer unavailable; skipped");
            return ProducerOutcome::Skipped;
        }
        Err(err) => {
            tracing::debug!(error = %err, "availability probe failed; skipped");
            return ProducerOutcome::Skipped;
        }
    }
    match producer.produce(request).await {
        Ok(cards) => ProducerOutcome::Cards(cards),
        Err(err) => ProducerOutcome::Failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{CardCategory, GlobalContext};
    use crate::merge::MergePolicy;
    use crate::producers::CursorPosition;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed {
        name: &'static str,
        text: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Producer for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        async fn available(&self) -> Result<bool, ProducerError> {
            Ok(true)
        }
        async fn produce(&self, _: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Card::new(self.name, self.text, CardCategory::Context)])
        }
    }

    struct Offline;

    #[async_trait]
    impl Producer for Offline {
        fn name(&self) -> &str {
            "offline"
        }
        async fn available(&self) -> Result<bool, ProducerError> {
            Err(ProducerError::Unavailable("down".into()))
        }
        async fn produce(&self, _: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
            panic!("produce called on an unavailable producer");
        }
    }

    struct Panics;

    #[async_trait]
    impl Producer for Panics {
        fn name(&self) -> &str {
            "panics"
        }
        async fn available(&self) -> Result<bool, ProducerError> {
            Ok(true)
        }
        async fn produce(&self, _: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
            panic!("boom");
        }
    }

    fn request() -> ProduceRequest {
        ProduceRequest {
            document_text: "plan".into(),
            cursor: CursorPosition::new(0, 0),
            global_context: GlobalContext::default(),
        }
    }

    fn store() -> Arc<UserCacheStore> {
        Arc::new(UserCacheStore::new(
            MergePolicy::default(),
            Duration::from_secs(60),
            8,
        ))
    }

    #[tokio::test]
    async fn run_merges_and_resets_processing() {
        let fixed = Arc::new(Fixed {
            name: "fixed",
            text: "Follow the formatter settings",
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(ProducerRegistry::new().with(fixed.clone()), store());

        let dispatch = orchestrator.dispatch("u1", request()).await;
        assert!(dispatch.snapshot.processing);
        assert_eq!(dispatch.snapshot.request_count, 1);
        let report = dispatch.run.unwrap().wait().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.cards_admitted, 1);

        let snap = orchestrator.store().snapshot("u1").await.unwrap();
        assert!(!snap.processing);
        assert_eq!(snap.cards.len(), 1);
        assert!(orchestrator.runs().is_empty());
    }

    #[tokio::test]
    async fn unavailable_is_skipped_and_panic_is_a_failure() {
        let fixed = Arc::new(Fixed {
            name: "fixed",
            text: "Extract the parser into a module",
            calls: AtomicUsize::new(0),
        });
        let registry = ProducerRegistry::new()
            .with(fixed)
            .with(Arc::new(Offline))
            .with(Arc::new(Panics));
        let orchestrator = Orchestrator::new(registry, store());

        let report = orchestrator
            .dispatch("u1", request())
            .await
            .run
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(report.producers, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);

        let snap = orchestrator.store().snapshot("u1").await.unwrap();
        assert_eq!(snap.cards.len(), 1);
        assert!(!snap.processing);
    }

    struct Waits(Arc<tokio::sync::Notify>);

    #[async_trait]
    impl Producer for Waits {
        fn name(&self) -> &str {
            "waits"
        }
        async fn available(&self) -> Result<bool, ProducerError> {
            Ok(true)
        }
        async fn produce(&self, _: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
            self.0.notified().await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn run_outliving_its_cache_blocks_a_new_run() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let orchestrator = Orchestrator::new(
            ProducerRegistry::new().with(Arc::new(Waits(gate.clone()))),
            store(),
        );
        let first = orchestrator.dispatch("u1", request()).await;
        assert!(first.started());

        assert!(orchestrator.store().clear("u1").await);
        let second = orchestrator.dispatch("u1", request()).await;
        assert!(!second.started());
        assert!(!second.snapshot.processing);
        assert_eq!(orchestrator.runs().len(), 1);

        gate.notify_one();
        first.run.unwrap().wait().await.unwrap();
        assert!(orchestrator.runs().is_empty());
        assert!(orchestrator.dispatch("u1", request()).await.started());
    }

    #[tokio::test]
    async fn empty_registry_still_completes() {
        let orchestrator = Orchestrator::new(ProducerRegistry::new(), store());
        let report = orchestrator
            .dispatch("u1", request())
            .await
            .run
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(report.producers, 0);
        assert!(!orchestrator.store().snapshot("u1").await.unwrap().processing);
    }
}
