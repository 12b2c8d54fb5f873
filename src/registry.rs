//! Registry of in-flight orchestration runs
//!
//! Maps user_id -> (run_id, AbortHandle). At most one run per user is ever
//! registered, which is what keeps a run alive across a clear or an eviction
//! of its cache from being joined by a second one. Shutdown aborts through the
//! stored handles and /health reports how many are running.

use std::future::Future;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

pub struct RunInfo {
    pub run_id: Uuid,
    handle: AbortHandle,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<String, RunInfo>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` as the run of `user_id`, or return `None` when that user
    /// already has a registered run.
    ///
    /// The task does not start until its entry is in the map, so a run that
    /// finishes immediately still finds its own entry to remove.
    pub fn spawn<F>(&self, run_id: Uuid, user_id: &str, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = match self.runs.entry(user_id.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!(user_id, run_id = %existing.get().run_id, "run already registered");
                return None;
            }
            Entry::Vacant(slot) => {
                let handle = tokio::spawn(async move {
                    // sender dropped only if the registry itself went away
                    let _ = registered_rx.await;
                    future.await
                });
                slot.insert(RunInfo {
                    run_id,
                    handle: handle.abort_handle(),
                });
                handle
            }
        };
        let _ = registered_tx.send(());
        Some(handle)
    }

    /// Remove a finished run; false if `run_id` is not the user's registered run
    pub fn unregister(&self, user_id: &str, run_id: &Uuid) -> bool {
        self.runs
            .remove_if(user_id, |_, info| info.run_id == *run_id)
            .is_some()
    }

    /// Abort every registered run; returns how many were aborted
    pub fn abort_all(&self) -> usize {
        let users: Vec<String> = self.runs.iter().map(|entry| entry.key().clone()).collect();
        let mut count = 0;
        for user_id in users {
            if let Some((_, info)) = self.runs.remove(&user_id) {
                tracing::debug!(run_id = %info.run_id, %user_id, "aborting run");
                info.handle.abort();
                count += 1;
            }
        }
        count
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.runs.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
