//! Multi-path entry synchronization.
//!
//! Watched path ids drive one list query each. Settled lists land in a map
//! keyed by path id, every visible entry is reconciled against the durable
//! store and the gateway, and consumers read a projection of both.

pub mod projection;
pub mod queries;
pub mod reconcile;

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::ReconcileOptions;
use crate::error::FetchKind;
use crate::gateway::EntryGateway;
use crate::model::{PathEntries, PathId};
use crate::store::ContentStore;
use queries::{is_blank, ListOutcome, PathLists};
use reconcile::{ClaimSet, ReconcileCache, ReconcileReport};

/// Volatile state. Guards are never held across a suspension point.
#[derive(Debug, Default)]
struct SyncState {
    watched: Vec<PathId>,
    lists: PathLists,
    cache: ReconcileCache,
}

pub struct SyncEngine<G> {
    gateway: G,
    store: Arc<ContentStore>,
    options: ReconcileOptions,
    state: RwLock<SyncState>,
    claims: ClaimSet,
    snapshot_tx: watch::Sender<Vec<PathEntries>>,
}

impl<G: EntryGateway> SyncEngine<G> {
    pub fn new(gateway: G, store: Arc<ContentStore>, options: ReconcileOptions) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            gateway,
            store,
            options,
            state: RwLock::new(SyncState::default()),
            claims: ClaimSet::default(),
            snapshot_tx,
        }
    }

    /// Receive every new snapshot. The receiver only reads.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PathEntries>> {
        self.snapshot_tx.subscribe()
    }

    /// Current snapshot, recomputed from state.
    pub async fn snapshot(&self) -> Vec<PathEntries> {
        let state = self.state.read().await;
        projection::project(&state.watched, &state.lists, &state.cache)
    }

    pub async fn watched_paths(&self) -> Vec<PathId> {
        self.state.read().await.watched.clone()
    }

    /// Number of entries held in the in-memory tier.
    pub async fn cached_entries(&self) -> usize {
        self.state.read().await.cache.len()
    }

    /// Replace the watched id list. Issues no network requests.
    ///
    /// Newly watched paths with no list in memory are seeded from the
    /// persisted query cache.
    pub async fn set_watched_paths(&self, path_ids: Vec<PathId>) {
        let missing: Vec<PathId> = {
            let state = self.state.read().await;
            let mut seen = HashSet::new();
            path_ids
                .iter()
                .filter(|p| !is_blank(p) && !state.lists.contains(p) && seen.insert(p.as_str()))
                .cloned()
                .collect()
        };

        let mut restored = Vec::new();
        for path_id in missing {
            match self.store.load_entry_list(&path_id).await {
                Ok(Some(cached)) => restored.push((path_id, cached.entries)),
                Ok(None) => {}
                Err(e) => warn!(path_id = %path_id, "Failed to restore cached list: {}", e),
            }
        }

        let mut state = self.state.write().await;
        state.watched = path_ids;
        for (path_id, entries) in restored {
            if state.lists.restore(&path_id, entries) {
                debug!(path_id = %path_id, "entry list restored from cache");
            }
        }
        self.publish_locked(&state);
    }

    /// Re-query every watched path and reconcile what comes back.
    pub async fn refresh(&self) -> ReconcileReport {
        let targets: Vec<PathId> = {
            let state = self.state.read().await;
            let mut seen = HashSet::new();
            state
                .watched
                .iter()
                .filter(|p| !is_blank(p) && seen.insert(p.as_str()))
                .cloned()
                .collect()
        };
        let mut report = self.query_paths(targets).await;
        // Restored lists that no query has replaced yet still need content.
        report.merge(&self.reconcile().await);
        report
    }

    /// Re-query one path after its list was invalidated.
    pub async fn invalidate(&self, path_id: &str) -> ReconcileReport {
        let watched = {
            let state = self.state.read().await;
            state.watched.iter().any(|p| p == path_id)
        };
        if is_blank(path_id) || !watched {
            debug!(path_id, "ignoring invalidation of unwatched path");
            return ReconcileReport::default();
        }
        self.query_paths(vec![path_id.to_string()]).await
    }

    /// One reconciliation pass over every visible entry.
    pub async fn reconcile(&self) -> ReconcileReport {
        let visible = {
            let state = self.state.read().await;
            state.lists.visible(&state.watched)
        };
        let report = self.reconcile_entries(visible).await;
        if report.touched() > 0 {
            self.publish().await;
        }
        report
    }

    async fn reconcile_entries(
        &self,
        entries: Vec<(PathId, crate::model::EntrySummary)>,
    ) -> ReconcileReport {
        let outcomes: Vec<_> = futures::stream::iter(entries)
            .map(|(path_id, summary)| async move {
                self.reconcile_entry(&path_id, &summary).await
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        for outcome in outcomes {
            report.record(outcome);
        }
        report
    }

    /// Run list queries concurrently. Each path applies its own result and
    /// reconciles its own entries as soon as it settles.
    async fn query_paths(&self, targets: Vec<PathId>) -> ReconcileReport {
        let issued: Vec<(PathId, u64)> = {
            let mut state = self.state.write().await;
            targets
                .into_iter()
                .map(|p| {
                    let generation = state.lists.begin(&p);
                    (p, generation)
                })
                .collect()
        };

        let mut pending: FuturesUnordered<_> = issued
            .into_iter()
            .map(|(path_id, generation)| async move {
                self.query_path(path_id, generation).await
            })
            .collect();

        let mut report = ReconcileReport::default();
        while let Some(path_report) = pending.next().await {
            report.merge(&path_report);
        }
        report
    }

    async fn query_path(&self, path_id: PathId, generation: u64) -> ReconcileReport {
        let result = self.gateway.list_entries(&path_id).await;
        let status = result.as_ref().ok().map(|env| env.status);
        let result = result.map(|env| env.data);
        if let Err(e) = &result {
            warn!(path_id = %path_id, kind = %FetchKind::List, status = ?e.status(), "Fetch failed: {}", e);
        }
        let fetched = result.as_ref().ok().cloned();

        let (outcome, visible) = {
            let mut state = self.state.write().await;
            let outcome = state.lists.apply(&path_id, generation, result.as_ref().map(Clone::clone));
            if outcome == ListOutcome::Applied {
                self.publish_locked(&state);
            }
            // Removed paths settle but start no content fetches
            let visible = if state.watched.iter().any(|p| *p == path_id) {
                state.lists.visible(std::slice::from_ref(&path_id))
            } else {
                Vec::new()
            };
            (outcome, visible)
        };

        let mut report = ReconcileReport::default();
        match outcome {
            ListOutcome::Applied => {
                if let Some(entries) = fetched {
                    debug!(path_id = %path_id, count = entries.len(), ?status, "entry list applied");
                    if let Err(e) = self.store.save_entry_list(&path_id, &entries).await {
                        warn!(path_id = %path_id, "Failed to persist entry list: {}", e);
                    }
                }
            }
            ListOutcome::Superseded => {
                debug!(path_id = %path_id, generation, "dropping superseded list result");
                return report;
            }
            ListOutcome::Failed => report.list_failures += 1,
        }

        let entries_report = self.reconcile_entries(visible).await;
        if entries_report.touched() > 0 {
            self.publish().await;
        }
        report.merge(&entries_report);
        report
    }

    /// Publish once a batch of entries has settled. The write guard keeps
    /// concurrent publishers from sending an older projection last.
    async fn publish(&self) {
        let state = self.state.write().await;
        self.publish_locked(&state);
    }

    /// Recompute and publish the projection under an already-held guard.
    fn publish_locked(&self, state: &SyncState) {
        let snapshot = projection::project(&state.watched, &state.lists, &state.cache);
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Log a one-line summary of a snapshot.
pub fn log_snapshot(snapshot: &[PathEntries]) {
    for slot in snapshot {
        let resolved = slot.entries.iter().filter(|e| e.content.is_some()).count();
        info!(
            path_id = %slot.path_id,
            entries = slot.entries.len(),
            resolved,
            "path snapshot"
        );
    }
}
