use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::time::Instant;
use tracing::{debug, warn};

use super::SyncEngine;
use crate::config::ReconcileOptions;
use crate::error::FetchKind;
use crate::gateway::EntryGateway;
use crate::model::{image_filenames, EntryKey, EntrySummary, ImageMetadata, PathId};
use crate::store::types::CacheRecord;

/// A network attempt for the current marker that did not fully succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub kinds: Vec<FetchKind>,
    pub attempts: u32,
    pub retry_at: Instant,
}

/// In-memory reconciliation state of one entry.
///
/// `content: None` means the entry is known stale and its fetch is attempted
/// or pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    pub edit_marker: String,
    pub content: Option<String>,
    pub image_filenames: Option<Vec<String>>,
    pub images: Option<Vec<ImageMetadata>>,
    pub failure: Option<FetchFailure>,
}

impl CachedContent {
    /// Nothing to do for `edit_marker`: reconciled, or failed with no retry due.
    pub fn is_settled(&self, edit_marker: &str, now: Instant, options: &ReconcileOptions) -> bool {
        if self.edit_marker != edit_marker {
            return false;
        }
        match &self.failure {
            None => true,
            Some(f) => f.attempts >= options.retry_max_attempts || now < f.retry_at,
        }
    }
}

/// Fast tier of the two-tier content cache. Never evicted within a session.
#[derive(Debug, Default)]
pub struct ReconcileCache {
    entries: HashMap<EntryKey, CachedContent>,
}

impl ReconcileCache {
    pub fn get(&self, key: &EntryKey) -> Option<&CachedContent> {
        self.entries.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, key: EntryKey, content: CachedContent) {
        self.entries.insert(key, content);
    }
}

/// How one entry was handled in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Already up to date in memory.
    Fresh,
    /// Another pass is working on this entry.
    InFlight,
    /// Promoted from the durable store.
    FromStore,
    /// Content and images fetched.
    Fetched,
    /// At least one fetch failed; fallback data used.
    Degraded,
}

/// Tally of one reconciliation pass (or a refresh of several paths).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub fresh: usize,
    pub in_flight: usize,
    pub from_store: usize,
    pub fetched: usize,
    pub degraded: usize,
    pub list_failures: usize,
}

impl ReconcileReport {
    pub fn record(&mut self, outcome: Reconciled) {
        match outcome {
            Reconciled::Fresh => self.fresh += 1,
            Reconciled::InFlight => self.in_flight += 1,
            Reconciled::FromStore => self.from_store += 1,
            Reconciled::Fetched => self.fetched += 1,
            Reconciled::Degraded => self.degraded += 1,
        }
    }

    pub fn merge(&mut self, other: &ReconcileReport) {
        self.fresh += other.fresh;
        self.in_flight += other.in_flight;
        self.from_store += other.from_store;
        self.fetched += other.fetched;
        self.degraded += other.degraded;
        self.list_failures += other.list_failures;
    }

    /// Entries that needed any I/O.
    pub fn touched(&self) -> usize {
        self.from_store + self.fetched + self.degraded
    }
}

/// Entry keys currently being reconciled; one writer per key.
///
/// A pass that finds its key held leaves its summary with the holder, which
/// picks it up before releasing the key.
#[derive(Debug, Default)]
pub(crate) struct ClaimSet {
    inner: Mutex<ClaimState>,
}

#[derive(Debug, Default)]
struct ClaimState {
    held: HashSet<EntryKey>,
    queued: HashMap<EntryKey, (PathId, EntrySummary)>,
}

impl ClaimSet {
    fn lock(&self) -> MutexGuard<'_, ClaimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take `key`, or hand `summary` to the current holder.
    fn claim(&self, key: &EntryKey, path_id: &str, summary: &EntrySummary) -> Option<Claim<'_>> {
        let mut state = self.lock();
        if !state.held.insert(key.clone()) {
            state
                .queued
                .insert(key.clone(), (path_id.to_string(), summary.clone()));
            return None;
        }
        Some(Claim {
            set: self,
            key: key.clone(),
            released: false,
        })
    }
}

struct Claim<'a> {
    set: &'a ClaimSet,
    key: EntryKey,
    released: bool,
}

impl Claim<'_> {
    /// Summary queued by an overlapping pass with a marker other than
    /// `done_marker`. Releases the key when there is none, under the same
    /// lock as the check.
    fn next_after(&mut self, done_marker: &str) -> Option<(PathId, EntrySummary)> {
        let mut state = self.set.lock();
        match state.queued.remove(&self.key) {
            Some(next) if next.1.edit_marker != done_marker => Some(next),
            _ => {
                state.held.remove(&self.key);
                self.released = true;
                None
            }
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.set.lock();
        state.held.remove(&self.key);
        state.queued.remove(&self.key);
    }
}

impl<G: EntryGateway> SyncEngine<G> {
    /// Bring one entry's cached content in line with its current edit marker.
    ///
    /// `path_id` is the watched id the entry was listed under; requests go there.
    /// If another pass brings a newer marker while this one holds the entry,
    /// this pass reconciles that marker too before letting go.
    pub(super) async fn reconcile_entry(&self, path_id: &str, summary: &EntrySummary) -> Reconciled {
        let key = EntryKey::of(summary);

        // Claim before reading memory so a pass that just finished is observed.
        let Some(mut claim) = self.claims.claim(&key, path_id, summary) else {
            return Reconciled::InFlight;
        };

        let mut outcome = self.reconcile_claimed(&key, path_id, summary).await;
        let mut done_marker = summary.edit_marker.clone();
        while let Some((next_path, next)) = claim.next_after(&done_marker) {
            debug!(
                entry_id = %next.id,
                from = %done_marker,
                to = %next.edit_marker,
                "edit marker changed during reconcile"
            );
            outcome = self.reconcile_claimed(&key, &next_path, &next).await;
            done_marker = next.edit_marker;
        }
        outcome
    }

    async fn reconcile_claimed(
        &self,
        key: &EntryKey,
        path_id: &str,
        summary: &EntrySummary,
    ) -> Reconciled {
        let key = key.clone();
        let marker = summary.edit_marker.as_str();

        let previous = {
            let state = self.state.read().await;
            state.cache.get(&key).cloned()
        };
        if previous
            .as_ref()
            .is_some_and(|p| p.is_settled(marker, Instant::now(), &self.options))
        {
            return Reconciled::Fresh;
        }

        // Durable tier
        let stored = match self.store.get_entry(&key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(entry_id = %summary.id, "Durable lookup failed, treating as miss: {}", e);
                None
            }
        };
        if let Some(record) = stored.as_ref().filter(|r| r.is_fresh_for(marker)) {
            let images = match self.store.images_for_entry(&key).await {
                Ok(images) => Some(images),
                Err(e) => {
                    warn!(entry_id = %summary.id, "Failed to read cached images: {}", e);
                    None
                }
            };
            let cached = CachedContent {
                edit_marker: marker.to_string(),
                content: Some(record.content.clone()),
                image_filenames: Some(record.image_filenames.clone()),
                images,
                failure: None,
            };
            self.store_in_memory(key, cached).await;
            debug!(entry_id = %summary.id, edit_marker = marker, "entry promoted from store");
            return Reconciled::FromStore;
        }

        // Network tier. The two requests fail independently.
        let (content_res, images_res) = tokio::join!(
            self.gateway.get_entry_content(path_id, &summary.id),
            self.gateway.list_entry_images(path_id, &summary.id),
        );

        let mut failed = Vec::new();
        let fetched_content = match content_res {
            Ok(envelope) => Some(envelope.data.content),
            Err(e) => {
                warn!(path_id, entry_id = %summary.id, kind = %FetchKind::Content, status = ?e.status(), "Fetch failed: {}", e);
                failed.push(FetchKind::Content);
                None
            }
        };
        let fetched_images = match images_res {
            Ok(envelope) => Some(envelope.data),
            Err(e) => {
                warn!(path_id, entry_id = %summary.id, kind = %FetchKind::Images, status = ?e.status(), "Fetch failed: {}", e);
                failed.push(FetchKind::Images);
                None
            }
        };

        let content_ok = fetched_content.is_some();
        let images_ok = fetched_images.is_some();

        // Fallbacks: stale durable record first, then memory, then empty.
        let content = fetched_content.unwrap_or_else(|| {
            stored
                .as_ref()
                .map(|r| r.content.clone())
                .or_else(|| previous.as_ref().and_then(|p| p.content.clone()))
                .unwrap_or_default()
        });
        let (images, filenames) = match fetched_images {
            Some(images) => {
                let filenames = image_filenames(&images);
                (Some(images), filenames)
            }
            None => self.fallback_images(&key, stored.as_ref(), previous.as_ref()).await,
        };

        if content_ok || images_ok {
            let record = CacheRecord {
                key: key.clone(),
                id: summary.id.clone(),
                path_id: summary.path_id.clone(),
                day: summary.day,
                edit_marker: marker.to_string(),
                content: content.clone(),
                image_filenames: filenames.clone(),
                complete: content_ok && images_ok,
                stored_at: chrono::Utc::now().timestamp(),
            };
            if let Err(e) = self.store.put_entry(&record).await {
                warn!(entry_id = %summary.id, "Failed to persist entry: {}", e);
            }
            if let Some(images) = images.as_ref().filter(|_| images_ok) {
                if let Err(e) = self.store.replace_images(&key, images).await {
                    warn!(entry_id = %summary.id, "Failed to persist images: {}", e);
                }
            }
        }

        let failure = if failed.is_empty() {
            None
        } else {
            let attempts = previous
                .as_ref()
                .filter(|p| p.edit_marker == marker)
                .and_then(|p| p.failure.as_ref())
                .map(|f| f.attempts + 1)
                .unwrap_or(1);
            Some(FetchFailure {
                kinds: failed,
                attempts,
                retry_at: Instant::now() + self.options.backoff_after(attempts),
            })
        };
        let degraded = failure.is_some();

        let cached = CachedContent {
            edit_marker: marker.to_string(),
            content: Some(content),
            image_filenames: Some(filenames),
            images,
            failure,
        };
        self.store_in_memory(key, cached).await;

        if degraded {
            Reconciled::Degraded
        } else {
            debug!(path_id, entry_id = %summary.id, edit_marker = marker, "entry fetched");
            Reconciled::Fetched
        }
    }

    /// Images to show when the image fetch failed.
    async fn fallback_images(
        &self,
        key: &EntryKey,
        stored: Option<&CacheRecord>,
        previous: Option<&CachedContent>,
    ) -> (Option<Vec<ImageMetadata>>, Vec<String>) {
        let rows = match self.store.images_for_entry(key).await {
            Ok(rows) if !rows.is_empty() => Some(rows),
            Ok(_) => None,
            Err(e) => {
                warn!(key = %key, "Failed to read cached images: {}", e);
                None
            }
        };
        let images = rows.or_else(|| previous.and_then(|p| p.images.clone()));
        let filenames = stored
            .map(|r| r.image_filenames.clone())
            .or_else(|| previous.and_then(|p| p.image_filenames.clone()))
            .or_else(|| images.as_deref().map(image_filenames))
            .unwrap_or_default();
        (images, filenames)
    }

    async fn store_in_memory(&self, key: EntryKey, cached: CachedContent) {
        self.state.write().await.cache.insert(key, cached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cached(marker: &str, failure: Option<FetchFailure>) -> CachedContent {
        CachedContent {
            edit_marker: marker.to_string(),
            content: Some(String::new()),
            image_filenames: Some(vec![]),
            images: None,
            failure,
        }
    }

    #[test]
    fn test_settled_requires_matching_marker() {
        let opts = ReconcileOptions::default();
        let now = Instant::now();
        assert!(cached("ed1", None).is_settled("ed1", now, &opts));
        assert!(!cached("ed1", None).is_settled("ed2", now, &opts));
    }

    #[test]
    fn test_failure_settles_until_retry_due() {
        let opts = ReconcileOptions {
            retry_max_attempts: 3,
            ..Default::default()
        };
        let now = Instant::now();
        let failure = FetchFailure {
            kinds: vec![FetchKind::Content],
            attempts: 1,
            retry_at: now + Duration::from_secs(10),
        };
        let entry = cached("ed1", Some(failure));
        assert!(entry.is_settled("ed1", now, &opts));
        assert!(!entry.is_settled("ed1", now + Duration::from_secs(11), &opts));
    }

    #[test]
    fn test_failure_settles_after_max_attempts() {
        let opts = ReconcileOptions {
            retry_max_attempts: 2,
            ..Default::default()
        };
        let now = Instant::now();
        let failure = FetchFailure {
            kinds: vec![FetchKind::Images],
            attempts: 2,
            retry_at: now,
        };
        assert!(cached("ed1", Some(failure)).is_settled("ed1", now, &opts));
    }

    fn entry(marker: &str) -> EntrySummary {
        EntrySummary {
            id: "e1".to_string(),
            path_id: "p1".to_string(),
            day: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            edit_marker: marker.to_string(),
        }
    }

    #[test]
    fn test_claims_are_exclusive() {
        let claims = ClaimSet::default();
        let key = EntryKey::new("p1", "e1");
        let first = claims.claim(&key, "p1", &entry("ed1"));
        assert!(first.is_some());
        assert!(claims.claim(&key, "p1", &entry("ed1")).is_none());
        drop(first);
        assert!(claims.claim(&key, "p1", &entry("ed1")).is_some());
    }

    #[test]
    fn test_holder_picks_up_newer_marker() {
        let claims = ClaimSet::default();
        let key = EntryKey::new("p1", "e1");
        let mut claim = claims.claim(&key, "p1", &entry("ed1")).unwrap();
        assert!(claims.claim(&key, "p1", &entry("ed2")).is_none());

        let (path_id, next) = claim.next_after("ed1").unwrap();
        assert_eq!(path_id, "p1");
        assert_eq!(next.edit_marker, "ed2");
        // Still held while the newer marker is reconciled
        assert!(claims.claim(&key, "p1", &entry("ed2")).is_none());

        // Queued marker already done: release
        assert!(claim.next_after("ed2").is_none());
        drop(claim);
        assert!(claims.claim(&key, "p1", &entry("ed2")).is_some());
    }

    #[test]
    fn test_release_without_queue() {
        let claims = ClaimSet::default();
        let key = EntryKey::new("p1", "e1");
        let mut claim = claims.claim(&key, "p1", &entry("ed1")).unwrap();
        assert!(claim.next_after("ed1").is_none());
        assert!(claims.claim(&key, "p1", &entry("ed1")).is_some());
    }

    #[test]
    fn test_report_merge() {
        let mut a = ReconcileReport::default();
        a.record(Reconciled::Fetched);
        a.record(Reconciled::Fresh);
        let mut b = ReconcileReport::default();
        b.record(Reconciled::Degraded);
        b.list_failures = 1;
        a.merge(&b);
        assert_eq!(a.fetched, 1);
        assert_eq!(a.degraded, 1);
        assert_eq!(a.touched(), 2);
        assert_eq!(a.list_failures, 1);
    }
}
