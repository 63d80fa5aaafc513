use crate::model::{EntryKey, EntrySummary, EntryWithContent, PathEntries, PathId};

use super::queries::PathLists;
use super::reconcile::ReconcileCache;

/// Build the visible snapshot: one slot per watched id, in watched order,
/// each filled from the keyed list map and enriched from the reconciliation
/// cache. Pure; only reads its inputs.
pub fn project(watched: &[PathId], lists: &PathLists, cache: &ReconcileCache) -> Vec<PathEntries> {
    watched
        .iter()
        .map(|path_id| PathEntries {
            path_id: path_id.clone(),
            entries: lists
                .get(path_id)
                .unwrap_or(&[])
                .iter()
                .map(|summary| enrich(summary, cache))
                .collect(),
        })
        .collect()
}

// Content reconciled under an older marker is still shown until the refetch lands.
fn enrich(summary: &EntrySummary, cache: &ReconcileCache) -> EntryWithContent {
    let cached = cache.get(&EntryKey::of(summary));
    EntryWithContent {
        summary: summary.clone(),
        content: cached.and_then(|c| c.content.clone()),
        image_filenames: cached.and_then(|c| c.image_filenames.clone()),
        images: cached.and_then(|c| c.images.clone()),
    }
}
