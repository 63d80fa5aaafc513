use std::collections::{HashMap, HashSet};

use crate::error::FetchError;
use crate::model::{EntryKey, EntrySummary, PathId};

/// Blank ids never issue a request and always read as an empty list.
pub fn is_blank(path_id: &str) -> bool {
    path_id.trim().is_empty()
}

/// What happened to a settled list query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOutcome {
    Applied,
    /// A newer query for the same path was issued after this one.
    Superseded,
    Failed,
}

/// Latest entry list per path id.
///
/// Results are written by key as each query settles, never by position in the
/// watched list, so reordering the watched ids cannot move a list to another
/// path's slot.
#[derive(Debug, Default)]
pub struct PathLists {
    lists: HashMap<PathId, Vec<EntrySummary>>,
    issued: HashMap<PathId, u64>,
    next_generation: u64,
}

impl PathLists {
    pub fn get(&self, path_id: &str) -> Option<&[EntrySummary]> {
        self.lists.get(path_id).map(Vec::as_slice)
    }

    pub fn contains(&self, path_id: &str) -> bool {
        self.lists.contains_key(path_id)
    }

    /// Register a new query for `path_id` and return its generation.
    pub fn begin(&mut self, path_id: &str) -> u64 {
        self.next_generation += 1;
        self.issued.insert(path_id.to_string(), self.next_generation);
        self.next_generation
    }

    /// Apply a settled query. Failures keep the last known list.
    pub fn apply(
        &mut self,
        path_id: &str,
        generation: u64,
        result: Result<Vec<EntrySummary>, &FetchError>,
    ) -> ListOutcome {
        if self.issued.get(path_id).is_some_and(|&latest| latest != generation) {
            return ListOutcome::Superseded;
        }
        match result {
            Ok(entries) => {
                self.lists.insert(path_id.to_string(), entries);
                ListOutcome::Applied
            }
            Err(_) => ListOutcome::Failed,
        }
    }

    /// Seed a path from a persisted list. Never overwrites fetched data.
    pub fn restore(&mut self, path_id: &str, entries: Vec<EntrySummary>) -> bool {
        if self.lists.contains_key(path_id) {
            return false;
        }
        self.lists.insert(path_id.to_string(), entries);
        true
    }

    /// Entries of the given watched paths, each entry once, tagged with the
    /// watched id it was listed under.
    pub fn visible(&self, watched: &[PathId]) -> Vec<(PathId, EntrySummary)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for path_id in watched {
            if is_blank(path_id) {
                continue;
            }
            for entry in self.get(path_id).unwrap_or(&[]) {
                if seen.insert(EntryKey::of(entry)) {
                    out.push((path_id.clone(), entry.clone()));
                }
            }
        }
        out
    }
}
