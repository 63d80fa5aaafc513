use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{EntryKey, ImageMetadata, PathId};

/// Durable snapshot of one entry's content at a given edit marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: EntryKey,
    pub id: String,
    pub path_id: PathId,
    pub day: NaiveDate,
    pub edit_marker: String,
    pub content: String,
    #[serde(default)]
    pub image_filenames: Vec<String>,
    /// Both content and images were fetched for this marker. Records written
    /// after a partial failure only serve as fallback data.
    #[serde(default)]
    pub complete: bool,
    pub stored_at: i64,
}

impl CacheRecord {
    /// True when this record can stand in for a network fetch at `edit_marker`.
    pub fn is_fresh_for(&self, edit_marker: &str) -> bool {
        self.complete && self.edit_marker == edit_marker
    }
}

/// One persisted image row, owned by an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRow {
    pub entry_key: EntryKey,
    #[serde(flatten)]
    pub image: ImageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPreference {
    pub path_id: PathId,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// Persisted result of one path's list query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedList {
    pub path_id: PathId,
    pub entries: Vec<crate::model::EntrySummary>,
    pub fetched_at: i64,
}
