use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a path (topic stream).
pub type PathId = String;

/// One row of a path's entry list, as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: String,
    pub path_id: PathId,
    pub day: NaiveDate,
    /// Changes exactly when the entry's content or image set changes.
    /// Only equality is meaningful.
    #[serde(rename = "edit_id")]
    pub edit_marker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryContent {
    #[serde(default)]
    pub content: String,
}

/// Metadata for one image attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub strip_metadata: bool,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub byte_size: Option<i64>,
}

/// An entry summary enriched with whatever content has been reconciled so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryWithContent {
    #[serde(flatten)]
    pub summary: EntrySummary,
    pub content: Option<String>,
    pub image_filenames: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageMetadata>>,
}

/// The externally visible unit: one watched path and its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathEntries {
    pub path_id: PathId,
    pub entries: Vec<EntryWithContent>,
}

/// Identity of an entry across the caches: blake3 of `(path_id, entry_id)`.
///
/// Entry ids are only unique within a path, so the path is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey(String);

impl EntryKey {
    pub fn new(path_id: &str, entry_id: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path_id.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update(&[0]);
        hasher.update(entry_id.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn of(summary: &EntrySummary) -> Self {
        Self::new(&summary.path_id, &summary.id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn image_filenames(images: &[ImageMetadata]) -> Vec<String> {
    images.iter().map(|img| img.filename.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_uses_edit_id_on_the_wire() {
        let json = r#"{"id":"e1","path_id":"p1","day":"2024-01-01","edit_id":"ed1"}"#;
        let summary: EntrySummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.edit_marker, "ed1");
        assert_eq!(summary.day, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn test_image_metadata_optional_fields() {
        let json = r#"{"id":"i1","filename":"a.jpg","status":"ready","strip_metadata":true,"content_type":null,"byte_size":null}"#;
        let img: ImageMetadata = serde_json::from_str(json).unwrap();
        assert!(img.strip_metadata);
        assert_eq!(img.content_type, None);
        assert_eq!(img.byte_size, None);
    }

    #[test]
    fn test_entry_key_separates_components() {
        assert_ne!(EntryKey::new("ab", "c"), EntryKey::new("a", "bc"));
        assert_ne!(EntryKey::new("p1", "e1"), EntryKey::new("p2", "e1"));
        assert_eq!(EntryKey::new("p1", "e1"), EntryKey::new("p1", "e1"));
        assert_eq!(EntryKey::new("p1", "e1").as_str().len(), 64);
    }

    #[test]
    fn test_entry_with_content_flattens_summary() {
        let entry = EntryWithContent {
            summary: EntrySummary {
                id: "e1".to_string(),
                path_id: "p1".to_string(),
                day: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                edit_marker: "ed1".to_string(),
            },
            content: Some("hello".to_string()),
            image_filenames: Some(vec![]),
            images: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["id"], "e1");
        assert_eq!(value["edit_id"], "ed1");
        assert_eq!(value["content"], "hello");
        assert!(value.get("images").is_none());
    }
}
