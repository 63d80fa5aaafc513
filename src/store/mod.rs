pub mod schema;
pub mod types;

use std::path::Path;

use anyhow::{Context, Result};
use cnidarium::{Snapshot, StateDelta, StateRead, StateWrite, Storage};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::model::{EntryKey, EntrySummary, ImageMetadata};
use schema::{
    CONTENT_BY_MARKER_PREFIX, CONTENT_BY_PATH_PREFIX, CONTENT_PREFIX, IMAGE_BY_ENTRY_PREFIX,
    IMAGE_PREFIX, PATH_PREF_PREFIX, QUERY_PREFIX, SCHEMA_VERSION_KEY, SETTINGS_PREFIX,
};
use types::{CacheRecord, CachedList, ImageRow, PathPreference};

const PATH_ORDER_SETTING: &str = "path_order";

/// Opaque ids go through a hash before they become part of an index key, so
/// separators inside them cannot make one prefix match another id's rows.
fn id_component(id: &str) -> String {
    blake3::hash(id.as_bytes()).to_hex().to_string()
}

fn content_key(key: &EntryKey) -> String {
    format!("{}/{}", CONTENT_PREFIX, key)
}
fn marker_index_key(edit_marker: &str, key: &EntryKey) -> String {
    format!("{}/{}:{}", CONTENT_BY_MARKER_PREFIX, id_component(edit_marker), key)
}
fn path_index_prefix(path_id: &str) -> String {
    format!("{}/{}:", CONTENT_BY_PATH_PREFIX, id_component(path_id))
}
fn path_index_key(path_id: &str, key: &EntryKey) -> String {
    format!("{}{}", path_index_prefix(path_id), key)
}
fn image_key(image_id: &str) -> String {
    format!("{}/{}", IMAGE_PREFIX, image_id)
}
fn image_index_prefix(key: &EntryKey) -> String {
    format!("{}/{}:", IMAGE_BY_ENTRY_PREFIX, key)
}
fn pref_key(path_id: &str) -> String {
    format!("{}/{}", PATH_PREF_PREFIX, id_component(path_id))
}
fn setting_key(name: &str) -> String {
    format!("{}/{}", SETTINGS_PREFIX, name)
}
fn query_key(path_id: &str) -> String {
    format!("{}/{}", QUERY_PREFIX, id_component(path_id))
}

/// Versioned on-disk cache of entry content, image metadata, list results and
/// path preferences.
pub struct ContentStore {
    storage: Storage,
    /// A commit must fork from the latest version, so snapshot-then-commit
    /// sequences run one at a time.
    write_lock: Mutex<()>,
}

impl ContentStore {
    /// Open (or create) the store under `data_dir` and bring its schema up to date.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let storage = Storage::load(data_dir.to_path_buf(), schema::substore_prefixes())
            .await
            .context("Failed to init cnidarium storage")?;
        let store = Self {
            storage,
            write_lock: Mutex::new(()),
        };
        let version = store.migrate().await?;
        info!(path = ?data_dir, schema_version = version, "content store opened");
        Ok(store)
    }

    /// Flush and close the underlying database.
    pub async fn close(self) {
        self.storage.release().await;
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let snapshot = self.storage.latest_snapshot();
        Ok(read_json::<u32>(&snapshot, SCHEMA_VERSION_KEY)
            .await?
            .unwrap_or(0))
    }

    /// Apply every pending schema step, one commit per step.
    async fn migrate(&self) -> Result<u32> {
        let stored = self.schema_version().await?;
        let steps = schema::pending_steps(stored)?;
        for step in steps {
            let _guard = self.write_lock.lock().await;
            let snapshot = self.storage.latest_snapshot();
            let mut dropped = Vec::new();
            for table in step.dropped {
                for prefix in table.prefixes() {
                    dropped.extend(keys_with_prefix(&snapshot, &format!("{}/", prefix)).await?);
                }
            }

            let mut delta = StateDelta::new(snapshot);
            for key in &dropped {
                delta.delete(key.clone());
            }
            delta.put_raw(SCHEMA_VERSION_KEY.to_string(), serde_json::to_vec(&step.version)?);
            self.storage.commit(delta).await?;
            debug!(
                version = step.version,
                dropped_rows = dropped.len(),
                "schema step applied"
            );
        }
        Ok(steps.last().map(|s| s.version).unwrap_or(stored))
    }

    pub async fn get_entry(&self, key: &EntryKey) -> Result<Option<CacheRecord>> {
        let snapshot = self.storage.latest_snapshot();
        read_json(&snapshot, &content_key(key)).await
    }

    /// Write an entry record, overwriting whatever was stored for its key.
    pub async fn put_entry(&self, record: &CacheRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.storage.latest_snapshot();
        let previous: Option<CacheRecord> = read_json(&snapshot, &content_key(&record.key)).await?;

        let mut delta = StateDelta::new(snapshot);
        if let Some(prev) = previous {
            if prev.edit_marker != record.edit_marker {
                delta.delete(marker_index_key(&prev.edit_marker, &prev.key));
            }
            if prev.path_id != record.path_id {
                delta.delete(path_index_key(&prev.path_id, &prev.key));
            }
        }
        delta.put_raw(
            content_key(&record.key),
            serde_json::to_vec(record).context("serialize CacheRecord")?,
        );
        // Index entries (empty value, presence is the index)
        delta.put_raw(marker_index_key(&record.edit_marker, &record.key), vec![]);
        delta.put_raw(path_index_key(&record.path_id, &record.key), vec![]);

        self.storage.commit(delta).await?;
        debug!(entry_id = %record.id, key = %record.key, edit_marker = %record.edit_marker, "entry stored");
        Ok(())
    }

    /// Image metadata persisted for an entry, in server order.
    pub async fn images_for_entry(&self, key: &EntryKey) -> Result<Vec<ImageMetadata>> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = image_index_prefix(key);
        let mut rows = Vec::new();
        for index_key in keys_with_prefix(&snapshot, &prefix).await? {
            let Some(image_id) = index_key.strip_prefix(&prefix) else {
                continue;
            };
            match read_json::<StoredImage>(&snapshot, &image_key(image_id)).await {
                Ok(Some(stored)) => rows.push(stored),
                Ok(None) => warn!(image_id, "image index points at a missing row"),
                Err(e) => warn!(image_id, "Failed to read image row: {}", e),
            }
        }
        rows.sort_by_key(|r| r.position);
        Ok(rows.into_iter().map(|r| r.row.image).collect())
    }

    /// Replace all image rows of an entry in one commit.
    ///
    /// Rows not present in `images` are removed, so images deleted server-side
    /// do not linger.
    pub async fn replace_images(&self, key: &EntryKey, images: &[ImageMetadata]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.storage.latest_snapshot();
        let prefix = image_index_prefix(key);
        let existing = keys_with_prefix(&snapshot, &prefix).await?;

        let mut delta = StateDelta::new(snapshot);
        for index_key in &existing {
            if let Some(image_id) = index_key.strip_prefix(&prefix) {
                delta.delete(image_key(image_id));
            }
            delta.delete(index_key.clone());
        }
        for (position, image) in images.iter().enumerate() {
            let stored = StoredImage {
                position: position as u32,
                row: ImageRow {
                    entry_key: key.clone(),
                    image: image.clone(),
                },
            };
            delta.put_raw(
                image_key(&image.id),
                serde_json::to_vec(&stored).context("serialize ImageRow")?,
            );
            delta.put_raw(format!("{}{}", prefix, image.id), vec![]);
        }

        self.storage.commit(delta).await?;
        debug!(key = %key, removed = existing.len(), inserted = images.len(), "entry images replaced");
        Ok(())
    }

    /// All stored entry records belonging to a path.
    pub async fn entries_for_path(&self, path_id: &str) -> Result<Vec<CacheRecord>> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = path_index_prefix(path_id);
        let mut records = Vec::new();
        for index_key in keys_with_prefix(&snapshot, &prefix).await? {
            let Some(entry_key) = index_key.strip_prefix(&prefix) else {
                continue;
            };
            let key = format!("{}/{}", CONTENT_PREFIX, entry_key);
            if let Some(record) = read_json::<CacheRecord>(&snapshot, &key).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.day.cmp(&a.day).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Keys of all stored records written at `edit_marker`.
    pub async fn entry_keys_with_marker(&self, edit_marker: &str) -> Result<Vec<String>> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = format!("{}/{}:", CONTENT_BY_MARKER_PREFIX, id_component(edit_marker));
        Ok(keys_with_prefix(&snapshot, &prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub async fn path_preference(&self, path_id: &str) -> Result<Option<PathPreference>> {
        let snapshot = self.storage.latest_snapshot();
        read_json(&snapshot, &pref_key(path_id)).await
    }

    pub async fn is_path_hidden(&self, path_id: &str) -> Result<bool> {
        Ok(self
            .path_preference(path_id)
            .await?
            .map(|p| p.hidden)
            .unwrap_or(false))
    }

    pub async fn set_path_hidden(&self, path_id: &str, hidden: bool) -> Result<()> {
        let mut pref = self.path_preference(path_id).await?.unwrap_or_default();
        pref.path_id = path_id.to_string();
        pref.hidden = hidden;
        self.put_json(pref_key(path_id), &pref).await
    }

    pub async fn is_path_deleted(&self, path_id: &str) -> Result<bool> {
        Ok(self
            .path_preference(path_id)
            .await?
            .map(|p| p.deleted)
            .unwrap_or(false))
    }

    /// Mark a path deleted, keeping its hidden flag.
    pub async fn set_path_deleted(&self, path_id: &str, deleted: bool) -> Result<()> {
        let mut pref = self.path_preference(path_id).await?.unwrap_or_default();
        pref.path_id = path_id.to_string();
        pref.deleted = deleted;
        self.put_json(pref_key(path_id), &pref).await
    }

    /// Persisted display order of paths. Unreadable values read as empty.
    pub async fn path_order(&self) -> Result<Vec<String>> {
        let snapshot = self.storage.latest_snapshot();
        match read_json::<Vec<String>>(&snapshot, &setting_key(PATH_ORDER_SETTING)).await {
            Ok(order) => Ok(order.unwrap_or_default()),
            Err(e) => {
                warn!("Ignoring unreadable path order: {}", e);
                Ok(vec![])
            }
        }
    }

    pub async fn set_path_order(&self, path_ids: &[String]) -> Result<()> {
        self.put_json(setting_key(PATH_ORDER_SETTING), &path_ids).await
    }

    /// Persist the latest successful list result of a path.
    pub async fn save_entry_list(&self, path_id: &str, entries: &[EntrySummary]) -> Result<()> {
        let cached = CachedList {
            path_id: path_id.to_string(),
            entries: entries.to_vec(),
            fetched_at: chrono::Utc::now().timestamp(),
        };
        self.put_json(query_key(path_id), &cached).await
    }

    pub async fn load_entry_list(&self, path_id: &str) -> Result<Option<CachedList>> {
        let snapshot = self.storage.latest_snapshot();
        read_json(&snapshot, &query_key(path_id)).await
    }

    async fn put_json<T: Serialize + ?Sized>(&self, key: String, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).with_context(|| format!("serialize {}", key))?;
        let _guard = self.write_lock.lock().await;
        let mut delta = StateDelta::new(self.storage.latest_snapshot());
        delta.put_raw(key, bytes);
        self.storage.commit(delta).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn put_raw_for_test(&self, key: String, value: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut delta = StateDelta::new(self.storage.latest_snapshot());
        delta.put_raw(key, value);
        self.storage.commit(delta).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn has_key_for_test(&self, key: &str) -> Result<bool> {
        Ok(self.storage.latest_snapshot().get_raw(key).await?.is_some())
    }
}

/// On-disk image row with its position in the entry's image list.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct StoredImage {
    position: u32,
    #[serde(flatten)]
    row: ImageRow,
}

async fn read_json<T: DeserializeOwned>(snapshot: &Snapshot, key: &str) -> Result<Option<T>> {
    let Some(bytes) = snapshot.get_raw(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes).with_context(|| format!("deserialize {}", key))?;
    Ok(Some(value))
}

async fn keys_with_prefix(snapshot: &Snapshot, prefix: &str) -> Result<Vec<String>> {
    let mut stream = std::pin::pin!(snapshot.prefix_raw(prefix));
    let mut keys = Vec::new();
    while let Some(entry) = stream.next().await {
        let (key, _) = entry.with_context(|| format!("scan {}", prefix))?;
        keys.push(key);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(path_id: &str, id: &str, marker: &str, content: &str) -> CacheRecord {
        CacheRecord {
            key: EntryKey::new(path_id, id),
            id: id.to_string(),
            path_id: path_id.to_string(),
            day: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            edit_marker: marker.to_string(),
            content: content.to_string(),
            image_filenames: vec![],
            complete: true,
            stored_at: 0,
        }
    }

    fn image(id: &str, filename: &str) -> ImageMetadata {
        ImageMetadata {
            id: id.to_string(),
            filename: filename.to_string(),
            status: "ready".to_string(),
            strip_metadata: false,
            content_type: Some("image/jpeg".to_string()),
            byte_size: Some(1024),
        }
    }

    #[tokio::test]
    async fn test_fresh_store_is_at_latest_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), schema::latest().version);
    }

    #[tokio::test]
    async fn test_put_and_get_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let rec = record("p1", "e1", "ed1", "hello");
        store.put_entry(&rec).await.unwrap();

        let loaded = store.get_entry(&rec.key).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(store
            .get_entry(&EntryKey::new("p2", "e1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_overwrite_moves_marker_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        store.put_entry(&record("p1", "e1", "ed1", "v1")).await.unwrap();
        store.put_entry(&record("p1", "e1", "ed2", "v2")).await.unwrap();

        let key = EntryKey::new("p1", "e1");
        assert!(store.entry_keys_with_marker("ed1").await.unwrap().is_empty());
        assert_eq!(
            store.entry_keys_with_marker("ed2").await.unwrap(),
            vec![key.to_string()]
        );
        assert_eq!(store.get_entry(&key).await.unwrap().unwrap().content, "v2");
    }

    #[tokio::test]
    async fn test_entries_for_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        store.put_entry(&record("p1", "e1", "ed1", "a")).await.unwrap();
        store.put_entry(&record("p1", "e2", "ed2", "b")).await.unwrap();
        store.put_entry(&record("p2", "e3", "ed3", "c")).await.unwrap();

        let ids: Vec<String> = store
            .entries_for_path("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert!(store.entries_for_path("p3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_images_is_full_resync() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let key = EntryKey::new("p1", "e1");
        let other = EntryKey::new("p1", "e2");

        store
            .replace_images(&key, &[image("i2", "b.jpg"), image("i1", "a.jpg")])
            .await
            .unwrap();
        store.replace_images(&other, &[image("i9", "z.jpg")]).await.unwrap();

        let images = store.images_for_entry(&key).await.unwrap();
        let names: Vec<&str> = images.iter().map(|i| i.filename.as_str()).collect();
        // server order, not key order
        assert_eq!(names, vec!["b.jpg", "a.jpg"]);

        store.replace_images(&key, &[image("i3", "c.jpg")]).await.unwrap();
        let images = store.images_for_entry(&key).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, "i3");
        assert!(!store.has_key_for_test(&image_key("i1")).await.unwrap());

        store.replace_images(&key, &[]).await.unwrap();
        assert!(store.images_for_entry(&key).await.unwrap().is_empty());
        assert_eq!(store.images_for_entry(&other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_path_preferences() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        assert!(!store.is_path_hidden("p1").await.unwrap());
        assert!(!store.is_path_deleted("p1").await.unwrap());

        store.set_path_hidden("p1", true).await.unwrap();
        store.set_path_deleted("p1", true).await.unwrap();
        assert!(store.is_path_hidden("p1").await.unwrap());
        assert!(store.is_path_deleted("p1").await.unwrap());

        store.set_path_hidden("p1", false).await.unwrap();
        assert!(store.is_path_deleted("p1").await.unwrap());
        assert!(!store.is_path_hidden("p2").await.unwrap());
    }

    #[tokio::test]
    async fn test_path_order_roundtrip_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        assert!(store.path_order().await.unwrap().is_empty());

        let order = vec!["p2".to_string(), "p1".to_string()];
        store.set_path_order(&order).await.unwrap();
        assert_eq!(store.path_order().await.unwrap(), order);

        store
            .put_raw_for_test(setting_key(PATH_ORDER_SETTING), b"not json".to_vec())
            .await
            .unwrap();
        assert!(store.path_order().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("p1", "e1", "ed1", "persisted");
        {
            let store = ContentStore::open(dir.path()).await.unwrap();
            store.put_entry(&rec).await.unwrap();
            store.save_entry_list("p1", &[]).await.unwrap();
            store.close().await;
        }
        let store = ContentStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get_entry(&rec.key).await.unwrap().unwrap().content, "persisted");
        assert!(store.load_entry_list("p1").await.unwrap().is_some());
        assert!(store.load_entry_list("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upgrade_from_version_four_drops_legacy_content() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ContentStore::open(dir.path()).await.unwrap();
            // Rewind to a version-4 layout with an entry stored under its bare id
            store
                .put_raw_for_test(SCHEMA_VERSION_KEY.to_string(), b"4".to_vec())
                .await
                .unwrap();
            store
                .put_raw_for_test(format!("{}/e1", CONTENT_PREFIX), b"{}".to_vec())
                .await
                .unwrap();
            store.set_path_hidden("p1", true).await.unwrap();
            store.close().await;
        }

        let store = ContentStore::open(dir.path()).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), schema::latest().version);
        assert!(!store
            .has_key_for_test(&format!("{}/e1", CONTENT_PREFIX))
            .await
            .unwrap());
        // untouched tables keep their rows
        assert!(store.is_path_hidden("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ContentStore::open(dir.path()).await.unwrap();
            let future = schema::latest().version + 1;
            store
                .put_raw_for_test(SCHEMA_VERSION_KEY.to_string(), future.to_string().into_bytes())
                .await
                .unwrap();
            store.close().await;
        }
        assert!(ContentStore::open(dir.path()).await.is_err());
    }
}
