//! Durable store contract and the file-backed implementation.
//!
//! Layout under the data root:
//!
//! ```text
//! threads/<thread_id>/thread.json      thread record
//! threads/<thread_id>/state.json       per-thread position counter
//! threads/<thread_id>/items/<id>.json  one file per timeline item
//! attachments/<id>.json                attachment records
//! ```
//!
//! Every write goes through an atomic temp-file rename so a crashed process
//! never leaves a half-written record behind.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{Attachment, Owner, ThreadItem, ThreadRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence contract for threads, items, and attachments. Every call is
/// checked against the caller identity; service privilege bypasses the
/// owner check but still records the row owner unchanged.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_or_update_thread(
        &self,
        owner: &Owner,
        thread: &ThreadRecord,
    ) -> Result<(), StoreError>;

    async fn load_thread(&self, owner: &Owner, thread_id: &str)
    -> Result<ThreadRecord, StoreError>;

    async fn list_threads(&self, owner: &Owner) -> Result<Vec<ThreadRecord>, StoreError>;

    async fn delete_thread(&self, owner: &Owner, thread_id: &str) -> Result<(), StoreError>;

    /// Append an item, or update it in place when the id already exists.
    /// First append assigns the next per-thread position; a re-append keeps
    /// the original position and creation time. Returns the stored item.
    async fn append_item(&self, owner: &Owner, item: &ThreadItem)
    -> Result<ThreadItem, StoreError>;

    /// Items ordered by position, optionally only those after a position.
    async fn list_items(
        &self,
        owner: &Owner,
        thread_id: &str,
        after_position: Option<u64>,
    ) -> Result<Vec<ThreadItem>, StoreError>;

    async fn create_attachment(
        &self,
        owner: &Owner,
        attachment: &Attachment,
    ) -> Result<(), StoreError>;

    async fn list_attachments(
        &self,
        owner: &Owner,
        thread_id: &str,
    ) -> Result<Vec<Attachment>, StoreError>;

    /// Widget snapshots are plain items upserted by id.
    async fn upsert_widget_snapshot(
        &self,
        owner: &Owner,
        item: &ThreadItem,
    ) -> Result<ThreadItem, StoreError> {
        self.append_item(owner, item).await
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[derive(Debug, Default, Serialize, serde::Deserialize)]
struct ThreadCounters {
    next_position: u64,
}

/// File-backed store rooted at a data directory.
pub struct FileStore {
    root: PathBuf,
    /// Serializes position assignment across concurrent appends.
    position_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("threads"))?;
        fs::create_dir_all(root.join("attachments"))?;
        Ok(Self {
            root,
            position_lock: Mutex::new(()),
        })
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join("threads").join(thread_id)
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.thread_dir(thread_id).join("thread.json")
    }

    fn state_path(&self, thread_id: &str) -> PathBuf {
        self.thread_dir(thread_id).join("state.json")
    }

    fn item_path(&self, thread_id: &str, item_id: &str) -> PathBuf {
        self.thread_dir(thread_id)
            .join("items")
            .join(format!("{item_id}.json"))
    }

    /// Load the thread and enforce owner scoping in one step.
    fn load_checked(&self, owner: &Owner, thread_id: &str) -> Result<ThreadRecord, StoreError> {
        let path = self.thread_path(thread_id);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        }
        let thread: ThreadRecord = read_json(&path)?;
        if !owner.can_access(&thread.owner_id) {
            return Err(StoreError::PermissionDenied);
        }
        Ok(thread)
    }

    fn read_items_unordered(&self, thread_id: &str) -> Result<Vec<ThreadItem>, StoreError> {
        let dir = self.thread_dir(thread_id).join("items");
        let mut items = Vec::new();
        if !dir.exists() {
            return Ok(items);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                items.push(read_json(&path)?);
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_or_update_thread(
        &self,
        owner: &Owner,
        thread: &ThreadRecord,
    ) -> Result<(), StoreError> {
        let path = self.thread_path(&thread.id);
        if path.exists() {
            let existing: ThreadRecord = read_json(&path)?;
            if !owner.can_access(&existing.owner_id) {
                return Err(StoreError::PermissionDenied);
            }
        } else if !owner.can_access(&thread.owner_id) {
            return Err(StoreError::PermissionDenied);
        }
        write_json_atomic(&path, thread)?;
        debug!(thread_id = %thread.id, "thread written");
        Ok(())
    }

    async fn load_thread(
        &self,
        owner: &Owner,
        thread_id: &str,
    ) -> Result<ThreadRecord, StoreError> {
        self.load_checked(owner, thread_id)
    }

    async fn list_threads(&self, owner: &Owner) -> Result<Vec<ThreadRecord>, StoreError> {
        let dir = self.root.join("threads");
        let mut threads = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path().join("thread.json");
            if !path.exists() {
                continue;
            }
            let thread: ThreadRecord = read_json(&path)?;
            if owner.can_access(&thread.owner_id) {
                threads.push(thread);
            }
        }
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    async fn delete_thread(&self, owner: &Owner, thread_id: &str) -> Result<(), StoreError> {
        self.load_checked(owner, thread_id)?;
        fs::remove_dir_all(self.thread_dir(thread_id))?;
        debug!(thread_id, "thread deleted");
        Ok(())
    }

    async fn append_item(
        &self,
        owner: &Owner,
        item: &ThreadItem,
    ) -> Result<ThreadItem, StoreError> {
        self.load_checked(owner, &item.thread_id)?;
        let path = self.item_path(&item.thread_id, &item.id);

        if path.exists() {
            // Idempotent upsert: payload replaced, position and creation
            // time preserved from the first append.
            let existing: ThreadItem = read_json(&path)?;
            let mut updated = item.clone();
            updated.position = existing.position;
            updated.created_at = existing.created_at;
            write_json_atomic(&path, &updated)?;
            return Ok(updated);
        }

        let _guard = self.position_lock.lock().await;
        let state_path = self.state_path(&item.thread_id);
        let mut counters: ThreadCounters = if state_path.exists() {
            read_json(&state_path)?
        } else {
            ThreadCounters { next_position: 1 }
        };
        let mut stored = item.clone();
        stored.position = counters.next_position;
        counters.next_position += 1;
        write_json_atomic(&path, &stored)?;
        write_json_atomic(&state_path, &counters)?;
        Ok(stored)
    }

    async fn list_items(
        &self,
        owner: &Owner,
        thread_id: &str,
        after_position: Option<u64>,
    ) -> Result<Vec<ThreadItem>, StoreError> {
        self.load_checked(owner, thread_id)?;
        let mut items = self.read_items_unordered(thread_id)?;
        if let Some(after) = after_position {
            items.retain(|item| item.position > after);
        }
        items.sort_by_key(|item| item.position);
        Ok(items)
    }

    async fn create_attachment(
        &self,
        owner: &Owner,
        attachment: &Attachment,
    ) -> Result<(), StoreError> {
        if !owner.can_access(&attachment.owner_id) {
            return Err(StoreError::PermissionDenied);
        }
        if let Some(thread_id) = &attachment.thread_id {
            self.load_checked(owner, thread_id)?;
        }
        let path = self
            .root
            .join("attachments")
            .join(format!("{}.json", attachment.id));
        write_json_atomic(&path, attachment)
    }

    async fn list_attachments(
        &self,
        owner: &Owner,
        thread_id: &str,
    ) -> Result<Vec<Attachment>, StoreError> {
        self.load_checked(owner, thread_id)?;
        let dir = self.root.join("attachments");
        let mut attachments = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let attachment: Attachment = read_json(&path)?;
            if attachment.thread_id.as_deref() == Some(thread_id) {
                attachments.push(attachment);
            }
        }
        attachments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(attachments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemPayload;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        (store, dir)
    }

    fn message(thread: &ThreadRecord, text: &str) -> ThreadItem {
        ThreadItem::new(
            thread,
            ItemPayload::UserMessage {
                text: text.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn positions_are_gap_free_and_increasing() {
        let (store, _dir) = store();
        let owner = Owner::user("u1");
        let thread = ThreadRecord::new(&owner);
        store.create_or_update_thread(&owner, &thread).await.unwrap();

        for n in 1..=3u64 {
            let stored = store
                .append_item(&owner, &message(&thread, &format!("m{n}")))
                .await
                .unwrap();
            assert_eq!(stored.position, n);
        }
        let items = store.list_items(&owner, &thread.id, None).await.unwrap();
        let positions: Vec<u64> = items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reappend_keeps_position_and_updates_payload() {
        let (store, _dir) = store();
        let owner = Owner::user("u1");
        let thread = ThreadRecord::new(&owner);
        store.create_or_update_thread(&owner, &thread).await.unwrap();

        let mut item = message(&thread, "first");
        let stored = store.append_item(&owner, &item).await.unwrap();
        store
            .append_item(&owner, &message(&thread, "filler"))
            .await
            .unwrap();

        item.payload = ItemPayload::UserMessage {
            text: "rewritten".to_string(),
        };
        let updated = store.append_item(&owner, &item).await.unwrap();
        assert_eq!(updated.position, stored.position);

        let items = store.list_items(&owner, &thread.id, None).await.unwrap();
        assert_eq!(items.len(), 2);
        match &items[0].payload {
            ItemPayload::UserMessage { text } => assert_eq!(text, "rewritten"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn after_position_filters_older_items() {
        let (store, _dir) = store();
        let owner = Owner::user("u1");
        let thread = ThreadRecord::new(&owner);
        store.create_or_update_thread(&owner, &thread).await.unwrap();
        for n in 1..=4u64 {
            store
                .append_item(&owner, &message(&thread, &format!("m{n}")))
                .await
                .unwrap();
        }
        let items = store
            .list_items(&owner, &thread.id, Some(2))
            .await
            .unwrap();
        let positions: Vec<u64> = items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![3, 4]);
    }

    #[tokio::test]
    async fn owner_scoping_denies_other_users_but_not_service() {
        let (store, _dir) = store();
        let owner = Owner::user("u1");
        let stranger = Owner::user("u2");
        let service = Owner::service("engine");
        let thread = ThreadRecord::new(&owner);
        store.create_or_update_thread(&owner, &thread).await.unwrap();

        let err = store.load_thread(&stranger, &thread.id).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));
        assert!(store.load_thread(&service, &thread.id).await.is_ok());

        let visible = store.list_threads(&stranger).await.unwrap();
        assert!(visible.is_empty());
        let all = store.list_threads(&service).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_thread_and_items() {
        let (store, _dir) = store();
        let owner = Owner::user("u1");
        let thread = ThreadRecord::new(&owner);
        store.create_or_update_thread(&owner, &thread).await.unwrap();
        store.append_item(&owner, &message(&thread, "m")).await.unwrap();

        store.delete_thread(&owner, &thread.id).await.unwrap();
        let err = store.load_thread(&owner, &thread.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn attachments_are_scoped_to_their_thread() {
        let (store, _dir) = store();
        let owner = Owner::user("u1");
        let thread = ThreadRecord::new(&owner);
        store.create_or_update_thread(&owner, &thread).await.unwrap();

        let att = Attachment::new(&owner, Some(thread.id.clone()), "image/png", 123, "blob://a");
        store.create_attachment(&owner, &att).await.unwrap();
        let unattached = Attachment::new(&owner, None, "image/png", 1, "blob://b");
        // Unattached blobs are allowed but never listed under a thread.
        store.create_attachment(&owner, &unattached).await.unwrap();

        let listed = store.list_attachments(&owner, &thread.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, att.id);
    }
}
