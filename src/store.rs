use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::models::Draft;
use crate::photo::Photo;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("draft not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Draft persistence. The service only needs point reads and whole-record
/// writes; listing is for operator tooling.
#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn put(&self, draft: Draft) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Draft, StoreError>;
    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Durable photo storage. `persist` returns an opaque media key; keys stay
/// valid until `remove`.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn persist(&self, draft_id: Uuid, photo: &Photo) -> Result<String, StoreError>;
    async fn remove(&self, media_key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryDraftStore {
    drafts: Mutex<HashMap<Uuid, Draft>>,
}

#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn put(&self, draft: Draft) -> Result<(), StoreError> {
        let mut guard = self.drafts.lock().await;
        guard.insert(draft.id, draft);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Draft, StoreError> {
        let guard = self.drafts.lock().await;
        guard.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let guard = self.drafts.lock().await;
        Ok(guard.keys().copied().collect())
    }
}

#[derive(Default)]
pub struct MemoryMediaStore {
    blobs: Mutex<HashMap<String, usize>>,
}

impl MemoryMediaStore {
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn persist(&self, draft_id: Uuid, photo: &Photo) -> Result<String, StoreError> {
        let key = format!("media/{draft_id}/{}", Uuid::new_v4());
        let mut guard = self.blobs.lock().await;
        guard.insert(key.clone(), photo.pixels.len());
        Ok(key)
    }

    async fn remove(&self, media_key: &str) -> Result<(), StoreError> {
        let mut guard = self.blobs.lock().await;
        guard.remove(media_key);
        Ok(())
    }
}

/// Removes persisted media unless `disarm` is called. Covers the window
/// between persisting photos and committing the draft: if assembly bails or
/// the request is cancelled, the stored blobs do not leak.
pub struct MediaCleanup {
    store: Arc<dyn MediaStore>,
    keys: Vec<String>,
    armed: bool,
}

impl MediaCleanup {
    pub fn new(store: Arc<dyn MediaStore>) -> Self {
        Self {
            store,
            keys: Vec::new(),
            armed: true,
        }
    }

    pub fn track(&mut self, key: String) {
        self.keys.push(key);
    }

    pub fn disarm(mut self) {
        self.armed = false;
        self.keys.clear();
    }
}

impl Drop for MediaCleanup {
    fn drop(&mut self) {
        if !self.armed || self.keys.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let keys = std::mem::take(&mut self.keys);
        tokio::spawn(async move {
            for key in keys {
                debug!(target = "magpie.store", media_key = %key, "removing orphaned media");
                let _ = store.remove(&key).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::testutil;

    #[tokio::test]
    async fn memory_store_round_trips_drafts() {
        let store = MemoryDraftStore::default();
        let draft = crate::pipeline::testutil::empty_draft();
        let id = draft.id;
        store.put(draft).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().id, id);
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn cleanup_guard_removes_media_unless_disarmed() {
        let media: Arc<MemoryMediaStore> = Arc::new(MemoryMediaStore::default());
        let photo = testutil::flat(300, 300, (120, 40, 200));
        let draft_id = Uuid::new_v4();

        let store: Arc<dyn MediaStore> = media.clone();
        let mut guard = MediaCleanup::new(store.clone());
        let key = store.persist(draft_id, &photo).await.unwrap();
        guard.track(key);
        drop(guard);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(media.len().await, 0);

        let mut guard = MediaCleanup::new(store.clone());
        let key = store.persist(draft_id, &photo).await.unwrap();
        guard.track(key);
        guard.disarm();
        assert_eq!(media.len().await, 1);
    }
}
