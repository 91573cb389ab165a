use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::debug;

use crate::models::StoreError;
use crate::store::{
    apply_batch, Collection, DocKey, DocumentStore, MonotonicClock, StoreResult, WriteBatch,
};

/// Process-local document store. Batches commit under a single write lock.
#[derive(Debug)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<DocKey, Value>>,
    clock: MonotonicClock,
    failing_commits: AtomicU32,
    commit_count: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            clock: MonotonicClock::new(),
            failing_commits: AtomicU32::new(0),
            commit_count: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` batch commits fail with a backend error, without
    /// applying anything.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successfully applied batches.
    pub fn commit_count(&self) -> usize {
        self.commit_count.load(Ordering::SeqCst)
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("document map lock poisoned".to_string())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        Ok(docs.get(&(collection, id.to_string())).cloned())
    }

    async fn list(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>> {
        let docs = self.docs.read().map_err(|_| Self::poisoned())?;
        let mut found: Vec<(String, Value)> = docs
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|((_, id), doc)| (id.clone(), doc.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    async fn set(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()> {
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        docs.insert((collection, id.to_string()), doc);
        Ok(())
    }

    async fn create(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()> {
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        let key = (collection, id.to_string());
        if docs.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                collection: collection.as_str().to_string(),
                id: id.to_string(),
            });
        }
        docs.insert(key, doc);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;
        Ok(docs.remove(&(collection, id.to_string())).is_some())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }

        let mut docs = self.docs.write().map_err(|_| Self::poisoned())?;

        let mut staged: HashMap<DocKey, Option<Value>> = batch
            .keys()
            .into_iter()
            .map(|key| {
                let current = docs.get(&key).cloned();
                (key, current)
            })
            .collect();

        apply_batch(&batch, &mut staged)?;

        for (key, doc) in staged {
            match doc {
                Some(doc) => {
                    docs.insert(key, doc);
                }
                None => {
                    docs.remove(&key);
                }
            }
        }

        self.commit_count.fetch_add(1, Ordering::SeqCst);
        debug!("Committed batch of {} operations", batch.len());
        Ok(())
    }

    async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
        self.clock.now()
    }
}
