use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::models::Result;
use crate::store::{Collection, DocumentStore, InMemoryStore, WriteBatch};

/// Typed handle on the document store, passed explicitly to every component.
#[derive(Clone)]
pub struct StorageContext {
    store: Arc<dyn DocumentStore>,
}

impl StorageContext {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn read<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>> {
        match self.store.get(collection, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, collection: Collection, id: &str) -> Result<bool> {
        Ok(self.store.get(collection, id).await?.is_some())
    }

    pub async fn read_all<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
        self.store
            .list(collection)
            .await?
            .into_iter()
            .map(|(_, doc)| -> Result<T> { Ok(serde_json::from_value(doc)?) })
            .collect()
    }

    pub async fn write<T: Serialize>(
        &self,
        collection: Collection,
        id: &str,
        value: &T,
    ) -> Result<()> {
        self.store.set(collection, id, serde_json::to_value(value)?).await?;
        Ok(())
    }

    pub async fn create<T: Serialize>(
        &self,
        collection: Collection,
        id: &str,
        value: &T,
    ) -> Result<()> {
        self.store.create(collection, id, serde_json::to_value(value)?).await?;
        Ok(())
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        Ok(self.store.delete(collection, id).await?)
    }

    pub async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.store.commit(batch).await?;
        Ok(())
    }

    pub async fn now(&self) -> Result<DateTime<Utc>> {
        Ok(self.store.server_time().await?)
    }
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext").finish_non_exhaustive()
    }
}
