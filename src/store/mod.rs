//! Transactional document store abstraction.
//!
//! Documents are JSON values addressed by `(collection, id)`. A
//! [`WriteBatch`] is applied atomically: either every operation lands or
//! none does. `Create` and `Precondition` operations make a batch
//! conditional, which is how settlement stays idempotent without locks.

pub mod context;
pub mod memory;
pub mod sqlite;

pub use context::StorageContext;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Users,
    CycleResults,
    Cycles,
    RewardConfig,
    CommunityQuarters,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::CycleResults => "cycle_results",
            Collection::Cycles => "cycles",
            Collection::RewardConfig => "reward_config",
            Collection::CommunityQuarters => "community_quarters",
        }
    }
}

pub type DocKey = (Collection, String);

/// Path to a (possibly nested) field inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<S: AsRef<str>>(segments: &[S]) -> Self {
        Self(segments.iter().map(|s| s.as_ref().to_string()).collect())
    }

    pub fn field(name: &str) -> Self {
        Self(vec![name.to_string()])
    }

    fn segments(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Insert a document that must not exist yet.
    Create { collection: Collection, id: String, doc: Value },
    /// Insert or overwrite a whole document.
    Set { collection: Collection, id: String, doc: Value },
    /// Overwrite one field, creating the document if needed.
    SetField { collection: Collection, id: String, path: FieldPath, value: Value },
    /// Add `delta` to a numeric field; a missing field counts as 0.
    Increment { collection: Collection, id: String, path: FieldPath, delta: i64 },
    Delete { collection: Collection, id: String },
    /// Abort the batch unless the field currently equals `expected`.
    Precondition { collection: Collection, id: String, path: FieldPath, expected: Value },
}

impl BatchOp {
    pub fn key(&self) -> DocKey {
        let (collection, id) = match self {
            BatchOp::Create { collection, id, .. }
            | BatchOp::Set { collection, id, .. }
            | BatchOp::SetField { collection, id, .. }
            | BatchOp::Increment { collection, id, .. }
            | BatchOp::Delete { collection, id }
            | BatchOp::Precondition { collection, id, .. } => (collection, id),
        };
        (*collection, id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        collection: Collection,
        id: impl Into<String>,
        doc: Value,
    ) -> &mut Self {
        self.ops.push(BatchOp::Create { collection, id: id.into(), doc });
        self
    }

    pub fn set(&mut self, collection: Collection, id: impl Into<String>, doc: Value) -> &mut Self {
        self.ops.push(BatchOp::Set { collection, id: id.into(), doc });
        self
    }

    pub fn set_field(
        &mut self,
        collection: Collection,
        id: impl Into<String>,
        path: FieldPath,
        value: Value,
    ) -> &mut Self {
        self.ops.push(BatchOp::SetField { collection, id: id.into(), path, value });
        self
    }

    pub fn increment(
        &mut self,
        collection: Collection,
        id: impl Into<String>,
        path: FieldPath,
        delta: i64,
    ) -> &mut Self {
        self.ops.push(BatchOp::Increment { collection, id: id.into(), path, delta });
        self
    }

    pub fn delete(&mut self, collection: Collection, id: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { collection, id: id.into() });
        self
    }

    pub fn precondition(
        &mut self,
        collection: Collection,
        id: impl Into<String>,
        path: FieldPath,
        expected: Value,
    ) -> &mut Self {
        self.ops.push(BatchOp::Precondition { collection, id: id.into(), path, expected });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Every distinct document the batch touches, in first-touch order.
    pub fn keys(&self) -> Vec<DocKey> {
        let mut keys: Vec<DocKey> = Vec::new();
        for op in &self.ops {
            let key = op.key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>>;

    /// All documents of a collection, ordered by id.
    async fn list(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>>;

    async fn set(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()>;

    /// Fails with [`StoreError::AlreadyExists`] if the id is taken.
    async fn create(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()>;

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool>;

    /// Apply every operation of `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Server-assigned timestamp, strictly increasing across calls.
    async fn server_time(&self) -> StoreResult<DateTime<Utc>>;
}

/// Apply `batch` to a staging copy of the documents it touches.
///
/// `staged` must hold the current value (or `None`) of every key in
/// `batch.keys()`. On error the staging map is left half-applied and must be
/// discarded by the caller.
pub(crate) fn apply_batch(
    batch: &WriteBatch,
    staged: &mut HashMap<DocKey, Option<Value>>,
) -> StoreResult<()> {
    for op in batch.ops() {
        let key = op.key();
        let slot = staged.entry(key.clone()).or_insert(None);

        match op {
            BatchOp::Create { doc, .. } => {
                if slot.is_some() {
                    return Err(StoreError::AlreadyExists {
                        collection: key.0.as_str().to_string(),
                        id: key.1,
                    });
                }
                *slot = Some(doc.clone());
            }
            BatchOp::Set { doc, .. } => {
                *slot = Some(doc.clone());
            }
            BatchOp::SetField { path, value, .. } => {
                let doc = slot.get_or_insert_with(|| Value::Object(Map::new()));
                *field_mut(doc, path, &key)? = value.clone();
            }
            BatchOp::Increment { path, delta, .. } => {
                let doc = slot.get_or_insert_with(|| Value::Object(Map::new()));
                let field = field_mut(doc, path, &key)?;
                let current = match field {
                    Value::Null => 0,
                    Value::Number(n) => n.as_i64().ok_or_else(|| {
                        conflict(&key, format!("field {} is not an integer", path))
                    })?,
                    _ => return Err(conflict(&key, format!("field {} is not numeric", path))),
                };
                let updated = current
                    .checked_add(*delta)
                    .filter(|v| *v >= 0)
                    .ok_or_else(|| {
                        conflict(&key, format!("increment of {} by {} out of range", path, delta))
                    })?;
                *field = Value::from(updated);
            }
            BatchOp::Delete { .. } => {
                *slot = None;
            }
            BatchOp::Precondition { path, expected, .. } => {
                let actual = slot
                    .as_ref()
                    .and_then(|doc| field_ref(doc, path))
                    .cloned()
                    .unwrap_or(Value::Null);
                if &actual != expected {
                    let message = format!("expected {} = {}, found {}", path, expected, actual);
                    return Err(conflict(&key, message));
                }
            }
        }
    }

    Ok(())
}

fn conflict(key: &DocKey, message: String) -> StoreError {
    StoreError::Conflict {
        collection: key.0.as_str().to_string(),
        id: key.1.clone(),
        message,
    }
}

fn field_ref<'a>(doc: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(doc, |value, segment| value.get(segment.as_str()))
}

fn field_mut<'a>(doc: &'a mut Value, path: &FieldPath, key: &DocKey) -> StoreResult<&'a mut Value> {
    let mut current = doc;
    for segment in path.segments() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
            _ => return Err(conflict(key, format!("cannot descend into non-object at {}", path))),
        };
    }
    Ok(current)
}

/// Strictly increasing wall clock shared by the store implementations.
#[derive(Debug)]
pub(crate) struct MonotonicClock {
    last: Mutex<DateTime<Utc>>,
}

impl MonotonicClock {
    pub(crate) fn new() -> Self {
        Self { last: Mutex::new(DateTime::<Utc>::MIN_UTC) }
    }

    pub(crate) fn now(&self) -> StoreResult<DateTime<Utc>> {
        let mut last = self
            .last
            .lock()
            .map_err(|_| StoreError::Backend("clock lock poisoned".to_string()))?;
        let candidate = Utc::now();
        let next = if candidate > *last {
            candidate
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        Ok(next)
    }
}
