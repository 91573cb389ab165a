use thiserror::Error;

/// Failures raised by a [`crate::store::DocumentStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },

    #[error("Precondition failed on {collection}/{id}: {message}")]
    Conflict { collection: String, id: String, message: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum RewardsError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Cycle {cycle_id} has already been settled")]
    AlreadySettled { cycle_id: String },

    #[error("Cycle {cycle_id} has not ended yet")]
    CycleNotEnded { cycle_id: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Storage error: {0}")]
    StorageError(#[from] StoreError),

    #[error("Invalid quarter label: {0}")]
    InvalidQuarterLabel(String),

    #[error("Quarter {0} already exists")]
    QuarterExists(String),

    #[error("Quarter {0} is closed for contributions")]
    QuarterClosed(String),
}

impl RewardsError {
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        RewardsError::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    /// Schedulers treat this as a successful no-op.
    pub fn is_already_settled(&self) -> bool {
        matches!(self, RewardsError::AlreadySettled { .. })
    }

    /// Transient backend failures. Settlement is idempotent, so the whole
    /// operation can be re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RewardsError::StorageError(StoreError::Backend(_))
                | RewardsError::StorageError(StoreError::Database(_))
        )
    }
}

impl From<serde_json::Error> for RewardsError {
    fn from(e: serde_json::Error) -> Self {
        RewardsError::StorageError(StoreError::Serialization(e))
    }
}

pub type Result<T> = std::result::Result<T, RewardsError>;
