use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// A community member on the global leaderboard.
///
/// `score` and `balance` only move through settlement or point accrual.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub score: u64,
    #[serde(default)]
    pub balance: u64,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            score: 0,
            balance: 0,
            created_at,
        }
    }
}
