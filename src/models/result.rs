use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::models::{CycleId, CycleWindow, Payout, RewardTier};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankedEntry {
    pub participant_id: String,
    pub score: u64,
    pub rank: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantPayout {
    pub participant_id: String,
    pub rank: u32,
    pub tier: RewardTier,
    pub payout: Payout,
}

/// Immutable settlement snapshot of one ended cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleResult {
    pub cycle_id: CycleId,
    pub window: CycleWindow,
    pub total_participants: usize,
    pub total_currency_distributed: u64,
    pub total_score_distributed: u64,
    pub per_participant: Vec<ParticipantPayout>,
    pub settled_at: DateTime<Utc>,
}

impl CycleResult {
    pub fn payout_of(&self, participant_id: &str) -> Option<&ParticipantPayout> {
        self.per_participant
            .iter()
            .find(|p| p.participant_id == participant_id)
    }
}

/// Processing marker of a weekly cycle, written after its result commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleRecord {
    pub cycle_id: CycleId,
    pub window: CycleWindow,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}
