use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{Result, RewardsError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RewardTier {
    Top1,
    Top2,
    Top3,
    Top4to10,
    Top11Plus,
}

impl RewardTier {
    pub const ALL: [RewardTier; 5] = [
        RewardTier::Top1,
        RewardTier::Top2,
        RewardTier::Top3,
        RewardTier::Top4to10,
        RewardTier::Top11Plus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RewardTier::Top1 => "top1",
            RewardTier::Top2 => "top2",
            RewardTier::Top3 => "top3",
            RewardTier::Top4to10 => "top4to10",
            RewardTier::Top11Plus => "top11plus",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "top1" => Some(RewardTier::Top1),
            "top2" => Some(RewardTier::Top2),
            "top3" => Some(RewardTier::Top3),
            "top4to10" | "top4-10" => Some(RewardTier::Top4to10),
            "top11plus" | "top11+" => Some(RewardTier::Top11Plus),
            _ => None,
        }
    }
}

impl fmt::Display for RewardTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Payout {
    pub bonus_currency: u64,
    pub bonus_score: u64,
}

impl Payout {
    pub fn new(bonus_currency: u64, bonus_score: u64) -> Self {
        Self { bonus_currency, bonus_score }
    }
}

/// Tier payout table. A stored configuration always covers every tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardConfiguration {
    pub tiers: BTreeMap<RewardTier, Payout>,
    #[serde(default)]
    pub staged_at: Option<DateTime<Utc>>,
}

impl Default for RewardConfiguration {
    fn default() -> Self {
        let tiers = BTreeMap::from([
            (RewardTier::Top1, Payout::new(500, 50)),
            (RewardTier::Top2, Payout::new(300, 30)),
            (RewardTier::Top3, Payout::new(200, 20)),
            (RewardTier::Top4to10, Payout::new(100, 10)),
            (RewardTier::Top11Plus, Payout::new(10, 0)),
        ]);
        Self { tiers, staged_at: None }
    }
}

impl RewardConfiguration {
    pub fn new(tiers: BTreeMap<RewardTier, Payout>) -> Self {
        Self { tiers, staged_at: None }
    }

    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = RewardTier::ALL
            .iter()
            .filter(|tier| !self.tiers.contains_key(tier))
            .map(|tier| tier.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(RewardsError::ConfigurationError(format!(
                "Reward configuration is missing tiers: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Overlay `updates` on top of this table.
    pub fn merged_with(&self, updates: &BTreeMap<RewardTier, Payout>) -> Self {
        let mut tiers = self.tiers.clone();
        tiers.extend(updates.iter().map(|(tier, payout)| (*tier, *payout)));
        Self { tiers, staged_at: self.staged_at }
    }
}
