use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{CycleWindow, QuarterLabel, RankedEntry, RewardConfiguration};

/// Community-wide goal for one calendar quarter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarterGoal {
    pub id: QuarterLabel,
    pub title: String,
    pub description: String,
    pub target_units: u64,
    #[serde(default)]
    pub current_units: u64,
    #[serde(default)]
    pub contributors_by_participant: BTreeMap<String, u64>,
    pub reward_config: RewardConfiguration,
    pub window: CycleWindow,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub final_ranking: Vec<RankedEntry>,
}

impl QuarterGoal {
    pub fn progress(&self) -> QuarterProgress {
        let percent = if self.target_units == 0 {
            100.0
        } else {
            (self.current_units as f64 / self.target_units as f64 * 100.0).min(100.0)
        };

        QuarterProgress {
            quarter: self.id,
            current_units: self.current_units,
            target_units: self.target_units,
            percent,
            goal_reached: self.current_units >= self.target_units,
            contributors: self.contributors_by_participant.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarterProgress {
    pub quarter: QuarterLabel,
    pub current_units: u64,
    pub target_units: u64,
    pub percent: f64,
    pub goal_reached: bool,
    pub contributors: usize,
}
