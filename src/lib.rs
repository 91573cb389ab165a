pub mod models;
pub mod config;
pub mod cycle;
pub mod scoring;
pub mod store;
pub mod settlement;

pub use models::{
    CycleKind, CycleResult, CycleWindow, Participant, RankedEntry, RewardConfiguration, RewardTier,
    RewardsError, Result,
};
pub use config::Settings;
pub use settlement::{RewardsEngine, SettlementScheduler};
