pub mod ranking;
pub mod tiers;

pub use ranking::RankingEngine;
pub use tiers::RewardTierResolver;
