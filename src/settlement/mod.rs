pub mod engine;
pub mod processor;
pub mod quarter;
pub mod resilience;
pub mod scheduler;
pub mod staging;

pub use engine::RewardsEngine;
pub use processor::SettlementProcessor;
pub use quarter::QuarterProgressTracker;
pub use resilience::{retry_with_backoff, RetryConfig};
pub use scheduler::{SettlementScheduler, TickReport};
pub use staging::{ApplyOutcome, ConfigStaging, StagingState};
