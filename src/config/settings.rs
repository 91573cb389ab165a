use serde::{Deserialize, Serialize};
use config::{Config, ConfigError, File};
use chrono::{FixedOffset, Weekday};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::models::{Payout, RewardConfiguration, RewardTier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub app: AppSettings,
    pub cycle: CycleSettings,
    pub rewards: RewardSettings,
    pub database: DatabaseSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub name: String,
    pub version: String,
    pub log_level: String,
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSettings {
    /// Day the weekly cycle starts on, e.g. "sunday".
    pub week_start_day: String,
    /// Offset of the community's local time from UTC.
    pub utc_offset_minutes: i32,
}

/// Initial active payout table, used until a staged configuration is promoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSettings {
    pub top1: Payout,
    pub top2: Payout,
    pub top3: Payout,
    pub top4_to_10: Payout,
    pub top11_plus: Payout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub interval_seconds: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = RewardConfiguration::default();
        let tier = |t: RewardTier| defaults.tiers.get(&t).copied().unwrap_or_default();

        Self {
            app: AppSettings {
                name: "Rewards Engine".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                log_level: "info".to_string(),
                environment: Environment::Development,
            },
            cycle: CycleSettings {
                week_start_day: "sunday".to_string(),
                utc_offset_minutes: 0,
            },
            rewards: RewardSettings {
                top1: tier(RewardTier::Top1),
                top2: tier(RewardTier::Top2),
                top3: tier(RewardTier::Top3),
                top4_to_10: tier(RewardTier::Top4to10),
                top11_plus: tier(RewardTier::Top11Plus),
            },
            database: DatabaseSettings {
                url: "sqlite://rewards_engine.db".to_string(),
                max_connections: 5,
            },
            scheduler: SchedulerSettings {
                interval_seconds: 300, // 5 minutes
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 10_000,
            },
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("REWARDS_ENGINE").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(path.as_ref()))
            .build()?;

        s.try_deserialize()
    }

    pub fn week_start(&self) -> Result<Weekday, String> {
        self.cycle
            .week_start_day
            .parse::<Weekday>()
            .map_err(|_| format!("Unknown week start day: {}", self.cycle.week_start_day))
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, String> {
        self.cycle
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                format!("UTC offset out of range: {} minutes", self.cycle.utc_offset_minutes)
            })
    }

    pub fn default_reward_config(&self) -> RewardConfiguration {
        let r = &self.rewards;
        RewardConfiguration::new(BTreeMap::from([
            (RewardTier::Top1, r.top1),
            (RewardTier::Top2, r.top2),
            (RewardTier::Top3, r.top3),
            (RewardTier::Top4to10, r.top4_to_10),
            (RewardTier::Top11Plus, r.top11_plus),
        ]))
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_seconds)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.week_start()?;
        self.utc_offset()?;

        if self.scheduler.interval_seconds == 0 {
            return Err("Scheduler interval must be greater than zero".to_string());
        }

        if self.scheduler.max_attempts == 0 {
            return Err("Scheduler must make at least one attempt".to_string());
        }

        if self.database.max_connections == 0 {
            return Err("Database pool needs at least one connection".to_string());
        }

        Ok(())
    }
}
