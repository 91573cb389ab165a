use crate::{
    models::{CycleId, Result},
    settlement::{
        engine::RewardsEngine,
        resilience::{retry_with_backoff, RetryConfig},
        staging::ApplyOutcome,
    },
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// What a single scheduler pass did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub weekly: ApplyOutcome,
    pub quarters_settled: Vec<CycleId>,
}

/// Periodically observes cycle boundaries so settlement happens without an
/// external trigger. Every pass is safe to repeat.
pub struct SettlementScheduler {
    engine: Arc<RewardsEngine>,
    period: Duration,
    retry: RetryConfig,
}

impl SettlementScheduler {
    pub fn new(engine: Arc<RewardsEngine>, period: Duration, retry: RetryConfig) -> Self {
        Self { engine, period, retry }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let weekly = retry_with_backoff(&self.retry, "apply_pending_config", || {
            self.engine.apply_pending_config_if_needed(now)
        })
        .await?;

        if let Some(result) = &weekly.distribution {
            info!(
                "Settled {} for {} participants, {} currency distributed",
                result.cycle_id, result.total_participants, result.total_currency_distributed
            );
        }

        let quarters = retry_with_backoff(&self.retry, "settle_ended_quarters", || {
            self.engine.settle_ended_quarters(now)
        })
        .await?;

        Ok(TickReport {
            weekly,
            quarters_settled: quarters.into_iter().map(|r| r.cycle_id).collect(),
        })
    }

    /// Tick until `shutdown` resolves. Failed passes are logged and retried
    /// on the next tick.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Settlement scheduler started, period {:?}", self.period);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Settlement scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!("Scheduler pass failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cycle::CycleCalculator,
        models::{Quarter, QuarterLabel, RewardConfiguration},
        store::StorageContext,
    };
    use chrono::TimeZone;

    async fn scheduler() -> SettlementScheduler {
        let engine = RewardsEngine::new(
            StorageContext::in_memory(),
            CycleCalculator::default(),
            RewardConfiguration::default(),
        )
        .await
        .unwrap();
        let retry = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        SettlementScheduler::new(Arc::new(engine), Duration::from_millis(5), retry)
    }

    #[tokio::test]
    async fn test_pass_settles_week_and_ended_quarter() {
        let scheduler = scheduler().await;
        let engine = scheduler.engine.clone();
        engine.register_participant("ana", "Ana").await.unwrap();
        engine.award_points("ana", 12).await.unwrap();

        let q3 = QuarterLabel::new(2026, Quarter::Q3);
        engine
            .quarters()
            .create_quarter(q3, "Read books", "", 50, RewardConfiguration::default())
            .await
            .unwrap();
        let during = Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap();
        engine.quarters().contribute("ana", 7, during).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let report = scheduler.run_once(now).await.unwrap();
        assert!(report.weekly.distribution.is_some());
        assert_eq!(report.quarters_settled.len(), 1);
        assert_eq!(report.quarters_settled[0].as_str(), "quarterly_2026-Q3");

        let again = scheduler.run_once(now).await.unwrap();
        assert!(again.weekly.distribution.is_none());
        assert!(again.quarters_settled.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let scheduler = scheduler().await;
        let stop = tokio::time::sleep(Duration::from_millis(30));

        tokio::time::timeout(Duration::from_secs(2), scheduler.run(stop))
            .await
            .expect("scheduler should stop when shutdown resolves");

        let state = scheduler.engine.staging().state().await.unwrap();
        assert!(state.last_applied_cycle.is_some());
    }
}
