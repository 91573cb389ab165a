use crate::{
    cycle::CycleCalculator,
    models::{
        CycleResult, Participant, QuarterGoal, QuarterLabel, QuarterProgress, RankedEntry, Result,
        RewardConfiguration, RewardsError, StoreError,
    },
    scoring::RankingEngine,
    settlement::processor::SettlementProcessor,
    store::{Collection, FieldPath, StorageContext, WriteBatch},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Community goals, one per calendar quarter.
///
/// A quarter collects contributions while its window is open and is settled
/// once after the window ends. From then on its `final_ranking` is the only
/// leaderboard served for it.
pub struct QuarterProgressTracker {
    storage: StorageContext,
    calculator: CycleCalculator,
    processor: Arc<SettlementProcessor>,
}

impl QuarterProgressTracker {
    pub fn new(
        storage: StorageContext,
        calculator: CycleCalculator,
        processor: Arc<SettlementProcessor>,
    ) -> Self {
        Self { storage, calculator, processor }
    }

    pub async fn create_quarter(
        &self,
        label: QuarterLabel,
        title: impl Into<String>,
        description: impl Into<String>,
        target_units: u64,
        reward_config: RewardConfiguration,
    ) -> Result<QuarterGoal> {
        reward_config.validate()?;

        let quarter = QuarterGoal {
            id: label,
            title: title.into(),
            description: description.into(),
            target_units,
            current_units: 0,
            contributors_by_participant: BTreeMap::new(),
            reward_config,
            window: self.calculator.quarter_window(&label)?,
            processed: false,
            final_ranking: Vec::new(),
        };

        match self
            .storage
            .create(Collection::CommunityQuarters, &label.to_string(), &quarter)
            .await
        {
            Ok(()) => {
                info!("Created community quarter {} with target {}", label, target_units);
                Ok(quarter)
            }
            Err(RewardsError::StorageError(StoreError::AlreadyExists { .. })) => {
                Err(RewardsError::QuarterExists(label.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn quarter(&self, label: &QuarterLabel) -> Result<QuarterGoal> {
        self.storage
            .read(Collection::CommunityQuarters, &label.to_string())
            .await?
            .ok_or_else(|| RewardsError::not_found("quarter", label.to_string()))
    }

    pub async fn quarters(&self) -> Result<Vec<QuarterGoal>> {
        self.storage.read_all(Collection::CommunityQuarters).await
    }

    pub async fn current_quarter(&self, now: DateTime<Utc>) -> Result<Option<QuarterGoal>> {
        let label = self.calculator.quarter_label_at(now);
        self.storage
            .read(Collection::CommunityQuarters, &label.to_string())
            .await
    }

    /// Quarter whose board is shown at `now`: the one open at `now` if it
    /// exists, otherwise the most recently ended quarter.
    pub async fn displayed_quarter(&self, now: DateTime<Utc>) -> Result<QuarterLabel> {
        let current = self.calculator.quarter_label_at(now);
        let quarters = self.quarters().await?;

        if quarters.iter().any(|q| q.id == current) {
            return Ok(current);
        }

        quarters
            .into_iter()
            .filter(|q| q.window.has_ended(now))
            .map(|q| q.id)
            .max()
            .ok_or_else(|| RewardsError::not_found("quarter", current.to_string()))
    }

    /// Queued quarters that have not started yet, soonest first.
    pub async fn upcoming_quarters(&self, now: DateTime<Utc>) -> Result<Vec<QuarterGoal>> {
        let mut upcoming: Vec<QuarterGoal> = self
            .quarters()
            .await?
            .into_iter()
            .filter(|q| q.window.start > now)
            .collect();
        upcoming.sort_by_key(|q| q.id);
        Ok(upcoming)
    }

    /// Record `units` contributed by a participant to the quarter open at `now`.
    pub async fn contribute(
        &self,
        participant_id: &str,
        units: u64,
        now: DateTime<Utc>,
    ) -> Result<QuarterProgress> {
        let label = self.calculator.quarter_label_at(now);
        let quarter_id = label.to_string();

        let quarter = self
            .current_quarter(now)
            .await?
            .ok_or_else(|| RewardsError::not_found("quarter", quarter_id.clone()))?;
        if quarter.processed {
            return Err(RewardsError::QuarterClosed(quarter_id));
        }

        if self
            .storage
            .read::<Participant>(Collection::Users, participant_id)
            .await?
            .is_none()
        {
            return Err(RewardsError::not_found("participant", participant_id));
        }

        let delta = i64::try_from(units).map_err(|_| {
            let message = format!("Contribution of {} units is too large", units);
            RewardsError::ConfigurationError(message)
        })?;

        let mut batch = WriteBatch::new();
        batch
            .precondition(
                Collection::CommunityQuarters,
                quarter_id.as_str(),
                FieldPath::field("processed"),
                serde_json::Value::Bool(false),
            )
            .increment(
                Collection::CommunityQuarters,
                quarter_id.as_str(),
                FieldPath::field("current_units"),
                delta,
            )
            .increment(
                Collection::CommunityQuarters,
                quarter_id.as_str(),
                FieldPath::new(&["contributors_by_participant", participant_id]),
                delta,
            );

        match self.storage.commit(batch).await {
            Ok(()) => {}
            Err(RewardsError::StorageError(StoreError::Conflict { .. })) => {
                return Err(RewardsError::QuarterClosed(quarter_id));
            }
            Err(e) => return Err(e),
        }

        self.progress(&label).await
    }

    pub async fn progress(&self, label: &QuarterLabel) -> Result<QuarterProgress> {
        Ok(self.quarter(label).await?.progress())
    }

    /// Settle every unprocessed quarter whose window has ended.
    pub async fn settle_ended_quarters(&self, now: DateTime<Utc>) -> Result<Vec<CycleResult>> {
        let mut settled = Vec::new();

        for quarter in self.quarters().await? {
            if quarter.processed || !quarter.window.has_ended(now) {
                continue;
            }

            match self.processor.settle_quarter(&quarter.window).await {
                Ok(result) => settled.push(result),
                Err(e) if e.is_already_settled() => {}
                Err(e) => {
                    error!("Settlement of quarter {} failed: {}", quarter.id, e);
                    return Err(e);
                }
            }
        }

        Ok(settled)
    }

    /// Frozen ranking for a processed quarter, live ranking otherwise.
    pub async fn leaderboard(
        &self,
        label: &QuarterLabel,
        limit: usize,
    ) -> Result<Vec<RankedEntry>> {
        let quarter = self.quarter(label).await?;
        Ok(RankingEngine::top(Self::ranking_of(&quarter), limit))
    }

    pub async fn user_rank(
        &self,
        label: &QuarterLabel,
        participant_id: &str,
    ) -> Result<Option<RankedEntry>> {
        let quarter = self.quarter(label).await?;
        Ok(RankingEngine::find(&Self::ranking_of(&quarter), participant_id))
    }

    fn ranking_of(quarter: &QuarterGoal) -> Vec<RankedEntry> {
        if quarter.processed {
            quarter.final_ranking.clone()
        } else {
            RankingEngine::rank(&quarter.contributors_by_participant)
        }
    }
}
