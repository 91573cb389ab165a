use crate::{
    config::Settings,
    cycle::CycleCalculator,
    models::{
        CycleKind, CycleResult, CycleWindow, Participant, Payout, RankedEntry, Result,
        RewardConfiguration, RewardTier, RewardsError, StoreError,
    },
    scoring::RankingEngine,
    settlement::{
        processor::SettlementProcessor,
        quarter::QuarterProgressTracker,
        staging::{ApplyOutcome, ConfigStaging},
    },
    store::{Collection, FieldPath, StorageContext, WriteBatch},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Entry point to the ranking and settlement core. Every component shares
/// one storage context and one cycle calculator.
pub struct RewardsEngine {
    storage: StorageContext,
    calculator: CycleCalculator,
    processor: Arc<SettlementProcessor>,
    staging: ConfigStaging,
    quarters: QuarterProgressTracker,
}

impl RewardsEngine {
    pub async fn new(
        storage: StorageContext,
        calculator: CycleCalculator,
        default_config: RewardConfiguration,
    ) -> Result<Self> {
        let processor = Arc::new(SettlementProcessor::new(storage.clone(), calculator));
        let staging = ConfigStaging::new(storage.clone(), calculator, processor.clone());
        let quarters = QuarterProgressTracker::new(storage.clone(), calculator, processor.clone());

        staging.initialize(default_config).await?;

        Ok(Self {
            storage,
            calculator,
            processor,
            staging,
            quarters,
        })
    }

    pub async fn from_settings(storage: StorageContext, settings: &Settings) -> Result<Self> {
        let calculator = CycleCalculator::from_settings(settings)?;
        Self::new(storage, calculator, settings.default_reward_config()).await
    }

    pub fn calculator(&self) -> &CycleCalculator {
        &self.calculator
    }

    pub fn processor(&self) -> &SettlementProcessor {
        &self.processor
    }

    pub fn staging(&self) -> &ConfigStaging {
        &self.staging
    }

    pub fn quarters(&self) -> &QuarterProgressTracker {
        &self.quarters
    }

    /// Register a participant. Registering an existing id returns the stored
    /// participant unchanged.
    pub async fn register_participant(&self, id: &str, display_name: &str) -> Result<Participant> {
        let participant = Participant::new(id, display_name, self.storage.now().await?);

        match self.storage.create(Collection::Users, id, &participant).await {
            Ok(()) => {
                info!("Registered participant {}", id);
                Ok(participant)
            }
            Err(RewardsError::StorageError(StoreError::AlreadyExists { .. })) => {
                self.participant(id).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn participant(&self, id: &str) -> Result<Participant> {
        self.storage
            .read(Collection::Users, id)
            .await?
            .ok_or_else(|| RewardsError::not_found("participant", id))
    }

    /// Point accrual. Applied as an atomic increment so it can interleave
    /// with settlement.
    pub async fn award_points(&self, id: &str, points: u64) -> Result<Participant> {
        self.participant(id).await?;

        let delta = i64::try_from(points).map_err(|_| {
            RewardsError::ConfigurationError(format!("Award of {} points is too large", points))
        })?;

        let mut batch = WriteBatch::new();
        batch.increment(Collection::Users, id, FieldPath::field("score"), delta);
        self.storage.commit(batch).await?;

        self.participant(id).await
    }

    pub async fn apply_pending_config_if_needed(&self, now: DateTime<Utc>) -> Result<ApplyOutcome> {
        self.staging.apply_pending_if_needed(now).await
    }

    pub async fn settle(&self, kind: CycleKind, window: &CycleWindow) -> Result<CycleResult> {
        self.processor.settle(kind, window).await
    }

    /// Leaderboard of `kind` as seen at `now`.
    ///
    /// The weekly board is always live. The quarterly board is the open
    /// quarter's, or after it ends the last ended quarter's, frozen once that
    /// quarter has been processed.
    pub async fn get_leaderboard(
        &self,
        kind: CycleKind,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedEntry>> {
        match kind {
            CycleKind::Weekly => Ok(RankingEngine::top(self.live_weekly_ranking().await?, limit)),
            CycleKind::Quarterly => {
                let label = self.quarters.displayed_quarter(now).await?;
                self.quarters.leaderboard(&label, limit).await
            }
        }
    }

    pub async fn get_user_rank(
        &self,
        participant_id: &str,
        kind: CycleKind,
        now: DateTime<Utc>,
    ) -> Result<Option<RankedEntry>> {
        match kind {
            CycleKind::Weekly => {
                let ranking = self.live_weekly_ranking().await?;
                Ok(RankingEngine::find(&ranking, participant_id))
            }
            CycleKind::Quarterly => {
                let label = self.quarters.displayed_quarter(now).await?;
                self.quarters.user_rank(&label, participant_id).await
            }
        }
    }

    pub async fn save_or_update_pending_config(
        &self,
        tiers: BTreeMap<RewardTier, Payout>,
    ) -> Result<RewardConfiguration> {
        self.staging.save_or_update_pending(tiers).await
    }

    pub async fn delete_pending_config(&self) -> Result<bool> {
        self.staging.delete_pending().await
    }

    /// Snapshot of the weekly cycle before the one containing `now`.
    pub async fn last_cycle_result(&self, now: DateTime<Utc>) -> Result<CycleResult> {
        let current = self.calculator.current_cycle(CycleKind::Weekly, now)?;
        let previous = self.calculator.previous_cycle(&current)?;
        self.processor.cycle_result(&previous.id).await
    }

    pub async fn settle_ended_quarters(&self, now: DateTime<Utc>) -> Result<Vec<CycleResult>> {
        self.quarters.settle_ended_quarters(now).await
    }

    async fn live_weekly_ranking(&self) -> Result<Vec<RankedEntry>> {
        let participants: Vec<Participant> = self.storage.read_all(Collection::Users).await?;
        let scores: BTreeMap<String, u64> =
            participants.into_iter().map(|p| (p.id, p.score)).collect();
        Ok(RankingEngine::rank(&scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Quarter, QuarterLabel};
    use chrono::TimeZone;

    async fn engine() -> RewardsEngine {
        RewardsEngine::new(
            StorageContext::in_memory(),
            CycleCalculator::default(),
            RewardConfiguration::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let engine = engine().await;
        engine.register_participant("ana", "Ana").await.unwrap();
        engine.award_points("ana", 15).await.unwrap();

        let again = engine.register_participant("ana", "Someone else").await.unwrap();
        assert_eq!(again.display_name, "Ana");
        assert_eq!(again.score, 15);
    }

    #[tokio::test]
    async fn test_award_points_requires_participant() {
        let engine = engine().await;
        assert!(matches!(
            engine.award_points("ghost", 1).await,
            Err(RewardsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_weekly_leaderboard_and_rank() {
        let engine = engine().await;
        let now = Utc.with_ymd_and_hms(2026, 10, 21, 12, 0, 0).unwrap();
        for (id, points) in [("ana", 5), ("ben", 30), ("cy", 30)] {
            engine.register_participant(id, id).await.unwrap();
            engine.award_points(id, points).await.unwrap();
        }

        let board = engine.get_leaderboard(CycleKind::Weekly, 2, now).await.unwrap();
        let ids: Vec<&str> = board.iter().map(|e| e.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["ben", "cy"]);

        let ana = engine.get_user_rank("ana", CycleKind::Weekly, now).await.unwrap().unwrap();
        assert_eq!(ana.rank, 3);
        assert!(engine.get_user_rank("zed", CycleKind::Weekly, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quarterly_board_after_quarter_end_is_frozen() {
        let engine = engine().await;
        for id in ["ana", "ben"] {
            engine.register_participant(id, id).await.unwrap();
        }

        let q3 = QuarterLabel::new(2026, Quarter::Q3);
        engine
            .quarters()
            .create_quarter(q3, "Read books", "", 50, RewardConfiguration::default())
            .await
            .unwrap();
        let during = Utc.with_ymd_and_hms(2026, 8, 3, 12, 0, 0).unwrap();
        engine.quarters().contribute("ben", 9, during).await.unwrap();
        engine.quarters().contribute("ana", 4, during).await.unwrap();

        let after = Utc.with_ymd_and_hms(2026, 10, 2, 12, 0, 0).unwrap();
        engine.settle_ended_quarters(after).await.unwrap();

        let board = engine.get_leaderboard(CycleKind::Quarterly, 10, after).await.unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].participant_id, "ben");

        let mut edit = WriteBatch::new();
        edit.set_field(
            Collection::CommunityQuarters,
            q3.to_string(),
            FieldPath::new(&["contributors_by_participant", "ana"]),
            serde_json::json!(500),
        );
        engine.storage.commit(edit).await.unwrap();

        assert_eq!(engine.get_leaderboard(CycleKind::Quarterly, 10, after).await.unwrap(), board);
        let ana = engine
            .get_user_rank("ana", CycleKind::Quarterly, after)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((ana.rank, ana.score), (2, 4));
    }

    #[tokio::test]
    async fn test_quarterly_board_without_quarters_is_not_found() {
        let engine = engine().await;
        let now = Utc.with_ymd_and_hms(2026, 10, 2, 12, 0, 0).unwrap();
        assert!(matches!(
            engine.get_leaderboard(CycleKind::Quarterly, 10, now).await,
            Err(RewardsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_last_cycle_result_after_boundary() {
        let engine = engine().await;
        engine.register_participant("ana", "Ana").await.unwrap();
        engine.award_points("ana", 10).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 10, 19, 0, 5, 0).unwrap();
        assert!(matches!(
            engine.last_cycle_result(now).await,
            Err(RewardsError::NotFound { .. })
        ));

        engine.apply_pending_config_if_needed(now).await.unwrap();
        let result = engine.last_cycle_result(now).await.unwrap();
        assert_eq!(result.cycle_id.as_str(), "weekly_2026-10-17");
        assert_eq!(result.total_participants, 1);
    }
}
