use crate::{
    cycle::CycleCalculator,
    models::{
        CycleId, CycleKind, CycleRecord, CycleResult, CycleWindow, ParticipantPayout, Participant,
        QuarterGoal, RankedEntry, Result, RewardConfiguration, RewardsError, StoreError,
    },
    scoring::{RankingEngine, RewardTierResolver},
    settlement::staging::ConfigStaging,
    store::{Collection, FieldPath, StorageContext, WriteBatch},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// How a settled bonus score lands on the participant's score field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoreCredit {
    /// Weekly leaderboard: the score restarts at the tier bonus.
    Set,
    /// Community quarter: the bonus is added to the running total.
    Increment,
}

/// Runs cycle-end settlement: rank, resolve payouts, then write the result
/// snapshot and every participant credit in one conditional batch.
pub struct SettlementProcessor {
    storage: StorageContext,
    calculator: CycleCalculator,
}

impl SettlementProcessor {
    pub fn new(storage: StorageContext, calculator: CycleCalculator) -> Self {
        Self { storage, calculator }
    }

    /// Settle an ended window. Weekly cycles pay out under the currently
    /// active configuration, quarters under their own.
    ///
    /// Windows that are still running by store time are rejected with
    /// [`RewardsError::CycleNotEnded`].
    pub async fn settle(&self, kind: CycleKind, window: &CycleWindow) -> Result<CycleResult> {
        if window.kind != kind {
            return Err(RewardsError::ConfigurationError(format!(
                "Window {} is {}, not {}",
                window.id,
                window.kind.as_str(),
                kind.as_str()
            )));
        }

        let now = self.storage.now().await?;
        if !window.has_ended(now) {
            return Err(RewardsError::CycleNotEnded {
                cycle_id: window.id.to_string(),
            });
        }

        match kind {
            CycleKind::Weekly => {
                let config = ConfigStaging::load_state(&self.storage).await?.active;
                self.settle_weekly(window, &config).await
            }
            CycleKind::Quarterly => self.settle_quarter(window).await,
        }
    }

    pub async fn settle_weekly(
        &self,
        window: &CycleWindow,
        config: &RewardConfiguration,
    ) -> Result<CycleResult> {
        info!("Settling weekly cycle {}", window.id);

        if self.storage.exists(Collection::CycleResults, window.id.as_str()).await? {
            return self.already_settled_weekly(window).await;
        }

        let participants: Vec<Participant> = self.storage.read_all(Collection::Users).await?;
        let scores: BTreeMap<String, u64> = participants
            .into_iter()
            .map(|p| (p.id, p.score))
            .collect();

        let ranking = RankingEngine::rank(&scores);
        let settled_at = self.storage.now().await?;
        let result = build_result(window, &ranking, config, settled_at)?;

        let mut batch = WriteBatch::new();
        batch.create(Collection::CycleResults, window.id.as_str(), serde_json::to_value(&result)?);
        credit_participants(&mut batch, &result, ScoreCredit::Set)?;

        if let Err(e) = self.storage.commit(batch).await {
            if self.lost_race(&e, &window.id).await? {
                return self.already_settled_weekly(window).await;
            }
            return Err(e);
        }

        info!(
            "Committed weekly cycle {}: {} participants, {} currency, {} score",
            window.id,
            result.total_participants,
            result.total_currency_distributed,
            result.total_score_distributed
        );

        self.mark_weekly_processed(window).await?;
        Ok(result)
    }

    pub async fn settle_quarter(&self, window: &CycleWindow) -> Result<CycleResult> {
        let label = self.calculator.quarter_label_of(window);
        let quarter_id = label.to_string();
        info!("Settling community quarter {}", quarter_id);

        let quarter: QuarterGoal = self
            .storage
            .read(Collection::CommunityQuarters, &quarter_id)
            .await?
            .ok_or_else(|| RewardsError::not_found("quarter", quarter_id.clone()))?;

        let snapshot_exists =
            self.storage.exists(Collection::CycleResults, window.id.as_str()).await?;
        if quarter.processed || snapshot_exists {
            return self.already_settled_quarter(&quarter_id, &window.id).await;
        }

        let ranking = RankingEngine::rank(&quarter.contributors_by_participant);
        let settled_at = self.storage.now().await?;
        let result = build_result(window, &ranking, &quarter.reward_config, settled_at)?;

        let mut batch = WriteBatch::new();
        batch
            .precondition(
                Collection::CommunityQuarters,
                quarter_id.as_str(),
                FieldPath::field("processed"),
                serde_json::Value::Bool(false),
            )
            .create(Collection::CycleResults, window.id.as_str(), serde_json::to_value(&result)?)
            .set_field(
                Collection::CommunityQuarters,
                quarter_id.as_str(),
                FieldPath::field("final_ranking"),
                serde_json::to_value(&ranking)?,
            );
        credit_participants(&mut batch, &result, ScoreCredit::Increment)?;

        if let Err(e) = self.storage.commit(batch).await {
            if self.lost_race(&e, &window.id).await? {
                return self.already_settled_quarter(&quarter_id, &window.id).await;
            }
            error!("Settlement batch for quarter {} was rejected: {}", quarter_id, e);
            return Err(e);
        }

        info!(
            "Committed quarter {}: {} contributors, {} currency distributed",
            quarter_id, result.total_participants, result.total_currency_distributed
        );

        self.mark_quarter_processed(&quarter_id).await?;
        Ok(result)
    }

    pub async fn cycle_result(&self, cycle_id: &CycleId) -> Result<CycleResult> {
        self.storage
            .read(Collection::CycleResults, cycle_id.as_str())
            .await?
            .ok_or_else(|| RewardsError::not_found("cycle result", cycle_id.as_str()))
    }

    pub async fn is_processed(&self, window: &CycleWindow) -> Result<bool> {
        match window.kind {
            CycleKind::Weekly => Ok(self
                .storage
                .read::<CycleRecord>(Collection::Cycles, window.id.as_str())
                .await?
                .map(|record| record.processed)
                .unwrap_or(false)),
            CycleKind::Quarterly => {
                let label = self.calculator.quarter_label_of(window).to_string();
                Ok(self
                    .storage
                    .read::<QuarterGoal>(Collection::CommunityQuarters, &label)
                    .await?
                    .map(|quarter| quarter.processed)
                    .unwrap_or(false))
            }
        }
    }

    /// A rejected batch means another attempt got there first only if its
    /// snapshot exists. Conflicts from the credits themselves do not count.
    async fn lost_race(&self, err: &RewardsError, cycle_id: &CycleId) -> Result<bool> {
        match err {
            RewardsError::StorageError(StoreError::AlreadyExists { .. })
            | RewardsError::StorageError(StoreError::Conflict { .. }) => {
                self.storage.exists(Collection::CycleResults, cycle_id.as_str()).await
            }
            _ => Ok(false),
        }
    }

    /// A previous attempt committed its batch; make sure the processed flag
    /// followed, then report the duplicate.
    async fn already_settled_weekly(&self, window: &CycleWindow) -> Result<CycleResult> {
        warn!("Weekly cycle {} was already settled", window.id);
        if !self.is_processed(window).await? {
            self.mark_weekly_processed(window).await?;
        }
        Err(RewardsError::AlreadySettled { cycle_id: window.id.to_string() })
    }

    async fn already_settled_quarter(
        &self,
        quarter_id: &str,
        cycle_id: &CycleId,
    ) -> Result<CycleResult> {
        warn!("Quarter {} was already settled", quarter_id);
        self.mark_quarter_processed(quarter_id).await?;
        Err(RewardsError::AlreadySettled { cycle_id: cycle_id.to_string() })
    }

    async fn mark_weekly_processed(&self, window: &CycleWindow) -> Result<()> {
        let record = CycleRecord {
            cycle_id: window.id.clone(),
            window: window.clone(),
            processed: true,
            processed_at: Some(self.storage.now().await?),
        };
        self.storage.write(Collection::Cycles, window.id.as_str(), &record).await
    }

    async fn mark_quarter_processed(&self, quarter_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.set_field(
            Collection::CommunityQuarters,
            quarter_id,
            FieldPath::field("processed"),
            serde_json::Value::Bool(true),
        );
        self.storage.commit(batch).await
    }
}

fn build_result(
    window: &CycleWindow,
    ranking: &[RankedEntry],
    config: &RewardConfiguration,
    settled_at: DateTime<Utc>,
) -> Result<CycleResult> {
    let per_participant = ranking
        .iter()
        .map(|entry| -> Result<ParticipantPayout> {
            let tier = RewardTierResolver::tier_for(entry.rank);
            let payout = RewardTierResolver::payout_for(tier, config)?;
            Ok(ParticipantPayout {
                participant_id: entry.participant_id.clone(),
                rank: entry.rank,
                tier,
                payout,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let total_currency_distributed = per_participant.iter().map(|p| p.payout.bonus_currency).sum();
    let total_score_distributed = per_participant.iter().map(|p| p.payout.bonus_score).sum();

    Ok(CycleResult {
        cycle_id: window.id.clone(),
        window: window.clone(),
        total_participants: per_participant.len(),
        total_currency_distributed,
        total_score_distributed,
        per_participant,
        settled_at,
    })
}

fn credit_participants(
    batch: &mut WriteBatch,
    result: &CycleResult,
    credit: ScoreCredit,
) -> Result<()> {
    for entry in &result.per_participant {
        let id = entry.participant_id.as_str();
        batch.increment(
            Collection::Users,
            id,
            FieldPath::field("balance"),
            to_delta(entry.payout.bonus_currency)?,
        );
        match credit {
            ScoreCredit::Set => {
                batch.set_field(
                    Collection::Users,
                    id,
                    FieldPath::field("score"),
                    serde_json::Value::from(entry.payout.bonus_score),
                );
            }
            ScoreCredit::Increment => {
                batch.increment(
                    Collection::Users,
                    id,
                    FieldPath::field("score"),
                    to_delta(entry.payout.bonus_score)?,
                );
            }
        }
    }
    Ok(())
}

fn to_delta(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| {
        RewardsError::ConfigurationError(format!("Payout {} exceeds the storable range", amount))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Payout, RewardTier};
    use crate::store::{DocumentStore, InMemoryStore, StoreResult};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mockall::mock;
    use serde_json::Value;
    use std::sync::Arc;

    mock! {
        pub Store {}

        #[async_trait]
        impl DocumentStore for Store {
            async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>>;
            async fn list(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>>;
            async fn set(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()>;
            async fn create(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()>;
            async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool>;
            async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;
            async fn server_time(&self) -> StoreResult<DateTime<Utc>>;
        }
    }

    fn ended_week(calc: &CycleCalculator) -> CycleWindow {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let current = calc.current_cycle(CycleKind::Weekly, now).unwrap();
        calc.previous_cycle(&current).unwrap()
    }

    async fn seed_users(storage: &StorageContext, users: &[(&str, u64)]) {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for (id, score) in users {
            let mut participant = Participant::new(*id, id.to_uppercase(), created);
            participant.score = *score;
            storage.write(Collection::Users, id, &participant).await.unwrap();
        }
    }

    #[test]
    fn test_build_result_totals() {
        let calc = CycleCalculator::default();
        let window = ended_week(&calc);
        let ranking = RankingEngine::rank(&BTreeMap::from([
            ("a".to_string(), 100u64),
            ("b".to_string(), 100),
            ("c".to_string(), 50),
        ]));

        let config = RewardConfiguration::default();
        let result = build_result(&window, &ranking, &config, Utc::now()).unwrap();
        assert_eq!(result.total_participants, 3);
        assert_eq!(result.total_currency_distributed, 500 + 300 + 200);
        assert_eq!(result.total_score_distributed, 50 + 30 + 20);
        assert_eq!(result.payout_of("b").map(|p| p.tier), Some(RewardTier::Top2));
    }

    #[test]
    fn test_build_result_rejects_incomplete_config() {
        let calc = CycleCalculator::default();
        let window = ended_week(&calc);
        let ranking = RankingEngine::rank(&BTreeMap::from([("a".to_string(), 1u64)]));
        let config =
            RewardConfiguration::new(BTreeMap::from([(RewardTier::Top2, Payout::new(1, 1))]));

        assert!(matches!(
            build_result(&window, &ranking, &config, Utc::now()),
            Err(RewardsError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_weekly_settlement_sets_score_and_increments_balance() {
        let storage = StorageContext::in_memory();
        let calc = CycleCalculator::default();
        seed_users(&storage, &[("alice", 120), ("bob", 80)]).await;

        let processor = SettlementProcessor::new(storage.clone(), calc);
        let window = ended_week(&calc);
        let result = processor
            .settle_weekly(&window, &RewardConfiguration::default())
            .await
            .unwrap();
        assert_eq!(result.cycle_id, window.id);

        let alice: Participant = storage.read(Collection::Users, "alice").await.unwrap().unwrap();
        assert_eq!(alice.balance, 500);
        assert_eq!(alice.score, 50);

        let bob: Participant = storage.read(Collection::Users, "bob").await.unwrap().unwrap();
        assert_eq!(bob.balance, 300);
        assert_eq!(bob.score, 30);

        assert!(processor.is_processed(&window).await.unwrap());
        assert_eq!(processor.cycle_result(&window.id).await.unwrap(), result);
    }

    #[tokio::test]
    async fn test_second_settlement_is_rejected_without_credit() {
        let storage = StorageContext::in_memory();
        let calc = CycleCalculator::default();
        seed_users(&storage, &[("alice", 10)]).await;

        let processor = SettlementProcessor::new(storage.clone(), calc);
        let window = ended_week(&calc);
        processor.settle_weekly(&window, &RewardConfiguration::default()).await.unwrap();

        let err = processor
            .settle_weekly(&window, &RewardConfiguration::default())
            .await
            .unwrap_err();
        assert!(err.is_already_settled());

        let alice: Participant = storage.read(Collection::Users, "alice").await.unwrap().unwrap();
        assert_eq!(alice.balance, 500);
    }

    #[tokio::test]
    async fn test_failed_commit_is_retryable_and_pays_once() {
        let store = Arc::new(InMemoryStore::new());
        let storage = StorageContext::new(store.clone());
        let calc = CycleCalculator::default();
        seed_users(&storage, &[("alice", 10), ("bob", 5)]).await;

        let processor = SettlementProcessor::new(storage.clone(), calc);
        let window = ended_week(&calc);

        store.fail_next_commits(1);
        let err = processor
            .settle_weekly(&window, &RewardConfiguration::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!processor.is_processed(&window).await.unwrap());

        let alice: Participant = storage.read(Collection::Users, "alice").await.unwrap().unwrap();
        assert_eq!(alice.balance, 0);
        assert_eq!(alice.score, 10);

        processor.settle_weekly(&window, &RewardConfiguration::default()).await.unwrap();
        let alice: Participant = storage.read(Collection::Users, "alice").await.unwrap().unwrap();
        assert_eq!(alice.balance, 500);
    }

    #[tokio::test]
    async fn test_commit_failure_from_backend_mock_surfaces_storage_error() {
        let mut store = MockStore::new();
        store.expect_get().returning(|_, _| Ok(None));
        store.expect_list().returning(|_| {
            Ok(vec![(
                "alice".to_string(),
                serde_json::json!({
                    "id": "alice",
                    "display_name": "Alice",
                    "score": 10,
                    "balance": 0,
                    "created_at": "2026-01-01T00:00:00Z"
                }),
            )])
        });
        store.expect_server_time().returning(|| Ok(Utc::now()));
        store
            .expect_commit()
            .times(1)
            .returning(|_| Err(StoreError::Backend("connection reset".to_string())));
        store.expect_set().never();

        let calc = CycleCalculator::default();
        let processor = SettlementProcessor::new(StorageContext::new(Arc::new(store)), calc);
        let err = processor
            .settle_weekly(&ended_week(&calc), &RewardConfiguration::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RewardsError::StorageError(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_running_window_is_not_settled() {
        let storage = StorageContext::in_memory();
        let calc = CycleCalculator::default();
        seed_users(&storage, &[("alice", 40)]).await;

        let processor = SettlementProcessor::new(storage.clone(), calc);
        let running = calc.current_cycle(CycleKind::Weekly, Utc::now()).unwrap();

        let err = processor.settle(CycleKind::Weekly, &running).await.unwrap_err();
        assert!(matches!(err, RewardsError::CycleNotEnded { .. }));

        let alice: Participant = storage.read(Collection::Users, "alice").await.unwrap().unwrap();
        assert_eq!((alice.score, alice.balance), (40, 0));
        assert!(!processor.is_processed(&running).await.unwrap());
        assert!(matches!(
            processor.cycle_result(&running.id).await,
            Err(RewardsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mismatched_kind_is_rejected() {
        let calc = CycleCalculator::default();
        let processor = SettlementProcessor::new(StorageContext::in_memory(), calc);
        let window = ended_week(&calc);
        assert!(processor.settle(CycleKind::Quarterly, &window).await.is_err());
    }
}
