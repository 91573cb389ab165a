use crate::{
    cycle::CycleCalculator,
    models::{
        CycleId, CycleKind, CycleResult, Payout, Result, RewardConfiguration, RewardTier,
        RewardsError, StoreError,
    },
    settlement::processor::SettlementProcessor,
    store::{Collection, FieldPath, StorageContext, WriteBatch},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STATE_DOC: &str = "state";
const MAX_STATE_ATTEMPTS: u32 = 5;

/// Persisted reward configuration state. `version` increases on every write
/// and guards concurrent updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagingState {
    pub active: RewardConfiguration,
    pub pending: Option<RewardConfiguration>,
    pub last_applied_cycle: Option<CycleId>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyOutcome {
    /// A pending configuration was promoted by this call.
    pub applied: bool,
    pub reason: Option<String>,
    /// The configuration active from now on, when it changed.
    pub config: Option<RewardConfiguration>,
    /// Settlement of the cycle that just ended, when this call performed it.
    pub distribution: Option<CycleResult>,
}

impl ApplyOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            applied: false,
            reason: Some(reason.into()),
            config: None,
            distribution: None,
        }
    }
}

/// Active plus at most one pending reward configuration. The pending one is
/// promoted only when a new weekly cycle is first observed.
pub struct ConfigStaging {
    storage: StorageContext,
    calculator: CycleCalculator,
    processor: Arc<SettlementProcessor>,
}

impl ConfigStaging {
    pub fn new(
        storage: StorageContext,
        calculator: CycleCalculator,
        processor: Arc<SettlementProcessor>,
    ) -> Self {
        Self { storage, calculator, processor }
    }

    /// Create the state document with `defaults` as the active configuration,
    /// unless it already exists.
    pub async fn initialize(&self, defaults: RewardConfiguration) -> Result<StagingState> {
        defaults.validate()?;

        if let Some(state) = self.storage.read(Collection::RewardConfig, STATE_DOC).await? {
            return Ok(state);
        }

        let state = StagingState {
            active: defaults,
            pending: None,
            last_applied_cycle: None,
            version: 0,
        };

        match self.storage.create(Collection::RewardConfig, STATE_DOC, &state).await {
            Ok(()) => {
                info!("Initialized reward configuration state");
                Ok(state)
            }
            Err(RewardsError::StorageError(StoreError::AlreadyExists { .. })) => {
                Self::load_state(&self.storage).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn load_state(storage: &StorageContext) -> Result<StagingState> {
        storage
            .read(Collection::RewardConfig, STATE_DOC)
            .await?
            .ok_or_else(|| RewardsError::not_found("reward configuration", STATE_DOC))
    }

    pub async fn state(&self) -> Result<StagingState> {
        Self::load_state(&self.storage).await
    }

    pub async fn active(&self) -> Result<RewardConfiguration> {
        Ok(self.state().await?.active)
    }

    pub async fn pending(&self) -> Result<Option<RewardConfiguration>> {
        Ok(self.state().await?.pending)
    }

    /// Merge `tiers` into the pending configuration, or into a copy of the
    /// active one when nothing is pending. The result must cover every tier.
    pub async fn save_or_update_pending(
        &self,
        tiers: BTreeMap<RewardTier, Payout>,
    ) -> Result<RewardConfiguration> {
        let saved = self
            .update_state(|state, now| {
                let base = state.pending.as_ref().unwrap_or(&state.active);
                let mut merged = base.merged_with(&tiers);
                merged.staged_at = Some(now);
                merged.validate()?;
                state.pending = Some(merged.clone());
                Ok(merged)
            })
            .await?;

        info!("Staged pending reward configuration for the next cycle");
        Ok(saved)
    }

    /// Drop the pending configuration. Returns whether one existed.
    pub async fn delete_pending(&self) -> Result<bool> {
        let removed = self
            .update_state(|state, _| Ok(state.pending.take().is_some()))
            .await?;

        if removed {
            info!("Deleted pending reward configuration");
        }
        Ok(removed)
    }

    /// Observe the weekly boundary at `now`.
    ///
    /// The first call in a new cycle settles the cycle that just ended under
    /// the configuration that was active during it, then promotes the
    /// pending configuration. Later calls in the same cycle do nothing.
    pub async fn apply_pending_if_needed(&self, now: DateTime<Utc>) -> Result<ApplyOutcome> {
        let state = self.state().await?;
        self.apply_from(state, now).await
    }

    /// Boundary transition starting from `state` as read by the caller. The
    /// final write only lands if nobody changed the state since that read.
    async fn apply_from(&self, state: StagingState, now: DateTime<Utc>) -> Result<ApplyOutcome> {
        let current = self.calculator.current_cycle(CycleKind::Weekly, now)?;

        if state.last_applied_cycle.as_ref() == Some(&current.id) {
            debug!("Cycle {} already observed", current.id);
            return Ok(ApplyOutcome::skipped(format!("already applied for cycle {}", current.id)));
        }

        let ended = self.calculator.previous_cycle(&current)?;
        let distribution = match self.processor.settle_weekly(&ended, &state.active).await {
            Ok(result) => Some(result),
            Err(e) if e.is_already_settled() => {
                info!("Cycle {} settled by an earlier invocation", ended.id);
                None
            }
            Err(e) => return Err(e),
        };

        let mut next = state.clone();
        let promoted = next.pending.take();
        if let Some(config) = &promoted {
            next.active = config.clone();
        }
        next.last_applied_cycle = Some(current.id.clone());
        next.version = state.version + 1;

        match self.write_state(&state, &next).await {
            Ok(()) => {}
            Err(RewardsError::StorageError(StoreError::Conflict { .. })) => {
                warn!(
                    "Reward configuration changed concurrently while entering cycle {}",
                    current.id
                );
                let reason = "configuration state changed by a concurrent invocation";
                return Ok(ApplyOutcome {
                    distribution,
                    ..ApplyOutcome::skipped(reason)
                });
            }
            Err(e) => return Err(e),
        }

        match promoted {
            Some(config) => {
                info!("Promoted pending reward configuration at cycle {}", current.id);
                Ok(ApplyOutcome {
                    applied: true,
                    reason: None,
                    config: Some(config),
                    distribution,
                })
            }
            None => Ok(ApplyOutcome {
                distribution,
                ..ApplyOutcome::skipped("no pending configuration")
            }),
        }
    }

    async fn update_state<F, T>(&self, mut mutate: F) -> Result<T>
    where
        F: FnMut(&mut StagingState, DateTime<Utc>) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            let current = self.state().await?;
            let now = self.storage.now().await?;

            let mut next = current.clone();
            let output = mutate(&mut next, now)?;
            next.version = current.version + 1;

            match self.write_state(&current, &next).await {
                Ok(()) => return Ok(output),
                Err(RewardsError::StorageError(StoreError::Conflict { .. }))
                    if attempt < MAX_STATE_ATTEMPTS =>
                {
                    debug!("Configuration state moved underneath update, attempt {}", attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_state(&self, expected: &StagingState, next: &StagingState) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch
            .precondition(
                Collection::RewardConfig,
                STATE_DOC,
                FieldPath::field("version"),
                serde_json::Value::from(expected.version),
            )
            .set(Collection::RewardConfig, STATE_DOC, serde_json::to_value(next)?);
        self.storage.commit(batch).await
    }
}
