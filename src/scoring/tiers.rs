use crate::models::{Payout, Result, RewardConfiguration, RewardTier, RewardsError};

pub struct RewardTierResolver;

impl RewardTierResolver {
    /// Tier for a 1-based rank. Rank 0 cannot come out of the ranking
    /// engine and is treated as a bug.
    pub fn tier_for(rank: u32) -> RewardTier {
        match rank {
            0 => panic!("ranks are 1-based, got rank 0"),
            1 => RewardTier::Top1,
            2 => RewardTier::Top2,
            3 => RewardTier::Top3,
            4..=10 => RewardTier::Top4to10,
            _ => RewardTier::Top11Plus,
        }
    }

    pub fn payout_for(tier: RewardTier, config: &RewardConfiguration) -> Result<Payout> {
        config.tiers.get(&tier).copied().ok_or_else(|| {
            RewardsError::ConfigurationError(format!(
                "No payout configured for tier {}",
                tier
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(RewardTierResolver::tier_for(1), RewardTier::Top1);
        assert_eq!(RewardTierResolver::tier_for(2), RewardTier::Top2);
        assert_eq!(RewardTierResolver::tier_for(3), RewardTier::Top3);
        assert_eq!(RewardTierResolver::tier_for(4), RewardTier::Top4to10);
        assert_eq!(RewardTierResolver::tier_for(10), RewardTier::Top4to10);
        assert_eq!(RewardTierResolver::tier_for(11), RewardTier::Top11Plus);
        assert_eq!(RewardTierResolver::tier_for(u32::MAX), RewardTier::Top11Plus);
    }

    #[test]
    fn test_tiers_are_monotonic() {
        let mut previous = RewardTierResolver::tier_for(1);
        for rank in 2..=200 {
            let tier = RewardTierResolver::tier_for(rank);
            assert!(tier >= previous);
            previous = tier;
        }
    }

    #[test]
    #[should_panic]
    fn test_rank_zero_is_a_bug() {
        RewardTierResolver::tier_for(0);
    }

    #[test]
    fn test_payout_lookup() {
        let config = RewardConfiguration::default();
        assert_eq!(
            RewardTierResolver::payout_for(RewardTier::Top1, &config).unwrap(),
            Payout::new(500, 50)
        );

        let mut partial = config.clone();
        partial.tiers.remove(&RewardTier::Top3);
        assert!(matches!(
            RewardTierResolver::payout_for(RewardTier::Top3, &partial),
            Err(RewardsError::ConfigurationError(_))
        ));
    }
}
