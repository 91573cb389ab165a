use crate::models::RankedEntry;

/// Orders participants into a dense, 1-based ranking.
///
/// Scores sort descending. Equal scores do not share a rank: ties are broken
/// by participant id in ascending byte order, so the same input always yields
/// the same ranking.
pub struct RankingEngine;

impl RankingEngine {
    pub fn rank<'a, I>(scores: I) -> Vec<RankedEntry>
    where
        I: IntoIterator<Item = (&'a String, &'a u64)>,
    {
        let mut sorted: Vec<(&String, u64)> = scores
            .into_iter()
            .map(|(id, score)| (id, *score))
            .collect();

        sorted.sort_unstable_by(|(id_a, score_a), (id_b, score_b)| {
            score_b.cmp(score_a).then_with(|| id_a.cmp(id_b))
        });

        sorted
            .into_iter()
            .enumerate()
            .map(|(index, (id, score))| RankedEntry {
                participant_id: id.clone(),
                score,
                rank: index as u32 + 1,
            })
            .collect()
    }

    pub fn top(mut entries: Vec<RankedEntry>, limit: usize) -> Vec<RankedEntry> {
        entries.truncate(limit);
        entries
    }

    pub fn find(entries: &[RankedEntry], participant_id: &str) -> Option<RankedEntry> {
        entries
            .iter()
            .find(|entry| entry.participant_id == participant_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scores(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn test_empty_ranking() {
        assert!(RankingEngine::rank(&HashMap::<String, u64>::new()).is_empty());
    }

    #[test]
    fn test_ranks_descending_with_id_tie_break() {
        let ranking = RankingEngine::rank(&scores(&[("carol", 50), ("bob", 100), ("alice", 100)]));

        let order: Vec<(&str, u32)> = ranking
            .iter()
            .map(|e| (e.participant_id.as_str(), e.rank))
            .collect();
        assert_eq!(order, vec![("alice", 1), ("bob", 2), ("carol", 3)]);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let input = scores(&[("d", 7), ("a", 7), ("c", 7), ("b", 9), ("e", 0)]);
        let first = RankingEngine::rank(&input);
        for _ in 0..10 {
            assert_eq!(RankingEngine::rank(&input), first);
        }
    }

    #[test]
    fn test_ranks_are_dense_and_include_zero_scores() {
        let input: HashMap<String, u64> =
            (0..25).map(|i| (format!("user{:02}", i), (i % 4) as u64)).collect();
        let ranking = RankingEngine::rank(&input);

        let ranks: Vec<u32> = ranking.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, (1..=25).collect::<Vec<u32>>());
        assert!(ranking.iter().any(|e| e.score == 0));
        assert!(ranking.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_top_and_find() {
        let ranking = RankingEngine::rank(&scores(&[("a", 3), ("b", 2), ("c", 1)]));
        assert_eq!(RankingEngine::find(&ranking, "c").map(|e| e.rank), Some(3));
        assert!(RankingEngine::find(&ranking, "z").is_none());
        assert_eq!(RankingEngine::top(ranking, 2).len(), 2);
    }
}
