use std::collections::HashMap;

/// One item surfaced by a single retrieval method (keyword or semantic) at
/// a given rank within that method's result list.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub id: String,
    pub rank: usize,
    pub original_score: f32,
}

/// Fuses result lists from multiple retrieval methods via reciprocal rank
/// fusion: `score = sum(1 / (k + rank_i + 1))` over every method that
/// surfaced the item, where `rank_i` is 0-based. Ties are broken by the
/// highest original-method score, so exact-keyword hits outrank marginal
/// semantic ones when their fused scores land equal.
pub fn reciprocal_rank_fusion(hits: Vec<RankedHit>, k: u32) -> Vec<(String, f32)> {
    let mut fused: HashMap<String, f32> = HashMap::new();
    let mut best_original: HashMap<String, f32> = HashMap::new();

    for hit in hits {
        let contribution = 1.0 / (k as f32 + hit.rank as f32 + 1.0);
        *fused.entry(hit.id.clone()).or_insert(0.0) += contribution;
        best_original
            .entry(hit.id.clone())
            .and_modify(|existing| *existing = existing.max(hit.original_score))
            .or_insert(hit.original_score);
    }

    let mut ranked: Vec<(String, f32)> = fused.into_iter().collect();
    ranked.sort_by(|(a_id, a_score), (b_id, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_orig = best_original.get(a_id).copied().unwrap_or(0.0);
                let b_orig = best_original.get(b_id).copied().unwrap_or(0.0);
                b_orig.partial_cmp(&a_orig).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a_id.cmp(b_id))
    });

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_found_by_both_methods_outranks_single_method_hit() {
        let hits = vec![
            RankedHit { id: "a".into(), rank: 0, original_score: 0.9 },
            RankedHit { id: "a".into(), rank: 2, original_score: 0.6 },
            RankedHit { id: "b".into(), rank: 1, original_score: 0.8 },
        ];

        let fused = reciprocal_rank_fusion(hits, 60);
        assert_eq!(fused[0].0, "a");
        assert!(fused[0].1 > fused[1].1);
    }

    #[test]
    fn fused_score_is_the_sum_of_reciprocal_ranks() {
        let hits = vec![
            RankedHit { id: "a".into(), rank: 0, original_score: 3.2 },
            RankedHit { id: "a".into(), rank: 1, original_score: 0.9 },
        ];

        let fused = reciprocal_rank_fusion(hits, 60);
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].1 - expected).abs() < 1e-6);
    }

    #[test]
    fn appearing_in_one_more_list_never_lowers_the_score() {
        let two_lists = vec![
            RankedHit { id: "a".into(), rank: 3, original_score: 0.5 },
            RankedHit { id: "a".into(), rank: 3, original_score: 0.5 },
        ];
        let three_lists = vec![
            RankedHit { id: "a".into(), rank: 3, original_score: 0.5 },
            RankedHit { id: "a".into(), rank: 3, original_score: 0.5 },
            RankedHit { id: "a".into(), rank: 3, original_score: 0.5 },
        ];

        let with_two = reciprocal_rank_fusion(two_lists, 60)[0].1;
        let with_three = reciprocal_rank_fusion(three_lists, 60)[0].1;
        assert!(with_three >= with_two);
    }

    #[test]
    fn ties_break_on_highest_original_score() {
        let hits = vec![
            RankedHit { id: "a".into(), rank: 0, original_score: 0.5 },
            RankedHit { id: "b".into(), rank: 0, original_score: 0.9 },
        ];

        let fused = reciprocal_rank_fusion(hits, 60);
        assert_eq!(fused[0].0, "b");
    }
}
