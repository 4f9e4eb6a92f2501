//! Cross-shard facet counts
//!
//! Shards return their top `shard_facets` labels by count. A shard that
//! returned fewer labels than that (or was asked for all of them) is complete;
//! any other shard may hide a label with a count up to its smallest returned
//! count. Those floors bound each label's error and decide whether a label cut
//! by `max_facets` could outrank the last one kept.

use crate::proto::{CountRequest, FacetCount, FacetGroup, ShardFacetGroup};
use std::collections::HashMap;

pub struct FacetCountCombiner<'a> {
    request: &'a CountRequest,
}

impl<'a> FacetCountCombiner<'a> {
    pub fn new(request: &'a CountRequest) -> Self {
        Self { request }
    }

    /// Combine one group per shard.
    pub fn combine(&self, shard_groups: &[ShardFacetGroup]) -> FacetGroup {
        if let [single] = shard_groups {
            return FacetGroup {
                facet_field: self.request.facet_field.clone(),
                facet_counts: single.facet_counts.clone(),
                ..Default::default()
            };
        }

        let shard_count = shard_groups.len();
        let shard_facets = self.request.shard_facets;
        let max_facets = self.request.max_facets;

        let mut counts: HashMap<&str, (u64, Vec<bool>)> = HashMap::new();
        let mut floors = vec![0u64; shard_count];
        for (shard, group) in shard_groups.iter().enumerate() {
            for facet in &group.facet_counts {
                let (count, returned) = counts
                    .entry(facet.label.as_str())
                    .or_insert_with(|| (0, vec![false; shard_count]));
                *count += facet.count;
                returned[shard] = true;
                floors[shard] = facet.count;
            }
            let complete = shard_facets == -1 || (group.facet_counts.len() as i64) < shard_facets as i64;
            if complete {
                floors[shard] = 0;
            }
        }

        let mut max_value_possible_missing: u64 = floors.iter().sum();
        let compute_error = max_facets > 0 && shard_facets > 0 && shard_count > 1;
        let compute_possible_missing = compute_error && max_value_possible_missing != 0;

        let mut sorted: Vec<(&str, u64, Vec<bool>)> = counts
            .into_iter()
            .map(|(label, (count, returned))| (label, count, returned))
            .collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let has_results = !sorted.is_empty();

        let mut facet_counts = Vec::new();
        let mut min_count_returned = 0;
        for (position, (label, count, returned)) in sorted.into_iter().enumerate() {
            let mut max_error = 0;
            if compute_error {
                max_error = (0..shard_count)
                    .filter(|&shard| !returned[shard])
                    .map(|shard| floors[shard])
                    .sum();
            }

            if max_facets > 0 && position >= max_facets as usize {
                if !compute_possible_missing {
                    break;
                }
                max_value_possible_missing = max_value_possible_missing.max(count + max_error);
            } else {
                facet_counts.push(FacetCount {
                    label: label.to_string(),
                    count,
                    max_error,
                });
                min_count_returned = count;
            }
        }

        let possible_missing = has_results && max_value_possible_missing > min_count_returned;
        FacetGroup {
            facet_field: self.request.facet_field.clone(),
            facet_counts,
            possible_missing,
            max_value_possible_missing: if possible_missing {
                max_value_possible_missing
            } else {
                0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(counts: &[(&str, u64)]) -> ShardFacetGroup {
        ShardFacetGroup {
            facet_field: "genre".into(),
            facet_counts: counts
                .iter()
                .map(|(label, count)| FacetCount {
                    label: label.to_string(),
                    count: *count,
                    max_error: 0,
                })
                .collect(),
        }
    }

    fn request(max_facets: i32, shard_facets: i32) -> CountRequest {
        CountRequest {
            facet_field: "genre".into(),
            max_facets,
            shard_facets,
        }
    }

    fn counts(group: &FacetGroup) -> Vec<(String, u64, u64)> {
        group
            .facet_counts
            .iter()
            .map(|f| (f.label.clone(), f.count, f.max_error))
            .collect()
    }

    #[test]
    fn test_single_shard_passthrough() {
        let combined = FacetCountCombiner::new(&request(2, 2)).combine(&[group(&[("a", 3), ("b", 1)])]);
        assert_eq!(
            counts(&combined),
            vec![("a".to_string(), 3, 0), ("b".to_string(), 1, 0)]
        );
        assert!(!combined.possible_missing);
    }

    #[test]
    fn test_complete_shards_are_exact() {
        let combined = FacetCountCombiner::new(&request(10, -1)).combine(&[
            group(&[("a", 5), ("b", 2)]),
            group(&[("b", 4), ("c", 1)]),
        ]);
        assert_eq!(
            counts(&combined),
            vec![
                ("b".to_string(), 6, 0),
                ("a".to_string(), 5, 0),
                ("c".to_string(), 1, 0),
            ]
        );
        assert!(!combined.possible_missing);
    }

    #[test]
    fn test_truncated_shards_carry_error() {
        // Both shards returned exactly shard_facets labels, so both may hide more
        let combined = FacetCountCombiner::new(&request(2, 2)).combine(&[
            group(&[("a", 10), ("b", 6)]),
            group(&[("c", 9), ("a", 4)]),
        ]);
        assert_eq!(
            counts(&combined),
            vec![("a".to_string(), 14, 0), ("c".to_string(), 9, 6)]
        );
        // "b" (6 + up to 4 from shard 1) is cut but could reach 10 > 9
        assert!(combined.possible_missing);
        assert_eq!(combined.max_value_possible_missing, 10);
    }

    #[test]
    fn test_short_shard_is_complete() {
        let combined = FacetCountCombiner::new(&request(5, 3)).combine(&[
            group(&[("a", 10), ("b", 6), ("c", 2)]),
            group(&[("a", 4)]),
        ]);
        // Shard 1 returned fewer than 3 labels, so it hides nothing
        assert_eq!(
            counts(&combined),
            vec![
                ("a".to_string(), 14, 0),
                ("b".to_string(), 6, 0),
                ("c".to_string(), 2, 0),
            ]
        );
        assert!(!combined.possible_missing);
    }

    #[test]
    fn test_empty_groups() {
        let combined = FacetCountCombiner::new(&request(5, 3)).combine(&[group(&[]), group(&[])]);
        assert!(combined.facet_counts.is_empty());
        assert!(!combined.possible_missing);
    }
}
