//! Cross-shard result merging
//!
//! Shards return their results pre-sorted with [`ResultComparator`]; the
//! merger interleaves those lists with a k-way merge and cuts the requested
//! page. Shards and the merger must share the comparator, which is why it
//! lives here and is exported to shard engines.

use crate::common::{Error, Result};
use crate::proto::{Direction, FieldSort, ScoredResult, ShardQueryResponse, SortValue};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

/// Sort field that compares relevance scores instead of `sort_values`
pub const SCORE_FIELD: &str = "score";

#[derive(Debug, Clone)]
struct SortKey {
    by_score: bool,
    descending: bool,
    missing_last: bool,
    /// Position in `sort_values`; every sort field takes a slot, score included
    value_index: usize,
}

/// Total order over results: sort keys, then result index, shard and index name.
#[derive(Debug, Clone)]
pub struct ResultComparator {
    keys: Vec<SortKey>,
}

impl ResultComparator {
    pub fn new(sort: &[FieldSort]) -> Self {
        let keys = if sort.is_empty() {
            vec![SortKey {
                by_score: true,
                descending: true,
                missing_last: false,
                value_index: 0,
            }]
        } else {
            sort.iter()
                .enumerate()
                .map(|(value_index, field_sort)| SortKey {
                    by_score: field_sort.field == SCORE_FIELD,
                    descending: field_sort.direction == Direction::Descending as i32,
                    missing_last: field_sort.missing_last,
                    value_index,
                })
                .collect()
        };
        Self { keys }
    }

    pub fn compare(&self, a: &ScoredResult, b: &ScoredResult) -> Ordering {
        for key in &self.keys {
            let ordering = if key.by_score {
                a.score.total_cmp(&b.score)
            } else {
                compare_sort_values(
                    a.sort_values.get(key.value_index),
                    b.sort_values.get(key.value_index),
                    key.missing_last,
                )
            };
            let ordering = if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        a.result_index
            .cmp(&b.result_index)
            .then_with(|| a.shard.cmp(&b.shard))
            .then_with(|| a.index_name.cmp(&b.index_name))
    }

    pub fn sort(&self, results: &mut [ScoredResult]) {
        results.sort_by(|a, b| self.compare(a, b));
    }
}

fn compare_sort_values(a: Option<&SortValue>, b: Option<&SortValue>, missing_last: bool) -> Ordering {
    let a = a.filter(|v| v.exists);
    let b = b.filter(|v| v.exists);
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) if missing_last => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) if missing_last => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (&a.number, &b.number, &a.text, &b.text) {
            (Some(x), Some(y), _, _) => x.total_cmp(y),
            (_, _, Some(x), Some(y)) => x.cmp(y),
            // Numbers before text when a field mixes both
            (Some(_), None, _, _) => Ordering::Less,
            (None, Some(_), _, _) => Ordering::Greater,
            _ => Ordering::Equal,
        },
    }
}

/// Next unmerged result of one shard list, ordered so the heap top is the
/// smallest result under the comparator.
struct Head<'c> {
    result: ScoredResult,
    rest: std::vec::IntoIter<ScoredResult>,
    comparator: &'c ResultComparator,
}

impl Ord for Head<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(&other.result, &self.result)
    }
}

impl PartialOrd for Head<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head<'_> {}

pub struct ResultMerger;

impl ResultMerger {
    /// Merge pre-sorted shard lists and return `[start, start + amount)`.
    pub fn merge(
        shard_results: Vec<Vec<ScoredResult>>,
        comparator: &ResultComparator,
        start: usize,
        amount: usize,
    ) -> Vec<ScoredResult> {
        let end = start.saturating_add(amount);
        let mut heads: BinaryHeap<Head<'_>> = shard_results
            .into_iter()
            .filter_map(|list| {
                let mut rest = list.into_iter();
                rest.next().map(|result| Head {
                    result,
                    rest,
                    comparator,
                })
            })
            .collect();

        let mut page = Vec::with_capacity(amount.min(1024));
        let mut position = 0;
        while position < end {
            let Some(mut head) = heads.pop() else {
                break;
            };
            let result = match head.rest.next() {
                Some(next) => {
                    let result = std::mem::replace(&mut head.result, next);
                    heads.push(head);
                    result
                }
                None => head.result,
            };
            if position >= start {
                page.push(result);
            }
            position += 1;
        }
        page
    }
}

/// Check that `responses` hold exactly one response per shard of the index.
pub fn validate_shard_responses(
    index_name: &str,
    number_of_shards: u32,
    responses: &[ShardQueryResponse],
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for response in responses {
        if !seen.insert(response.shard_number) {
            return Err(Error::ShardResponse(format!(
                "shard <{}> is repeated for index <{}>",
                response.shard_number, index_name
            )));
        }
    }
    for shard in 0..number_of_shards {
        if !seen.contains(&shard) {
            return Err(Error::ShardResponse(format!(
                "shard <{}> is missing for index <{}>",
                shard, index_name
            )));
        }
    }
    Ok(())
}
