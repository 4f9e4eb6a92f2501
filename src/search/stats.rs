//! Cross-shard numeric facet statistics
//!
//! Each shard returns the exact global statistic and its own top facets by
//! sum, cut at `shard_facets`. Combining those truncated lists is
//! approximate, so every combined facet carries an upper bound on what the
//! truncation may have hidden: the true sum is at most `sum + max_sum_error`.
//!
//! When percentiles are requested, every shard stat also carries a DDSketch
//! of its values. Sketches built with the same precision merge losslessly,
//! so combined percentiles keep the requested relative accuracy.

use crate::common::{Error, Result};
use crate::proto::{
    CombinedFacetStat, CombinedStatGroup, FacetStat, Percentile, ShardStatGroup, StatRequest,
};
use sketches_ddsketch::{Config as SketchConfig, DDSketch};
use std::collections::BTreeMap;

const MAX_SKETCH_BINS: u32 = 4096;
const MIN_SKETCH_VALUE: f64 = 1.0e-9;

/// Percentiles need both points and a positive precision.
pub fn wants_percentiles(request: &StatRequest) -> bool {
    request.precision > 0.0 && !request.percentiles.is_empty()
}

/// An empty sketch with `precision` relative accuracy.
pub fn new_sketch(precision: f64) -> DDSketch {
    DDSketch::new(SketchConfig::new(precision, MAX_SKETCH_BINS, MIN_SKETCH_VALUE))
}

pub fn encode_sketch(sketch: &DDSketch) -> Result<Vec<u8>> {
    bincode::serialize(sketch).map_err(|e| Error::Internal(format!("Sketch encode error: {}", e)))
}

fn decode_sketch(bytes: &[u8]) -> Result<DDSketch> {
    bincode::deserialize(bytes).map_err(|e| Error::ShardResponse(format!("bad stat sketch: {}", e)))
}

/// Merge the sketches carried by `stats`; `None` when no values were seen.
fn merge_sketches<'s>(
    precision: f64,
    stats: impl IntoIterator<Item = &'s FacetStat>,
) -> Result<Option<DDSketch>> {
    let mut merged = new_sketch(precision);
    for stat in stats {
        if stat.stat_sketch.is_empty() {
            continue;
        }
        let sketch = decode_sketch(&stat.stat_sketch)?;
        merged
            .merge(&sketch)
            .map_err(|e| Error::ShardResponse(format!("cannot merge stat sketch: {:?}", e)))?;
    }
    Ok((merged.count() > 0).then_some(merged))
}

fn percentiles(sketch: &DDSketch, points: &[f64]) -> Result<Vec<Percentile>> {
    let mut out = Vec::with_capacity(points.len());
    for &point in points.iter().filter(|p| (0.0..=1.0).contains(*p)) {
        let value = sketch
            .quantile(point)
            .map_err(|e| Error::Internal(format!("quantile {}: {:?}", point, e)))?;
        if let Some(value) = value {
            out.push(Percentile { point, value });
        }
    }
    Ok(out)
}

/// Fold `other` into `into`.
pub fn combine_facet_stat(into: &mut FacetStat, other: &FacetStat) {
    into.sum += other.sum;
    into.min = into.min.min(other.min);
    into.max = into.max.max(other.max);
    into.doc_count += other.doc_count;
    into.all_doc_count += other.all_doc_count;
    into.value_count += other.value_count;
}

pub struct StatAggregator<'a> {
    request: &'a StatRequest,
}

impl<'a> StatAggregator<'a> {
    pub fn new(request: &'a StatRequest) -> Self {
        Self { request }
    }

    /// Fill in the percentiles of `combined` from the shard stats it came from.
    fn estimate<'s>(
        &self,
        combined: &mut FacetStat,
        parts: impl IntoIterator<Item = &'s FacetStat>,
    ) -> Result<()> {
        combined.stat_sketch.clear();
        if !wants_percentiles(self.request) {
            return Ok(());
        }
        if let Some(sketch) = merge_sketches(self.request.precision, parts)? {
            combined.percentiles = percentiles(&sketch, &self.request.percentiles)?;
        }
        Ok(())
    }

    /// Combine one group per shard.
    pub fn combine(&self, shard_groups: &[ShardStatGroup]) -> Result<CombinedStatGroup> {
        let truncated = self.request.shard_facets != -1;

        let mut global_stat = shard_groups
            .iter()
            .filter_map(|g| g.global_stat.as_ref())
            .fold(None, |acc: Option<FacetStat>, stat| match acc {
                Some(mut combined) => {
                    combine_facet_stat(&mut combined, stat);
                    Some(combined)
                }
                None => Some(stat.clone()),
            });
        if let Some(global) = global_stat.as_mut() {
            self.estimate(global, shard_groups.iter().filter_map(|g| g.global_stat.as_ref()))?;
        }

        // Largest sum an unreturned facet of each shard could have
        let floors: Vec<f64> = shard_groups
            .iter()
            .map(|g| {
                g.facet_stats
                    .iter()
                    .map(|f| f.sum)
                    .min_by(f64::total_cmp)
                    .unwrap_or(0.0)
            })
            .collect();

        let mut by_label: BTreeMap<&str, (FacetStat, Vec<Option<&FacetStat>>)> = BTreeMap::new();
        for (shard, group) in shard_groups.iter().enumerate() {
            for stat in &group.facet_stats {
                let (combined, reported) = by_label
                    .entry(stat.label.as_str())
                    .or_insert_with(|| {
                        (
                            FacetStat {
                                label: stat.label.clone(),
                                min: f64::INFINITY,
                                max: f64::NEG_INFINITY,
                                ..Default::default()
                            },
                            vec![None; shard_groups.len()],
                        )
                    });
                combine_facet_stat(combined, stat);
                reported[shard] = Some(stat);
            }
        }

        let mut facet_stats = by_label
            .into_values()
            .map(|(mut stat, reported)| {
                self.estimate(&mut stat, reported.iter().flatten().copied())?;
                let omitted: Vec<usize> = reported
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_none())
                    .map(|(shard, _)| shard)
                    .collect();
                let has_error = truncated && !omitted.is_empty();
                let max_sum_error = if has_error {
                    omitted.iter().map(|&shard| floors[shard]).sum()
                } else {
                    0.0
                };
                Ok(CombinedFacetStat {
                    stat: Some(stat),
                    has_error,
                    max_sum_error,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        facet_stats.sort_by(|a, b| {
            let (a, b) = (a.stat.as_ref(), b.stat.as_ref());
            let sum = |s: Option<&FacetStat>| s.map(|s| s.sum).unwrap_or(0.0);
            let label = |s: Option<&FacetStat>| s.map(|s| s.label.clone()).unwrap_or_default();
            sum(b).total_cmp(&sum(a)).then_with(|| label(a).cmp(&label(b)))
        });
        if self.request.max_facets > 0 {
            facet_stats.truncate(self.request.max_facets as usize);
        }

        Ok(CombinedStatGroup {
            numeric_field: self.request.numeric_field.clone(),
            facet_field: self.request.facet_field.clone(),
            global_stat,
            facet_stats,
        })
    }
}
