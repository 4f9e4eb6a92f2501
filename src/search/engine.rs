//! Shard engine seam
//!
//! [`ShardEngine`] is what a node calls when it serves a shard itself.
//! [`MemoryShardEngine`] keeps JSON documents in memory and understands
//! three query forms:
//! - `*` (or empty): every document
//! - `field:value`: documents whose field equals, or contains, `value`
//! - `term`: documents with a text field containing `term` as a word

use crate::common::{Error, Result};
use crate::proto::*;
use crate::search::merge::{ResultComparator, SCORE_FIELD};
use crate::search::stats::{encode_sketch, new_sketch, wants_percentiles};
use async_trait::async_trait;
use serde_json::Value;
use sketches_ddsketch::DDSketch;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[async_trait]
pub trait ShardEngine: Send + Sync {
    async fn store(&self, shard: u32, request: StoreRequest) -> Result<StoreResponse>;

    async fn delete(&self, shard: u32, request: DeleteRequest) -> Result<DeleteResponse>;

    async fn fetch(&self, shard: u32, request: FetchRequest) -> Result<FetchResponse>;

    /// Top `request.start + request.amount` hits of the shard, sorted with
    /// [`ResultComparator`], plus the shard's statistics and facet counts.
    async fn query(&self, shard: u32, request: &QueryRequest) -> Result<ShardQueryResponse>;

    async fn optimize(&self, index_name: &str, shard: u32) -> Result<()>;

    async fn number_of_docs(&self, index_name: &str, shard: u32) -> Result<u64>;

    async fn field_names(&self, index_name: &str, shard: u32) -> Result<Vec<String>>;

    /// Terms of `request.field` with their frequencies, sorted by value.
    async fn terms(&self, shard: u32, request: &GetTermsRequest) -> Result<Vec<Term>>;

    async fn clear(&self, index_name: &str, shard: u32) -> Result<()>;
}

#[derive(Default)]
struct ShardDocuments {
    documents: BTreeMap<String, Value>,
}

type ShardId = (String, u32);

/// In-memory engine over JSON documents
#[derive(Default)]
pub struct MemoryShardEngine {
    shards: RwLock<HashMap<ShardId, ShardDocuments>>,
}

enum Matcher<'q> {
    All,
    Field { field: &'q str, value: &'q str },
    Term(String),
}

impl<'q> Matcher<'q> {
    fn parse(query: &'q str) -> Self {
        let query = query.trim();
        if query.is_empty() || query == "*" {
            return Matcher::All;
        }
        match query.split_once(':') {
            Some((field, value)) if !field.is_empty() => Matcher::Field {
                field,
                value: value.trim_matches('"'),
            },
            _ => Matcher::Term(query.to_lowercase()),
        }
    }

    /// Score of `document`, or `None` if it does not match.
    fn score(&self, document: &Value) -> Option<f64> {
        match self {
            Matcher::All => Some(1.0),
            Matcher::Field { field, value } => document
                .get(*field)
                .filter(|v| value_matches(v, value))
                .map(|_| 1.0),
            Matcher::Term(term) => {
                let hits = text_values(document)
                    .flat_map(tokenize)
                    .filter(|token| token == term)
                    .count();
                (hits > 0).then_some(hits as f64)
            }
        }
    }
}

fn value_matches(field_value: &Value, wanted: &str) -> bool {
    match field_value {
        Value::Array(items) => items.iter().any(|item| value_matches(item, wanted)),
        Value::String(s) => s == wanted,
        Value::Number(n) => n.to_string() == wanted,
        Value::Bool(b) => b.to_string() == wanted,
        _ => false,
    }
}

fn text_values(document: &Value) -> impl Iterator<Item = &str> {
    document
        .as_object()
        .into_iter()
        .flat_map(|o| o.values())
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .filter_map(Value::as_str)
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Numbers held by a field, flattening arrays.
fn numbers(document: &Value, field: &str) -> Vec<f64> {
    match document.get(field) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_f64).collect(),
        Some(v) => v.as_f64().into_iter().collect(),
        None => Vec::new(),
    }
}

/// Facet labels held by a field, flattening arrays.
fn labels(document: &Value, field: &str) -> BTreeSet<String> {
    let label = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    };
    match document.get(field) {
        Some(Value::Array(items)) => items.iter().filter_map(label).collect(),
        Some(v) => label(v).into_iter().collect(),
        None => BTreeSet::new(),
    }
}

fn sort_value(document: &Value, field: &str) -> SortValue {
    match document.get(field) {
        Some(Value::Number(n)) => n.as_f64().map(SortValue::number).unwrap_or_default(),
        Some(Value::String(s)) => SortValue::text(s.clone()),
        Some(Value::Bool(b)) => SortValue::text(b.to_string()),
        _ => SortValue::missing(),
    }
}

fn accumulate(stat: &mut FacetStat, values: &[f64]) {
    stat.all_doc_count += 1;
    if values.is_empty() {
        return;
    }
    stat.doc_count += 1;
    for &v in values {
        stat.sum += v;
        stat.min = stat.min.min(v);
        stat.max = stat.max.max(v);
        stat.value_count += 1;
    }
}

fn empty_stat(label: &str) -> FacetStat {
    FacetStat {
        label: label.to_string(),
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        ..Default::default()
    }
}

/// Facets kept by a shard: all of them for `-1` (or any non-positive limit).
fn shard_limit(shard_facets: i32) -> Option<usize> {
    (shard_facets > 0).then_some(shard_facets as usize)
}

/// A stat under construction, with its sketch when percentiles are wanted.
struct StatBuilder {
    stat: FacetStat,
    sketch: Option<DDSketch>,
}

impl StatBuilder {
    fn new(label: &str, request: &StatRequest) -> Self {
        Self {
            stat: empty_stat(label),
            sketch: wants_percentiles(request).then(|| new_sketch(request.precision)),
        }
    }

    fn add(&mut self, values: &[f64]) {
        accumulate(&mut self.stat, values);
        if let Some(sketch) = self.sketch.as_mut() {
            values.iter().for_each(|&v| sketch.add(v));
        }
    }

    fn build(self) -> Result<FacetStat> {
        let mut stat = self.stat;
        if let Some(sketch) = self.sketch {
            stat.stat_sketch = encode_sketch(&sketch)?;
        }
        Ok(stat)
    }
}

fn stat_group(request: &StatRequest, matched: &[&Value]) -> Result<ShardStatGroup> {
    let mut global = StatBuilder::new("", request);
    let mut by_label: BTreeMap<String, StatBuilder> = BTreeMap::new();

    for document in matched {
        let values = numbers(document, &request.numeric_field);
        global.add(&values);
        if !request.facet_field.is_empty() {
            for label in labels(document, &request.facet_field) {
                by_label
                    .entry(label.clone())
                    .or_insert_with(|| StatBuilder::new(&label, request))
                    .add(&values);
            }
        }
    }

    let mut builders: Vec<StatBuilder> = by_label.into_values().collect();
    builders.sort_by(|a, b| {
        b.stat
            .sum
            .total_cmp(&a.stat.sum)
            .then_with(|| a.stat.label.cmp(&b.stat.label))
    });
    if let Some(limit) = shard_limit(request.shard_facets) {
        builders.truncate(limit);
    }

    Ok(ShardStatGroup {
        numeric_field: request.numeric_field.clone(),
        facet_field: request.facet_field.clone(),
        global_stat: Some(global.build()?),
        facet_stats: builders
            .into_iter()
            .map(StatBuilder::build)
            .collect::<Result<_>>()?,
    })
}

fn facet_group(request: &CountRequest, matched: &[&Value]) -> ShardFacetGroup {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for document in matched {
        for label in labels(document, &request.facet_field) {
            *counts.entry(label).or_default() += 1;
        }
    }

    let mut facet_counts: Vec<FacetCount> = counts
        .into_iter()
        .map(|(label, count)| FacetCount {
            label,
            count,
            max_error: 0,
        })
        .collect();
    facet_counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    if let Some(limit) = shard_limit(request.shard_facets) {
        facet_counts.truncate(limit);
    }

    ShardFacetGroup {
        facet_field: request.facet_field.clone(),
        facet_counts,
    }
}

impl MemoryShardEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ShardId, ShardDocuments>>> {
        self.shards
            .read()
            .map_err(|_| Error::Internal("shard store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ShardId, ShardDocuments>>> {
        self.shards
            .write()
            .map_err(|_| Error::Internal("shard store lock poisoned".into()))
    }

    fn with_shard<T>(
        &self,
        index_name: &str,
        shard: u32,
        f: impl FnOnce(Option<&ShardDocuments>) -> T,
    ) -> Result<T> {
        let shards = self.read()?;
        Ok(f(shards.get(&(index_name.to_string(), shard))))
    }
}

#[async_trait]
impl ShardEngine for MemoryShardEngine {
    async fn store(&self, shard: u32, request: StoreRequest) -> Result<StoreResponse> {
        let document: Value = serde_json::from_slice(&request.document)
            .map_err(|e| Error::InvalidArgument(format!("document is not valid JSON: {}", e)))?;
        if !document.is_object() {
            return Err(Error::InvalidArgument("document must be a JSON object".into()));
        }
        let replaced = self
            .write()?
            .entry((request.index_name, shard))
            .or_default()
            .documents
            .insert(request.unique_id, document)
            .is_some();
        Ok(StoreResponse { replaced })
    }

    async fn delete(&self, shard: u32, request: DeleteRequest) -> Result<DeleteResponse> {
        let deleted = self
            .write()?
            .get_mut(&(request.index_name, shard))
            .map(|s| s.documents.remove(&request.unique_id).is_some())
            .unwrap_or(false);
        Ok(DeleteResponse { deleted })
    }

    async fn fetch(&self, shard: u32, request: FetchRequest) -> Result<FetchResponse> {
        let document = self.with_shard(&request.index_name, shard, |s| {
            s.and_then(|s| s.documents.get(&request.unique_id)).cloned()
        })?;
        match document {
            Some(document) => Ok(FetchResponse {
                found: true,
                document: serde_json::to_vec(&document)
                    .map_err(|e| Error::Internal(e.to_string()))?,
            }),
            None => Ok(FetchResponse::default()),
        }
    }

    async fn query(&self, shard: u32, request: &QueryRequest) -> Result<ShardQueryResponse> {
        let matcher = Matcher::parse(&request.query);
        let comparator = ResultComparator::new(&request.sort);
        let wanted = request.start.saturating_add(request.amount) as usize;

        self.with_shard(&request.index_name, shard, |s| -> Result<ShardQueryResponse> {
            let matched: Vec<(&String, &Value, f64)> = s
                .into_iter()
                .flat_map(|s| s.documents.iter())
                .filter_map(|(id, doc)| matcher.score(doc).map(|score| (id, doc, score)))
                .collect();

            let mut results: Vec<ScoredResult> = matched
                .iter()
                .enumerate()
                .map(|(ordinal, (id, doc, score))| ScoredResult {
                    unique_id: (*id).clone(),
                    index_name: request.index_name.clone(),
                    score: *score,
                    sort_values: request
                        .sort
                        .iter()
                        .map(|fs| {
                            if fs.field == SCORE_FIELD {
                                SortValue::missing()
                            } else {
                                sort_value(doc, &fs.field)
                            }
                        })
                        .collect(),
                    shard,
                    result_index: ordinal as u32,
                    document: Vec::new(),
                })
                .collect();
            comparator.sort(&mut results);
            results.truncate(wanted);

            let documents: HashMap<&str, &Value> =
                matched.iter().map(|(id, doc, _)| (id.as_str(), *doc)).collect();
            for (position, result) in results.iter_mut().enumerate() {
                result.result_index = position as u32;
                if request.fetch_documents {
                    if let Some(doc) = documents.get(result.unique_id.as_str()) {
                        result.document = serde_json::to_vec(doc).unwrap_or_default();
                    }
                }
            }

            let docs: Vec<&Value> = matched.iter().map(|(_, doc, _)| *doc).collect();
            Ok(ShardQueryResponse {
                index_name: request.index_name.clone(),
                shard_number: shard,
                total_hits: matched.len() as u64,
                results,
                stat_groups: request
                    .stat_requests
                    .iter()
                    .map(|r| stat_group(r, &docs))
                    .collect::<Result<_>>()?,
                facet_groups: request
                    .count_requests
                    .iter()
                    .map(|r| facet_group(r, &docs))
                    .collect(),
            })
        })?
    }

    async fn optimize(&self, index_name: &str, shard: u32) -> Result<()> {
        tracing::debug!("Optimize {}/{}: nothing to compact in memory", index_name, shard);
        Ok(())
    }

    async fn number_of_docs(&self, index_name: &str, shard: u32) -> Result<u64> {
        self.with_shard(index_name, shard, |s| {
            s.map(|s| s.documents.len() as u64).unwrap_or(0)
        })
    }

    async fn field_names(&self, index_name: &str, shard: u32) -> Result<Vec<String>> {
        self.with_shard(index_name, shard, |s| {
            let names: BTreeSet<String> = s
                .into_iter()
                .flat_map(|s| s.documents.values())
                .filter_map(Value::as_object)
                .flat_map(|o| o.keys().cloned())
                .collect();
            names.into_iter().collect()
        })
    }

    async fn terms(&self, shard: u32, request: &GetTermsRequest) -> Result<Vec<Term>> {
        self.with_shard(&request.index_name, shard, |s| {
            let mut terms: BTreeMap<String, Term> = BTreeMap::new();
            for document in s.into_iter().flat_map(|s| s.documents.values()) {
                let mut tokens: Vec<String> = match document.get(&request.field) {
                    Some(Value::Array(items)) => items.iter().flat_map(field_tokens).collect(),
                    Some(v) => field_tokens(v),
                    None => Vec::new(),
                };
                let occurrences = tokens.clone();
                tokens.sort();
                tokens.dedup();
                for token in tokens {
                    let term = terms.entry(token.clone()).or_insert_with(|| Term {
                        value: token.clone(),
                        ..Default::default()
                    });
                    term.doc_freq += 1;
                    term.term_freq += occurrences.iter().filter(|t| **t == token).count() as u64;
                }
            }
            terms.into_values().collect()
        })
    }

    async fn clear(&self, index_name: &str, shard: u32) -> Result<()> {
        self.write()?.remove(&(index_name.to_string(), shard));
        Ok(())
    }
}

fn field_tokens(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => tokenize(s).collect(),
        Value::Number(n) => vec![n.to_string()],
        Value::Bool(b) => vec![b.to_string()],
        _ => Vec::new(),
    }
}
