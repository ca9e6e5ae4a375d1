//! Usage-statistics and operation aggregation over observed queries.
//!
//! Usage buckets reads per dataset per UTC day; operations record writes,
//! deduplicated by `(dataset, query id)` with the later observation winning.
//! Both emit in deterministic order.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::models::{MetadataChange, QueryId, QueryType};
use crate::urn::UserUrn;

/// Timestamp floored to the start of its UTC day, in epoch millis.
fn day_bucket_millis(ts: DateTime<Utc>) -> i64 {
    let millis = ts.timestamp_millis();
    const DAY: i64 = 24 * 60 * 60 * 1000;
    millis.div_euclid(DAY) * DAY
}

#[derive(Debug, Default)]
struct UsageBucket {
    total_queries: u64,
    write_queries: u64,
    user_counts: BTreeMap<UserUrn, u64>,
    query_counts: HashMap<QueryId, (String, u64)>,
}

#[derive(Debug, Serialize)]
struct UserUsageCount {
    user: UserUrn,
    count: u64,
}

#[derive(Debug, Serialize)]
struct DatasetUsageStatistics {
    timestamp_millis: i64,
    total_sql_queries: u64,
    total_write_queries: u64,
    unique_user_count: usize,
    user_counts: Vec<UserUsageCount>,
    top_sql_queries: Vec<String>,
}

/// Per-dataset, per-day read counters.
#[derive(Debug)]
pub struct UsageAggregator {
    top_n: usize,
    buckets: BTreeMap<(String, i64), UsageBucket>,
}

impl UsageAggregator {
    pub fn new(top_n: usize) -> Self {
        Self {
            top_n,
            buckets: BTreeMap::new(),
        }
    }

    /// Counts one query's reads against every dataset it touched.
    /// Observations without a timestamp cannot be bucketed and are skipped.
    pub fn record<'a>(
        &mut self,
        datasets: impl IntoIterator<Item = &'a str>,
        timestamp: Option<DateTime<Utc>>,
        user: Option<&UserUrn>,
        query_id: &QueryId,
        query_text: &str,
    ) {
        let Some(ts) = timestamp else {
            return;
        };
        let bucket_ms = day_bucket_millis(ts);
        for dataset in datasets {
            let bucket = self
                .buckets
                .entry((dataset.to_string(), bucket_ms))
                .or_default();
            bucket.total_queries += 1;
            if let Some(user) = user {
                *bucket.user_counts.entry(user.clone()).or_default() += 1;
            }
            let slot = bucket
                .query_counts
                .entry(query_id.clone())
                .or_insert_with(|| (query_text.to_string(), 0));
            slot.1 += 1;
        }
    }

    /// Counts one write against the dataset it targeted.
    pub fn record_write(&mut self, dataset: &str, timestamp: Option<DateTime<Utc>>) {
        let Some(ts) = timestamp else {
            return;
        };
        let bucket = self
            .buckets
            .entry((dataset.to_string(), day_bucket_millis(ts)))
            .or_default();
        bucket.write_queries += 1;
    }

    pub fn gen_metadata(&self) -> Vec<MetadataChange> {
        self.buckets
            .iter()
            .map(|((dataset, bucket_ms), bucket)| {
                let top_sql_queries: Vec<String> = bucket
                    .query_counts
                    .values()
                    .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
                    .take(self.top_n)
                    .map(|(text, _)| text.clone())
                    .collect();
                let aspect = DatasetUsageStatistics {
                    timestamp_millis: *bucket_ms,
                    total_sql_queries: bucket.total_queries,
                    total_write_queries: bucket.write_queries,
                    unique_user_count: bucket.user_counts.len(),
                    user_counts: bucket
                        .user_counts
                        .iter()
                        .map(|(user, count)| UserUsageCount {
                            user: user.clone(),
                            count: *count,
                        })
                        .collect(),
                    top_sql_queries,
                };
                MetadataChange::new(dataset, "datasetUsageStatistics", &aspect)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct OperationRecord {
    operation: &'static str,
    timestamp: Option<DateTime<Utc>>,
    user: Option<UserUrn>,
    affected_rows: Option<u64>,
    ingested_at: u64,
}

#[derive(Debug, Serialize)]
struct Operation {
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp_millis: Option<i64>,
    operation_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<UserUrn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_affected_rows: Option<u64>,
    query_id: QueryId,
}

/// Write operations per dataset. A statement re-observed later (same query
/// id, same target) replaces the earlier record, so the freshest actor and
/// timestamp win.
#[derive(Debug, Default)]
pub struct OperationAggregator {
    ops: BTreeMap<(String, QueryId), OperationRecord>,
}

impl OperationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        dataset: &str,
        query_id: &QueryId,
        query_type: QueryType,
        timestamp: Option<DateTime<Utc>>,
        user: Option<&UserUrn>,
        affected_rows: Option<u64>,
        ingested_at: u64,
    ) {
        if !query_type.is_write() {
            return;
        }
        let key = (dataset.to_string(), query_id.clone());
        // The freshest occurrence wins: latest timestamp, then latest
        // ingestion, regardless of the order observations arrive in.
        if let Some(existing) = self.ops.get(&key) {
            if (existing.timestamp, existing.ingested_at) > (timestamp, ingested_at) {
                return;
            }
        }
        self.ops.insert(
            key,
            OperationRecord {
                operation: query_type.operation_name(),
                timestamp,
                user: user.cloned(),
                affected_rows,
                ingested_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn gen_metadata(&self) -> Vec<MetadataChange> {
        self.ops
            .iter()
            .sorted_by_key(|((dataset, id), rec)| {
                (dataset.clone(), rec.ingested_at, id.clone())
            })
            .map(|((dataset, id), rec)| {
                let aspect = Operation {
                    timestamp_millis: rec.timestamp.map(|t| t.timestamp_millis()),
                    operation_type: rec.operation,
                    actor: rec.user.clone(),
                    num_affected_rows: rec.affected_rows,
                    query_id: id.clone(),
                };
                MetadataChange::new(dataset, "operation", &aspect)
            })
            .collect()
    }
}
