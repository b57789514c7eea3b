//! Batch driver: parallel classification, grouping by key, then one
//! aggregation task per key.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::aggregate;
use crate::classifier::{Classification, Classifier};
use crate::diagnostics::DiagnosticSink;
use crate::models::{ClassifiedRecord, GroupKey, SummaryRecord};
use crate::source::InputRecord;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyCounts {
    pub relevant: usize,
    pub irrelevant: usize,
    pub rejected: usize,
}

impl ClassifyCounts {
    fn merge(&mut self, other: ClassifyCounts) {
        self.relevant += other.relevant;
        self.irrelevant += other.irrelevant;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedBatch {
    /// Emitted pairs in input order.
    pub pairs: Vec<(GroupKey, ClassifiedRecord)>,
    pub counts: ClassifyCounts,
}

#[derive(Debug, Clone)]
pub struct AggregatedBatch {
    /// Sorted by key.
    pub summaries: Vec<(GroupKey, SummaryRecord)>,
    pub records_in: usize,
    pub records_aggregated: usize,
    pub groups_dropped: usize,
}

impl AggregatedBatch {
    pub fn records_rejected(&self) -> usize {
        self.records_in - self.records_aggregated
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub records_read: usize,
    pub relevant: usize,
    pub irrelevant: usize,
    pub rejected_classify: usize,
    pub rejected_aggregate: usize,
    pub groups: usize,
    pub groups_dropped: usize,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub run_id: Uuid,
    pub summaries: Vec<(GroupKey, SummaryRecord)>,
    pub stats: BatchStats,
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Classify every record across `workers` blocking tasks. Rejections and
/// field warnings go to `sink`; only relevant records come back.
pub async fn classify_batch(
    records: Vec<InputRecord>,
    classifier: Arc<Classifier>,
    workers: usize,
    sink: Arc<dyn DiagnosticSink>,
) -> anyhow::Result<ClassifiedBatch> {
    let workers = workers.max(1);
    let chunk_size = records.len().div_ceil(workers).max(1);
    let (tx, mut rx) = mpsc::channel::<(usize, GroupKey, ClassifiedRecord)>(CHANNEL_CAPACITY);

    let mut tasks = JoinSet::new();
    let mut remaining = records.into_iter();
    loop {
        let chunk: Vec<InputRecord> = remaining.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }

        let classifier = Arc::clone(&classifier);
        let sink = Arc::clone(&sink);
        let tx = tx.clone();
        tasks.spawn_blocking(move || {
            let mut counts = ClassifyCounts::default();
            for record in chunk {
                let outcome = classifier.classify(&record.input);
                match &outcome {
                    Classification::Classified { .. } => counts.relevant += 1,
                    Classification::Irrelevant { .. } => counts.irrelevant += 1,
                    Classification::Rejected(_) => counts.rejected += 1,
                }
                if let Some((key, classified)) = outcome.report(record.position, &*sink) {
                    if tx.blocking_send((record.position, key, classified)).is_err() {
                        warn!("collector closed before classification finished");
                        break;
                    }
                }
            }
            counts
        });
    }
    drop(tx);

    let mut emitted = Vec::new();
    while let Some(item) = rx.recv().await {
        emitted.push(item);
    }

    let mut counts = ClassifyCounts::default();
    while let Some(joined) = tasks.join_next().await {
        counts.merge(joined?);
    }

    emitted.sort_by_key(|(position, _, _)| *position);
    let pairs = emitted
        .into_iter()
        .map(|(_, key, record)| (key, record))
        .collect();

    debug!(
        relevant = counts.relevant,
        irrelevant = counts.irrelevant,
        rejected = counts.rejected,
        "classification finished"
    );
    Ok(ClassifiedBatch { pairs, counts })
}

pub fn group_by_key(
    pairs: Vec<(GroupKey, ClassifiedRecord)>,
) -> HashMap<GroupKey, Vec<ClassifiedRecord>> {
    let mut groups: HashMap<GroupKey, Vec<ClassifiedRecord>> = HashMap::new();
    for (key, record) in pairs {
        groups.entry(key).or_default().push(record);
    }
    groups
}

/// Aggregate each group in its own task. Groups whose records were all
/// rejected produce no summary.
pub async fn aggregate_groups(
    groups: HashMap<GroupKey, Vec<ClassifiedRecord>>,
    sink: Arc<dyn DiagnosticSink>,
) -> anyhow::Result<AggregatedBatch> {
    let records_in: usize = groups.values().map(Vec::len).sum();
    let mut tasks = JoinSet::new();

    for (key, records) in groups {
        let sink = Arc::clone(&sink);
        tasks.spawn(async move {
            let result = aggregate(&key, records, &*sink);
            (key, result)
        });
    }

    let mut summaries = Vec::new();
    let mut groups_dropped = 0;
    while let Some(joined) = tasks.join_next().await {
        let (key, result) = joined?;
        match result {
            Ok(summary) => summaries.push((key, summary)),
            Err(err) => {
                warn!(key = %key, "{err}");
                groups_dropped += 1;
            }
        }
    }

    summaries.sort_by(|a, b| a.0.cmp(&b.0));
    let records_aggregated: usize = summaries.iter().map(|(_, summary)| summary.count).sum();

    Ok(AggregatedBatch {
        summaries,
        records_in,
        records_aggregated,
        groups_dropped,
    })
}

pub async fn run_batch(
    records: Vec<InputRecord>,
    classifier: Arc<Classifier>,
    workers: usize,
    sink: Arc<dyn DiagnosticSink>,
) -> anyhow::Result<BatchOutcome> {
    let run_id = Uuid::new_v4();
    let records_read = records.len();

    let classified = classify_batch(records, classifier, workers, Arc::clone(&sink)).await?;
    let counts = classified.counts;
    let groups = group_by_key(classified.pairs);
    let aggregated = aggregate_groups(groups, sink).await?;

    let stats = BatchStats {
        records_read,
        relevant: counts.relevant,
        irrelevant: counts.irrelevant,
        rejected_classify: counts.rejected,
        rejected_aggregate: aggregated.records_rejected(),
        groups: aggregated.summaries.len(),
        groups_dropped: aggregated.groups_dropped,
    };

    info!(
        run_id = %run_id,
        read = stats.records_read,
        relevant = stats.relevant,
        irrelevant = stats.irrelevant,
        rejected = stats.rejected_classify + stats.rejected_aggregate,
        groups = stats.groups,
        "batch complete"
    );

    Ok(BatchOutcome {
        run_id,
        summaries: aggregated.summaries,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RawInput;
    use crate::diagnostics::{CollectingSink, Stage};
    use crate::models::AlertLevel;
    use serde_json::json;

    fn line(position: usize, text: &str) -> InputRecord {
        InputRecord {
            position,
            input: RawInput::Text(text.to_string()),
        }
    }

    fn post(position: usize, location: &str, severity: u8, hour: u8) -> InputRecord {
        InputRecord {
            position,
            input: RawInput::Value(json!({
                "text": "wildfire spreading",
                "location": location,
                "disaster_type": "wildfire",
                "severity": severity,
                "timestamp": format!("2024-07-02T{hour:02}:00:00Z")
            })),
        }
    }

    #[tokio::test]
    async fn classification_preserves_input_order_across_workers() {
        let records: Vec<InputRecord> = (1..=40)
            .map(|i| post(i, &format!("Town {}", i % 3), 2, (i % 24) as u8))
            .collect();
        let sink: Arc<dyn DiagnosticSink> = Arc::new(CollectingSink::new());

        let batch = classify_batch(records, Arc::new(Classifier::default()), 7, sink)
            .await
            .unwrap();
        assert_eq!(batch.counts.relevant, 40);
        assert_eq!(batch.pairs.len(), 40);
        assert_eq!(batch.pairs[0].0, GroupKey::new("Town 1", "wildfire"));
        assert_eq!(batch.pairs[1].0, GroupKey::new("Town 2", "wildfire"));
    }

    #[tokio::test]
    async fn large_batch_with_few_workers_fills_the_channel_and_completes() {
        let total = CHANNEL_CAPACITY * 5;
        let records: Vec<InputRecord> = (1..=total)
            .map(|i| post(i, &format!("Town {}", i % 11), 1, (i % 24) as u8))
            .collect();
        let sink: Arc<dyn DiagnosticSink> = Arc::new(CollectingSink::new());

        let batch = classify_batch(records, Arc::new(Classifier::default()), 2, sink)
            .await
            .unwrap();
        assert_eq!(batch.counts.relevant, total);
        assert_eq!(batch.pairs.len(), total);
        for (index, (key, _)) in batch.pairs.iter().enumerate() {
            assert_eq!(key.location, format!("Town {}", (index + 1) % 11));
        }
    }

    #[tokio::test]
    async fn bad_lines_do_not_stop_the_batch() {
        let records = vec![
            line(1, "{not json"),
            post(2, "Hilltop", 5, 8),
            line(3, r#"{"text":"flood","location":"Hilltop"}"#),
            post(4, "Hilltop", 3, 9),
        ];
        let collected = Arc::new(CollectingSink::new());
        let sink: Arc<dyn DiagnosticSink> = collected.clone();

        let outcome = run_batch(records, Arc::new(Classifier::default()), 2, sink)
            .await
            .unwrap();

        assert_eq!(outcome.stats.records_read, 4);
        assert_eq!(outcome.stats.rejected_classify, 2);
        assert_eq!(outcome.stats.relevant, 2);
        assert_eq!(collected.rejections(Stage::Classify), 2);

        assert_eq!(outcome.summaries.len(), 1);
        let (key, summary) = &outcome.summaries[0];
        assert_eq!(key, &GroupKey::new("Hilltop", "wildfire"));
        assert_eq!(summary.count, 2);
        assert_eq!(summary.avg_severity, 4.0);
        assert_eq!(summary.alert_level, AlertLevel::High);
        assert_eq!(summary.last_updated, "2024-07-02T09:00:00Z");
    }

    #[tokio::test]
    async fn groups_are_aggregated_independently() {
        let mut groups = HashMap::new();
        groups.insert(
            GroupKey::new("A", "flood"),
            vec![ClassifiedRecord::relevant(json!({
                "text": "flood", "location": "A", "disaster_type": "flood",
                "timestamp": "2024-05-01T10:00:00Z", "severity": 1
            }))],
        );
        groups.insert(
            GroupKey::new("B", "flood"),
            vec![ClassifiedRecord::relevant(json!({"broken": true}))],
        );
        let sink: Arc<dyn DiagnosticSink> = Arc::new(CollectingSink::new());

        let batch = aggregate_groups(groups, sink).await.unwrap();
        assert_eq!(batch.summaries.len(), 1);
        assert_eq!(batch.summaries[0].0, GroupKey::new("A", "flood"));
        assert_eq!(batch.groups_dropped, 1);
        assert_eq!(batch.records_rejected(), 1);
    }

    #[tokio::test]
    async fn empty_input_produces_no_summaries() {
        let sink: Arc<dyn DiagnosticSink> = Arc::new(CollectingSink::new());
        let outcome = run_batch(Vec::new(), Arc::new(Classifier::default()), 4, sink)
            .await
            .unwrap();
        assert!(outcome.summaries.is_empty());
        assert_eq!(outcome.stats, BatchStats::default());
    }

    #[test]
    fn grouping_separates_keys_that_would_collide_as_strings() {
        let record = ClassifiedRecord::relevant(json!({}));
        let groups = group_by_key(vec![
            (GroupKey::new("a:b", "c"), record.clone()),
            (GroupKey::new("a", "b:c"), record.clone()),
            (GroupKey::new("a", "b:c"), record),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&GroupKey::new("a", "b:c")].len(), 2);
    }
}
