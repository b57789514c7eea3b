use chrono::{DateTime, NaiveDateTime};
use tracing::debug;

use crate::diagnostics::{AggregateError, Diagnostic, DiagnosticSink, RecordError, Stage};
use crate::models::{AlertLevel, ClassifiedRecord, GroupKey, RawRecord, SummaryRecord};

pub const HIGH_AVG_SEVERITY: f64 = 4.0;
pub const HIGH_COUNT: usize = 5;
pub const HIGH_VERIFIED: usize = 2;
pub const MEDIUM_AVG_SEVERITY: f64 = 3.0;
pub const MEDIUM_COUNT: usize = 2;
pub const MEDIUM_VERIFIED: usize = 1;

/// Result of folding one record into an accumulator.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    Aggregated,
    RecordRejected(RecordError),
}

#[derive(Debug, Clone)]
struct LatestTimestamp {
    value: String,
    parseable: bool,
}

/// Running totals for one group.
#[derive(Debug, Clone)]
pub struct SummaryAccumulator {
    key: GroupKey,
    count: usize,
    severity_sum: u64,
    verified_reports: usize,
    latest: Option<LatestTimestamp>,
    rejected: usize,
}

impl SummaryAccumulator {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            count: 0,
            severity_sum: 0,
            verified_reports: 0,
            latest: None,
            rejected: 0,
        }
    }

    pub fn fold(&mut self, record: &ClassifiedRecord) -> FoldOutcome {
        let parsed = match RawRecord::parse(&record.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.rejected += 1;
                return FoldOutcome::RecordRejected(err);
            }
        };

        let raw = parsed.record;
        if raw.location != self.key.location || raw.disaster_type != self.key.disaster_type {
            self.rejected += 1;
            return FoldOutcome::RecordRejected(RecordError::malformed(format!(
                "record belongs to {}, not {}",
                raw.group_key(),
                self.key
            )));
        }

        self.push(&raw);
        FoldOutcome::Aggregated
    }

    fn push(&mut self, record: &RawRecord) {
        self.count += 1;
        // Absent severity adds nothing but still counts toward the divisor.
        self.severity_sum += u64::from(record.severity.unwrap_or(0));
        if record.is_verified() {
            self.verified_reports += 1;
        }
        self.observe_timestamp(&record.timestamp);
    }

    fn observe_timestamp(&mut self, candidate: &str) {
        let candidate_parseable = is_iso8601(candidate);
        let replace = match &self.latest {
            None => true,
            Some(current) => {
                candidate_parseable
                    && (!current.parseable || candidate.as_bytes() > current.value.as_bytes())
            }
        };

        if replace {
            self.latest = Some(LatestTimestamp {
                value: candidate.to_string(),
                parseable: candidate_parseable,
            });
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn finish(self) -> Result<SummaryRecord, AggregateError> {
        let latest = match self.latest {
            Some(latest) if self.count > 0 => latest,
            _ => {
                return Err(if self.rejected == 0 {
                    AggregateError::EmptyGroup { key: self.key }
                } else {
                    AggregateError::NoValidRecords {
                        key: self.key,
                        rejected: self.rejected,
                    }
                })
            }
        };

        let avg_severity = self.severity_sum as f64 / self.count as f64;
        let alert_level = alert_level(avg_severity, self.count, self.verified_reports);

        Ok(SummaryRecord {
            location: self.key.location,
            disaster_type: self.key.disaster_type,
            count: self.count,
            avg_severity,
            verified_reports: self.verified_reports,
            last_updated: latest.value,
            alert_level,
        })
    }
}

/// Fold every record of one group into its summary.
///
/// Records that fail to decode are reported to `sink` and skipped.
pub fn aggregate<I>(
    key: &GroupKey,
    records: I,
    sink: &dyn DiagnosticSink,
) -> Result<SummaryRecord, AggregateError>
where
    I: IntoIterator<Item = ClassifiedRecord>,
{
    let mut accumulator = SummaryAccumulator::new(key.clone());

    for (position, record) in records.into_iter().enumerate() {
        if let FoldOutcome::RecordRejected(error) = accumulator.fold(&record) {
            sink.report(Diagnostic::new(Stage::Aggregate, position, error).with_key(key.clone()));
        }
    }

    debug!(
        key = %key,
        count = accumulator.count(),
        rejected = accumulator.rejected(),
        "group folded"
    );
    accumulator.finish()
}

/// First matching tier wins, checked High then Medium.
pub fn alert_level(avg_severity: f64, count: usize, verified_reports: usize) -> AlertLevel {
    if avg_severity >= HIGH_AVG_SEVERITY || count > HIGH_COUNT || verified_reports >= HIGH_VERIFIED
    {
        AlertLevel::High
    } else if avg_severity >= MEDIUM_AVG_SEVERITY
        || count > MEDIUM_COUNT
        || verified_reports >= MEDIUM_VERIFIED
    {
        AlertLevel::Medium
    } else {
        AlertLevel::Low
    }
}

pub fn is_iso8601(timestamp: &str) -> bool {
    DateTime::parse_from_rfc3339(timestamp).is_ok()
        || NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}
