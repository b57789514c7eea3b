//! Per-record error taxonomy and the side channel rejected records are reported to.
//!
//! Nothing in here aborts a run. Both stages hand their failures to a
//! [`DiagnosticSink`] and carry on with the next record.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::models::GroupKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("invalid optional field `{field}`: {found}")]
    InvalidOptionalField { field: &'static str, found: String },
}

impl RecordError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn invalid_field(field: &'static str, found: &Value) -> Self {
        Self::InvalidOptionalField {
            field,
            found: found.to_string(),
        }
    }

    /// Whether the record was dropped because of this error.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RecordError::Malformed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("aggregation invoked for {key} with no records")]
    EmptyGroup { key: GroupKey },
    #[error("all {rejected} records for {key} were rejected")]
    NoValidRecords { key: GroupKey, rejected: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Source,
    Classify,
    Aggregate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Classify => "classify",
            Stage::Aggregate => "aggregate",
        };
        f.write_str(name)
    }
}

/// One reported problem. `position` is the input line (source/classify) or
/// the index within the group (aggregate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub stage: Stage,
    pub position: usize,
    pub key: Option<GroupKey>,
    pub error: RecordError,
}

impl Diagnostic {
    pub fn new(stage: Stage, position: usize, error: RecordError) -> Self {
        Self {
            stage,
            position,
            key: None,
            error,
        }
    }

    pub fn with_key(mut self, key: GroupKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// The error channel. Shared by every classifier and aggregator worker.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn report(&self, diagnostic: Diagnostic) {
        (**self).report(diagnostic)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        let key = diagnostic
            .key
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        warn!(
            stage = %diagnostic.stage,
            position = diagnostic.position,
            key = %key,
            dropped = diagnostic.error.is_rejection(),
            "{}",
            diagnostic.error
        );
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rejections(&self, stage: Stage) -> usize {
        self.snapshot()
            .iter()
            .filter(|diagnostic| diagnostic.stage == stage && diagnostic.error.is_rejection())
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) {
        // A panicking reporter cannot leave the vector half-written.
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticCounts {
    pub source_rejected: usize,
    pub classify_rejected: usize,
    pub aggregate_rejected: usize,
    pub field_warnings: usize,
}

/// Counts rejections per stage and forwards everything to an inner sink.
pub struct CountingSink {
    inner: Arc<dyn DiagnosticSink>,
    source_rejected: AtomicUsize,
    classify_rejected: AtomicUsize,
    aggregate_rejected: AtomicUsize,
    field_warnings: AtomicUsize,
}

impl CountingSink {
    pub fn new(inner: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            inner,
            source_rejected: AtomicUsize::new(0),
            classify_rejected: AtomicUsize::new(0),
            aggregate_rejected: AtomicUsize::new(0),
            field_warnings: AtomicUsize::new(0),
        }
    }

    pub fn counts(&self) -> DiagnosticCounts {
        DiagnosticCounts {
            source_rejected: self.source_rejected.load(Ordering::Relaxed),
            classify_rejected: self.classify_rejected.load(Ordering::Relaxed),
            aggregate_rejected: self.aggregate_rejected.load(Ordering::Relaxed),
            field_warnings: self.field_warnings.load(Ordering::Relaxed),
        }
    }
}

impl DiagnosticSink for CountingSink {
    fn report(&self, diagnostic: Diagnostic) {
        let counter = if !diagnostic.error.is_rejection() {
            &self.field_warnings
        } else {
            match diagnostic.stage {
                Stage::Source => &self.source_rejected,
                Stage::Classify => &self.classify_rejected,
                Stage::Aggregate => &self.aggregate_rejected,
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.inner.report(diagnostic);
    }
}
