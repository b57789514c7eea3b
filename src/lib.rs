//! Relevance classification and per-location alert aggregation for
//! disaster-related social media posts.
//!
//! ```text
//! source (NDJSON / JSON array / CSV)
//!     ↓
//! Classifier  (keywords, severity, retweets, verified)   ── rejects ──┐
//!     ↓ (GroupKey, ClassifiedRecord)                                  │
//! group by (location, disaster_type)                                  ├→ DiagnosticSink
//!     ↓                                                               │
//! aggregate   (count, avg severity, verified, last update) ── rejects ┘
//!     ↓
//! SummaryRecord + AlertLevel
//! ```

pub mod aggregator;
pub mod classifier;
pub mod diagnostics;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod source;

pub use aggregator::{aggregate, alert_level, FoldOutcome, SummaryAccumulator};
pub use classifier::{Classification, Classifier, ClassifierConfig, KeywordSet, RawInput};
pub use diagnostics::{
    AggregateError, CollectingSink, CountingSink, Diagnostic, DiagnosticSink, RecordError, Stage,
    TracingSink,
};
pub use models::{AlertLevel, ClassifiedRecord, GroupKey, RawRecord, SummaryRecord};
pub use pipeline::{run_batch, BatchOutcome, BatchStats};
