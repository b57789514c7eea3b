//! Relevance decision for a single post.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::diagnostics::{Diagnostic, DiagnosticSink, RecordError, Stage};
use crate::models::{ClassifiedRecord, GroupKey, RawRecord};

pub const DEFAULT_KEYWORDS: [&str; 7] = [
    "flood",
    "earthquake",
    "hurricane",
    "wildfire",
    "tsunami",
    "tornado",
    "landslide",
];

pub const SEVERITY_THRESHOLD: u8 = 4;
pub const RETWEET_THRESHOLD: u64 = 100;

/// Immutable, lowercased keyword set matched by substring containment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordSet {
    keywords: BTreeSet<String>,
}

impl KeywordSet {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|keyword| keyword.as_ref().trim().to_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn matches(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(keyword.as_str()))
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(String::as_str)
    }
}

impl Default for KeywordSet {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
    pub keywords: KeywordSet,
}

/// An untyped input record: either a raw line still to be decoded, or an
/// already-structured value (CSV rows and JSON array elements).
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Text(String),
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Classified {
        key: GroupKey,
        record: ClassifiedRecord,
        warnings: Vec<RecordError>,
    },
    Irrelevant {
        warnings: Vec<RecordError>,
    },
    Rejected(RecordError),
}

impl Classification {
    /// Forward warnings and rejections to `sink`, keeping only an emitted pair.
    pub fn report(
        self,
        position: usize,
        sink: &dyn DiagnosticSink,
    ) -> Option<(GroupKey, ClassifiedRecord)> {
        match self {
            Classification::Classified {
                key,
                record,
                warnings,
            } => {
                for warning in warnings {
                    sink.report(
                        Diagnostic::new(Stage::Classify, position, warning).with_key(key.clone()),
                    );
                }
                Some((key, record))
            }
            Classification::Irrelevant { warnings } => {
                for warning in warnings {
                    sink.report(Diagnostic::new(Stage::Classify, position, warning));
                }
                None
            }
            Classification::Rejected(error) => {
                sink.report(Diagnostic::new(Stage::Classify, position, error));
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn classify(&self, input: &RawInput) -> Classification {
        match input {
            RawInput::Text(line) => match serde_json::from_str::<Value>(line) {
                Ok(value) => self.classify_value(value),
                Err(err) => Classification::Rejected(RecordError::malformed(format!(
                    "invalid JSON: {err}"
                ))),
            },
            RawInput::Value(value) => self.classify_value(value.clone()),
        }
    }

    pub fn classify_value(&self, value: Value) -> Classification {
        let parsed = match RawRecord::parse(&value) {
            Ok(parsed) => parsed,
            Err(err) => return Classification::Rejected(err),
        };

        if self.is_relevant(&parsed.record) {
            Classification::Classified {
                key: parsed.record.group_key(),
                record: ClassifiedRecord::relevant(value),
                warnings: parsed.warnings,
            }
        } else {
            Classification::Irrelevant {
                warnings: parsed.warnings,
            }
        }
    }

    /// Any one rule is enough. Absent optional fields never match.
    pub fn is_relevant(&self, record: &RawRecord) -> bool {
        self.config.keywords.matches(&record.text)
            || record
                .severity
                .is_some_and(|severity| severity >= SEVERITY_THRESHOLD)
            || record
                .retweet_count
                .is_some_and(|count| count > RETWEET_THRESHOLD)
            || record.verified_report == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use serde_json::json;

    fn post(text: &str) -> Value {
        json!({
            "text": text,
            "location": "Riverside",
            "disaster_type": "flood",
            "timestamp": "2024-05-01T10:00:00Z"
        })
    }

    fn with_field(text: &str, field: &str, value: Value) -> Value {
        let mut record = post(text);
        record.as_object_mut().unwrap().insert(field.to_string(), value);
        record
    }

    fn is_classified(outcome: &Classification) -> bool {
        matches!(outcome, Classification::Classified { .. })
    }

    #[test]
    fn keywords_match_case_insensitive_substrings() {
        let classifier = Classifier::default();
        assert!(is_classified(&classifier.classify_value(post("EARTHQUAKE downtown"))));
        assert!(is_classified(&classifier.classify_value(post("the floodgate opened"))));
        assert!(!is_classified(&classifier.classify_value(post("sunny weather"))));
    }

    #[test]
    fn optional_fields_make_record_relevant_without_keyword() {
        let classifier = Classifier::default();
        let cases = [
            ("severity", json!(4)),
            ("severity", json!(5)),
            ("retweet_count", json!(101)),
            ("verified_report", json!(true)),
        ];
        for (field, value) in cases {
            let outcome = classifier.classify_value(with_field("normal day", field, value.clone()));
            assert!(is_classified(&outcome), "{field}={value}");
        }
    }

    #[test]
    fn thresholds_are_exclusive_where_expected() {
        let classifier = Classifier::default();
        let cases = [
            ("severity", json!(3)),
            ("retweet_count", json!(100)),
            ("verified_report", json!(false)),
        ];
        for (field, value) in cases {
            let outcome = classifier.classify_value(with_field("normal day", field, value.clone()));
            assert!(!is_classified(&outcome), "{field}={value}");
        }
    }

    #[test]
    fn mistyped_optional_field_does_not_count() {
        let classifier = Classifier::default();
        let outcome = classifier.classify_value(with_field("normal day", "severity", json!("5")));
        match outcome {
            Classification::Irrelevant { warnings } => assert_eq!(warnings.len(), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn key_is_a_tuple_not_a_joined_string() {
        let classifier = Classifier::default();
        let a = json!({
            "text": "flood", "location": "Port:North", "disaster_type": "flood",
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let b = json!({
            "text": "flood", "location": "Port", "disaster_type": "North:flood",
            "timestamp": "2024-05-01T10:00:00Z"
        });

        let key_of = |value: Value| match classifier.classify_value(value) {
            Classification::Classified { key, .. } => key,
            other => panic!("unexpected outcome: {other:?}"),
        };

        let key_a = key_of(a.clone());
        assert_eq!(key_a, key_of(a));
        assert_ne!(key_a, key_of(b));
        assert_eq!(key_a, GroupKey::new("Port:North", "flood"));
    }

    #[test]
    fn invalid_json_is_rejected_and_reported() {
        let classifier = Classifier::default();
        let sink = CollectingSink::new();

        let outcome = classifier.classify(&RawInput::Text("{\"text\": \"flood".to_string()));
        assert!(matches!(outcome, Classification::Rejected(RecordError::Malformed(_))));
        assert!(outcome.report(7, &sink).is_none());

        let diagnostics = sink.snapshot();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].position, 7);
        assert_eq!(diagnostics[0].stage, Stage::Classify);
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let config = ClassifierConfig {
            keywords: KeywordSet::new([" Blizzard ", ""]),
        };
        let classifier = Classifier::new(config);
        assert_eq!(classifier.config().keywords.len(), 1);
        assert!(is_classified(&classifier.classify_value(post("blizzard warning"))));
        assert!(!is_classified(&classifier.classify_value(post("flood warning"))));
    }

    #[test]
    fn classified_record_keeps_original_payload() {
        let classifier = Classifier::default();
        let value = with_field("flood", "user_id", json!("u-1"));
        match classifier.classify(&RawInput::Value(value.clone())) {
            Classification::Classified { record, .. } => {
                assert!(record.relevant);
                assert_eq!(record.payload, value);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
