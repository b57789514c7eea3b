use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diagnostics::RecordError;

pub const MAX_SEVERITY: i64 = 5;

/// A social-media post as it arrives from the scraper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub text: String,
    pub location: String,
    pub disaster_type: String,
    pub severity: Option<u8>,
    pub retweet_count: Option<u64>,
    pub verified_report: Option<bool>,
    pub timestamp: String,
    pub user_id: Option<String>,
}

/// A decoded record plus the optional fields that were present but unusable.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub record: RawRecord,
    pub warnings: Vec<RecordError>,
}

impl RawRecord {
    /// Decode an untyped JSON object.
    ///
    /// Missing or non-string `text`, `location`, `disaster_type` or `timestamp`
    /// reject the whole record. Optional fields of the wrong type are dropped
    /// and reported in [`ParsedRecord::warnings`].
    pub fn parse(value: &Value) -> Result<ParsedRecord, RecordError> {
        let object = value
            .as_object()
            .ok_or_else(|| RecordError::malformed("record is not a JSON object"))?;

        let text = required_str(object, "text")?;
        let location = required_str(object, "location")?;
        let disaster_type = required_str(object, "disaster_type")?;
        let timestamp = required_str(object, "timestamp")?;

        let mut warnings = Vec::new();

        let severity = match object.get("severity") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_i64() {
                Some(level) if (0..=MAX_SEVERITY).contains(&level) => Some(level as u8),
                _ => {
                    warnings.push(RecordError::invalid_field("severity", value));
                    None
                }
            },
        };

        let retweet_count = match object.get("retweet_count") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(count) => Some(count),
                None => {
                    warnings.push(RecordError::invalid_field("retweet_count", value));
                    None
                }
            },
        };

        let verified_report = match object.get("verified_report") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(flag)) => Some(*flag),
            Some(value) => {
                warnings.push(RecordError::invalid_field("verified_report", value));
                None
            }
        };

        let user_id = match object.get("user_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(value) => {
                warnings.push(RecordError::invalid_field("user_id", value));
                None
            }
        };

        Ok(ParsedRecord {
            record: RawRecord {
                text,
                location,
                disaster_type,
                severity,
                retweet_count,
                verified_report,
                timestamp,
                user_id,
            },
            warnings,
        })
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.location.clone(), self.disaster_type.clone())
    }

    pub fn is_verified(&self) -> bool {
        self.verified_report == Some(true)
    }
}

fn required_str(object: &Map<String, Value>, field: &'static str) -> Result<String, RecordError> {
    match object.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(RecordError::malformed(format!("field `{field}` is not a string"))),
        None => Err(RecordError::malformed(format!("missing field `{field}`"))),
    }
}

/// Composite grouping identity. Equality and hashing are field-wise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub location: String,
    pub disaster_type: String,
}

impl GroupKey {
    pub fn new(location: impl Into<String>, disaster_type: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            disaster_type: disaster_type.into(),
        }
    }
}

// `location:disaster_type` with `\` and `:` escaped in both parts.
impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            escape_key_part(&self.location),
            escape_key_part(&self.disaster_type)
        )
    }
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for ch in part.chars() {
        if ch == '\\' || ch == ':' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// A relevant record in transit between classification and aggregation.
///
/// The payload is kept in its untyped form, the same way it crosses the
/// shuffle file, so the aggregator decodes it again on its side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    pub payload: Value,
    pub relevant: bool,
}

impl ClassifiedRecord {
    pub fn relevant(payload: Value) -> Self {
        Self {
            payload,
            relevant: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AlertLevel {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl AlertLevel {
    pub fn label(self) -> &'static str {
        match self {
            AlertLevel::Low => "low",
            AlertLevel::Medium => "medium",
            AlertLevel::High => "high",
        }
    }
}

impl From<AlertLevel> for u8 {
    fn from(level: AlertLevel) -> Self {
        level as u8
    }
}

impl TryFrom<u8> for AlertLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AlertLevel::Low),
            2 => Ok(AlertLevel::Medium),
            3 => Ok(AlertLevel::High),
            other => Err(format!("alert level must be 1, 2 or 3, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub location: String,
    pub disaster_type: String,
    pub count: usize,
    pub avg_severity: f64,
    pub verified_reports: usize,
    pub last_updated: String,
    pub alert_level: AlertLevel,
}

impl SummaryRecord {
    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.location.clone(), self.disaster_type.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_record() {
        let value = json!({
            "text": "Flood waters rising",
            "location": "Riverside",
            "disaster_type": "flood",
            "severity": 4,
            "retweet_count": 12,
            "verified_report": true,
            "timestamp": "2024-05-01T10:00:00Z",
            "user_id": "u-17"
        });

        let parsed = RawRecord::parse(&value).unwrap();
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.record.severity, Some(4));
        assert_eq!(parsed.record.retweet_count, Some(12));
        assert!(parsed.record.is_verified());
        assert_eq!(parsed.record.user_id.as_deref(), Some("u-17"));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        for field in ["text", "location", "disaster_type", "timestamp"] {
            let mut value = json!({
                "text": "t",
                "location": "l",
                "disaster_type": "d",
                "timestamp": "2024-05-01T10:00:00Z"
            });
            value.as_object_mut().unwrap().remove(field);
            let err = RawRecord::parse(&value).unwrap_err();
            assert!(matches!(err, RecordError::Malformed(_)), "{field}");
        }
    }

    #[test]
    fn non_string_required_field_is_malformed() {
        let value = json!({
            "text": "t",
            "location": 12,
            "disaster_type": "d",
            "timestamp": "2024-05-01T10:00:00Z"
        });
        assert!(matches!(
            RawRecord::parse(&value),
            Err(RecordError::Malformed(_))
        ));
        assert!(RawRecord::parse(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn bad_optional_fields_become_absent() {
        let value = json!({
            "text": "t",
            "location": "l",
            "disaster_type": "d",
            "timestamp": "2024-05-01T10:00:00Z",
            "severity": 9,
            "retweet_count": "lots",
            "verified_report": "yes",
            "user_id": null
        });

        let parsed = RawRecord::parse(&value).unwrap();
        assert_eq!(parsed.record.severity, None);
        assert_eq!(parsed.record.retweet_count, None);
        assert_eq!(parsed.record.verified_report, None);
        assert_eq!(parsed.record.user_id, None);
        assert_eq!(parsed.warnings.len(), 3);
    }

    #[test]
    fn loosely_typed_optional_fields_are_not_coerced() {
        let value = json!({
            "text": "t",
            "location": "l",
            "disaster_type": "d",
            "timestamp": "2024-05-01T10:00:00Z",
            "severity": 4.0,
            "retweet_count": "150",
            "verified_report": "true"
        });

        let parsed = RawRecord::parse(&value).unwrap();
        assert_eq!(parsed.record.severity, None);
        assert_eq!(parsed.record.retweet_count, None);
        assert_eq!(parsed.record.verified_report, None);
        assert_eq!(parsed.warnings.len(), 3);
    }

    #[test]
    fn key_display_is_unambiguous() {
        let a = GroupKey::new("Springfield:North", "flood");
        let b = GroupKey::new("Springfield", "North:flood");
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "Springfield\\:North:flood");
    }

    #[test]
    fn alert_level_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&AlertLevel::High).unwrap(), "3");
        let level: AlertLevel = serde_json::from_str("2").unwrap();
        assert_eq!(level, AlertLevel::Medium);
        assert!(serde_json::from_str::<AlertLevel>("4").is_err());
    }
}
