use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use simd_json::prelude::ValueAsScalar;
use simd_json::{BorrowedValue, StaticNode};
use std::fmt;
use thiserror::Error;

/// A message exactly as the broker delivered it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadingKind {
    Temperature,
    RelativeHumidity,
    /// Any other kind segment. Parsed so the sink can log and drop it.
    Unknown(String),
}

impl ReadingKind {
    pub fn from_segment(segment: &str) -> Self {
        match segment {
            "temperature" => Self::Temperature,
            "relative-humidity" => Self::RelativeHumidity,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Temperature => "temperature",
            Self::RelativeHumidity => "relative-humidity",
            Self::Unknown(raw) => raw,
        }
    }

    /// Payload field holding the value: the kind with hyphens replaced by underscores.
    pub fn value_field(&self) -> String {
        self.as_str().replace('-', "_")
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    pub timestamp: DateTime<FixedOffset>,
    pub kind: ReadingKind,
    pub value: Option<f64>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("topic {topic:?} does not have exactly three segments")]
    Topic { topic: String },
    #[error("payload is not a JSON object: {reason}")]
    Payload { reason: String },
    #[error("timestamp {raw:?} is not ISO-8601 with an offset")]
    Timestamp { raw: String },
    #[error("payload is missing the {field:?} field")]
    MissingField { field: String },
    #[error("field {field:?} is neither a number nor null")]
    InvalidValue { field: String },
}

/// Parses `prefix/device/kind` plus a JSON payload into a [`Reading`].
pub fn parse_message(topic: &str, payload: &[u8]) -> Result<Reading, ParseError> {
    let parts: Vec<&str> = topic.split('/').collect();
    let [_, device, kind] = parts.as_slice() else {
        return Err(ParseError::Topic {
            topic: topic.to_string(),
        });
    };
    let kind = ReadingKind::from_segment(kind);

    let mut buffer = payload.to_vec();
    let value = simd_json::to_borrowed_value(&mut buffer).map_err(|err| ParseError::Payload {
        reason: err.to_string(),
    })?;
    let BorrowedValue::Object(obj) = &value else {
        return Err(ParseError::Payload {
            reason: "top-level value is not an object".to_string(),
        });
    };

    let raw_ts = obj
        .get("timestamp")
        .ok_or_else(|| ParseError::MissingField {
            field: "timestamp".to_string(),
        })?
        .as_str()
        .ok_or_else(|| ParseError::Timestamp {
            raw: "<non-string>".to_string(),
        })?;
    let timestamp = parse_timestamp(raw_ts)?;

    let field = kind.value_field();
    let raw_value = obj
        .get(field.as_str())
        .ok_or_else(|| ParseError::MissingField {
            field: field.clone(),
        })?;
    let value = if matches!(raw_value, BorrowedValue::Static(StaticNode::Null)) {
        None
    } else {
        let number = raw_value
            .as_f64()
            .or_else(|| raw_value.as_i64().map(|v| v as f64))
            .or_else(|| raw_value.as_u64().map(|v| v as f64))
            .ok_or(ParseError::InvalidValue { field })?;
        Some(number)
    };

    Ok(Reading {
        device: device.to_string(),
        timestamp,
        kind,
        value,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, ParseError> {
    let trimmed = raw.trim();
    DateTime::parse_from_rfc3339(trimmed)
        .or_else(|_| DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map_err(|_| ParseError::Timestamp {
            raw: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parses_temperature_reading() {
        let reading = parse_message(
            "devices/kitchen/temperature",
            br#"{"timestamp":"2023-01-01T12:00:00+00:00","temperature":21.5}"#,
        )
        .expect("parsed");
        assert_eq!(reading.device, "kitchen");
        assert_eq!(reading.kind, ReadingKind::Temperature);
        assert_eq!(reading.value, Some(21.5));
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn humidity_value_field_uses_underscores() {
        let reading = parse_message(
            "devices/cellar/relative-humidity",
            br#"{"timestamp":"2023-06-01 08:30:00+02:00","relative_humidity":61}"#,
        )
        .expect("parsed");
        assert_eq!(reading.kind, ReadingKind::RelativeHumidity);
        assert_eq!(reading.value, Some(61.0));
        assert_eq!(reading.timestamp.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn null_value_is_kept_as_none() {
        let reading = parse_message(
            "devices/attic/temperature",
            br#"{"timestamp":"2023-01-01T00:00:00Z","temperature":null}"#,
        )
        .expect("parsed");
        assert_eq!(reading.value, None);
    }

    #[test]
    fn unknown_kind_still_parses() {
        let reading = parse_message(
            "devices/garage/pressure",
            br#"{"timestamp":"2023-01-01T00:00:00Z","pressure":1013.2}"#,
        )
        .expect("parsed");
        assert_eq!(reading.kind, ReadingKind::Unknown("pressure".to_string()));
    }

    #[test]
    fn rejects_wrong_segment_count() {
        let err = parse_message("devices/kitchen", br#"{}"#).unwrap_err();
        assert!(matches!(err, ParseError::Topic { .. }));
        let err = parse_message("a/b/c/d", br#"{}"#).unwrap_err();
        assert!(matches!(err, ParseError::Topic { .. }));
    }

    #[test]
    fn rejects_missing_timestamp() {
        let err = parse_message("devices/kitchen/temperature", br#"{"temperature":21.5}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingField { ref field } if field == "timestamp"));
    }

    #[test]
    fn rejects_timestamp_without_offset() {
        let err = parse_message(
            "devices/kitchen/temperature",
            br#"{"timestamp":"2023-01-01T12:00:00","temperature":21.5}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Timestamp { .. }));
    }

    #[test]
    fn rejects_missing_value_field_and_bad_json() {
        let err = parse_message(
            "devices/kitchen/relative-humidity",
            br#"{"timestamp":"2023-01-01T12:00:00Z","relative-humidity":40}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::MissingField { ref field } if field == "relative_humidity"));

        let err = parse_message("devices/kitchen/temperature", b"not json").unwrap_err();
        assert!(matches!(err, ParseError::Payload { .. }));

        let err = parse_message(
            "devices/kitchen/temperature",
            br#"{"timestamp":"2023-01-01T12:00:00Z","temperature":"warm"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { .. }));
    }
}
