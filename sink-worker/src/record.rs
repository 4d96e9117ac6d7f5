use chrono::{DateTime, SecondsFormat, Utc};
use common_kafka::RawMessage;
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// One consumed message, decoded. The offset and partition identify it for the
/// rest of its life, and the payload field names become column names or the
/// body of an MQTT publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    partition: i32,
    offset: i64,
    key: Option<String>,
    payload: Map<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(
        partition: i32,
        offset: i64,
        key: Option<String>,
        payload: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            timestamp,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub(crate) fn remove_fields(&mut self, fields: &[String]) {
        for field in fields {
            self.payload.remove(field);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDecoder {
    unwrap_envelope: bool,
    timestamp_field: Option<String>,
}

impl RecordDecoder {
    pub fn new(unwrap_envelope: bool) -> Self {
        Self {
            unwrap_envelope,
            timestamp_field: None,
        }
    }

    /// Treats `field` as a nanosecond unix epoch. It is rewritten as an RFC 3339
    /// string and becomes the record timestamp.
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    /// Decodes a raw message into a record. The record timestamp comes from the
    /// configured payload field, then the broker timestamp, then `arrived_at`.
    pub fn decode(
        &self,
        message: RawMessage,
        arrived_at: DateTime<Utc>,
    ) -> Result<Record, DecodeError> {
        let payload = match message.payload {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(DecodeError::Empty),
        };

        let fields = match serde_json::from_slice::<Value>(&payload)? {
            Value::Object(fields) => fields,
            other => return Err(DecodeError::NotAnObject(json_kind(&other))),
        };
        let mut fields = if self.unwrap_envelope {
            unwrap_envelope(fields)
        } else {
            fields
        };

        let produced_at = self
            .timestamp_field
            .as_deref()
            .and_then(|field| convert_epoch_nanos(&mut fields, field));
        let timestamp = produced_at
            .or_else(|| {
                message
                    .timestamp_ms
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
            })
            .unwrap_or(arrived_at);
        let key = message
            .key
            .map(|key| String::from_utf8_lossy(&key).into_owned());

        Ok(Record::new(
            message.partition,
            message.offset,
            key,
            fields,
            timestamp,
        ))
    }
}

/// Some producers wrap the measurement in `{"value": ..., "dateTime": ...}`,
/// with `value` either an object or a json document serialized as a string.
/// The measurement fields are lifted to the top level and the producer time is
/// kept as `datetime_produced`. Anything else is returned untouched.
fn unwrap_envelope(mut outer: Map<String, Value>) -> Map<String, Value> {
    let mut inner = match outer.remove("value") {
        Some(Value::Object(inner)) => inner,
        Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(inner)) => inner,
            _ => {
                outer.insert("value".to_owned(), Value::String(text));
                return outer;
            }
        },
        Some(other) => {
            outer.insert("value".to_owned(), other);
            return outer;
        }
        None => return outer,
    };

    if let Some(produced) = outer.remove("dateTime") {
        inner.insert("datetime_produced".to_owned(), produced);
    }
    inner
}

/// Values that are not a number of nanoseconds are left as they are.
fn convert_epoch_nanos(fields: &mut Map<String, Value>, field: &str) -> Option<DateTime<Utc>> {
    let value = fields.get_mut(field)?;
    let nanos = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    let Some(nanos) = nanos else {
        tracing::debug!(field, "payload timestamp is not a nanosecond epoch, keeping it");
        return None;
    };

    let at = DateTime::<Utc>::from_timestamp_nanos(nanos);
    *value = Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    Some(at)
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(payload: &str) -> RawMessage {
        RawMessage {
            partition: 2,
            offset: 17,
            key: Some(b"inverter-1".to_vec()),
            payload: Some(payload.as_bytes().to_vec()),
            timestamp_ms: Some(1_700_000_000_000),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_800_000_000, 0).unwrap()
    }

    #[test]
    fn decodes_a_flat_object() {
        let record = RecordDecoder::new(false)
            .decode(raw(r#"{"panel_id":"p1","power":12.5,"ok":true}"#), now())
            .unwrap();

        assert_eq!(record.partition(), 2);
        assert_eq!(record.offset(), 17);
        assert_eq!(record.key(), Some("inverter-1"));
        assert_eq!(record.payload()["power"], json!(12.5));
        assert_eq!(record.timestamp().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn falls_back_to_arrival_time() {
        let mut message = raw(r#"{"a":1}"#);
        message.timestamp_ms = None;

        let record = RecordDecoder::new(false).decode(message, now()).unwrap();
        assert_eq!(record.timestamp(), now());
    }

    #[test]
    fn rejects_non_objects() {
        let decoder = RecordDecoder::new(false);

        assert!(matches!(
            decoder.decode(raw("[1,2,3]"), now()),
            Err(DecodeError::NotAnObject("array"))
        ));
        assert!(matches!(
            decoder.decode(raw("not json"), now()),
            Err(DecodeError::Json(_))
        ));

        let mut empty = raw("");
        empty.payload = None;
        assert!(matches!(
            decoder.decode(empty, now()),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn unwraps_string_envelopes() {
        let payload = json!({
            "value": "{\"panel_id\":\"p1\",\"power\":3}",
            "dateTime": "2024-05-01T10:00:00Z",
        })
        .to_string();

        let record = RecordDecoder::new(true).decode(raw(&payload), now()).unwrap();

        assert_eq!(record.payload()["panel_id"], json!("p1"));
        assert_eq!(record.payload()["power"], json!(3));
        assert_eq!(
            record.payload()["datetime_produced"],
            json!("2024-05-01T10:00:00Z")
        );
        assert!(!record.payload().contains_key("value"));
    }

    #[test]
    fn unwraps_object_envelopes() {
        let payload = json!({"value": {"power": 1}}).to_string();

        let record = RecordDecoder::new(true).decode(raw(&payload), now()).unwrap();

        assert_eq!(record.payload().len(), 1);
        assert_eq!(record.payload()["power"], json!(1));
    }

    #[test]
    fn converts_nanosecond_timestamps() {
        let decoder = RecordDecoder::new(false).with_timestamp_field("timestamp");

        let record = decoder
            .decode(
                raw(r#"{"panel_id":"p1","timestamp":1714557600123456789}"#),
                now(),
            )
            .unwrap();

        assert_eq!(
            record.payload()["timestamp"],
            json!("2024-05-01T10:00:00.123456789Z")
        );
        assert_eq!(
            record.timestamp().timestamp_nanos_opt(),
            Some(1_714_557_600_123_456_789)
        );
    }

    #[test]
    fn converts_string_and_float_timestamps() {
        let decoder = RecordDecoder::new(false).with_timestamp_field("ts");

        let from_string = decoder
            .decode(raw(r#"{"ts":"1714557600000000000"}"#), now())
            .unwrap();
        assert_eq!(from_string.payload()["ts"], json!("2024-05-01T10:00:00Z"));

        let from_float = decoder
            .decode(raw(r#"{"ts":1.7145576e18}"#), now())
            .unwrap();
        assert_eq!(from_float.payload()["ts"], json!("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn unconvertible_timestamps_are_kept() {
        let decoder = RecordDecoder::new(false).with_timestamp_field("timestamp");

        let record = decoder
            .decode(raw(r#"{"timestamp":"yesterday","power":2}"#), now())
            .unwrap();
        assert_eq!(record.payload()["timestamp"], json!("yesterday"));
        assert_eq!(record.timestamp().timestamp_millis(), 1_700_000_000_000);

        let missing = decoder.decode(raw(r#"{"power":2}"#), now()).unwrap();
        assert!(!missing.payload().contains_key("timestamp"));
        assert_eq!(missing.timestamp().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn timestamps_are_left_alone_by_default() {
        let record = RecordDecoder::new(false)
            .decode(raw(r#"{"timestamp":1714557600000000000}"#), now())
            .unwrap();

        assert_eq!(record.payload()["timestamp"], json!(1_714_557_600_000_000_000_i64));
        assert_eq!(record.timestamp().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn converts_timestamps_inside_envelopes() {
        let payload = json!({
            "value": {"timestamp": 1_714_557_600_000_000_000_i64, "power": 3},
            "dateTime": "2024-05-01T10:00:01Z",
        })
        .to_string();

        let record = RecordDecoder::new(true)
            .with_timestamp_field("timestamp")
            .decode(raw(&payload), now())
            .unwrap();

        assert_eq!(record.payload()["timestamp"], json!("2024-05-01T10:00:00Z"));
        assert_eq!(
            record.payload()["datetime_produced"],
            json!("2024-05-01T10:00:01Z")
        );
    }

    #[test]
    fn leaves_non_envelopes_alone() {
        let decoder = RecordDecoder::new(true);

        let plain = decoder.decode(raw(r#"{"power":1}"#), now()).unwrap();
        assert_eq!(plain.payload().len(), 1);

        let scalar_value = decoder
            .decode(raw(r#"{"value":"hello","other":2}"#), now())
            .unwrap();
        assert_eq!(scalar_value.payload()["value"], json!("hello"));
        assert_eq!(scalar_value.payload()["other"], json!(2));
    }
}
