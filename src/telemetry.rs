//! The telemetry document as it travels through the broker and into storage.
//!
//! Transport and storage treat documents as schema-less JSON. The typed view in
//! [`TelemetryDocument`] is extracted leniently: missing or mistyped fields fall
//! back to defaults and never cause a document to be rejected.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryDocument {
    pub sat_id: String,
    pub orbit: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss_pct: Option<f64>,
}

impl Default for TelemetryDocument {
    fn default() -> Self {
        Self {
            sat_id: UNKNOWN.to_string(),
            orbit: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            ts: None,
            battery: None,
            link: None,
        }
    }
}

impl TelemetryDocument {
    /// Builds the typed view of an arbitrary JSON value. Non-objects yield all defaults.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        Self {
            sat_id: label_field(obj, "sat_id"),
            orbit: label_field(obj, "orbit"),
            region: label_field(obj, "region"),
            ts: obj.get("ts").and_then(Value::as_str).map(str::to_string),
            battery: obj.get("battery").and_then(number_field),
            link: obj.get("link").and_then(Value::as_object).map(|link| LinkStats {
                uplink_mbps: link.get("uplink_mbps").and_then(number_field),
                downlink_mbps: link.get("downlink_mbps").and_then(number_field),
                latency_ms: link.get("latency_ms").and_then(number_field),
                packet_loss_pct: link.get("packet_loss_pct").and_then(number_field),
            }),
        }
    }
}

/// A consumed message body after decoding.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub document: TelemetryDocument,
    /// What gets persisted. Valid JSON is kept as-is; anything else is kept as a
    /// JSON string holding the (lossy UTF-8) body.
    pub payload: Value,
    pub malformed: bool,
}

/// Decodes a message body. Never fails: unparsable bodies become all-default documents.
///
/// NUL characters are replaced with U+FFFD everywhere in the payload; `jsonb`
/// cannot store them.
pub fn decode(body: &[u8]) -> DecodedMessage {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => {
            let value = scrub_nul(value);
            let malformed = !value.is_object();
            DecodedMessage {
                document: TelemetryDocument::from_value(&value),
                payload: value,
                malformed,
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, len = body.len(), "undecodable telemetry body");
            DecodedMessage {
                document: TelemetryDocument::default(),
                payload: Value::String(replace_nul(String::from_utf8_lossy(body).into_owned())),
                malformed: true,
            }
        }
    }
}

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses an ISO-8601 instant. Offset-less timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M%:z") {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = raw.strip_suffix(['Z', 'z']).unwrap_or(raw);
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Ingest lag in seconds: `max(0, now - ts)`, or 0 when `ts` is absent or unparsable.
pub fn ingest_lag_seconds(ts: Option<&str>, now: DateTime<Utc>) -> f64 {
    let Some(generated_at) = ts.and_then(parse_timestamp) else {
        return 0.0;
    };
    let lag = (now - generated_at)
        .to_std()
        .map(|lag| lag.as_secs_f64())
        .unwrap_or(0.0);
    lag.max(0.0)
}

fn replace_nul(text: String) -> String {
    if text.contains('\0') {
        text.replace('\0', "\u{FFFD}")
    } else {
        text
    }
}

fn scrub_nul(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(replace_nul(text)),
        Value::Array(items) => Value::Array(items.into_iter().map(scrub_nul).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (replace_nul(key), scrub_nul(value)))
                .collect(),
        ),
        other => other,
    }
}

fn label_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => UNKNOWN.to_string(),
    }
}

fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn decodes_full_document() {
        let body = json!({
            "sat_id": "SAT-001",
            "orbit": "LEO",
            "region": "EU",
            "ts": "2024-05-01T12:00:00+00:00",
            "battery": 81.5,
            "link": {"uplink_mbps": 30.1, "downlink_mbps": 120.0, "latency_ms": 41.2, "packet_loss_pct": 0.2}
        });
        let decoded = decode(body.to_string().as_bytes());

        assert!(!decoded.malformed);
        assert_eq!(decoded.payload, body);
        assert_eq!(decoded.document.sat_id, "SAT-001");
        assert_eq!(decoded.document.battery, Some(81.5));
        let link = decoded.document.link.unwrap();
        assert_eq!(link.latency_ms, Some(41.2));
        assert_eq!(link.packet_loss_pct, Some(0.2));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let decoded = decode(br#"{"extra": [1, 2, 3]}"#);

        assert!(!decoded.malformed);
        assert_eq!(decoded.document, TelemetryDocument::default());
        assert_eq!(decoded.payload, json!({"extra": [1, 2, 3]}));
    }

    #[test]
    fn mistyped_fields_are_ignored_not_rejected() {
        let decoded = decode(br#"{"sat_id": 7, "battery": "55.5", "link": {"latency_ms": "fast", "uplink_mbps": null}}"#);

        assert_eq!(decoded.document.sat_id, "7");
        assert_eq!(decoded.document.battery, Some(55.5));
        assert_eq!(decoded.document.link, Some(LinkStats::default()));
    }

    #[test]
    fn garbage_body_is_absorbed() {
        let decoded = decode(b"\xff\xfenot json");

        assert!(decoded.malformed);
        assert_eq!(decoded.document, TelemetryDocument::default());
        assert!(decoded.payload.is_string());
    }

    #[test]
    fn non_object_json_is_malformed_but_kept() {
        let decoded = decode(b"[1,2]");

        assert!(decoded.malformed);
        assert_eq!(decoded.payload, json!([1, 2]));
        assert_eq!(decoded.document.sat_id, UNKNOWN);
    }

    #[test]
    fn nul_bytes_are_replaced_in_fallback_text() {
        let decoded = decode(b"garbage\x00body");

        assert!(decoded.malformed);
        assert_eq!(decoded.payload, json!("garbage\u{FFFD}body"));
    }

    #[test]
    fn nul_escapes_are_replaced_inside_json() {
        let decoded = decode(br#"{"sat_id": "a\u0000b", "tags": ["x\u0000"], "k\u0000": 1}"#);

        assert!(!decoded.malformed);
        assert_eq!(decoded.document.sat_id, "a\u{FFFD}b");
        assert_eq!(decoded.payload["tags"], json!(["x\u{FFFD}"]));
        assert!(decoded.payload.get("k\u{FFFD}").is_some());
        assert!(!decoded.payload.to_string().contains("\\u0000"));
    }

    #[test]
    fn big_numbers_keep_their_digits() {
        let decoded = decode(br#"{"sat_id": "SAT-001", "counter": 123456789012345678901234567890, "x": 1e400}"#);

        assert!(!decoded.malformed);
        assert_eq!(decoded.document.sat_id, "SAT-001");
        let text = decoded.payload.to_string();
        assert!(text.contains("123456789012345678901234567890"), "{text}");
        assert!(text.contains("1e400"), "{text}");
    }

    #[test]
    fn out_of_range_battery_is_ignored_not_fatal() {
        let decoded = decode(br#"{"sat_id": "SAT-001", "battery": 1e400}"#);

        assert!(!decoded.malformed);
        assert_eq!(decoded.document.battery, None);
    }

    #[test]
    fn lag_for_recent_timestamp() {
        let now = Utc::now();
        let ts = (now - Duration::seconds(5)).to_rfc3339();
        let lag = ingest_lag_seconds(Some(&ts), now);
        assert!((5.0..6.0).contains(&lag), "lag was {lag}");
    }

    #[test]
    fn lag_accepts_zulu_and_naive_timestamps() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:10Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(ingest_lag_seconds(Some("2024-05-01T12:00:00Z"), now), 10.0);
        assert_eq!(ingest_lag_seconds(Some("2024-05-01T12:00:00.500"), now), 9.5);
    }

    #[test]
    fn lag_accepts_minute_precision_timestamps() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:01:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(ingest_lag_seconds(Some("2024-05-01T12:00"), now), 60.0);
        assert_eq!(ingest_lag_seconds(Some("2024-05-01T12:00Z"), now), 60.0);
        assert_eq!(ingest_lag_seconds(Some("2024-05-01T14:00+02:00"), now), 60.0);
    }

    #[test]
    fn lag_is_zero_for_missing_malformed_or_future_ts() {
        let now = Utc::now();
        assert_eq!(ingest_lag_seconds(None, now), 0.0);
        assert_eq!(ingest_lag_seconds(Some("yesterday-ish"), now), 0.0);
        let future = (now + Duration::seconds(30)).to_rfc3339();
        assert_eq!(ingest_lag_seconds(Some(&future), now), 0.0);
    }

    #[test]
    fn serializes_without_absent_optionals() {
        let doc = TelemetryDocument {
            sat_id: "SAT-002".to_string(),
            ..TelemetryDocument::default()
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({"sat_id": "SAT-002", "orbit": "unknown", "region": "unknown"})
        );
    }
}
