//! Feature extraction from raw query-log payloads.
//!
//! MySQL slow-log shippers usually emit the statement metadata as a JSON
//! object in the `message` field. Anything that is not such an object is
//! treated as an empty payload and every feature falls back to its default.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::RowsFallback;
use crate::ingest::LogRecord;

/// Number of numeric features fed to the scorer.
pub const FEATURE_DIM: usize = 2;

/// Fixed-shape numeric summary of one log record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector {
    /// Execution time in seconds.
    pub query_time: f64,
    pub rows_examined: u64,
}

impl FeatureVector {
    pub fn to_point(&self) -> [f64; FEATURE_DIM] {
        [self.query_time, self.rows_examined as f64]
    }
}

/// Turns log records into feature vectors. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor {
    rows_fallback: RowsFallback,
}

impl FeatureExtractor {
    pub fn new(rows_fallback: RowsFallback) -> Self {
        Self { rows_fallback }
    }

    pub fn extract(&self, record: &LogRecord) -> FeatureVector {
        let payload = parse_payload(&record.raw_message);

        let query_time = payload
            .get("query_time")
            .and_then(coerce_f64)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.0);

        // Message length is a crude stand-in for rows scanned; it only keeps
        // the vector populated when the shipper dropped the field.
        let rows_examined = payload
            .get("rows_examined")
            .and_then(coerce_u64)
            .unwrap_or_else(|| match self.rows_fallback {
                RowsFallback::MessageLength => record.raw_message.chars().count() as u64,
                RowsFallback::Zero => 0,
            });

        FeatureVector {
            query_time,
            rows_examined,
        }
    }

    pub fn extract_all(&self, records: &[LogRecord]) -> Vec<FeatureVector> {
        records.iter().map(|r| self.extract(r)).collect()
    }
}

/// Parse the whole message as a JSON object, or failing that the outermost
/// `{...}` span inside it. Returns an empty map when neither works.
fn parse_payload(message: &str) -> Map<String, Value> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(message.trim()) {
        return map;
    }
    if let (Some(start), Some(end)) = (message.find('{'), message.rfind('}')) {
        if start < end {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&message[start..=end]) {
                return map;
            }
        }
    }
    Map::new()
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v.trunc() as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Bool(b) => Some(u64::from(*b)),
        _ => None,
    }
}
