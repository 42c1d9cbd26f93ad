use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const DEFAULT_UNIT: &str = "ADC";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub id: String,
    pub display_name: String,
    pub location_key: String,
    pub value: f64,
    pub unit: String,
    pub captured_at: DateTime<Utc>,
    pub online: bool,
}

/// Complete fleet membership observed in one ingestion cycle. A new snapshot
/// replaces the previous one; sensors missing from it are gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub readings: Vec<SensorReading>,
    pub captured_at: DateTime<Utc>,
    pub connected: bool,
}

impl FleetSnapshot {
    pub fn new(readings: Vec<SensorReading>, captured_at: DateTime<Utc>) -> Self {
        Self {
            readings,
            captured_at,
            connected: true,
        }
    }

    pub fn disconnected(captured_at: DateTime<Utc>) -> Self {
        Self {
            readings: Vec::new(),
            captured_at,
            connected: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MalformedReading {
    #[error("reading is not a JSON object")]
    NotAnObject,
    #[error("reading has no id")]
    MissingId,
    #[error("reading {id} has no numeric value")]
    MissingValue { id: String },
}

const NAME_FIELDS: &[&str] = &["displayName", "display_name", "name"];
const LOCATION_FIELDS: &[&str] = &["locationKey", "location_key", "location"];
const TIMESTAMP_FIELDS: &[&str] = &["capturedAt", "captured_at", "timestamp"];

type WireMap = serde_json::Map<String, JsonValue>;

fn text_field(map: &WireMap, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        map.get(*key)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn timestamp_field(map: &WireMap, keys: &[&str], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|key| match map.get(*key)? {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(ms) => Some(millis_to_dt(ms, now)),
            None => n
                .as_f64()
                .filter(|ms| ms.is_finite())
                .map(|ms| millis_to_dt(ms as i64, now)),
        },
        _ => None,
    })
}

fn online_field(map: &WireMap) -> bool {
    if let Some(online) = map.get("online").and_then(JsonValue::as_bool) {
        return online;
    }
    match map.get("status").and_then(JsonValue::as_str) {
        Some(status) => !status.trim().eq_ignore_ascii_case("offline"),
        None => true,
    }
}

fn millis_to_dt(ms: i64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(fallback)
}

fn id_text(raw: &JsonValue) -> Option<String> {
    let text = match raw {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Normalizes one raw reading into the canonical shape. The id is namespaced
/// by `source_id`; the location key keeps the raw identity so the same
/// physical sensor groups together if sources are remapped.
pub fn normalize_reading(
    source_id: &str,
    raw: &JsonValue,
    now: DateTime<Utc>,
) -> Result<SensorReading, MalformedReading> {
    let map = raw.as_object().ok_or(MalformedReading::NotAnObject)?;

    let raw_id = map
        .get("id")
        .and_then(id_text)
        .ok_or(MalformedReading::MissingId)?;
    let value = map
        .get("value")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| MalformedReading::MissingValue { id: raw_id.clone() })?;

    let display_name = text_field(map, NAME_FIELDS).unwrap_or_else(|| raw_id.clone());
    let location_key = text_field(map, LOCATION_FIELDS).unwrap_or_else(|| raw_id.clone());
    let unit = text_field(map, &["unit"]).unwrap_or_else(|| DEFAULT_UNIT.to_string());
    let captured_at = timestamp_field(map, TIMESTAMP_FIELDS, now).unwrap_or(now);
    let online = online_field(map);

    Ok(SensorReading {
        id: format!("{source_id}:{raw_id}"),
        display_name,
        location_key,
        value,
        unit,
        captured_at,
        online,
    })
}

/// Accepts an array of readings, a single reading object, or an object that
/// wraps the array under `sensors`, `readings` or `data`. Malformed entries are
/// logged and dropped.
pub fn normalize_payload(
    source_id: &str,
    payload: &JsonValue,
    now: DateTime<Utc>,
) -> Vec<SensorReading> {
    let items: Vec<&JsonValue> = match payload {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(map) => {
            match ["sensors", "readings", "data"]
                .iter()
                .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            {
                Some(items) => items.iter().collect(),
                None => vec![payload],
            }
        }
        _ => {
            tracing::warn!(source = source_id, "payload is neither an object nor an array");
            return Vec::new();
        }
    };

    let mut readings = Vec::with_capacity(items.len());
    for item in items {
        match normalize_reading(source_id, item, now) {
            Ok(reading) => readings.push(reading),
            Err(err) => {
                tracing::warn!(source = source_id, error=%err, "dropping malformed reading");
            }
        }
    }
    readings
}

pub fn parse_payload_bytes(payload: &mut [u8]) -> Result<JsonValue, simd_json::Error> {
    simd_json::serde::from_slice(payload)
}
