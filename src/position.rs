//! Position Module
//!
//! Position samples, the per-bus position table and the JSON wire format
//! used on the tracking topic.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// Bus name used when an inbound payload carries none
pub const UNKNOWN_BUS: &str = "Unknown";

/// One position fix attributed to a bus
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSample {
    pub bus_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_millis: i64,
}

impl PositionSample {
    /// Sample stamped with the current wall-clock time
    pub fn now(bus_id: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            bus_id: bus_id.to_string(),
            latitude,
            longitude,
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition<'a> {
    bus_name: &'a str,
    lat: f64,
    lng: f64,
    timestamp: i64,
}

/// Serialize a sample as `{"busName", "lat", "lng", "timestamp"}`
pub fn encode(sample: &PositionSample) -> Result<Vec<u8>, CodecError> {
    if !sample.latitude.is_finite() || !sample.longitude.is_finite() {
        return Err(CodecError::InvalidField("lat/lng"));
    }

    serde_json::to_vec(&WirePosition {
        bus_name: &sample.bus_id,
        lat: sample.latitude,
        lng: sample.longitude,
        timestamp: sample.timestamp_millis,
    })
    .map_err(|e| CodecError::NotJson(e.to_string()))
}

/// Parse an inbound payload.
///
/// `lat` and `lng` are required and may be numbers or numeric strings.
/// A missing `busName` reads as [`UNKNOWN_BUS`], a missing `timestamp` as 0.
pub fn decode(payload: &[u8]) -> Result<PositionSample, CodecError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| CodecError::NotJson(e.to_string()))?;
    let object = value.as_object().ok_or(CodecError::NotObject)?;

    let latitude = coordinate(object.get("lat"), "lat")?;
    let longitude = coordinate(object.get("lng"), "lng")?;

    let bus_id = match object.get("busName") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => UNKNOWN_BUS.to_string(),
    };

    let timestamp_millis = object
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    Ok(PositionSample {
        bus_id,
        latitude,
        longitude,
        timestamp_millis,
    })
}

fn coordinate(value: Option<&Value>, field: &'static str) -> Result<f64, CodecError> {
    let parsed = match value {
        None | Some(Value::Null) => return Err(CodecError::MissingField(field)),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    parsed
        .filter(|v| v.is_finite())
        .ok_or(CodecError::InvalidField(field))
}

/// Latest position per bus.
///
/// Never mutated in place: [`BusPositionTable::with`] returns a new table so
/// a reader holding the previous one never sees a partial update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusPositionTable {
    positions: HashMap<String, PositionSample>,
}

impl BusPositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this table with `sample` recorded for its bus
    pub fn with(&self, sample: PositionSample) -> Self {
        let mut positions = self.positions.clone();
        positions.insert(sample.bus_id.clone(), sample);
        Self { positions }
    }

    pub fn get(&self, bus_id: &str) -> Option<&PositionSample> {
        self.positions.get(bus_id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PositionSample> {
        self.positions.values()
    }
}

/// Wire payload errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),

    #[error("payload is not a JSON object")]
    NotObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}
