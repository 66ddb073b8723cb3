//! Parsing of loosely-typed device records into typed samples
//!
//! Device parsers hand over one map per record: a timestamp string plus
//! whatever metrics the device wrote, under whatever name it used. This
//! module resolves the names, converts values, checks physiological ranges
//! and drops records that cannot be trusted.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::models::{RawSample, SampleFields, SourceStream, WorkoutInput};

/// One record exactly as a device parser produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: String,

    #[serde(flatten)]
    pub values: HashMap<String, serde_json::Value>,
}

/// All records from one source for one workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStream {
    pub source_id: String,

    /// Start time by the source's own clock, if the source reports one
    #[serde(default)]
    pub activity_start: Option<String>,

    #[serde(default)]
    pub records: Vec<RawRecord>,
}

/// Accepted value ranges; values outside are treated as sensor glitches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueLimits {
    pub heart_rate: (u16, u16),
    pub power: (u16, u16),
    pub cadence: (u16, u16),
    pub altitude_m: (Decimal, Decimal),
    pub speed_mps: (Decimal, Decimal),
}

impl Default for ValueLimits {
    fn default() -> Self {
        ValueLimits {
            heart_rate: (25, 250),
            power: (0, 2500),
            cadence: (0, 300),
            altitude_m: (Decimal::from(-500), Decimal::from(9000)),
            speed_mps: (Decimal::ZERO, Decimal::from(40)),
        }
    }
}

/// Outcome of parsing one stream
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedStream {
    pub stream: SourceStream,

    /// Records dropped because the timestamp or a value was unparsable
    pub dropped_records: usize,

    /// Individual values discarded for being out of range
    pub rejected_values: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    HeartRate,
    Power,
    Cadence,
    RunCadence,
    FormPower,
    AirPower,
    Altitude,
    Distance,
    Speed,
}

impl Field {
    /// Resolve the names used across device exports
    fn from_key(key: &str) -> Option<Field> {
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "heartrate" | "heartratebpm" | "hr" | "bpm" => Some(Field::HeartRate),
            "power" | "watts" => Some(Field::Power),
            "cadence" | "bikecadence" => Some(Field::Cadence),
            "runcadence" | "stepsperminute" | "spm" => Some(Field::RunCadence),
            "formpower" => Some(Field::FormPower),
            "airpower" => Some(Field::AirPower),
            "altitude" | "altitudemeters" | "elevation" | "enhancedaltitude" => Some(Field::Altitude),
            "distance" | "distancemeters" | "cumulativedistance" => Some(Field::Distance),
            "speed" | "enhancedspeed" => Some(Field::Speed),
            _ => None,
        }
    }
}

/// Converts raw records into `RawSample`s
#[derive(Debug, Clone, Default)]
pub struct SampleParser {
    limits: ValueLimits,
}

impl SampleParser {
    pub fn new(limits: ValueLimits) -> Self {
        SampleParser { limits }
    }

    /// Parse every record of a stream, dropping and counting malformed ones.
    /// The resulting samples are sorted by timestamp.
    pub fn parse_stream(&self, raw: &RawStream) -> IngestedStream {
        let mut samples = Vec::with_capacity(raw.records.len());
        let mut dropped_records = 0;
        let mut rejected_values = 0;

        for record in &raw.records {
            match self.parse_record(&raw.source_id, record) {
                Ok((sample, rejected)) => {
                    rejected_values += rejected;
                    if !sample.fields.is_empty() {
                        samples.push(sample);
                    }
                }
                Err(err) => {
                    debug!(source_id = %raw.source_id, "Dropping record: {}", err);
                    dropped_records += 1;
                }
            }
        }

        if dropped_records > 0 || rejected_values > 0 {
            warn!(
                source_id = %raw.source_id,
                dropped_records,
                rejected_values,
                "Discarded malformed input"
            );
        }

        samples.sort_by_key(|s| s.timestamp);

        let activity_start = raw.activity_start.as_deref().and_then(|s| match parse_timestamp(s) {
            Ok(ts) => Some(ts),
            Err(_) => {
                warn!(source_id = %raw.source_id, "Ignoring unparsable activity start {:?}", s);
                None
            }
        });

        IngestedStream {
            stream: SourceStream {
                source_id: raw.source_id.clone(),
                activity_start,
                samples,
            },
            dropped_records,
            rejected_values,
        }
    }

    /// Parse a single record. Returns the sample and the number of values
    /// discarded for being out of range.
    pub fn parse_record(&self, source_id: &str, record: &RawRecord) -> Result<(RawSample, usize)> {
        let malformed = |reason: String| EngineError::MalformedSample {
            source_id: source_id.to_string(),
            reason,
        };

        let timestamp = parse_timestamp(&record.timestamp).map_err(|_| {
            malformed(format!("unparsable timestamp {:?}", record.timestamp))
        })?;

        let mut fields = SampleFields::default();
        let mut rejected = 0;

        for (key, value) in &record.values {
            let Some(field) = Field::from_key(key) else {
                continue;
            };
            let Some(number) = numeric_value(value)
                .map_err(|_| malformed(format!("non-numeric value for {}: {}", key, value)))?
            else {
                continue;
            };

            if !self.assign(&mut fields, field, number) {
                rejected += 1;
            }
        }

        Ok((
            RawSample {
                source_id: source_id.to_string(),
                timestamp,
                fields,
            },
            rejected,
        ))
    }

    /// Store a value in its field; false when the value is out of range
    fn assign(&self, fields: &mut SampleFields, field: Field, value: Decimal) -> bool {
        let limits = &self.limits;
        match field {
            Field::HeartRate => store_u16(&mut fields.heart_rate, value, limits.heart_rate),
            Field::Power => store_u16(&mut fields.power, value, limits.power),
            Field::Cadence => store_u16(&mut fields.cadence, value, limits.cadence),
            Field::RunCadence => store_u16(&mut fields.run_cadence, value, limits.cadence),
            Field::FormPower => store_u16(&mut fields.form_power, value, limits.power),
            Field::AirPower => store_u16(&mut fields.air_power, value, limits.power),
            Field::Altitude => store_decimal(&mut fields.altitude, value, limits.altitude_m),
            Field::Distance => {
                store_decimal(&mut fields.distance, value, (Decimal::ZERO, Decimal::MAX))
            }
            Field::Speed => store_decimal(&mut fields.speed, value, limits.speed_mps),
        }
    }
}

fn store_u16(slot: &mut Option<u16>, value: Decimal, (min, max): (u16, u16)) -> bool {
    match value.round().to_u16() {
        Some(v) if v >= min && v <= max => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

fn store_decimal(slot: &mut Option<Decimal>, value: Decimal, (min, max): (Decimal, Decimal)) -> bool {
    if value >= min && value <= max {
        *slot = Some(value);
        true
    } else {
        false
    }
}

/// `Ok(None)` for JSON null, an error for values that are not numbers
fn numeric_value(value: &serde_json::Value) -> std::result::Result<Option<Decimal>, ()> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(Decimal::from(i)))
            } else {
                n.as_f64().and_then(Decimal::from_f64).map(Some).ok_or(())
            }
        }
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => s.trim().parse::<Decimal>().map(Some).map_err(|_| ()),
        _ => Err(()),
    }
}

/// Parse RFC 3339 timestamps; naive timestamps are taken as UTC
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let trimmed = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(EngineError::Validation(format!("Invalid timestamp: {}", s)))
}

/// Read one workout object or an array of them from a JSON file
pub fn read_workouts(path: &Path) -> Result<Vec<WorkoutInput>> {
    let content = fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value = serde_json::from_str(&content)?;

    let workouts = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    debug!(path = %path.display(), workouts = workouts.len(), "Read workout file");
    Ok(workouts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn record(timestamp: &str, values: serde_json::Value) -> RawRecord {
        let values = values
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        RawRecord {
            timestamp: timestamp.to_string(),
            values,
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 9, 23, 7, 0, 5).unwrap();
        assert_eq!(parse_timestamp("2024-09-23T07:00:05Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-09-23T09:00:05+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-09-23T07:00:05").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-09-23 07:00:05.000").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_field_aliases() {
        let parser = SampleParser::default();
        let rec = record(
            "2024-09-23T07:00:00Z",
            json!({"HeartRateBpm": 142, "Watts": "231", "AltitudeMeters": 12.5, "RunCadence": 178}),
        );

        let (sample, rejected) = parser.parse_record("garmin", &rec).unwrap();
        assert_eq!(rejected, 0);
        assert_eq!(sample.fields.heart_rate, Some(142));
        assert_eq!(sample.fields.power, Some(231));
        assert_eq!(sample.fields.altitude, Some(dec!(12.5)));
        assert_eq!(sample.fields.run_cadence, Some(178));
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let parser = SampleParser::default();
        let rec = record("2024-09-23T07:00:00Z", json!({"heart_rate": 0, "power": 210}));

        let (sample, rejected) = parser.parse_record("garmin", &rec).unwrap();
        assert_eq!(rejected, 1);
        assert_eq!(sample.fields.heart_rate, None);
        assert_eq!(sample.fields.power, Some(210));
    }

    #[test]
    fn test_malformed_records_dropped_and_counted() {
        let parser = SampleParser::default();
        let raw = RawStream {
            source_id: "stryd".to_string(),
            activity_start: Some("2024-09-23T07:00:00Z".to_string()),
            records: vec![
                record("2024-09-23T07:00:02Z", json!({"power": 250})),
                record("not a time", json!({"power": 250})),
                record("2024-09-23T07:00:01Z", json!({"power": {"avg": 3}})),
                record("2024-09-23T07:00:00Z", json!({"power": 240, "lap": 1})),
                record("2024-09-23T07:00:03Z", json!({"power": null})),
            ],
        };

        let result = parser.parse_stream(&raw);
        assert_eq!(result.dropped_records, 2);
        assert_eq!(result.stream.samples.len(), 2);
        assert_eq!(result.stream.samples[0].fields.power, Some(240));
        assert!(result.stream.activity_start.is_some());
    }

    #[test]
    fn test_record_deserializes_flattened() {
        let rec: RawRecord =
            serde_json::from_str(r#"{"timestamp": "2024-09-23T07:00:00Z", "hr": 120}"#).unwrap();
        assert_eq!(rec.values.get("hr"), Some(&json!(120)));
    }

    #[test]
    fn test_read_workouts_object_or_array() {
        let dir = tempfile::tempdir().unwrap();
        let workout = json!({
            "id": "w1",
            "athlete_id": "a1",
            "sport": "run",
            "start_time": "2024-09-23T07:00:00Z",
            "duration_sec": 1800,
            "streams": [{
                "source_id": "watch",
                "records": [{"timestamp": "2024-09-23T07:00:00Z", "hr": 120}]
            }]
        });

        let single = dir.path().join("single.json");
        std::fs::write(&single, workout.to_string()).unwrap();
        let workouts = read_workouts(&single).unwrap();
        assert_eq!(workouts.len(), 1);
        assert_eq!(workouts[0].streams[0].records.len(), 1);

        let many = dir.path().join("many.json");
        std::fs::write(&many, json!([workout.clone(), workout]).to_string()).unwrap();
        assert_eq!(read_workouts(&many).unwrap().len(), 2);
    }

    #[test]
    fn test_read_workouts_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.json");
        assert!(matches!(read_workouts(&missing), Err(EngineError::Io { .. })));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{\"id\": ").unwrap();
        assert!(matches!(read_workouts(&broken), Err(EngineError::Serialization(_))));

        let wrong_shape = dir.path().join("shape.json");
        std::fs::write(&wrong_shape, r#"{"id": "w1"}"#).unwrap();
        assert!(matches!(read_workouts(&wrong_shape), Err(EngineError::Serialization(_))));
    }
}
