use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ingest::RawStream;
use crate::tss::TssResult;
use crate::zones::{ZoneMetric, ZoneTimeBreakdown};

/// Sport types supported by the training analysis engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sport {
    Bike,
    Run,
    Swim,
    Strength,
    Other,
}

impl Sport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Bike => "bike",
            Sport::Run => "run",
            Sport::Swim => "swim",
            Sport::Strength => "strength",
            Sport::Other => "other",
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sport {
    type Err = String;

    /// Accepts the engine's own names plus the activity-type names device
    /// exports use (`biking`, `running`, ...)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bike" | "biking" | "cycling" | "ride" => Ok(Sport::Bike),
            "run" | "running" => Ok(Sport::Run),
            "swim" | "swimming" => Ok(Sport::Swim),
            "strength" => Ok(Sport::Strength),
            "other" => Ok(Sport::Other),
            _ => Err(format!("Unknown sport: {}", s)),
        }
    }
}

/// Confidence attached to every computed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Computed by the primary method for the sport
    High,
    /// Primary method with reduced input (short power stream, warm-up window)
    Approximate,
    /// Secondary estimate (heart rate, pace instead of power, duration only)
    Fallback,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Confidence::High => "high",
            Confidence::Approximate => "approximate",
            Confidence::Fallback => "fallback",
        };
        f.write_str(label)
    }
}

/// Metric values a single source can report at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleFields {
    /// Heart rate in beats per minute
    pub heart_rate: Option<u16>,

    /// Power output in watts
    pub power: Option<u16>,

    /// Cadence (revolutions per minute for cycling, strokes for swimming)
    pub cadence: Option<u16>,

    /// Running cadence in steps per minute
    pub run_cadence: Option<u16>,

    /// Running form power in watts
    pub form_power: Option<u16>,

    /// Running air power in watts
    pub air_power: Option<u16>,

    /// Elevation in meters above sea level
    pub altitude: Option<Decimal>,

    /// Cumulative distance from the start in meters
    pub distance: Option<Decimal>,

    /// Speed in meters per second
    pub speed: Option<Decimal>,
}

impl SampleFields {
    pub fn is_empty(&self) -> bool {
        self.heart_rate.is_none()
            && self.power.is_none()
            && self.cadence.is_none()
            && self.run_cadence.is_none()
            && self.form_power.is_none()
            && self.air_power.is_none()
            && self.altitude.is_none()
            && self.distance.is_none()
            && self.speed.is_none()
    }
}

/// One parsed measurement from one recording source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: SampleFields,
}

/// All samples a single source recorded for one workout, sorted by timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStream {
    pub source_id: String,

    /// Start time as reported by this source's own clock
    pub activity_start: Option<DateTime<Utc>>,

    pub samples: Vec<RawSample>,
}

/// One resolved instant of the aligned workout stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedSample {
    pub timestamp: DateTime<Utc>,
    pub heart_rate: Option<u16>,
    pub power: Option<u16>,
    pub cadence: Option<u16>,
    pub run_cadence: Option<u16>,
    pub form_power: Option<u16>,
    pub air_power: Option<u16>,
    pub altitude: Option<Decimal>,

    /// Seconds per kilometer
    pub pace: Option<Decimal>,

    /// Meters per second
    pub speed: Option<Decimal>,

    /// Cumulative meters
    pub distance: Option<Decimal>,
}

impl MergedSample {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        MergedSample {
            timestamp,
            heart_rate: None,
            power: None,
            cadence: None,
            run_cadence: None,
            form_power: None,
            air_power: None,
            altitude: None,
            pace: None,
            speed: None,
            distance: None,
        }
    }
}

/// A stretch of the merged stream without pauses; `end_index` is exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInterval {
    pub start_index: usize,
    pub end_index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ActiveInterval {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index == self.start_index
    }
}

/// Per-sport intensity reference thresholds for one athlete
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AthleteThresholds {
    /// Functional Threshold Power for cycling (watts)
    pub ftp: Option<u16>,

    /// Running critical power (watts)
    pub run_critical_power: Option<u16>,

    /// Lactate Threshold Heart Rate
    pub lthr: Option<u16>,

    /// Running threshold pace in seconds per kilometer
    pub threshold_pace: Option<Decimal>,

    /// Critical Swim Speed pace in seconds per 100 meters
    pub css_pace: Option<Decimal>,
}

/// Everything the engine needs to process one synced activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutInput {
    pub id: String,
    pub athlete_id: String,
    pub sport: Sport,

    /// Matched activity start time, used to re-anchor drifting sources
    pub start_time: DateTime<Utc>,

    /// Elapsed duration reported by the activity summary
    pub duration_sec: u32,

    /// Total distance from the activity summary, for streams without distance
    #[serde(default)]
    pub total_distance_m: Option<Decimal>,

    #[serde(default)]
    pub streams: Vec<RawStream>,
}

/// A fully computed workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workout {
    pub id: String,
    pub athlete_id: String,
    pub sport: Sport,
    pub start_time: DateTime<Utc>,

    /// Moving duration when samples exist, otherwise the summary duration
    pub duration_sec: u32,

    pub total_distance_m: Option<Decimal>,
    pub merged_samples: Vec<MergedSample>,
    pub intervals: Vec<ActiveInterval>,
    pub tss: Option<TssResult>,
    pub zone_breakdowns: BTreeMap<ZoneMetric, ZoneTimeBreakdown>,
}

impl Workout {
    /// Calendar date the workout counts toward for daily TSS
    pub fn date(&self) -> chrono::NaiveDate {
        self.start_time.date_naive()
    }
}

/// Per-workout result exposed to API/UI consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutReport {
    pub workout_id: String,
    pub tss: Decimal,
    pub tss_confidence: Confidence,
    pub zone_breakdowns: BTreeMap<ZoneMetric, ZoneTimeBreakdown>,
}

impl From<&Workout> for WorkoutReport {
    fn from(workout: &Workout) -> Self {
        let (tss, tss_confidence) = workout
            .tss
            .as_ref()
            .map(|result| (result.tss, result.confidence))
            .unwrap_or((Decimal::ZERO, Confidence::Fallback));

        WorkoutReport {
            workout_id: workout.id.clone(),
            tss,
            tss_confidence,
            zone_breakdowns: workout.zone_breakdowns.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sport_enum_serialization() {
        let sport = Sport::Bike;
        let json = serde_json::to_string(&sport).unwrap();
        assert_eq!(json, "\"bike\"");

        let deserialized: Sport = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, Sport::Bike);
    }

    #[test]
    fn test_sport_from_device_names() {
        assert_eq!("Biking".parse::<Sport>().unwrap(), Sport::Bike);
        assert_eq!("running".parse::<Sport>().unwrap(), Sport::Run);
        assert_eq!("SWIM".parse::<Sport>().unwrap(), Sport::Swim);
        assert!("yoga".parse::<Sport>().is_err());
    }

    #[test]
    fn test_confidence_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Confidence::Approximate).unwrap(),
            "\"approximate\""
        );
        assert_eq!(Confidence::Fallback.to_string(), "fallback");
    }

    #[test]
    fn test_sample_fields_empty() {
        let mut fields = SampleFields::default();
        assert!(fields.is_empty());

        fields.air_power = Some(12);
        assert!(!fields.is_empty());
    }

    #[test]
    fn test_interval_len() {
        let start = Utc.with_ymd_and_hms(2024, 9, 23, 7, 0, 0).unwrap();
        let interval = ActiveInterval {
            start_index: 3,
            end_index: 6,
            start,
            end: start + chrono::Duration::seconds(2),
        };

        assert_eq!(interval.len(), 3);
        assert!(!interval.is_empty());
    }

    #[test]
    fn test_report_without_tss_is_fallback() {
        let workout = Workout {
            id: "w1".to_string(),
            athlete_id: "a1".to_string(),
            sport: Sport::Strength,
            start_time: Utc.with_ymd_and_hms(2024, 9, 23, 7, 0, 0).unwrap(),
            duration_sec: 0,
            total_distance_m: None,
            merged_samples: Vec::new(),
            intervals: Vec::new(),
            tss: None,
            zone_breakdowns: BTreeMap::new(),
        };

        let report = WorkoutReport::from(&workout);
        assert_eq!(report.tss, Decimal::ZERO);
        assert_eq!(report.tss_confidence, Confidence::Fallback);
    }
}
