//! Normalized per-metric time series of a processed workout

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::{MergedSample, Sport, Workout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesMetric {
    HeartRate,
    Pace,
    Power,
    Speed,
    Cadence,
    RunCadence,
    Altitude,
    FormPower,
    AirPower,
    Distance,
}

impl SeriesMetric {
    pub const ALL: [SeriesMetric; 10] = [
        SeriesMetric::HeartRate,
        SeriesMetric::Pace,
        SeriesMetric::Power,
        SeriesMetric::Speed,
        SeriesMetric::Cadence,
        SeriesMetric::RunCadence,
        SeriesMetric::Altitude,
        SeriesMetric::FormPower,
        SeriesMetric::AirPower,
        SeriesMetric::Distance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SeriesMetric::HeartRate => "hr",
            SeriesMetric::Pace => "pace",
            SeriesMetric::Power => "power",
            SeriesMetric::Speed => "speed",
            SeriesMetric::Cadence => "cadence",
            SeriesMetric::RunCadence => "run_cadence",
            SeriesMetric::Altitude => "altitude",
            SeriesMetric::FormPower => "form_power",
            SeriesMetric::AirPower => "air_power",
            SeriesMetric::Distance => "distance",
        }
    }

    /// Unit of the reported values; swim pace is per 100 m
    pub fn unit(&self, sport: Sport) -> &'static str {
        match self {
            SeriesMetric::HeartRate => "bpm",
            SeriesMetric::Pace if sport == Sport::Swim => "s/100m",
            SeriesMetric::Pace => "s/km",
            SeriesMetric::Power | SeriesMetric::FormPower | SeriesMetric::AirPower => "W",
            SeriesMetric::Speed => "m/s",
            SeriesMetric::Cadence => "rpm",
            SeriesMetric::RunCadence => "spm",
            SeriesMetric::Altitude | SeriesMetric::Distance => "m",
        }
    }

    fn value(&self, sample: &MergedSample, sport: Sport) -> Option<Decimal> {
        match self {
            SeriesMetric::HeartRate => sample.heart_rate.map(Decimal::from),
            SeriesMetric::Pace if sport == Sport::Swim => sample.pace.map(|p| p / dec!(10)),
            SeriesMetric::Pace => sample.pace,
            SeriesMetric::Power => sample.power.map(Decimal::from),
            SeriesMetric::Speed => sample.speed,
            SeriesMetric::Cadence => sample.cadence.map(Decimal::from),
            SeriesMetric::RunCadence => sample.run_cadence.map(Decimal::from),
            SeriesMetric::Altitude => sample.altitude,
            SeriesMetric::FormPower => sample.form_power.map(Decimal::from),
            SeriesMetric::AirPower => sample.air_power.map(Decimal::from),
            SeriesMetric::Distance => sample.distance,
        }
    }
}

impl fmt::Display for SeriesMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SeriesMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hr" | "heart_rate" => Ok(SeriesMetric::HeartRate),
            "pace" => Ok(SeriesMetric::Pace),
            "power" => Ok(SeriesMetric::Power),
            "speed" => Ok(SeriesMetric::Speed),
            "cadence" => Ok(SeriesMetric::Cadence),
            "run_cadence" => Ok(SeriesMetric::RunCadence),
            "altitude" => Ok(SeriesMetric::Altitude),
            "form_power" => Ok(SeriesMetric::FormPower),
            "air_power" => Ok(SeriesMetric::AirPower),
            "distance" => Ok(SeriesMetric::Distance),
            _ => Err(format!(
                "Unknown metric '{}'. Expected one of: {}",
                s,
                SeriesMetric::ALL.map(|m| m.name()).join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Decimal,
    pub unit: String,
}

/// Query result: the ordered points, or why there are none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TimeSeries {
    Available {
        metric: SeriesMetric,
        points: Vec<TimeSeriesPoint>,
    },
    Unavailable {
        metric: SeriesMetric,
        reason: String,
    },
}

impl TimeSeries {
    pub fn is_available(&self) -> bool {
        matches!(self, TimeSeries::Available { .. })
    }

    pub fn points(&self) -> &[TimeSeriesPoint] {
        match self {
            TimeSeries::Available { points, .. } => points,
            TimeSeries::Unavailable { .. } => &[],
        }
    }
}

/// Extract one metric from a workout's merged stream
pub fn query(workout: &Workout, metric: SeriesMetric) -> TimeSeries {
    if workout.merged_samples.is_empty() {
        return TimeSeries::Unavailable {
            metric,
            reason: "workout has no samples".to_string(),
        };
    }

    let unit = metric.unit(workout.sport);
    let points: Vec<TimeSeriesPoint> = workout
        .merged_samples
        .iter()
        .filter_map(|sample| {
            metric.value(sample, workout.sport).map(|value| TimeSeriesPoint {
                timestamp: sample.timestamp,
                value,
                unit: unit.to_string(),
            })
        })
        .collect();

    if points.is_empty() {
        return TimeSeries::Unavailable {
            metric,
            reason: format!("{} was not recorded", metric),
        };
    }

    TimeSeries::Available { metric, points }
}
