use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::models::{ActiveInterval, AthleteThresholds, MergedSample, Sport};

/// Metrics that can be bucketed into training zones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneMetric {
    HeartRate,
    BikePower,
    RunPower,
    RunPace,
    SwimPace,
}

impl ZoneMetric {
    pub const ALL: [ZoneMetric; 5] = [
        ZoneMetric::HeartRate,
        ZoneMetric::BikePower,
        ZoneMetric::RunPower,
        ZoneMetric::RunPace,
        ZoneMetric::SwimPace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneMetric::HeartRate => "heart_rate",
            ZoneMetric::BikePower => "bike_power",
            ZoneMetric::RunPower => "run_power",
            ZoneMetric::RunPace => "run_pace",
            ZoneMetric::SwimPace => "swim_pace",
        }
    }

    /// Pace axes run backwards: a larger value is slower, i.e. a lower zone
    pub fn is_pace(&self) -> bool {
        matches!(self, ZoneMetric::RunPace | ZoneMetric::SwimPace)
    }

    /// Whether zones of this metric are meaningful for the sport
    pub fn applies_to(&self, sport: Sport) -> bool {
        match self {
            ZoneMetric::HeartRate => true,
            ZoneMetric::BikePower => sport == Sport::Bike,
            ZoneMetric::RunPower | ZoneMetric::RunPace => sport == Sport::Run,
            ZoneMetric::SwimPace => sport == Sport::Swim,
        }
    }

    /// Extract the value this metric classifies, in the metric's own unit.
    /// Swim pace is expressed per 100 m, run pace per km.
    pub fn sample_value(&self, sample: &MergedSample) -> Option<Decimal> {
        match self {
            ZoneMetric::HeartRate => sample.heart_rate.map(Decimal::from),
            ZoneMetric::BikePower | ZoneMetric::RunPower => sample.power.map(Decimal::from),
            ZoneMetric::RunPace => sample.pace,
            ZoneMetric::SwimPace => sample.pace.map(|pace| pace / dec!(10)),
        }
    }
}

impl fmt::Display for ZoneMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZoneMetric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "heart_rate" | "hr" => Ok(ZoneMetric::HeartRate),
            "bike_power" => Ok(ZoneMetric::BikePower),
            "run_power" => Ok(ZoneMetric::RunPower),
            "run_pace" => Ok(ZoneMetric::RunPace),
            "swim_pace" | "swim" => Ok(ZoneMetric::SwimPace),
            _ => Err(format!("Unknown zone metric: {}", s)),
        }
    }
}

/// The seven zone labels, lowest intensity first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneLabel {
    Z1,
    Z2,
    Zx,
    Z3,
    Zy,
    Z4,
    Z5,
}

impl ZoneLabel {
    pub const ALL: [ZoneLabel; 7] = [
        ZoneLabel::Z1,
        ZoneLabel::Z2,
        ZoneLabel::Zx,
        ZoneLabel::Z3,
        ZoneLabel::Zy,
        ZoneLabel::Z4,
        ZoneLabel::Z5,
    ];

    /// 1-based position in the intensity ordering
    pub fn index(&self) -> u32 {
        match self {
            ZoneLabel::Z1 => 1,
            ZoneLabel::Z2 => 2,
            ZoneLabel::Zx => 3,
            ZoneLabel::Z3 => 4,
            ZoneLabel::Zy => 5,
            ZoneLabel::Z4 => 6,
            ZoneLabel::Z5 => 7,
        }
    }
}

impl fmt::Display for ZoneLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ZoneLabel::Z1 => "z1",
            ZoneLabel::Z2 => "z2",
            ZoneLabel::Zx => "zx",
            ZoneLabel::Z3 => "z3",
            ZoneLabel::Zy => "zy",
            ZoneLabel::Z4 => "z4",
            ZoneLabel::Z5 => "z5",
        };
        f.write_str(label)
    }
}

/// Seven contiguous zones for one metric, stored as the six interior boundaries.
///
/// For ascending metrics (heart rate, power) the boundaries increase and each
/// zone is `[lower, upper)`. For pace metrics the boundaries decrease (faster
/// paces are smaller numbers) and a boundary belongs to the faster zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDefinition {
    pub metric: ZoneMetric,
    pub thresholds: [Decimal; 6],
}

impl ZoneDefinition {
    /// Build a definition from six interior boundaries, z1/z2 first
    pub fn from_thresholds(metric: ZoneMetric, thresholds: [Decimal; 6]) -> Result<Self> {
        let definition = ZoneDefinition { metric, thresholds };
        definition.validate()?;
        Ok(definition)
    }

    /// Build a definition from seven `(lower, upper)` ranges as stored in a
    /// profile table. Integer ranges such as `[121, 140]`, `[141, 150]` are
    /// contiguous; so are half-open ones that share a boundary.
    pub fn from_ranges(
        metric: ZoneMetric,
        ranges: &[(Option<Decimal>, Option<Decimal>)],
    ) -> Result<Self> {
        if ranges.len() != ZoneLabel::ALL.len() {
            return Err(EngineError::InvalidZoneDefinition {
                metric,
                reason: format!("expected 7 ranges, got {}", ranges.len()),
            });
        }

        let mut thresholds = [Decimal::ZERO; 6];
        for (i, pair) in ranges.windows(2).enumerate() {
            let (lower_zone, upper_zone) = (normalize(pair[0]), normalize(pair[1]));
            let label = ZoneLabel::ALL[i + 1];

            // Pace ranges meet where the faster zone's slowest value sits
            // just below the slower zone's fastest value.
            let (boundary, neighbour) = if metric.is_pace() {
                (upper_zone.1, lower_zone.0)
            } else {
                (upper_zone.0, lower_zone.1)
            };

            let (boundary, neighbour) = match (boundary, neighbour) {
                (Some(b), Some(n)) => (b, n),
                _ => {
                    return Err(EngineError::InvalidZoneDefinition {
                        metric,
                        reason: format!("zone {} is missing an interior bound", label),
                    })
                }
            };

            let contiguous = if metric.is_pace() {
                neighbour == boundary || neighbour == boundary + Decimal::ONE
            } else {
                boundary == neighbour || boundary == neighbour + Decimal::ONE
            };
            if !contiguous {
                return Err(EngineError::InvalidZoneDefinition {
                    metric,
                    reason: format!("zone {} does not start where the previous zone ends", label),
                });
            }

            thresholds[i] = boundary;
        }

        Self::from_thresholds(metric, thresholds)
    }

    /// Generate a definition from an athlete threshold using the fixed
    /// percentage table for the metric
    pub fn from_reference(metric: ZoneMetric, reference: Decimal) -> Result<Self> {
        if reference <= Decimal::ZERO {
            return Err(EngineError::ThresholdMissing {
                threshold: reference_name(metric).to_string(),
            });
        }

        let precision = if metric.is_pace() { 1 } else { 0 };
        let mut thresholds = [Decimal::ZERO; 6];
        for (slot, factor) in thresholds.iter_mut().zip(percentage_table(metric)) {
            *slot = (reference * factor).round_dp(precision);
        }

        Self::from_thresholds(metric, thresholds)
    }

    /// Check the boundaries are positive and strictly ordered
    pub fn validate(&self) -> Result<()> {
        if self.thresholds.iter().any(|t| *t <= Decimal::ZERO) {
            return Err(EngineError::InvalidZoneDefinition {
                metric: self.metric,
                reason: "zone boundaries must be positive".to_string(),
            });
        }

        let ordered = self.thresholds.windows(2).all(|w| {
            if self.metric.is_pace() {
                w[0] > w[1]
            } else {
                w[0] < w[1]
            }
        });
        if !ordered {
            return Err(EngineError::InvalidZoneDefinition {
                metric: self.metric,
                reason: "zone boundaries overlap or are out of order".to_string(),
            });
        }

        Ok(())
    }

    /// Find the zone containing a value
    pub fn classify(&self, value: Decimal) -> ZoneLabel {
        let crossed = if self.metric.is_pace() {
            self.thresholds.iter().take_while(|t| value <= **t).count()
        } else {
            self.thresholds.iter().take_while(|t| value >= **t).count()
        };
        ZoneLabel::ALL[crossed]
    }
}

fn normalize(range: (Option<Decimal>, Option<Decimal>)) -> (Option<Decimal>, Option<Decimal>) {
    match range {
        (Some(a), Some(b)) if a > b => (Some(b), Some(a)),
        other => other,
    }
}

fn reference_name(metric: ZoneMetric) -> &'static str {
    match metric {
        ZoneMetric::HeartRate => "LTHR",
        ZoneMetric::BikePower => "FTP",
        ZoneMetric::RunPower => "run critical power",
        ZoneMetric::RunPace => "threshold pace",
        ZoneMetric::SwimPace => "CSS pace",
    }
}

/// Fraction of the reference value at each interior boundary
fn percentage_table(metric: ZoneMetric) -> [Decimal; 6] {
    match metric {
        ZoneMetric::HeartRate => [dec!(0.81), dec!(0.89), dec!(0.94), dec!(1.00), dec!(1.03), dec!(1.06)],
        ZoneMetric::BikePower => [dec!(0.55), dec!(0.75), dec!(0.87), dec!(0.95), dec!(1.05), dec!(1.20)],
        ZoneMetric::RunPower => [dec!(0.80), dec!(0.88), dec!(0.95), dec!(1.00), dec!(1.05), dec!(1.15)],
        // Slower than threshold is a larger number of seconds
        ZoneMetric::RunPace => [dec!(1.29), dec!(1.14), dec!(1.06), dec!(1.01), dec!(0.97), dec!(0.90)],
        ZoneMetric::SwimPace => [dec!(1.15), dec!(1.08), dec!(1.04), dec!(1.00), dec!(0.97), dec!(0.93)],
    }
}

/// An athlete's zone definitions keyed by sport and metric
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneDefinitionSet {
    definitions: BTreeMap<(Sport, ZoneMetric), ZoneDefinition>,
}

impl ZoneDefinitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, rejecting metric/sport pairs that never apply
    pub fn insert(&mut self, sport: Sport, definition: ZoneDefinition) -> Result<()> {
        if !definition.metric.applies_to(sport) {
            return Err(EngineError::InvalidZoneDefinition {
                metric: definition.metric,
                reason: format!("{} zones do not apply to {}", definition.metric, sport),
            });
        }
        definition.validate()?;
        self.definitions.insert((sport, definition.metric), definition);
        Ok(())
    }

    /// Use one heart-rate definition for every sport
    pub fn with_shared_heart_rate(mut self, definition: ZoneDefinition) -> Result<Self> {
        for sport in [Sport::Bike, Sport::Run, Sport::Swim, Sport::Strength, Sport::Other] {
            self.insert(sport, definition.clone())?;
        }
        Ok(self)
    }

    /// Generate every definition the athlete's thresholds allow
    pub fn from_thresholds(thresholds: &AthleteThresholds) -> Result<Self> {
        let mut set = ZoneDefinitionSet::new();

        if let Some(lthr) = thresholds.lthr.filter(|v| *v > 0) {
            let hr = ZoneDefinition::from_reference(ZoneMetric::HeartRate, Decimal::from(lthr))?;
            set = set.with_shared_heart_rate(hr)?;
        }
        if let Some(ftp) = thresholds.ftp.filter(|v| *v > 0) {
            set.insert(
                Sport::Bike,
                ZoneDefinition::from_reference(ZoneMetric::BikePower, Decimal::from(ftp))?,
            )?;
        }
        if let Some(cp) = thresholds.run_critical_power.filter(|v| *v > 0) {
            set.insert(
                Sport::Run,
                ZoneDefinition::from_reference(ZoneMetric::RunPower, Decimal::from(cp))?,
            )?;
        }
        if let Some(pace) = thresholds.threshold_pace.filter(|v| *v > Decimal::ZERO) {
            set.insert(Sport::Run, ZoneDefinition::from_reference(ZoneMetric::RunPace, pace)?)?;
        }
        if let Some(css) = thresholds.css_pace.filter(|v| *v > Decimal::ZERO) {
            set.insert(Sport::Swim, ZoneDefinition::from_reference(ZoneMetric::SwimPace, css)?)?;
        }

        Ok(set)
    }

    pub fn get(&self, sport: Sport, metric: ZoneMetric) -> Option<&ZoneDefinition> {
        self.definitions.get(&(sport, metric))
    }

    /// Definition for a pair, or the error explaining its absence
    pub fn require(&self, sport: Sport, metric: ZoneMetric) -> Result<&ZoneDefinition> {
        self.get(sport, metric)
            .ok_or(EngineError::MissingZoneDefinition { sport, metric })
    }

    /// Restrict the set to one sport
    pub fn for_sport(&self, sport: Sport) -> ZoneDefinitionSet {
        let definitions = self
            .definitions
            .iter()
            .filter(|((s, _), _)| *s == sport)
            .map(|(key, def)| (*key, def.clone()))
            .collect();
        ZoneDefinitionSet { definitions }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Sport, &ZoneDefinition)> {
        self.definitions.iter().map(|((sport, _), def)| (*sport, def))
    }
}

/// Why a metric has no zone breakdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    NotApplicable,
    MissingZoneDefinition,
    NoSamples,
}

/// Time spent in each zone of one metric during one workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneTimeBreakdown {
    pub metric: ZoneMetric,
    pub available: bool,
    pub unavailable_reason: Option<UnavailableReason>,
    pub zone_minutes: BTreeMap<ZoneLabel, Decimal>,
    pub total_duration_minutes: Decimal,
}

impl ZoneTimeBreakdown {
    pub fn unavailable(metric: ZoneMetric, reason: UnavailableReason) -> Self {
        ZoneTimeBreakdown {
            metric,
            available: false,
            unavailable_reason: Some(reason),
            zone_minutes: BTreeMap::new(),
            total_duration_minutes: Decimal::ZERO,
        }
    }

    pub fn minutes(&self, label: ZoneLabel) -> Decimal {
        self.zone_minutes.get(&label).copied().unwrap_or(Decimal::ZERO)
    }

    /// Share of the classified time in each zone, as a percentage
    pub fn percentages(&self) -> BTreeMap<ZoneLabel, Decimal> {
        if self.total_duration_minutes <= Decimal::ZERO {
            return BTreeMap::new();
        }
        self.zone_minutes
            .iter()
            .map(|(label, minutes)| {
                let pct = (*minutes / self.total_duration_minutes * dec!(100)).round_dp(1);
                (*label, pct)
            })
            .collect()
    }
}

/// Buckets merged samples into zones and accumulates exposure time.
///
/// Sources record at different rates, so each metric is timed on its own
/// samples: a value holds until that metric's next sample in the interval.
#[derive(Debug, Clone)]
pub struct ZoneClassifier {
    /// Added after the last sample of each active interval
    nominal_delta_secs: Decimal,

    /// Upper bound on the time one sample can be credited with
    max_delta_secs: Decimal,
}

impl Default for ZoneClassifier {
    fn default() -> Self {
        ZoneClassifier {
            nominal_delta_secs: Decimal::ONE,
            max_delta_secs: Decimal::from(5),
        }
    }
}

impl ZoneClassifier {
    pub fn new(nominal_delta_secs: Decimal, max_delta_secs: Decimal) -> Self {
        ZoneClassifier {
            nominal_delta_secs,
            max_delta_secs: max_delta_secs.max(nominal_delta_secs),
        }
    }

    /// Classify a workout's samples against every zone metric.
    ///
    /// The result always has an entry per metric; metrics that cannot be
    /// classified carry an empty map and the reason.
    pub fn classify(
        &self,
        sport: Sport,
        samples: &[MergedSample],
        intervals: &[ActiveInterval],
        zones: &ZoneDefinitionSet,
    ) -> BTreeMap<ZoneMetric, ZoneTimeBreakdown> {
        ZoneMetric::ALL
            .iter()
            .map(|metric| {
                let breakdown = if !metric.applies_to(sport) {
                    ZoneTimeBreakdown::unavailable(*metric, UnavailableReason::NotApplicable)
                } else {
                    match zones.require(sport, *metric) {
                        Ok(definition) => {
                            let deltas = self.sample_deltas(samples, intervals, *metric);
                            self.accumulate(definition, samples, &deltas)
                        }
                        Err(err) => {
                            err.emit();
                            ZoneTimeBreakdown::unavailable(
                                *metric,
                                UnavailableReason::MissingZoneDefinition,
                            )
                        }
                    }
                };
                (*metric, breakdown)
            })
            .collect()
    }

    fn accumulate(
        &self,
        definition: &ZoneDefinition,
        samples: &[MergedSample],
        deltas: &[Option<Decimal>],
    ) -> ZoneTimeBreakdown {
        let mut seconds: BTreeMap<ZoneLabel, Decimal> = BTreeMap::new();
        let mut total_seconds = Decimal::ZERO;
        let mut classified = 0usize;

        for (sample, delta) in samples.iter().zip(deltas) {
            let (Some(value), Some(delta)) = (definition.metric.sample_value(sample), delta) else {
                continue;
            };
            *seconds.entry(definition.classify(value)).or_insert(Decimal::ZERO) += *delta;
            total_seconds += *delta;
            classified += 1;
        }

        if classified == 0 {
            return ZoneTimeBreakdown::unavailable(definition.metric, UnavailableReason::NoSamples);
        }

        let zone_minutes = ZoneLabel::ALL
            .iter()
            .map(|label| {
                let secs = seconds.get(label).copied().unwrap_or(Decimal::ZERO);
                (*label, to_minutes(secs))
            })
            .collect();

        ZoneTimeBreakdown {
            metric: definition.metric,
            available: true,
            unavailable_reason: None,
            zone_minutes,
            total_duration_minutes: to_minutes(total_seconds),
        }
    }

    /// Time credited to each sample carrying `metric`: the time to the
    /// metric's next sample in the same interval, or to the interval end plus
    /// the nominal delta for its last one. `None` for samples without the
    /// metric or outside every interval.
    pub fn sample_deltas(
        &self,
        samples: &[MergedSample],
        intervals: &[ActiveInterval],
        metric: ZoneMetric,
    ) -> Vec<Option<Decimal>> {
        let mut deltas = vec![None; samples.len()];
        for interval in intervals {
            let end = interval.end_index.min(samples.len());
            let carrying: Vec<usize> = (interval.start_index.min(end)..end)
                .filter(|i| metric.sample_value(&samples[*i]).is_some())
                .collect();

            for (k, &i) in carrying.iter().enumerate() {
                let delta = match carrying.get(k + 1) {
                    Some(&next) => seconds_between(samples[i].timestamp, samples[next].timestamp),
                    None => {
                        seconds_between(samples[i].timestamp, interval.end) + self.nominal_delta_secs
                    }
                };
                deltas[i] = Some(delta.min(self.max_delta_secs));
            }
        }
        deltas
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    Decimal::new((to - from).num_milliseconds(), 3)
}

fn to_minutes(seconds: Decimal) -> Decimal {
    (seconds / dec!(60)).round_dp(4)
}
