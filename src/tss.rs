use chrono::Duration;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::models::{ActiveInterval, AthleteThresholds, Confidence, MergedSample, Sport};
use crate::zones::ZoneTimeBreakdown;

/// TSS tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TssConfig {
    /// Rolling window for Normalized Power
    pub np_window_secs: i64,

    /// Power samples further apart than this start a new NP segment
    pub max_power_gap_secs: i64,

    /// Duration-only estimate, TSS per hour by sport
    pub hourly_rates: HourlyRates,

    /// TSS per hour above which a result is flagged
    pub max_tss_per_hour: Decimal,
}

impl Default for TssConfig {
    fn default() -> Self {
        TssConfig {
            np_window_secs: 30,
            max_power_gap_secs: 5,
            hourly_rates: HourlyRates::default(),
            max_tss_per_hour: dec!(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HourlyRates {
    pub bike: Decimal,
    pub run: Decimal,
    pub swim: Decimal,
    pub other: Decimal,
}

impl Default for HourlyRates {
    fn default() -> Self {
        HourlyRates {
            bike: dec!(60),  // Moderate cycling intensity
            run: dec!(70),   // Moderate running intensity
            swim: dec!(80),  // Higher due to full-body engagement
            other: dec!(50), // Variable intensity
        }
    }
}

impl HourlyRates {
    pub fn for_sport(&self, sport: Sport) -> Decimal {
        match sport {
            Sport::Bike => self.bike,
            Sport::Run => self.run,
            Sport::Swim => self.swim,
            Sport::Strength | Sport::Other => self.other,
        }
    }
}

/// TSS calculation result with method used
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TssResult {
    pub tss: Decimal,
    pub method: TssMethod,
    pub confidence: Confidence,
    pub intensity_factor: Option<Decimal>,
    pub normalized_power: Option<Decimal>,
    pub avg_power: Option<Decimal>,

    /// Degradations encountered on the way to this value
    pub warnings: Vec<String>,
}

/// Methods used for TSS calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TssMethod {
    PowerBased,     // Bike or run power against FTP / critical power
    PaceBased,      // Run pace against threshold pace, swim pace against CSS
    HeartRateBased, // Zone-weighted heart rate estimate
    Estimated,      // Duration and sport only
}

/// Normalized and average power over a workout
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSummary {
    pub normalized_power: Decimal,
    pub average_power: Decimal,

    /// False when no power segment covered a full rolling window and
    /// average power stands in for NP
    pub full_window: bool,
}

/// Distance and time covered while moving
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaceSummary {
    pub distance_m: Decimal,
    pub elapsed_secs: Decimal,

    /// Elapsed time adjusted for gradient
    pub graded_secs: Decimal,
}

impl PaceSummary {
    /// Seconds per kilometer
    pub fn average_pace(&self) -> Decimal {
        self.elapsed_secs / self.distance_m * dec!(1000)
    }

    /// Normalized graded pace in seconds per kilometer
    pub fn graded_pace(&self) -> Decimal {
        self.graded_secs / self.distance_m * dec!(1000)
    }
}

/// Everything known about one workout that TSS can be derived from
#[derive(Debug, Clone)]
pub struct TssInput<'a> {
    pub sport: Sport,

    /// Moving duration
    pub duration_sec: u32,
    pub samples: &'a [MergedSample],
    pub intervals: &'a [ActiveInterval],
    pub thresholds: &'a AthleteThresholds,
    pub heart_rate_zones: Option<&'a ZoneTimeBreakdown>,

    /// Summary distance, used when the stream carries none
    pub total_distance_m: Option<Decimal>,

    /// Time credited to the last sample of an interval
    pub nominal_delta_secs: Decimal,
}

/// Core TSS calculation engine
#[derive(Debug, Clone, Default)]
pub struct TssCalculator {
    config: TssConfig,
}

impl TssCalculator {
    pub fn new(config: TssConfig) -> Self {
        TssCalculator { config }
    }

    /// Calculate TSS using the best method the data allows.
    ///
    /// Never fails: each missing threshold or data stream is recorded as a
    /// warning and the next method in the chain is tried, ending with a
    /// duration-only estimate.
    pub fn calculate(&self, input: &TssInput<'_>) -> TssResult {
        let mut warnings = Vec::new();

        let primary = match input.sport {
            Sport::Bike => self.bike_tss(input, &mut warnings),
            Sport::Run => self.run_tss(input, &mut warnings),
            Sport::Swim => self.swim_tss(input, &mut warnings),
            Sport::Strength | Sport::Other => None,
        };

        let mut result = primary
            .or_else(|| self.heart_rate_tss(input, &mut warnings))
            .unwrap_or_else(|| self.estimate_tss(input.sport, input.duration_sec));

        if let Err(err) = self.validate_tss(result.tss, input.duration_sec) {
            warnings.push(err.to_string());
            if result.tss < Decimal::ZERO {
                result.tss = Decimal::ZERO;
            }
        }

        debug!(
            sport = %input.sport,
            method = ?result.method,
            confidence = %result.confidence,
            tss = %result.tss,
            "Calculated TSS"
        );

        result.warnings = warnings;
        result
    }

    /// Power-based TSS for cycling against FTP
    fn bike_tss(&self, input: &TssInput<'_>, warnings: &mut Vec<String>) -> Option<TssResult> {
        let Some(ftp) = input.thresholds.ftp.filter(|v| *v > 0) else {
            warnings.push(missing("FTP"));
            return None;
        };
        self.power_tss(input, ftp, warnings)
    }

    /// Run power against critical power, then pace against threshold pace
    fn run_tss(&self, input: &TssInput<'_>, warnings: &mut Vec<String>) -> Option<TssResult> {
        let has_power = input.samples.iter().any(|s| s.power.is_some());
        if has_power {
            match input.thresholds.run_critical_power.filter(|v| *v > 0) {
                Some(cp) => {
                    if let Some(result) = self.power_tss(input, cp, warnings) {
                        return Some(result);
                    }
                }
                None => warnings.push(missing("run critical power")),
            }
        }

        let Some(threshold_pace) = input.thresholds.threshold_pace.filter(|v| *v > Decimal::ZERO)
        else {
            warnings.push(missing("threshold pace"));
            return None;
        };

        let pace = self.pace_summary(input)?;
        let ngp = pace.graded_pace();
        if ngp <= Decimal::ZERO {
            return None;
        }
        let intensity = threshold_pace / ngp;

        Some(TssResult {
            tss: self.intensity_tss(input.duration_sec, intensity),
            method: TssMethod::PaceBased,
            confidence: Confidence::Fallback,
            intensity_factor: Some(intensity.round_dp(3)),
            normalized_power: None,
            avg_power: None,
            warnings: Vec::new(),
        })
    }

    /// Swim pace per 100 m against CSS
    fn swim_tss(&self, input: &TssInput<'_>, warnings: &mut Vec<String>) -> Option<TssResult> {
        let Some(css) = input.thresholds.css_pace.filter(|v| *v > Decimal::ZERO) else {
            warnings.push(missing("CSS pace"));
            return None;
        };

        let pace = self.pace_summary(input)?;
        let per_100m = pace.average_pace() / dec!(10);
        if per_100m <= Decimal::ZERO {
            return None;
        }
        let intensity = css / per_100m;

        Some(TssResult {
            tss: self.intensity_tss(input.duration_sec, intensity),
            method: TssMethod::PaceBased,
            confidence: Confidence::High,
            intensity_factor: Some(intensity.round_dp(3)),
            normalized_power: None,
            avg_power: None,
            warnings: Vec::new(),
        })
    }

    /// TSS = (duration_sec × NP × IF) / (threshold × 3600) × 100
    fn power_tss(
        &self,
        input: &TssInput<'_>,
        threshold: u16,
        warnings: &mut Vec<String>,
    ) -> Option<TssResult> {
        let Some(power) = self.normalized_power(input.samples, input.intervals, input.nominal_delta_secs)
        else {
            warnings.push("No power data available".to_string());
            return None;
        };

        let threshold = Decimal::from(threshold);
        let np = power.normalized_power;
        let intensity_factor = np / threshold;
        let tss = Decimal::from(input.duration_sec) * np * intensity_factor
            / (threshold * dec!(3600))
            * dec!(100);

        let confidence = if power.full_window {
            Confidence::High
        } else {
            warnings.push(format!(
                "Less than {}s of continuous power, average power used",
                self.config.np_window_secs
            ));
            Confidence::Approximate
        };

        Some(TssResult {
            tss: tss.round_dp(1),
            method: TssMethod::PowerBased,
            confidence,
            intensity_factor: Some(intensity_factor.round_dp(3)),
            normalized_power: Some(np),
            avg_power: Some(power.average_power),
            warnings: Vec::new(),
        })
    }

    /// Heart-rate estimate: minutes in each zone weighted by the zone index,
    /// scaled so an hour in z4 scores 100
    fn heart_rate_tss(&self, input: &TssInput<'_>, warnings: &mut Vec<String>) -> Option<TssResult> {
        let breakdown = input.heart_rate_zones.filter(|b| b.available)?;
        if breakdown.total_duration_minutes <= Decimal::ZERO {
            return None;
        }

        let weighted: Decimal = breakdown
            .zone_minutes
            .iter()
            .map(|(label, minutes)| *minutes * Decimal::from(label.index()))
            .sum();
        let tss = weighted * (dec!(100) / dec!(6)) / dec!(60);

        warnings.push("TSS estimated from heart rate zones".to_string());
        Some(TssResult {
            tss: tss.round_dp(1),
            method: TssMethod::HeartRateBased,
            confidence: Confidence::Fallback,
            intensity_factor: None,
            normalized_power: None,
            avg_power: None,
            warnings: Vec::new(),
        })
    }

    /// Estimate TSS when primary metrics are unavailable
    fn estimate_tss(&self, sport: Sport, duration_sec: u32) -> TssResult {
        let duration_hours = Decimal::from(duration_sec) / dec!(3600);
        let tss = duration_hours * self.config.hourly_rates.for_sport(sport);

        TssResult {
            tss: tss.round_dp(1),
            method: TssMethod::Estimated,
            confidence: Confidence::Fallback,
            intensity_factor: None,
            normalized_power: None,
            avg_power: None,
            warnings: Vec::new(),
        }
    }

    /// TSS = duration × intensity² / 3600 × 100
    fn intensity_tss(&self, duration_sec: u32, intensity: Decimal) -> Decimal {
        let duration_hours = Decimal::from(duration_sec) / dec!(3600);
        (duration_hours * intensity * intensity * dec!(100)).round_dp(1)
    }

    /// Calculate Normalized Power with a time-based rolling window.
    ///
    /// Windows never span a pause or a dropout in the power stream. Slots
    /// filled only by other sources are skipped. When no continuous segment
    /// reaches the window length, average power is returned in place of NP.
    pub fn normalized_power(
        &self,
        samples: &[MergedSample],
        intervals: &[ActiveInterval],
        nominal_delta_secs: Decimal,
    ) -> Option<PowerSummary> {
        let window_ms = self.config.np_window_secs * 1000;
        let nominal_ms = (nominal_delta_secs * dec!(1000)).to_i64().unwrap_or(1000);

        let mut rolling: Vec<f64> = Vec::new();
        let mut total: u64 = 0;
        let mut count: u64 = 0;

        let max_gap = Duration::seconds(self.config.max_power_gap_secs);
        for segment in power_segments(samples, intervals, max_gap) {
            let segment_start = segment[0].timestamp;
            let mut left = 0;
            let mut window_sum: u64 = 0;

            for (i, sample) in segment.iter().enumerate() {
                let power = u64::from(sample.power.unwrap_or(0));
                window_sum += power;
                total += power;
                count += 1;

                while (sample.timestamp - segment[left].timestamp).num_milliseconds() >= window_ms {
                    window_sum -= u64::from(segment[left].power.unwrap_or(0));
                    left += 1;
                }

                let covered = (sample.timestamp - segment_start).num_milliseconds() + nominal_ms;
                if covered >= window_ms {
                    rolling.push(window_sum as f64 / (i - left + 1) as f64);
                }
            }
        }

        if count == 0 {
            return None;
        }

        let average_power = (Decimal::from(total) / Decimal::from(count)).round_dp(1);
        if rolling.is_empty() {
            return Some(PowerSummary {
                normalized_power: average_power,
                average_power,
                full_window: false,
            });
        }

        // Fourth powers in f64 to avoid Decimal overflow
        let mean_fourth = rolling.iter().map(|p| p.powi(4)).sum::<f64>() / rolling.len() as f64;
        let normalized_power = Decimal::from_f64(mean_fourth.sqrt().sqrt())?.round_dp(1);

        Some(PowerSummary {
            normalized_power,
            average_power,
            full_window: true,
        })
    }

    /// Distance and time while moving, with gradient-adjusted time.
    /// Falls back to the summary distance when the stream has none.
    pub fn pace_summary(&self, input: &TssInput<'_>) -> Option<PaceSummary> {
        let mut distance = Decimal::ZERO;
        let mut elapsed = Decimal::ZERO;
        let mut graded = Decimal::ZERO;

        for interval in input.intervals {
            let end = interval.end_index.min(input.samples.len());
            for i in interval.start_index..end.saturating_sub(1) {
                let (a, b) = (&input.samples[i], &input.samples[i + 1]);
                let dt = Decimal::new((b.timestamp - a.timestamp).num_milliseconds(), 3);

                let covered = match (a.distance, b.distance, b.speed) {
                    (Some(d0), Some(d1), _) => d1 - d0,
                    (_, _, Some(speed)) => speed * dt,
                    _ => continue,
                };
                if covered <= Decimal::ZERO || dt <= Decimal::ZERO {
                    continue;
                }

                let factor = match (a.altitude, b.altitude) {
                    (Some(a0), Some(a1)) => grade_factor((a1 - a0) / covered * dec!(100)),
                    _ => Decimal::ONE,
                };

                distance += covered;
                elapsed += dt;
                graded += dt / factor;
            }
        }

        if distance > Decimal::ZERO {
            return Some(PaceSummary {
                distance_m: distance,
                elapsed_secs: elapsed,
                graded_secs: graded,
            });
        }

        let total = input.total_distance_m.filter(|d| *d > Decimal::ZERO)?;
        if input.duration_sec == 0 {
            return None;
        }
        let secs = Decimal::from(input.duration_sec);
        Some(PaceSummary {
            distance_m: total,
            elapsed_secs: secs,
            graded_secs: secs,
        })
    }

    /// Validate TSS result for sanity check
    pub fn validate_tss(&self, tss: Decimal, duration_seconds: u32) -> Result<Decimal> {
        if tss < Decimal::ZERO {
            return Err(EngineError::Validation("TSS cannot be negative".to_string()));
        }

        let duration_hours = Decimal::from(duration_seconds) / dec!(3600);
        let max_reasonable_tss = duration_hours * self.config.max_tss_per_hour;
        if tss > max_reasonable_tss {
            return Err(EngineError::Validation(format!(
                "TSS {} seems unreasonably high for duration",
                tss
            )));
        }

        Ok(tss)
    }
}

fn missing(threshold: &str) -> String {
    EngineError::ThresholdMissing {
        threshold: threshold.to_string(),
    }
    .to_string()
}

/// Power samples of each active interval, split where consecutive power
/// samples are more than `max_gap` apart
fn power_segments<'a>(
    samples: &'a [MergedSample],
    intervals: &[ActiveInterval],
    max_gap: Duration,
) -> Vec<Vec<&'a MergedSample>> {
    let mut segments = Vec::new();
    for interval in intervals {
        let end = interval.end_index.min(samples.len());
        let mut current: Vec<&MergedSample> = Vec::new();
        for sample in samples[interval.start_index.min(end)..end]
            .iter()
            .filter(|s| s.power.is_some())
        {
            if current
                .last()
                .is_some_and(|prev| sample.timestamp - prev.timestamp > max_gap)
            {
                segments.push(std::mem::take(&mut current));
            }
            current.push(sample);
        }
        if !current.is_empty() {
            segments.push(current);
        }
    }
    segments
}

/// Effort multiplier for running on a gradient given in percent.
/// Steep uphill grows faster, steep downhill helps less.
pub fn grade_factor(grade_pct: Decimal) -> Decimal {
    let grade = grade_pct.clamp(dec!(-30), dec!(30));
    if grade.abs() <= dec!(10) {
        Decimal::ONE + grade * dec!(0.033)
    } else if grade > dec!(10) {
        Decimal::ONE + grade * dec!(0.05)
    } else {
        Decimal::ONE + grade * dec!(0.02)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::{ZoneLabel, ZoneMetric};
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn power_samples(powers: &[u16]) -> Vec<MergedSample> {
        let start = Utc.with_ymd_and_hms(2024, 9, 23, 7, 0, 0).unwrap();
        powers
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut sample = MergedSample::empty(start + Duration::seconds(i as i64));
                sample.power = Some(*p);
                sample
            })
            .collect()
    }

    fn whole(samples: &[MergedSample]) -> Vec<ActiveInterval> {
        if samples.is_empty() {
            return Vec::new();
        }
        vec![ActiveInterval {
            start_index: 0,
            end_index: samples.len(),
            start: samples[0].timestamp,
            end: samples[samples.len() - 1].timestamp,
        }]
    }

    fn run_samples(seconds: usize, speed: Decimal, climb_per_sec: Decimal) -> Vec<MergedSample> {
        let start = Utc.with_ymd_and_hms(2024, 9, 23, 7, 0, 0).unwrap();
        (0..seconds)
            .map(|i| {
                let mut sample = MergedSample::empty(start + Duration::seconds(i as i64));
                sample.distance = Some(speed * Decimal::from(i));
                sample.altitude = Some(dec!(100) + climb_per_sec * Decimal::from(i));
                sample.speed = Some(speed);
                sample
            })
            .collect()
    }

    fn input<'a>(
        sport: Sport,
        duration_sec: u32,
        samples: &'a [MergedSample],
        intervals: &'a [ActiveInterval],
        thresholds: &'a AthleteThresholds,
    ) -> TssInput<'a> {
        TssInput {
            sport,
            duration_sec,
            samples,
            intervals,
            thresholds,
            heart_rate_zones: None,
            total_distance_m: None,
            nominal_delta_secs: Decimal::ONE,
        }
    }

    #[test]
    fn test_constant_power_closed_form() {
        let samples = power_samples(&[200; 3600]);
        let intervals = whole(&samples);
        let thresholds = AthleteThresholds {
            ftp: Some(250),
            ..Default::default()
        };

        let result = TssCalculator::default().calculate(&input(
            Sport::Bike,
            3600,
            &samples,
            &intervals,
            &thresholds,
        ));

        assert_eq!(result.method, TssMethod::PowerBased);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.normalized_power, Some(dec!(200)));
        assert_eq!(result.intensity_factor, Some(dec!(0.8)));
        assert_eq!(result.tss, dec!(64));
    }

    #[test]
    fn test_short_power_uses_average() {
        let samples = power_samples(&[100, 200, 300, 200, 100]);
        let intervals = whole(&samples);
        let summary = TssCalculator::default()
            .normalized_power(&samples, &intervals, Decimal::ONE)
            .unwrap();

        assert!(!summary.full_window);
        assert_eq!(summary.normalized_power, dec!(180));

        let thresholds = AthleteThresholds {
            ftp: Some(250),
            ..Default::default()
        };
        let result =
            TssCalculator::default().calculate(&input(Sport::Bike, 5, &samples, &intervals, &thresholds));
        assert_eq!(result.confidence, Confidence::Approximate);
    }

    #[test]
    fn test_exactly_window_length_is_full() {
        let samples = power_samples(&[150; 30]);
        let intervals = whole(&samples);
        let summary = TssCalculator::default()
            .normalized_power(&samples, &intervals, Decimal::ONE)
            .unwrap();
        assert!(summary.full_window);
        assert_eq!(summary.normalized_power, dec!(150));
    }

    #[test]
    fn test_variable_power_np_above_average() {
        let mut powers = vec![100u16; 300];
        powers.extend(vec![350u16; 300]);
        let samples = power_samples(&powers);
        let intervals = whole(&samples);

        let summary = TssCalculator::default()
            .normalized_power(&samples, &intervals, Decimal::ONE)
            .unwrap();
        assert_eq!(summary.average_power, dec!(225));
        assert!(summary.normalized_power > summary.average_power);
    }

    #[test]
    fn test_missing_ftp_falls_back_to_heart_rate() {
        let samples = power_samples(&[200; 600]);
        let intervals = whole(&samples);
        let thresholds = AthleteThresholds::default();

        let mut zone_minutes = BTreeMap::new();
        zone_minutes.insert(ZoneLabel::Z4, dec!(60));
        let hr = ZoneTimeBreakdown {
            metric: ZoneMetric::HeartRate,
            available: true,
            unavailable_reason: None,
            zone_minutes,
            total_duration_minutes: dec!(60),
        };

        let mut tss_input = input(Sport::Bike, 3600, &samples, &intervals, &thresholds);
        tss_input.heart_rate_zones = Some(&hr);
        let result = TssCalculator::default().calculate(&tss_input);

        assert_eq!(result.method, TssMethod::HeartRateBased);
        assert_eq!(result.confidence, Confidence::Fallback);
        assert_eq!(result.tss, dec!(100));
        assert!(result.warnings.iter().any(|w| w.contains("FTP")));
    }

    #[test]
    fn test_estimated_when_nothing_usable() {
        let thresholds = AthleteThresholds::default();
        let result = TssCalculator::default().calculate(&input(Sport::Swim, 3600, &[], &[], &thresholds));
        assert_eq!(result.method, TssMethod::Estimated);
        assert_eq!(result.tss, dec!(80));
        assert_eq!(result.confidence, Confidence::Fallback);

        let result =
            TssCalculator::default().calculate(&input(Sport::Strength, 1800, &[], &[], &thresholds));
        assert_eq!(result.tss, dec!(25));
    }

    #[test]
    fn test_gps_only_run_is_pace_based_fallback() {
        // 4 m/s is 250 s/km, threshold 250 s/km gives IF 1.0
        let samples = run_samples(600, dec!(4), Decimal::ZERO);
        let intervals = whole(&samples);
        let thresholds = AthleteThresholds {
            threshold_pace: Some(dec!(250)),
            ..Default::default()
        };

        let result =
            TssCalculator::default().calculate(&input(Sport::Run, 3600, &samples, &intervals, &thresholds));
        assert_eq!(result.method, TssMethod::PaceBased);
        assert_eq!(result.confidence, Confidence::Fallback);
        assert_eq!(result.intensity_factor, Some(dec!(1)));
        assert_eq!(result.tss, dec!(100));
    }

    #[test]
    fn test_uphill_run_scores_higher() {
        let thresholds = AthleteThresholds {
            threshold_pace: Some(dec!(250)),
            ..Default::default()
        };
        let flat = run_samples(600, dec!(4), Decimal::ZERO);
        let hill = run_samples(600, dec!(4), dec!(0.2));
        let flat_intervals = whole(&flat);
        let hill_intervals = whole(&hill);

        let calc = TssCalculator::default();
        let flat_tss = calc
            .calculate(&input(Sport::Run, 600, &flat, &flat_intervals, &thresholds))
            .tss;
        let hill_tss = calc
            .calculate(&input(Sport::Run, 600, &hill, &hill_intervals, &thresholds))
            .tss;
        assert!(hill_tss > flat_tss);
    }

    #[test]
    fn test_run_power_preferred_over_pace() {
        let mut samples = run_samples(120, dec!(4), Decimal::ZERO);
        for sample in samples.iter_mut() {
            sample.power = Some(260);
        }
        let intervals = whole(&samples);
        let thresholds = AthleteThresholds {
            run_critical_power: Some(260),
            threshold_pace: Some(dec!(250)),
            ..Default::default()
        };

        let result =
            TssCalculator::default().calculate(&input(Sport::Run, 3600, &samples, &intervals, &thresholds));
        assert_eq!(result.method, TssMethod::PowerBased);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.tss, dec!(100));
    }

    #[test]
    fn test_swim_css_tss() {
        // 1 m/s is 100 s per 100 m; CSS 90 s gives IF 0.9
        let samples = run_samples(300, dec!(1), Decimal::ZERO);
        let intervals = whole(&samples);
        let thresholds = AthleteThresholds {
            css_pace: Some(dec!(90)),
            ..Default::default()
        };

        let result = TssCalculator::default().calculate(&input(
            Sport::Swim,
            3600,
            &samples,
            &intervals,
            &thresholds,
        ));
        assert_eq!(result.method, TssMethod::PaceBased);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.tss, dec!(81));
    }

    #[test]
    fn test_swim_summary_distance_fallback() {
        let thresholds = AthleteThresholds {
            css_pace: Some(dec!(100)),
            ..Default::default()
        };
        let mut tss_input = input(Sport::Swim, 2000, &[], &[], &thresholds);
        tss_input.total_distance_m = Some(dec!(2000));

        let result = TssCalculator::default().calculate(&tss_input);
        assert_eq!(result.method, TssMethod::PaceBased);
        assert_eq!(result.intensity_factor, Some(dec!(1)));
    }

    #[test]
    fn test_tss_validation() {
        let calc = TssCalculator::default();
        assert!(calc.validate_tss(dec!(100), 3600).is_ok());
        assert!(calc.validate_tss(dec!(-1), 3600).is_err());
        assert!(calc.validate_tss(dec!(400), 3600).is_err());
    }

    #[test]
    fn test_grade_factor() {
        assert_eq!(grade_factor(Decimal::ZERO), Decimal::ONE);
        assert_eq!(grade_factor(dec!(5)), dec!(1.165));
        assert_eq!(grade_factor(dec!(20)), dec!(2.0));
        assert_eq!(grade_factor(dec!(-20)), dec!(0.6));
    }

    #[test]
    fn test_power_dropout_splits_segments() {
        let mut samples = power_samples(&[200; 40]);
        for sample in &mut samples[20..27] {
            sample.power = None;
        }
        let intervals = whole(&samples);
        let segments = power_segments(&samples, &intervals, Duration::seconds(5));
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 20);
        assert_eq!(segments[1].len(), 13);

        // A single missing reading is not a dropout
        let mut samples = power_samples(&[200; 40]);
        samples[20].power = None;
        let segments = power_segments(&samples, &intervals, Duration::seconds(5));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len(), 39);
    }

    #[test]
    fn test_interleaved_slots_keep_power_continuous() {
        // Power on every other slot of a 2 Hz merged stream
        let start = Utc.with_ymd_and_hms(2024, 9, 23, 7, 0, 0).unwrap();
        let samples: Vec<MergedSample> = (0..7200)
            .map(|i| {
                let mut sample = MergedSample::empty(start + Duration::milliseconds(i * 500));
                sample.heart_rate = Some(150);
                if i % 2 == 0 {
                    sample.power = Some(250);
                }
                sample
            })
            .collect();
        let intervals = whole(&samples);
        let thresholds = AthleteThresholds {
            ftp: Some(250),
            ..Default::default()
        };

        let summary = TssCalculator::default()
            .normalized_power(&samples, &intervals, Decimal::ONE)
            .unwrap();
        assert!(summary.full_window);
        assert_eq!(summary.normalized_power, dec!(250));
        assert_eq!(summary.average_power, dec!(250));

        let result = TssCalculator::default()
            .calculate(&input(Sport::Bike, 3600, &samples, &intervals, &thresholds));
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.tss, dec!(100));
        assert!(result.warnings.is_empty());
    }

    proptest! {
        #[test]
        fn test_constant_power_np_equals_power(
            power in 50u16..600u16,
            seconds in 30usize..900usize,
        ) {
            let samples = power_samples(&vec![power; seconds]);
            let intervals = whole(&samples);
            let summary = TssCalculator::default()
                .normalized_power(&samples, &intervals, Decimal::ONE)
                .unwrap();

            prop_assert!(summary.full_window);
            prop_assert_eq!(summary.normalized_power, Decimal::from(power));
        }

        #[test]
        fn test_tss_scales_with_duration(
            power in 150u16..300u16,
            duration in 1800u32..3600u32,
        ) {
            let samples = power_samples(&[power; 120]);
            let intervals = whole(&samples);
            let thresholds = AthleteThresholds { ftp: Some(250), ..Default::default() };
            let calc = TssCalculator::default();

            let single = calc.calculate(&input(Sport::Bike, duration, &samples, &intervals, &thresholds)).tss;
            let double = calc.calculate(&input(Sport::Bike, duration * 2, &samples, &intervals, &thresholds)).tss;

            prop_assert!(single > Decimal::ZERO);
            let diff = (double - single * dec!(2)).abs();
            prop_assert!(diff <= dec!(0.2));
        }
    }
}
