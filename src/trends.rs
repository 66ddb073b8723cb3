//! Structured trend signals for downstream text generation
//!
//! Consumers that explain an athlete's state in prose need facts, not prose:
//! which way a metric is moving, how far, whether the latest day broke
//! sharply from the one before, and how unusual the latest value is.

use chrono::NaiveDate;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::{EngineError, Result};
use crate::models::Confidence;
use crate::pmc::{DailyTrainingLoad, TsbInterpretation};

/// Thresholds for trend classification, in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Values averaged at each end of the series
    pub window: usize,

    pub moderate_change_pct: Decimal,
    pub significant_change_pct: Decimal,

    /// Day-over-day change that counts as acute
    pub acute_change_pct: Decimal,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            window: 3,
            moderate_change_pct: dec!(5),
            significant_change_pct: dec!(10),
            acute_change_pct: dec!(15),
        }
    }
}

/// Whether a rising value is good or bad news
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    HigherIsBetter,
    LowerIsBetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendFlag {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMagnitude {
    Negligible,
    Moderate,
    Significant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: Decimal,
}

/// A sharp day-over-day move at the end of the series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcuteChange {
    pub date: NaiveDate,
    pub change_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSignal {
    pub metric: String,
    pub direction: TrendFlag,
    pub magnitude: ChangeMagnitude,

    /// Recent mean relative to the baseline mean
    pub change_pct: Decimal,
    pub baseline_mean: Decimal,
    pub recent_mean: Decimal,

    /// Latest value against the distribution of the earlier values
    pub z_score: Option<f64>,

    pub acute_change: Option<AcuteChange>,
}

/// Snapshot of an athlete's load state for one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub date: NaiveDate,
    pub ctl: Decimal,
    pub atl: Decimal,
    pub tsb: Decimal,
    pub form: TsbInterpretation,
    pub confidence: Confidence,
    pub ctl_ramp_rate: Option<Decimal>,

    /// Mean weekly CTL ramp over the days that have one
    pub avg_ctl_ramp_rate: Option<Decimal>,
    pub atl_spike_count: usize,
    pub days_since_last_spike: Option<usize>,

    pub fitness: TrendSignal,
    pub fatigue: TrendSignal,
    pub form_trend: TrendSignal,
}

#[derive(Debug, Clone, Default)]
pub struct TrendAnalyzer {
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        TrendAnalyzer { config }
    }

    /// Compare the mean of the last `window` values with the first `window`
    pub fn analyze(&self, metric: &str, points: &[SeriesPoint], polarity: Polarity) -> Result<TrendSignal> {
        if points.len() < 2 {
            return Err(EngineError::InsufficientHistory {
                available_days: points.len() as u32,
                required_days: 2,
            });
        }

        let window = self.config.window.clamp(1, points.len());
        let baseline_mean = mean(&points[..window]);
        let recent_mean = mean(&points[points.len() - window..]);
        let change_pct = percent_change(baseline_mean, recent_mean);

        let magnitude = if change_pct.abs() >= self.config.significant_change_pct {
            ChangeMagnitude::Significant
        } else if change_pct.abs() >= self.config.moderate_change_pct {
            ChangeMagnitude::Moderate
        } else {
            ChangeMagnitude::Negligible
        };

        let direction = match (magnitude, change_pct > Decimal::ZERO, polarity) {
            (ChangeMagnitude::Negligible, _, _) => TrendFlag::Stable,
            (_, true, Polarity::HigherIsBetter) | (_, false, Polarity::LowerIsBetter) => {
                TrendFlag::Improving
            }
            _ => TrendFlag::Declining,
        };

        Ok(TrendSignal {
            metric: metric.to_string(),
            direction,
            magnitude,
            change_pct: change_pct.round_dp(1),
            baseline_mean: baseline_mean.round_dp(2),
            recent_mean: recent_mean.round_dp(2),
            z_score: z_score(points),
            acute_change: self.acute_change(points),
        })
    }

    /// Trend signals and form band for the last day of a load series
    pub fn load_snapshot(&self, series: &[DailyTrainingLoad]) -> Result<LoadSnapshot> {
        let last = series.last().ok_or(EngineError::InsufficientHistory {
            available_days: 0,
            required_days: 2,
        })?;

        let points = |get: fn(&DailyTrainingLoad) -> Decimal| -> Vec<SeriesPoint> {
            series
                .iter()
                .map(|day| SeriesPoint {
                    date: day.date,
                    value: get(day),
                })
                .collect()
        };

        let ramp_rates: Vec<Decimal> = series.iter().filter_map(|d| d.ctl_ramp_rate).collect();
        let avg_ctl_ramp_rate = (!ramp_rates.is_empty()).then(|| {
            let sum: Decimal = ramp_rates.iter().sum();
            (sum / Decimal::from(ramp_rates.len())).round_dp(1)
        });

        Ok(LoadSnapshot {
            date: last.date,
            ctl: last.ctl.round_dp(1),
            atl: last.atl.round_dp(1),
            tsb: last.tsb.round_dp(1),
            form: TsbInterpretation::from_tsb(last.tsb),
            confidence: last.confidence,
            ctl_ramp_rate: last.ctl_ramp_rate.map(|r| r.round_dp(1)),
            avg_ctl_ramp_rate,
            atl_spike_count: series.iter().filter(|d| d.atl_spike).count(),
            days_since_last_spike: series.iter().rev().position(|d| d.atl_spike),
            fitness: self.analyze("ctl", &points(|d| d.ctl), Polarity::HigherIsBetter)?,
            fatigue: self.analyze("atl", &points(|d| d.atl), Polarity::LowerIsBetter)?,
            form_trend: self.analyze("tsb", &points(|d| d.tsb), Polarity::HigherIsBetter)?,
        })
    }

    fn acute_change(&self, points: &[SeriesPoint]) -> Option<AcuteChange> {
        let [.., previous, latest] = points else {
            return None;
        };
        let change_pct = percent_change(previous.value, latest.value);
        (change_pct.abs() > self.config.acute_change_pct).then(|| AcuteChange {
            date: latest.date,
            change_pct: change_pct.round_dp(1),
        })
    }
}

fn mean(points: &[SeriesPoint]) -> Decimal {
    let sum: Decimal = points.iter().map(|p| p.value).sum();
    sum / Decimal::from(points.len())
}

fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    (to - from) / from.abs().max(Decimal::ONE) * dec!(100)
}

/// z-score of the latest value against all earlier values; `None` when the
/// earlier values have no spread
fn z_score(points: &[SeriesPoint]) -> Option<f64> {
    let (latest, earlier) = points.split_last()?;
    if earlier.len() < 2 {
        return None;
    }

    let values: Vec<f64> = earlier.iter().filter_map(|p| p.value.to_f64()).collect();
    let mean = values.iter().mean();
    let std_dev = values.iter().std_dev();
    if !std_dev.is_finite() || std_dev == 0.0 {
        return None;
    }

    latest.value.to_f64().map(|v| (v - mean) / std_dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmc::PmcCalculator;
    use std::collections::BTreeMap;

    fn points(values: &[i64]) -> Vec<SeriesPoint> {
        let start = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        start
            .iter_days()
            .zip(values)
            .map(|(date, v)| SeriesPoint {
                date,
                value: Decimal::from(*v),
            })
            .collect()
    }

    #[test]
    fn test_rising_value_with_polarity() {
        let analyzer = TrendAnalyzer::default();
        let series = points(&[50, 50, 50, 55, 60, 60, 60]);

        let hrv = analyzer.analyze("hrv", &series, Polarity::HigherIsBetter).unwrap();
        assert_eq!(hrv.direction, TrendFlag::Improving);
        assert_eq!(hrv.magnitude, ChangeMagnitude::Significant);
        assert_eq!(hrv.change_pct, dec!(20.0));

        let resting_hr = analyzer.analyze("resting_hr", &series, Polarity::LowerIsBetter).unwrap();
        assert_eq!(resting_hr.direction, TrendFlag::Declining);
    }

    #[test]
    fn test_small_change_is_stable() {
        let analyzer = TrendAnalyzer::default();
        let series = points(&[100, 101, 100, 102, 103, 102]);
        let signal = analyzer.analyze("sleep", &series, Polarity::HigherIsBetter).unwrap();
        assert_eq!(signal.direction, TrendFlag::Stable);
        assert_eq!(signal.magnitude, ChangeMagnitude::Negligible);
    }

    #[test]
    fn test_moderate_change() {
        let analyzer = TrendAnalyzer::default();
        let series = points(&[100, 100, 100, 107, 107, 107]);
        let signal = analyzer.analyze("ctl", &series, Polarity::HigherIsBetter).unwrap();
        assert_eq!(signal.magnitude, ChangeMagnitude::Moderate);
    }

    #[test]
    fn test_acute_change_detected() {
        let analyzer = TrendAnalyzer::default();
        let series = points(&[60, 61, 59, 60, 45]);
        let signal = analyzer.analyze("hrv", &series, Polarity::HigherIsBetter).unwrap();

        let acute = signal.acute_change.unwrap();
        assert_eq!(acute.change_pct, dec!(-25.0));
        assert!(signal.z_score.unwrap() < -2.0);
    }

    #[test]
    fn test_flat_history_has_no_z_score() {
        let analyzer = TrendAnalyzer::default();
        let signal = analyzer
            .analyze("ctl", &points(&[40, 40, 40, 41]), Polarity::HigherIsBetter)
            .unwrap();
        assert!(signal.z_score.is_none());
        assert!(signal.acute_change.is_none());
    }

    #[test]
    fn test_single_point_is_insufficient() {
        let analyzer = TrendAnalyzer::default();
        let result = analyzer.analyze("ctl", &points(&[40]), Polarity::HigherIsBetter);
        assert!(matches!(result, Err(EngineError::InsufficientHistory { .. })));
    }

    #[test]
    fn test_load_snapshot() {
        let calculator = PmcCalculator::new();
        let start = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        let history: BTreeMap<NaiveDate, Decimal> =
            start.iter_days().take(14).map(|d| (d, dec!(90))).collect();
        let end = start + chrono::Days::new(13);
        let series = calculator.calculate_series(&history, start, end, None).unwrap();

        let snapshot = TrendAnalyzer::default().load_snapshot(&series).unwrap();
        assert_eq!(snapshot.date, end);
        assert_eq!(snapshot.fitness.direction, TrendFlag::Improving);
        assert_eq!(snapshot.form, TsbInterpretation::from_tsb(series[13].tsb));
        assert_eq!(snapshot.confidence, Confidence::Approximate);
        assert!(snapshot.avg_ctl_ramp_rate.unwrap() > Decimal::ZERO);
        assert_eq!(snapshot.form_trend.metric, "tsb");
        assert_eq!(
            snapshot.atl_spike_count == 0,
            snapshot.days_since_last_spike.is_none()
        );

        assert!(TrendAnalyzer::default().load_snapshot(&[]).is_err());
    }

    #[test]
    fn test_load_snapshot_counts_spikes() {
        let calculator = PmcCalculator::new();
        let start = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        let mut history: BTreeMap<NaiveDate, Decimal> =
            start.iter_days().take(20).map(|d| (d, dec!(40))).collect();
        history.insert(start + chrono::Days::new(17), dec!(400));
        let end = start + chrono::Days::new(19);
        let series = calculator.calculate_series(&history, start, end, None).unwrap();

        let snapshot = TrendAnalyzer::default().load_snapshot(&series).unwrap();
        let spikes = series.iter().filter(|d| d.atl_spike).count();
        assert_eq!(snapshot.atl_spike_count, spikes);
        if let Some(days) = snapshot.days_since_last_spike {
            assert!(series[series.len() - 1 - days].atl_spike);
        }
    }
}
