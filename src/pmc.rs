use crate::error::{EngineError, Result};
use crate::models::{Confidence, Workout};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One day of TSS history as supplied by a history store or CSV file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTssEntry {
    pub date: NaiveDate,
    pub tss: Decimal,
}

/// Daily TSS record with optional workout data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTss {
    /// Date of the training day
    pub date: NaiveDate,

    /// Total TSS for the day (sum of all workouts)
    pub total_tss: Decimal,

    /// Number of workouts completed on this day
    pub workout_count: u16,

    /// Individual workout TSS values for detailed analysis
    pub workout_tss_values: Vec<Decimal>,
}

/// Fitness, fatigue and form for one athlete on one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTrainingLoad {
    pub date: NaiveDate,

    /// TSS summed over the day's workouts, zero on rest days
    pub daily_tss: Decimal,

    /// Chronic Training Load (42-day exponentially weighted average)
    pub ctl: Decimal,

    /// Acute Training Load (7-day exponentially weighted average)
    pub atl: Decimal,

    /// Training Stress Balance, same-day CTL minus ATL
    pub tsb: Decimal,

    /// Approximate until the warm-up window has elapsed
    pub confidence: Confidence,

    /// Days folded so far, this one included
    pub history_days: u32,

    /// Ramp rate (CTL change per week)
    pub ctl_ramp_rate: Option<Decimal>,

    /// ATL spike indicator (unusually high recent load)
    pub atl_spike: bool,
}

/// How the fold starts for an athlete without carried-over state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedStrategy {
    /// CTL = ATL = 0 before the first day
    Zero,
    /// CTL = ATL = first day's TSS
    FirstDay,
}

/// Load state at the end of the day before a computation starts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSeed {
    pub ctl: Decimal,
    pub atl: Decimal,
    pub days_of_history: u32,
}

impl From<&DailyTrainingLoad> for LoadSeed {
    fn from(day: &DailyTrainingLoad) -> Self {
        LoadSeed {
            ctl: day.ctl,
            atl: day.atl,
            days_of_history: day.history_days,
        }
    }
}

/// PMC configuration with customizable time constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmcConfig {
    /// CTL time constant in days (default: 42)
    pub ctl_time_constant: u16,

    /// ATL time constant in days (default: 7)
    pub atl_time_constant: u16,

    /// Days of history before values are reported with full confidence
    pub warmup_days: u32,

    /// ATL spike threshold (ratio to the previous week's average)
    pub atl_spike_threshold: Decimal,

    /// Ramp rate calculation period in days
    pub ramp_rate_days: u16,

    pub seed: SeedStrategy,
}

impl Default for PmcConfig {
    fn default() -> Self {
        PmcConfig {
            ctl_time_constant: 42,
            atl_time_constant: 7,
            warmup_days: 42,
            atl_spike_threshold: dec!(1.5), // 50% above average
            ramp_rate_days: 7,
            seed: SeedStrategy::Zero,
        }
    }
}

/// Training Stress Balance interpretation ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TsbInterpretation {
    VeryFresh,    // +25 and above
    Fresh,        // +5 to +25
    Neutral,      // -10 to +5
    Fatigued,     // -30 to -10
    VeryFatigued, // Below -30
}

impl TsbInterpretation {
    /// Get TSB interpretation from numeric value
    pub fn from_tsb(tsb: Decimal) -> Self {
        if tsb >= dec!(25) {
            TsbInterpretation::VeryFresh
        } else if tsb >= dec!(5) {
            TsbInterpretation::Fresh
        } else if tsb >= dec!(-10) {
            TsbInterpretation::Neutral
        } else if tsb >= dec!(-30) {
            TsbInterpretation::Fatigued
        } else {
            TsbInterpretation::VeryFatigued
        }
    }

    /// Get interpretation description
    pub fn description(&self) -> &'static str {
        match self {
            TsbInterpretation::VeryFresh => "Very fresh (may be losing fitness)",
            TsbInterpretation::Fresh => "Fresh and ready for hard training/racing",
            TsbInterpretation::Neutral => "Neutral (normal training)",
            TsbInterpretation::Fatigued => "Fatigued (monitor closely)",
            TsbInterpretation::VeryFatigued => "Very fatigued (rest needed)",
        }
    }

    /// Get training recommendation
    pub fn recommendation(&self) -> &'static str {
        match self {
            TsbInterpretation::VeryFresh => {
                "Consider increasing training load or plan peak performance"
            }
            TsbInterpretation::Fresh => "Good time for high-intensity sessions or racing",
            TsbInterpretation::Neutral => "Continue normal training progression",
            TsbInterpretation::Fatigued => "Reduce intensity, focus on recovery sessions",
            TsbInterpretation::VeryFatigued => {
                "Prioritize rest and recovery before resuming training"
            }
        }
    }
}

/// Core PMC calculation engine
#[derive(Debug, Clone)]
pub struct PmcCalculator {
    config: PmcConfig,
}

impl PmcCalculator {
    /// Create new PMC calculator with default configuration
    pub fn new() -> Self {
        PmcCalculator {
            config: PmcConfig::default(),
        }
    }

    /// Create new PMC calculator with custom configuration
    pub fn with_config(config: PmcConfig) -> Self {
        PmcCalculator { config }
    }

    pub fn config(&self) -> &PmcConfig {
        &self.config
    }

    /// Aggregate daily TSS from a collection of workouts
    pub fn aggregate_daily_tss(&self, workouts: &[Workout]) -> BTreeMap<NaiveDate, DailyTss> {
        let mut daily_tss: BTreeMap<NaiveDate, DailyTss> = BTreeMap::new();

        for workout in workouts {
            let tss = workout.tss.as_ref().map(|t| t.tss).unwrap_or(Decimal::ZERO);
            let date = workout.date();

            daily_tss
                .entry(date)
                .and_modify(|day| {
                    day.total_tss += tss;
                    day.workout_count += 1;
                    day.workout_tss_values.push(tss);
                })
                .or_insert(DailyTss {
                    date,
                    total_tss: tss,
                    workout_count: 1,
                    workout_tss_values: vec![tss],
                });
        }

        daily_tss
    }

    /// Fold history into CTL/ATL/TSB for every calendar day in `[start, end]`.
    ///
    /// Rest days are zero. `seed` carries the state of the day before `start`
    /// for incremental recomputation; without it the configured seed
    /// strategy applies.
    pub fn calculate_series(
        &self,
        daily_tss: &BTreeMap<NaiveDate, Decimal>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        seed: Option<LoadSeed>,
    ) -> Result<Vec<DailyTrainingLoad>> {
        if start_date > end_date {
            return Err(EngineError::Validation(format!(
                "Start date {} is after end date {}",
                start_date, end_date
            )));
        }
        self.validate_config()?;

        let tss_on = |date: NaiveDate| daily_tss.get(&date).copied().unwrap_or(Decimal::ZERO);

        let seed = seed.unwrap_or_else(|| match self.config.seed {
            SeedStrategy::Zero => LoadSeed {
                ctl: Decimal::ZERO,
                atl: Decimal::ZERO,
                days_of_history: 0,
            },
            SeedStrategy::FirstDay => LoadSeed {
                ctl: tss_on(start_date),
                atl: tss_on(start_date),
                days_of_history: 0,
            },
        });

        let ctl_tc = Decimal::from(self.config.ctl_time_constant);
        let atl_tc = Decimal::from(self.config.atl_time_constant);

        let mut series: Vec<DailyTrainingLoad> = Vec::new();
        let mut ctl_history = vec![seed.ctl];
        let mut ctl = seed.ctl;
        let mut atl = seed.atl;
        let mut history_days = seed.days_of_history;

        for date in start_date.iter_days().take_while(|d| *d <= end_date) {
            let tss = tss_on(date);

            ctl += (tss - ctl) / ctl_tc;
            atl += (tss - atl) / atl_tc;
            history_days += 1;
            ctl_history.push(ctl);

            let confidence = if history_days < self.config.warmup_days {
                Confidence::Approximate
            } else {
                Confidence::High
            };

            series.push(DailyTrainingLoad {
                date,
                daily_tss: tss,
                ctl,
                atl,
                tsb: ctl - atl,
                confidence,
                history_days,
                ctl_ramp_rate: self.calculate_ctl_ramp_rate(&ctl_history),
                atl_spike: self.detect_atl_spike(atl, &series),
            });
        }

        if let Some(first) = series.first().filter(|d| d.confidence == Confidence::Approximate) {
            let err = EngineError::InsufficientHistory {
                available_days: first.history_days,
                required_days: self.config.warmup_days,
            };
            debug!(start = %start_date, "{}", err);
        }

        Ok(series)
    }

    /// Fold raw history entries, summing duplicates and sorting by date.
    /// The range defaults to the first and last entry.
    pub fn calculate_from_history(
        &self,
        history: &[DailyTssEntry],
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        seed: Option<LoadSeed>,
    ) -> Result<Vec<DailyTrainingLoad>> {
        let totals = sum_by_date(history);

        let (Some(first), Some(last)) = (
            from.or_else(|| totals.keys().next().copied()),
            to.or_else(|| totals.keys().next_back().copied()),
        ) else {
            return Ok(Vec::new());
        };

        self.calculate_series(&totals, first, last, seed)
    }

    /// Calculate CTL ramp rate (change per week)
    fn calculate_ctl_ramp_rate(&self, ctl_history: &[Decimal]) -> Option<Decimal> {
        let days = self.config.ramp_rate_days as usize;
        if days == 0 || ctl_history.len() <= days {
            return None;
        }

        let recent_ctl = ctl_history[ctl_history.len() - 1];
        let past_ctl = ctl_history[ctl_history.len() - 1 - days];

        let change = recent_ctl - past_ctl;
        let weeks = Decimal::from(days) / dec!(7);
        Some(change / weeks)
    }

    /// Detect ATL spike (unusually high recent load)
    fn detect_atl_spike(&self, current_atl: Decimal, history: &[DailyTrainingLoad]) -> bool {
        if history.len() < 7 {
            return false;
        }

        let recent_atl_avg: Decimal =
            history.iter().rev().take(7).map(|m| m.atl).sum::<Decimal>() / dec!(7);

        current_atl > recent_atl_avg * self.config.atl_spike_threshold
    }

    /// Generate training recommendations based on one day's load
    pub fn generate_recommendations(&self, day: &DailyTrainingLoad) -> Vec<String> {
        let mut recommendations = Vec::new();

        let tsb_interpretation = TsbInterpretation::from_tsb(day.tsb);
        recommendations.push(tsb_interpretation.recommendation().to_string());

        if let Some(ramp_rate) = day.ctl_ramp_rate {
            if ramp_rate > dec!(8) {
                recommendations
                    .push("CTL ramp rate is aggressive - monitor for overreaching".to_string());
            } else if ramp_rate < dec!(-5) {
                recommendations.push(
                    "CTL is declining rapidly - consider increasing training load".to_string(),
                );
            }
        }

        if day.atl_spike {
            recommendations.push("ATL spike detected - plan recovery in coming days".to_string());
        }

        if day.confidence == Confidence::Approximate {
            recommendations.push(format!(
                "Fewer than {} days of history - treat fitness values as approximate",
                self.config.warmup_days
            ));
        }

        recommendations
    }

    fn validate_config(&self) -> Result<()> {
        if self.config.ctl_time_constant == 0 || self.config.atl_time_constant == 0 {
            return Err(EngineError::Configuration(
                "PMC time constants must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PmcCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum history entries per date
pub fn sum_by_date(history: &[DailyTssEntry]) -> BTreeMap<NaiveDate, Decimal> {
    let mut totals = BTreeMap::new();
    for entry in history {
        *totals.entry(entry.date).or_insert(Decimal::ZERO) += entry.tss;
    }
    totals
}
