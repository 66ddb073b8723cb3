//! Orchestration of the per-workout pipeline and training-load recomputation
//!
//! raw records → ingest → merge → zone classification → TSS → workout;
//! workouts bucketed by date → daily TSS → CTL/ATL/TSB.

use chrono::NaiveDate;
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ingest::SampleParser;
use crate::merge::{GapSplit, MergeStatus, SampleMerger};
use crate::models::{AthleteThresholds, Sport, Workout, WorkoutInput};
use crate::pmc::{DailyTrainingLoad, DailyTssEntry, LoadSeed, PmcCalculator};
use crate::tss::{TssCalculator, TssInput};
use crate::zones::{ZoneClassifier, ZoneDefinitionSet, ZoneLabel, ZoneMetric};

/// Supplies per-athlete zone definitions and thresholds
pub trait ProfileStore: Send + Sync {
    fn get_zone_definitions(&self, athlete_id: &str, sport: Sport) -> Result<ZoneDefinitionSet>;

    fn get_thresholds(&self, athlete_id: &str) -> Result<AthleteThresholds>;
}

/// Supplies an athlete's historical daily TSS
pub trait TssHistoryStore: Send + Sync {
    fn get_daily_tss_history(
        &self,
        athlete_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyTssEntry>>;
}

#[derive(Debug, Clone, Default)]
struct StoredProfile {
    thresholds: AthleteThresholds,
    zones: ZoneDefinitionSet,
}

/// Profile store backed by a map, for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, StoredProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        athlete_id: &str,
        thresholds: AthleteThresholds,
        zones: ZoneDefinitionSet,
    ) -> Result<()> {
        let mut profiles = self.profiles.write().map_err(|_| poisoned("profile store"))?;
        profiles.insert(athlete_id.to_string(), StoredProfile { thresholds, zones });
        Ok(())
    }

    fn with_profile<T>(&self, athlete_id: &str, f: impl FnOnce(&StoredProfile) -> T) -> Result<T> {
        let profiles = self.profiles.read().map_err(|_| poisoned("profile store"))?;
        profiles
            .get(athlete_id)
            .map(f)
            .ok_or_else(|| EngineError::Collaborator {
                collaborator: "profile store".to_string(),
                reason: format!("unknown athlete {}", athlete_id),
            })
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn get_zone_definitions(&self, athlete_id: &str, sport: Sport) -> Result<ZoneDefinitionSet> {
        self.with_profile(athlete_id, |p| p.zones.for_sport(sport))
    }

    fn get_thresholds(&self, athlete_id: &str) -> Result<AthleteThresholds> {
        self.with_profile(athlete_id, |p| p.thresholds.clone())
    }
}

/// TSS history backed by a map, for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryTssHistory {
    entries: RwLock<HashMap<String, Vec<DailyTssEntry>>>,
}

impl InMemoryTssHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, athlete_id: &str, entry: DailyTssEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("tss history"))?;
        entries.entry(athlete_id.to_string()).or_default().push(entry);
        Ok(())
    }

    /// Add one entry per workout with a TSS
    pub fn record_workouts(&self, workouts: &[Workout]) -> Result<()> {
        for workout in workouts {
            if let Some(tss) = &workout.tss {
                self.record(
                    &workout.athlete_id,
                    DailyTssEntry {
                        date: workout.date(),
                        tss: tss.tss,
                    },
                )?;
            }
        }
        Ok(())
    }
}

impl TssHistoryStore for InMemoryTssHistory {
    fn get_daily_tss_history(
        &self,
        athlete_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyTssEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned("tss history"))?;
        Ok(entries
            .get(athlete_id)
            .map(|list| {
                list.iter()
                    .filter(|e| e.date >= from && e.date <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn poisoned(collaborator: &str) -> EngineError {
    EngineError::Collaborator {
        collaborator: collaborator.to_string(),
        reason: "lock poisoned".to_string(),
    }
}

/// Hands out one mutex per athlete so load recomputation for an athlete is
/// serialized while different athletes proceed independently.
///
/// Entries live only while someone holds them: `release` drops an athlete's
/// mutex once no caller references it, so the registry stays bounded by the
/// number of athletes with work in flight.
#[derive(Debug, Default)]
pub struct AthleteLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AthleteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, athlete_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| poisoned("athlete locks"))?;
        Ok(locks
            .entry(athlete_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Forget an athlete's mutex if the registry holds the only reference.
    /// Call after dropping the handle from `lock_for`.
    pub fn release(&self, athlete_id: &str) -> Result<()> {
        let mut locks = self.locks.lock().map_err(|_| poisoned("athlete locks"))?;
        if locks
            .get(athlete_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(athlete_id);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A workout plus what was discarded or split on the way
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedWorkout {
    pub workout: Workout,
    pub merge_status: MergeStatus,
    pub dropped_records: usize,
    pub rejected_values: usize,
    pub gaps: Vec<GapSplit>,
}

/// Outcome of a parallel batch
#[derive(Debug)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub processed: Vec<ProcessedWorkout>,

    /// Workout id and error for every input that failed
    pub failures: Vec<(String, EngineError)>,
}

impl BatchReport {
    pub fn workouts(&self) -> Vec<Workout> {
        self.processed.iter().map(|p| p.workout.clone()).collect()
    }
}

pub struct Engine {
    parser: SampleParser,
    merger: SampleMerger,
    classifier: ZoneClassifier,
    tss: TssCalculator,
    pmc: PmcCalculator,
    locks: AthleteLocks,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            parser: SampleParser::new(config.ingest.clone()),
            merger: SampleMerger::new(config.merge.clone()),
            classifier: ZoneClassifier::new(
                config.zones.nominal_sample_secs,
                Decimal::from(config.merge.pause_threshold_secs),
            ),
            tss: TssCalculator::new(config.tss.clone()),
            pmc: PmcCalculator::with_config(config.pmc.clone()),
            locks: AthleteLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pmc(&self) -> &PmcCalculator {
        &self.pmc
    }

    /// Run the full per-workout pipeline
    pub fn process_workout(
        &self,
        input: &WorkoutInput,
        profiles: &dyn ProfileStore,
    ) -> Result<ProcessedWorkout> {
        let span = info_span!("process_workout", workout_id = %input.id, athlete_id = %input.athlete_id);
        let _enter = span.enter();

        if input.id.trim().is_empty() || input.athlete_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "Workout and athlete ids are required".to_string(),
            ));
        }

        let mut streams = Vec::with_capacity(input.streams.len());
        let mut dropped_records = 0;
        let mut rejected_values = 0;
        for raw in &input.streams {
            let parsed = self.parser.parse_stream(raw);
            dropped_records += parsed.dropped_records;
            rejected_values += parsed.rejected_values;
            streams.push(parsed.stream);
        }

        let merged = self.merger.merge(&streams, Some(input.start_time));
        if merged.status == MergeStatus::NoData {
            debug!("No samples, falling back to summary duration");
        }

        let nominal = self.config.zones.nominal_sample_secs;
        let duration_sec = if merged.samples.is_empty() {
            input.duration_sec
        } else {
            merged
                .moving_duration_secs(nominal)
                .round()
                .to_u32()
                .unwrap_or(input.duration_sec)
        };

        let zones = profiles
            .get_zone_definitions(&input.athlete_id, input.sport)
            .unwrap_or_else(|err| {
                warn!("Zone definitions unavailable: {}", err);
                ZoneDefinitionSet::new()
            });
        let thresholds = profiles.get_thresholds(&input.athlete_id).unwrap_or_else(|err| {
            warn!("Thresholds unavailable: {}", err);
            AthleteThresholds::default()
        });

        let zone_breakdowns =
            self.classifier
                .classify(input.sport, &merged.samples, &merged.intervals, &zones);

        let tss = self.tss.calculate(&TssInput {
            sport: input.sport,
            duration_sec,
            samples: &merged.samples,
            intervals: &merged.intervals,
            thresholds: &thresholds,
            heart_rate_zones: zone_breakdowns.get(&ZoneMetric::HeartRate),
            total_distance_m: input.total_distance_m,
            nominal_delta_secs: nominal,
        });

        for warning in &tss.warnings {
            debug!(warning = %warning, "TSS degraded");
        }
        info!(
            samples = merged.samples.len(),
            intervals = merged.intervals.len(),
            dropped_records,
            tss = %tss.tss,
            method = ?tss.method,
            confidence = %tss.confidence,
            "Processed workout"
        );

        Ok(ProcessedWorkout {
            workout: Workout {
                id: input.id.clone(),
                athlete_id: input.athlete_id.clone(),
                sport: input.sport,
                start_time: input.start_time,
                duration_sec,
                total_distance_m: input.total_distance_m,
                merged_samples: merged.samples,
                intervals: merged.intervals,
                tss: Some(tss),
                zone_breakdowns,
            },
            merge_status: merged.status,
            dropped_records,
            rejected_values,
            gaps: merged.gaps,
        })
    }

    /// Process workouts in parallel. A failing workout is reported and does
    /// not affect the others.
    pub fn process_batch(&self, inputs: &[WorkoutInput], profiles: &dyn ProfileStore) -> BatchReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", run_id = %run_id, workouts = inputs.len());
        info!(parent: &span, "Starting batch");

        let results: Vec<(String, Result<ProcessedWorkout>)> = inputs
            .par_iter()
            .map(|input| {
                let _enter = span.enter();
                (input.id.clone(), self.process_workout(input, profiles))
            })
            .collect();

        let mut processed = Vec::new();
        let mut failures = Vec::new();
        for (id, result) in results {
            match result {
                Ok(workout) => processed.push(workout),
                Err(err) => {
                    let _failed = info_span!(parent: &span, "workout", workout_id = %id).entered();
                    err.emit();
                    failures.push((id, err));
                }
            }
        }

        info!(
            parent: &span,
            processed = processed.len(),
            failed = failures.len(),
            "Batch complete"
        );

        BatchReport {
            run_id,
            processed,
            failures,
        }
    }

    /// Recompute an athlete's daily load over `[from, to]`.
    ///
    /// Holds the athlete's lock for the whole read-compute cycle. Pass the
    /// load of the day before `from` as `seed` to resume from a midpoint.
    pub fn recompute_training_load(
        &self,
        athlete_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        history: &dyn TssHistoryStore,
        seed: Option<LoadSeed>,
    ) -> Result<Vec<DailyTrainingLoad>> {
        let lock = self.locks.lock_for(athlete_id)?;
        let series = self.recompute_locked(&lock, athlete_id, from, to, history, seed);
        drop(lock);
        self.locks.release(athlete_id)?;
        let series = series?;

        if let Some(last) = series.last() {
            info!(
                athlete_id,
                days = series.len(),
                ctl = %last.ctl.round_dp(1),
                atl = %last.atl.round_dp(1),
                tsb = %last.tsb.round_dp(1),
                "Recomputed training load"
            );
        }

        Ok(series)
    }

    fn recompute_locked(
        &self,
        lock: &Mutex<()>,
        athlete_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        history: &dyn TssHistoryStore,
        seed: Option<LoadSeed>,
    ) -> Result<Vec<DailyTrainingLoad>> {
        let _guard = lock.lock().map_err(|_| poisoned("athlete locks"))?;

        let entries = history.get_daily_tss_history(athlete_id, from, to)?;
        debug!(athlete_id, entries = entries.len(), "Loaded TSS history");

        self.pmc
            .calculate_from_history(&entries, Some(from), Some(to), seed)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// One history entry per workout date, summing same-day workouts
pub fn daily_tss_from_workouts(workouts: &[Workout]) -> Vec<DailyTssEntry> {
    let calculator = PmcCalculator::new();
    calculator
        .aggregate_daily_tss(workouts)
        .into_values()
        .map(|day| DailyTssEntry {
            date: day.date,
            tss: day.total_tss,
        })
        .collect()
}

/// Zone exposure summed over an athlete's workouts in a date range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthleteZoneSummary {
    pub athlete_id: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub workout_count: usize,
    pub heart_rate_minutes: BTreeMap<ZoneLabel, Decimal>,

    /// Bike and run power together
    pub power_minutes: BTreeMap<ZoneLabel, Decimal>,
    pub total_duration_minutes: Decimal,
}

/// Sum heart-rate and power zone minutes for one athlete. Bounds are
/// inclusive; `None` leaves that side open.
pub fn athlete_zone_summary(
    workouts: &[Workout],
    athlete_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> AthleteZoneSummary {
    let zeroed = || -> BTreeMap<ZoneLabel, Decimal> {
        ZoneLabel::ALL.iter().map(|label| (*label, Decimal::ZERO)).collect()
    };
    let mut summary = AthleteZoneSummary {
        athlete_id: athlete_id.to_string(),
        from,
        to,
        workout_count: 0,
        heart_rate_minutes: zeroed(),
        power_minutes: zeroed(),
        total_duration_minutes: Decimal::ZERO,
    };

    let in_range = |date: NaiveDate| from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t);
    for workout in workouts
        .iter()
        .filter(|w| w.athlete_id == athlete_id && in_range(w.date()))
    {
        summary.workout_count += 1;
        summary.total_duration_minutes += Decimal::from(workout.duration_sec) / Decimal::from(60);

        for (metric, breakdown) in &workout.zone_breakdowns {
            let totals = match metric {
                ZoneMetric::HeartRate => &mut summary.heart_rate_minutes,
                ZoneMetric::BikePower | ZoneMetric::RunPower => &mut summary.power_minutes,
                ZoneMetric::RunPace | ZoneMetric::SwimPace => continue,
            };
            for (label, minutes) in &breakdown.zone_minutes {
                *totals.entry(*label).or_insert(Decimal::ZERO) += *minutes;
            }
        }
    }

    summary.total_duration_minutes = summary.total_duration_minutes.round_dp(2);
    summary
}
