use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::*;
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use trainload::engine::{BatchReport, Engine, ProcessedWorkout};
use trainload::ingest;
use trainload::logging::{init_logging, LogFormat};
use trainload::pmc::{DailyTrainingLoad, DailyTssEntry, LoadSeed, TsbInterpretation};
use trainload::timeseries::{self, SeriesMetric};
use trainload::trends::TrendAnalyzer;
use trainload::zones::ZoneLabel;
use trainload::{EngineConfig, WorkoutInput, WorkoutReport};

/// trainload - workout metrics and training-load engine
///
/// Merges multi-source workout streams, computes zone exposure and TSS,
/// and folds daily TSS into fitness, fatigue and form.
#[derive(Parser)]
#[command(name = "trainload")]
#[command(version)]
#[command(about = "Workout metrics and training-load engine", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity of logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format (pretty, json, compact)
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the per-workout pipeline on a JSON workout (or array of workouts)
    Process {
        /// Workout JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Override the athlete id in the input
        #[arg(short, long)]
        athlete: Option<String>,

        /// Print workout reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fold a `date,tss` CSV history into CTL/ATL/TSB
    Load {
        /// History CSV file
        #[arg(long)]
        history: PathBuf,

        /// First day to report (YYYY-MM-DD)
        #[arg(short, long)]
        from: Option<NaiveDate>,

        /// Last day to report (YYYY-MM-DD)
        #[arg(short, long)]
        to: Option<NaiveDate>,

        /// CTL at the end of the day before `from`
        #[arg(long, requires = "seed_atl")]
        seed_ctl: Option<Decimal>,

        /// ATL at the end of the day before `from`
        #[arg(long, requires = "seed_ctl")]
        seed_atl: Option<Decimal>,

        /// Print the series as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print one metric of a processed workout as a time series
    Series {
        /// Workout JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Metric name (hr, pace, power, speed, cadence, altitude, ...)
        #[arg(short, long)]
        metric: SeriesMetric,
    },

    /// Show or initialize configuration
    Config {
        /// Print the effective configuration
        #[arg(long, conflicts_with = "init")]
        show: bool,

        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(long, requires = "init")]
        force: bool,
    },
}

#[derive(Tabled)]
struct LoadRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "TSS")]
    tss: String,
    #[tabled(rename = "CTL")]
    ctl: String,
    #[tabled(rename = "ATL")]
    atl: String,
    #[tabled(rename = "TSB")]
    tsb: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
}

impl From<&DailyTrainingLoad> for LoadRow {
    fn from(day: &DailyTrainingLoad) -> Self {
        LoadRow {
            date: day.date.to_string(),
            tss: day.daily_tss.round_dp(1).to_string(),
            ctl: day.ctl.round_dp(1).to_string(),
            atl: day.atl.round_dp(1).to_string(),
            tsb: day.tsb.round_dp(1).to_string(),
            confidence: day.confidence.to_string(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_or_default(cli.config.as_deref())?;

    let mut log_config = config.logging.clone();
    log_config.level = log_config.level.raised_by(cli.verbose);
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    init_logging(&log_config)?;

    match cli.command {
        Commands::Process {
            input,
            athlete,
            json,
        } => {
            let mut inputs = read_workouts(&input)?;
            if let Some(athlete) = athlete {
                for workout in &mut inputs {
                    workout.athlete_id = athlete.clone();
                }
            }

            let engine = Engine::new(config.clone());
            let report = engine.process_batch(&inputs, &config);

            if json {
                let reports: Vec<WorkoutReport> = report
                    .processed
                    .iter()
                    .map(|p| WorkoutReport::from(&p.workout))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_batch(&report);
            }

            if !report.failures.is_empty() {
                anyhow::bail!("{} workout(s) failed", report.failures.len());
            }
        }

        Commands::Load {
            history,
            from,
            to,
            seed_ctl,
            seed_atl,
            json,
        } => {
            let entries = read_history(&history)?;
            let seed = seed_ctl.zip(seed_atl).map(|(ctl, atl)| LoadSeed {
                ctl,
                atl,
                days_of_history: config.pmc.warmup_days,
            });

            let engine = Engine::new(config.clone());
            let series = engine.pmc().calculate_from_history(&entries, from, to, seed)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&series)?);
            } else {
                print_load(&engine, &config, &series);
            }
        }

        Commands::Series { input, metric } => {
            let inputs = read_workouts(&input)?;
            let engine = Engine::new(config.clone());

            let mut output = Vec::with_capacity(inputs.len());
            for workout in &inputs {
                let processed = engine.process_workout(workout, &config)?;
                output.push(timeseries::query(&processed.workout, metric));
            }

            if let [single] = output.as_slice() {
                println!("{}", serde_json::to_string_pretty(single)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        }

        Commands::Config { show, init, force } => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(EngineConfig::default_config_path);

            if init {
                if path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists: {} (use --force to overwrite)",
                        path.display()
                    );
                }
                EngineConfig::default().save_to_file(&path)?;
                println!("{} {}", "✓ Wrote default configuration to".green(), path.display());
            } else if show {
                print!("{}", toml::to_string_pretty(&config)?);
            } else {
                println!("Config path: {}", path.display());
                println!("Athletes: {}", config.athletes.len());
            }
        }
    }

    Ok(())
}

fn read_workouts(path: &Path) -> Result<Vec<WorkoutInput>> {
    ingest::read_workouts(path)
        .with_context(|| format!("Failed to load workouts from {}", path.display()))
}

fn read_history(path: &Path) -> Result<Vec<DailyTssEntry>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open history file: {}", path.display()))?;

    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("Bad history row {} in {}", i + 2, path.display())))
        .collect()
}

fn print_batch(report: &BatchReport) {
    for processed in &report.processed {
        print_workout(processed);
        println!();
    }
    for (id, err) in &report.failures {
        println!("{} {}: {}", "✗".red().bold(), id, err.user_message());
    }
}

fn print_workout(processed: &ProcessedWorkout) {
    let workout = &processed.workout;
    println!(
        "{} {} ({}, {})",
        "Workout".bold(),
        workout.id.cyan(),
        workout.sport,
        workout.start_time.format("%Y-%m-%d %H:%M UTC")
    );
    println!(
        "  Moving time: {}   Samples: {}   Intervals: {}",
        format_duration(workout.duration_sec),
        workout.merged_samples.len(),
        workout.intervals.len()
    );
    if processed.dropped_records > 0 || processed.rejected_values > 0 {
        println!(
            "  {}",
            format!(
                "Dropped {} record(s), rejected {} value(s)",
                processed.dropped_records, processed.rejected_values
            )
            .yellow()
        );
    }

    if let Some(tss) = &workout.tss {
        let mut line = format!(
            "  TSS: {} ({:?}, {})",
            tss.tss.to_string().bold(),
            tss.method,
            tss.confidence
        );
        if let Some(intensity) = tss.intensity_factor {
            line.push_str(&format!("  IF {}", intensity));
        }
        if let Some(np) = tss.normalized_power {
            line.push_str(&format!("  NP {}W", np));
        }
        println!("{}", line);
        for warning in &tss.warnings {
            println!("    {}", warning.dimmed());
        }
    }

    for (metric, breakdown) in &workout.zone_breakdowns {
        if !breakdown.available {
            continue;
        }
        let zones: Vec<String> = ZoneLabel::ALL
            .iter()
            .map(|label| format!("{} {}", label, breakdown.minutes(*label).round_dp(1)))
            .collect();
        println!("  {:<11} {}", format!("{}:", metric), zones.join("  "));
    }
}

fn print_load(engine: &Engine, config: &EngineConfig, series: &[DailyTrainingLoad]) {
    if series.is_empty() {
        println!("{}", "No history in range".yellow());
        return;
    }

    let rows: Vec<LoadRow> = series.iter().map(LoadRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));

    let analyzer = TrendAnalyzer::new(config.trends.clone());
    let Ok(snapshot) = analyzer.load_snapshot(series) else {
        return;
    };

    let form = match snapshot.form {
        TsbInterpretation::VeryFresh | TsbInterpretation::Fresh => {
            snapshot.form.description().green()
        }
        TsbInterpretation::Neutral => snapshot.form.description().normal(),
        TsbInterpretation::Fatigued | TsbInterpretation::VeryFatigued => {
            snapshot.form.description().red()
        }
    };
    println!(
        "{} CTL {} ({:?}), ATL {} ({:?}), TSB {}: {}",
        snapshot.date.to_string().bold(),
        snapshot.ctl,
        snapshot.fitness.direction,
        snapshot.atl,
        snapshot.fatigue.direction,
        snapshot.tsb,
        form
    );
    if let Some(ramp) = snapshot.avg_ctl_ramp_rate {
        println!(
            "  Average CTL ramp {}/week, {} ATL spike(s)",
            ramp, snapshot.atl_spike_count
        );
    }

    if let Some(last) = series.last() {
        for recommendation in engine.pmc().generate_recommendations(last) {
            println!("  • {}", recommendation);
        }
    }
}

fn format_duration(seconds: u32) -> String {
    format!("{}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}
