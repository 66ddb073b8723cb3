use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::ProfileStore;
use crate::error::EngineError;
use crate::ingest::ValueLimits;
use crate::logging::LogConfig;
use crate::merge::MergeConfig;
use crate::models::{AthleteThresholds, Sport};
use crate::pmc::PmcConfig;
use crate::trends::TrendConfig;
use crate::tss::TssConfig;
use crate::zones::{ZoneDefinition, ZoneDefinitionSet, ZoneMetric};

/// Engine configuration, loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Accepted sensor value ranges
    pub ingest: ValueLimits,

    pub merge: MergeConfig,
    pub zones: ZonesConfig,
    pub tss: TssConfig,

    /// Performance Management Chart settings
    pub pmc: PmcConfig,

    pub trends: TrendConfig,
    pub logging: LogConfig,

    /// Athlete profiles keyed by athlete id
    pub athletes: BTreeMap<String, AthleteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonesConfig {
    /// Time credited to the last sample of an interval, in seconds
    pub nominal_sample_secs: Decimal,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        ZonesConfig {
            nominal_sample_secs: Decimal::ONE,
        }
    }
}

/// One athlete's thresholds and explicit zone tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AthleteConfig {
    pub name: Option<String>,
    pub thresholds: AthleteThresholds,

    /// Explicit definitions; they replace generated ones for the same metric
    pub zones: Vec<ZoneEntry>,

    /// Fill metrics without an explicit table from the thresholds
    pub generate_missing_zones: bool,
}

impl Default for AthleteConfig {
    fn default() -> Self {
        AthleteConfig {
            name: None,
            thresholds: AthleteThresholds::default(),
            zones: Vec::new(),
            generate_missing_zones: true,
        }
    }
}

/// A zone table as written in the config file, either six boundaries or
/// seven `(min, max)` ranges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEntry {
    /// Defaults to every sport for heart rate and the metric's own sport otherwise
    #[serde(default)]
    pub sport: Option<Sport>,

    pub metric: ZoneMetric,

    #[serde(default)]
    pub thresholds: Option<Vec<Decimal>>,

    #[serde(default)]
    pub ranges: Option<Vec<ZoneRange>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneRange {
    #[serde(default)]
    pub min: Option<Decimal>,
    #[serde(default)]
    pub max: Option<Decimal>,
}

impl ZoneEntry {
    pub fn definition(&self) -> crate::error::Result<ZoneDefinition> {
        match (&self.thresholds, &self.ranges) {
            (Some(thresholds), None) => {
                let bounds: [Decimal; 6] =
                    thresholds
                        .as_slice()
                        .try_into()
                        .map_err(|_| EngineError::InvalidZoneDefinition {
                            metric: self.metric,
                            reason: format!("expected 6 thresholds, got {}", thresholds.len()),
                        })?;
                ZoneDefinition::from_thresholds(self.metric, bounds)
            }
            (None, Some(ranges)) => {
                let pairs: Vec<_> = ranges.iter().map(|r| (r.min, r.max)).collect();
                ZoneDefinition::from_ranges(self.metric, &pairs)
            }
            _ => Err(EngineError::InvalidZoneDefinition {
                metric: self.metric,
                reason: "give exactly one of `thresholds` or `ranges`".to_string(),
            }),
        }
    }

    fn sports(&self) -> Vec<Sport> {
        if let Some(sport) = self.sport {
            return vec![sport];
        }
        match self.metric {
            ZoneMetric::HeartRate => {
                vec![Sport::Bike, Sport::Run, Sport::Swim, Sport::Strength, Sport::Other]
            }
            ZoneMetric::BikePower => vec![Sport::Bike],
            ZoneMetric::RunPower | ZoneMetric::RunPace => vec![Sport::Run],
            ZoneMetric::SwimPace => vec![Sport::Swim],
        }
    }
}

impl AthleteConfig {
    /// Build the athlete's full zone set
    pub fn zone_set(&self) -> crate::error::Result<ZoneDefinitionSet> {
        let mut set = if self.generate_missing_zones {
            ZoneDefinitionSet::from_thresholds(&self.thresholds)?
        } else {
            ZoneDefinitionSet::new()
        };

        for entry in &self.zones {
            let definition = entry.definition()?;
            for sport in entry.sports() {
                set.insert(sport, definition.clone())?;
            }
        }

        Ok(set)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: EngineConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trainload")
            .join("config.toml")
    }

    /// Load an explicit path, or the default path if it exists, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        let default_path = Self::default_config_path();
        if default_path.exists() {
            Self::load_from_file(&default_path)
        } else {
            tracing::debug!("No config at {}, using defaults", default_path.display());
            Ok(Self::default())
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: &str| Err(EngineError::Configuration(msg.to_string()));

        if self.zones.nominal_sample_secs <= Decimal::ZERO {
            return invalid("zones.nominal_sample_secs must be positive");
        }
        if self.merge.tolerance_ms < 0 {
            return invalid("merge.tolerance_ms must not be negative");
        }
        if self.merge.pause_threshold_secs <= 0 {
            return invalid("merge.pause_threshold_secs must be positive");
        }
        if self.merge.smoothing_window == 0 {
            return invalid("merge.smoothing_window must be at least 1");
        }
        if self.tss.np_window_secs <= 0 {
            return invalid("tss.np_window_secs must be positive");
        }
        if self.tss.max_power_gap_secs <= 0 {
            return invalid("tss.max_power_gap_secs must be positive");
        }
        if self.pmc.ctl_time_constant == 0 || self.pmc.atl_time_constant == 0 {
            return invalid("pmc time constants must be positive");
        }

        for (athlete_id, athlete) in &self.athletes {
            athlete.zone_set().map_err(|err| {
                EngineError::Configuration(format!("athlete {}: {}", athlete_id, err))
            })?;
        }

        Ok(())
    }

    fn athlete(&self, athlete_id: &str) -> crate::error::Result<&AthleteConfig> {
        self.athletes
            .get(athlete_id)
            .ok_or_else(|| EngineError::Collaborator {
                collaborator: "config profiles".to_string(),
                reason: format!("unknown athlete {}", athlete_id),
            })
    }
}

impl ProfileStore for EngineConfig {
    fn get_zone_definitions(
        &self,
        athlete_id: &str,
        sport: Sport,
    ) -> crate::error::Result<ZoneDefinitionSet> {
        Ok(self.athlete(athlete_id)?.zone_set()?.for_sport(sport))
    }

    fn get_thresholds(&self, athlete_id: &str) -> crate::error::Result<AthleteThresholds> {
        Ok(self.athlete(athlete_id)?.thresholds.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::ZoneLabel;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[zones]
nominal_sample_secs = 1

[pmc]
seed = "first_day"

[athletes.alice]
name = "Alice"

[athletes.alice.thresholds]
ftp = 250
lthr = 165
threshold_pace = 270

[[athletes.alice.zones]]
metric = "heart_rate"
ranges = [
    { max = 120 },
    { min = 121, max = 140 },
    { min = 141, max = 150 },
    { min = 151, max = 160 },
    { min = 161, max = 165 },
    { min = 166, max = 175 },
    { min = 176 },
]
"#;

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_parse_sample_config() {
        let config: EngineConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pmc.seed, crate::pmc::SeedStrategy::FirstDay);
        assert_eq!(config.merge.pause_threshold_secs, 5);

        let bike = config.get_zone_definitions("alice", Sport::Bike).unwrap();
        let hr = bike.get(Sport::Bike, ZoneMetric::HeartRate).unwrap();
        assert_eq!(hr.classify(dec!(145)), ZoneLabel::Zx);
        assert!(bike.get(Sport::Bike, ZoneMetric::BikePower).is_some());
        assert!(bike.get(Sport::Run, ZoneMetric::RunPace).is_none());

        let run = config.get_zone_definitions("alice", Sport::Run).unwrap();
        assert!(run.get(Sport::Run, ZoneMetric::RunPace).is_some());
        assert!(run.get(Sport::Run, ZoneMetric::RunPower).is_none());
    }

    #[test]
    fn test_unknown_athlete_is_collaborator_error() {
        let config = EngineConfig::default();
        let err = config.get_thresholds("nobody").unwrap_err();
        assert!(matches!(err, EngineError::Collaborator { .. }));
    }

    #[test]
    fn test_invalid_zone_table_rejected() {
        let mut config = EngineConfig::default();
        config.athletes.insert(
            "bob".to_string(),
            AthleteConfig {
                zones: vec![ZoneEntry {
                    sport: None,
                    metric: ZoneMetric::BikePower,
                    thresholds: Some(vec![dec!(100), dec!(200), dec!(150), dec!(250), dec!(300), dec!(350)]),
                    ranges: None,
                }],
                ..Default::default()
            },
        );
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_zone_entry_needs_one_form() {
        let entry = ZoneEntry {
            sport: Some(Sport::Bike),
            metric: ZoneMetric::BikePower,
            thresholds: None,
            ranges: None,
        };
        assert!(entry.definition().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_time_constant() {
        let mut config = EngineConfig::default();
        config.pmc.atl_time_constant = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.tss.max_power_gap_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let original: EngineConfig = toml::from_str(SAMPLE).unwrap();
        original.save_to_file(&config_path).unwrap();
        let loaded = EngineConfig::load_from_file(&config_path).unwrap();

        assert_eq!(loaded.athletes.len(), 1);
        assert_eq!(loaded.athletes["alice"].thresholds.ftp, Some(250));
        assert_eq!(
            loaded.athletes["alice"].zone_set().unwrap(),
            original.athletes["alice"].zone_set().unwrap()
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("absent.toml");
        assert!(EngineConfig::load_or_default(Some(&missing)).is_err());
    }
}
