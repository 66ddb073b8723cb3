// Library interface for trainload
// The CLI and the integration tests both build on these modules

pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod merge;
pub mod models;
pub mod pmc;
pub mod timeseries;
pub mod trends;
pub mod tss;
pub mod zones;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use engine::{Engine, ProfileStore, TssHistoryStore};
pub use error::{EngineError, Result};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use merge::SampleMerger;
pub use models::*;
pub use pmc::PmcCalculator;
pub use tss::TssCalculator;
pub use zones::{ZoneClassifier, ZoneDefinition, ZoneDefinitionSet};
