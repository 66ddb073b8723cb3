//! Unified error hierarchy for the training-load engine
//!
//! Every domain error is locally recoverable: callers record it next to the
//! value it degraded (a dropped sample, a fallback TSS, an approximate CTL)
//! instead of aborting a batch.

use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::Sport;
use crate::zones::ZoneMetric;

/// Top-level error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unparsable timestamp or value in a raw record
    #[error("Malformed sample from {source_id}: {reason}")]
    MalformedSample { source_id: String, reason: String },

    /// No zone set exists for the requested sport/metric pair
    #[error("No {metric} zone definition for {sport}")]
    MissingZoneDefinition { sport: Sport, metric: ZoneMetric },

    /// Zone bounds are not ordered, contiguous and non-overlapping
    #[error("Invalid {metric} zone definition: {reason}")]
    InvalidZoneDefinition { metric: ZoneMetric, reason: String },

    /// FTP, critical power, threshold pace or CSS is missing or zero
    #[error("Missing threshold: {threshold}")]
    ThresholdMissing { threshold: String },

    /// Fewer days than the warm-up window precede the computed date
    #[error("Insufficient history: {available_days} of {required_days} warm-up days")]
    InsufficientHistory {
        available_days: u32,
        required_days: u32,
    },

    /// A pause longer than the threshold split the merged stream
    #[error("Gap of {gap_ms}ms exceeds pause threshold of {threshold_secs}s")]
    GapExceeded { gap_ms: i64, threshold_secs: i64 },

    /// Invalid input data or parameters
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An external collaborator (profile store, TSS history) failed
    #[error("Collaborator error in {collaborator}: {reason}")]
    Collaborator { collaborator: String, reason: String },

    /// File could not be read or written
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::GapExceeded { .. } => ErrorSeverity::Info,
            EngineError::InsufficientHistory { .. } => ErrorSeverity::Info,
            EngineError::MalformedSample { .. } => ErrorSeverity::Warning,
            EngineError::MissingZoneDefinition { .. } => ErrorSeverity::Warning,
            EngineError::ThresholdMissing { .. } => ErrorSeverity::Warning,
            EngineError::InvalidZoneDefinition { .. } => ErrorSeverity::Error,
            EngineError::Validation(_) => ErrorSeverity::Warning,
            EngineError::Configuration(_) => ErrorSeverity::Error,
            EngineError::Collaborator { .. } => ErrorSeverity::Error,
            EngineError::Io { .. } => ErrorSeverity::Error,
            EngineError::Serialization(_) => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            EngineError::ThresholdMissing { threshold } => {
                format!(
                    "No {} is configured. TSS was estimated from heart rate instead.",
                    threshold
                )
            }
            EngineError::MissingZoneDefinition { sport, metric } => {
                format!("{} zones are not set up for {}.", metric, sport)
            }
            EngineError::InsufficientHistory { required_days, .. } => {
                format!(
                    "Fitness and fatigue need {} days of history before they are reliable.",
                    required_days
                )
            }
            EngineError::Io { path, .. } => {
                format!("Could not access file: {}", path.display())
            }
            _ => self.to_string(),
        }
    }

    /// Log the error at the level its severity calls for
    pub fn emit(&self) {
        match self.severity() {
            ErrorSeverity::Error => error!(error = %self, "{}", self.user_message()),
            ErrorSeverity::Warning => warn!(error = %self, "{}", self.user_message()),
            ErrorSeverity::Info => info!(error = %self, "{}", self.user_message()),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Error that prevents the operation
    Error,
    /// Degraded value, operation continued
    Warning,
    /// Informational message
    Info,
}
