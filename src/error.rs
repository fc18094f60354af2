//! Unified error type hierarchy for the CPU tuner.
//!
//! Provides structured, per-domain error handling plus a single
//! `TunerError` that every public entry point can return.

use std::io;
use thiserror::Error;

/// Hardware monitoring errors (Monitor, C1).
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to read sensor data: {0}")]
    SensorRead(String),

    #[error("IO error while reading hardware state: {0}")]
    Io(#[from] io::Error),
}

/// Firmware setting store errors (Setting Store, C2).
#[derive(Error, Debug)]
pub enum SettingStoreError {
    /// Fatal at initialization: the firmware tool binary could not be located.
    #[error("firmware tool not found at '{0}'")]
    ToolMissing(String),

    /// Export or import subprocess failed, or produced no/invalid output.
    #[error("firmware tool I/O failure during '{op}': {reason}")]
    ToolIo { op: String, reason: String },

    /// A requested setting name does not exist in the current dump.
    #[error("setting not found: {0}")]
    SettingNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Stress Driver errors (C3).
#[derive(Error, Debug)]
pub enum StressError {
    #[error("monitor failed during stress sampling: {0}")]
    MonitorFailure(#[from] MonitorError),

    #[error("stress worker thread panicked")]
    WorkerPanicked,
}

/// Checkpoint Store errors (C5).
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint file name does not match 'checkpoint_<stage>_<timestamp>.json': {0}")]
    MalformedName(String),

    #[error("failed to (de)serialize checkpoint: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Tuning Engine errors (C6).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("a tuning run is already in progress")]
    AlreadyRunning,

    #[error("baseline stress test did not complete; system is already unstable")]
    BaselineFailed,

    #[error(transparent)]
    Settings(#[from] SettingStoreError),

    #[error(transparent)]
    Stress(#[from] StressError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Top-level error type for every public entry point in this crate.
#[derive(Error, Debug)]
pub enum TunerError {
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Settings(#[from] SettingStoreError),

    #[error(transparent)]
    Stress(#[from] StressError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TunerError {
    /// A short, user-facing message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            TunerError::Monitor(e) => format!("Could not read hardware sensors: {e}"),
            TunerError::Settings(SettingStoreError::ToolMissing(path)) => {
                format!("Firmware configuration tool not found at '{path}'. Tuning cannot start.")
            }
            TunerError::Settings(e) => format!("Firmware setting store error: {e}"),
            TunerError::Stress(e) => format!("Stress test error: {e}"),
            TunerError::Checkpoint(e) => format!("Checkpoint error: {e}"),
            TunerError::Engine(EngineError::BaselineFailed) => {
                "Baseline stress test failed before any tuning began; the system appears \
                 unstable at its current settings."
                    .to_string()
            }
            TunerError::Engine(e) => format!("Tuning engine error: {e}"),
            TunerError::Config(msg) => format!("Configuration error: {msg}"),
            TunerError::Io(e) => format!("File operation failed: {e}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, TunerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_store_error_display() {
        let err = SettingStoreError::SettingNotFound("Core Voltage Offset".to_string());
        assert_eq!(err.to_string(), "setting not found: Core Voltage Offset");
    }

    #[test]
    fn engine_error_wraps_settings_error() {
        let inner = SettingStoreError::ToolMissing("/opt/scewin".to_string());
        let engine_err: EngineError = inner.into();
        assert!(engine_err.to_string().contains("/opt/scewin"));
    }

    #[test]
    fn tuner_error_user_message_for_baseline_failure() {
        let err: TunerError = EngineError::BaselineFailed.into();
        assert!(err.user_message().contains("unstable"));
    }
}
