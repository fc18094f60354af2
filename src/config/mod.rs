//! Configuration for the CPU tuner: firmware tool path, output
//! locations, and the engine's tunable safety constants.
//!
//! # Configuration Flow
//!
//! 1. The CLI resolves a config path (explicit `--config`, or
//!    `dirs::config_dir()/cpu-tuner/config.toml`).
//! 2. [`load_or_default`] reads it if present, or returns
//!    [`TunerConfig::default`] otherwise — a missing config file is
//!    never fatal.
//! 3. The engine is constructed from the resulting [`TunerConfig`].

use crate::error::TunerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Tunable safety constants from SPEC_FULL.md §4.4.2, overridable by an
/// operator without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningConstants {
    pub thermal_limit_c: f64,
    pub perf_improvement_threshold: f64,
    pub acceptable_perf_loss: f64,
    pub short_test_duration_s: u64,
    pub medium_test_duration_s: u64,
    pub final_test_duration_s: u64,
}

impl Default for TuningConstants {
    fn default() -> Self {
        TuningConstants {
            thermal_limit_c: 90.0,
            perf_improvement_threshold: 1.01,
            acceptable_perf_loss: 0.98,
            short_test_duration_s: 60,
            medium_test_duration_s: 120,
            final_test_duration_s: 180,
        }
    }
}

/// Top-level tuner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunerConfig {
    /// Path to the vendor firmware-setting tool executable.
    pub firmware_tool_path: PathBuf,
    /// Directory where timestamped checkpoints are written.
    pub checkpoint_dir: PathBuf,
    /// Path to the final persisted profile (`best_profile.json`).
    pub output_profile_path: PathBuf,
    /// Directory holding the one-time session backup of the full dump.
    pub backup_dir: PathBuf,
    pub constants: TuningConstants,
}

impl Default for TunerConfig {
    fn default() -> Self {
        let state_dir = default_state_dir();
        TunerConfig {
            firmware_tool_path: PathBuf::from("/usr/local/bin/scewin"),
            checkpoint_dir: state_dir.join("checkpoints"),
            output_profile_path: state_dir.join("best_profile.json"),
            backup_dir: state_dir.join("backup"),
            constants: TuningConstants::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cpu-tuner")
}

/// Default path for the user config file: `<config_dir>/cpu-tuner/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cpu-tuner")
        .join("config.toml")
}

/// Load config from a TOML file if it exists, falling back to defaults.
pub fn load_or_default(path: &Path) -> Result<TunerConfig, TunerError> {
    if !path.exists() {
        return Ok(TunerConfig::default());
    }
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| TunerError::Config(e.to_string()))
}

/// Persist config to a TOML file, creating parent directories as needed.
pub fn save(config: &TunerConfig, path: &Path) -> Result<(), TunerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let toml_content =
        toml::to_string_pretty(config).map_err(|e| TunerError::Config(e.to_string()))?;
    fs::write(path, toml_content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_constants() {
        let cfg = TunerConfig::default();
        assert_eq!(cfg.constants.thermal_limit_c, 90.0);
        assert_eq!(cfg.constants.perf_improvement_threshold, 1.01);
        assert_eq!(cfg.constants.acceptable_perf_loss, 0.98);
    }

    #[test]
    fn missing_config_file_falls_back_to_default() {
        let path = std::env::temp_dir().join("cpu_tuner_test_missing_config.toml");
        let _ = fs::remove_file(&path);
        let cfg = load_or_default(&path).unwrap();
        assert_eq!(cfg, TunerConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = TunerConfig::default();
        cfg.constants.thermal_limit_c = 85.0;
        save(&cfg, &path).unwrap();
        let loaded = load_or_default(&path).unwrap();
        assert_eq!(loaded, cfg);
    }
}
