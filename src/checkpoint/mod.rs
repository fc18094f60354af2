//! Checkpoint Store (C5, SPEC_FULL.md §4.5): atomic, timestamped
//! snapshots of `(Profile, stage, detail)`. Checkpoints are immutable
//! and append-only once written; this store never deletes them.

use crate::error::CheckpointError;
use crate::profile::Profile;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub stage_name: String,
    pub detail: String,
    pub profile_snapshot: Profile,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

fn filename_pattern() -> Regex {
    Regex::new(r"^checkpoint_([a-z_]+)_(\d{8}_\d{6})\.json$").expect("static regex is valid")
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&dir)?;
        Ok(CheckpointStore { dir })
    }

    /// Write `checkpoint_<stage>_<yyyymmdd_HHMMSS>.json` atomically
    /// (temp file + rename) and return its path.
    pub fn save(
        &self,
        profile: &Profile,
        stage_name: &str,
        detail: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<PathBuf, CheckpointError> {
        let checkpoint = Checkpoint {
            timestamp,
            stage_name: stage_name.to_string(),
            detail: detail.to_string(),
            profile_snapshot: profile.clone(),
        };
        let filename = format!(
            "checkpoint_{stage_name}_{}.json",
            timestamp.format("%Y%m%d_%H%M%S")
        );
        let final_path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!(".{filename}.tmp"));

        let body = serde_json::to_string_pretty(&checkpoint)?;
        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &final_path)?;

        log::info!("wrote checkpoint {}", final_path.display());
        Ok(final_path)
    }

    /// Parse a checkpoint file back into its stage/detail/profile.
    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let filename = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| CheckpointError::MalformedName(path.display().to_string()))?;
        if !filename_pattern().is_match(filename) {
            return Err(CheckpointError::MalformedName(filename.to_string()));
        }
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        Ok(checkpoint)
    }

    /// All checkpoint files in the directory, oldest first by filename
    /// (the embedded timestamp makes lexical order chronological).
    pub fn list(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let pattern = filename_pattern();
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|f| f.to_str())
                    .map(|f| pattern.is_match(f))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Profile;

    #[test]
    fn save_then_load_round_trips_stage_and_detail() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
        let profile = Profile::new("Test CPU", Utc::now());
        let path = store.save(&profile, "power_limits", "", Utc::now()).unwrap();

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.stage_name, "power_limits");
        assert_eq!(loaded.detail, "");
        assert_eq!(loaded.profile_snapshot.cpu_model, "Test CPU");
    }

    #[test]
    fn list_returns_only_well_formed_checkpoint_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
        let profile = Profile::new("Test CPU", Utc::now());
        store.save(&profile, "baseline", "", Utc::now()).unwrap();
        fs::write(dir.path().join("not_a_checkpoint.txt"), "junk").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn load_rejects_malformed_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf()).unwrap();
        let bogus = dir.path().join("definitely_not_a_checkpoint.json");
        fs::write(&bogus, "{}").unwrap();
        assert!(store.load(&bogus).is_err());
    }
}
