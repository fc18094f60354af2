//! Profile Model (C4, SPEC_FULL.md §3/§4 data model): the in-memory
//! record of discovered settings, their history, and the best-known
//! results, mutated only by the Tuning Engine.
//!
//! Mutation happens through the small incremental methods below
//! rather than by cloning the whole struct per experiment — the
//! design note about avoiding a Python-style whole-profile `clone()`
//! is satisfied by never needing one: a trial either commits through
//! [`Profile::commit_parameter`]/[`Profile::record_trial`] or is
//! reverted directly at the Setting Store, with nothing staged on a
//! scratch copy of the Profile in between.

use crate::stress::StressTestResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StabilityImpact {
    None,
    Thermal,
    Unstable,
}

impl Default for StabilityImpact {
    fn default() -> Self {
        StabilityImpact::None
    }
}

/// One firmware parameter as tracked inside a Profile (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiosParameter {
    pub name: String,
    pub current_value: i64,
    pub default_value: i64,
    pub modified: bool,
    pub tested_values: Vec<i64>,
    /// Never null after construction; defaults to `current_value`.
    pub best_value: i64,
    pub category: String,
    pub description: String,
    pub impact_pct: f64,
    pub stability_impact: StabilityImpact,
}

impl BiosParameter {
    pub fn new(name: &str, current_value: i64, category: &str, description: &str) -> Self {
        BiosParameter {
            name: name.to_string(),
            current_value,
            default_value: current_value,
            modified: false,
            tested_values: Vec::new(),
            best_value: current_value,
            category: category.to_string(),
            description: description.to_string(),
            impact_pct: 0.0,
            stability_impact: StabilityImpact::None,
        }
    }

    /// Record that `value` was committed as the new current/best value.
    fn commit(&mut self, value: i64) {
        self.tested_values.push(value);
        self.current_value = value;
        self.best_value = value;
        if value != self.default_value {
            self.modified = true;
        }
    }
}

/// One entry in a Profile's trial history (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub parameter_name: String,
    pub tried_value: i64,
    pub result: StressTestResult,
    pub perf_delta_pct: f64,
}

/// The full discovered-and-tuned state of one tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub power_limit1: Option<i64>,
    pub power_limit2: Option<i64>,
    pub voltage_offset_mv: Option<i64>,
    pub max_temperature: Option<f64>,
    pub measured_perf_score: Option<f64>,
    pub cpu_model: String,
    pub profile_name: String,
    pub creation_timestamp: DateTime<Utc>,
    pub description: String,
    pub is_stable: bool,
    pub requires_reboot: bool,
    pub bios_parameters: HashMap<String, BiosParameter>,
    pub test_history: Vec<TestHistoryEntry>,
    pub baseline_results: Option<StressTestResult>,
    pub best_results: Option<StressTestResult>,
    /// Names of the settings backing the three scalar fields above,
    /// so finalization's re-apply pass can skip what it already wrote
    /// directly instead of writing every modified parameter twice.
    pub pl1_param_name: Option<String>,
    pub pl2_param_name: Option<String>,
    pub voltage_param_name: Option<String>,
}

impl Profile {
    pub fn new(cpu_model: &str, creation_timestamp: DateTime<Utc>) -> Self {
        Profile {
            power_limit1: None,
            power_limit2: None,
            voltage_offset_mv: None,
            max_temperature: None,
            measured_perf_score: None,
            cpu_model: cpu_model.to_string(),
            profile_name: "auto-tuned".to_string(),
            creation_timestamp,
            description: String::new(),
            is_stable: true,
            requires_reboot: false,
            bios_parameters: HashMap::new(),
            test_history: Vec::new(),
            baseline_results: None,
            best_results: None,
            pl1_param_name: None,
            pl2_param_name: None,
            voltage_param_name: None,
        }
    }

    /// Register a newly discovered setting. A no-op if already registered
    /// (initialization and analysis can both try to register the same
    /// name without clobbering history).
    pub fn register_parameter(&mut self, name: &str, current_value: i64, category: &str, description: &str) {
        self.bios_parameters
            .entry(name.to_string())
            .or_insert_with(|| BiosParameter::new(name, current_value, category, description));
    }

    /// Commit `value` as the new current/best value for `name`, creating
    /// the parameter record first if it isn't already registered.
    pub fn commit_parameter(&mut self, name: &str, value: i64) {
        let category = crate::settings::tables::categorize(name).to_string();
        let entry = self
            .bios_parameters
            .entry(name.to_string())
            .or_insert_with(|| BiosParameter::new(name, value, &category, name));
        entry.commit(value);
    }

    pub fn record_trial(
        &mut self,
        timestamp: DateTime<Utc>,
        parameter_name: &str,
        tried_value: i64,
        result: StressTestResult,
        perf_delta_pct: f64,
    ) {
        self.test_history.push(TestHistoryEntry {
            timestamp,
            parameter_name: parameter_name.to_string(),
            tried_value,
            result,
            perf_delta_pct,
        });
    }

    /// `baseline_results`, once set, is never overwritten.
    pub fn set_baseline_if_absent(&mut self, result: StressTestResult) {
        if self.baseline_results.is_none() {
            self.baseline_results = Some(result);
        }
    }

    /// Replace `best_results` only if `result` is a strictly better
    /// (or first-known) throughput.
    pub fn set_best_if_better(&mut self, result: StressTestResult) {
        let better = match &self.best_results {
            None => true,
            Some(best) => result.ops_per_second > best.ops_per_second,
        };
        if better {
            self.measured_perf_score = Some(result.ops_per_second);
            self.best_results = Some(result);
        }
        self.max_temperature = Some(
            self.max_temperature
                .unwrap_or(0.0)
                .max(result.max_temp_c),
        );
    }

    pub fn mark_requires_reboot(&mut self) {
        self.requires_reboot = true;
    }

    /// Names of every parameter this run actually changed from its default.
    pub fn modified_parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .bios_parameters
            .values()
            .filter(|p| p.modified)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(ops: f64) -> StressTestResult {
        StressTestResult {
            ops_per_second: ops,
            max_temp_c: 60.0,
            avg_temp_c: 58.0,
            max_power_w: 80.0,
            avg_power_w: 75.0,
            duration_s: 60,
            cpu_freq_mhz: 4000.0,
            completed: true,
        }
    }

    #[test]
    fn best_value_is_never_null_after_construction() {
        let param = BiosParameter::new("PPT", 65, "cpu_power", "PPT limit");
        assert_eq!(param.best_value, 65);
    }

    #[test]
    fn baseline_results_is_never_overwritten() {
        let mut profile = Profile::new("Test CPU", Utc::now());
        profile.set_baseline_if_absent(sample_result(1000.0));
        profile.set_baseline_if_absent(sample_result(2000.0));
        assert_eq!(profile.baseline_results.unwrap().ops_per_second, 1000.0);
    }

    #[test]
    fn best_results_only_improves() {
        let mut profile = Profile::new("Test CPU", Utc::now());
        profile.set_best_if_better(sample_result(1000.0));
        profile.set_best_if_better(sample_result(900.0));
        assert_eq!(profile.best_results.unwrap().ops_per_second, 1000.0);
        profile.set_best_if_better(sample_result(1010.0));
        assert_eq!(profile.best_results.unwrap().ops_per_second, 1010.0);
    }

    #[test]
    fn commit_parameter_marks_modified_when_value_differs_from_default() {
        let mut profile = Profile::new("Test CPU", Utc::now());
        profile.register_parameter("Core Voltage Offset", 0, "cpu_voltage", "offset");
        profile.commit_parameter("Core Voltage Offset", -80);
        let param = &profile.bios_parameters["Core Voltage Offset"];
        assert!(param.modified);
        assert_eq!(param.best_value, -80);
        assert_eq!(param.default_value, 0);
    }
}
