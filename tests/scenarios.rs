//! End-to-end scenarios against a mock Setting Store and a scripted
//! Stress Driver, per the six named scenarios in the design ledger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use cpu_tuner::checkpoint::CheckpointStore;
use cpu_tuner::config::TuningConstants;
use cpu_tuner::engine::TuningEngine;
use cpu_tuner::monitor::{CpuData, CpuMonitor, SystemInfo};
use cpu_tuner::profile::Profile;
use cpu_tuner::settings::MockSettingStore;
use cpu_tuner::stress::{ScriptedStressDriver, StressTestResult};

struct FixedMonitor;

impl CpuMonitor for FixedMonitor {
    fn read_cpu_data(&self) -> CpuData {
        CpuData { temp_c: 60.0, power_w: 80.0, load_pct: 90.0 }
    }
    fn cpu_frequencies(&self) -> HashMap<u32, f64> {
        HashMap::new()
    }
    fn collect_system_info(&self) -> SystemInfo {
        SystemInfo { cpu_model: "Test CPU i7".into(), logical_cores: 8, cpu_frequencies_mhz: HashMap::new() }
    }
    fn session_maxima(&self) -> (f64, f64) {
        (60.0, 80.0)
    }
}

fn trial(ops: f64, max_temp: f64, completed: bool) -> StressTestResult {
    StressTestResult {
        ops_per_second: ops,
        max_temp_c: max_temp,
        avg_temp_c: max_temp - 3.0,
        max_power_w: 90.0,
        avg_power_w: 85.0,
        duration_s: 60,
        cpu_freq_mhz: 4200.0,
        completed,
    }
}

fn make_engine(
    store: MockSettingStore,
    results: Vec<StressTestResult>,
    checkpoint_dir: std::path::PathBuf,
) -> TuningEngine<MockSettingStore, ScriptedStressDriver, FixedMonitor> {
    TuningEngine::new(
        store,
        ScriptedStressDriver::new(results),
        Arc::new(FixedMonitor),
        CheckpointStore::new(checkpoint_dir).unwrap(),
        TuningConstants::default(),
        tempfile::tempdir().unwrap().path().join("profile.json"),
    )
}

#[test]
fn happy_undervolt_settles_on_minus_80() {
    let store = MockSettingStore::new();
    store.seed("Core Voltage Offset", "0");

    let results = vec![
        trial(1000.0, 60.0, true), // baseline
        trial(1005.0, 60.0, true), // -20
        trial(1010.0, 60.0, true), // -40
        trial(1008.0, 60.0, true), // -60
        trial(1006.0, 60.0, true), // -80
        trial(0.0, 60.0, false),   // -100
        trial(1006.0, 60.0, true), // finalization
    ];

    let dir = tempfile::tempdir().unwrap();
    let engine = make_engine(store, results, dir.path().to_path_buf());
    let profile = engine.execute_tuning(None, &|_| {}).unwrap();

    assert_eq!(profile.voltage_offset_mv, Some(-80));
    assert!(profile.is_stable);
}

#[test]
fn thermal_stop_on_power_settles_on_pl1_75() {
    let store = MockSettingStore::new();
    store.seed("Long Duration Power Limit", "65");

    let results = vec![
        trial(1000.0, 60.0, true), // baseline
        trial(1000.0, 60.0, true), // power_limit_baseline
        trial(1050.0, 82.0, true), // PL1=70, ratio 1.05 >= 1.01
        trial(1100.0, 87.0, true), // PL1=75, ratio 1.047 >= 1.01
        trial(1150.0, 92.0, true), // PL1=80, over thermal_limit_c=90
        trial(1100.0, 87.0, true), // finalization
    ];

    let dir = tempfile::tempdir().unwrap();
    let engine = make_engine(store, results, dir.path().to_path_buf());
    let profile = engine.execute_tuning(None, &|_| {}).unwrap();

    assert_eq!(profile.power_limit1, Some(75));
}

#[test]
fn diminishing_returns_stop_settles_on_pl1_70() {
    let store = MockSettingStore::new();
    store.seed("Long Duration Power Limit", "65");

    let results = vec![
        trial(1000.0, 60.0, true), // baseline
        trial(1000.0, 60.0, true), // power_limit_baseline
        trial(1020.0, 60.0, true), // PL1=70, ratio 1.02 >= 1.01
        trial(1025.0, 60.0, true), // PL1=75, ratio 1.0049 < 1.01
        trial(1020.0, 60.0, true), // finalization
    ];

    let dir = tempfile::tempdir().unwrap();
    let engine = make_engine(store, results, dir.path().to_path_buf());
    let profile = engine.execute_tuning(None, &|_| {}).unwrap();

    assert_eq!(profile.power_limit1, Some(70));
}

#[test]
fn crash_resume_skips_completed_stages() {
    let store = MockSettingStore::new();
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointStore::new(dir.path().to_path_buf()).unwrap();

    let mut snapshot = Profile::new("Test CPU i7", Utc::now());
    snapshot.set_baseline_if_absent(trial(1000.0, 60.0, true));
    snapshot.set_best_if_better(trial(1000.0, 60.0, true));
    let checkpoint_path = checkpoints.save(&snapshot, "power_limits", "", Utc::now()).unwrap();

    // Only one trial in the queue: if the engine incorrectly re-ran
    // baseline/undervolt/power_limits it would exhaust the queue and
    // hit a failed (default-incomplete) trial well before finalization.
    let results = vec![trial(1000.0, 60.0, true)];
    let engine = make_engine(store, results, dir.path().to_path_buf());
    let profile = engine.execute_tuning(Some(&checkpoint_path), &|_| {}).unwrap();

    assert!(profile.is_stable);
    assert_eq!(profile.test_history.len(), 1, "only the finalization trial should have run");
}

#[test]
fn memory_profile_enable_requires_reboot_without_a_stress_test() {
    let store = MockSettingStore::new();
    store.seed("Extreme Memory Profile (XMP)", "0");

    let results = vec![
        trial(1000.0, 60.0, true), // baseline
        trial(1000.0, 60.0, true), // finalization
    ];

    let dir = tempfile::tempdir().unwrap();
    let engine = make_engine(store, results, dir.path().to_path_buf());
    let profile = engine.execute_tuning(None, &|_| {}).unwrap();

    assert!(profile.requires_reboot);
    let param = &profile.bios_parameters["Extreme Memory Profile (XMP)"];
    assert!(param.modified);
    assert_eq!(param.best_value, 1);
}

#[test]
fn baseline_failure_aborts_the_whole_run() {
    let store = MockSettingStore::new();
    let results = vec![trial(0.0, 60.0, false)];

    let dir = tempfile::tempdir().unwrap();
    let engine = make_engine(store, results, dir.path().to_path_buf());
    let profile = engine.execute_tuning(None, &|_| {}).unwrap();

    assert!(!profile.is_stable);
    assert_eq!(profile.test_history.len(), 1);
    assert!(profile.modified_parameter_names().is_empty());
}
