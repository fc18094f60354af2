//! Tuning Engine (C6, SPEC_FULL.md §4.4): orchestrates the staged
//! search, invokes the Setting Store and Stress Driver, maintains
//! safety invariants, and writes checkpoints via the Checkpoint
//! Store. This is the only component that mutates firmware settings.

use crate::checkpoint::CheckpointStore;
use crate::config::TuningConstants;
use crate::error::{CheckpointError, EngineError, SettingStoreError, TunerError};
use crate::monitor::CpuMonitor;
use crate::profile::Profile;
use crate::settings::{tables, SettingStore};
use crate::stress::StressDriver;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Stages in fixed execution order (SPEC_FULL.md §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningStage {
    Initialization,
    Baseline,
    Analysis,
    Undervolt,
    PowerLimits,
    CStates,
    Memory,
    Finalization,
}

impl TuningStage {
    pub const ALL: [TuningStage; 8] = [
        TuningStage::Initialization,
        TuningStage::Baseline,
        TuningStage::Analysis,
        TuningStage::Undervolt,
        TuningStage::PowerLimits,
        TuningStage::CStates,
        TuningStage::Memory,
        TuningStage::Finalization,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TuningStage::Initialization => "initialization",
            TuningStage::Baseline => "baseline",
            TuningStage::Analysis => "analysis",
            TuningStage::Undervolt => "undervolt",
            TuningStage::PowerLimits => "power_limits",
            TuningStage::CStates => "cstates",
            TuningStage::Memory => "memory",
            TuningStage::Finalization => "finalization",
        }
    }

    pub fn ordinal(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).expect("every stage is in ALL")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().find(|s| s.name() == name).copied()
    }
}

/// Whether a stage ran to completion or the run should stop entirely
/// (user abort). Distinct from an `Err`, which only a failed baseline
/// or a checkpoint I/O failure produces at this level.
enum StageControl {
    Continue,
    Abort,
}

fn emit_info(log: &dyn Fn(&str), msg: &str) {
    log(msg);
    log::info!("{msg}");
}

fn emit_warn(log: &dyn Fn(&str), msg: &str) {
    log(msg);
    log::warn!("{msg}");
}

/// Guards [`TuningEngine::execute_tuning`] against concurrent
/// re-entry, resetting the flag even if a stage returns early via `?`.
struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, EngineError> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        Ok(RunningGuard { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Resolve which stage index to resume at from a loaded checkpoint's
/// `(stage_name, detail)`, per SPEC_FULL.md §4.4.1's gating rule.
fn resolve_resume_index(stage_name: &str, detail: &str) -> Option<usize> {
    if let Some(stripped) = stage_name.strip_suffix("_start") {
        if !detail.is_empty() {
            return TuningStage::from_name(stripped).map(|s| s.ordinal());
        }
    }
    if detail.is_empty() {
        return TuningStage::from_name(stage_name).map(|s| s.ordinal() + 1);
    }
    TuningStage::from_name(stage_name).map(|s| s.ordinal())
}

fn undervolt_targets(current: i64) -> Vec<i64> {
    if current >= 0 {
        return vec![-20, -40, -60, -80, -100];
    }
    let mut start = (current as f64 / 20.0).floor() as i64 * 20;
    if start == current {
        start -= 20;
    }
    let floor_limit = current - 100;
    let mut targets = Vec::new();
    let mut v = start;
    while v >= floor_limit {
        targets.push(v);
        v -= 20;
    }
    targets.sort_unstable_by(|a, b| b.cmp(a));
    targets
}

fn select_pl1_name(candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|n| {
            let lower = n.to_lowercase();
            lower.contains("long") || lower.contains("pl1") || lower.contains("package power limit 1")
        })
        .or_else(|| candidates.iter().find(|n| n.to_lowercase().contains("ppt")))
        .cloned()
        .unwrap_or_else(|| candidates[0].clone())
}

fn select_pl2_name(candidates: &[String], pl1_name: &str) -> Option<String> {
    candidates
        .iter()
        .find(|n| {
            let lower = n.to_lowercase();
            (lower.contains("short") || lower.contains("pl2")) && n.as_str() != pl1_name
        })
        .cloned()
}

fn select_cstate_name(candidates: &[String]) -> String {
    for keyword in tables::CSTATE_FINDER_KEYWORDS {
        if let Some(found) = candidates.iter().find(|n| n.to_lowercase().contains(keyword)) {
            return found.clone();
        }
    }
    candidates[0].clone()
}

/// Orchestrates the staged search described in SPEC_FULL.md §4.4.
pub struct TuningEngine<S: SettingStore, D: StressDriver, M: CpuMonitor> {
    settings: S,
    stress: D,
    monitor: Arc<M>,
    checkpoints: CheckpointStore,
    constants: TuningConstants,
    output_profile_path: PathBuf,
    running: AtomicBool,
    abort: Arc<AtomicBool>,
}

impl<S: SettingStore, D: StressDriver, M: CpuMonitor> TuningEngine<S, D, M> {
    pub fn new(
        settings: S,
        stress: D,
        monitor: Arc<M>,
        checkpoints: CheckpointStore,
        constants: TuningConstants,
        output_profile_path: PathBuf,
    ) -> Self {
        TuningEngine {
            settings,
            stress,
            monitor,
            checkpoints,
            constants,
            output_profile_path,
            running: AtomicBool::new(false),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The abort flag a CLI front end can wire a `Ctrl-C` handler to.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn execute_tuning(
        &self,
        recovery_checkpoint: Option<&Path>,
        log: &dyn Fn(&str),
    ) -> Result<Profile, TunerError> {
        let _guard = RunningGuard::acquire(&self.running)?;
        self.abort.store(false, Ordering::SeqCst);

        let (mut profile, start_idx) = match recovery_checkpoint {
            Some(path) => {
                let checkpoint = self.checkpoints.load(path)?;
                let idx = resolve_resume_index(&checkpoint.stage_name, &checkpoint.detail)
                    .ok_or_else(|| CheckpointError::MalformedName(checkpoint.stage_name.clone()))?;
                emit_info(
                    log,
                    &format!(
                        "resuming from checkpoint stage='{}' detail='{}'",
                        checkpoint.stage_name, checkpoint.detail
                    ),
                );
                (checkpoint.profile_snapshot, idx)
            }
            None => {
                let info = self.monitor.collect_system_info();
                (Profile::new(&info.cpu_model, Utc::now()), 0)
            }
        };

        for stage in TuningStage::ALL.iter().skip(start_idx) {
            if self.abort.load(Ordering::SeqCst) {
                emit_info(log, "abort requested before next stage; stopping");
                return Ok(profile);
            }

            self.checkpoints
                .save(&profile, &format!("{}_start", stage.name()), "in_progress", Utc::now())?;
            emit_info(log, &format!("stage '{}' starting", stage.name()));

            let stage_result = match stage {
                TuningStage::Initialization => self.run_initialization(&mut profile, log),
                TuningStage::Baseline => self.run_baseline(&mut profile, log),
                TuningStage::Analysis => self.run_analysis(&mut profile, log),
                TuningStage::Undervolt => self.run_undervolt(&mut profile, log),
                TuningStage::PowerLimits => self.run_power_limits(&mut profile, log),
                TuningStage::CStates => self.run_cstates(&mut profile, log),
                TuningStage::Memory => self.run_memory(&mut profile, log),
                TuningStage::Finalization => self.run_finalization(&mut profile, log),
            };

            match stage_result {
                Err(TunerError::Engine(EngineError::BaselineFailed)) => {
                    self.checkpoints.save(&profile, stage.name(), "", Utc::now())?;
                    emit_warn(log, "baseline failed; aborting tuning run");
                    return Ok(profile);
                }
                Err(e) => return Err(e),
                Ok(StageControl::Abort) => {
                    self.checkpoints.save(&profile, stage.name(), "", Utc::now())?;
                    emit_info(log, &format!("stage '{}' aborted by user request", stage.name()));
                    return Ok(profile);
                }
                Ok(StageControl::Continue) => {
                    self.checkpoints.save(&profile, stage.name(), "", Utc::now())?;
                    emit_info(log, &format!("stage '{}' complete", stage.name()));
                }
            }
        }

        Ok(profile)
    }

    fn discover_candidate(&self, candidates: &[&str]) -> Result<Option<(String, i64)>, TunerError> {
        for name in candidates {
            match self.settings.read_value(name) {
                Ok(value) => return Ok(Some((name.to_string(), value))),
                Err(SettingStoreError::SettingNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn run_initialization(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        match self.try_initialization(profile, log) {
            Ok(()) => Ok(StageControl::Continue),
            Err(e) => {
                emit_warn(log, &format!("initialization stage failed, continuing: {e}"));
                Ok(StageControl::Continue)
            }
        }
    }

    fn try_initialization(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<(), TunerError> {
        let pl1 = self.discover_candidate(tables::PL1_CANDIDATES)?;
        let pl2 = self.discover_candidate(tables::PL2_CANDIDATES)?;
        let voltage = self.discover_candidate(tables::VOLTAGE_OFFSET_CANDIDATES)?;

        if let Some((name, value)) = &pl1 {
            profile.register_parameter(name, *value, tables::categorize(name), name);
            profile.pl1_param_name = Some(name.clone());
            profile.power_limit1 = Some(*value);
        } else {
            let estimate = crate::monitor::tdp_for_model(&profile.cpu_model) as i64;
            profile.power_limit1 = Some(estimate);
            emit_warn(log, &format!("no PL1 candidate setting found; estimating {estimate}W from CPU model"));
        }

        if let Some((name, value)) = &pl2 {
            profile.register_parameter(name, *value, tables::categorize(name), name);
            profile.pl2_param_name = Some(name.clone());
            profile.power_limit2 = Some(*value);
        } else {
            let estimate = (profile.power_limit1.unwrap_or(0) as f64 * 1.25) as i64;
            profile.power_limit2 = Some(estimate);
            emit_warn(log, &format!("no PL2 candidate setting found; estimating {estimate}W as 1.25x PL1"));
        }

        if let Some((name, value)) = &voltage {
            profile.register_parameter(name, *value, tables::categorize(name), name);
            profile.voltage_param_name = Some(name.clone());
            profile.voltage_offset_mv = Some(*value);
        } else {
            profile.voltage_offset_mv = Some(0);
        }

        emit_info(
            log,
            &format!(
                "discovered PL1={:?} PL2={:?} voltage_offset={:?}",
                profile.power_limit1, profile.power_limit2, profile.voltage_offset_mv
            ),
        );
        Ok(())
    }

    fn run_baseline(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        if self.abort.load(Ordering::SeqCst) {
            return Ok(StageControl::Abort);
        }
        let result = self.stress.run(self.constants.medium_test_duration_s, &self.abort, log);
        profile.record_trial(Utc::now(), "baseline", 0, result, 0.0);
        profile.set_baseline_if_absent(result);
        profile.set_best_if_better(result);

        if !result.completed {
            profile.is_stable = false;
            emit_warn(log, "baseline stress test did not complete; system is already unstable");
            return Err(EngineError::BaselineFailed.into());
        }
        Ok(StageControl::Continue)
    }

    fn run_analysis(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        match self.try_analysis(profile, log) {
            Ok(()) => Ok(StageControl::Continue),
            Err(e) => {
                emit_warn(log, &format!("analysis stage failed, continuing: {e}"));
                Ok(StageControl::Continue)
            }
        }
    }

    fn try_analysis(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<(), TunerError> {
        let settings = self.settings.parse_all()?;
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for setting in settings.values().filter(|s| s.performance_related) {
            *counts.entry(setting.category).or_insert(0) += 1;
            profile.register_parameter(&setting.name, setting.value.as_int(), setting.category, &setting.name);
        }
        let mut categories: Vec<_> = counts.into_iter().collect();
        categories.sort();
        for (category, count) in categories {
            emit_info(log, &format!("analysis: {count} performance-related setting(s) in category '{category}'"));
        }
        Ok(())
    }

    fn run_undervolt(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        match self.try_undervolt(profile, log) {
            Ok(control) => Ok(control),
            Err(e) => {
                emit_warn(log, &format!("undervolt stage failed, continuing: {e}"));
                Ok(StageControl::Continue)
            }
        }
    }

    fn try_undervolt(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        let candidates = self.settings.find_voltage_parameters()?;
        if candidates.is_empty() {
            emit_info(log, "no voltage offset parameter found; skipping undervolt stage");
            return Ok(StageControl::Continue);
        }
        let name = candidates
            .iter()
            .find(|n| n.to_lowercase().contains("offset"))
            .cloned()
            .unwrap_or_else(|| candidates[0].clone());
        profile.voltage_param_name = Some(name.clone());

        let current = self.settings.read_value(&name)?;
        let targets = undervolt_targets(current);

        // `best_perf` is the highest throughput seen among accepted
        // trials, used only as the regression denominator. The value
        // actually left committed in firmware on break is the most
        // recently *accepted* offset, not the highest-perf one — an
        // accepted-but-not-improving trial (rule 2) stays written.
        let mut best_perf = profile.best_results.as_ref().map(|r| r.ops_per_second).unwrap_or(1.0);
        let mut last_accepted_offset = current;

        for target in targets {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(StageControl::Abort);
            }
            self.checkpoints
                .save(profile, "undervolt_start", &format!("trying offset {target}"), Utc::now())?;

            if let Err(e) = self.settings.write_value(&name, target) {
                emit_warn(log, &format!("failed to write voltage offset {target}: {e}"));
                let _ = self.settings.write_value(&name, last_accepted_offset);
                break;
            }
            thread::sleep(Duration::from_secs(2));

            let result = self.stress.run(self.constants.short_test_duration_s, &self.abort, log);
            let perf_delta_pct = (result.ops_per_second / best_perf - 1.0) * 100.0;
            profile.record_trial(Utc::now(), &name, target, result, perf_delta_pct);

            if !result.completed {
                emit_warn(log, &format!("voltage offset {target} did not complete; reverting to {last_accepted_offset}"));
                let _ = self.settings.write_value(&name, last_accepted_offset);
                break;
            }
            if result.ops_per_second / best_perf >= self.constants.acceptable_perf_loss {
                if result.ops_per_second > best_perf {
                    best_perf = result.ops_per_second;
                }
                last_accepted_offset = target;
                profile.commit_parameter(&name, target);
            } else {
                emit_info(log, &format!("voltage offset {target} regressed beyond tolerance; reverting to {last_accepted_offset}"));
                let _ = self.settings.write_value(&name, last_accepted_offset);
                break;
            }
        }

        profile.commit_parameter(&name, last_accepted_offset);
        profile.voltage_offset_mv = Some(last_accepted_offset);
        emit_info(log, &format!("undervolt stage settled on offset {last_accepted_offset}"));
        Ok(StageControl::Continue)
    }

    fn run_power_limits(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        match self.try_power_limits(profile, log) {
            Ok(control) => Ok(control),
            Err(e) => {
                emit_warn(log, &format!("power limit stage failed, continuing: {e}"));
                Ok(StageControl::Continue)
            }
        }
    }

    fn try_power_limits(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        let candidates = self.settings.find_power_limit_parameters()?;
        if candidates.is_empty() {
            emit_info(log, "no power limit parameter found; skipping power limit stage");
            return Ok(StageControl::Continue);
        }
        let pl1_name = select_pl1_name(&candidates);
        let pl2_name = select_pl2_name(&candidates, &pl1_name);
        profile.pl1_param_name = Some(pl1_name.clone());
        profile.pl2_param_name = pl2_name.clone();

        let current_pl1 = self.settings.read_value(&pl1_name)?;
        let mut current_pl2 = match &pl2_name {
            Some(name) => self.settings.read_value(name).ok(),
            None => None,
        };

        if self.abort.load(Ordering::SeqCst) {
            return Ok(StageControl::Abort);
        }
        self.checkpoints.save(profile, "power_limits_start", "baseline trial", Utc::now())?;
        let baseline = self.stress.run(self.constants.medium_test_duration_s, &self.abort, log);
        profile.record_trial(Utc::now(), "power_limit_baseline", current_pl1, baseline, 0.0);

        if !baseline.completed {
            emit_warn(log, "power limit baseline trial did not complete; skipping stage");
            return Ok(StageControl::Continue);
        }

        let mut best_perf = baseline
            .ops_per_second
            .max(profile.best_results.as_ref().map(|r| r.ops_per_second).unwrap_or(0.0));
        let mut best_pl1 = current_pl1;
        let mut best_pl2 = current_pl2;

        let ceiling = (current_pl1 as f64 * 1.5).floor() as i64;
        let mut v = current_pl1 + 5;
        while v <= ceiling {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(StageControl::Abort);
            }
            self.checkpoints
                .save(profile, "power_limits_start", &format!("trying pl1={v}"), Utc::now())?;

            let target_pl2 = pl2_name.as_ref().map(|_| current_pl2.unwrap_or(v).max(v));

            if let Err(e) = self.settings.write_value(&pl1_name, v) {
                emit_warn(log, &format!("failed to write PL1={v}: {e}"));
                let _ = self.settings.write_value(&pl1_name, best_pl1);
                break;
            }
            if let (Some(name), Some(value)) = (&pl2_name, target_pl2) {
                if let Err(e) = self.settings.write_value(name, value) {
                    emit_warn(log, &format!("failed to write PL2={value}: {e}"));
                }
            }
            thread::sleep(Duration::from_secs(2));

            let result = self.stress.run(self.constants.medium_test_duration_s, &self.abort, log);
            let perf_delta_pct = (result.ops_per_second / best_perf - 1.0) * 100.0;
            profile.record_trial(Utc::now(), &pl1_name, v, result, perf_delta_pct);

            if !result.completed {
                emit_warn(log, &format!("PL1={v} did not complete; reverting to {best_pl1}"));
                let _ = self.settings.write_value(&pl1_name, best_pl1);
                if let Some(name) = &pl2_name {
                    let _ = self.settings.write_value(name, best_pl2.unwrap_or(best_pl1));
                }
                break;
            }
            if result.max_temp_c > self.constants.thermal_limit_c {
                emit_warn(
                    log,
                    &format!("PL1={v} exceeded thermal limit ({:.1}C); reverting to {best_pl1}", result.max_temp_c),
                );
                let _ = self.settings.write_value(&pl1_name, best_pl1);
                if let Some(name) = &pl2_name {
                    let _ = self.settings.write_value(name, best_pl2.unwrap_or(best_pl1));
                }
                break;
            }
            if result.ops_per_second / best_perf >= self.constants.perf_improvement_threshold {
                best_perf = result.ops_per_second;
                best_pl1 = v;
                best_pl2 = target_pl2;
                current_pl2 = target_pl2;
                profile.commit_parameter(&pl1_name, v);
                if let (Some(name), Some(value)) = (&pl2_name, target_pl2) {
                    profile.commit_parameter(name, value);
                }
                v += 5;
            } else {
                emit_info(log, &format!("PL1={v} showed diminishing returns; reverting to {best_pl1}"));
                let _ = self.settings.write_value(&pl1_name, best_pl1);
                if let Some(name) = &pl2_name {
                    let _ = self.settings.write_value(name, best_pl2.unwrap_or(best_pl1));
                }
                break;
            }
        }

        profile.power_limit1 = Some(best_pl1);
        profile.power_limit2 = best_pl2;
        emit_info(log, &format!("power limit stage settled on PL1={best_pl1} PL2={best_pl2:?}"));
        Ok(StageControl::Continue)
    }

    fn run_cstates(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        match self.try_cstates(profile, log) {
            Ok(control) => Ok(control),
            Err(e) => {
                emit_warn(log, &format!("c-states stage failed, continuing: {e}"));
                Ok(StageControl::Continue)
            }
        }
    }

    fn try_cstates(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        let candidates = self.settings.find_cstate_parameters()?;
        if candidates.is_empty() {
            emit_info(log, "no C-state parameter found; skipping C-states stage");
            return Ok(StageControl::Continue);
        }
        let name = select_cstate_name(&candidates);
        // Every branch of the declared-type rule resolves to 0 as written.
        let disable_value = 0i64;
        let current = self.settings.read_value(&name)?;
        if current == disable_value {
            emit_info(log, &format!("C-state setting '{name}' already disabled; skipping"));
            return Ok(StageControl::Continue);
        }

        if self.abort.load(Ordering::SeqCst) {
            return Ok(StageControl::Abort);
        }
        self.checkpoints.save(profile, "cstates_start", "baseline trial", Utc::now())?;
        let baseline = self.stress.run(self.constants.short_test_duration_s, &self.abort, log);
        profile.record_trial(Utc::now(), "cstate_baseline", current, baseline, 0.0);
        if !baseline.completed {
            emit_warn(log, "C-states baseline trial did not complete; skipping stage");
            return Ok(StageControl::Continue);
        }

        if let Err(e) = self.settings.write_value(&name, disable_value) {
            emit_warn(log, &format!("failed to disable '{name}': {e}"));
            return Ok(StageControl::Continue);
        }
        thread::sleep(Duration::from_secs(2));
        let disabled = self.stress.run(self.constants.short_test_duration_s, &self.abort, log);
        let perf_delta_pct = (disabled.ops_per_second / baseline.ops_per_second - 1.0) * 100.0;
        profile.record_trial(Utc::now(), &name, disable_value, disabled, perf_delta_pct);

        if disabled.completed && disabled.ops_per_second / baseline.ops_per_second >= self.constants.perf_improvement_threshold
        {
            profile.commit_parameter(&name, disable_value);
            emit_info(log, &format!("disabling '{name}' improved throughput by {perf_delta_pct:.2}%"));
        } else {
            emit_info(log, &format!("disabling '{name}' did not improve throughput; reverting"));
            let _ = self.settings.write_value(&name, current);
        }
        Ok(StageControl::Continue)
    }

    fn run_memory(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        match self.try_memory(profile, log) {
            Ok(control) => Ok(control),
            Err(e) => {
                emit_warn(log, &format!("memory stage failed, continuing: {e}"));
                Ok(StageControl::Continue)
            }
        }
    }

    fn try_memory(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        let mut candidates = self.settings.find_xmp_parameters()?;
        if candidates.is_empty() {
            candidates = profile
                .bios_parameters
                .values()
                .filter(|p| p.category == "memory")
                .map(|p| p.name.clone())
                .collect();
        }
        if candidates.is_empty() {
            emit_info(log, "no memory profile parameter found; skipping memory stage");
            return Ok(StageControl::Continue);
        }
        let name = candidates
            .iter()
            .find(|n| {
                let lower = n.to_lowercase();
                lower.contains("profile") && (lower.contains("xmp") || lower.contains("docp"))
            })
            .cloned()
            .unwrap_or_else(|| candidates[0].clone());

        let current = self.settings.read_value(&name)?;
        if current > 0 {
            profile.mark_requires_reboot();
            emit_info(log, &format!("memory profile '{name}' already enabled; reboot required"));
            return Ok(StageControl::Continue);
        }

        if let Err(e) = self.settings.write_value(&name, 1) {
            emit_warn(log, &format!("failed to enable memory profile '{name}': {e}"));
            return Ok(StageControl::Continue);
        }
        profile.commit_parameter(&name, 1);
        profile.mark_requires_reboot();
        emit_info(log, &format!("enabled memory profile '{name}'; reboot required, no stress test run"));
        Ok(StageControl::Continue)
    }

    fn run_finalization(&self, profile: &mut Profile, log: &dyn Fn(&str)) -> Result<StageControl, TunerError> {
        let result = self.stress.run(self.constants.final_test_duration_s, &self.abort, log);
        profile.record_trial(Utc::now(), "final_validation", 0, result, 0.0);
        profile.set_best_if_better(result);
        if !result.completed {
            profile.is_stable = false;
            emit_warn(log, "final validation stress test did not complete");
        }

        self.apply_best_settings(profile, log);

        if let Err(e) = self.persist_profile(profile) {
            emit_warn(log, &format!("failed to persist final profile: {e}"));
        }

        self.render_report(profile, log);
        Ok(StageControl::Continue)
    }

    /// Idempotent re-assertion of every committed value, skipping the
    /// three scalars already written directly by their own stages.
    fn apply_best_settings(&self, profile: &Profile, log: &dyn Fn(&str)) {
        let explicit: Vec<&str> = [
            profile.pl1_param_name.as_deref(),
            profile.pl2_param_name.as_deref(),
            profile.voltage_param_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();

        if let (Some(name), Some(value)) = (&profile.voltage_param_name, profile.voltage_offset_mv) {
            if let Err(e) = self.settings.write_value(name, value) {
                emit_warn(log, &format!("failed to re-apply voltage offset: {e}"));
            }
        }
        if let (Some(name), Some(value)) = (&profile.pl1_param_name, profile.power_limit1) {
            if let Err(e) = self.settings.write_value(name, value) {
                emit_warn(log, &format!("failed to re-apply PL1: {e}"));
            }
        }
        if let (Some(name), Some(value)) = (&profile.pl2_param_name, profile.power_limit2) {
            if let Err(e) = self.settings.write_value(name, value) {
                emit_warn(log, &format!("failed to re-apply PL2: {e}"));
            }
        }

        for param in profile.bios_parameters.values() {
            if !param.modified || explicit.contains(&param.name.as_str()) {
                continue;
            }
            if let Err(e) = self.settings.write_value(&param.name, param.best_value) {
                emit_warn(log, &format!("failed to re-apply '{}': {e}", param.name));
            }
        }
    }

    fn persist_profile(&self, profile: &Profile) -> Result<(), TunerError> {
        let body = serde_json::to_string_pretty(profile).map_err(|e| TunerError::Config(e.to_string()))?;
        if let Some(parent) = self.output_profile_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.output_profile_path, body)?;
        Ok(())
    }

    fn render_report(&self, profile: &Profile, log: &dyn Fn(&str)) {
        emit_info(log, "=== Tuning Report ===");
        if let (Some(baseline), Some(best)) = (&profile.baseline_results, &profile.best_results) {
            emit_info(log, &format!("baseline throughput: {:.1} ops/sec", baseline.ops_per_second));
            let delta_pct = (best.ops_per_second / baseline.ops_per_second - 1.0) * 100.0;
            emit_info(log, &format!("best throughput: {:.1} ops/sec ({delta_pct:+.2}%)", best.ops_per_second));
        }
        if let Some(max_temp) = profile.max_temperature {
            emit_info(log, &format!("maximum temperature observed: {max_temp:.1}C"));
        }
        let modified = profile.modified_parameter_names();
        emit_info(
            log,
            &format!("modified parameters: {}", if modified.is_empty() { "none".to_string() } else { modified.join(", ") }),
        );
        emit_info(log, &format!("reboot required: {}", profile.requires_reboot));
        emit_info(log, &format!("stable: {}", profile.is_stable));

        match serde_json::to_string(profile) {
            Ok(summary) => log::info!("tuning report summary: {summary}"),
            Err(e) => log::warn!("failed to serialize report summary: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{CpuData, SystemInfo};
    use crate::settings::MockSettingStore;
    use crate::stress::{ScriptedStressDriver, StressTestResult};
    use std::collections::HashMap as StdHashMap;

    struct FixedMonitor;
    impl CpuMonitor for FixedMonitor {
        fn read_cpu_data(&self) -> CpuData {
            CpuData { temp_c: 50.0, power_w: 40.0, load_pct: 50.0 }
        }
        fn cpu_frequencies(&self) -> StdHashMap<u32, f64> {
            StdHashMap::new()
        }
        fn collect_system_info(&self) -> SystemInfo {
            SystemInfo { cpu_model: "Test CPU".into(), logical_cores: 4, cpu_frequencies_mhz: StdHashMap::new() }
        }
        fn session_maxima(&self) -> (f64, f64) {
            (50.0, 40.0)
        }
    }

    fn result(ops: f64, completed: bool) -> StressTestResult {
        StressTestResult {
            ops_per_second: ops,
            max_temp_c: 60.0,
            avg_temp_c: 58.0,
            max_power_w: 80.0,
            avg_power_w: 75.0,
            duration_s: 60,
            cpu_freq_mhz: 4000.0,
            completed,
        }
    }

    #[test]
    fn undervolt_targets_for_nonnegative_current() {
        assert_eq!(undervolt_targets(0), vec![-20, -40, -60, -80, -100]);
    }

    #[test]
    fn undervolt_targets_for_negative_current() {
        let targets = undervolt_targets(-55);
        assert_eq!(targets, vec![-60, -80, -100, -120, -140]);
    }

    #[test]
    fn undervolt_targets_excludes_current_when_already_a_multiple_of_twenty() {
        let targets = undervolt_targets(-40);
        assert_eq!(targets, vec![-60, -80, -100, -120, -140]);
        assert!(!targets.contains(&-40));
    }

    #[test]
    fn happy_undervolt_scenario_settles_on_minus_80() {
        let store = MockSettingStore::new();
        store.seed("Core Voltage Offset", "0");
        store.seed("Long Duration Power Limit", "65");

        let scripted = ScriptedStressDriver::new(vec![
            result(1000.0, true), // baseline
            result(1005.0, true), // -20
            result(1010.0, true), // -40
            result(1008.0, true), // -60
            result(1006.0, true), // -80
            result(0.0, false),   // -100
        ]);

        let engine = TuningEngine::new(
            store,
            scripted,
            Arc::new(FixedMonitor),
            CheckpointStore::new(tempfile::tempdir().unwrap().into_path()).unwrap(),
            TuningConstants::default(),
            tempfile::tempdir().unwrap().path().join("profile.json"),
        );

        let mut profile = Profile::new("Test CPU", Utc::now());
        engine.run_baseline(&mut profile, &|_| {}).unwrap();
        engine.run_undervolt(&mut profile, &|_| {}).unwrap();

        assert_eq!(profile.voltage_offset_mv, Some(-80));
    }

    #[test]
    fn baseline_failure_marks_profile_unstable_and_aborts() {
        let store = MockSettingStore::new();
        let scripted = ScriptedStressDriver::new(vec![result(0.0, false)]);
        let engine = TuningEngine::new(
            store,
            scripted,
            Arc::new(FixedMonitor),
            CheckpointStore::new(tempfile::tempdir().unwrap().into_path()).unwrap(),
            TuningConstants::default(),
            tempfile::tempdir().unwrap().path().join("profile.json"),
        );

        let mut profile = Profile::new("Test CPU", Utc::now());
        let err = engine.run_baseline(&mut profile, &|_| {}).unwrap_err();
        assert!(matches!(err, TunerError::Engine(EngineError::BaselineFailed)));
        assert!(!profile.is_stable);
    }

    #[test]
    fn resume_after_stage_with_empty_detail_skips_to_next_stage() {
        let idx = resolve_resume_index("power_limits", "").unwrap();
        assert_eq!(idx, TuningStage::CStates.ordinal());
    }

    #[test]
    fn resume_mid_stage_reenters_same_stage() {
        let idx = resolve_resume_index("undervolt_start", "trying offset -40").unwrap();
        assert_eq!(idx, TuningStage::Undervolt.ordinal());
    }
}
