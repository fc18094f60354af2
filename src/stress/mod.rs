//! Stress Driver (C3, SPEC_FULL.md §4.3): runs a CPU-bound multi-core
//! workload for a bounded time while the Monitor samples, producing a
//! [`StressTestResult`].

use crate::monitor::CpuMonitor;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// The outcome of one stress trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressTestResult {
    pub ops_per_second: f64,
    pub max_temp_c: f64,
    pub avg_temp_c: f64,
    pub max_power_w: f64,
    pub avg_power_w: f64,
    pub duration_s: u64,
    pub cpu_freq_mhz: f64,
    /// `false` marks an aborted trial: thermal trip, user abort,
    /// monitor failure, or the workload didn't run the full window.
    pub completed: bool,
}

/// `run` is given the engine's shared abort flag and a progress
/// callback invoked roughly every 10 seconds (SPEC_FULL.md §4.3).
pub trait StressDriver {
    fn run(&self, duration_s: u64, abort: &Arc<AtomicBool>, progress: &dyn Fn(&str)) -> StressTestResult;
}

/// Real stress driver: N = logical-CPU-count worker threads each
/// looping a tight floating-point kernel in 100k-iteration batches,
/// plus a 1-second sampling tick on the calling thread.
pub struct CpuStressDriver<M: CpuMonitor> {
    monitor: Arc<M>,
}

impl<M: CpuMonitor> CpuStressDriver<M> {
    pub fn new(monitor: Arc<M>) -> Self {
        CpuStressDriver { monitor }
    }
}

struct WorkerHandle {
    done_rx: crossbeam_channel::Receiver<()>,
    ops: Arc<AtomicU64>,
}

/// One batch of the sqrt-accumulation kernel. Exposed so the raw
/// per-batch throughput can be benchmarked without spinning up
/// worker threads or a Monitor.
pub fn run_kernel_batch(mut accumulator: f64, iterations: u64) -> f64 {
    for _ in 0..iterations {
        accumulator = (accumulator + 1.0).sqrt();
    }
    if accumulator.is_infinite() || accumulator.is_nan() {
        accumulator = 1.0;
    }
    accumulator
}

/// Repeated sqrt-accumulation kernel, 100k iterations per batch,
/// checking the stop flag between batches (not between iterations,
/// so a worker never pays synchronization cost inside the hot loop).
fn spawn_worker(stop: Arc<AtomicBool>) -> WorkerHandle {
    let ops = Arc::new(AtomicU64::new(0));
    let ops_for_thread = ops.clone();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    thread::spawn(move || {
        let mut accumulator: f64 = 1.0;
        while !stop.load(Ordering::Relaxed) {
            accumulator = run_kernel_batch(accumulator, 100_000);
            ops_for_thread.fetch_add(100_000, Ordering::Relaxed);
        }
        let _ = done_tx.send(());
    });

    WorkerHandle { done_rx, ops }
}

impl<M: CpuMonitor> StressDriver for CpuStressDriver<M> {
    fn run(&self, duration_s: u64, abort: &Arc<AtomicBool>, progress: &dyn Fn(&str)) -> StressTestResult {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_count = num_cpus::get().max(1);
        let workers: Vec<WorkerHandle> = (0..worker_count).map(|_| spawn_worker(stop.clone())).collect();

        let start = Instant::now();
        let mut temp_samples: Vec<f64> = Vec::new();
        let mut power_samples: Vec<f64> = Vec::new();
        let mut max_temp = 0.0f64;
        let mut max_power = 0.0f64;
        let mut completed = true;
        let mut elapsed = 0u64;

        while elapsed < duration_s {
            if abort.load(Ordering::Relaxed) {
                completed = false;
                break;
            }
            thread::sleep(Duration::from_secs(1));
            elapsed += 1;

            let sample = self.monitor.read_cpu_data();
            temp_samples.push(sample.temp_c);
            power_samples.push(sample.power_w);
            max_temp = max_temp.max(sample.temp_c);
            max_power = max_power.max(sample.power_w);

            if elapsed % 10 == 0 {
                progress(&format!(
                    "stress test: {elapsed}/{duration_s}s elapsed, temp={:.1}C power={:.1}W",
                    sample.temp_c, sample.power_w
                ));
            }
        }

        stop.store(true, Ordering::Relaxed);

        let mut total_ops: u64 = 0;
        for worker in workers {
            // Workers that refuse to exit within 1s are leaked; the
            // process reclaims them at exit (SPEC_FULL.md §5 Timeouts).
            let _ = worker.done_rx.recv_timeout(Duration::from_secs(1));
            total_ops += worker.ops.load(Ordering::Relaxed);
        }

        let wall_time = start.elapsed().as_secs_f64().max(0.001);
        let ops_per_second = total_ops as f64 / wall_time;
        let avg_temp_c = average(&temp_samples);
        let avg_power_w = average(&power_samples);
        let freqs = self.monitor.cpu_frequencies();
        let cpu_freq_mhz = if freqs.is_empty() {
            0.0
        } else {
            freqs.values().sum::<f64>() / freqs.len() as f64
        };

        StressTestResult {
            ops_per_second,
            max_temp_c: max_temp,
            avg_temp_c,
            max_power_w: max_power,
            avg_power_w,
            duration_s: elapsed,
            cpu_freq_mhz,
            completed,
        }
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Test double that returns a pre-scripted queue of results instead
/// of actually running the CPU kernel, used by the end-to-end
/// scenario suite (SPEC_FULL.md §8).
pub struct ScriptedStressDriver {
    queue: RefCell<VecDeque<StressTestResult>>,
}

impl ScriptedStressDriver {
    pub fn new(results: Vec<StressTestResult>) -> Self {
        ScriptedStressDriver {
            queue: RefCell::new(results.into_iter().collect()),
        }
    }
}

impl StressDriver for ScriptedStressDriver {
    fn run(&self, duration_s: u64, _abort: &Arc<AtomicBool>, _progress: &dyn Fn(&str)) -> StressTestResult {
        self.queue.borrow_mut().pop_front().unwrap_or(StressTestResult {
            ops_per_second: 0.0,
            max_temp_c: 0.0,
            avg_temp_c: 0.0,
            max_power_w: 0.0,
            avg_power_w: 0.0,
            duration_s,
            cpu_freq_mhz: 0.0,
            completed: false,
        })
    }
}
