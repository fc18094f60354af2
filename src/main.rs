use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cpu_tuner::checkpoint::CheckpointStore;
use cpu_tuner::config::{self, TunerConfig};
use cpu_tuner::engine::TuningEngine;
use cpu_tuner::error::TunerError;
use cpu_tuner::monitor::LinuxSysfsMonitor;
use cpu_tuner::settings::ScewinSettingStore;
use cpu_tuner::stress::CpuStressDriver;

#[derive(Parser)]
#[command(name = "cpu_tuner", version, about = "Automatic CPU performance tuner")]
struct Cli {
    /// Path to a TOML config file. Defaults to the platform config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fresh tuning session from the start.
    Run,
    /// Resume a tuning session from a saved checkpoint file.
    Resume {
        checkpoint: PathBuf,
    },
    /// Print the checkpoint directory's latest status.
    Status,
    /// List saved checkpoint files, oldest first.
    ListCheckpoints,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("error: {}", e.user_message());
        std::process::exit(1);
    }
}

fn run() -> Result<(), TunerError> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let cfg: TunerConfig = config::load_or_default(&config_path)?;

    match cli.command {
        Command::Run => execute(&cfg, None),
        Command::Resume { checkpoint } => execute(&cfg, Some(checkpoint)),
        Command::Status => print_status(&cfg),
        Command::ListCheckpoints => list_checkpoints(&cfg),
    }
}

fn build_engine(
    cfg: &TunerConfig,
) -> Result<TuningEngine<ScewinSettingStore, CpuStressDriver<LinuxSysfsMonitor>, LinuxSysfsMonitor>, TunerError> {
    let settings = ScewinSettingStore::new(cfg.firmware_tool_path.clone())?;
    let monitor = Arc::new(LinuxSysfsMonitor::new());
    let stress = CpuStressDriver::new(monitor.clone());
    let checkpoints = CheckpointStore::new(cfg.checkpoint_dir.clone())?;
    Ok(TuningEngine::new(
        settings,
        stress,
        monitor,
        checkpoints,
        cfg.constants.clone(),
        cfg.output_profile_path.clone(),
    ))
}

fn execute(cfg: &TunerConfig, recovery_checkpoint: Option<PathBuf>) -> Result<(), TunerError> {
    let engine = build_engine(cfg)?;

    let abort = engine.abort_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nreceived interrupt; finishing the current trial and stopping...");
        abort.store(true, Ordering::SeqCst);
    })
    .map_err(|e| TunerError::Config(format!("failed to install Ctrl-C handler: {e}")))?;

    let (progress_tx, progress_rx) = crossbeam_channel::unbounded::<String>();
    let printer = std::thread::spawn(move || {
        while let Ok(line) = progress_rx.recv() {
            println!("{line}");
        }
    });

    // The engine itself runs on a dedicated thread so the printer
    // above can drain progress lines concurrently with the tuning run.
    let engine_thread = std::thread::spawn(move || {
        let log = move |msg: &str| {
            let _ = progress_tx.send(msg.to_string());
        };
        engine.execute_tuning(recovery_checkpoint.as_deref(), &log)
    });

    let result = engine_thread.join().expect("engine thread panicked");
    // The engine thread has already dropped its sender by the time
    // `join` returns, so the printer's channel closes and this join
    // cannot hang.
    let _ = printer.join();
    let profile = result?;

    println!(
        "tuning run finished: stable={} reboot_required={} modified={}",
        profile.is_stable,
        profile.requires_reboot,
        profile.modified_parameter_names().join(", ")
    );
    Ok(())
}

fn print_status(cfg: &TunerConfig) -> Result<(), TunerError> {
    let checkpoints = CheckpointStore::new(cfg.checkpoint_dir.clone())?;
    match checkpoints.list()?.last() {
        Some(path) => {
            let checkpoint = checkpoints.load(path)?;
            println!(
                "latest checkpoint: {} (stage='{}' detail='{}')",
                path.display(),
                checkpoint.stage_name,
                checkpoint.detail
            );
        }
        None => println!("no checkpoints found in {}", cfg.checkpoint_dir.display()),
    }
    Ok(())
}

fn list_checkpoints(cfg: &TunerConfig) -> Result<(), TunerError> {
    let checkpoints = CheckpointStore::new(cfg.checkpoint_dir.clone())?;
    for path in checkpoints.list()? {
        println!("{}", path.display());
    }
    Ok(())
}
