// hwstress-cli/src/main.rs
// hwstress - hardware stress runs and fault injection from the command line

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hwstress_core::{
    tracing_sink, CancellationToken, FaultKind, FaultRegistry, FaultSpec, RunResult, Severity,
    StressRunner, WorkloadKind,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod monitor;

use config::Config;
use monitor::SystemMonitor;

#[derive(Parser, Debug)]
#[command(name = "hwstress", version, about = "Hardware stress runs and fault injection")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "hwstress.toml")]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one stress workload
    Run(RunArgs),
    /// Inject a single fault and hold it while auto-recovery runs
    Fault(FaultArgs),
    /// Inject each safe fault kind in turn and print the history
    Demo,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, value_enum)]
    kind: Option<KindArg>,
    /// Duration in seconds
    #[arg(short, long)]
    duration: Option<u64>,
    /// Worker threads (0 = auto)
    #[arg(short, long)]
    threads: Option<usize>,
    /// Workload intensity, 1-10
    #[arg(short, long)]
    intensity: Option<u8>,
}

#[derive(Args, Debug)]
struct FaultArgs {
    #[arg(short, long, value_enum)]
    kind: FaultArg,
    #[arg(short, long)]
    target: String,
    #[arg(short, long, value_enum, default_value = "low")]
    severity: SeverityArg,
    #[arg(short, long, default_value_t = 1.0)]
    probability: f64,
    /// Seconds to hold before clearing; defaults to one recovery cycle
    #[arg(long)]
    hold: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Cpu,
    Memory,
    Disk,
    Gpu,
    Combined,
}

impl From<KindArg> for WorkloadKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Cpu => WorkloadKind::Cpu,
            KindArg::Memory => WorkloadKind::Memory,
            KindArg::Disk => WorkloadKind::Disk,
            KindArg::Gpu => WorkloadKind::GpuSimulated,
            KindArg::Combined => WorkloadKind::Combined,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FaultArg {
    Memory,
    Cpu,
    Disk,
    Network,
    Timing,
    ProcessKill,
    Syscall,
}

impl From<FaultArg> for FaultKind {
    fn from(kind: FaultArg) -> Self {
        match kind {
            FaultArg::Memory => FaultKind::MemoryCorruption,
            FaultArg::Cpu => FaultKind::CpuOverload,
            FaultArg::Disk => FaultKind::DiskIOError,
            FaultArg::Network => FaultKind::NetworkPacketLoss,
            FaultArg::Timing => FaultKind::TimingAnomaly,
            FaultArg::ProcessKill => FaultKind::ProcessKill,
            FaultArg::Syscall => FaultKind::SystemCallFailure,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SeverityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<SeverityArg> for Severity {
    fn from(severity: SeverityArg) -> Self {
        match severity {
            SeverityArg::Low => Severity::Low,
            SeverityArg::Medium => Severity::Medium,
            SeverityArg::High => Severity::High,
            SeverityArg::Critical => Severity::Critical,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_ids(true)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config);

    match cli.command {
        Command::Run(args) => run_workload(config, args, cli.json),
        Command::Fault(args) => inject_fault(config, args, cli.json),
        Command::Demo => run_demo(config),
    }
}

fn run_workload(config: Config, args: RunArgs, json: bool) -> Result<()> {
    let mut workload = config.workload;
    if let Some(kind) = args.kind {
        workload.kind = kind.into();
    }
    if let Some(seconds) = args.duration {
        workload.duration = Duration::from_secs(seconds);
    }
    if let Some(threads) = args.threads {
        workload.thread_count = threads;
    }
    if let Some(intensity) = args.intensity {
        workload.intensity = intensity;
    }

    let runner = Arc::new(StressRunner::new(tracing_sink()).with_metrics(Arc::new(SystemMonitor::new())));
    runner.on_progress(|fraction| {
        let filled = (fraction * 40.0).round() as usize;
        eprint!("\r[{}{}] {:>3.0}%", "#".repeat(filled), ".".repeat(40 - filled), fraction * 100.0);
        let _ = std::io::stderr().flush();
    });

    let interrupt = Arc::clone(&runner);
    ctrlc::set_handler(move || {
        warn!("Interrupted, stopping run");
        interrupt.stop();
    })
    .context("installing Ctrl-C handler")?;

    runner.start(workload).context("starting stress run")?;
    let result = runner.wait()?;
    eprintln!();

    print_result(&result, json)
}

fn print_result(result: &RunResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("{} ({})", result.name, result.kind);
    println!("  status:      {:?}", result.status);
    println!("  duration:    {:.2}s", result.duration.as_secs_f64());
    println!("  workers:     {}", result.workers);
    println!("  operations:  {}", result.operations_completed);
    println!("  errors:      {}", result.errors_encountered);
    println!("  passed:      {}", result.test_passed);
    if let Some(message) = &result.error_message {
        println!("  message:     {}", message);
    }
    if let (Some(baseline), Some(peak)) = (&result.baseline_metrics, &result.peak_metrics) {
        println!(
            "  cpu:         {:.1}% -> peak {:.1}%",
            baseline.cpu_percent, peak.cpu_percent
        );
        println!(
            "  memory:      {:.1}% -> peak {:.1}%",
            baseline.memory_percent, peak.memory_percent
        );
        if let Some(temp) = peak.temperature_c {
            println!("  temperature: peak {:.1}C", temp);
        }
    }
    Ok(())
}

fn build_registry(config: Config) -> Result<Arc<FaultRegistry>> {
    let registry = Arc::new(FaultRegistry::new(config.registry, tracing_sink())?);
    registry.on_injected(|record| {
        if record.success {
            println!("injected  {} ({}) on {}", record.kind, record.severity, record.target);
        } else {
            println!(
                "failed    {} on {}: {}",
                record.kind,
                record.target,
                record.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    });
    registry.on_recovered(|record| {
        println!(
            "recovered {} on {} after {:.1}s",
            record.kind,
            record.target,
            record.observed.as_secs_f64()
        );
    });
    Ok(registry)
}

/// Long enough for the recovery loop to retire a fresh fault
fn recovery_window(registry: &FaultRegistry, tick: Duration) -> Duration {
    registry.recovery_delay() + tick * 2
}

fn install_interrupt(registry: &Arc<FaultRegistry>) -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let interrupt = token.clone();
    let registry = Arc::clone(registry);
    ctrlc::set_handler(move || {
        warn!("Interrupted, clearing all faults");
        registry.clear_all();
        interrupt.cancel();
    })
    .context("installing Ctrl-C handler")?;
    Ok(token)
}

fn inject_fault(config: Config, args: FaultArgs, json: bool) -> Result<()> {
    let tick = config.registry.recovery_tick;
    let registry = build_registry(config)?;
    let interrupted = install_interrupt(&registry)?;

    let spec = FaultSpec::new(args.kind.into(), args.target.as_str(), args.severity.into())
        .with_probability(args.probability);
    if !registry.inject(spec) {
        info!("Fault not in effect");
    }

    let hold = args
        .hold
        .map(Duration::from_secs)
        .unwrap_or_else(|| recovery_window(&registry, tick));
    if registry.is_active(&args.target) {
        info!("Holding for {:?}", hold);
        interrupted.wait_timeout(hold);
    }
    registry.shutdown();

    if json {
        println!("{}", registry.export_history_json()?);
    }
    Ok(())
}

fn run_demo(config: Config) -> Result<()> {
    let tick = config.registry.recovery_tick;
    let registry = build_registry(config)?;
    let interrupted = install_interrupt(&registry)?;

    for (i, kind) in FaultKind::ALL.iter().enumerate() {
        if interrupted.is_cancelled() {
            break;
        }
        let target = match kind {
            // Left disabled by default, so this shows the simulated-only report
            FaultKind::ProcessKill => "0".to_string(),
            _ => format!("demo-target-{}", i),
        };
        registry.inject(FaultSpec::new(*kind, target, Severity::Low));
        interrupted.wait_timeout(Duration::from_millis(250));
    }

    let window = recovery_window(&registry, tick);
    info!("Waiting {:?} for auto-recovery", window);
    interrupted.wait_timeout(window);

    let remaining = registry.active_faults().len();
    if remaining > 0 {
        warn!("{} fault(s) still active, clearing", remaining);
    }
    registry.shutdown();

    let evicted = registry.history_evicted();
    if evicted > 0 {
        warn!("{} older record(s) no longer in history", evicted);
    }
    println!("{}", registry.export_history_json()?);
    Ok(())
}
