// hwstress-core/examples/suite_with_faults.rs
// Runs a short stress suite while faults are injected and auto-recovered
// Run with: cargo run -p hwstress-core --example suite_with_faults

use hwstress_core::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting stress suite with background faults");
    info!("Hardware threads: {}", num_cpus::get());

    let registry = Arc::new(FaultRegistry::new(
        RegistryConfig {
            recovery_delay: Duration::from_secs(2),
            recovery_tick: Duration::from_millis(250),
            ..Default::default()
        },
        tracing_sink(),
    )?);
    registry.on_recovered(|record| {
        info!("{} on {} recovered after {:?}", record.kind, record.target, record.observed);
    });

    let suite = StressSuite::new(StressRunner::new(tracing_sink()), tracing_sink());
    suite.add_test(WorkloadConfig::new(WorkloadKind::Cpu, Duration::from_secs(3)));
    suite.add_test(WorkloadConfig::new(WorkloadKind::Memory, Duration::from_secs(3)));
    suite.add_test(WorkloadConfig::new(WorkloadKind::GpuSimulated, Duration::from_secs(3)));
    suite.set_global_intensity(3);

    // Faults land while the suite is running
    let injector = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for (kind, target) in [
                (FaultKind::TimingAnomaly, "scheduler"),
                (FaultKind::MemoryCorruption, "heap"),
                (FaultKind::CpuOverload, "core-0"),
            ] {
                registry.inject(FaultSpec::new(kind, target, Severity::Medium).with_probability(0.8));
                thread::sleep(Duration::from_secs(2));
            }
        })
    };

    let results = suite.run_all();
    if injector.join().is_err() {
        warn!("Fault injector thread panicked");
    }

    info!("Results:");
    for result in &results {
        info!(
            "   {:<24} {:?} ops={} errors={} {:.1}s",
            result.name,
            result.status,
            result.operations_completed,
            result.errors_encountered,
            result.duration.as_secs_f64()
        );
    }

    registry.shutdown();
    info!("Fault history:\n{}", registry.export_history_json()?);
    Ok(())
}
