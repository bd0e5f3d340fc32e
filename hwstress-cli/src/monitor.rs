// hwstress-cli/src/monitor.rs
// sysinfo-backed metrics source for stress runs

use chrono::Utc;
use hwstress_core::{MetricsSource, SystemMetrics};
use parking_lot::Mutex;
use sysinfo::{ComponentExt, CpuExt, DiskExt, System, SystemExt};

pub struct SystemMonitor {
    system: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_components_list();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}

impl MetricsSource for SystemMonitor {
    fn current_metrics(&self) -> SystemMetrics {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks();
        system.refresh_components();

        let total_memory = system.total_memory();
        let available_memory = system.available_memory();

        let (disk_total, disk_free) = system
            .disks()
            .iter()
            .fold((0u64, 0u64), |(total, free), disk| {
                (total + disk.total_space(), free + disk.available_space())
            });

        let temperature_c = system
            .components()
            .iter()
            .map(|c| c.temperature() as f64)
            .filter(|t| t.is_finite() && *t > 0.0)
            .fold(None, |hottest: Option<f64>, t| Some(hottest.map_or(t, |h| h.max(t))));

        SystemMetrics {
            cpu_percent: system.global_cpu_info().cpu_usage() as f64,
            memory_percent: percent(total_memory.saturating_sub(available_memory), total_memory),
            disk_percent: percent(disk_total.saturating_sub(disk_free), disk_total),
            temperature_c,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
            timestamp: Utc::now(),
        }
    }
}
