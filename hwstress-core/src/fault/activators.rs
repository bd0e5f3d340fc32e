// hwstress-core/src/fault/activators.rs
// Kind-specific fault activation and the resource handle each one leaves behind

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::TaskGroup;
use crate::config::RegistryConfig;
use crate::error::{HwStressError, Result};
use crate::model::{FaultId, FaultKind, FaultSpec, Severity};
use crate::stress::payload::trig_work;

const BLOCK_BYTES: usize = 1024 * 1024;
const DISK_FILE_BYTES: usize = 1024 * 1024;

/// Everything one active fault owns until it is released.
///
/// Activation produces the handle; `release` consumes it, so teardown can
/// only ever happen once per record. A handle dropped without `release`
/// still joins its threads and removes its files.
pub enum FaultResource {
    /// Busy or disruption threads sharing one stop token
    Threads(TaskGroup),
    /// Retained pseudo-random blocks, oldest first
    Memory(VecDeque<Box<[u8]>>),
    /// Scratch files on disk
    Files(ScratchFiles),
    /// Irreversible effect with nothing left to tear down
    Nothing,
}

impl std::fmt::Debug for FaultResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl FaultResource {
    pub fn describe(&self) -> String {
        match self {
            FaultResource::Threads(group) => format!("{} thread(s)", group.len()),
            FaultResource::Memory(blocks) => {
                let bytes: usize = blocks.iter().map(|b| b.len()).sum();
                format!("{} block(s), {} bytes", blocks.len(), bytes)
            }
            FaultResource::Files(files) => format!("{} file(s)", files.paths().len()),
            FaultResource::Nothing => "no resources".to_string(),
        }
    }

    /// Tear down everything. Every item is attempted even if some fail.
    pub fn release(self) -> Result<()> {
        match self {
            FaultResource::Threads(mut group) => {
                let panicked = group.shutdown();
                if panicked > 0 {
                    return Err(HwStressError::Cleanup {
                        failures: vec![format!("{} fault thread(s) panicked", panicked)],
                    });
                }
                Ok(())
            }
            FaultResource::Memory(blocks) => {
                debug!("Releasing {} retained block(s)", blocks.len());
                drop(blocks);
                Ok(())
            }
            FaultResource::Files(mut files) => files.remove_all(),
            FaultResource::Nothing => Ok(()),
        }
    }
}

/// Scratch files owned by a disk fault. Whatever is still listed when the
/// handle drops is removed then.
pub struct ScratchFiles(Vec<PathBuf>);

impl ScratchFiles {
    pub fn paths(&self) -> &[PathBuf] {
        &self.0
    }

    fn remove_all(&mut self) -> Result<()> {
        let paths = std::mem::take(&mut self.0);
        remove_files(&paths)
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        if self.0.is_empty() {
            return;
        }
        debug!("Removing {} unreleased scratch file(s)", self.0.len());
        if let Err(e) = self.remove_all() {
            warn!("Scratch file cleanup on drop failed: {}", e);
        }
    }
}

/// What an activator may draw on
pub struct ActivationContext<'a> {
    pub id: FaultId,
    pub config: &'a RegistryConfig,
    pub rng: fastrand::Rng,
    pub live_threads: &'a Arc<AtomicUsize>,
}

/// Dispatch to the kind-specific activator.
///
/// On error nothing is left allocated: partially spawned threads are joined
/// and partially written files removed before returning.
pub fn activate(spec: &FaultSpec, ctx: ActivationContext<'_>) -> Result<FaultResource> {
    match spec.kind {
        FaultKind::CpuOverload => activate_cpu_overload(spec, ctx),
        FaultKind::MemoryCorruption => activate_memory_corruption(spec, ctx),
        FaultKind::DiskIOError => activate_disk_io_error(spec, ctx),
        FaultKind::NetworkPacketLoss | FaultKind::TimingAnomaly | FaultKind::SystemCallFailure => {
            activate_disruption(spec, ctx)
        }
        FaultKind::ProcessKill => activate_process_kill(spec, ctx.config),
    }
}

fn thread_label(kind: FaultKind, id: FaultId) -> String {
    let short = id.simple().to_string();
    format!("{}-{}", kind, &short[..8])
}

fn activate_cpu_overload(spec: &FaultSpec, ctx: ActivationContext<'_>) -> Result<FaultResource> {
    let mut group = TaskGroup::new(thread_label(spec.kind, ctx.id), Arc::clone(ctx.live_threads));

    for _ in 0..spec.severity.thread_count() {
        let spawned = group.spawn(|token| {
            let mut acc = 0.0;
            while !token.is_cancelled() {
                acc += trig_work(500);
            }
            std::hint::black_box(acc);
        });
        if let Err(e) = spawned {
            group.shutdown();
            return Err(e);
        }
    }

    Ok(FaultResource::Threads(group))
}

fn activate_memory_corruption(spec: &FaultSpec, mut ctx: ActivationContext<'_>) -> Result<FaultResource> {
    let total = spec.severity.memory_bytes();
    let cap = ctx.config.max_retained_blocks.max(1);
    let mut blocks: VecDeque<Box<[u8]>> = VecDeque::with_capacity(cap);

    let mut remaining = total;
    while remaining > 0 {
        let len = remaining.min(BLOCK_BYTES);
        let mut block = vec![0u8; len].into_boxed_slice();
        ctx.rng.fill(&mut block);
        if blocks.len() == cap {
            blocks.pop_front();
        }
        blocks.push_back(block);
        remaining -= len;
    }

    Ok(FaultResource::Memory(blocks))
}

fn activate_disk_io_error(spec: &FaultSpec, mut ctx: ActivationContext<'_>) -> Result<FaultResource> {
    let dir = &ctx.config.scratch_dir;
    fs::create_dir_all(dir)
        .map_err(|e| HwStressError::io(format!("create scratch dir {}", dir.display()), e))?;

    let count = spec.severity.disk_files();
    let mut paths = Vec::with_capacity(count);
    let mut content = vec![0u8; DISK_FILE_BYTES];

    for index in 0..count {
        let path = dir.join(format!("{}-{}.bin", ctx.id.simple(), index));
        ctx.rng.fill(&mut content);
        if let Err(e) = fs::write(&path, &content) {
            // Include the half-written file in cleanup
            paths.push(path.clone());
            if let Err(cleanup) = remove_files(&paths) {
                debug!("Cleanup after failed disk fault: {}", cleanup);
            }
            return Err(HwStressError::io(format!("write {}", path.display()), e));
        }
        paths.push(path);
    }

    Ok(FaultResource::Files(ScratchFiles(paths)))
}

fn activate_disruption(spec: &FaultSpec, mut ctx: ActivationContext<'_>) -> Result<FaultResource> {
    let interval = spec.severity.disruption_interval();
    let mut group = TaskGroup::new(thread_label(spec.kind, ctx.id), Arc::clone(ctx.live_threads));

    for _ in 0..disruption_threads(spec.severity) {
        let mut rng = ctx.rng.fork();
        let spawned = group.spawn(move |token| {
            let jitter_cap = interval.as_millis() as u64 / 2;
            loop {
                let pause = interval + Duration::from_millis(rng.u64(0..=jitter_cap));
                if token.wait_timeout(pause) {
                    break;
                }
            }
        });
        if let Err(e) = spawned {
            group.shutdown();
            return Err(e);
        }
    }

    Ok(FaultResource::Threads(group))
}

fn disruption_threads(severity: Severity) -> usize {
    severity.thread_count().min(4)
}

fn activate_process_kill(spec: &FaultSpec, config: &RegistryConfig) -> Result<FaultResource> {
    if !config.allow_process_kill {
        return Err(HwStressError::ProcessKillDisabled);
    }
    terminate_process(&spec.target)?;
    Ok(FaultResource::Nothing)
}

#[cfg(unix)]
fn terminate_process(target: &str) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid: i32 = target
        .trim()
        .parse()
        .map_err(|_| HwStressError::spec(format!("process kill target '{}' is not a PID", target)))?;

    if pid <= 1 || pid as u32 == std::process::id() {
        return Err(HwStressError::spec(format!("refusing to signal PID {}", pid)));
    }

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|errno| HwStressError::io(format!("SIGTERM to PID {}", pid), std::io::Error::from(errno)))
}

#[cfg(not(unix))]
fn terminate_process(_target: &str) -> Result<()> {
    Err(HwStressError::Unsupported {
        operation: "process kill".to_string(),
        details: "no safe process signalling on this platform".to_string(),
    })
}

fn remove_files(paths: &[PathBuf]) -> Result<()> {
    let failures: Vec<String> = paths
        .iter()
        .filter_map(|path| remove_one(path).err())
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(HwStressError::Cleanup { failures })
    }
}

fn remove_one(path: &Path) -> std::result::Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("{}: {}", path.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn context<'a>(config: &'a RegistryConfig, live: &'a Arc<AtomicUsize>) -> ActivationContext<'a> {
        ActivationContext {
            id: Uuid::new_v4(),
            config,
            rng: fastrand::Rng::with_seed(7),
            live_threads: live,
        }
    }

    #[test]
    fn test_cpu_overload_threads_follow_severity() {
        let config = RegistryConfig::default();
        let live = Arc::new(AtomicUsize::new(0));
        let spec = FaultSpec::new(FaultKind::CpuOverload, "cpu0", Severity::Medium);

        let resource = activate(&spec, context(&config, &live)).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(resource.describe(), "2 thread(s)");

        resource.release().unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_memory_blocks_are_capped() {
        let config = RegistryConfig {
            max_retained_blocks: 4,
            ..Default::default()
        };
        let live = Arc::new(AtomicUsize::new(0));
        let spec = FaultSpec::new(FaultKind::MemoryCorruption, "heap", Severity::High);

        match activate(&spec, context(&config, &live)).unwrap() {
            FaultResource::Memory(blocks) => {
                assert_eq!(blocks.len(), 4);
                assert!(blocks.iter().all(|b| b.len() == BLOCK_BYTES));
                assert!(blocks[0].iter().any(|&byte| byte != 0));
            }
            other => panic!("expected memory blocks, got {:?}", other),
        }
    }

    #[test]
    fn test_disk_files_created_and_removed() {
        let scratch = tempfile::tempdir().unwrap();
        let config = RegistryConfig {
            scratch_dir: scratch.path().join("faults"),
            ..Default::default()
        };
        let live = Arc::new(AtomicUsize::new(0));
        let spec = FaultSpec::new(FaultKind::DiskIOError, "volume", Severity::Low);

        let resource = activate(&spec, context(&config, &live)).unwrap();
        let paths = match &resource {
            FaultResource::Files(files) => files.paths().to_vec(),
            other => panic!("expected files, got {:?}", other),
        };
        assert_eq!(paths.len(), 5);
        for path in &paths {
            assert_eq!(fs::metadata(path).unwrap().len(), DISK_FILE_BYTES as u64);
        }

        resource.release().unwrap();
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_dropped_resource_still_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let config = RegistryConfig {
            scratch_dir: scratch.path().to_path_buf(),
            ..Default::default()
        };
        let live = Arc::new(AtomicUsize::new(0));

        let disk = FaultSpec::new(FaultKind::DiskIOError, "volume", Severity::Low);
        let files = activate(&disk, context(&config, &live)).unwrap();
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 5);
        drop(files);
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);

        let cpu = FaultSpec::new(FaultKind::CpuOverload, "cpu0", Severity::Low);
        let threads = activate(&cpu, context(&config, &live)).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(threads);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unwritable_scratch_dir_fails_cleanly() {
        let scratch = tempfile::tempdir().unwrap();
        let blocker = scratch.path().join("not-a-dir");
        fs::write(&blocker, b"file in the way").unwrap();

        let config = RegistryConfig {
            scratch_dir: blocker.join("faults"),
            ..Default::default()
        };
        let live = Arc::new(AtomicUsize::new(0));
        let spec = FaultSpec::new(FaultKind::DiskIOError, "volume", Severity::Low);

        match activate(&spec, context(&config, &live)) {
            Err(HwStressError::Io { .. }) => {}
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_disruption_threads_stop_promptly() {
        let config = RegistryConfig::default();
        let live = Arc::new(AtomicUsize::new(0));
        let spec = FaultSpec::new(FaultKind::NetworkPacketLoss, "eth0", Severity::Low);

        let resource = activate(&spec, context(&config, &live)).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);

        let start = std::time::Instant::now();
        resource.release().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_process_kill_gated_off_by_default() {
        let config = RegistryConfig::default();
        let live = Arc::new(AtomicUsize::new(0));
        let spec = FaultSpec::new(FaultKind::ProcessKill, "12345", Severity::High);

        assert!(matches!(
            activate(&spec, context(&config, &live)),
            Err(HwStressError::ProcessKillDisabled)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_kill_refuses_bad_targets() {
        let config = RegistryConfig {
            allow_process_kill: true,
            ..Default::default()
        };
        let live = Arc::new(AtomicUsize::new(0));
        let own_pid = std::process::id().to_string();

        for target in ["not-a-pid", "1", own_pid.as_str()] {
            let spec = FaultSpec::new(FaultKind::ProcessKill, target, Severity::High);
            assert!(matches!(
                activate(&spec, context(&config, &live)),
                Err(HwStressError::InvalidSpec { .. })
            ));
        }
    }
}
