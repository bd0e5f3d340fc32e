// hwstress-core/src/stress/payload.rs
// Units of stress work executed by pool workers

use std::fs::{self, File, OpenOptions};
use std::hint::black_box;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::config::WorkloadConfig;
use crate::error::{HwStressError, Result};
use crate::model::WorkloadKind;

/// Fixed-iteration trigonometric work. Shared with the CPU overload fault.
pub fn trig_work(iterations: usize) -> f64 {
    let mut acc = 0.0f64;
    for i in 0..iterations {
        let x = i as f64 * 0.001;
        acc += x.sin() * x.cos() + (x + 1.0).sqrt();
    }
    black_box(acc)
}

/// One repeatable unit of stress work.
pub trait WorkloadPayload: Send {
    /// Run one unit. Returns false when the unit's self-check failed.
    fn execute(&mut self) -> bool;

    fn label(&self) -> &'static str;
}

pub struct CpuPayload {
    iterations: usize,
}

impl CpuPayload {
    pub fn new(iterations: usize) -> Self {
        Self { iterations: iterations.max(1) }
    }
}

impl WorkloadPayload for CpuPayload {
    fn execute(&mut self) -> bool {
        trig_work(self.iterations).is_finite()
    }

    fn label(&self) -> &'static str {
        "cpu"
    }
}

/// Allocates a block, fills it with a seeded pattern, reads it back and drops it
pub struct MemoryPayload {
    block_size: usize,
    rng: fastrand::Rng,
}

impl MemoryPayload {
    pub fn new(block_size: usize, rng: fastrand::Rng) -> Self {
        Self {
            block_size: block_size.max(1),
            rng,
        }
    }

    #[inline]
    fn pattern(seed: u8, index: usize) -> u8 {
        (index as u8).wrapping_mul(31).wrapping_add(seed)
    }
}

impl WorkloadPayload for MemoryPayload {
    fn execute(&mut self) -> bool {
        let seed = self.rng.u8(..);
        let mut block = vec![0u8; self.block_size];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = Self::pattern(seed, i);
        }
        let block = black_box(block);
        block
            .iter()
            .enumerate()
            .all(|(i, byte)| *byte == Self::pattern(seed, i))
    }

    fn label(&self) -> &'static str {
        "memory"
    }
}

/// Writes a random block to its own file and reads it back
pub struct DiskPayload {
    path: PathBuf,
    block: Vec<u8>,
    rng: fastrand::Rng,
}

impl DiskPayload {
    pub fn new(dir: &Path, worker: usize, block_size: usize, rng: fastrand::Rng) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| HwStressError::io(format!("create {}", dir.display()), e))?;
        // Unique per payload: concurrent runs may share `dir`
        let path = dir.join(format!("hwstress-{}-{}.dat", Uuid::new_v4().simple(), worker));
        Ok(Self {
            path,
            block: vec![0u8; block_size.max(1)],
            rng,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fill the block with fresh bytes and persist it
    pub fn write_block(&mut self) -> Result<()> {
        self.rng.fill(&mut self.block);
        let mut file = File::create(&self.path)
            .map_err(|e| HwStressError::io(format!("create {}", self.path.display()), e))?;
        file.write_all(&self.block)
            .and_then(|_| file.sync_data())
            .map_err(|e| HwStressError::io(format!("write {}", self.path.display()), e))
    }

    /// Compare the file against the last written block
    pub fn verify_block(&self) -> bool {
        let mut contents = Vec::with_capacity(self.block.len());
        let read = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .and_then(|mut file| file.read_to_end(&mut contents));
        match read {
            Ok(_) => contents == self.block,
            Err(e) => {
                debug!("Read-back of {} failed: {}", self.path.display(), e);
                false
            }
        }
    }
}

impl WorkloadPayload for DiskPayload {
    fn execute(&mut self) -> bool {
        match self.write_block() {
            Ok(()) => self.verify_block(),
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    fn label(&self) -> &'static str {
        "disk"
    }
}

impl Drop for DiskPayload {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Dense square matrix multiply standing in for GPU load
pub struct MatrixPayload {
    n: usize,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
}

impl MatrixPayload {
    pub fn new(n: usize, rng: &mut fastrand::Rng) -> Self {
        let n = n.max(1);
        let a = (0..n * n).map(|_| rng.f64()).collect();
        let b = (0..n * n).map(|_| rng.f64()).collect();
        Self {
            n,
            a,
            b,
            c: vec![0.0; n * n],
        }
    }
}

impl WorkloadPayload for MatrixPayload {
    fn execute(&mut self) -> bool {
        let n = self.n;
        self.c.iter_mut().for_each(|v| *v = 0.0);
        for i in 0..n {
            for k in 0..n {
                let aik = self.a[i * n + k];
                let row = &self.b[k * n..(k + 1) * n];
                for (j, bkj) in row.iter().enumerate() {
                    self.c[i * n + j] += aik * bkj;
                }
            }
        }
        black_box(&self.c).iter().all(|v| v.is_finite())
    }

    fn label(&self) -> &'static str {
        "gpu-simulated"
    }
}

/// Payload for worker `index` of a run
pub fn build_payload(
    config: &WorkloadConfig,
    index: usize,
    mut rng: fastrand::Rng,
) -> Result<Box<dyn WorkloadPayload>> {
    let payload: Box<dyn WorkloadPayload> = match config.kind {
        WorkloadKind::Cpu => Box::new(CpuPayload::new(config.cpu_iterations())),
        WorkloadKind::Memory => Box::new(MemoryPayload::new(config.memory_block_bytes(), rng)),
        WorkloadKind::Disk => Box::new(DiskPayload::new(
            &config.disk_path,
            index,
            config.disk_block_bytes(),
            rng,
        )?),
        WorkloadKind::GpuSimulated => Box::new(MatrixPayload::new(config.matrix_size(), &mut rng)),
        WorkloadKind::Combined if index % 2 == 0 => Box::new(CpuPayload::new(config.cpu_iterations())),
        WorkloadKind::Combined => Box::new(MemoryPayload::new(config.memory_block_bytes(), rng)),
    };
    Ok(payload)
}
