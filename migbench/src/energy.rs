//! Energy counters
//!
//! Two sources:
//! - the per-core energy status register (`MSR 0x611`) via `/dev/cpu/N/msr`
//! - the package RAPL accumulator (`energy_uj`) via powercap sysfs
//!
//! Both are free-running counters; only before/after differences carry
//! meaning. Differences are plain unsigned subtraction, so a counter that
//! wraps inside a window produces a meaningless (huge) delta.

use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::domain::{CpuId, EnergyError};

/// Energy status register offset in the MSR device
pub const MSR_ENERGY_STATUS: u64 = 0x611;

/// Default MSR device directory (`/dev/cpu/<cpu>/msr`)
pub const DEFAULT_MSR_ROOT: &str = "/dev/cpu";

/// Default package accumulator
pub const DEFAULT_RAPL_PATH: &str = "/sys/class/powercap/intel-rapl:0/energy_uj";

/// Anything that can produce one monotonic energy reading
///
/// Implementations are called from blocking threads.
pub trait EnergySource: Send + Sync {
    /// # Errors
    /// Returns [`EnergyError::Device`] if the counter cannot be read
    fn read_energy(&self) -> Result<u64, EnergyError>;
}

/// Reads core and package energy counters
#[derive(Debug, Clone)]
pub struct EnergySampler {
    msr_root: PathBuf,
    rapl_path: PathBuf,
}

impl Default for EnergySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergySampler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_paths(DEFAULT_MSR_ROOT, DEFAULT_RAPL_PATH)
    }

    #[must_use]
    pub fn with_paths(msr_root: impl Into<PathBuf>, rapl_path: impl Into<PathBuf>) -> Self {
        Self { msr_root: msr_root.into(), rapl_path: rapl_path.into() }
    }

    /// Raw energy status register of `cpu` (units are model specific)
    ///
    /// # Errors
    /// Returns [`EnergyError::Device`] if the device is absent, unreadable, or
    /// shorter than the register offset
    pub fn read_core_energy(&self, cpu: CpuId) -> Result<u64, EnergyError> {
        let path = self.msr_root.join(cpu.0.to_string()).join("msr");
        let device = |source| EnergyError::Device { path: path.clone(), source };

        let file = File::open(&path).map_err(device)?;
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, MSR_ENERGY_STATUS).map_err(device)?;

        let value = u64::from_le_bytes(buf);
        debug!("Core energy {cpu}: {value}");
        Ok(value)
    }

    /// Package accumulator in microjoules
    ///
    /// # Errors
    /// Returns [`EnergyError::Device`] if the file is absent or does not hold an integer
    pub fn read_package_energy_uj(&self) -> Result<u64, EnergyError> {
        read_uj(&self.rapl_path)
    }

    /// An [`EnergySource`] view over the package accumulator
    #[must_use]
    pub fn package(&self) -> PackageEnergy {
        PackageEnergy { path: self.rapl_path.clone() }
    }
}

fn read_uj(path: &Path) -> Result<u64, EnergyError> {
    let content = fs::read_to_string(path)
        .map_err(|source| EnergyError::Device { path: path.to_path_buf(), source })?;

    content.trim().parse().map_err(|e| EnergyError::Device {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

/// Package RAPL accumulator as an [`EnergySource`]
#[derive(Debug, Clone)]
pub struct PackageEnergy {
    path: PathBuf,
}

impl EnergySource for PackageEnergy {
    fn read_energy(&self) -> Result<u64, EnergyError> {
        read_uj(&self.path)
    }
}

/// Energy consumed over one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyDelta {
    pub cpu: CpuId,
    /// Core register delta, raw units
    pub core: u64,
    pub package_uj: u64,
}

/// Open before/after pair of core and package readings
#[derive(Debug)]
pub struct EnergyWindow {
    cpu: CpuId,
    core_before: u64,
    package_before: u64,
}

impl EnergyWindow {
    /// Take the "before" readings
    ///
    /// # Errors
    /// Returns [`EnergyError::Device`] if either counter is unreadable
    pub fn open(sampler: &EnergySampler, cpu: CpuId) -> Result<Self, EnergyError> {
        Ok(Self {
            cpu,
            core_before: sampler.read_core_energy(cpu)?,
            package_before: sampler.read_package_energy_uj()?,
        })
    }

    /// Take the "after" readings and return the differences
    ///
    /// # Errors
    /// Returns [`EnergyError::Device`] if either counter is unreadable
    pub fn close(self, sampler: &EnergySampler) -> Result<EnergyDelta, EnergyError> {
        let core_after = sampler.read_core_energy(self.cpu)?;
        let package_after = sampler.read_package_energy_uj()?;

        Ok(EnergyDelta {
            cpu: self.cpu,
            core: core_after.wrapping_sub(self.core_before),
            package_uj: package_after.wrapping_sub(self.package_before),
        })
    }
}
