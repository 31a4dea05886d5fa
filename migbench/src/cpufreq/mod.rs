//! CPU frequency and governor control
//!
//! Thin layer over `/sys/devices/system/cpu/cpuN/cpufreq`. Nothing is cached
//! except the CPU count: every [`FrequencyController::info`] call re-reads
//! sysfs, since governors and set-points can be changed by anyone.
//!
//! ## Bound checks
//!
//! [`FrequencyController::set_min_frequency`] and
//! [`FrequencyController::set_max_frequency`] reject values outside
//! `[cpuinfo_min_freq, cpuinfo_max_freq]`.
//! [`FrequencyController::set_fixed_frequency`] does NOT validate; the value
//! goes to `scaling_setspeed` as given and the driver decides what to do
//! with it.

mod governor;
pub mod topology;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::domain::{CpuId, FrequencyError};

pub use governor::Governor;
pub use topology::{online_cpus, parse_cpu_list};

/// sysfs CPU directory
pub const DEFAULT_SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Frequency snapshot of one CPU. All frequencies are in kHz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuInfo {
    pub cpu: CpuId,
    pub current_khz: u64,
    /// Hardware lower bound (`cpuinfo_min_freq`)
    pub min_khz: u64,
    /// Hardware upper bound (`cpuinfo_max_freq`)
    pub max_khz: u64,
    pub scaling_min_khz: u64,
    pub scaling_max_khz: u64,
    pub governor: Governor,
    pub available_governors: Vec<String>,
    pub driver: String,
}

/// Reads and writes per-CPU cpufreq state
#[derive(Debug, Clone)]
pub struct FrequencyController {
    root: PathBuf,
    cpu_count: usize,
}

impl FrequencyController {
    /// Enumerate CPUs under `/sys/devices/system/cpu`
    ///
    /// # Errors
    /// Returns [`FrequencyError::Filesystem`] if the directory cannot be listed
    pub fn discover() -> Result<Self, FrequencyError> {
        Self::discover_in(DEFAULT_SYSFS_CPU_ROOT)
    }

    /// Enumerate `cpuN` directories under `root`
    ///
    /// # Errors
    /// Returns [`FrequencyError::Filesystem`] if `root` cannot be listed
    pub fn discover_in(root: impl AsRef<Path>) -> Result<Self, FrequencyError> {
        let root = root.as_ref().to_path_buf();
        let entries = fs::read_dir(&root)
            .map_err(|source| FrequencyError::Filesystem { path: root.clone(), source })?;

        let cpu_count = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("cpu"))
                    .is_some_and(|index| !index.is_empty() && index.parse::<u32>().is_ok())
            })
            .count();

        debug!("Discovered {cpu_count} CPUs under {}", root.display());
        Ok(Self { root, cpu_count })
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    /// Fresh snapshot of `cpu`
    ///
    /// # Errors
    /// - [`FrequencyError::InvalidCpu`] for an index outside the discovered range
    /// - [`FrequencyError::NotSupported`] when the CPU has no cpufreq directory
    /// - [`FrequencyError::Filesystem`] / [`FrequencyError::Parse`] on unreadable attributes
    pub fn info(&self, cpu: CpuId) -> Result<CpuInfo, FrequencyError> {
        let dir = self.cpufreq_dir(cpu)?;

        Ok(CpuInfo {
            cpu,
            current_khz: read_khz(&dir.join("scaling_cur_freq"))?,
            min_khz: read_khz(&dir.join("cpuinfo_min_freq"))?,
            max_khz: read_khz(&dir.join("cpuinfo_max_freq"))?,
            scaling_min_khz: read_khz(&dir.join("scaling_min_freq"))?,
            scaling_max_khz: read_khz(&dir.join("scaling_max_freq"))?,
            governor: parse_governor(&read_attr(&dir.join("scaling_governor"))?),
            available_governors: read_attr(&dir.join("scaling_available_governors"))?
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            driver: read_attr(&dir.join("scaling_driver"))?,
        })
    }

    /// Active governor of `cpu`
    ///
    /// # Errors
    /// Same as [`FrequencyController::info`]
    pub fn governor(&self, cpu: CpuId) -> Result<Governor, FrequencyError> {
        let dir = self.cpufreq_dir(cpu)?;
        Ok(parse_governor(&read_attr(&dir.join("scaling_governor"))?))
    }

    /// Switch `cpu` to `governor`
    ///
    /// # Errors
    /// Returns [`FrequencyError::UnsupportedGovernor`] if the governor is not
    /// listed in `scaling_available_governors`; nothing is written in that case
    pub fn set_governor(&self, cpu: CpuId, governor: &Governor) -> Result<(), FrequencyError> {
        let dir = self.cpufreq_dir(cpu)?;
        let available: Vec<String> = read_attr(&dir.join("scaling_available_governors"))?
            .split_whitespace()
            .map(str::to_string)
            .collect();

        if !available.iter().any(|g| g == governor.as_str()) {
            return Err(FrequencyError::UnsupportedGovernor {
                cpu,
                governor: governor.to_string(),
                available,
            });
        }

        write_attr(&dir.join("scaling_governor"), governor.as_str())?;
        info!("Set governor {governor} on {cpu}");
        Ok(())
    }

    /// Raise or lower the scaling floor of `cpu`
    ///
    /// # Errors
    /// Returns [`FrequencyError::OutOfRange`] outside the hardware bounds
    pub fn set_min_frequency(&self, cpu: CpuId, freq_khz: u64) -> Result<(), FrequencyError> {
        self.set_bounded(cpu, freq_khz, "scaling_min_freq")
    }

    /// Raise or lower the scaling ceiling of `cpu`
    ///
    /// # Errors
    /// Returns [`FrequencyError::OutOfRange`] outside the hardware bounds
    pub fn set_max_frequency(&self, cpu: CpuId, freq_khz: u64) -> Result<(), FrequencyError> {
        self.set_bounded(cpu, freq_khz, "scaling_max_freq")
    }

    fn set_bounded(&self, cpu: CpuId, freq_khz: u64, attr: &str) -> Result<(), FrequencyError> {
        let info = self.info(cpu)?;
        if freq_khz < info.min_khz || freq_khz > info.max_khz {
            return Err(FrequencyError::OutOfRange {
                cpu,
                freq_khz,
                min: info.min_khz,
                max: info.max_khz,
            });
        }

        write_attr(&self.cpufreq_dir(cpu)?.join(attr), &freq_khz.to_string())?;
        info!("Set {attr}={freq_khz} kHz on {cpu}");
        Ok(())
    }

    /// Pin `cpu` to `freq_khz` through the `userspace` governor
    ///
    /// The governor switch happens first; if it fails its error is returned
    /// unchanged and the set-point is never written. The value itself is not
    /// checked against the hardware bounds.
    ///
    /// # Errors
    /// Any error from [`FrequencyController::set_governor`], or
    /// [`FrequencyError::Filesystem`] if the set-point write fails
    pub fn set_fixed_frequency(&self, cpu: CpuId, freq_khz: u64) -> Result<(), FrequencyError> {
        self.set_governor(cpu, &Governor::Userspace)?;
        write_attr(&self.cpufreq_dir(cpu)?.join("scaling_setspeed"), &freq_khz.to_string())?;
        info!("Pinned {cpu} to {freq_khz} kHz");
        Ok(())
    }

    fn cpufreq_dir(&self, cpu: CpuId) -> Result<PathBuf, FrequencyError> {
        if cpu.0 as usize >= self.cpu_count {
            return Err(FrequencyError::InvalidCpu { cpu, count: self.cpu_count });
        }

        let dir = self.root.join(format!("cpu{}", cpu.0)).join("cpufreq");
        if !dir.is_dir() {
            return Err(FrequencyError::NotSupported { cpu });
        }
        Ok(dir)
    }
}

fn parse_governor(name: &str) -> Governor {
    name.parse().unwrap_or_else(|never| match never {})
}

fn read_attr(path: &Path) -> Result<String, FrequencyError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| FrequencyError::Filesystem { path: path.to_path_buf(), source })
}

fn read_khz(path: &Path) -> Result<u64, FrequencyError> {
    let value = read_attr(path)?;
    value.parse().map_err(|_| FrequencyError::Parse { path: path.to_path_buf(), value })
}

fn write_attr(path: &Path, value: &str) -> Result<(), FrequencyError> {
    // O_WRONLY without O_CREAT: a missing attribute is an error, not a new file
    let result = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .and_then(|mut file| io::Write::write_all(&mut file, value.as_bytes()));

    result.map_err(|source| FrequencyError::Filesystem { path: path.to_path_buf(), source })
}
