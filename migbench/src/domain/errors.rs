//! Structured error types for migbench
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Each component has its own enum; [`SessionError`] wraps them for the
//! orchestrator.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::types::CpuId;

#[derive(Error, Debug)]
pub enum GroupError {
    #[error("Filesystem operation on {path} failed: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot apply {control}={spec}: {source}")]
    Constraint {
        control: &'static str,
        spec: String,
        #[source]
        source: io::Error,
    },

    #[error("Resource group {path} still has {remaining} member(s) after {attempts} kill attempts")]
    ResourceBusy { path: PathBuf, remaining: usize, attempts: u32 },
}

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("Failed to open resource group directory {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Executable path contains an interior NUL byte: {0}")]
    InvalidPath(PathBuf),

    #[error("clone3 into resource group failed: {0}")]
    Clone(#[source] io::Error),

    #[error("Process injector is already closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum FrequencyError {
    #[error("Invalid {cpu} ({count} CPUs discovered)")]
    InvalidCpu { cpu: CpuId, count: usize },

    #[error("cpufreq not available for {cpu}")]
    NotSupported { cpu: CpuId },

    #[error("Governor {governor} not available for {cpu} (available: {})", .available.join(" "))]
    UnsupportedGovernor { cpu: CpuId, governor: String, available: Vec<String> },

    #[error("Frequency {freq_khz} kHz out of range [{min}, {max}] for {cpu}")]
    OutOfRange { cpu: CpuId, freq_khz: u64, min: u64, max: u64 },

    #[error("Failed to access {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unexpected value {value:?} in {path}")]
    Parse { path: PathBuf, value: String },
}

#[derive(Error, Debug)]
pub enum EnergyError {
    #[error("Energy device {path} unreadable: {source}")]
    Device {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to load kernel artifact {artifact}: {source}")]
    Load {
        artifact: PathBuf,
        #[source]
        source: aya::EbpfError,
    },

    #[error("Cannot prepare map pin directory {path}: {source}")]
    PinDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot enumerate CPUs for per-CPU hooks: {0}")]
    Topology(#[source] FrequencyError),

    #[error("Output sink {path} failed: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to attach {hook}: {source}")]
    Attach {
        hook: String,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("Program {0} not found in kernel artifact")]
    ProgramNotFound(&'static str),

    #[error("Map {0} not found in kernel artifact")]
    MapNotFound(&'static str),

    #[error("Map {map} access failed: {source}")]
    Map {
        map: &'static str,
        #[source]
        source: aya::maps::MapError,
    },

    #[error("Cannot register correlation key {key} in {map}: {source}")]
    Registration {
        key: u32,
        map: &'static str,
        #[source]
        source: aya::maps::MapError,
    },

    #[error("Malformed {probe} record: expected at least {expected} bytes, got {actual}")]
    Decode { probe: &'static str, expected: usize, actual: usize },

    #[error("Event stream closed")]
    StreamClosed,

    #[error("Energy read failed during sampling: {0}")]
    Energy(#[from] EnergyError),

    #[error("Failed to detach {hook}: {source}")]
    Detach {
        hook: String,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("Monitor is not attached")]
    NotAttached,

    #[error("Consumer task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session transition {from} -> {to}")]
    Transition { from: String, to: String },

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("{probe} consumer failed: {source}")]
    Consumer {
        probe: &'static str,
        #[source]
        source: MonitorError,
    },

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error(transparent)]
    Frequency(#[from] FrequencyError),

    #[error(transparent)]
    Energy(#[from] EnergyError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_governor_display() {
        let err = FrequencyError::UnsupportedGovernor {
            cpu: CpuId(2),
            governor: "userspace".to_string(),
            available: vec!["performance".to_string(), "powersave".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("userspace"));
        assert!(msg.contains("CPU:2"));
        assert!(msg.contains("performance powersave"));
    }

    #[test]
    fn test_decode_error_display() {
        let err = MonitorError::Decode { probe: "migration", expected: 40, actual: 12 };
        assert_eq!(
            err.to_string(),
            "Malformed migration record: expected at least 40 bytes, got 12"
        );
    }

    #[test]
    fn test_resource_busy_display() {
        let err = GroupError::ResourceBusy {
            path: PathBuf::from("/sys/fs/cgroup/bench-A"),
            remaining: 2,
            attempts: 3,
        };
        assert!(err.to_string().contains("/sys/fs/cgroup/bench-A"));
        assert!(err.to_string().contains("2 member(s)"));
    }
}
