//! Typed session configuration
//!
//! Built by the CLI from command-line flags; tests build it directly against
//! temporary directories.

use std::path::PathBuf;

use crate::cpufreq::DEFAULT_SYSFS_CPU_ROOT;
use crate::domain::{CpuId, SessionError};
use crate::isolation::DEFAULT_CGROUP_ROOT;
use crate::monitor::{MonitorOptions, ProbeSet};

/// Fixed frequency for one CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyPin {
    pub cpu: CpuId,
    pub khz: u64,
}

/// One monitor and the file its rows go to
#[derive(Debug, Clone)]
pub struct MonitorSpec {
    pub probe_set: ProbeSet,
    pub output: PathBuf,
}

/// Core and package energy measured around the workload
#[derive(Debug, Clone)]
pub struct EnergyCapture {
    pub cpu: CpuId,
    /// Appended as one row per session when set
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub group_name: String,
    pub cgroup_root: PathBuf,
    pub cpuset: String,
    pub memory_max: String,
    pub workload: PathBuf,
    pub workload_args: Vec<String>,
    pub frequencies: Vec<FrequencyPin>,
    pub sysfs_cpu_root: PathBuf,
    pub monitors: Vec<MonitorSpec>,
    pub monitor_options: MonitorOptions,
    /// New `cpuset.cpus` written right after launch to force a migration
    pub reassign_cpuset: Option<String>,
    pub energy: Option<EnergyCapture>,
}

impl SessionConfig {
    /// Configuration with default roots and no monitors
    #[must_use]
    pub fn new(group_name: impl Into<String>, workload: impl Into<PathBuf>) -> Self {
        Self {
            group_name: group_name.into(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            cpuset: "0".to_string(),
            memory_max: "512M".to_string(),
            workload: workload.into(),
            workload_args: Vec::new(),
            frequencies: Vec::new(),
            sysfs_cpu_root: PathBuf::from(DEFAULT_SYSFS_CPU_ROOT),
            monitors: Vec::new(),
            monitor_options: MonitorOptions::default(),
            reassign_cpuset: None,
            energy: None,
        }
    }

    /// Reject configurations that cannot describe a session
    ///
    /// # Errors
    /// [`SessionError::InvalidConfig`] naming the offending field
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |msg: String| Err(SessionError::InvalidConfig(msg));

        if self.group_name.is_empty()
            || self.group_name.contains('/')
            || self.group_name == "."
            || self.group_name == ".."
        {
            return invalid(format!("group name {:?} is not a single path component", self.group_name));
        }
        if self.cpuset.trim().is_empty() {
            return invalid("cpuset must not be empty".to_string());
        }
        if self.memory_max.trim().is_empty() {
            return invalid("memory limit must not be empty".to_string());
        }
        if self.workload.as_os_str().is_empty() {
            return invalid("workload path must not be empty".to_string());
        }
        if let Some(cpuset) = &self.reassign_cpuset {
            if cpuset.trim().is_empty() {
                return invalid("reassignment cpuset must not be empty".to_string());
            }
        }
        for (i, spec) in self.monitors.iter().enumerate() {
            if self.monitors[..i].iter().any(|other| other.output == spec.output) {
                return invalid(format!("{} shares output {}", spec.probe_set, spec.output.display()));
            }
            if let ProbeSet::Function { symbol, .. } = &spec.probe_set {
                if symbol.is_empty() {
                    return invalid("function monitor needs a symbol".to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new("bench-A", "/bin/true")
    }

    #[test]
    fn test_defaults_are_valid() {
        config().validate().unwrap();
    }

    #[test]
    fn test_group_name_must_be_one_component() {
        for name in ["", "a/b", "..", "."] {
            let mut config = config();
            config.group_name = name.to_string();
            assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))), "{name:?}");
        }
    }

    #[test]
    fn test_monitors_need_distinct_outputs() {
        let mut config = config();
        config.monitors = vec![
            MonitorSpec { probe_set: ProbeSet::Migration, output: "out.csv".into() },
            MonitorSpec { probe_set: ProbeSet::Llc, output: "out.csv".into() },
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("llc shares output out.csv"));
    }

    #[test]
    fn test_function_monitor_needs_symbol() {
        let mut config = config();
        config.monitors = vec![MonitorSpec {
            probe_set: ProbeSet::Function { binary: "/bin/true".into(), symbol: String::new() },
            output: "function.csv".into(),
        }];
        assert!(config.validate().is_err());
    }
}
