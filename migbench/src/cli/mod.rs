//! Command-line interface
//!
//! [`Args`] is parsed by clap; [`session_config`] turns it into the
//! [`SessionConfig`] the orchestrator runs.

mod args;

use std::path::PathBuf;
use std::time::Duration;

pub use args::{
    Args, CommonArgs, FunctionArgs, HardwareArgs, LlcArgs, MigrationArgs, Mode, ProcArgs,
};

use crate::cpufreq::parse_cpu_list;
use crate::domain::{CpuId, SessionError};
use crate::energy::EnergySampler;
use crate::monitor::{MonitorOptions, ProbeSet};
use crate::session::{EnergyCapture, FrequencyPin, MonitorSpec, SessionConfig};

/// Energy file used by `proc` mode when `--energy-output` is not given
pub const DEFAULT_ENERGY_OUTPUT: &str = "benchmark-energy.csv";

fn cpus(list: &str, flag: &str) -> Result<Vec<CpuId>, SessionError> {
    match parse_cpu_list(list) {
        Some(cpus) if !cpus.is_empty() => Ok(cpus),
        _ => Err(SessionError::InvalidConfig(format!("{flag} {list:?} is not a CPU list"))),
    }
}

fn pins(cpus: &[CpuId], khz: Option<u64>) -> Vec<FrequencyPin> {
    khz.map(|khz| cpus.iter().map(|&cpu| FrequencyPin { cpu, khz }).collect()).unwrap_or_default()
}

fn sample_interval(ms: u64) -> Result<Duration, SessionError> {
    if ms == 0 {
        return Err(SessionError::InvalidConfig("sample interval must be positive".to_string()));
    }
    Ok(Duration::from_millis(ms))
}

/// Build the session for `args`
///
/// # Errors
/// [`SessionError::InvalidConfig`] for malformed CPU lists or intervals
pub fn session_config(args: &Args) -> Result<SessionConfig, SessionError> {
    let common = args.mode.common();
    let start_cpus = cpus(&common.cpuset, "--cpuset")?;

    let mut config = SessionConfig::new(&common.cgroup_name, &common.workload);
    config.cgroup_root.clone_from(&common.cgroup_root);
    config.cpuset.clone_from(&common.cpuset);
    config.memory_max.clone_from(&common.memory);
    config.workload_args.clone_from(&common.workload_args);
    config.frequencies = pins(&start_cpus, common.cpu_freq);
    config.monitor_options = MonitorOptions {
        artifact_dir: common.artifact_dir.clone(),
        pin_dir: common.pin_dir.clone(),
        energy: EnergySampler::new(),
    };

    let monitor = |probe_set: ProbeSet, output: &PathBuf| MonitorSpec { probe_set, output: output.clone() };
    let mut energy_output = common.energy_output.clone();

    match &args.mode {
        Mode::Migration(migration) => {
            let new_cpus = cpus(&migration.new_cpuset, "--new-cpuset")?;
            config.frequencies.extend(pins(&new_cpus, migration.new_cpu_freq));
            config.reassign_cpuset = Some(migration.new_cpuset.clone());
            config.monitors = vec![
                monitor(ProbeSet::Migration, &migration.latency_output),
                monitor(ProbeSet::Llc, &migration.llc_output),
            ];
        }
        Mode::Proc(proc) => {
            let sample_interval = sample_interval(proc.sample_interval_ms)?;
            config.monitors = vec![
                monitor(ProbeSet::Proc, &proc.proc_output),
                monitor(ProbeSet::Hardware { sample_interval }, &proc.hardware_output),
            ];
            energy_output.get_or_insert_with(|| PathBuf::from(DEFAULT_ENERGY_OUTPUT));
        }
        Mode::Function(function) => {
            let binary = function.binary.clone().unwrap_or_else(|| common.workload.clone());
            let probe_set = ProbeSet::Function { binary, symbol: function.function_name.clone() };
            config.monitors = vec![monitor(probe_set, &function.output)];
        }
        Mode::Hardware(hardware) => {
            let sample_interval = sample_interval(hardware.sample_interval_ms)?;
            config.monitors = vec![monitor(ProbeSet::Hardware { sample_interval }, &hardware.output)];
        }
        Mode::Llc(llc) => {
            config.monitors = vec![monitor(ProbeSet::Llc, &llc.output)];
        }
    }

    config.energy =
        energy_output.map(|output| EnergyCapture { cpu: start_cpus[0], output: Some(output) });

    config.validate()?;
    Ok(config)
}
