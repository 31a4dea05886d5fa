//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::isolation::DEFAULT_CGROUP_ROOT;
use crate::monitor::{DEFAULT_ARTIFACT_DIR, DEFAULT_PIN_DIR};

#[derive(Parser, Debug)]
#[command(
    name = "migbench",
    version,
    about = "Measure the cost of moving a sandboxed workload across CPUs and cgroups",
    after_help = "\
EXAMPLES:
    sudo migbench migration --cpuset 0 --new-cpuset 1 ./bench.py
    sudo migbench proc --cpuset 2 --cpu-freq 1800000 ./bench.py
    sudo migbench function --function-name handler ./bench
    sudo migbench hardware ./bench.py            Ctrl-C to stop sampling"
)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Scheduler migration latency and LLC counters while the workload is moved between CPUs
    Migration(MigrationArgs),
    /// Process lifetime with hardware counters and core energy
    Proc(ProcArgs),
    /// Duration of one call to a function in the workload
    Function(FunctionArgs),
    /// Hardware counters sampled together with package energy
    Hardware(HardwareArgs),
    /// Last-level cache counters per process and CPU
    Llc(LlcArgs),
}

impl Mode {
    #[must_use]
    pub fn common(&self) -> &CommonArgs {
        match self {
            Self::Migration(args) => &args.common,
            Self::Proc(args) => &args.common,
            Self::Function(args) => &args.common,
            Self::Hardware(args) => &args.common,
            Self::Llc(args) => &args.common,
        }
    }
}

/// Flags shared by every mode
#[derive(ClapArgs, Debug, Clone)]
pub struct CommonArgs {
    /// Executable to inject into the cgroup
    #[arg(value_name = "WORKLOAD")]
    pub workload: PathBuf,

    /// Arguments passed to the workload
    #[arg(last = true, value_name = "ARGS")]
    pub workload_args: Vec<String>,

    /// Name of the cgroup to create for the run
    #[arg(long, default_value = "benchmark-cgroup")]
    pub cgroup_name: String,

    /// CPU list the cgroup starts on (e.g. "0-3")
    #[arg(long, visible_alias = "curr-cpuset", default_value = "0")]
    pub cpuset: String,

    /// Memory limit for the cgroup (e.g. "512M")
    #[arg(long, default_value = "512M")]
    pub memory: String,

    /// Pin the CPUs of --cpuset to this frequency in kHz
    #[arg(long, visible_alias = "curr-cpu-freq", value_name = "KHZ")]
    pub cpu_freq: Option<u64>,

    /// Directory holding the pre-built *.bpf.o artifacts
    #[arg(long, default_value = DEFAULT_ARTIFACT_DIR)]
    pub artifact_dir: PathBuf,

    /// cgroup v2 mount point
    #[arg(long, default_value = DEFAULT_CGROUP_ROOT)]
    pub cgroup_root: PathBuf,

    /// bpffs directory for maps shared between artifacts
    #[arg(long, default_value = DEFAULT_PIN_DIR)]
    pub pin_dir: PathBuf,

    /// Append core and package energy of the run to this CSV
    #[arg(long, value_name = "FILE")]
    pub energy_output: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct MigrationArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// CPU list the cgroup is moved to right after launch
    #[arg(long)]
    pub new_cpuset: String,

    /// Pin the CPUs of --new-cpuset to this frequency in kHz
    #[arg(long, value_name = "KHZ")]
    pub new_cpu_freq: Option<u64>,

    #[arg(long, default_value = "benchmark-latency.csv")]
    pub latency_output: PathBuf,

    #[arg(long, default_value = "benchmark-llc.csv")]
    pub llc_output: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct ProcArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = "benchmark-proc.csv")]
    pub proc_output: PathBuf,

    #[arg(long, default_value = "benchmark-hw.csv")]
    pub hardware_output: PathBuf,

    /// Hardware sampling period in milliseconds
    #[arg(long, default_value = "10")]
    pub sample_interval_ms: u64,
}

#[derive(ClapArgs, Debug)]
pub struct FunctionArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Symbol to time with an entry/return probe pair
    #[arg(long)]
    pub function_name: String,

    /// Binary containing the symbol (defaults to the workload)
    #[arg(long)]
    pub binary: Option<PathBuf>,

    #[arg(long, default_value = "benchmark-function.csv")]
    pub output: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct HardwareArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = "hw.csv")]
    pub output: PathBuf,

    /// Sampling period in milliseconds
    #[arg(long, default_value = "10")]
    pub sample_interval_ms: u64,
}

#[derive(ClapArgs, Debug)]
pub struct LlcArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = "benchmark-llc.csv")]
    pub output: PathBuf,
}
