//! # Probe Set Descriptors
//!
//! Static description of the five kernel artifacts: which programs to install
//! where, which map is the correlation allow-list, how it is written, and
//! what kind of stream carries the records back.
//!
//! ## Probe Sets
//!
//! | set | artifact | hooks | stream | allow-list |
//! |-----|----------|-------|--------|------------|
//! | migration | `latency.bpf.o` | raw tp `sched_migrate_task`, `sched_switch` | ring buffer `events` | `container_map`, exclusive |
//! | llc | `llc.bpf.o` | 6 `HW_CACHE` LL perf events per CPU | poll `llc_stats_map` | `llc_container_map`, exclusive |
//! | hardware | `hardware.bpf.o` | 19 perf events per CPU | counter map `proc_stats_map` | `proc_stats_map`, zeroed upsert |
//! | proc | `proc.bpf.o` | tp `syscalls/sys_enter_execve`, kprobe `do_exit` | ring buffer `events` | `process_container_map`, upsert |
//! | function | `function.bpf.o` | uprobe/uretprobe on `binary:symbol` | ring buffer `function_events` | none |

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aya::programs::perf_event::{
    perf_hw_cache_id, perf_hw_cache_op_id, perf_hw_cache_op_result_id, perf_hw_id,
};
use perf_hw_cache_id::{
    PERF_COUNT_HW_CACHE_BPU as BPU, PERF_COUNT_HW_CACHE_DTLB as DTLB,
    PERF_COUNT_HW_CACHE_L1D as L1D, PERF_COUNT_HW_CACHE_LL as LL,
};
use perf_hw_cache_op_id::{
    PERF_COUNT_HW_CACHE_OP_PREFETCH as PREFETCH, PERF_COUNT_HW_CACHE_OP_READ as READ,
    PERF_COUNT_HW_CACHE_OP_WRITE as WRITE,
};
use perf_hw_cache_op_result_id::{
    PERF_COUNT_HW_CACHE_RESULT_ACCESS as ACCESS, PERF_COUNT_HW_CACHE_RESULT_MISS as MISS,
};

/// Default location of the pre-built artifacts
pub const DEFAULT_ARTIFACT_DIR: &str = "/usr/lib/migbench/bpf";

/// Pin directory for maps shared between artifacts (`proc_stats_map`)
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/proc";

/// Default hardware sampler tick
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// LLC stats map poll period
pub const LLC_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The kernel instrumentation families
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSet {
    /// Scheduler migration latency
    Migration,
    /// Last-level cache hit/miss/reference counters per (pid, cpu)
    Llc,
    /// Aggregate hardware counters sampled jointly with package energy
    Hardware { sample_interval: Duration },
    /// Process lifetime from `execve` to exit
    Proc,
    /// Duration of one user-space function call
    Function { binary: PathBuf, symbol: String },
}

/// How a hook is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    RawTracePoint { tracepoint: &'static str },
    TracePoint { category: &'static str, name: &'static str },
    KProbe { function: &'static str },
    /// Entry (`ret = false`) or return probe on the probe set's binary and symbol
    UProbe { ret: bool },
    /// One perf event per online CPU
    PerfEvent(PerfCounter),
}

/// One program of an artifact and where it goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hook {
    pub program: &'static str,
    pub point: HookPoint,
}

/// `perf_event_attr.type` values used by the artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfKind {
    Hardware,
    HwCache,
}

/// Sampling mode for a perf event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Period(u64),
    Frequency(u64),
}

/// Perf event configuration for a [`HookPoint::PerfEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfCounter {
    pub kind: PerfKind,
    pub config: u64,
    pub sampling: Sampling,
}

/// How [`super::EventMonitor::register`] writes the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Insert `key -> true` with `BPF_NOEXIST`; a duplicate is an error
    Exclusive { map: &'static str },
    /// Insert `key -> true` with `BPF_ANY`
    Upsert { map: &'static str },
    /// Reset the counter block at `key` to zero with `BPF_ANY`
    ZeroedCounters { map: &'static str },
    /// No kernel-side allow-list; the key is only tracked host-side
    HostOnly,
}

/// Where records come back from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    RingBuf { map: &'static str },
    StatsPoll { map: &'static str, interval: Duration },
    CounterMap { map: &'static str },
}

impl StreamKind {
    /// Name of the map the reader is opened on
    #[must_use]
    pub fn map(&self) -> &'static str {
        match self {
            Self::RingBuf { map } | Self::StatsPoll { map, .. } | Self::CounterMap { map } => map,
        }
    }
}

// ============================================================================
// Perf configurations
// ============================================================================

const PERIOD: Sampling = Sampling::Period(1000);
const LLC_FREQUENCY: Sampling = Sampling::Frequency(100);

const fn hw(id: perf_hw_id) -> PerfCounter {
    PerfCounter { kind: PerfKind::Hardware, config: id as u64, sampling: PERIOD }
}

/// `id | op << 8 | result << 16`, as documented in `perf_event_open(2)`
const fn cache_config(
    id: perf_hw_cache_id,
    op: perf_hw_cache_op_id,
    result: perf_hw_cache_op_result_id,
) -> u64 {
    (id as u64) | ((op as u64) << 8) | ((result as u64) << 16)
}

const fn cache(
    id: perf_hw_cache_id,
    op: perf_hw_cache_op_id,
    result: perf_hw_cache_op_result_id,
    sampling: Sampling,
) -> PerfCounter {
    PerfCounter { kind: PerfKind::HwCache, config: cache_config(id, op, result), sampling }
}

const fn perf(program: &'static str, counter: PerfCounter) -> Hook {
    Hook { program, point: HookPoint::PerfEvent(counter) }
}

const MIGRATION_HOOKS: &[Hook] = &[
    Hook {
        program: "tracepoint_sched_migrate_task",
        point: HookPoint::RawTracePoint { tracepoint: "sched_migrate_task" },
    },
    Hook {
        program: "raw_tp_sched_switch",
        point: HookPoint::RawTracePoint { tracepoint: "sched_switch" },
    },
];

const LLC_HOOKS: &[Hook] = &[
    perf("llc_read_miss_handler", cache(LL, READ, MISS, LLC_FREQUENCY)),
    perf("llc_read_hit_handler", cache(LL, READ, ACCESS, LLC_FREQUENCY)),
    perf("llc_write_miss_handler", cache(LL, WRITE, MISS, LLC_FREQUENCY)),
    perf("llc_write_hit_handler", cache(LL, WRITE, ACCESS, LLC_FREQUENCY)),
    perf("llc_prefetch_miss_handler", cache(LL, PREFETCH, MISS, LLC_FREQUENCY)),
    perf("llc_prefetch_hit_handler", cache(LL, PREFETCH, ACCESS, LLC_FREQUENCY)),
];

/// In [`migbench_common::HardwareCounters`] field order
const HARDWARE_HOOKS: &[Hook] = &[
    perf("on_cpu_cycles", hw(perf_hw_id::PERF_COUNT_HW_CPU_CYCLES)),
    perf("on_instructions", hw(perf_hw_id::PERF_COUNT_HW_INSTRUCTIONS)),
    perf("on_ref_cycles", hw(perf_hw_id::PERF_COUNT_HW_REF_CPU_CYCLES)),
    perf("on_cache_references", hw(perf_hw_id::PERF_COUNT_HW_CACHE_REFERENCES)),
    perf("on_cache_misses", hw(perf_hw_id::PERF_COUNT_HW_CACHE_MISSES)),
    perf("on_branches", hw(perf_hw_id::PERF_COUNT_HW_BRANCH_INSTRUCTIONS)),
    perf("on_branch_misses", hw(perf_hw_id::PERF_COUNT_HW_BRANCH_MISSES)),
    perf("on_l1d_loads", cache(L1D, READ, ACCESS, PERIOD)),
    perf("on_l1d_stores", cache(L1D, WRITE, ACCESS, PERIOD)),
    perf("on_llc_loads", cache(LL, READ, ACCESS, PERIOD)),
    perf("on_llc_load_misses", cache(LL, READ, MISS, PERIOD)),
    perf("on_llc_stores", cache(LL, WRITE, ACCESS, PERIOD)),
    perf("on_llc_store_misses", cache(LL, WRITE, MISS, PERIOD)),
    perf("on_dtlb_loads", cache(DTLB, READ, ACCESS, PERIOD)),
    perf("on_dtlb_load_misses", cache(DTLB, READ, MISS, PERIOD)),
    perf("on_dtlb_stores", cache(DTLB, WRITE, ACCESS, PERIOD)),
    perf("on_dtlb_store_misses", cache(DTLB, WRITE, MISS, PERIOD)),
    perf("on_bpu_loads", cache(BPU, READ, ACCESS, PERIOD)),
    perf("on_bpu_load_misses", cache(BPU, READ, MISS, PERIOD)),
];

const PROC_HOOKS: &[Hook] = &[
    Hook {
        program: "trace_execve",
        point: HookPoint::TracePoint { category: "syscalls", name: "sys_enter_execve" },
    },
    Hook { program: "kprobe_do_exit", point: HookPoint::KProbe { function: "do_exit" } },
];

const FUNCTION_HOOKS: &[Hook] = &[
    Hook { program: "uprobe_entry", point: HookPoint::UProbe { ret: false } },
    Hook { program: "uprobe_exit", point: HookPoint::UProbe { ret: true } },
];

/// Counter map shared by the hardware and proc artifacts
pub const COUNTER_MAP: &str = "proc_stats_map";

impl ProbeSet {
    /// Short name used in logs, file names and errors
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Llc => "llc",
            Self::Hardware { .. } => "hardware",
            Self::Proc => "proc",
            Self::Function { .. } => "function",
        }
    }

    /// Artifact file name inside the artifact directory
    #[must_use]
    pub fn artifact(&self) -> &'static str {
        match self {
            Self::Migration => "latency.bpf.o",
            Self::Llc => "llc.bpf.o",
            Self::Hardware { .. } => "hardware.bpf.o",
            Self::Proc => "proc.bpf.o",
            Self::Function { .. } => "function.bpf.o",
        }
    }

    #[must_use]
    pub fn artifact_path(&self, artifact_dir: &Path) -> PathBuf {
        artifact_dir.join(self.artifact())
    }

    /// Programs to install, in install order
    #[must_use]
    pub fn hooks(&self) -> &'static [Hook] {
        match self {
            Self::Migration => MIGRATION_HOOKS,
            Self::Llc => LLC_HOOKS,
            Self::Hardware { .. } => HARDWARE_HOOKS,
            Self::Proc => PROC_HOOKS,
            Self::Function { .. } => FUNCTION_HOOKS,
        }
    }

    #[must_use]
    pub fn key_policy(&self) -> KeyPolicy {
        match self {
            Self::Migration => KeyPolicy::Exclusive { map: "container_map" },
            Self::Llc => KeyPolicy::Exclusive { map: "llc_container_map" },
            Self::Hardware { .. } => KeyPolicy::ZeroedCounters { map: COUNTER_MAP },
            Self::Proc => KeyPolicy::Upsert { map: "process_container_map" },
            Self::Function { .. } => KeyPolicy::HostOnly,
        }
    }

    #[must_use]
    pub fn stream(&self) -> StreamKind {
        match self {
            Self::Migration | Self::Proc => StreamKind::RingBuf { map: "events" },
            Self::Llc => StreamKind::StatsPoll { map: "llc_stats_map", interval: LLC_POLL_INTERVAL },
            Self::Hardware { .. } => StreamKind::CounterMap { map: COUNTER_MAP },
            Self::Function { .. } => StreamKind::RingBuf { map: "function_events" },
        }
    }

    /// Whether the artifact shares [`COUNTER_MAP`] through the pin directory
    #[must_use]
    pub fn uses_pinned_maps(&self) -> bool {
        matches!(self, Self::Hardware { .. } | Self::Proc)
    }

    /// Single-shot probe sets complete the session after one event
    #[must_use]
    pub fn is_single_shot(&self) -> bool {
        matches!(self, Self::Migration | Self::Proc | Self::Function { .. })
    }
}

impl fmt::Display for ProbeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all() -> Vec<ProbeSet> {
        vec![
            ProbeSet::Migration,
            ProbeSet::Llc,
            ProbeSet::Hardware { sample_interval: DEFAULT_SAMPLE_INTERVAL },
            ProbeSet::Proc,
            ProbeSet::Function { binary: PathBuf::from("/bin/true"), symbol: "main".into() },
        ]
    }

    #[test]
    fn test_program_names_are_unique_per_set() {
        for set in all() {
            let names: HashSet<_> = set.hooks().iter().map(|h| h.program).collect();
            assert_eq!(names.len(), set.hooks().len(), "{set}");
        }
    }

    #[test]
    fn test_hardware_hooks_cover_every_counter() {
        assert_eq!(HARDWARE_HOOKS.len(), migbench_common::HARDWARE_COUNTER_COUNT);
        assert!(HARDWARE_HOOKS.iter().all(|h| matches!(
            h.point,
            HookPoint::PerfEvent(PerfCounter { sampling: Sampling::Period(1000), .. })
        )));
    }

    #[test]
    fn test_cache_config_encoding() {
        // LL=2, WRITE=1, MISS=1
        assert_eq!(cache_config(LL, WRITE, MISS), 2 | (1 << 8) | (1 << 16));
        // DTLB=3, PREFETCH=2, ACCESS=0
        assert_eq!(cache_config(DTLB, PREFETCH, ACCESS), 3 | (2 << 8));
    }

    #[test]
    fn test_artifact_and_policy_table() {
        let dir = Path::new("/opt/bpf");
        assert_eq!(ProbeSet::Migration.artifact_path(dir), dir.join("latency.bpf.o"));
        assert_eq!(
            ProbeSet::Migration.key_policy(),
            KeyPolicy::Exclusive { map: "container_map" }
        );
        assert_eq!(ProbeSet::Proc.key_policy(), KeyPolicy::Upsert { map: "process_container_map" });
        assert!(ProbeSet::Proc.uses_pinned_maps());
        assert!(!ProbeSet::Llc.uses_pinned_maps());
        assert!(ProbeSet::Proc.is_single_shot());
        assert!(ProbeSet::Migration.is_single_shot());
        assert!(!ProbeSet::Llc.is_single_shot());
    }
}
