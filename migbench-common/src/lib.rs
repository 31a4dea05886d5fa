//! # Shared Record Layouts (eBPF ↔ Userspace)
//!
//! Binary layouts of the records the pre-built kernel artifacts write into
//! their ring buffers and stats maps. All types use `#[repr(C)]` so the
//! userspace view matches the C structs compiled into the artifacts byte for
//! byte.
//!
//! ## Key Types
//!
//! - [`MigrationRecord`] - One completed task migration (`latency.bpf.o`)
//! - [`LlcRecord`] - Per (pid, cpu) last-level-cache counters (`llc.bpf.o`)
//! - [`HardwareCounters`] - Aggregate perf counters keyed by cgroup (`hardware.bpf.o`, `proc.bpf.o`)
//! - [`ProcRecord`] - Process lifetime with embedded counters (`proc.bpf.o`)
//! - [`FunctionRecord`] - One user-space function call duration (`function.bpf.o`)
//!
//! With the `user` feature enabled every record implements [`aya::Pod`] so it
//! can be read straight out of a BPF hash map.

#![no_std]

// ============================================================================
// Map Update Flags
// ============================================================================

/// `BPF_ANY`: create a new element or update an existing one
pub const BPF_ANY: u64 = 0;

/// `BPF_NOEXIST`: create a new element only if it did not exist
pub const BPF_NOEXIST: u64 = 1;

// ============================================================================
// Scheduler Migration
// ============================================================================

/// Completed migration measured between `sched_migrate_task` and the next
/// `sched_switch` that puts the task back on a CPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationRecord {
    /// `bpf_ktime_get_ns()` at `sched_migrate_task`
    pub timestamp_start: u64,
    /// `bpf_ktime_get_ns()` at the switch-in on the target CPU
    pub timestamp_end: u64,
    /// `timestamp_end - timestamp_start` in nanoseconds
    pub latency: u64,
    pub pid: u32,
    pub source_cpu: u32,
    pub target_cpu: u32,
    /// Low 32 bits of the cgroup kernfs id
    pub cgroup_id: u32,
}

// ============================================================================
// Last-Level Cache
// ============================================================================

/// LLC counters for one (pid, cpu) pair.
///
/// The artifact keys `llc_stats_map` by `(pid << 32) | cpu` and accumulates
/// into this value from six `PERF_TYPE_HW_CACHE` handlers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LlcRecord {
    pub pid: u32,
    pub cpu: u32,
    pub cgroup_id: u32,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,

    pub read_references: u64,
    pub read_misses: u64,
    pub read_hits: u64,

    pub write_references: u64,
    pub write_misses: u64,
    pub write_hits: u64,

    pub prefetch_references: u64,
    pub prefetch_misses: u64,
    pub prefetch_hits: u64,

    pub total_references: u64,
    pub total_misses: u64,
    pub total_hits: u64,
}

// ============================================================================
// Hardware Counters
// ============================================================================

/// Number of counters in [`HardwareCounters`]
pub const HARDWARE_COUNTER_COUNT: usize = 19;

/// Aggregate hardware counters for one cgroup.
///
/// Lives in the pinned `proc_stats_map` shared by the hardware and proc
/// artifacts. Each perf handler adds its `sample_period` to one field.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardwareCounters {
    pub cycles: u64,
    pub instructions: u64,
    pub ref_cycles: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
    pub branches: u64,
    pub branch_misses: u64,
    pub l1d_loads: u64,
    pub l1d_stores: u64,
    pub llc_loads: u64,
    pub llc_load_misses: u64,
    pub llc_stores: u64,
    pub llc_store_misses: u64,
    pub dtlb_loads: u64,
    pub dtlb_load_misses: u64,
    pub dtlb_stores: u64,
    pub dtlb_store_misses: u64,
    pub bpu_loads: u64,
    pub bpu_load_misses: u64,
}

impl HardwareCounters {
    /// Counters in column order
    #[must_use]
    pub const fn to_array(&self) -> [u64; HARDWARE_COUNTER_COUNT] {
        [
            self.cycles,
            self.instructions,
            self.ref_cycles,
            self.cache_references,
            self.cache_misses,
            self.branches,
            self.branch_misses,
            self.l1d_loads,
            self.l1d_stores,
            self.llc_loads,
            self.llc_load_misses,
            self.llc_stores,
            self.llc_store_misses,
            self.dtlb_loads,
            self.dtlb_load_misses,
            self.dtlb_stores,
            self.dtlb_store_misses,
            self.bpu_loads,
            self.bpu_load_misses,
        ]
    }

    /// Inverse of [`HardwareCounters::to_array`]
    #[must_use]
    pub const fn from_array(values: [u64; HARDWARE_COUNTER_COUNT]) -> Self {
        let [
            cycles,
            instructions,
            ref_cycles,
            cache_references,
            cache_misses,
            branches,
            branch_misses,
            l1d_loads,
            l1d_stores,
            llc_loads,
            llc_load_misses,
            llc_stores,
            llc_store_misses,
            dtlb_loads,
            dtlb_load_misses,
            dtlb_stores,
            dtlb_store_misses,
            bpu_loads,
            bpu_load_misses,
        ] = values;
        Self {
            cycles,
            instructions,
            ref_cycles,
            cache_references,
            cache_misses,
            branches,
            branch_misses,
            l1d_loads,
            l1d_stores,
            llc_loads,
            llc_load_misses,
            llc_stores,
            llc_store_misses,
            dtlb_loads,
            dtlb_load_misses,
            dtlb_stores,
            dtlb_store_misses,
            bpu_loads,
            bpu_load_misses,
        }
    }

    /// Field-wise unsigned difference `self - earlier`.
    ///
    /// Counters are monotonic while the map entry lives; a wrapped value is
    /// reported as the plain modular difference.
    #[must_use]
    pub const fn delta_since(&self, earlier: &Self) -> Self {
        Self {
            cycles: self.cycles.wrapping_sub(earlier.cycles),
            instructions: self.instructions.wrapping_sub(earlier.instructions),
            ref_cycles: self.ref_cycles.wrapping_sub(earlier.ref_cycles),
            cache_references: self.cache_references.wrapping_sub(earlier.cache_references),
            cache_misses: self.cache_misses.wrapping_sub(earlier.cache_misses),
            branches: self.branches.wrapping_sub(earlier.branches),
            branch_misses: self.branch_misses.wrapping_sub(earlier.branch_misses),
            l1d_loads: self.l1d_loads.wrapping_sub(earlier.l1d_loads),
            l1d_stores: self.l1d_stores.wrapping_sub(earlier.l1d_stores),
            llc_loads: self.llc_loads.wrapping_sub(earlier.llc_loads),
            llc_load_misses: self.llc_load_misses.wrapping_sub(earlier.llc_load_misses),
            llc_stores: self.llc_stores.wrapping_sub(earlier.llc_stores),
            llc_store_misses: self.llc_store_misses.wrapping_sub(earlier.llc_store_misses),
            dtlb_loads: self.dtlb_loads.wrapping_sub(earlier.dtlb_loads),
            dtlb_load_misses: self.dtlb_load_misses.wrapping_sub(earlier.dtlb_load_misses),
            dtlb_stores: self.dtlb_stores.wrapping_sub(earlier.dtlb_stores),
            dtlb_store_misses: self.dtlb_store_misses.wrapping_sub(earlier.dtlb_store_misses),
            bpu_loads: self.bpu_loads.wrapping_sub(earlier.bpu_loads),
            bpu_load_misses: self.bpu_load_misses.wrapping_sub(earlier.bpu_load_misses),
        }
    }
}

// ============================================================================
// Process Lifecycle
// ============================================================================

/// Fixed prefix of every proc record.
///
/// Older builds of `proc.bpf.o` submit only this header; current builds
/// append the cgroup's [`HardwareCounters`] (see [`ProcRecord`]).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcRecordHeader {
    pub pid: u32,
    pub cgroup_id: u32,
    /// `sys_enter_execve` timestamp
    pub start_timestamp: u64,
    /// `do_exit` timestamp
    pub end_timestamp: u64,
    pub latency: u64,
}

/// Process lifetime from `execve` to `do_exit`, with the counters the cgroup
/// accumulated by the time it exited.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcRecord {
    pub header: ProcRecordHeader,
    pub hw_stats: HardwareCounters,
}

// ============================================================================
// Function Boundary
// ============================================================================

/// Duration of one call between the uprobe and the uretprobe.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FunctionRecord {
    pub pid: u32,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,
    pub duration_ns: u64,
}

// ============================================================================
// Userspace-only Trait Implementations
// ============================================================================

#[cfg(feature = "user")]
#[allow(unsafe_code)]
mod user {
    use super::{
        FunctionRecord, HardwareCounters, LlcRecord, MigrationRecord, ProcRecord,
        ProcRecordHeader,
    };

    // SAFETY: all records are #[repr(C)], Copy, contain only integers, and
    // every bit pattern is a valid value.
    unsafe impl aya::Pod for MigrationRecord {}
    unsafe impl aya::Pod for LlcRecord {}
    unsafe impl aya::Pod for HardwareCounters {}
    unsafe impl aya::Pod for ProcRecordHeader {}
    unsafe impl aya::Pod for ProcRecord {}
    unsafe impl aya::Pod for FunctionRecord {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_record_sizes_match_artifacts() {
        assert_eq!(size_of::<MigrationRecord>(), 40);
        assert_eq!(size_of::<LlcRecord>(), 112);
        assert_eq!(size_of::<HardwareCounters>(), HARDWARE_COUNTER_COUNT * 8);
        assert_eq!(size_of::<ProcRecordHeader>(), 32);
        assert_eq!(size_of::<ProcRecord>(), 32 + HARDWARE_COUNTER_COUNT * 8);
        assert_eq!(size_of::<FunctionRecord>(), 16);
    }

    #[test]
    fn test_llc_counters_start_after_explicit_padding() {
        assert_eq!(core::mem::offset_of!(LlcRecord, _pad), 12);
        assert_eq!(core::mem::offset_of!(LlcRecord, read_references), 16);
        assert_eq!(core::mem::offset_of!(LlcRecord, total_hits), 104);
    }

    #[test]
    fn test_delta_since_is_fieldwise() {
        let before = HardwareCounters { cycles: 100, bpu_load_misses: 7, ..Default::default() };
        let after = HardwareCounters { cycles: 250, bpu_load_misses: 9, ..Default::default() };
        let delta = after.delta_since(&before);
        assert_eq!(delta.cycles, 150);
        assert_eq!(delta.bpu_load_misses, 2);
        assert_eq!(delta.instructions, 0);
    }

    #[test]
    fn test_array_round_trip_preserves_order() {
        let mut values = [0u64; HARDWARE_COUNTER_COUNT];
        values[2] = 3;
        values[HARDWARE_COUNTER_COUNT - 1] = 19;
        let counters = HardwareCounters::from_array(values);
        assert_eq!(counters.ref_cycles, 3);
        assert_eq!(counters.bpu_load_misses, 19);
        assert_eq!(counters.to_array(), values);
    }
}
