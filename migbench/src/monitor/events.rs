//! Decoded kernel events and their output rows
//!
//! Every record type has a fixed little-endian layout shared with the kernel
//! artifacts (see `migbench-common`). Decoding checks the length first and
//! then reads the `#[repr(C)]` struct unaligned, the same way ring buffer
//! items are parsed elsewhere in this crate.

use std::mem::size_of;
use std::time::Duration;

use migbench_common::{
    FunctionRecord, HardwareCounters, LlcRecord, MigrationRecord, ProcRecord, ProcRecordHeader,
    HARDWARE_COUNTER_COUNT,
};

use crate::domain::{CpuId, MonitorError, Pid};

/// One output row with a fixed schema
pub trait CsvRow {
    /// Column names, written once to an empty sink
    fn header() -> &'static [&'static str];

    /// Field values in header order
    fn record(&self) -> Vec<String>;
}

/// Rows that can be attributed to a resource group
pub trait Correlated {
    /// Low 32 bits of the owning group's identity, if the row carries one
    fn correlation_key(&self) -> Option<u32>;
}

/// A record decoded from a kernel stream
pub trait KernelEvent: CsvRow + Correlated + Sized + Send + 'static {
    /// Probe set name used in decode errors
    const PROBE: &'static str;

    /// # Errors
    /// Returns [`MonitorError::Decode`] if `bytes` is shorter than the layout
    fn decode(bytes: &[u8]) -> Result<Self, MonitorError>;
}

fn read_record<T: aya::Pod>(probe: &'static str, bytes: &[u8]) -> Result<T, MonitorError> {
    let expected = size_of::<T>();
    if bytes.len() < expected {
        return Err(MonitorError::Decode { probe, expected, actual: bytes.len() });
    }

    // SAFETY: length checked above; T is plain old data so any bit pattern is valid
    #[allow(unsafe_code)]
    let record = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Ok(record)
}

// ============================================================================
// Migration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationEvent {
    pub cgroup_id: u32,
    pub pid: Pid,
    pub latency_ns: u64,
    pub source_cpu: CpuId,
    pub target_cpu: CpuId,
}

impl CsvRow for MigrationEvent {
    fn header() -> &'static [&'static str] {
        &["cgroup_id", "latency", "pid", "source_cpu", "target_cpu"]
    }

    fn record(&self) -> Vec<String> {
        vec![
            self.cgroup_id.to_string(),
            self.latency_ns.to_string(),
            self.pid.0.to_string(),
            self.source_cpu.0.to_string(),
            self.target_cpu.0.to_string(),
        ]
    }
}

impl KernelEvent for MigrationEvent {
    const PROBE: &'static str = "migration";

    fn decode(bytes: &[u8]) -> Result<Self, MonitorError> {
        let raw: MigrationRecord = read_record(Self::PROBE, bytes)?;
        Ok(Self {
            cgroup_id: raw.cgroup_id,
            pid: Pid(raw.pid),
            latency_ns: raw.latency,
            source_cpu: CpuId(raw.source_cpu),
            target_cpu: CpuId(raw.target_cpu),
        })
    }
}

impl Correlated for MigrationEvent {
    fn correlation_key(&self) -> Option<u32> {
        Some(self.cgroup_id)
    }
}

// ============================================================================
// Last-Level Cache
// ============================================================================

/// Hit/miss/reference triple for one cache operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub references: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlcEvent {
    pub cgroup_id: u32,
    pub pid: Pid,
    pub cpu: CpuId,
    pub read: CacheStats,
    pub write: CacheStats,
    pub prefetch: CacheStats,
    pub total: CacheStats,
}

impl From<LlcRecord> for LlcEvent {
    fn from(raw: LlcRecord) -> Self {
        Self {
            cgroup_id: raw.cgroup_id,
            pid: Pid(raw.pid),
            cpu: CpuId(raw.cpu),
            read: CacheStats {
                hits: raw.read_hits,
                misses: raw.read_misses,
                references: raw.read_references,
            },
            write: CacheStats {
                hits: raw.write_hits,
                misses: raw.write_misses,
                references: raw.write_references,
            },
            prefetch: CacheStats {
                hits: raw.prefetch_hits,
                misses: raw.prefetch_misses,
                references: raw.prefetch_references,
            },
            total: CacheStats {
                hits: raw.total_hits,
                misses: raw.total_misses,
                references: raw.total_references,
            },
        }
    }
}

impl CsvRow for LlcEvent {
    fn header() -> &'static [&'static str] {
        &[
            "cgroup_id",
            "pid",
            "cpu",
            "read_hits",
            "read_misses",
            "read_references",
            "write_hits",
            "write_misses",
            "write_references",
            "prefetch_hits",
            "prefetch_misses",
            "prefetch_references",
            "total_hits",
            "total_misses",
            "total_references",
        ]
    }

    fn record(&self) -> Vec<String> {
        let mut row = vec![self.cgroup_id.to_string(), self.pid.0.to_string(), self.cpu.0.to_string()];
        for stats in [self.read, self.write, self.prefetch, self.total] {
            row.extend([stats.hits, stats.misses, stats.references].map(|v| v.to_string()));
        }
        row
    }
}

impl KernelEvent for LlcEvent {
    const PROBE: &'static str = "llc";

    fn decode(bytes: &[u8]) -> Result<Self, MonitorError> {
        read_record::<LlcRecord>(Self::PROBE, bytes).map(Self::from)
    }
}

impl Correlated for LlcEvent {
    fn correlation_key(&self) -> Option<u32> {
        Some(self.cgroup_id)
    }
}

// ============================================================================
// Hardware counters
// ============================================================================

/// Column names of [`HardwareCounters`], in field order
pub const HARDWARE_COLUMNS: [&str; HARDWARE_COUNTER_COUNT] = [
    "cycles",
    "instructions",
    "ref_cycles",
    "cache_references",
    "cache_misses",
    "branches",
    "branch_misses",
    "l1d_loads",
    "l1d_stores",
    "llc_loads",
    "llc_load_misses",
    "llc_stores",
    "llc_store_misses",
    "dtlb_loads",
    "dtlb_load_misses",
    "dtlb_stores",
    "dtlb_store_misses",
    "bpu_loads",
    "bpu_load_misses",
];

/// One tick of the synchronized sampler: counter and package energy deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareSample {
    pub counters: HardwareCounters,
    pub energy_uj: u64,
    /// Gap between the energy and counter capture instants (not written out)
    pub skew: Duration,
}

impl Correlated for HardwareSample {
    fn correlation_key(&self) -> Option<u32> {
        None
    }
}

impl CsvRow for HardwareSample {
    fn header() -> &'static [&'static str] {
        const COLUMNS: [&str; HARDWARE_COUNTER_COUNT + 1] = {
            let mut columns = [""; HARDWARE_COUNTER_COUNT + 1];
            let mut i = 0;
            while i < HARDWARE_COUNTER_COUNT {
                columns[i] = HARDWARE_COLUMNS[i];
                i += 1;
            }
            columns[HARDWARE_COUNTER_COUNT] = "energy_uj";
            columns
        };
        &COLUMNS
    }

    fn record(&self) -> Vec<String> {
        self.counters
            .to_array()
            .iter()
            .chain(std::iter::once(&self.energy_uj))
            .map(u64::to_string)
            .collect()
    }
}

// ============================================================================
// Process lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcEvent {
    pub cgroup_id: u32,
    pub pid: Pid,
    pub start_ts: u64,
    pub end_ts: u64,
    pub latency_ns: u64,
    /// Absent when the artifact submitted only the record header
    pub counters: Option<HardwareCounters>,
}

impl CsvRow for ProcEvent {
    fn header() -> &'static [&'static str] {
        const COLUMNS: [&str; 5 + HARDWARE_COUNTER_COUNT] = {
            let mut columns = [""; 5 + HARDWARE_COUNTER_COUNT];
            let prefix = ["cgroup_id", "pid", "start_timestamp", "end_timestamp", "latency"];
            let mut i = 0;
            while i < prefix.len() {
                columns[i] = prefix[i];
                i += 1;
            }
            let mut j = 0;
            while j < HARDWARE_COUNTER_COUNT {
                columns[5 + j] = HARDWARE_COLUMNS[j];
                j += 1;
            }
            columns
        };
        &COLUMNS
    }

    fn record(&self) -> Vec<String> {
        let mut row = vec![
            self.cgroup_id.to_string(),
            self.pid.0.to_string(),
            self.start_ts.to_string(),
            self.end_ts.to_string(),
            self.latency_ns.to_string(),
        ];
        match self.counters {
            Some(counters) => row.extend(counters.to_array().iter().map(u64::to_string)),
            None => row.resize(row.len() + HARDWARE_COUNTER_COUNT, String::new()),
        }
        row
    }
}

impl KernelEvent for ProcEvent {
    const PROBE: &'static str = "proc";

    fn decode(bytes: &[u8]) -> Result<Self, MonitorError> {
        let (header, counters) = if bytes.len() >= size_of::<ProcRecord>() {
            let full: ProcRecord = read_record(Self::PROBE, bytes)?;
            (full.header, Some(full.hw_stats))
        } else {
            (read_record::<ProcRecordHeader>(Self::PROBE, bytes)?, None)
        };

        Ok(Self {
            cgroup_id: header.cgroup_id,
            pid: Pid(header.pid),
            start_ts: header.start_timestamp,
            end_ts: header.end_timestamp,
            latency_ns: header.latency,
            counters,
        })
    }
}

impl Correlated for ProcEvent {
    fn correlation_key(&self) -> Option<u32> {
        Some(self.cgroup_id)
    }
}

// ============================================================================
// Function boundary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEvent {
    pub pid: Pid,
    pub duration_ns: u64,
}

impl CsvRow for FunctionEvent {
    fn header() -> &'static [&'static str] {
        &["pid", "duration"]
    }

    fn record(&self) -> Vec<String> {
        vec![self.pid.0.to_string(), self.duration_ns.to_string()]
    }
}

impl KernelEvent for FunctionEvent {
    const PROBE: &'static str = "function";

    fn decode(bytes: &[u8]) -> Result<Self, MonitorError> {
        let raw: FunctionRecord = read_record(Self::PROBE, bytes)?;
        Ok(Self { pid: Pid(raw.pid), duration_ns: raw.duration_ns })
    }
}

impl Correlated for FunctionEvent {
    fn correlation_key(&self) -> Option<u32> {
        None
    }
}
