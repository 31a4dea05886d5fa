//! CPU topology helpers
//!
//! Utilities for querying CPU lists from the /sys filesystem.

use std::fs;
use std::path::Path;

use crate::domain::{CpuId, FrequencyError};

/// Online CPU list exported by the kernel
pub const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

/// Parse kernel CPU list syntax
///
/// The format is like "0-3" or "0-3,8-11" for NUMA systems. Used both for
/// `/sys/devices/system/cpu/online` and for cpuset specs. Whitespace around
/// the list is ignored; an empty list yields no CPUs.
///
/// Returns `None` on malformed input or an inverted range.
#[must_use]
pub fn parse_cpu_list(list: &str) -> Option<Vec<CpuId>> {
    let list = list.trim();
    if list.is_empty() {
        return Some(Vec::new());
    }

    let mut cpus = Vec::new();
    for range in list.split(',') {
        let range = range.trim();
        if let Some((start, end)) = range.split_once('-') {
            // Range like "0-3"
            let start: u32 = start.trim().parse().ok()?;
            let end: u32 = end.trim().parse().ok()?;
            if end < start {
                return None;
            }
            cpus.extend((start..=end).map(CpuId));
        } else {
            // Single CPU like "5"
            cpus.push(CpuId(range.parse().ok()?));
        }
    }

    Some(cpus)
}

/// Get the list of online CPU IDs
///
/// # Errors
/// Returns [`FrequencyError::Filesystem`] if the file cannot be read and
/// [`FrequencyError::Parse`] if its content is not a CPU list
pub fn online_cpus() -> Result<Vec<CpuId>, FrequencyError> {
    online_cpus_from(ONLINE_CPUS_PATH)
}

/// [`online_cpus`] against an alternate file
///
/// # Errors
/// See [`online_cpus`]
pub fn online_cpus_from(path: impl AsRef<Path>) -> Result<Vec<CpuId>, FrequencyError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|source| FrequencyError::Filesystem { path: path.to_path_buf(), source })?;

    parse_cpu_list(&content)
        .ok_or_else(|| FrequencyError::Parse { path: path.to_path_buf(), value: content.trim().to_string() })
}
