//! Pre-flight checks for migbench
//!
//! Validates system requirements before creating a resource group or loading
//! any kernel artifact. Provides clear, actionable error messages when
//! requirements aren't met.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::path::Path;

use crate::monitor::ProbeSet;

/// Minimum kernel version: `clone3(CLONE_INTO_CGROUP)` is 5.7, BPF ring buffers 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks for one session
///
/// # Errors
/// Returns an error describing the first unmet requirement
pub fn run_preflight_checks(
    workload: &Path,
    cgroup_root: &Path,
    artifact_dir: &Path,
    probe_sets: &[ProbeSet],
) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_cgroup_v2(cgroup_root)?;
    check_workload_exists(workload)?;
    check_artifacts(artifact_dir, probe_sets)?;
    raise_memlock_limit();
    Ok(())
}

/// Check if running with sufficient privileges for cgroup and eBPF access
fn check_privileges() -> Result<()> {
    // SAFETY: geteuid() has no preconditions
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: migbench requires root privileges to manage cgroups,\n\
         set CPU frequencies and load eBPF programs.\n\n\
         Run with: sudo migbench ..."
    );
}

/// `(major, minor)` of a release string like `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check if the kernel version is sufficient
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        debug!("Unrecognized kernel release {release:?}");
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             migbench requires Linux {}.{} or newer for clone3 into cgroups and BPF ring buffers.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// A cgroup v2 root carries `cgroup.controllers`; v1 hierarchies do not
fn check_cgroup_v2(cgroup_root: &Path) -> Result<()> {
    if cgroup_root.join("cgroup.controllers").is_file() {
        return Ok(());
    }
    bail!(
        "No cgroup v2 hierarchy at {}\n\n\
         migbench needs the unified hierarchy (cgroup2) mounted there.\n\
         Check with: mount -t cgroup2",
        cgroup_root.display()
    );
}

/// Check if the workload exists and is a file
fn check_workload_exists(workload: &Path) -> Result<()> {
    if !workload.exists() {
        bail!(
            "Workload not found: {}\n\n\
             Make sure the path is correct and the file exists.",
            workload.display()
        );
    }
    if !workload.is_file() {
        bail!(
            "Not a file: {}\n\n\
             The workload must be an executable file, not a directory.",
            workload.display()
        );
    }
    Ok(())
}

/// Check that every requested artifact is present
fn check_artifacts(artifact_dir: &Path, probe_sets: &[ProbeSet]) -> Result<()> {
    for probe_set in probe_sets {
        let artifact = probe_set.artifact_path(artifact_dir);
        if !artifact.is_file() {
            bail!(
                "Kernel artifact for the {probe_set} monitor not found: {}\n\n\
                 Build the BPF objects and pass their directory with --artifact-dir.",
                artifact.display()
            );
        }
    }
    Ok(())
}

/// Lift `RLIMIT_MEMLOCK` for kernels that still charge BPF maps against it
fn raise_memlock_limit() {
    let unlimited = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    // SAFETY: the pointer refers to a live rlimit for the duration of the call
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &unlimited) } != 0 {
        warn!("Failed to remove memlock limit: {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_check() {
        // Should pass on any modern system; only make sure it doesn't panic
        let _ = check_kernel_version();
    }

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_release("5.8"), Some((5, 8)));
        assert_eq!(parse_kernel_release("unknown"), None);
        assert!(parse_kernel_release("5.7.19").unwrap() < MIN_KERNEL_VERSION);
    }

    #[test]
    fn test_workload_not_found() {
        let err = check_workload_exists(Path::new("/nonexistent/path/to/workload")).unwrap_err();
        assert!(err.to_string().contains("Workload not found"));
    }

    #[test]
    fn test_workload_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_workload_exists(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Not a file"));
    }

    #[test]
    fn test_cgroup_v2_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_cgroup_v2(dir.path()).is_err());
        std::fs::write(dir.path().join("cgroup.controllers"), "cpuset cpu memory\n").unwrap();
        check_cgroup_v2(dir.path()).unwrap();
    }

    #[test]
    fn test_missing_artifact_named() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("latency.bpf.o"), b"").unwrap();

        check_artifacts(dir.path(), &[ProbeSet::Migration]).unwrap();
        let err = check_artifacts(dir.path(), &[ProbeSet::Migration, ProbeSet::Llc]).unwrap_err();
        assert!(err.to_string().contains("llc.bpf.o"));
    }
}
