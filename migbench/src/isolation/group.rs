//! Resource-control group lifecycle
//!
//! A [`ResourceGroup`] is one cgroup v2 directory created for a benchmark run.
//! Its inode number is the correlation key every kernel monitor filters on.
//!
//! ## Control files
//!
//! - `cpuset.cpus` - CPUs the workload may run on
//! - `memory.max` - memory bound
//! - `cgroup.procs` - current members (one pid per line)
//!
//! ## Teardown retry policy
//!
//! [`ResourceGroup::kill_all`] runs up to [`KILL_ATTEMPTS`] list/signal/reap
//! cycles. A member can exit between being listed and being signaled, and a
//! forking workload can add members mid-cycle; both are absorbed by the next
//! cycle rather than reported.

#![allow(unsafe_code)] // kill() and waitpid() require unsafe

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::domain::{GroupError, GroupId, Pid};

/// Mount point of the unified cgroup hierarchy
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Full list/signal/reap cycles attempted by [`ResourceGroup::kill_all`]
pub const KILL_ATTEMPTS: u32 = 3;

const CPUSET_FILE: &str = "cpuset.cpus";
const MEMORY_FILE: &str = "memory.max";
const PROCS_FILE: &str = "cgroup.procs";

/// One isolated resource-control group
#[derive(Debug)]
pub struct ResourceGroup {
    path: PathBuf,
    id: GroupId,
    name: String,
}

impl ResourceGroup {
    /// Create (or reuse) `name` under the default cgroup root
    ///
    /// # Errors
    /// Returns [`GroupError::Filesystem`] if the directory cannot be created or inspected
    pub fn create(name: &str) -> Result<Self, GroupError> {
        Self::create_in(DEFAULT_CGROUP_ROOT, name)
    }

    /// Create (or reuse) `name` under `root`
    ///
    /// An existing directory is not an error; its inode becomes the identity.
    ///
    /// # Errors
    /// Returns [`GroupError::Filesystem`] if the directory cannot be created or inspected
    pub fn create_in(root: impl AsRef<Path>, name: &str) -> Result<Self, GroupError> {
        let path = root.as_ref().join(name);

        match fs::create_dir(&path) {
            Ok(()) => info!("Created resource group {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Resource group {} already exists, reusing it", path.display());
            }
            Err(source) => return Err(GroupError::Filesystem { path, source }),
        }

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(source) => return Err(GroupError::Filesystem { path, source }),
        };

        let id = GroupId(metadata.ino());
        debug!("Resource group {} has identity {id}", path.display());

        Ok(Self { path, id, name: name.to_string() })
    }

    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Restrict the group to the CPUs in `spec` (kernel list syntax, e.g. `0-3,8`)
    ///
    /// # Errors
    /// Returns [`GroupError::Constraint`] if the kernel rejects the write
    pub fn set_cpuset(&self, spec: &str) -> Result<(), GroupError> {
        self.write_control(CPUSET_FILE, spec)?;
        info!("Set {CPUSET_FILE}={spec} on {}", self.name);
        Ok(())
    }

    /// Bound the group's memory (e.g. `256M`, `max`)
    ///
    /// # Errors
    /// Returns [`GroupError::Constraint`] if the kernel rejects the write
    pub fn set_memory_limit(&self, spec: &str) -> Result<(), GroupError> {
        self.write_control(MEMORY_FILE, spec)?;
        info!("Set {MEMORY_FILE}={spec} on {}", self.name);
        Ok(())
    }

    fn write_control(&self, control: &'static str, spec: &str) -> Result<(), GroupError> {
        fs::write(self.path.join(control), spec).map_err(|source| GroupError::Constraint {
            control,
            spec: spec.to_string(),
            source,
        })
    }

    /// Current member pids
    ///
    /// A group whose `cgroup.procs` no longer exists has no members.
    ///
    /// # Errors
    /// Returns [`GroupError::Filesystem`] if `cgroup.procs` exists but cannot be read
    pub fn members(&self) -> Result<Vec<Pid>, GroupError> {
        let procs = self.path.join(PROCS_FILE);
        let content = match fs::read_to_string(&procs) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(GroupError::Filesystem { path: procs, source }),
        };

        Ok(content.split_whitespace().filter_map(|s| s.parse::<u32>().ok()).map(Pid).collect())
    }

    /// Force-terminate and reap every member
    ///
    /// Succeeds immediately on an empty group.
    ///
    /// # Errors
    /// Returns [`GroupError::ResourceBusy`] if members remain after
    /// [`KILL_ATTEMPTS`] cycles, or [`GroupError::Filesystem`] if the member
    /// list cannot be read
    pub fn kill_all(&self) -> Result<(), GroupError> {
        for attempt in 1..=KILL_ATTEMPTS {
            let members = self.members()?;
            if members.is_empty() {
                return Ok(());
            }

            debug!("Kill attempt {attempt}/{KILL_ATTEMPTS}: {} member(s)", members.len());
            for pid in members {
                terminate_and_reap(pid);
            }
        }

        let remaining = self.members()?.len();
        if remaining == 0 {
            Ok(())
        } else {
            Err(GroupError::ResourceBusy {
                path: self.path.clone(),
                remaining,
                attempts: KILL_ATTEMPTS,
            })
        }
    }

    /// Remove the group directory
    ///
    /// cgroupfs directories are removed with a single `rmdir` (their control
    /// files are not unlinkable); a plain directory falls back to recursive
    /// removal. Removing an already-removed group succeeds.
    ///
    /// # Errors
    /// Returns [`GroupError::Filesystem`] if the group still has members or
    /// removal otherwise fails
    pub fn close(&self) -> Result<(), GroupError> {
        let result = match fs::remove_dir(&self.path) {
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => fs::remove_dir_all(&self.path),
            other => other,
        };

        match result {
            Ok(()) => {
                info!("Removed resource group {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(GroupError::Filesystem { path: self.path.clone(), source }),
        }
    }
}

/// SIGKILL `pid` and reap it if it is our child.
///
/// `ESRCH` (already exited) and `ECHILD` (not our child, or already reaped)
/// are expected outcomes, not failures.
fn terminate_and_reap(pid: Pid) {
    let raw: libc::pid_t = pid.into();

    // SAFETY: kill() has no memory-safety preconditions
    if unsafe { libc::kill(raw, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!("{pid} exited before it could be signaled");
        } else {
            warn!("Failed to signal {pid}: {err}");
        }
        return;
    }

    let mut status = 0;
    loop {
        // SAFETY: status points to a live c_int for the duration of the call
        if unsafe { libc::waitpid(raw, &mut status, 0) } >= 0 {
            info!("Killed {pid}");
            return;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => {
                debug!("Signaled {pid} (not a child, nothing to reap)");
                return;
            }
            _ => {
                warn!("Failed to reap {pid}: {}", io::Error::last_os_error());
                return;
            }
        }
    }
}
