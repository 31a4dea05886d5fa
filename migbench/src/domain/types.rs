//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep a cgroup identity from being passed where a
//! process id or CPU index is expected.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    #[allow(clippy::cast_sign_loss)]
    fn from(pid: i32) -> Self {
        Pid(pid as u32)
    }
}

impl From<Pid> for i32 {
    #[allow(clippy::cast_possible_wrap)]
    fn from(pid: Pid) -> Self {
        pid.0 as i32
    }
}

/// CPU ID
///
/// Represents a logical CPU index (0, 1, 2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Resource-group identity
///
/// The inode number of the cgroup directory, which is also the kernfs node id
/// the kernel artifacts read from `task->cgroups->dfl_cgrp->kn->id`. It is the
/// correlation key every monitor registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u64);

impl GroupId {
    /// Key used in the kernel-side allow-lists.
    ///
    /// The artifacts key their maps with `__u32`, so only the low 32 bits of
    /// the id take part in filtering.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn map_key(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CGROUP:{}", self.0)
    }
}
