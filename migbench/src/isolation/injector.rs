//! Atomic process injection into a resource group
//!
//! `clone3(CLONE_INTO_CGROUP)` places the child in the target group before it
//! executes a single instruction, so no part of the workload ever runs (or is
//! counted) outside the group.
//!
//! Everything the child needs (argv, envp, the diagnostic message) is built
//! before the syscall. Between `clone3` and `execve` the child only touches
//! pre-built memory and async-signal-safe calls.

#![allow(unsafe_code)] // raw clone3/execve/_exit

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::domain::{InjectError, Pid};

/// Place the child in the cgroup referred to by [`CloneArgs::cgroup`]
const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

/// Exit status reported when `execve` fails in the child
pub const EXEC_FAILURE_STATUS: i32 = 127;

/// `struct clone_args` (`CLONE_ARGS_SIZE_VER2`)
#[repr(C)]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Spawns processes directly inside one resource group
#[derive(Debug)]
pub struct ProcessInjector {
    group_dir: PathBuf,
    fd: Option<OwnedFd>,
}

impl ProcessInjector {
    /// Open a directory handle on `group_dir`
    ///
    /// # Errors
    /// Returns [`InjectError::Filesystem`] if the path is missing or not a directory
    pub fn open(group_dir: impl AsRef<Path>) -> Result<Self, InjectError> {
        let group_dir = group_dir.as_ref().to_path_buf();
        let file = File::options()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(&group_dir)
            .map_err(|source| InjectError::Filesystem { path: group_dir.clone(), source })?;

        debug!("Opened injection handle on {}", group_dir.display());
        Ok(Self { group_dir, fd: Some(OwnedFd::from(file)) })
    }

    #[must_use]
    pub fn group_dir(&self) -> &Path {
        &self.group_dir
    }

    /// Start `path` inside the group with `argv = [path]` and the current environment
    ///
    /// # Errors
    /// See [`ProcessInjector::clone_and_exec_args`]
    pub fn clone_and_exec(&self, path: &Path) -> Result<Pid, InjectError> {
        self.clone_and_exec_args(path, &[])
    }

    /// Start `path` inside the group with `argv = [path, args...]`
    ///
    /// Returns the child pid as soon as the kernel has created it. If `execve`
    /// fails the child prints a diagnostic to stderr and exits with
    /// [`EXEC_FAILURE_STATUS`].
    ///
    /// # Errors
    /// - [`InjectError::Closed`] after [`ProcessInjector::close`]
    /// - [`InjectError::InvalidPath`] if the path or an argument contains a NUL byte
    /// - [`InjectError::Clone`] if the kernel rejects the request
    pub fn clone_and_exec_args(&self, path: &Path, args: &[String]) -> Result<Pid, InjectError> {
        let fd = self.fd.as_ref().ok_or(InjectError::Closed)?;

        let program = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| InjectError::InvalidPath(path.to_path_buf()))?;

        let mut argv_owned = Vec::with_capacity(args.len() + 1);
        argv_owned.push(program.clone());
        for arg in args {
            argv_owned.push(
                CString::new(arg.as_bytes()).map_err(|_| InjectError::InvalidPath(path.to_path_buf()))?,
            );
        }
        let envp_owned: Vec<CString> = std::env::vars_os()
            .filter_map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).ok()
            })
            .collect();

        let argv = null_terminated(&argv_owned);
        let envp = null_terminated(&envp_owned);
        let diagnostic = format!("migbench: execve {} failed\n", path.display());

        let clone_args = CloneArgs {
            flags: CLONE_INTO_CGROUP,
            exit_signal: libc::SIGCHLD as u64,
            cgroup: fd.as_raw_fd() as u64,
            ..CloneArgs::default()
        };

        // SAFETY: clone_args is a valid, fully initialized struct clone_args of
        // the size passed; with no stack given the child runs on a copy of ours.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_clone3,
                &clone_args as *const CloneArgs,
                std::mem::size_of::<CloneArgs>(),
            )
        };

        match ret {
            -1 => Err(InjectError::Clone(io::Error::last_os_error())),
            0 => exec_child(&program, &argv, &envp, diagnostic.as_bytes()),
            pid => {
                let pid = Pid(pid as u32);
                info!("Injected {} as {pid} into {}", path.display(), self.group_dir.display());
                Ok(pid)
            }
        }
    }

    /// Release the directory handle. Further clones fail with [`InjectError::Closed`].
    pub fn close(&mut self) {
        if self.fd.take().is_some() {
            debug!("Closed injection handle on {}", self.group_dir.display());
        }
    }
}

/// Block until `pid` exits and return its exit status
///
/// Returns `Ok(None)` if the process was killed by a signal or has already
/// been reaped elsewhere.
///
/// # Errors
/// Any `waitpid` failure other than `EINTR` and `ECHILD`
pub fn wait_for_exit(pid: Pid) -> io::Result<Option<i32>> {
    let raw: libc::pid_t = pid.into();
    let mut status = 0;

    loop {
        // SAFETY: status points to a live c_int for the duration of the call
        if unsafe { libc::waitpid(raw, &mut status, 0) } >= 0 {
            let code = libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status));
            debug!("{pid} exited with {code:?}");
            return Ok(code);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(None),
            _ => return Err(err),
        }
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings.iter().map(|s| s.as_ptr()).chain(std::iter::once(std::ptr::null())).collect()
}

/// Child side of the clone. Never returns into caller logic.
fn exec_child(
    program: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    diagnostic: &[u8],
) -> ! {
    // SAFETY: all pointers reference NUL-terminated buffers allocated before
    // the clone; execve, write and _exit are async-signal-safe.
    unsafe {
        libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
        libc::write(libc::STDERR_FILENO, diagnostic.as_ptr().cast(), diagnostic.len());
        libc::_exit(EXEC_FAILURE_STATUS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_exit_reports_status() {
        let child = std::process::Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let code = wait_for_exit(Pid(child.id())).unwrap();
        assert_eq!(code, Some(3));
        // Already reaped
        assert_eq!(wait_for_exit(Pid(child.id())).unwrap(), None);
    }

    #[test]
    fn test_clone_args_layout() {
        assert_eq!(std::mem::size_of::<CloneArgs>(), 88);
    }

    #[test]
    fn test_open_missing_directory() {
        let err = ProcessInjector::open("/nonexistent/group").unwrap_err();
        assert!(matches!(err, InjectError::Filesystem { .. }));
    }

    #[test]
    fn test_open_regular_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = ProcessInjector::open(file.path()).unwrap_err();
        assert!(matches!(err, InjectError::Filesystem { .. }));
    }

    #[test]
    fn test_nul_in_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let injector = ProcessInjector::open(dir.path()).unwrap();
        let err = injector.clone_and_exec(Path::new("/bin/tr\0ue")).unwrap_err();
        assert!(matches!(err, InjectError::InvalidPath(_)));
    }

    #[test]
    fn test_clone_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut injector = ProcessInjector::open(dir.path()).unwrap();
        injector.close();
        injector.close();
        let err = injector.clone_and_exec(Path::new("/bin/true")).unwrap_err();
        assert!(matches!(err, InjectError::Closed));
    }

    #[test]
    fn test_clone_into_non_group_directory_fails() {
        // A plain directory is not a cgroup; the kernel rejects the request
        // (EBADF, or ENOSYS where clone3 is unavailable) without forking.
        let dir = tempfile::tempdir().unwrap();
        let injector = ProcessInjector::open(dir.path()).unwrap();
        let err = injector.clone_and_exec(Path::new("/bin/true")).unwrap_err();
        assert!(matches!(err, InjectError::Clone(_)));
    }
}
