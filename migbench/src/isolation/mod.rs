//! Workload isolation: resource groups and injection into them

pub mod group;
pub mod injector;

pub use group::{ResourceGroup, DEFAULT_CGROUP_ROOT, KILL_ATTEMPTS};
pub use injector::{wait_for_exit, ProcessInjector, EXEC_FAILURE_STATUS};
