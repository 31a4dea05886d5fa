use std::fs;
use std::path::Path;

use migbench::isolation::{wait_for_exit, ProcessInjector, ResourceGroup, DEFAULT_CGROUP_ROOT};

fn is_root() -> bool {
    fs::read_to_string("/proc/self/status")
        .map(|s| s.lines().any(|l| l.starts_with("Uid:") && l.split_whitespace().nth(1) == Some("0")))
        .unwrap_or(false)
}

#[test]
fn test_create_then_close_leaves_nothing() {
    let root = tempfile::tempdir().unwrap();

    for name in ["bench-A", "bench_b", "x"] {
        let group = ResourceGroup::create_in(root.path(), name).unwrap();
        assert!(group.path().is_dir());
        group.close().unwrap();
        assert!(!root.path().join(name).exists(), "{name} left behind");
    }
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
}

#[test]
fn test_identity_is_stable_across_reopen() {
    let root = tempfile::tempdir().unwrap();
    let first = ResourceGroup::create_in(root.path(), "bench-A").unwrap();
    let again = ResourceGroup::create_in(root.path(), "bench-A").unwrap();
    assert_eq!(first.id(), again.id());
    first.close().unwrap();
}

#[test]
fn test_kill_all_on_empty_group_is_a_no_op() {
    let root = tempfile::tempdir().unwrap();
    let group = ResourceGroup::create_in(root.path(), "bench-A").unwrap();
    fs::write(group.path().join("cgroup.procs"), "").unwrap();

    group.kill_all().unwrap();
    group.kill_all().unwrap();
    assert_eq!(fs::read_to_string(group.path().join("cgroup.procs")).unwrap(), "");
    group.close().unwrap();
}

/// Create "bench-A" with cpuset 0 and 256M, run /bin/true in it, tear down
#[test]
#[ignore = "requires root and a cgroup v2 hierarchy"]
fn test_scenario_bench_a_lifecycle() {
    assert!(is_root());
    let group = ResourceGroup::create_in(DEFAULT_CGROUP_ROOT, "bench-A").unwrap();
    group.set_cpuset("0").unwrap();
    group.set_memory_limit("256M").unwrap();

    let mut injector = ProcessInjector::open(group.path()).unwrap();
    let pid = injector.clone_and_exec(Path::new("/bin/true")).unwrap();
    assert_eq!(wait_for_exit(pid).unwrap(), Some(0));
    injector.close();

    group.kill_all().unwrap();
    assert!(group.members().unwrap().is_empty());
    group.close().unwrap();
    assert!(!group.path().exists());
}

#[test]
#[ignore = "requires root and a cgroup v2 hierarchy"]
fn test_injected_process_starts_inside_group() {
    let group = ResourceGroup::create_in(DEFAULT_CGROUP_ROOT, "bench-inject").unwrap();
    let injector = ProcessInjector::open(group.path()).unwrap();
    let pid = injector.clone_and_exec_args(Path::new("/bin/sleep"), &["5".to_string()]).unwrap();

    assert_eq!(group.members().unwrap(), vec![pid]);
    let cgroup = fs::read_to_string(format!("/proc/{}/cgroup", pid.0)).unwrap();
    assert!(cgroup.trim_end().ends_with("/bench-inject"), "{cgroup}");

    group.kill_all().unwrap();
    group.close().unwrap();
}

#[test]
#[ignore = "requires root and a cgroup v2 hierarchy"]
fn test_exec_failure_exits_127() {
    let group = ResourceGroup::create_in(DEFAULT_CGROUP_ROOT, "bench-noexec").unwrap();
    let injector = ProcessInjector::open(group.path()).unwrap();
    let pid = injector.clone_and_exec(Path::new("/nonexistent/workload")).unwrap();

    assert_eq!(wait_for_exit(pid).unwrap(), Some(migbench::isolation::EXEC_FAILURE_STATUS));
    group.kill_all().unwrap();
    group.close().unwrap();
}
