use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use migbench::domain::{GroupId, MonitorError, SessionError};
use migbench::monitor::{EventMonitor, MonitorOptions, ProbeSet};
use migbench::session::{BenchmarkOrchestrator, MonitorSpec, SessionConfig, SessionState};

fn artifact_dir() -> PathBuf {
    std::env::var_os("MIGBENCH_ARTIFACT_DIR")
        .map_or_else(|| PathBuf::from(migbench::monitor::DEFAULT_ARTIFACT_DIR), PathBuf::from)
}

#[tokio::test]
async fn test_unlaunchable_workload_reports_abort_and_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let mut config = SessionConfig::new("bench-abort", "/bin/true");
    config.cgroup_root = root.path().to_path_buf();

    let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;

    assert!(!report.completed());
    assert_eq!(report.state, SessionState::Aborted);
    assert!(matches!(report.abort_cause, Some(SessionError::Inject(_))));
    assert!(report.group_id.is_some());
    assert!(report.pid.is_none());
    assert!(!root.path().join("bench-abort").exists());
}

/// Latency monitor, cpuset 0 reassigned to 1: exactly one row 0 -> 1 for the group
#[tokio::test]
#[ignore = "requires root, cgroup v2, two CPUs and latency.bpf.o"]
async fn test_scenario_single_migration_row() {
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("latency.csv");

    let mut config = SessionConfig::new("bench-migrate", "/bin/sh");
    config.workload_args = vec!["-c".to_string(), "while :; do :; done".to_string()];
    config.cpuset = "0".to_string();
    config.reassign_cpuset = Some("1".to_string());
    config.monitor_options.artifact_dir = artifact_dir();
    config.monitors = vec![MonitorSpec { probe_set: ProbeSet::Migration, output: output.clone() }];

    let stop = tokio::time::sleep(Duration::from_secs(10));
    let report = BenchmarkOrchestrator::new(config).run(stop).await;

    assert!(report.completed(), "{:?}", report.abort_cause);
    assert!(report.teardown_errors.is_empty(), "{:?}", report.teardown_errors);
    let key = report.group_id.unwrap().map_key();

    let mut reader = csv::Reader::from_path(&output).unwrap();
    assert_eq!(
        reader.headers().unwrap().iter().collect::<Vec<_>>(),
        vec!["cgroup_id", "latency", "pid", "source_cpu", "target_cpu"]
    );
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][0], key.to_string());
    assert_eq!(&rows[0][3], "0");
    assert_eq!(&rows[0][4], "1");
    assert_eq!(&rows[0][2], report.pid.unwrap().0.to_string());
}

#[tokio::test]
#[ignore = "requires root, cgroup v2 and proc.bpf.o"]
async fn test_proc_lifetime_row_for_short_workload() {
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("proc.csv");

    let mut config = SessionConfig::new("bench-proc", "/bin/true");
    config.monitor_options.artifact_dir = artifact_dir();
    config.monitors = vec![MonitorSpec { probe_set: ProbeSet::Proc, output: output.clone() }];

    let report = BenchmarkOrchestrator::new(config)
        .run(tokio::time::sleep(Duration::from_secs(10)))
        .await;
    assert!(report.completed(), "{:?}", report.abort_cause);

    let content = fs::read_to_string(&output).unwrap();
    let mut lines = content.lines();
    assert!(lines.next().unwrap().starts_with("cgroup_id,pid,start_timestamp,end_timestamp,latency"));
    assert_eq!(lines.count(), 1);
}

fn attached_monitor(probe_set: ProbeSet, out: &tempfile::TempDir) -> EventMonitor {
    let options = MonitorOptions { artifact_dir: artifact_dir(), ..MonitorOptions::default() };
    let mut monitor =
        EventMonitor::load(probe_set, &options, out.path().join("rows.csv")).unwrap();
    monitor.attach().unwrap();
    monitor
}

#[tokio::test]
#[ignore = "requires root and latency.bpf.o"]
async fn test_duplicate_key_on_exclusive_allow_list_is_rejected() {
    let out = tempfile::tempdir().unwrap();
    let mut monitor = attached_monitor(ProbeSet::Migration, &out);

    monitor.register(GroupId(0xdead_beef)).unwrap();
    let err = monitor.register(GroupId(0xdead_beef)).unwrap_err();
    assert!(matches!(err, MonitorError::Registration { key: 0xdead_beef, .. }), "{err}");
    assert_eq!(monitor.registered_keys(), vec![0xdead_beef]);

    monitor.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires root and proc.bpf.o"]
async fn test_upsert_allow_list_accepts_repeated_key() {
    let out = tempfile::tempdir().unwrap();
    let mut monitor = attached_monitor(ProbeSet::Proc, &out);

    monitor.register(GroupId(0xdead_beef)).unwrap();
    monitor.register(GroupId(0xdead_beef)).unwrap();
    assert_eq!(monitor.registered_keys(), vec![0xdead_beef]);

    monitor.close().await.unwrap();
}

#[test]
#[ignore = "requires root and function.bpf.o"]
fn test_failed_hook_install_keeps_sink_open() {
    let out = tempfile::tempdir().unwrap();
    let output = out.path().join("rows.csv");
    let options = MonitorOptions { artifact_dir: artifact_dir(), ..MonitorOptions::default() };
    let probe_set = ProbeSet::Function {
        binary: PathBuf::from("/bin/true"),
        symbol: "no_such_symbol_in_binary".to_string(),
    };

    let mut monitor = EventMonitor::load(probe_set, &options, &output).unwrap();
    let err = monitor.attach().unwrap_err();
    assert!(matches!(err, MonitorError::Attach { .. }), "{err}");
    assert_eq!(monitor.sink_path(), Some(output.as_path()));
}
