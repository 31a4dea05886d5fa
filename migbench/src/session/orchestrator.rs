//! Session driver
//!
//! Runs the phases of [`super::SessionState`] in order against one resource
//! group and one workload. The first failure aborts the remaining phases;
//! teardown runs in every case and its own failures are only recorded.

use std::future::Future;
use std::pin::Pin;

use log::{error, info, warn};
use tokio::sync::mpsc;

use super::config::SessionConfig;
use super::report::{MonitorRows, SessionReport};
use super::{SessionMachine, SessionState};
use crate::cpufreq::FrequencyController;
use crate::domain::{FrequencyError, GroupId, Pid, SessionError};
use crate::energy::{EnergyDelta, EnergySampler, EnergyWindow};
use crate::isolation::{wait_for_exit, ProcessInjector, ResourceGroup};
use crate::monitor::{ConsumeMode, ConsumerExit, EventMonitor};

pub struct BenchmarkOrchestrator {
    config: SessionConfig,
    machine: SessionMachine,
    energy: EnergySampler,
    group: Option<ResourceGroup>,
    injector: Option<ProcessInjector>,
    monitors: Vec<EventMonitor>,
    exits_tx: mpsc::UnboundedSender<ConsumerExit>,
    exits_rx: mpsc::UnboundedReceiver<ConsumerExit>,
    pid: Option<Pid>,
    energy_window: Option<EnergyWindow>,
    energy_delta: Option<EnergyDelta>,
    monitor_rows: Vec<MonitorRows>,
}

impl BenchmarkOrchestrator {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let energy = config.monitor_options.energy.clone();
        Self {
            config,
            machine: SessionMachine::default(),
            energy,
            group: None,
            injector: None,
            monitors: Vec::new(),
            exits_tx,
            exits_rx,
            pid: None,
            energy_window: None,
            energy_delta: None,
            monitor_rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Run the session to a terminal state
    ///
    /// `stop` is the external stop trigger (Ctrl-C in the binary). It ends
    /// the wait for completion early; the session still completes normally.
    pub async fn run<F: Future<Output = ()>>(mut self, stop: F) -> SessionReport {
        tokio::pin!(stop);
        let outcome = self.execute(stop.as_mut()).await;
        if let Err(e) = &outcome {
            error!("❌ Session aborted during {}: {e}", self.machine.state());
        }

        if let Err(e) = self.machine.advance(SessionState::Teardown) {
            warn!("⚠️  {e}");
        }
        let teardown_errors = self.teardown().await;

        let terminal = if outcome.is_ok() { SessionState::Completed } else { SessionState::Aborted };
        if let Err(e) = self.machine.advance(terminal) {
            warn!("⚠️  {e}");
        }
        info!("Session {terminal} ({} teardown error(s))", teardown_errors.len());

        SessionReport {
            state: terminal,
            history: self.machine.history().to_vec(),
            abort_cause: outcome.err(),
            teardown_errors,
            group_id: self.group.as_ref().map(ResourceGroup::id),
            pid: self.pid,
            energy: self.energy_delta,
            monitor_rows: self.monitor_rows,
        }
    }

    async fn execute<F: Future<Output = ()>>(&mut self, stop: Pin<&mut F>) -> Result<(), SessionError> {
        self.config.validate()?;

        self.machine.advance(SessionState::ConfiguringFrequency)?;
        self.configure_frequency()?;

        self.machine.advance(SessionState::AttachingProbes)?;
        self.attach_monitors()?;

        self.machine.advance(SessionState::ConstrainingGroup)?;
        let group = self.constrain_group()?;

        self.machine.advance(SessionState::RegisteringCorrelation)?;
        for monitor in &mut self.monitors {
            monitor.register(group)?;
        }

        self.machine.advance(SessionState::Launching)?;
        self.launch()?;

        if let Some(cpuset) = &self.config.reassign_cpuset {
            self.machine.advance(SessionState::Reassigning)?;
            if let Some(group) = &self.group {
                group.set_cpuset(cpuset)?;
                info!("✓ Reassigned {} to CPUs {cpuset}", group.name());
            }
        }

        self.machine.advance(SessionState::AwaitingCompletion)?;
        self.await_completion(stop).await?;

        if let Some(window) = self.energy_window.take() {
            self.energy_delta = Some(window.close(&self.energy)?);
        }
        Ok(())
    }

    /// Frequency control is optional: a host without cpufreq, or without the
    /// userspace governor, runs at whatever frequency it is at
    fn configure_frequency(&self) -> Result<(), SessionError> {
        if self.config.frequencies.is_empty() {
            return Ok(());
        }

        let controller = match FrequencyController::discover_in(&self.config.sysfs_cpu_root) {
            Ok(controller) => controller,
            Err(e) => {
                warn!("⚠️  Frequency control unavailable, keeping current frequencies: {e}");
                return Ok(());
            }
        };

        for pin in &self.config.frequencies {
            match controller.set_fixed_frequency(pin.cpu, pin.khz) {
                Ok(()) => info!("✓ Pinned {} to {} kHz", pin.cpu, pin.khz),
                Err(e @ (FrequencyError::NotSupported { .. } | FrequencyError::UnsupportedGovernor { .. })) => {
                    warn!("⚠️  Cannot pin {}: {e}", pin.cpu);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn attach_monitors(&mut self) -> Result<(), SessionError> {
        for spec in &self.config.monitors {
            let mut monitor =
                EventMonitor::load(spec.probe_set.clone(), &self.config.monitor_options, &spec.output)?;
            let mode = if spec.probe_set.is_single_shot() {
                ConsumeMode::SingleShot
            } else {
                ConsumeMode::Continuous
            };

            let attached = monitor.attach().and_then(|()| monitor.spawn(mode, self.exits_tx.clone()));
            // Kept even on failure so teardown releases the hooks that did attach
            self.monitors.push(monitor);
            attached?;
            info!("✓ {} monitor writing to {}", spec.probe_set, spec.output.display());
        }
        Ok(())
    }

    fn constrain_group(&mut self) -> Result<GroupId, SessionError> {
        let group = ResourceGroup::create_in(&self.config.cgroup_root, &self.config.group_name)?;
        let group = self.group.insert(group);

        group.set_cpuset(&self.config.cpuset)?;
        group.set_memory_limit(&self.config.memory_max)?;
        Ok(group.id())
    }

    fn launch(&mut self) -> Result<(), SessionError> {
        let Some(group) = &self.group else {
            return Err(SessionError::InvalidConfig("no resource group to launch into".to_string()));
        };
        let injector = self.injector.insert(ProcessInjector::open(group.path())?);

        if let Some(capture) = &self.config.energy {
            self.energy_window = Some(EnergyWindow::open(&self.energy, capture.cpu)?);
        }

        let pid = injector.clone_and_exec_args(&self.config.workload, &self.config.workload_args)?;
        self.pid = Some(pid);
        Ok(())
    }

    /// Wait for every single-shot monitor, or the stop trigger when only
    /// continuous monitors run, or the workload itself when nothing is monitored
    async fn await_completion<F: Future<Output = ()>>(
        &mut self,
        mut stop: Pin<&mut F>,
    ) -> Result<(), SessionError> {
        let mut pending =
            self.config.monitors.iter().filter(|spec| spec.probe_set.is_single_shot()).count();

        if self.config.monitors.is_empty() {
            let Some(pid) = self.pid else {
                return Ok(());
            };
            let exited = tokio::task::spawn_blocking(move || wait_for_exit(pid));
            tokio::select! {
                status = exited => match status {
                    Ok(Ok(code)) => info!("Workload {pid} exited with {code:?}"),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(e) => warn!("⚠️  Lost track of {pid}: {e}"),
                },
                () = &mut stop => info!("Stop requested"),
            }
            return Ok(());
        }

        if pending == 0 {
            info!("Continuous monitors running, waiting for stop (Ctrl-C)");
        }

        loop {
            tokio::select! {
                exit = self.exits_rx.recv() => {
                    let Some(exit) = exit else {
                        return Ok(());
                    };
                    let mode = exit.mode;
                    self.record_exit(exit)?;
                    if mode == ConsumeMode::SingleShot {
                        pending = pending.saturating_sub(1);
                        if pending == 0 {
                            return Ok(());
                        }
                    }
                }
                () = &mut stop => {
                    info!("Stop requested");
                    return Ok(());
                }
            }
        }
    }

    fn record_exit(&mut self, exit: ConsumerExit) -> Result<(), SessionError> {
        let ConsumerExit { probe, rows, result, .. } = exit;
        self.monitor_rows.push(MonitorRows { probe, rows });
        result.map_err(|source| SessionError::Consumer { probe, source })
    }

    async fn teardown(&mut self) -> Vec<SessionError> {
        let mut errors: Vec<SessionError> = Vec::new();

        if let Some(group) = &self.group {
            if let Err(e) = group.kill_all() {
                errors.push(e.into());
            }
        }

        for monitor in &mut self.monitors {
            if let Err(e) = monitor.close().await {
                errors.push(e.into());
            }
        }
        self.monitors.clear();

        // Exits of consumers stopped by the close above
        while let Ok(exit) = self.exits_rx.try_recv() {
            if let Err(e) = self.record_exit(exit) {
                errors.push(e);
            }
        }

        if let Some(mut injector) = self.injector.take() {
            injector.close();
        }

        if let Some(group) = &self.group {
            if let Err(e) = group.close() {
                errors.push(e.into());
            }
        }

        for e in &errors {
            warn!("⚠️  Teardown: {e}");
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpufreq::tests::fake_sysfs;
    use crate::domain::{CpuId, InjectError};
    use crate::session::FrequencyPin;
    use std::fs;
    use std::path::Path;

    /// A session whose cgroup root is a plain directory: every phase up to
    /// launch succeeds, and `clone3` then refuses the non-cgroup directory.
    fn fake_config(cgroup_root: &Path, sysfs: &Path) -> SessionConfig {
        let mut config = SessionConfig::new("bench-A", "/bin/true");
        config.cgroup_root = cgroup_root.to_path_buf();
        config.sysfs_cpu_root = sysfs.to_path_buf();
        config.cpuset = "0".to_string();
        config.memory_max = "256M".to_string();
        config
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_before_any_phase() {
        let cgroups = tempfile::tempdir().unwrap();
        let mut config = fake_config(cgroups.path(), Path::new("/nonexistent"));
        config.group_name = "a/b".to_string();

        let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;

        assert_eq!(report.state, SessionState::Aborted);
        assert!(matches!(report.abort_cause, Some(SessionError::InvalidConfig(_))));
        assert_eq!(
            report.history,
            vec![SessionState::Idle, SessionState::Teardown, SessionState::Aborted]
        );
        assert!(report.group_id.is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_aborts_and_removes_group() {
        let cgroups = tempfile::tempdir().unwrap();
        let config = fake_config(cgroups.path(), Path::new("/nonexistent"));

        let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;

        assert_eq!(report.state, SessionState::Aborted);
        assert!(matches!(report.abort_cause, Some(SessionError::Inject(InjectError::Clone(_)))));
        assert!(report.teardown_errors.is_empty(), "{:?}", report.teardown_errors);
        assert!(report.group_id.is_some());
        assert!(report.pid.is_none());
        assert!(!cgroups.path().join("bench-A").exists());
        assert_eq!(
            &report.history[..],
            &[
                SessionState::Idle,
                SessionState::ConfiguringFrequency,
                SessionState::AttachingProbes,
                SessionState::ConstrainingGroup,
                SessionState::RegisteringCorrelation,
                SessionState::Launching,
                SessionState::Teardown,
                SessionState::Aborted,
            ]
        );
    }

    #[tokio::test]
    async fn test_fixed_frequency_is_written_unvalidated() {
        let cgroups = tempfile::tempdir().unwrap();
        let sysfs = fake_sysfs(2, "performance powersave userspace");
        let mut config = fake_config(cgroups.path(), sysfs.path());
        config.frequencies = vec![FrequencyPin { cpu: CpuId(0), khz: 5_000_000 }];

        let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;

        // Frequency phase passed; the session only stopped at launch
        assert!(matches!(report.abort_cause, Some(SessionError::Inject(_))));
        let cpufreq = sysfs.path().join("cpu0/cpufreq");
        assert_eq!(fs::read_to_string(cpufreq.join("scaling_governor")).unwrap(), "userspace");
        assert_eq!(fs::read_to_string(cpufreq.join("scaling_setspeed")).unwrap(), "5000000");
    }

    #[tokio::test]
    async fn test_missing_frequency_capability_only_warns() {
        let cgroups = tempfile::tempdir().unwrap();
        let sysfs = fake_sysfs(1, "performance powersave");
        let mut config = fake_config(cgroups.path(), sysfs.path());
        config.frequencies = vec![FrequencyPin { cpu: CpuId(0), khz: 1_000_000 }];

        let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;
        assert!(matches!(report.abort_cause, Some(SessionError::Inject(_))));
        assert!(report.history.contains(&SessionState::Launching));

        // No cpufreq tree at all
        let cgroups = tempfile::tempdir().unwrap();
        let mut config = fake_config(cgroups.path(), Path::new("/nonexistent/cpu"));
        config.frequencies = vec![FrequencyPin { cpu: CpuId(0), khz: 1_000_000 }];
        let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;
        assert!(report.history.contains(&SessionState::Launching));
    }

    #[tokio::test]
    async fn test_invalid_cpu_frequency_aborts() {
        let cgroups = tempfile::tempdir().unwrap();
        let sysfs = fake_sysfs(1, "userspace");
        let mut config = fake_config(cgroups.path(), sysfs.path());
        config.frequencies = vec![FrequencyPin { cpu: CpuId(7), khz: 1_000_000 }];

        let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;
        assert!(matches!(
            report.abort_cause,
            Some(SessionError::Frequency(FrequencyError::InvalidCpu { .. }))
        ));
        assert!(!report.history.contains(&SessionState::AttachingProbes));
    }

    #[tokio::test]
    async fn test_missing_artifact_aborts_attach() {
        let cgroups = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let mut config = fake_config(cgroups.path(), Path::new("/nonexistent"));
        config.monitor_options.artifact_dir = artifacts.path().to_path_buf();
        config.monitors = vec![crate::session::MonitorSpec {
            probe_set: crate::monitor::ProbeSet::Migration,
            output: artifacts.path().join("latency.csv"),
        }];

        let report = BenchmarkOrchestrator::new(config).run(std::future::pending()).await;
        assert!(matches!(
            report.abort_cause,
            Some(SessionError::Monitor(crate::domain::MonitorError::Load { .. }))
        ));
        // Group is created after probes attach
        assert!(report.group_id.is_none());
        assert!(!cgroups.path().join("bench-A").exists());
    }
}
