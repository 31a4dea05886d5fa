//! Outcome of one session

use std::path::Path;

use log::info;

use super::SessionState;
use crate::domain::{GroupId, MonitorError, Pid, SessionError};
use crate::energy::EnergyDelta;
use crate::monitor::RowSink;

/// Columns of the per-session energy file
pub const ENERGY_HEADER: &[&str] = &["cgroup_id", "pid", "cpu", "core_energy", "package_energy_uj"];

/// Rows one monitor wrote during the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorRows {
    pub probe: &'static str,
    pub rows: u64,
}

#[derive(Debug)]
pub struct SessionReport {
    /// `Completed` or `Aborted`
    pub state: SessionState,
    /// States entered, starting with `Idle`
    pub history: Vec<SessionState>,
    /// First failure; set exactly when `state` is `Aborted`
    pub abort_cause: Option<SessionError>,
    /// Teardown failures, in the order they happened
    pub teardown_errors: Vec<SessionError>,
    pub group_id: Option<GroupId>,
    pub pid: Option<Pid>,
    pub energy: Option<EnergyDelta>,
    pub monitor_rows: Vec<MonitorRows>,
}

impl SessionReport {
    #[must_use]
    pub fn completed(&self) -> bool {
        self.state == SessionState::Completed
    }

    /// Append the energy window as one row of `path`
    ///
    /// Does nothing when the session captured no energy.
    ///
    /// # Errors
    /// [`MonitorError::Sink`] if the file cannot be opened or written
    pub fn append_energy_row(&self, path: &Path) -> Result<(), MonitorError> {
        let Some(energy) = self.energy else {
            return Ok(());
        };

        let mut sink = RowSink::open_with_header(path, ENERGY_HEADER)?;
        sink.append_record(&[
            self.group_id.map(|id| id.map_key().to_string()).unwrap_or_default(),
            self.pid.map(|pid| pid.0.to_string()).unwrap_or_default(),
            energy.cpu.0.to_string(),
            energy.core.to_string(),
            energy.package_uj.to_string(),
        ])?;
        info!("Energy: core {} (raw), package {} µJ -> {}", energy.core, energy.package_uj, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CpuId;

    fn report(energy: Option<EnergyDelta>) -> SessionReport {
        SessionReport {
            state: SessionState::Completed,
            history: Vec::new(),
            abort_cause: None,
            teardown_errors: Vec::new(),
            group_id: Some(GroupId(4242)),
            pid: Some(Pid(77)),
            energy,
            monitor_rows: Vec::new(),
        }
    }

    #[test]
    fn test_energy_row_appended_under_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.csv");
        let delta = EnergyDelta { cpu: CpuId(1), core: 900, package_uj: 15_000 };

        report(Some(delta)).append_energy_row(&path).unwrap();
        report(Some(delta)).append_energy_row(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "cgroup_id,pid,cpu,core_energy,package_energy_uj\n4242,77,1,900,15000\n4242,77,1,900,15000\n"
        );
    }

    #[test]
    fn test_no_energy_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.csv");
        report(None).append_energy_row(&path).unwrap();
        assert!(!path.exists());
    }
}
