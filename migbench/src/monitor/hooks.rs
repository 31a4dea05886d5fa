//! # Program Loading and Attachment
//!
//! Installs the programs of one [`ProbeSet`] at their hook points and keeps
//! the link ids so the monitor can detach them again in reverse order.
//!
//! ## Functions
//!
//! - [`install()`] - Load and attach every hook of a probe set
//! - [`detach_all()`] - Detach installed hooks, last installed first
//!
//! Perf-event hooks attach once per online CPU. A CPU whose PMU does not
//! implement the requested counter is skipped with a warning; every other
//! attach failure aborts the install. Links created before the failure stay
//! in the output vector so the caller can release them.

use std::error::Error as _;
use std::io;

use aya::programs::kprobe::KProbeLinkId;
use aya::programs::perf_event::{PerfEventLinkId, PerfEventScope, PerfTypeId, SamplePolicy};
use aya::programs::raw_trace_point::RawTracePointLinkId;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::{KProbe, PerfEvent, ProgramError, RawTracePoint, TracePoint, UProbe};
use aya::Ebpf;
use log::{debug, info, warn};

use super::probe_set::{Hook, HookPoint, PerfCounter, PerfKind, ProbeSet, Sampling};
use crate::domain::{CpuId, MonitorError};

/// Link returned by a successful attach
#[derive(Debug)]
pub enum LinkId {
    RawTracePoint(RawTracePointLinkId),
    TracePoint(TracePointLinkId),
    KProbe(KProbeLinkId),
    UProbe(UProbeLinkId),
    PerfEvent(PerfEventLinkId),
}

/// One attached hook
#[derive(Debug)]
pub struct InstalledHook {
    pub program: &'static str,
    /// Human readable hook point, e.g. `sched_switch` or `on_cycles@CPU:3`
    pub label: String,
    pub link: LinkId,
}

/// Load and attach every hook of `probe_set`
///
/// Per-CPU hooks are attached on each entry of `cpus`. Links are pushed to
/// `installed` as they are created, so a partial install can be undone with
/// [`detach_all`].
///
/// # Errors
/// [`MonitorError::ProgramNotFound`] for a missing program and
/// [`MonitorError::Attach`] for a failed load or attach
pub fn install(
    bpf: &mut Ebpf,
    probe_set: &ProbeSet,
    cpus: &[CpuId],
    installed: &mut Vec<InstalledHook>,
) -> Result<(), MonitorError> {
    for hook in probe_set.hooks() {
        install_hook(bpf, probe_set, hook, cpus, installed)?;
    }
    info!("✓ {probe_set}: {} link(s) attached", installed.len());
    Ok(())
}

fn install_hook(
    bpf: &mut Ebpf,
    probe_set: &ProbeSet,
    hook: &Hook,
    cpus: &[CpuId],
    installed: &mut Vec<InstalledHook>,
) -> Result<(), MonitorError> {
    let program = bpf.program_mut(hook.program).ok_or(MonitorError::ProgramNotFound(hook.program))?;
    let attach_err = |label: &str| {
        let label = label.to_string();
        move |source| MonitorError::Attach { hook: label, source }
    };

    match hook.point {
        HookPoint::RawTracePoint { tracepoint } => {
            let program: &mut RawTracePoint = program.try_into().map_err(attach_err(tracepoint))?;
            program.load().map_err(attach_err(tracepoint))?;
            let link = program.attach(tracepoint).map_err(attach_err(tracepoint))?;
            info!("✓ Attached raw tracepoint: {tracepoint}");
            installed.push(InstalledHook {
                program: hook.program,
                label: tracepoint.to_string(),
                link: LinkId::RawTracePoint(link),
            });
        }
        HookPoint::TracePoint { category, name } => {
            let label = format!("{category}/{name}");
            let program: &mut TracePoint = program.try_into().map_err(attach_err(&label))?;
            program.load().map_err(attach_err(&label))?;
            let link = program.attach(category, name).map_err(attach_err(&label))?;
            info!("✓ Attached tracepoint: {label}");
            installed.push(InstalledHook { program: hook.program, label, link: LinkId::TracePoint(link) });
        }
        HookPoint::KProbe { function } => {
            let program: &mut KProbe = program.try_into().map_err(attach_err(function))?;
            program.load().map_err(attach_err(function))?;
            let link = program.attach(function, 0).map_err(attach_err(function))?;
            info!("✓ Attached kprobe: {function}");
            installed.push(InstalledHook {
                program: hook.program,
                label: function.to_string(),
                link: LinkId::KProbe(link),
            });
        }
        HookPoint::UProbe { ret } => {
            let ProbeSet::Function { binary, symbol } = probe_set else {
                return Err(MonitorError::ProgramNotFound(hook.program));
            };
            let kind = if ret { "uretprobe" } else { "uprobe" };
            let label = format!("{kind} {}:{symbol}", binary.display());
            let program: &mut UProbe = program.try_into().map_err(attach_err(&label))?;
            program.load().map_err(attach_err(&label))?;
            let link = program
                .attach(Some(symbol.as_str()), 0, binary, None)
                .map_err(attach_err(&label))?;
            info!("✓ Attached {label}");
            installed.push(InstalledHook { program: hook.program, label, link: LinkId::UProbe(link) });
        }
        HookPoint::PerfEvent(counter) => {
            let program: &mut PerfEvent = program.try_into().map_err(attach_err(hook.program))?;
            program.load().map_err(attach_err(hook.program))?;

            let mut attached = 0usize;
            for cpu in cpus {
                let label = format!("{}@{cpu}", hook.program);
                match program.attach(
                    perf_type(counter),
                    counter.config,
                    PerfEventScope::AllProcessesOneCpu { cpu: cpu.0 },
                    sample_policy(counter),
                    false,
                ) {
                    Ok(link) => {
                        attached += 1;
                        installed.push(InstalledHook {
                            program: hook.program,
                            label,
                            link: LinkId::PerfEvent(link),
                        });
                    }
                    Err(e) if is_unsupported_counter(&e) => {
                        warn!("⚠️  {label}: counter not supported on this CPU, skipping ({e})");
                    }
                    Err(source) => return Err(MonitorError::Attach { hook: label, source }),
                }
            }
            debug!("{}: attached on {attached}/{} CPUs", hook.program, cpus.len());
        }
    }

    Ok(())
}

fn perf_type(counter: PerfCounter) -> PerfTypeId {
    match counter.kind {
        PerfKind::Hardware => PerfTypeId::Hardware,
        PerfKind::HwCache => PerfTypeId::HwCache,
    }
}

fn sample_policy(counter: PerfCounter) -> SamplePolicy {
    match counter.sampling {
        Sampling::Period(period) => SamplePolicy::Period(period),
        Sampling::Frequency(hz) => SamplePolicy::Frequency(hz),
    }
}

/// `perf_event_open` failed because the PMU lacks the counter
fn is_unsupported_counter(err: &ProgramError) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return is_unsupported_errno(io.raw_os_error());
        }
        source = cause.source();
    }
    false
}

fn is_unsupported_errno(errno: Option<i32>) -> bool {
    matches!(errno, Some(libc::ENOENT | libc::EOPNOTSUPP | libc::ENODEV))
}

/// Detach `installed` in reverse install order
///
/// Every hook is attempted; the first failure is returned.
///
/// # Errors
/// [`MonitorError::Detach`] for the first link that could not be released
pub fn detach_all(bpf: &mut Ebpf, installed: &mut Vec<InstalledHook>) -> Result<(), MonitorError> {
    let mut first_err = None;

    while let Some(hook) = installed.pop() {
        let label = hook.label.clone();
        if let Err(e) = detach_one(bpf, hook) {
            warn!("⚠️  Failed to detach {label}: {e}");
            first_err.get_or_insert(e);
        } else {
            debug!("Detached {label}");
        }
    }

    first_err.map_or(Ok(()), Err)
}

fn detach_one(bpf: &mut Ebpf, hook: InstalledHook) -> Result<(), MonitorError> {
    let InstalledHook { program, label, link } = hook;
    let program = bpf.program_mut(program).ok_or(MonitorError::ProgramNotFound(program))?;
    let detach_err = |source| MonitorError::Detach { hook: label.clone(), source };

    match link {
        LinkId::RawTracePoint(id) => {
            let program: &mut RawTracePoint = program.try_into().map_err(detach_err)?;
            program.detach(id).map_err(detach_err)
        }
        LinkId::TracePoint(id) => {
            let program: &mut TracePoint = program.try_into().map_err(detach_err)?;
            program.detach(id).map_err(detach_err)
        }
        LinkId::KProbe(id) => {
            let program: &mut KProbe = program.try_into().map_err(detach_err)?;
            program.detach(id).map_err(detach_err)
        }
        LinkId::UProbe(id) => {
            let program: &mut UProbe = program.try_into().map_err(detach_err)?;
            program.detach(id).map_err(detach_err)
        }
        LinkId::PerfEvent(id) => {
            let program: &mut PerfEvent = program.try_into().map_err(detach_err)?;
            program.detach(id).map_err(detach_err)
        }
    }
}
