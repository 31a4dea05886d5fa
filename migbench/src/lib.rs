//! # migbench - Kernel-level Migration Benchmarking Harness
//!
//! migbench measures what it costs, in time and energy, to move a sandboxed
//! workload (a stand-in for one serverless function invocation) between CPUs
//! and resource groups. It injects the workload into a fresh cgroup, pins
//! CPU frequencies, optionally moves the cgroup to other CPUs mid-run, and
//! records kernel telemetry filtered down to that one cgroup.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Workload (cgroup)                          │
//! │            injected with clone3(CLONE_INTO_CGROUP)              │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ scheduler, cache, PMU activity
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Pre-built eBPF artifacts (Kernel)                  │
//! │  • Raw tracepoints: sched_migrate_task, sched_switch            │
//! │  • Tracepoint/kprobe: sys_enter_execve, do_exit                 │
//! │  • Uprobes: function entry/return                               │
//! │  • Perf events: LLC and 19 hardware counters per CPU            │
//! │  filtered by cgroup id allow-lists                              │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffers, stats maps
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     migbench (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Session    │──▶│   Monitors   │──▶│  CSV sinks   │         │
//! │  │ orchestrator │   │  (consumers) │   │ (append-only)│         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │     │       │              ▲                                    │
//! │     ▼       ▼              │                                    │
//! │  cgroups  cpufreq    energy sampler (MSR 0x611, RAPL)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`isolation`]: cgroup v2 lifecycle and atomic injection into a cgroup
//! - [`cpufreq`]: governor and frequency control through sysfs
//! - [`energy`]: core and package energy counters
//! - [`monitor`]: the five kernel probe sets and their consumers
//! - [`sampler`]: joint energy and hardware counter sampling
//! - [`session`]: the benchmark state machine
//! - [`preflight`]: environment checks before a session starts
//! - [`cli`]: command-line parsing
//! - [`domain`]: newtypes and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Provoke one migration from CPU 0 to CPU 1 and record its latency
//! sudo migbench migration --cpuset 0 --new-cpuset 1 ./bench.py
//!
//! # Process lifetime, hardware counters and energy on CPU 2
//! sudo migbench proc --cpuset 2 --cpu-freq 1800000 ./bench.py
//! ```

// Expose modules for testing
pub mod cli;
pub mod cpufreq;
pub mod domain;
pub mod energy;
pub mod isolation;
pub mod monitor;
pub mod preflight;
pub mod sampler;
pub mod session;
