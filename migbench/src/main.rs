//! # migbench - Main Entry Point
//!
//! Parses the mode, runs the pre-flight checks, then hands a
//! [`SessionConfig`](migbench::session::SessionConfig) to the orchestrator
//! with Ctrl-C as the stop trigger.

use anyhow::Result;
use clap::Parser;
use log::warn;

use migbench::cli::{session_config, Args};
use migbench::preflight::run_preflight_checks;
use migbench::session::BenchmarkOrchestrator;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let config = session_config(&args)?;

    let probe_sets: Vec<_> = config.monitors.iter().map(|m| m.probe_set.clone()).collect();
    run_preflight_checks(
        &config.workload,
        &config.cgroup_root,
        &config.monitor_options.artifact_dir,
        &probe_sets,
    )?;

    println!("migbench v{}", env!("CARGO_PKG_VERSION"));
    println!("workload: {}", config.workload.display());
    println!("cgroup: {} (cpus {}, memory {})", config.group_name, config.cpuset, config.memory_max);
    for spec in &config.monitors {
        println!("{}: {}", spec.probe_set, spec.output.display());
    }

    let energy_output = config.energy.as_ref().and_then(|capture| capture.output.clone());

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    let report = BenchmarkOrchestrator::new(config).run(stop).await;

    if let Some(path) = &energy_output {
        if let Err(e) = report.append_energy_row(path) {
            warn!("⚠️  {e}");
        }
    }

    for monitor in &report.monitor_rows {
        println!("{}: {} row(s)", monitor.probe, monitor.rows);
    }
    if let Some(pid) = report.pid {
        println!("pid: {}", pid.0);
    }
    for e in &report.teardown_errors {
        eprintln!("warning: teardown: {e}");
    }

    match report.abort_cause {
        None => {
            println!("✅ Session completed");
            Ok(())
        }
        Some(cause) => Err(anyhow::Error::new(cause).context("Session aborted")),
    }
}
