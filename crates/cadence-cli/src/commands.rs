use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use cadence_core::current_unix_timestamp_ms;
use cadence_runtime::{
    collect_status_report, render_status_report, CrashLog, CycleScheduler, LockManager,
    OrchestratorConfig, StatePaths, StopReason,
};
use cadence_state::RunStateStore;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli_args::Cli;

pub(crate) async fn run_cli(cli: Cli) -> Result<ExitCode> {
    if cli.status {
        return print_status(&StatePaths::new(cli.state_dir.clone()));
    }
    let config = cli.orchestrator_config();
    if cli.reset {
        return reset_run_state(&config);
    }
    if cli.unit_of_work.is_none() {
        bail!("--unit-of-work (or CADENCE_UNIT_OF_WORK) is required to run cycles");
    }
    config.validate().context("invalid orchestrator configuration")?;
    Ok(run_orchestrator(config).await)
}

fn print_status(paths: &StatePaths) -> Result<ExitCode> {
    let report = collect_status_report(paths, &LockManager::new(paths.lock()));
    println!("{}", render_status_report(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn reset_run_state(config: &OrchestratorConfig) -> Result<ExitCode> {
    let paths = config.paths();
    let lock = LockManager::new(paths.lock()).with_unreadable_grace(config.unreadable_lock_grace);
    let guard = lock
        .acquire()
        .context("refusing to reset while the run state is in use")?;

    let store = RunStateStore::new(paths.state());
    let loaded = store.load()?;
    let now_unix_ms = current_unix_timestamp_ms();
    let reset = RunStateStore::reset(
        &loaded.state,
        now_unix_ms,
        config.cold_start_deadline(now_unix_ms),
        config.planned_cycles(),
    );
    store.save(&reset)?;
    guard.release()?;

    info!(
        previous_cycle = loaded.state.current_cycle,
        preserved_learnings = reset.preserved_learnings.len(),
        "run state reset"
    );
    println!(
        "run state reset at cycle {}; kept {} preserved learnings",
        loaded.state.current_cycle,
        reset.preserved_learnings.len()
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_orchestrator(config: OrchestratorConfig) -> ExitCode {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, stopping after the in-flight cycle is terminated");
        let _ = cancel_tx.send(true);
    });

    let crash_log = CrashLog::for_config(&config);
    let label = config.label.clone();
    let scheduler = CycleScheduler::new(config);
    let result = scheduler.run(cancel_rx).await;
    signal_task.abort();

    match result {
        Ok(report) => {
            info!(
                stop_reason = report.stop_reason.as_str(),
                cycles_run = report.cycles_run,
                current_cycle = report.state.current_cycle,
                "orchestrator finished"
            );
            ExitCode::SUCCESS
        }
        Err(scheduler_error) => {
            let message = format!("{scheduler_error:#}");
            match scheduler_error.stop_reason() {
                StopReason::Busy => {
                    error!(%message, "another orchestrator is already running");
                }
                _ => {
                    error!(%message, "orchestrator stopped on a fatal error");
                    if let Err(log_error) = crash_log.append(label.as_deref(), &message) {
                        warn!(error = %format!("{log_error:#}"), "failed to append crash log");
                    }
                }
            }
            eprintln!("cadence: {message}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
