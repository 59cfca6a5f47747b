//! The supervisory control loop.
//!
//! `Idle -> Acquiring -> Running(i) -> [Sleeping -> Running(i+1)]* -> Stopped(reason)`.
//! Cycle `i` is persisted before cycle `i + 1` starts. The lock is released
//! on every exit path, including fatal ones.

use std::sync::Arc;

use cadence_core::{current_unix_timestamp_ms, is_deadline_reached};
use cadence_state::{
    clear_stale_cycle_report, ingest_cycle_report, ArchiveStore, CompactionOutcome,
    CycleReportIngest, RunState, RunStateStore, StateCompactor, COUNTER_COMPACTION_FAILED,
    COUNTER_CYCLE_CANCELLED, COUNTER_CYCLE_FAILED, COUNTER_CYCLE_SUCCEEDED,
    COUNTER_CYCLE_TIMED_OUT,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::completion_runtime::{
    CompletionDetector, CompletionSignalSource, CompletionVerdict, ExternalCompletionSignals,
};
use crate::lock_runtime::{LockError, LockManager};
use crate::orchestrator_config::{OrchestratorConfig, StatePaths};
use crate::run_report_runtime::{
    write_run_summary, CompactionEvent, CompletionEvent, CycleEvent, CycleEventLog,
};
use crate::supervisor_runtime::{
    wait_for_cancellation, CycleOutcome, CycleTermination, ProcessSupervisor, UnitOfWorkMissing,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Completed,
    Cancelled,
    MaxCyclesReached,
    DeadlineReached,
    Busy,
    Fatal,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::MaxCyclesReached => "max-cycles-reached",
            Self::DeadlineReached => "deadline-reached",
            Self::Busy => "busy",
            Self::Fatal => "fatal",
        }
    }

    /// Graceful stops exit 0; busy and fatal stops exit 1.
    pub fn is_graceful(self) -> bool {
        !matches!(self, Self::Busy | Self::Fatal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Acquiring,
    Running { cycle: u64 },
    Sleeping { cycle: u64 },
    Stopped(StopReason),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    UnitOfWorkMissing(#[from] UnitOfWorkMissing),
    #[error("run state persistence failed: {detail}")]
    StateIo { detail: String },
}

impl SchedulerError {
    pub fn stop_reason(&self) -> StopReason {
        match self {
            Self::Lock(LockError::Busy { .. }) => StopReason::Busy,
            _ => StopReason::Fatal,
        }
    }

    fn state_io(error: anyhow::Error) -> Self {
        Self::StateIo {
            detail: format!("{error:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerReport {
    pub stop_reason: StopReason,
    /// Cycles run by this invocation, not since cold start.
    pub cycles_run: u64,
    pub state: RunState,
    pub last_verdict: Option<CompletionVerdict>,
}

pub struct CycleScheduler {
    config: OrchestratorConfig,
    paths: StatePaths,
    lock: LockManager,
    store: RunStateStore,
    compactor: StateCompactor,
    supervisor: ProcessSupervisor,
    detector: CompletionDetector,
    signals: Arc<dyn CompletionSignalSource>,
    events: CycleEventLog,
    phase_tx: watch::Sender<SchedulerPhase>,
}

impl CycleScheduler {
    pub fn new(config: OrchestratorConfig) -> Self {
        let paths = config.paths();
        let lock =
            LockManager::new(paths.lock()).with_unreadable_grace(config.unreadable_lock_grace);
        let store = RunStateStore::new(paths.state());
        let compactor = StateCompactor::new(config.compaction, ArchiveStore::new(paths.archive()));
        let supervisor = ProcessSupervisor::new(config.shutdown_grace)
            .with_cycle_report_path(paths.cycle_report())
            .with_label(config.label.clone());
        let detector = CompletionDetector::new(config.completion.clone());
        let signals: Arc<dyn CompletionSignalSource> =
            Arc::new(ExternalCompletionSignals::from_config(&config.completion));
        let events = CycleEventLog::for_config(&config);
        let (phase_tx, _) = watch::channel(SchedulerPhase::Idle);
        Self {
            config,
            paths,
            lock,
            store,
            compactor,
            supervisor,
            detector,
            signals,
            events,
            phase_tx,
        }
    }

    pub fn with_signal_source(mut self, signals: Arc<dyn CompletionSignalSource>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_lock_manager(mut self, lock: LockManager) -> Self {
        self.lock = lock;
        self
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        self.phase_tx.send_replace(phase);
    }

    /// Runs cycles until a stop condition holds. `cancellation` flipping to
    /// `true` terminates any in-flight child and stops with `Cancelled`.
    #[instrument(skip_all, fields(state_dir = %self.paths.root().display()))]
    pub async fn run(
        &self,
        mut cancellation: watch::Receiver<bool>,
    ) -> Result<SchedulerReport, SchedulerError> {
        self.set_phase(SchedulerPhase::Idle);
        self.set_phase(SchedulerPhase::Acquiring);
        let guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(error) => {
                let error = SchedulerError::from(error);
                warn!(%error, "could not acquire orchestrator lock");
                self.set_phase(SchedulerPhase::Stopped(error.stop_reason()));
                return Err(error);
            }
        };

        let result = self.run_locked(&mut cancellation).await;
        let stop_reason = match &result {
            Ok(report) => report.stop_reason,
            Err(error) => error.stop_reason(),
        };
        if let Err(error) = &result {
            warn!(%error, "scheduler stopping on a fatal error");
            self.record_fatal_stop();
        }
        if let Err(error) = guard.release() {
            warn!(%error, "failed to release orchestrator lock");
        }
        self.set_phase(SchedulerPhase::Stopped(stop_reason));
        result
    }

    async fn run_locked(
        &self,
        cancellation: &mut watch::Receiver<bool>,
    ) -> Result<SchedulerReport, SchedulerError> {
        self.supervisor.preflight(&self.config.unit_of_work)?;

        let loaded = self.store.load().map_err(SchedulerError::state_io)?;
        let now_unix_ms = current_unix_timestamp_ms();
        let cold_start = loaded.is_cold_start();
        let mut state = if cold_start {
            RunState::cold_start(
                now_unix_ms,
                self.config.cold_start_deadline(now_unix_ms),
                self.config.planned_cycles(),
            )
        } else {
            loaded.state
        };
        if self.config.label.is_some() {
            state.label = self.config.label.clone();
        }
        state.last_stop_reason = None;
        state.updated_unix_ms = now_unix_ms;
        self.store.save(&state).map_err(SchedulerError::state_io)?;

        let max_cycles = self.effective_max_cycles(&state);
        info!(
            cold_start,
            current_cycle = state.current_cycle,
            max_cycles = ?max_cycles,
            deadline_unix_ms = ?state.deadline_unix_ms,
            "scheduler starting"
        );

        let mut cycles_run = 0_u64;
        let mut last_verdict = None;
        let stop_reason = loop {
            if let Some(reason) = self.stop_condition(&state, max_cycles, cancellation) {
                break reason;
            }
            self.clear_stale_report();

            let cycle = state.begin_cycle();
            self.set_phase(SchedulerPhase::Running { cycle });
            let outcome = self
                .supervisor
                .run_cycle(
                    &self.config.unit_of_work,
                    cycle,
                    self.config.cycle_timeout,
                    cancellation,
                )
                .await;
            cycles_run = cycles_run.saturating_add(1);

            let finished_unix_ms = current_unix_timestamp_ms();
            record_outcome(&mut state, &outcome, finished_unix_ms);
            let ingest = self.ingest_report(&mut state, cycle, finished_unix_ms);
            state.updated_unix_ms = finished_unix_ms;
            self.store.save(&state).map_err(SchedulerError::state_io)?;

            let (compaction, compaction_error) = self.compact(&mut state)?;

            let mut completion = None;
            let cancelled = outcome.termination == CycleTermination::Cancelled;
            if !cancelled && self.detector.config().is_check_due(cycle) {
                let verdict = tokio::select! {
                    signals = self.signals.collect() => Some(self.detector.evaluate(&signals)),
                    _ = wait_for_cancellation(cancellation) => None,
                };
                if let Some(verdict) = verdict {
                    completion = Some(CompletionEvent {
                        score: verdict.score,
                        passed: verdict.passed,
                    });
                    last_verdict = Some(verdict);
                }
            }

            self.append_event(&outcome, &ingest, compaction, compaction_error, completion.clone());

            if cancelled {
                break StopReason::Cancelled;
            }
            if completion.is_some_and(|completion| completion.passed) {
                break StopReason::Completed;
            }
            if let Some(reason) = self.stop_condition(&state, max_cycles, cancellation) {
                break reason;
            }

            let delay = if outcome.success {
                self.config.interval
            } else {
                self.config.failure_backoff
            };
            self.set_phase(SchedulerPhase::Sleeping { cycle });
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = wait_for_cancellation(cancellation) => true,
            };
            if interrupted {
                break StopReason::Cancelled;
            }
        };

        state.last_stop_reason = Some(stop_reason.as_str().to_string());
        state.updated_unix_ms = current_unix_timestamp_ms();
        self.store.save(&state).map_err(SchedulerError::state_io)?;
        self.write_summary(&state, stop_reason);
        info!(
            stop_reason = stop_reason.as_str(),
            cycles_run,
            current_cycle = state.current_cycle,
            "scheduler stopped"
        );
        Ok(SchedulerReport {
            stop_reason,
            cycles_run,
            state,
            last_verdict,
        })
    }

    fn write_summary(&self, state: &RunState, stop_reason: StopReason) {
        let archive = match ArchiveStore::new(self.paths.archive()).read_existing() {
            Ok(archive) => archive,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "archive unreadable for run summary");
                None
            }
        };
        if let Err(error) =
            write_run_summary(&self.paths.summary(), state, archive.as_ref(), stop_reason)
        {
            warn!(error = %format!("{error:#}"), "failed to write run summary");
        }
    }

    /// Marks the last persisted RunState as stopped by a fatal error and
    /// writes the summary. Best effort; never creates a RunState.
    fn record_fatal_stop(&self) {
        let mut state = match self.store.read_existing() {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "run state unreadable after fatal stop");
                return;
            }
        };
        state.last_stop_reason = Some(StopReason::Fatal.as_str().to_string());
        state.updated_unix_ms = current_unix_timestamp_ms();
        if let Err(error) = self.store.save(&state) {
            warn!(error = %format!("{error:#}"), "could not record fatal stop in run state");
        }
        self.write_summary(&state, StopReason::Fatal);
    }

    /// The configured ceiling, else the cycle count planned at cold start.
    fn effective_max_cycles(&self, state: &RunState) -> Option<u64> {
        self.config
            .max_cycles
            .or((state.total_cycles_planned > 0).then_some(state.total_cycles_planned))
    }

    fn stop_condition(
        &self,
        state: &RunState,
        max_cycles: Option<u64>,
        cancellation: &watch::Receiver<bool>,
    ) -> Option<StopReason> {
        if *cancellation.borrow() {
            return Some(StopReason::Cancelled);
        }
        if max_cycles.is_some_and(|max_cycles| state.current_cycle >= max_cycles) {
            return Some(StopReason::MaxCyclesReached);
        }
        if is_deadline_reached(state.deadline_unix_ms, current_unix_timestamp_ms()) {
            return Some(StopReason::DeadlineReached);
        }
        None
    }

    fn clear_stale_report(&self) {
        if let Err(error) = clear_stale_cycle_report(&self.paths.cycle_report()) {
            warn!(error = %format!("{error:#}"), "could not clear stale cycle report");
        }
    }

    fn ingest_report(
        &self,
        state: &mut RunState,
        cycle: u64,
        now_unix_ms: u64,
    ) -> CycleReportIngest {
        match ingest_cycle_report(&self.paths.cycle_report(), state, cycle, now_unix_ms) {
            Ok(ingest) => ingest,
            Err(error) => {
                let reason = format!("{error:#}");
                warn!(cycle, %reason, "cycle report ingest failed");
                state.append_error(cycle, reason.clone(), now_unix_ms);
                CycleReportIngest::Malformed { reason }
            }
        }
    }

    /// Compacts and re-saves when anything moved. Archive failures are
    /// recorded on the state and retried at the next breach.
    fn compact(
        &self,
        state: &mut RunState,
    ) -> Result<(Option<CompactionEvent>, Option<String>), SchedulerError> {
        match self.compactor.maybe_compact(state) {
            Ok(CompactionOutcome::Unchanged) => Ok((None, None)),
            Ok(CompactionOutcome::Compacted(compacted)) => {
                let event = CompactionEvent {
                    sequence: compacted.sequence,
                    archived_improvements: compacted.archived_improvements,
                    archived_errors: compacted.archived_errors,
                    archived_learnings: compacted.archived_learnings,
                };
                *state = compacted.state;
                self.store.save(state).map_err(SchedulerError::state_io)?;
                Ok((Some(event), None))
            }
            Err(error) => {
                let message = format!("compaction failed: {error}");
                warn!(%message, "state compaction failed, state left untouched");
                let cycle = state.current_cycle;
                state.append_error(cycle, message.clone(), current_unix_timestamp_ms());
                state.increment_counter(COUNTER_COMPACTION_FAILED, 1);
                self.store.save(state).map_err(SchedulerError::state_io)?;
                Ok((None, Some(message)))
            }
        }
    }

    fn append_event(
        &self,
        outcome: &CycleOutcome,
        ingest: &CycleReportIngest,
        compaction: Option<CompactionEvent>,
        compaction_error: Option<String>,
        completion: Option<CompletionEvent>,
    ) {
        let event = CycleEvent {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            cycle: outcome.cycle,
            reason_code: outcome.termination.as_str(),
            success: outcome.success,
            duration_ms: outcome.duration_ms,
            error_message: outcome.error_message.clone(),
            improvements_added: ingest.improvements_added(),
            cycle_report: match ingest {
                CycleReportIngest::Absent => "absent",
                CycleReportIngest::Ingested { .. } => "ingested",
                CycleReportIngest::Malformed { .. } => "malformed",
            },
            compaction,
            compaction_error,
            completion,
        };
        if let Err(error) = self.events.append(&event) {
            warn!(error = %format!("{error:#}"), "failed to append cycle event");
        }
    }
}

/// Folds one cycle outcome into the counters and error log.
fn record_outcome(state: &mut RunState, outcome: &CycleOutcome, now_unix_ms: u64) {
    let counter = match outcome.termination {
        CycleTermination::Exited { code: Some(0) } => COUNTER_CYCLE_SUCCEEDED,
        CycleTermination::TimedOut => COUNTER_CYCLE_TIMED_OUT,
        CycleTermination::Cancelled => COUNTER_CYCLE_CANCELLED,
        CycleTermination::Exited { .. } | CycleTermination::SpawnFailed => COUNTER_CYCLE_FAILED,
    };
    state.increment_counter(counter, 1);
    if outcome.success {
        info!(cycle = outcome.cycle, duration_ms = outcome.duration_ms, "cycle succeeded");
        return;
    }
    let message = outcome
        .error_message
        .clone()
        .unwrap_or_else(|| outcome.termination.as_str().to_string());
    warn!(cycle = outcome.cycle, %message, "cycle failed");
    state.append_error(outcome.cycle, message, now_unix_ms);
}
