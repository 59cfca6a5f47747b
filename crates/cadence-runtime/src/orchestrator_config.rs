//! Validated orchestrator configuration and the state directory layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use cadence_core::LogRetention;
use cadence_state::{
    CompactionPolicy, ARCHIVE_FILE_NAME, CYCLE_REPORT_FILE_NAME, RUN_STATE_FILE_NAME,
};

use crate::completion_runtime::CompletionConfig;
use crate::lock_runtime::{DEFAULT_UNREADABLE_LOCK_GRACE, LOCK_FILE_NAME};
use crate::supervisor_runtime::UnitOfWorkSpec;

pub const DEFAULT_STATE_DIR: &str = ".cadence";
pub const CYCLE_EVENTS_FILE_NAME: &str = "cycle-events.jsonl";
pub const RUN_SUMMARY_FILE_NAME: &str = "summary.md";
pub const CRASH_LOG_FILE_NAME: &str = "crash-log.jsonl";

/// Paths of every document the orchestrator keeps under its state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> PathBuf {
        self.root.join(RUN_STATE_FILE_NAME)
    }

    pub fn archive(&self) -> PathBuf {
        self.root.join(ARCHIVE_FILE_NAME)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }

    pub fn cycle_report(&self) -> PathBuf {
        self.root.join(CYCLE_REPORT_FILE_NAME)
    }

    pub fn cycle_events(&self) -> PathBuf {
        self.root.join(CYCLE_EVENTS_FILE_NAME)
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join(RUN_SUMMARY_FILE_NAME)
    }

    pub fn crash_log(&self) -> PathBuf {
        self.root.join(CRASH_LOG_FILE_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub state_dir: PathBuf,
    pub label: Option<String>,
    pub unit_of_work: UnitOfWorkSpec,
    /// Sleep after a successful cycle.
    pub interval: Duration,
    /// Fixed sleep after a failed cycle.
    pub failure_backoff: Duration,
    pub cycle_timeout: Duration,
    /// Time a terminated child gets between SIGTERM and SIGKILL.
    pub shutdown_grace: Duration,
    pub max_cycles: Option<u64>,
    pub run_duration: Option<Duration>,
    pub deadline_unix_ms: Option<u64>,
    pub completion: CompletionConfig,
    pub compaction: CompactionPolicy,
    /// Rotation of `cycle-events.jsonl` and `crash-log.jsonl`.
    pub log_retention: LogRetention,
    pub unreadable_lock_grace: Duration,
}

impl OrchestratorConfig {
    pub fn new(state_dir: impl Into<PathBuf>, unit_of_work: UnitOfWorkSpec) -> Self {
        Self {
            state_dir: state_dir.into(),
            label: None,
            unit_of_work,
            interval: Duration::from_millis(150_000),
            failure_backoff: Duration::from_millis(30_000),
            cycle_timeout: Duration::from_millis(1_800_000),
            shutdown_grace: Duration::from_millis(5_000),
            max_cycles: None,
            run_duration: None,
            deadline_unix_ms: None,
            completion: CompletionConfig::default(),
            compaction: CompactionPolicy::default(),
            log_retention: LogRetention::default(),
            unreadable_lock_grace: DEFAULT_UNREADABLE_LOCK_GRACE,
        }
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::new(self.state_dir.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_of_work.program.trim().is_empty() {
            bail!("unit-of-work program cannot be empty");
        }
        if self.interval.is_zero() {
            bail!("interval must be greater than 0");
        }
        if self.failure_backoff.is_zero() {
            bail!("failure_backoff must be greater than 0");
        }
        if self.cycle_timeout.is_zero() {
            bail!("cycle_timeout must be greater than 0");
        }
        if self.max_cycles == Some(0) {
            bail!("max_cycles must be greater than 0 when set");
        }
        if self.run_duration.is_some_and(|duration| duration.is_zero()) {
            bail!("run_duration must be greater than 0 when set");
        }
        if self.compaction.max_live_improvements == 0 {
            bail!("max_live_improvements must be greater than 0");
        }
        if self.compaction.max_live_errors == 0 {
            bail!("max_live_errors must be greater than 0");
        }
        if self.compaction.max_preserved_learnings == 0 {
            bail!("max_preserved_learnings must be greater than 0");
        }
        if self.compaction.size_threshold_bytes == 0 {
            bail!("compaction_size_threshold_bytes must be greater than 0");
        }
        self.completion.validate()
    }

    /// Cycle count recorded at cold start: the explicit ceiling, else the
    /// number of intervals that fit in the run duration, else 0 (unbounded).
    pub fn planned_cycles(&self) -> u64 {
        if let Some(max_cycles) = self.max_cycles {
            return max_cycles;
        }
        let Some(run_duration) = self.run_duration else {
            return 0;
        };
        let interval_ms = self.interval.as_millis().max(1);
        u64::try_from(run_duration.as_millis() / interval_ms).unwrap_or(u64::MAX)
    }

    /// Absolute deadline recorded at cold start.
    pub fn cold_start_deadline(&self, now_unix_ms: u64) -> Option<u64> {
        self.deadline_unix_ms.or_else(|| {
            self.run_duration.map(|duration| {
                now_unix_ms.saturating_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            })
        })
    }
}
