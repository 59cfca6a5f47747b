//! Operator-facing artifacts: per-cycle event log, end-of-run summary, crash
//! log, and the `--status` report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_core::{
    current_unix_timestamp_ms, format_unix_ms_rfc3339, write_text_atomic, LogRetention, NdjsonLog,
};
use cadence_state::{ArchiveDocument, ArchiveStore, RunState, RunStateStore};
use serde::Serialize;

use crate::lock_runtime::{Liveness, LockInspection, LockManager};
use crate::orchestrator_config::{OrchestratorConfig, StatePaths};
use crate::scheduler_runtime::StopReason;

pub const STATUS_REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionEvent {
    pub sequence: u64,
    pub archived_improvements: u64,
    pub archived_errors: u64,
    pub archived_learnings: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub score: f64,
    pub passed: bool,
}

/// One line of `cycle-events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleEvent {
    pub timestamp_unix_ms: u64,
    pub cycle: u64,
    pub reason_code: &'static str,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub improvements_added: usize,
    pub cycle_report: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionEvent>,
}

/// `cycle-events.jsonl`, one [`CycleEvent`] per line.
#[derive(Debug, Clone)]
pub struct CycleEventLog {
    log: NdjsonLog,
}

impl CycleEventLog {
    pub fn new(path: impl Into<PathBuf>, retention: LogRetention) -> Self {
        Self {
            log: NdjsonLog::new(path, retention),
        }
    }

    pub fn for_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.paths().cycle_events(), config.log_retention)
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn append(&self, event: &CycleEvent) -> Result<()> {
        self.log.append(event)
    }
}

/// Renders the markdown summary written when the scheduler stops.
pub fn render_run_summary(
    state: &RunState,
    archive: Option<&ArchiveDocument>,
    stop_reason: StopReason,
    stopped_unix_ms: u64,
) -> String {
    let by_type = state.improvements_by_kind();
    let title = match state.label.as_deref() {
        Some(label) => format!("# Cadence run summary: {label}"),
        None => "# Cadence run summary".to_string(),
    };
    let mut lines = vec![
        title,
        String::new(),
        format!("- **Stopped**: {}", format_unix_ms_rfc3339(stopped_unix_ms)),
        format!("- **Stop reason**: {}", stop_reason.as_str()),
        format!("- **Started**: {}", format_unix_ms_rfc3339(state.start_unix_ms)),
        format!(
            "- **Deadline**: {}",
            state
                .deadline_unix_ms
                .map(format_unix_ms_rfc3339)
                .unwrap_or_else(|| "none".to_string())
        ),
        format!(
            "- **Cycles**: {} of {}",
            state.current_cycle,
            planned_label(state.total_cycles_planned)
        ),
        format!("- **Total improvements**: {}", state.total_improvements_appended()),
        format!("- **Errors recorded**: {}", state.total_errors_appended()),
        format!(
            "- **Archived**: {} improvements, {} errors in {} compactions",
            state.total_archived_improvements(),
            state.total_archived_errors(),
            state
                .archived_summary
                .as_ref()
                .map(|summary| summary.archive_entry_count)
                .unwrap_or(0)
        ),
    ];
    if let Some(archive) = archive {
        lines.push(format!(
            "- **Archive, all runs**: {} improvements, {} errors, {} learnings in {} compactions",
            archive.total_archived,
            archive.total_archived_errors,
            archive.total_archived_learnings(),
            archive.last_sequence()
        ));
    }
    lines.extend([
        String::new(),
        "## Improvements by type".to_string(),
        String::new(),
    ]);
    if by_type.is_empty() {
        lines.push("None recorded".to_string());
    } else {
        lines.extend(
            by_type
                .iter()
                .map(|(kind, count)| format!("- **{kind}**: {count}")),
        );
    }

    let counters = &state.counters_by_category;
    if !counters.is_empty() {
        lines.push(String::new());
        lines.push("## Counters".to_string());
        lines.push(String::new());
        lines.extend(
            counters
                .iter()
                .map(|(category, count)| format!("- {category}: {count}")),
        );
    }

    if let Some(last_error) = state.errors.last() {
        lines.push(String::new());
        lines.push("## Last error".to_string());
        lines.push(String::new());
        lines.push(format!("cycle {}: {}", last_error.cycle, last_error.message));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn planned_label(total_cycles_planned: u64) -> String {
    if total_cycles_planned == 0 {
        "unbounded".to_string()
    } else {
        total_cycles_planned.to_string()
    }
}

pub fn write_run_summary(
    path: &Path,
    state: &RunState,
    archive: Option<&ArchiveDocument>,
    stop_reason: StopReason,
) -> Result<()> {
    let summary = render_run_summary(state, archive, stop_reason, current_unix_timestamp_ms());
    write_text_atomic(path, &summary)
        .with_context(|| format!("failed to write run summary {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CrashLogEntry<'a> {
    timestamp_unix_ms: u64,
    label: Option<&'a str>,
    error: &'a str,
}

/// `crash-log.jsonl`: one line per fatal stop.
#[derive(Debug, Clone)]
pub struct CrashLog {
    log: NdjsonLog,
}

impl CrashLog {
    pub fn new(path: impl Into<PathBuf>, retention: LogRetention) -> Self {
        Self {
            log: NdjsonLog::new(path, retention),
        }
    }

    pub fn for_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.paths().crash_log(), config.log_retention)
    }

    pub fn append(&self, label: Option<&str>, error: &str) -> Result<()> {
        self.log.append(&CrashLogEntry {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            label,
            error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockStatusReport {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_liveness: Option<Liveness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_unix_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStateStatus {
    pub current_cycle: u64,
    pub total_cycles_planned: u64,
    pub start_unix_ms: u64,
    pub deadline_unix_ms: Option<u64>,
    pub updated_unix_ms: u64,
    pub live_improvements: usize,
    pub live_errors: usize,
    pub total_improvements: u64,
    pub total_errors: u64,
    pub counters_by_category: BTreeMap<String, u64>,
    pub preserved_learnings: usize,
    pub label: Option<String>,
    pub last_stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveStatus {
    pub entries: usize,
    pub total_archived: u64,
    pub total_archived_errors: u64,
    pub total_archived_learnings: u64,
    pub counts_by_type: BTreeMap<String, u64>,
}

/// Snapshot printed by `--status`; every document is re-read on each call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub schema_version: u32,
    pub generated_unix_ms: u64,
    pub state_dir: String,
    pub lock: LockStatusReport,
    pub run_state: Option<RunStateStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_state_error: Option<String>,
    pub archive: Option<ArchiveStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_error: Option<String>,
}

pub fn collect_status_report(paths: &StatePaths, lock: &LockManager) -> StatusReport {
    let lock_report = match lock.inspect() {
        Ok(LockInspection::Vacant) => lock_status("vacant"),
        Ok(LockInspection::Unreadable) => lock_status("unreadable"),
        Ok(LockInspection::Held { record, liveness }) => LockStatusReport {
            owner_pid: Some(record.owner_pid),
            owner_liveness: Some(liveness),
            acquired_unix_ms: Some(record.acquired_unix_ms),
            ..lock_status("held")
        },
        Err(error) => LockStatusReport {
            error: Some(error.to_string()),
            ..lock_status("error")
        },
    };

    let (run_state, run_state_error) = match RunStateStore::new(paths.state()).read_existing() {
        Ok(state) => (state.as_ref().map(run_state_status), None),
        Err(error) => (None, Some(format!("{error:#}"))),
    };
    let (archive, archive_error) = match ArchiveStore::new(paths.archive()).read_existing() {
        Ok(document) => (document.as_ref().map(archive_status), None),
        Err(error) => (None, Some(format!("{error:#}"))),
    };

    StatusReport {
        schema_version: STATUS_REPORT_SCHEMA_VERSION,
        generated_unix_ms: current_unix_timestamp_ms(),
        state_dir: paths.root().display().to_string(),
        lock: lock_report,
        run_state,
        run_state_error,
        archive,
        archive_error,
    }
}

pub fn render_status_report(report: &StatusReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("failed to encode status report")
}

fn lock_status(state: &'static str) -> LockStatusReport {
    LockStatusReport {
        state,
        owner_pid: None,
        owner_liveness: None,
        acquired_unix_ms: None,
        error: None,
    }
}

fn run_state_status(state: &RunState) -> RunStateStatus {
    RunStateStatus {
        current_cycle: state.current_cycle,
        total_cycles_planned: state.total_cycles_planned,
        start_unix_ms: state.start_unix_ms,
        deadline_unix_ms: state.deadline_unix_ms,
        updated_unix_ms: state.updated_unix_ms,
        live_improvements: state.improvements.len(),
        live_errors: state.errors.len(),
        total_improvements: state.total_improvements_appended(),
        total_errors: state.total_errors_appended(),
        counters_by_category: state.counters_by_category.clone(),
        preserved_learnings: state.preserved_learnings.len(),
        label: state.label.clone(),
        last_stop_reason: state.last_stop_reason.clone(),
    }
}

fn archive_status(document: &ArchiveDocument) -> ArchiveStatus {
    ArchiveStatus {
        entries: document.entries.len(),
        total_archived: document.total_archived,
        total_archived_errors: document.total_archived_errors,
        total_archived_learnings: document.total_archived_learnings(),
        counts_by_type: document.counts_by_type(),
    }
}
