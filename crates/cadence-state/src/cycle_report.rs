//! Optional per-cycle report written by the unit-of-work.
//!
//! The report is a JSON document at the path exported as
//! `CADENCE_CYCLE_REPORT`. It is folded into RunState after the cycle and
//! then removed so the next cycle starts clean.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::run_state::{
    RunState, COUNTER_COMPACTION_FAILED, COUNTER_CYCLE_CANCELLED, COUNTER_CYCLE_FAILED,
    COUNTER_CYCLE_SUCCEEDED, COUNTER_CYCLE_TIMED_OUT,
};

pub const CYCLE_REPORT_FILE_NAME: &str = "cycle-report.json";

const RESERVED_COUNTERS: [&str; 5] = [
    COUNTER_CYCLE_SUCCEEDED,
    COUNTER_CYCLE_FAILED,
    COUNTER_CYCLE_TIMED_OUT,
    COUNTER_CYCLE_CANCELLED,
    COUNTER_COMPACTION_FAILED,
];

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReportedImprovement {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CycleReport {
    #[serde(default)]
    pub improvements: Vec<ReportedImprovement>,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub learnings: Vec<Value>,
}

pub fn parse_cycle_report(raw: &str) -> serde_json::Result<CycleReport> {
    serde_json::from_str::<CycleReport>(raw)
}

/// What happened when a cycle report was folded into RunState.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReportIngest {
    Absent,
    Ingested {
        improvements_added: usize,
        counters_merged: usize,
        learnings_added: usize,
    },
    /// Recorded as an ErrorRecord on the cycle.
    Malformed { reason: String },
}

impl CycleReportIngest {
    pub fn improvements_added(&self) -> usize {
        match self {
            Self::Ingested {
                improvements_added, ..
            } => *improvements_added,
            Self::Absent | Self::Malformed { .. } => 0,
        }
    }
}

/// Removes a report left behind by an interrupted cycle.
pub fn clear_stale_cycle_report(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), "removed stale cycle report");
            Ok(true)
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error)
            .with_context(|| format!("failed to remove stale cycle report {}", path.display())),
    }
}

/// Reads, applies and removes the cycle report at `path`.
pub fn ingest_cycle_report(
    path: &Path,
    state: &mut RunState,
    cycle: u64,
    now_unix_ms: u64,
) -> Result<CycleReportIngest> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CycleReportIngest::Absent)
        }
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read cycle report {}", path.display()))
        }
    };
    std::fs::remove_file(path)
        .with_context(|| format!("failed to remove cycle report {}", path.display()))?;

    let report = match parse_cycle_report(&raw) {
        Ok(report) => report,
        Err(error) => {
            let reason = format!("malformed cycle report: {error}");
            warn!(cycle, %reason, "discarding cycle report");
            state.append_error(cycle, reason.clone(), now_unix_ms);
            return Ok(CycleReportIngest::Malformed { reason });
        }
    };
    Ok(apply_cycle_report(state, report, cycle, now_unix_ms))
}

/// Folds an already parsed report into `state`, stamping cycle and time.
pub fn apply_cycle_report(
    state: &mut RunState,
    report: CycleReport,
    cycle: u64,
    now_unix_ms: u64,
) -> CycleReportIngest {
    let improvements_added = report.improvements.len();
    for improvement in report.improvements {
        state.append_improvement(cycle, &improvement.kind, improvement.subject, now_unix_ms);
    }

    let mut counters_merged = 0;
    for (category, amount) in report.counters {
        if RESERVED_COUNTERS.contains(&category.as_str()) {
            debug!(cycle, category = %category, "ignoring reported counter with reserved name");
            continue;
        }
        state.increment_counter(&category, amount);
        counters_merged += 1;
    }

    let mut learnings_added = 0;
    for learning in report.learnings {
        if state.preserved_learnings.contains(&learning) {
            continue;
        }
        state.preserved_learnings.push(learning);
        learnings_added += 1;
    }

    CycleReportIngest::Ingested {
        improvements_added,
        counters_merged,
        learnings_added,
    }
}
