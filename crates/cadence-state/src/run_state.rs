//! The persisted run-progress document and its record types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RUN_STATE_SCHEMA_VERSION: u32 = 1;

pub const IMPROVEMENT_KIND_ENHANCEMENT: &str = "enhancement";
pub const IMPROVEMENT_KIND_FIX: &str = "fix";
pub const IMPROVEMENT_KIND_CONNECTION: &str = "connection";
pub const IMPROVEMENT_KIND_DOCUMENTATION: &str = "documentation";
pub const IMPROVEMENT_KIND_OTHER: &str = "other";

pub const COUNTER_CYCLE_SUCCEEDED: &str = "cycle_succeeded";
pub const COUNTER_CYCLE_FAILED: &str = "cycle_failed";
pub const COUNTER_CYCLE_TIMED_OUT: &str = "cycle_timed_out";
pub const COUNTER_CYCLE_CANCELLED: &str = "cycle_cancelled";
pub const COUNTER_COMPACTION_FAILED: &str = "compaction_failed";

fn run_state_schema_version() -> u32 {
    RUN_STATE_SCHEMA_VERSION
}

/// Normalizes a reported improvement type to its lower-case stored form.
pub fn normalize_improvement_kind(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return IMPROVEMENT_KIND_OTHER.to_string();
    }
    trimmed.to_ascii_lowercase()
}

/// One improvement reported by a cycle. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImprovementRecord {
    #[serde(default)]
    pub cycle: u64,
    #[serde(rename = "type", default = "default_improvement_kind")]
    pub kind: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub timestamp_unix_ms: u64,
}

fn default_improvement_kind() -> String {
    IMPROVEMENT_KIND_OTHER.to_string()
}

/// One cycle-level failure. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    #[serde(default)]
    pub cycle: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp_unix_ms: u64,
}

/// Running totals of what the compactor moved into the archive since the
/// last reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivedSummary {
    #[serde(default)]
    pub total_archived_improvements: u64,
    #[serde(default)]
    pub total_archived_errors: u64,
    #[serde(default)]
    pub total_archived_learnings: u64,
    #[serde(default)]
    pub archived_counts_by_type: BTreeMap<String, u64>,
    #[serde(default)]
    pub archive_entry_count: u64,
    /// Archive sequence of the last compaction this document committed.
    #[serde(default)]
    pub last_sequence: u64,
    #[serde(default)]
    pub last_archived_unix_ms: u64,
}

/// The single persisted run-progress document.
///
/// Every field defaults so that hand-edited or older documents still load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    #[serde(default = "run_state_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub start_unix_ms: u64,
    #[serde(default)]
    pub deadline_unix_ms: Option<u64>,
    #[serde(default)]
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub current_cycle: u64,
    #[serde(default)]
    pub total_cycles_planned: u64,
    #[serde(default)]
    pub improvements: Vec<ImprovementRecord>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub counters_by_category: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_summary: Option<ArchivedSummary>,
    #[serde(default)]
    pub preserved_learnings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stop_reason: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            schema_version: RUN_STATE_SCHEMA_VERSION,
            start_unix_ms: 0,
            deadline_unix_ms: None,
            updated_unix_ms: 0,
            current_cycle: 0,
            total_cycles_planned: 0,
            improvements: Vec::new(),
            errors: Vec::new(),
            counters_by_category: BTreeMap::new(),
            archived_summary: None,
            preserved_learnings: Vec::new(),
            label: None,
            last_stop_reason: None,
        }
    }
}

impl RunState {
    /// Builds a cold-start document whose time bounds are fixed from now on.
    pub fn cold_start(
        now_unix_ms: u64,
        deadline_unix_ms: Option<u64>,
        total_cycles_planned: u64,
    ) -> Self {
        Self {
            start_unix_ms: now_unix_ms,
            deadline_unix_ms,
            updated_unix_ms: now_unix_ms,
            total_cycles_planned,
            ..Self::default()
        }
    }

    /// Returns a fresh document that keeps only `preserved_learnings`.
    ///
    /// This is the only operation allowed to move `current_cycle` backwards.
    pub fn reset(
        &self,
        now_unix_ms: u64,
        deadline_unix_ms: Option<u64>,
        total_cycles_planned: u64,
    ) -> Self {
        Self {
            preserved_learnings: self.preserved_learnings.clone(),
            label: self.label.clone(),
            ..Self::cold_start(now_unix_ms, deadline_unix_ms, total_cycles_planned)
        }
    }

    /// Advances the cycle counter and returns the new cycle number.
    pub fn begin_cycle(&mut self) -> u64 {
        self.current_cycle = self.current_cycle.saturating_add(1);
        self.current_cycle
    }

    pub fn append_improvement(
        &mut self,
        cycle: u64,
        kind: &str,
        subject: impl Into<String>,
        timestamp_unix_ms: u64,
    ) {
        self.improvements.push(ImprovementRecord {
            cycle,
            kind: normalize_improvement_kind(kind),
            subject: subject.into(),
            timestamp_unix_ms,
        });
    }

    pub fn append_error(&mut self, cycle: u64, message: impl Into<String>, timestamp_unix_ms: u64) {
        self.errors.push(ErrorRecord {
            cycle,
            message: message.into(),
            timestamp_unix_ms,
        });
    }

    /// Adds `amount` to a category tally. Tallies only ever grow.
    pub fn increment_counter(&mut self, category: &str, amount: u64) {
        let entry = self
            .counters_by_category
            .entry(category.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    pub fn counter(&self, category: &str) -> u64 {
        self.counters_by_category
            .get(category)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_archived_improvements(&self) -> u64 {
        self.archived_summary
            .as_ref()
            .map(|summary| summary.total_archived_improvements)
            .unwrap_or(0)
    }

    pub fn total_archived_errors(&self) -> u64 {
        self.archived_summary
            .as_ref()
            .map(|summary| summary.total_archived_errors)
            .unwrap_or(0)
    }

    /// Live plus archived improvements: everything appended since the last reset.
    pub fn total_improvements_appended(&self) -> u64 {
        self.total_archived_improvements()
            .saturating_add(u64::try_from(self.improvements.len()).unwrap_or(u64::MAX))
    }

    pub fn total_errors_appended(&self) -> u64 {
        self.total_archived_errors()
            .saturating_add(u64::try_from(self.errors.len()).unwrap_or(u64::MAX))
    }

    /// Live plus archived improvement counts by type, on the same basis as
    /// [`Self::total_improvements_appended`].
    pub fn improvements_by_kind(&self) -> BTreeMap<String, u64> {
        let mut counts = self
            .archived_summary
            .as_ref()
            .map(|summary| summary.archived_counts_by_type.clone())
            .unwrap_or_default();
        for record in &self.improvements {
            let entry = counts.entry(record.kind.clone()).or_insert(0_u64);
            *entry = entry.saturating_add(1);
        }
        counts
    }
}

/// Parses a RunState document. Unknown fields are ignored, missing ones default.
pub fn parse_run_state_document(raw: &str) -> serde_json::Result<RunState> {
    serde_json::from_str::<RunState>(raw)
}

/// Serializes a RunState document the way it is stored on disk.
pub fn render_run_state_document(state: &RunState) -> serde_json::Result<String> {
    let mut payload = serde_json::to_string_pretty(state)?;
    payload.push('\n');
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::{
        normalize_improvement_kind, parse_run_state_document, render_run_state_document,
        RunState, COUNTER_CYCLE_FAILED,
    };
    use serde_json::json;

    #[test]
    fn unit_normalize_improvement_kind_lowercases_and_defaults_blank() {
        assert_eq!(normalize_improvement_kind(" Fix "), "fix");
        assert_eq!(normalize_improvement_kind(""), "other");
        assert_eq!(normalize_improvement_kind("Refactor"), "refactor");
    }

    #[test]
    fn unit_parse_run_state_document_fills_missing_fields_with_defaults() {
        let state = parse_run_state_document(r#"{"current_cycle": 7}"#).expect("parse");
        assert_eq!(state.current_cycle, 7);
        assert_eq!(state.schema_version, 1);
        assert!(state.improvements.is_empty());
        assert!(state.archived_summary.is_none());
    }

    #[test]
    fn functional_reset_zeroes_progress_and_keeps_learnings() {
        let mut state = RunState::cold_start(1_000, Some(9_000), 40);
        state.begin_cycle();
        state.begin_cycle();
        state.append_improvement(2, "fix", "tighten manifest", 1_500);
        state.append_error(2, "exit status 1", 1_600);
        state.increment_counter(COUNTER_CYCLE_FAILED, 1);
        state.preserved_learnings.push(json!({"lesson": "probe is flaky"}));

        let reset = state.reset(5_000, None, 10);
        assert_eq!(reset.current_cycle, 0);
        assert!(reset.improvements.is_empty());
        assert!(reset.errors.is_empty());
        assert!(reset.counters_by_category.is_empty());
        assert_eq!(reset.start_unix_ms, 5_000);
        assert_eq!(reset.total_cycles_planned, 10);
        assert_eq!(reset.preserved_learnings, state.preserved_learnings);
    }

    #[test]
    fn functional_render_then_parse_preserves_type_field_name() {
        let mut state = RunState::cold_start(1, None, 0);
        state.append_improvement(1, "Connection", "link modules", 2);
        let rendered = render_run_state_document(&state).expect("render");
        assert!(rendered.contains("\"type\": \"connection\""));
        let parsed = parse_run_state_document(&rendered).expect("parse");
        assert_eq!(parsed, state);
    }

    #[test]
    fn unit_total_improvements_appended_includes_archived_records() {
        let mut state = RunState::default();
        state.append_improvement(1, "fix", "a", 1);
        state.archived_summary = Some(super::ArchivedSummary {
            total_archived_improvements: 41,
            ..super::ArchivedSummary::default()
        });
        assert_eq!(state.total_improvements_appended(), 42);
    }

    #[test]
    fn unit_improvements_by_kind_sums_to_total_appended() {
        let mut state = RunState::default();
        state.append_improvement(3, "fix", "a", 1);
        state.append_improvement(3, "connection", "b", 1);
        state.archived_summary = Some(super::ArchivedSummary {
            total_archived_improvements: 5,
            archived_counts_by_type: std::collections::BTreeMap::from([
                ("fix".to_string(), 4),
                ("documentation".to_string(), 1),
            ]),
            ..super::ArchivedSummary::default()
        });

        let by_kind = state.improvements_by_kind();
        assert_eq!(by_kind.get("fix"), Some(&5));
        assert_eq!(by_kind.get("connection"), Some(&1));
        assert_eq!(by_kind.get("documentation"), Some(&1));
        assert_eq!(by_kind.values().sum::<u64>(), state.total_improvements_appended());
    }
}
