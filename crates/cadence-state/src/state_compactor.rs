//! Bounded-growth compaction of the live improvement, error, and learning
//! lists.
//!
//! Overflow is summarized into one [`ArchiveEntry`] per compaction event;
//! evicted learnings are copied into the archive verbatim. The archive
//! document is always written before the shrunken RunState is handed back,
//! so a failed archive write leaves the caller's state intact.
//!
//! Sequences come from the archive itself. A compaction whose archive write
//! landed but whose RunState was never saved is replayed under the same
//! sequence; it is recognized by carrying this run's `start_unix_ms` and a
//! sequence newer than the one the RunState last committed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use cadence_core::current_unix_timestamp_ms;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::archive_store::{
    ArchiveDocument, ArchiveEntry, ArchiveStore, ErrorArchiveEntry, LearningArchiveEntry,
};
use crate::run_state::{ArchivedSummary, ErrorRecord, ImprovementRecord, RunState};

pub const DEFAULT_COMPACTION_SIZE_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_LIVE_IMPROVEMENTS: usize = 1_000;
pub const DEFAULT_MAX_LIVE_ERRORS: usize = 500;
pub const DEFAULT_MAX_PRESERVED_LEARNINGS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub size_threshold_bytes: u64,
    pub max_live_improvements: usize,
    pub max_live_errors: usize,
    pub max_preserved_learnings: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            size_threshold_bytes: DEFAULT_COMPACTION_SIZE_THRESHOLD_BYTES,
            max_live_improvements: DEFAULT_MAX_LIVE_IMPROVEMENTS,
            max_live_errors: DEFAULT_MAX_LIVE_ERRORS,
            max_preserved_learnings: DEFAULT_MAX_PRESERVED_LEARNINGS,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("failed to encode run state for size check: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write archive {}: {detail}", .path.display())]
    ArchiveWrite { path: PathBuf, detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactedRunState {
    pub state: RunState,
    pub sequence: u64,
    pub archived_improvements: u64,
    pub archived_errors: u64,
    pub archived_learnings: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// Within thresholds, or nothing over the caps to move.
    Unchanged,
    Compacted(Box<CompactedRunState>),
}

#[derive(Debug, Clone)]
pub struct StateCompactor {
    policy: CompactionPolicy,
    archive: ArchiveStore,
}

impl StateCompactor {
    pub fn new(policy: CompactionPolicy, archive: ArchiveStore) -> Self {
        Self { policy, archive }
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Moves the oldest records over the live caps into the archive.
    #[instrument(
        skip(self, state),
        fields(
            improvements = state.improvements.len(),
            errors = state.errors.len(),
            learnings = state.preserved_learnings.len(),
            archive = %self.archive.path().display()
        )
    )]
    pub fn maybe_compact(&self, state: &RunState) -> Result<CompactionOutcome, CompactionError> {
        let encoded_len = serde_json::to_vec_pretty(state)?.len();
        let encoded_len = u64::try_from(encoded_len).unwrap_or(u64::MAX);
        let over_size = encoded_len > self.policy.size_threshold_bytes;
        let improvement_split = state
            .improvements
            .len()
            .saturating_sub(self.policy.max_live_improvements);
        let error_split = state.errors.len().saturating_sub(self.policy.max_live_errors);
        let learning_split = state
            .preserved_learnings
            .len()
            .saturating_sub(self.policy.max_preserved_learnings);
        if improvement_split == 0 && error_split == 0 && learning_split == 0 {
            if over_size {
                warn!(
                    encoded_len,
                    threshold = self.policy.size_threshold_bytes,
                    "run state over size threshold but live lists are within caps"
                );
            }
            return Ok(CompactionOutcome::Unchanged);
        }

        let (archived_improvements, live_improvements) =
            state.improvements.split_at(improvement_split);
        let (archived_errors, live_errors) = state.errors.split_at(error_split);
        let (archived_learnings, live_learnings) =
            state.preserved_learnings.split_at(learning_split);
        let previous = state.archived_summary.clone().unwrap_or_default();
        let now_unix_ms = current_unix_timestamp_ms();

        let archive_failure = |detail: String| CompactionError::ArchiveWrite {
            path: self.archive.path().to_path_buf(),
            detail,
        };
        let mut document = self
            .archive
            .load()
            .map_err(|error| archive_failure(format!("{error:#}")))?;
        let stamp = EntryStamp {
            sequence: next_sequence(&document, state, &previous),
            run_started_unix_ms: state.start_unix_ms,
            created_unix_ms: now_unix_ms,
        };
        let sequence = stamp.sequence;
        let improvement_entry = summarize_improvements(archived_improvements, stamp);
        let archived_counts = improvement_entry
            .as_ref()
            .map(|entry| entry.counts_by_type.clone())
            .unwrap_or_default();
        if let Some(entry) = improvement_entry {
            document.upsert_entry(entry);
        }
        if let Some(entry) = summarize_errors(archived_errors, stamp) {
            document.upsert_error_entry(entry);
        }
        if !archived_learnings.is_empty() {
            document.upsert_learning_entry(LearningArchiveEntry {
                sequence,
                run_started_unix_ms: stamp.run_started_unix_ms,
                created_unix_ms: now_unix_ms,
                learnings: archived_learnings.to_vec(),
            });
        }
        self.archive
            .save(&document)
            .map_err(|error| archive_failure(format!("{error:#}")))?;

        let archived_improvement_count = len_as_u64(archived_improvements.len());
        let archived_error_count = len_as_u64(archived_errors.len());
        let archived_learning_count = len_as_u64(archived_learnings.len());
        let mut archived_counts_by_type = previous.archived_counts_by_type;
        for (kind, count) in archived_counts {
            let total = archived_counts_by_type.entry(kind).or_insert(0_u64);
            *total = total.saturating_add(count);
        }
        let mut compacted = state.clone();
        compacted.improvements = live_improvements.to_vec();
        compacted.errors = live_errors.to_vec();
        compacted.preserved_learnings = live_learnings.to_vec();
        compacted.archived_summary = Some(ArchivedSummary {
            total_archived_improvements: previous
                .total_archived_improvements
                .saturating_add(archived_improvement_count),
            total_archived_errors: previous
                .total_archived_errors
                .saturating_add(archived_error_count),
            total_archived_learnings: previous
                .total_archived_learnings
                .saturating_add(archived_learning_count),
            archived_counts_by_type,
            archive_entry_count: previous.archive_entry_count.saturating_add(1),
            last_sequence: sequence,
            last_archived_unix_ms: now_unix_ms,
        });

        info!(
            sequence,
            archived_improvements = archived_improvement_count,
            archived_errors = archived_error_count,
            archived_learnings = archived_learning_count,
            "compacted run state"
        );
        Ok(CompactionOutcome::Compacted(Box::new(CompactedRunState {
            state: compacted,
            sequence,
            archived_improvements: archived_improvement_count,
            archived_errors: archived_error_count,
            archived_learnings: archived_learning_count,
        })))
    }
}

/// Reuses the archive's newest sequence only when it is this run's
/// uncommitted compaction; everything else gets a fresh sequence.
fn next_sequence(
    document: &ArchiveDocument,
    state: &RunState,
    previous: &ArchivedSummary,
) -> u64 {
    let last = document.last_sequence();
    let uncommitted = last > previous.last_sequence
        && document.run_started_for(last) == Some(state.start_unix_ms);
    if uncommitted {
        last
    } else {
        last.saturating_add(1)
    }
}

fn len_as_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

fn cycle_range(cycles: impl Iterator<Item = u64>) -> Option<[u64; 2]> {
    cycles.fold(None, |range, cycle| match range {
        None => Some([cycle, cycle]),
        Some([min, max]) => Some([min.min(cycle), max.max(cycle)]),
    })
}

#[derive(Debug, Clone, Copy)]
struct EntryStamp {
    sequence: u64,
    run_started_unix_ms: u64,
    created_unix_ms: u64,
}

fn summarize_improvements(
    records: &[ImprovementRecord],
    stamp: EntryStamp,
) -> Option<ArchiveEntry> {
    let cycle_range = cycle_range(records.iter().map(|record| record.cycle))?;
    let mut counts_by_type = BTreeMap::new();
    for record in records {
        let count = counts_by_type.entry(record.kind.clone()).or_insert(0_u64);
        *count = count.saturating_add(1);
    }
    Some(ArchiveEntry {
        sequence: stamp.sequence,
        run_started_unix_ms: stamp.run_started_unix_ms,
        created_unix_ms: stamp.created_unix_ms,
        cycle_range,
        archived_count: len_as_u64(records.len()),
        counts_by_type,
    })
}

fn summarize_errors(records: &[ErrorRecord], stamp: EntryStamp) -> Option<ErrorArchiveEntry> {
    let cycle_range = cycle_range(records.iter().map(|record| record.cycle))?;
    Some(ErrorArchiveEntry {
        sequence: stamp.sequence,
        run_started_unix_ms: stamp.run_started_unix_ms,
        created_unix_ms: stamp.created_unix_ms,
        cycle_range,
        archived_count: len_as_u64(records.len()),
    })
}
