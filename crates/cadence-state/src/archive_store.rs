//! Append-only archive of compacted improvement and error records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_core::{quarantine_file, write_text_atomic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

pub const ARCHIVE_FILE_NAME: &str = "archive.json";
pub const ARCHIVE_SCHEMA_VERSION: u32 = 1;

fn archive_schema_version() -> u32 {
    ARCHIVE_SCHEMA_VERSION
}

/// Aggregate of one compaction event's improvement prefix.
///
/// `run_started_unix_ms` is the `start_unix_ms` of the RunState that was
/// compacted; it tells compactions of different runs apart after a reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub run_started_unix_ms: u64,
    #[serde(default)]
    pub created_unix_ms: u64,
    #[serde(default)]
    pub cycle_range: [u64; 2],
    #[serde(default)]
    pub archived_count: u64,
    #[serde(default)]
    pub counts_by_type: BTreeMap<String, u64>,
}

/// Aggregate of one compaction event's error prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorArchiveEntry {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub run_started_unix_ms: u64,
    #[serde(default)]
    pub created_unix_ms: u64,
    #[serde(default)]
    pub cycle_range: [u64; 2],
    #[serde(default)]
    pub archived_count: u64,
}

/// Preserved learnings evicted by one compaction event, kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningArchiveEntry {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub run_started_unix_ms: u64,
    #[serde(default)]
    pub created_unix_ms: u64,
    #[serde(default)]
    pub learnings: Vec<Value>,
}

/// Every run's compaction history. Entries are never removed; totals span
/// all runs, including ones before a reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveDocument {
    #[serde(default = "archive_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub entries: Vec<ArchiveEntry>,
    #[serde(default)]
    pub total_archived: u64,
    #[serde(default)]
    pub error_entries: Vec<ErrorArchiveEntry>,
    #[serde(default)]
    pub total_archived_errors: u64,
    #[serde(default)]
    pub learning_entries: Vec<LearningArchiveEntry>,
}

impl Default for ArchiveDocument {
    fn default() -> Self {
        Self {
            schema_version: ARCHIVE_SCHEMA_VERSION,
            entries: Vec::new(),
            total_archived: 0,
            error_entries: Vec::new(),
            total_archived_errors: 0,
            learning_entries: Vec::new(),
        }
    }
}

impl ArchiveDocument {
    /// Highest sequence across all entry kinds; 0 for an empty archive.
    pub fn last_sequence(&self) -> u64 {
        let improvements = self.entries.iter().map(|entry| entry.sequence);
        let errors = self.error_entries.iter().map(|entry| entry.sequence);
        let learnings = self.learning_entries.iter().map(|entry| entry.sequence);
        improvements.chain(errors).chain(learnings).max().unwrap_or(0)
    }

    /// Run start recorded by the entries carrying `sequence`, if any.
    pub fn run_started_for(&self, sequence: u64) -> Option<u64> {
        let improvements = self
            .entries
            .iter()
            .filter(|entry| entry.sequence == sequence)
            .map(|entry| entry.run_started_unix_ms);
        let errors = self
            .error_entries
            .iter()
            .filter(|entry| entry.sequence == sequence)
            .map(|entry| entry.run_started_unix_ms);
        let learnings = self
            .learning_entries
            .iter()
            .filter(|entry| entry.sequence == sequence)
            .map(|entry| entry.run_started_unix_ms);
        improvements.chain(errors).chain(learnings).next()
    }

    pub fn total_archived_learnings(&self) -> u64 {
        self.learning_entries.iter().fold(0_u64, |total, entry| {
            total.saturating_add(u64::try_from(entry.learnings.len()).unwrap_or(u64::MAX))
        })
    }

    /// Inserts `entry`, replacing any existing entry with the same sequence.
    ///
    /// A replayed compaction therefore never double counts.
    pub fn upsert_entry(&mut self, entry: ArchiveEntry) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.sequence == entry.sequence)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.total_archived = self
            .entries
            .iter()
            .fold(0_u64, |total, entry| total.saturating_add(entry.archived_count));
    }

    pub fn upsert_error_entry(&mut self, entry: ErrorArchiveEntry) {
        match self
            .error_entries
            .iter_mut()
            .find(|existing| existing.sequence == entry.sequence)
        {
            Some(existing) => *existing = entry,
            None => self.error_entries.push(entry),
        }
        self.total_archived_errors = self
            .error_entries
            .iter()
            .fold(0_u64, |total, entry| total.saturating_add(entry.archived_count));
    }

    pub fn upsert_learning_entry(&mut self, entry: LearningArchiveEntry) {
        match self
            .learning_entries
            .iter_mut()
            .find(|existing| existing.sequence == entry.sequence)
        {
            Some(existing) => *existing = entry,
            None => self.learning_entries.push(entry),
        }
    }

    /// Archived improvement counts summed across entries, by type.
    pub fn counts_by_type(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for entry in &self.entries {
            for (kind, count) in &entry.counts_by_type {
                let total = totals.entry(kind.clone()).or_insert(0_u64);
                *total = total.saturating_add(*count);
            }
        }
        totals
    }
}

pub fn parse_archive_document(raw: &str) -> serde_json::Result<ArchiveDocument> {
    serde_json::from_str::<ArchiveDocument>(raw)
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    path: PathBuf,
}

impl ArchiveStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(ARCHIVE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the archive. A missing file yields an empty document; an
    /// unreadable one is quarantined and replaced by an empty document.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<ArchiveDocument> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ArchiveDocument::default())
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read archive {}", self.path.display()))
            }
        };
        match parse_archive_document(&raw) {
            Ok(document) => Ok(document),
            Err(parse_error) => {
                let quarantined = quarantine_file(&self.path, "corrupt").with_context(|| {
                    format!("failed to quarantine corrupt archive {}", self.path.display())
                })?;
                warn!(
                    error = %parse_error,
                    quarantined = %quarantined.display(),
                    "archive unreadable, quarantined and starting a new archive"
                );
                Ok(ArchiveDocument::default())
            }
        }
    }

    /// Reads the archive without recovery side effects; `None` when missing.
    pub fn read_existing(&self) -> Result<Option<ArchiveDocument>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read archive {}", self.path.display()))
            }
        };
        let document = parse_archive_document(&raw)
            .with_context(|| format!("failed to parse archive {}", self.path.display()))?;
        Ok(Some(document))
    }

    #[instrument(
        skip(self, document),
        fields(path = %self.path.display(), entries = document.entries.len())
    )]
    pub fn save(&self, document: &ArchiveDocument) -> Result<()> {
        let mut payload =
            serde_json::to_string_pretty(document).context("failed to encode archive")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to persist archive {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ArchiveDocument, ArchiveEntry, ArchiveStore, ErrorArchiveEntry, LearningArchiveEntry,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn entry(sequence: u64, archived_count: u64) -> ArchiveEntry {
        ArchiveEntry {
            sequence,
            run_started_unix_ms: 7,
            created_unix_ms: 100 + sequence,
            cycle_range: [1, 10],
            archived_count,
            counts_by_type: BTreeMap::from([("fix".to_string(), archived_count)]),
        }
    }

    #[test]
    fn unit_upsert_entry_replaces_same_sequence_without_double_counting() {
        let mut document = ArchiveDocument::default();
        document.upsert_entry(entry(1, 20));
        document.upsert_entry(entry(2, 5));
        document.upsert_entry(entry(2, 8));
        assert_eq!(document.entries.len(), 2);
        assert_eq!(document.total_archived, 28);
        assert_eq!(document.counts_by_type().get("fix"), Some(&28));
    }

    #[test]
    fn unit_upsert_error_entry_tracks_running_total() {
        let mut document = ArchiveDocument::default();
        document.upsert_error_entry(ErrorArchiveEntry {
            sequence: 1,
            run_started_unix_ms: 7,
            created_unix_ms: 1,
            cycle_range: [2, 4],
            archived_count: 3,
        });
        assert_eq!(document.total_archived_errors, 3);
        assert_eq!(document.error_entries.len(), 1);
    }

    #[test]
    fn unit_last_sequence_spans_every_entry_kind() {
        let mut document = ArchiveDocument::default();
        assert_eq!(document.last_sequence(), 0);
        assert_eq!(document.run_started_for(1), None);

        document.upsert_entry(entry(2, 1));
        document.upsert_learning_entry(LearningArchiveEntry {
            sequence: 5,
            run_started_unix_ms: 40,
            created_unix_ms: 1,
            learnings: vec![json!("warm the cache first"), json!({"note": "pin node"})],
        });
        assert_eq!(document.last_sequence(), 5);
        assert_eq!(document.run_started_for(5), Some(40));
        assert_eq!(document.run_started_for(2), Some(7));
        assert_eq!(document.total_archived_learnings(), 2);
    }

    #[test]
    fn unit_documents_without_newer_fields_still_parse() {
        let document = super::parse_archive_document(
            r#"{"entries":[{"sequence":1,"archived_count":3,"counts_by_type":{"fix":3}}],"total_archived":3}"#,
        )
        .expect("parse");
        assert_eq!(document.entries[0].run_started_unix_ms, 0);
        assert!(document.learning_entries.is_empty());
        assert_eq!(document.last_sequence(), 1);
    }

    #[test]
    fn functional_save_then_load_round_trips_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArchiveStore::in_state_dir(temp.path());
        assert_eq!(store.load().expect("load missing"), ArchiveDocument::default());

        let mut document = ArchiveDocument::default();
        document.upsert_entry(entry(1, 4));
        store.save(&document).expect("save");
        assert_eq!(store.load().expect("load"), document);
        assert_eq!(store.read_existing().expect("read"), Some(document));
    }

    #[test]
    fn regression_corrupt_archive_is_quarantined_and_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArchiveStore::in_state_dir(temp.path());
        std::fs::write(store.path(), "[[[").expect("write");

        assert_eq!(store.load().expect("load"), ArchiveDocument::default());
        let quarantined = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("archive.json.corrupt-")
            })
            .count();
        assert_eq!(quarantined, 1);
    }
}
