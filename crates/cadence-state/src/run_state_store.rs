//! Load/save of the RunState document with corrupt-file quarantine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_core::{quarantine_file, write_text_atomic};
use tracing::{info, instrument, warn};

use crate::run_state::{parse_run_state_document, render_run_state_document, RunState};

pub const RUN_STATE_FILE_NAME: &str = "state.json";
const CORRUPT_QUARANTINE_LABEL: &str = "corrupt";

/// Where a loaded RunState came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStateSource {
    /// No document existed.
    Fresh,
    Existing,
    /// The document was unreadable and has been moved aside.
    Recovered { quarantined_path: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRunState {
    pub state: RunState,
    pub source: RunStateSource,
}

impl LoadedRunState {
    /// True when the state was not carried over from a previous run.
    pub fn is_cold_start(&self) -> bool {
        !matches!(self.source, RunStateSource::Existing)
    }
}

/// File-backed RunState persistence. All mutation goes through load/mutate/save.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(RUN_STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document, falling back to a fresh default when it is missing
    /// or unparseable. An unparseable document is quarantined, never deleted.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<LoadedRunState> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                info!("no run state found, starting fresh");
                return Ok(LoadedRunState {
                    state: RunState::default(),
                    source: RunStateSource::Fresh,
                });
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read run state {}", self.path.display()))
            }
        };

        match parse_run_state_document(&raw) {
            Ok(state) => Ok(LoadedRunState {
                state,
                source: RunStateSource::Existing,
            }),
            Err(parse_error) => {
                let quarantined_path = quarantine_file(&self.path, CORRUPT_QUARANTINE_LABEL)
                    .with_context(|| {
                        format!("failed to quarantine corrupt run state {}", self.path.display())
                    })?;
                warn!(
                    error = %parse_error,
                    quarantined = %quarantined_path.display(),
                    "run state unreadable, quarantined and starting fresh"
                );
                Ok(LoadedRunState {
                    state: RunState::default(),
                    source: RunStateSource::Recovered { quarantined_path },
                })
            }
        }
    }

    /// Reads the document without any recovery side effects.
    ///
    /// Returns `None` when the file does not exist.
    pub fn read_existing(&self) -> Result<Option<RunState>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read run state {}", self.path.display()))
            }
        };
        let state = parse_run_state_document(&raw)
            .with_context(|| format!("failed to parse run state {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Atomically replaces the stored document.
    #[instrument(
        skip(self, state),
        fields(path = %self.path.display(), cycle = state.current_cycle)
    )]
    pub fn save(&self, state: &RunState) -> Result<()> {
        let payload = render_run_state_document(state).context("failed to encode run state")?;
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to persist run state {}", self.path.display()))
    }

    /// Builds a fresh state that carries `preserved_learnings` forward.
    pub fn reset(
        state: &RunState,
        now_unix_ms: u64,
        deadline_unix_ms: Option<u64>,
        total_cycles_planned: u64,
    ) -> RunState {
        state.reset(now_unix_ms, deadline_unix_ms, total_cycles_planned)
    }
}

#[cfg(test)]
mod tests {
    use super::{RunStateSource, RunStateStore};
    use crate::run_state::RunState;
    use serde_json::json;

    #[test]
    fn unit_load_missing_document_returns_fresh_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::in_state_dir(temp.path());
        let loaded = store.load().expect("load");
        assert_eq!(loaded.source, RunStateSource::Fresh);
        assert!(loaded.is_cold_start());
        assert_eq!(loaded.state, RunState::default());
    }

    #[test]
    fn functional_save_then_load_returns_existing_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::in_state_dir(temp.path());
        let mut state = RunState::cold_start(10, Some(99), 5);
        state.begin_cycle();
        state.append_improvement(1, "fix", "tighten lockfile", 11);
        store.save(&state).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.source, RunStateSource::Existing);
        assert!(!loaded.is_cold_start());
        assert_eq!(loaded.state, state);
    }

    #[test]
    fn regression_corrupt_document_is_quarantined_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::in_state_dir(temp.path());
        std::fs::write(store.path(), "{\"current_cycle\": 3,").expect("write corrupt");

        let loaded = store.load().expect("load should recover");
        let RunStateSource::Recovered { quarantined_path } = &loaded.source else {
            panic!("expected recovered source, got {:?}", loaded.source);
        };
        assert_eq!(loaded.state, RunState::default());
        assert!(!store.path().exists());
        assert_eq!(
            std::fs::read_to_string(quarantined_path).expect("read quarantined"),
            "{\"current_cycle\": 3,"
        );
    }

    #[test]
    fn unit_read_existing_reports_parse_errors_without_moving_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::in_state_dir(temp.path());
        assert!(store.read_existing().expect("read missing").is_none());

        std::fs::write(store.path(), "not json").expect("write");
        let error = store.read_existing().expect_err("must fail");
        assert!(error.to_string().contains("failed to parse run state"));
        assert!(store.path().exists());
    }

    #[test]
    fn functional_reset_persists_learnings_across_save() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::in_state_dir(temp.path());
        let mut state = RunState::cold_start(1, None, 3);
        state.begin_cycle();
        state.preserved_learnings.push(json!("keep build probe short"));
        store.save(&state).expect("save");

        let reset = RunStateStore::reset(&store.load().expect("load").state, 50, None, 3);
        store.save(&reset).expect("save reset");
        let reloaded = store.load().expect("reload").state;
        assert_eq!(reloaded.current_cycle, 0);
        assert_eq!(reloaded.preserved_learnings, vec![json!("keep build probe short")]);
    }
}
