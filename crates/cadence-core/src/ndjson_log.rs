//! Size-bounded append-only JSON-lines logs.
//!
//! A log owns its path and its [`LogRetention`]. When the next record would
//! push the active file past `max_bytes`, the active file becomes `<path>.1`,
//! older backups shift up by one, and anything past `backups` is deleted.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

pub const DEFAULT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_LOG_BACKUPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRetention {
    /// Active file size that triggers a rotation; 0 never rotates.
    pub max_bytes: u64,
    /// Rotated files kept next to the active one.
    pub backups: usize,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backups: DEFAULT_LOG_BACKUPS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NdjsonLog {
    path: PathBuf,
    retention: LogRetention,
}

impl NdjsonLog {
    pub fn new(path: impl Into<PathBuf>, retention: LogRetention) -> Self {
        Self {
            path: path.into(),
            retention,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> LogRetention {
        self.retention
    }

    /// `<path>.<index>`; index 1 is the most recent backup.
    pub fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// Encodes `record` as one line and appends it, rotating first if needed.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .with_context(|| format!("failed to encode record for {}", self.path.display()))?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if self.needs_rotation(line.len())? {
            self.rotate()?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))
    }

    fn needs_rotation(&self, incoming: usize) -> Result<bool> {
        if self.retention.max_bytes == 0 {
            return Ok(false);
        }
        let current = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to stat {}", self.path.display()))
            }
        };
        let incoming = u64::try_from(incoming).unwrap_or(u64::MAX);
        Ok(current > 0 && current.saturating_add(incoming) > self.retention.max_bytes)
    }

    fn rotate(&self) -> Result<()> {
        let backups = self.retention.backups;
        if backups == 0 {
            return remove_if_present(&self.path);
        }
        remove_if_present(&self.backup_path(backups))?;
        for index in (1..backups).rev() {
            rename_if_present(&self.backup_path(index), &self.backup_path(index + 1))?;
        }
        rename_if_present(&self.path, &self.backup_path(1))
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn rename_if_present(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error)
            .with_context(|| format!("failed to rotate {} to {}", from.display(), to.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::{LogRetention, NdjsonLog};
    use serde_json::json;

    fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn functional_append_writes_one_json_object_per_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = NdjsonLog::new(
            temp.path().join("nested/cycle-events.jsonl"),
            LogRetention::default(),
        );
        log.append(&json!({"cycle": 1})).expect("append");
        log.append(&json!({"cycle": 2})).expect("append");
        assert_eq!(lines(log.path()), vec![json!({"cycle": 1}), json!({"cycle": 2})]);
    }

    #[test]
    fn functional_rotation_keeps_newest_backups_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = NdjsonLog::new(
            temp.path().join("cycle-events.jsonl"),
            LogRetention {
                max_bytes: 12,
                backups: 2,
            },
        );
        for cycle in 1..=5 {
            log.append(&json!({"cycle": cycle})).expect("append");
        }

        assert_eq!(lines(log.path()), vec![json!({"cycle": 5})]);
        assert_eq!(lines(&log.backup_path(1)), vec![json!({"cycle": 4})]);
        assert_eq!(lines(&log.backup_path(2)), vec![json!({"cycle": 3})]);
        assert!(!log.backup_path(3).exists());
    }

    #[test]
    fn unit_zero_backups_truncates_in_place() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = NdjsonLog::new(
            temp.path().join("crash-log.jsonl"),
            LogRetention {
                max_bytes: 12,
                backups: 0,
            },
        );
        log.append(&json!({"error": "a"})).expect("append");
        log.append(&json!({"error": "b"})).expect("append");
        assert_eq!(lines(log.path()), vec![json!({"error": "b"})]);
        assert!(!log.backup_path(1).exists());
    }

    #[test]
    fn regression_oversized_first_record_is_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = NdjsonLog::new(
            temp.path().join("cycle-events.jsonl"),
            LogRetention {
                max_bytes: 4,
                backups: 1,
            },
        );
        log.append(&json!({"message": "longer than the limit"})).expect("append");
        assert_eq!(lines(log.path()).len(), 1);
        assert!(!log.backup_path(1).exists());
    }

    #[test]
    fn unit_zero_max_bytes_never_rotates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = NdjsonLog::new(
            temp.path().join("cycle-events.jsonl"),
            LogRetention {
                max_bytes: 0,
                backups: 3,
            },
        );
        for cycle in 1..=4 {
            log.append(&json!({"cycle": cycle})).expect("append");
        }
        assert_eq!(lines(log.path()).len(), 4);
        assert!(!log.backup_path(1).exists());
    }
}
