//! Singleton enforcement through an exclusive lock file.
//!
//! The lock file holds a small JSON [`LockRecord`]. A record whose owner is
//! no longer alive is reclaimed; a live, unknown, or unprobeable owner means
//! the caller must not proceed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cadence_core::current_unix_timestamp_ms;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "orchestrator.lock";
pub const DEFAULT_UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(5);
const MAX_ACQUIRE_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub owner_pid: u32,
    #[serde(default)]
    pub acquired_unix_ms: u64,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {} is held by another orchestrator (owner pid {})", .path.display(), display_owner(.owner_pid))]
    Busy {
        path: PathBuf,
        owner_pid: Option<u32>,
    },
    #[error("lock {} could not be accessed: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_owner(owner_pid: &Option<u32>) -> String {
    owner_pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Result of probing whether a lock owner is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe itself failed, e.g. permission denied.
    Unknown,
}

pub trait ProcessLiveness: Send + Sync {
    fn probe(&self, pid: u32) -> Liveness;
}

/// Probes with signal 0, which checks existence without delivering anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalZeroLiveness;

impl ProcessLiveness for SignalZeroLiveness {
    fn probe(&self, pid: u32) -> Liveness {
        let Ok(raw_pid) = i32::try_from(pid) else {
            return Liveness::Dead;
        };
        // pid 0 would address our own process group.
        if raw_pid <= 0 {
            return Liveness::Dead;
        }
        match kill(Pid::from_raw(raw_pid), None) {
            Ok(()) => Liveness::Alive,
            Err(Errno::ESRCH) => Liveness::Dead,
            Err(error) => {
                debug!(pid, %error, "lock owner liveness probe failed");
                Liveness::Unknown
            }
        }
    }
}

/// What the lock file currently says, without taking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockInspection {
    Vacant,
    Held {
        record: LockRecord,
        liveness: Liveness,
    },
    Unreadable,
}

#[derive(Clone)]
pub struct LockManager {
    path: PathBuf,
    liveness: Arc<dyn ProcessLiveness>,
    unreadable_grace: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("path", &self.path)
            .field("unreadable_grace", &self.unreadable_grace)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            liveness: Arc::new(SignalZeroLiveness),
            unreadable_grace: DEFAULT_UNREADABLE_LOCK_GRACE,
        }
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn ProcessLiveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_unreadable_grace(mut self, grace: Duration) -> Self {
        self.unreadable_grace = grace;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the lock or reports who holds it. Never waits.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let own_pid = std::process::id();
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let record = LockRecord {
                        owner_pid: own_pid,
                        acquired_unix_ms: current_unix_timestamp_ms(),
                    };
                    let written = serde_json::to_vec(&record)
                        .map_err(std::io::Error::from)
                        .and_then(|payload| file.write_all(&payload))
                        .and_then(|()| file.sync_all());
                    if let Err(source) = written {
                        let _ = std::fs::remove_file(&self.path);
                        return Err(self.io_error(source));
                    }
                    info!(path = %self.path.display(), pid = own_pid, "acquired orchestrator lock");
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        released: false,
                    });
                }
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.reclaim_if_stale(own_pid)?;
                }
                Err(source) => return Err(self.io_error(source)),
            }
        }
        Err(LockError::Busy {
            path: self.path.clone(),
            owner_pid: None,
        })
    }

    /// Reads the lock file for status reporting. Never modifies it.
    pub fn inspect(&self) -> Result<LockInspection, LockError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LockInspection::Vacant)
            }
            Err(source) => return Err(self.io_error(source)),
        };
        Ok(match serde_json::from_slice::<LockRecord>(&raw) {
            Ok(record) => {
                let liveness = self.liveness.probe(record.owner_pid);
                LockInspection::Held { record, liveness }
            }
            Err(_) => LockInspection::Unreadable,
        })
    }

    /// Removes the existing lock file when its owner is gone, else reports `Busy`.
    fn reclaim_if_stale(&self, own_pid: u32) -> Result<(), LockError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            // Released between our create attempt and this read.
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(self.io_error(source)),
        };

        match serde_json::from_slice::<LockRecord>(&raw) {
            Ok(record) if record.owner_pid == own_pid => {
                info!(pid = own_pid, "lock records our own pid, treating as stale");
            }
            Ok(record) => match self.liveness.probe(record.owner_pid) {
                Liveness::Alive => {
                    return Err(LockError::Busy {
                        path: self.path.clone(),
                        owner_pid: Some(record.owner_pid),
                    })
                }
                Liveness::Unknown => {
                    warn!(
                        owner_pid = record.owner_pid,
                        "cannot probe lock owner, refusing to reclaim"
                    );
                    return Err(LockError::Busy {
                        path: self.path.clone(),
                        owner_pid: Some(record.owner_pid),
                    });
                }
                Liveness::Dead => {
                    info!(owner_pid = record.owner_pid, "reclaiming stale lock from dead owner");
                }
            },
            Err(_) => {
                if self.lock_age().is_some_and(|age| age >= self.unreadable_grace) {
                    info!(
                        path = %self.path.display(),
                        "reclaiming unreadable lock past grace period"
                    );
                } else {
                    return Err(LockError::Busy {
                        path: self.path.clone(),
                        owner_pid: None,
                    });
                }
            }
        }

        // Only remove what we inspected; a competitor may have replaced it.
        match std::fs::read(&self.path) {
            Ok(current) if current == raw => match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(self.io_error(source)),
            },
            Ok(_) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn lock_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Held lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "released orchestrator lock");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Liveness, LockError, LockInspection, LockManager, LockRecord, ProcessLiveness,
        SignalZeroLiveness,
    };
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedLiveness(Liveness);

    impl ProcessLiveness for FixedLiveness {
        fn probe(&self, _pid: u32) -> Liveness {
            self.0
        }
    }

    fn write_record(path: &std::path::Path, owner_pid: u32) {
        let record = LockRecord {
            owner_pid,
            acquired_unix_ms: 1,
        };
        std::fs::write(path, serde_json::to_vec(&record).expect("encode")).expect("write lock");
    }

    fn read_record(path: &std::path::Path) -> LockRecord {
        serde_json::from_slice(&std::fs::read(path).expect("read lock")).expect("decode lock")
    }

    #[test]
    fn functional_acquire_writes_record_and_release_removes_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = LockManager::new(temp.path().join("nested/orchestrator.lock"));
        let guard = manager.acquire().expect("acquire");
        assert_eq!(read_record(guard.path()).owner_pid, std::process::id());
        guard.release().expect("release");
        assert!(!manager.path().exists());
    }

    #[test]
    fn unit_drop_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = LockManager::new(temp.path().join("orchestrator.lock"));
        {
            let _guard = manager.acquire().expect("acquire");
            assert!(manager.path().exists());
        }
        assert!(!manager.path().exists());
    }

    #[test]
    fn functional_live_owner_is_busy_and_file_is_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.lock");
        write_record(&path, 4_242);
        let manager =
            LockManager::new(&path).with_liveness(Arc::new(FixedLiveness(Liveness::Alive)));

        let error = manager.acquire().expect_err("busy");
        assert!(matches!(
            error,
            LockError::Busy {
                owner_pid: Some(4_242),
                ..
            }
        ));
        assert_eq!(read_record(&path).owner_pid, 4_242);
    }

    #[test]
    fn functional_dead_owner_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.lock");
        write_record(&path, 4_242);
        let manager =
            LockManager::new(&path).with_liveness(Arc::new(FixedLiveness(Liveness::Dead)));

        let guard = manager.acquire().expect("reclaim");
        assert_eq!(read_record(guard.path()).owner_pid, std::process::id());
    }

    #[test]
    fn regression_unknown_liveness_is_treated_as_busy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.lock");
        write_record(&path, 4_242);
        let manager =
            LockManager::new(&path).with_liveness(Arc::new(FixedLiveness(Liveness::Unknown)));
        assert!(matches!(manager.acquire(), Err(LockError::Busy { .. })));
    }

    #[test]
    fn regression_own_pid_in_lock_file_is_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.lock");
        write_record(&path, std::process::id());
        let manager =
            LockManager::new(&path).with_liveness(Arc::new(FixedLiveness(Liveness::Alive)));
        manager.acquire().expect("own pid lock is reclaimed");
    }

    #[test]
    fn regression_unreadable_lock_is_busy_until_grace_elapses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.lock");
        std::fs::write(&path, "").expect("write partial lock");

        let patient = LockManager::new(&path).with_unreadable_grace(Duration::from_secs(3_600));
        assert!(matches!(
            patient.acquire(),
            Err(LockError::Busy {
                owner_pid: None,
                ..
            })
        ));

        let impatient = LockManager::new(&path).with_unreadable_grace(Duration::ZERO);
        impatient.acquire().expect("reclaim unreadable lock");
    }

    #[test]
    fn unit_inspect_reports_vacant_held_and_unreadable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.lock");
        let manager =
            LockManager::new(&path).with_liveness(Arc::new(FixedLiveness(Liveness::Dead)));
        assert_eq!(manager.inspect().expect("inspect"), LockInspection::Vacant);

        write_record(&path, 7);
        assert!(matches!(
            manager.inspect().expect("inspect"),
            LockInspection::Held {
                liveness: Liveness::Dead,
                ..
            }
        ));

        std::fs::write(&path, "garbage").expect("write");
        assert_eq!(manager.inspect().expect("inspect"), LockInspection::Unreadable);
    }

    #[test]
    fn integration_signal_zero_probe_sees_current_process_alive() {
        assert_eq!(SignalZeroLiveness.probe(std::process::id()), Liveness::Alive);
        assert_eq!(SignalZeroLiveness.probe(0), Liveness::Dead);
    }
}
