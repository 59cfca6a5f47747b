//! Runs one unit-of-work child process per cycle.
//!
//! Output is streamed line by line into tracing under the
//! `cadence::unit_of_work` target. The child is terminated with SIGTERM and,
//! after the shutdown grace, SIGKILL when the cycle times out or the
//! orchestrator is cancelled. When the child exits on its own, anything it
//! left running in its process group gets SIGTERM before the output streams
//! are drained. Every path yields a [`CycleOutcome`]; nothing here is fatal
//! to the caller.

use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const ENV_CADENCE_CYCLE: &str = "CADENCE_CYCLE";
pub const ENV_CADENCE_CYCLE_REPORT: &str = "CADENCE_CYCLE_REPORT";
pub const ENV_CADENCE_LABEL: &str = "CADENCE_LABEL";
pub const UNIT_OF_WORK_LOG_TARGET: &str = "cadence::unit_of_work";
pub const DEFAULT_STDERR_TAIL_LINES: usize = 20;
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How to launch the external unit-of-work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWorkSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl UnitOfWorkSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unit-of-work program '{program}' was not found or is not executable")]
pub struct UnitOfWorkMissing {
    pub program: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleTermination {
    /// `code` is `None` when the child died from a signal.
    Exited { code: Option<i32> },
    TimedOut,
    Cancelled,
    SpawnFailed,
}

impl CycleTermination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exited { code: Some(0) } => "cycle_succeeded",
            Self::Exited { .. } => "cycle_non_zero_exit",
            Self::TimedOut => "cycle_timeout",
            Self::Cancelled => "cycle_cancelled",
            Self::SpawnFailed => "cycle_spawn_failed",
        }
    }
}

/// Result of one supervised cycle, folded into RunState by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub success: bool,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub termination: CycleTermination,
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    shutdown_grace: Duration,
    stderr_tail_lines: usize,
    cycle_report_path: Option<PathBuf>,
    label: Option<String>,
}

impl ProcessSupervisor {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            shutdown_grace,
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
            cycle_report_path: None,
            label: None,
        }
    }

    pub fn with_cycle_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cycle_report_path = Some(path.into());
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn with_stderr_tail_lines(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines;
        self
    }

    /// Confirms the unit-of-work program can be located before any cycle runs.
    pub fn preflight(&self, spec: &UnitOfWorkSpec) -> Result<PathBuf, UnitOfWorkMissing> {
        resolve_program(&spec.program, spec.working_dir.as_deref()).ok_or_else(|| {
            UnitOfWorkMissing {
                program: spec.program.clone(),
            }
        })
    }

    /// Runs one cycle to completion, timeout, or cancellation.
    pub async fn run_cycle(
        &self,
        spec: &UnitOfWorkSpec,
        cycle: u64,
        timeout: Duration,
        cancellation: &mut watch::Receiver<bool>,
    ) -> CycleOutcome {
        let started = Instant::now();
        if *cancellation.borrow() {
            return finish(cycle, started, CycleTermination::Cancelled, None);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .env(ENV_CADENCE_CYCLE, cycle.to_string());
        if let Some(working_dir) = spec.working_dir.as_ref() {
            command.current_dir(working_dir);
        }
        if let Some(report_path) = self.cycle_report_path.as_ref() {
            command.env(ENV_CADENCE_CYCLE_REPORT, report_path);
        }
        if let Some(label) = self.label.as_ref() {
            command.env(ENV_CADENCE_LABEL, label);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!(cycle, program = %spec.program, %error, "failed to spawn unit-of-work");
                return finish(
                    cycle,
                    started,
                    CycleTermination::SpawnFailed,
                    Some(format!(
                        "failed to spawn unit-of-work '{}': {error}",
                        spec.program
                    )),
                );
            }
        };
        // The id is gone once the child has been reaped.
        let group = child.id().and_then(|pid| i32::try_from(pid).ok());
        info!(cycle, pid = group, program = %spec.program, "unit-of-work started");

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(stream_lines(stdout, cycle, "stdout", 0)));
        let stderr_tail_lines = self.stderr_tail_lines;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(stream_lines(stderr, cycle, "stderr", stderr_tail_lines)));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = wait_for_cancellation(cancellation) => Waited::Cancelled,
        };
        let (termination, status_message) = match waited {
            Waited::Exited(Ok(status)) => (
                CycleTermination::Exited {
                    code: status.code(),
                },
                describe_exit_status(status),
            ),
            Waited::Exited(Err(error)) => (
                CycleTermination::Exited { code: None },
                Some(format!("failed to wait for unit-of-work: {error}")),
            ),
            Waited::TimedOut => {
                warn!(cycle, timeout_ms = duration_ms(timeout), "unit-of-work timed out");
                terminate_child(&mut child, self.shutdown_grace).await;
                (
                    CycleTermination::TimedOut,
                    Some(format!(
                        "cycle exceeded timeout of {}ms",
                        duration_ms(timeout)
                    )),
                )
            }
            Waited::Cancelled => {
                info!(cycle, "cancellation requested, terminating unit-of-work");
                terminate_child(&mut child, self.shutdown_grace).await;
                (
                    CycleTermination::Cancelled,
                    Some("cycle cancelled by shutdown request".to_string()),
                )
            }
        };

        let lingering_group = group.filter(|group| {
            matches!(termination, CycleTermination::Exited { .. })
                && terminate_lingering_group(cycle, *group)
        });

        if let Some(task) = stdout_task {
            let _ = drain_stream(task).await;
        }
        let stderr_tail = match stderr_task {
            Some(task) => drain_stream(task).await,
            None => VecDeque::new(),
        };
        if let Some(group) = lingering_group {
            let _ = killpg(Pid::from_raw(group), Signal::SIGKILL);
        }

        let error_message = status_message.map(|message| {
            if stderr_tail.is_empty() {
                message
            } else {
                let tail = stderr_tail.into_iter().collect::<Vec<_>>().join(" | ");
                format!("{message}; stderr: {tail}")
            }
        });
        finish(cycle, started, termination, error_message)
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

fn finish(
    cycle: u64,
    started: Instant,
    termination: CycleTermination,
    error_message: Option<String>,
) -> CycleOutcome {
    let success = matches!(termination, CycleTermination::Exited { code: Some(0) });
    CycleOutcome {
        cycle,
        success,
        duration_ms: duration_ms(started.elapsed()),
        error_message: if success { None } else { error_message },
        termination,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn describe_exit_status(status: ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    Some(match (status.code(), status.signal()) {
        (Some(code), _) => format!("unit-of-work exited with status {code}"),
        (None, Some(signal)) => format!("unit-of-work terminated by signal {signal}"),
        (None, None) => "unit-of-work exited abnormally".to_string(),
    })
}

/// Resolves once `cancellation` reads `true`. Pends forever if the sender is gone.
pub async fn wait_for_cancellation(cancellation: &mut watch::Receiver<bool>) {
    loop {
        if *cancellation.borrow_and_update() {
            return;
        }
        if cancellation.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM to the child's process group, then SIGKILL after `grace`.
async fn terminate_child(child: &mut Child, grace: Duration) {
    let Some(group) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(error) = killpg(Pid::from_raw(group), Signal::SIGTERM) {
        debug!(pid = group, %error, "SIGTERM delivery failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(
                pid = group,
                grace_ms = duration_ms(grace),
                "unit-of-work ignored SIGTERM, killing"
            );
            let _ = killpg(Pid::from_raw(group), Signal::SIGKILL);
            let _ = child.kill().await;
        }
    }
}

/// SIGTERM to processes the exited child left in its group. `true` if any were still running.
fn terminate_lingering_group(cycle: u64, group: i32) -> bool {
    match killpg(Pid::from_raw(group), Signal::SIGTERM) {
        Ok(()) => {
            info!(cycle, pid = group, "terminating processes left behind by unit-of-work");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(error) => {
            debug!(pid = group, %error, "SIGTERM delivery to lingering group failed");
            false
        }
    }
}

async fn drain_stream(mut task: JoinHandle<VecDeque<String>>) -> VecDeque<String> {
    match tokio::time::timeout(STREAM_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(error)) => {
            debug!(%error, "output stream task failed");
            VecDeque::new()
        }
        Err(_) => {
            task.abort();
            VecDeque::new()
        }
    }
}

async fn stream_lines<R>(
    reader: R,
    cycle: u64,
    stream: &'static str,
    tail_cap: usize,
) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut tail = VecDeque::with_capacity(tail_cap);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                let line = line.trim_end_matches(['\n', '\r']);
                info!(target: UNIT_OF_WORK_LOG_TARGET, cycle, stream, "{line}");
                if tail_cap > 0 {
                    if tail.len() == tail_cap {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            Err(error) => {
                debug!(cycle, stream, %error, "stopped reading unit-of-work output");
                break;
            }
        }
    }
    tail
}

/// Finds `program` the way a spawn would: as a path when it contains a
/// separator, otherwise through `PATH`.
pub fn resolve_program(program: &str, working_dir: Option<&Path>) -> Option<PathBuf> {
    let program = program.trim();
    if program.is_empty() {
        return None;
    }
    let as_path = Path::new(program);
    if program.contains(std::path::MAIN_SEPARATOR) {
        let candidate = match working_dir {
            Some(dir) if as_path.is_relative() => dir.join(as_path),
            _ => as_path.to_path_buf(),
        };
        return is_executable_file(&candidate).then_some(candidate);
    }
    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
