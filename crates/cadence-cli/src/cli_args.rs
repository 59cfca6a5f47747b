use std::path::PathBuf;
use std::time::Duration;

use cadence_core::{parse_rfc3339_unix_ms, LogRetention};
use cadence_runtime::{CompletionConfig, OrchestratorConfig, UnitOfWorkSpec, DEFAULT_STATE_DIR};
use cadence_state::CompactionPolicy;
use clap::Parser;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_unit_ratio(value: &str) -> Result<f64, String> {
    let parsed = value
        .parse::<f64>()
        .map_err(|error| format!("failed to parse ratio: {error}"))?;
    if !parsed.is_finite() || !(0.0..=1.0).contains(&parsed) {
        return Err("value must be within 0.0..=1.0".to_string());
    }
    Ok(parsed)
}

fn parse_deadline(value: &str) -> Result<u64, String> {
    parse_rfc3339_unix_ms(value)
}

#[derive(Debug, Parser)]
#[command(
    name = "cadence",
    about = "Runs an external unit-of-work in supervised cycles until the job is done",
    version
)]
pub(crate) struct Cli {
    #[arg(
        value_name = "LABEL",
        help = "Optional run label recorded in state, summaries, and crash logs"
    )]
    pub(crate) label: Option<String>,

    #[arg(
        long = "unit-of-work",
        env = "CADENCE_UNIT_OF_WORK",
        value_name = "PROGRAM",
        help = "Program executed once per cycle; exit status 0 means success"
    )]
    pub(crate) unit_of_work: Option<String>,

    #[arg(
        long = "unit-of-work-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        help = "Argument passed to the unit-of-work; repeat for several"
    )]
    pub(crate) unit_of_work_args: Vec<String>,

    #[arg(
        long = "working-dir",
        env = "CADENCE_WORKING_DIR",
        help = "Working directory for the unit-of-work and completion probes"
    )]
    pub(crate) working_dir: Option<PathBuf>,

    #[arg(
        long = "state-dir",
        env = "CADENCE_STATE_DIR",
        default_value = DEFAULT_STATE_DIR,
        help = "Directory holding state, archive, lock, and report files"
    )]
    pub(crate) state_dir: PathBuf,

    #[arg(
        long = "interval-ms",
        env = "CADENCE_INTERVAL_MS",
        default_value_t = 150_000,
        value_parser = parse_positive_u64,
        help = "Sleep between cycles after a successful cycle"
    )]
    pub(crate) interval_ms: u64,

    #[arg(
        long = "failure-backoff-ms",
        env = "CADENCE_FAILURE_BACKOFF_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Fixed sleep after a failed cycle"
    )]
    pub(crate) failure_backoff_ms: u64,

    #[arg(
        long = "cycle-timeout-ms",
        env = "CADENCE_CYCLE_TIMEOUT_MS",
        default_value_t = 1_800_000,
        value_parser = parse_positive_u64,
        help = "Hard timeout for one unit-of-work run"
    )]
    pub(crate) cycle_timeout_ms: u64,

    #[arg(
        long = "shutdown-grace-ms",
        env = "CADENCE_SHUTDOWN_GRACE_MS",
        default_value_t = 5_000,
        help = "Time between SIGTERM and SIGKILL when terminating the unit-of-work"
    )]
    pub(crate) shutdown_grace_ms: u64,

    #[arg(
        long = "max-cycles",
        env = "CADENCE_MAX_CYCLES",
        value_parser = parse_positive_u64,
        help = "Hard ceiling on the cycle count since cold start"
    )]
    pub(crate) max_cycles: Option<u64>,

    #[arg(
        long = "run-duration-ms",
        env = "CADENCE_RUN_DURATION_MS",
        value_parser = parse_positive_u64,
        help = "Run length from cold start; also sets the planned cycle count when --max-cycles is absent"
    )]
    pub(crate) run_duration_ms: Option<u64>,

    #[arg(
        long = "deadline",
        env = "CADENCE_DEADLINE",
        value_parser = parse_deadline,
        help = "Absolute RFC 3339 deadline recorded at cold start"
    )]
    pub(crate) deadline: Option<u64>,

    #[arg(
        long = "completion-check-every",
        env = "CADENCE_COMPLETION_CHECK_EVERY",
        default_value_t = 10,
        value_parser = parse_positive_u64,
        help = "Evaluate completion after every Nth cycle"
    )]
    pub(crate) completion_check_every: u64,

    #[arg(
        long = "completion-threshold",
        env = "CADENCE_COMPLETION_THRESHOLD",
        default_value_t = 0.8,
        value_parser = parse_unit_ratio,
        help = "Fraction of completion checks that must pass"
    )]
    pub(crate) completion_threshold: f64,

    #[arg(
        long = "consolidation-ratio",
        env = "CADENCE_CONSOLIDATION_RATIO",
        default_value_t = 0.95,
        value_parser = parse_unit_ratio
    )]
    pub(crate) consolidation_ratio: f64,

    #[arg(
        long = "version-ratio",
        env = "CADENCE_VERSION_RATIO",
        default_value_t = 0.90,
        value_parser = parse_unit_ratio
    )]
    pub(crate) version_ratio: f64,

    #[arg(
        long = "version-sample-size",
        env = "CADENCE_VERSION_SAMPLE_SIZE",
        default_value_t = 20,
        value_parser = parse_positive_usize,
        help = "Number of leading inventory entities sampled for version uniformity"
    )]
    pub(crate) version_sample_size: usize,

    #[arg(
        long = "target-version",
        env = "CADENCE_TARGET_VERSION",
        default_value = "1.0.0"
    )]
    pub(crate) target_version: String,

    #[arg(
        long = "inventory-path",
        env = "CADENCE_INVENTORY_PATH",
        help = "JSON entity inventory: {\"entities\": [{\"name\", \"consolidated\", \"version\"}]}"
    )]
    pub(crate) inventory_path: Option<PathBuf>,

    #[arg(
        long = "dependency-probe",
        env = "CADENCE_DEPENDENCY_PROBE",
        help = "Shell command whose output must not contain an unresolved-dependency marker"
    )]
    pub(crate) dependency_probe: Option<String>,

    #[arg(
        long = "build-probe",
        env = "CADENCE_BUILD_PROBE",
        help = "Shell command that must exit 0 with no error markers in its output tail"
    )]
    pub(crate) build_probe: Option<String>,

    #[arg(
        long = "unresolved-marker",
        env = "CADENCE_UNRESOLVED_MARKERS",
        value_delimiter = ',',
        help = "Overrides the default unresolved-dependency markers"
    )]
    pub(crate) unresolved_markers: Vec<String>,

    #[arg(
        long = "build-error-marker",
        env = "CADENCE_BUILD_ERROR_MARKERS",
        value_delimiter = ',',
        help = "Overrides the default build error markers"
    )]
    pub(crate) build_error_markers: Vec<String>,

    #[arg(
        long = "build-tail-lines",
        env = "CADENCE_BUILD_TAIL_LINES",
        default_value_t = 50,
        value_parser = parse_positive_usize
    )]
    pub(crate) build_tail_lines: usize,

    #[arg(
        long = "probe-timeout-ms",
        env = "CADENCE_PROBE_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64
    )]
    pub(crate) probe_timeout_ms: u64,

    #[arg(
        long = "max-live-improvements",
        env = "CADENCE_MAX_LIVE_IMPROVEMENTS",
        default_value_t = 1_000,
        value_parser = parse_positive_usize
    )]
    pub(crate) max_live_improvements: usize,

    #[arg(
        long = "max-live-errors",
        env = "CADENCE_MAX_LIVE_ERRORS",
        default_value_t = 500,
        value_parser = parse_positive_usize
    )]
    pub(crate) max_live_errors: usize,

    #[arg(
        long = "max-preserved-learnings",
        env = "CADENCE_MAX_PRESERVED_LEARNINGS",
        default_value_t = 200,
        value_parser = parse_positive_usize,
        help = "Learnings kept in run state; older ones move to the archive"
    )]
    pub(crate) max_preserved_learnings: usize,

    #[arg(
        long = "compaction-size-threshold-bytes",
        env = "CADENCE_COMPACTION_SIZE_THRESHOLD_BYTES",
        default_value_t = 5 * 1024 * 1024,
        value_parser = parse_positive_u64
    )]
    pub(crate) compaction_size_threshold_bytes: u64,

    #[arg(
        long = "event-log-max-bytes",
        env = "CADENCE_EVENT_LOG_MAX_BYTES",
        default_value_t = 10 * 1024 * 1024,
        help = "Size at which cycle-events.jsonl and crash-log.jsonl rotate; 0 disables rotation"
    )]
    pub(crate) event_log_max_bytes: u64,

    #[arg(
        long = "event-log-backups",
        env = "CADENCE_EVENT_LOG_BACKUPS",
        default_value_t = 4,
        help = "Rotated log files kept next to the active one"
    )]
    pub(crate) event_log_backups: usize,

    #[arg(
        long = "unreadable-lock-grace-ms",
        env = "CADENCE_UNREADABLE_LOCK_GRACE_MS",
        default_value_t = 5_000,
        help = "Age after which an unparseable lock file is considered abandoned"
    )]
    pub(crate) unreadable_lock_grace_ms: u64,

    #[arg(
        long = "status",
        conflicts_with = "reset",
        help = "Print a JSON status report for the state directory and exit"
    )]
    pub(crate) status: bool,

    #[arg(
        long = "reset",
        help = "Reset run state, keeping preserved learnings; refused while another orchestrator runs"
    )]
    pub(crate) reset: bool,
}

impl Cli {
    pub(crate) fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut unit_of_work = UnitOfWorkSpec::new(self.unit_of_work.clone().unwrap_or_default())
            .with_args(self.unit_of_work_args.iter().cloned());
        if let Some(working_dir) = self.working_dir.as_ref() {
            unit_of_work = unit_of_work.with_working_dir(working_dir);
        }

        let defaults = CompletionConfig::default();
        let completion = CompletionConfig {
            check_every: self.completion_check_every,
            threshold: self.completion_threshold,
            consolidation_ratio: self.consolidation_ratio,
            version_ratio: self.version_ratio,
            version_sample_size: self.version_sample_size,
            target_version: self.target_version.clone(),
            inventory_path: self.inventory_path.clone(),
            dependency_probe: self.dependency_probe.clone(),
            build_probe: self.build_probe.clone(),
            build_tail_lines: self.build_tail_lines,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            probe_working_dir: self.working_dir.clone(),
            unresolved_markers: non_empty_or(&self.unresolved_markers, defaults.unresolved_markers),
            build_error_markers: non_empty_or(
                &self.build_error_markers,
                defaults.build_error_markers,
            ),
        };

        let mut config = OrchestratorConfig::new(self.state_dir.clone(), unit_of_work);
        config.label = self.label.clone();
        config.interval = Duration::from_millis(self.interval_ms);
        config.failure_backoff = Duration::from_millis(self.failure_backoff_ms);
        config.cycle_timeout = Duration::from_millis(self.cycle_timeout_ms);
        config.shutdown_grace = Duration::from_millis(self.shutdown_grace_ms);
        config.max_cycles = self.max_cycles;
        config.run_duration = self.run_duration_ms.map(Duration::from_millis);
        config.deadline_unix_ms = self.deadline;
        config.completion = completion;
        config.compaction = CompactionPolicy {
            size_threshold_bytes: self.compaction_size_threshold_bytes,
            max_live_improvements: self.max_live_improvements,
            max_live_errors: self.max_live_errors,
            max_preserved_learnings: self.max_preserved_learnings,
        };
        config.log_retention = LogRetention {
            max_bytes: self.event_log_max_bytes,
            backups: self.event_log_backups,
        };
        config.unreadable_lock_grace = Duration::from_millis(self.unreadable_lock_grace_ms);
        config
    }
}

fn non_empty_or(values: &[String], fallback: Vec<String>) -> Vec<String> {
    let values = values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if values.is_empty() {
        fallback
    } else {
        values
    }
}
