//! Multi-signal "is the job done" heuristic.
//!
//! Signals are gathered through [`CompletionSignalSource`] and scored by
//! [`CompletionDetector::evaluate`]. A check that cannot be evaluated counts
//! as failed; nothing is skipped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

pub const DEFAULT_COMPLETION_CHECK_EVERY: u64 = 10;
pub const DEFAULT_COMPLETION_THRESHOLD: f64 = 0.8;
pub const DEFAULT_CONSOLIDATION_RATIO: f64 = 0.95;
pub const DEFAULT_VERSION_RATIO: f64 = 0.90;
pub const DEFAULT_VERSION_SAMPLE_SIZE: usize = 20;
pub const DEFAULT_TARGET_VERSION: &str = "1.0.0";
pub const DEFAULT_BUILD_TAIL_LINES: usize = 50;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_UNRESOLVED_MARKERS: [&str; 1] = ["ERR_PNPM_WORKSPACE_PKG_NOT_FOUND"];
pub const DEFAULT_BUILD_ERROR_MARKERS: [&str; 4] = ["error", "Error", "failed", "Failed"];

pub const CHECK_CONSOLIDATION: &str = "consolidation";
pub const CHECK_VERSION_UNIFORMITY: &str = "version_uniformity";
pub const CHECK_DEPENDENCIES: &str = "dependencies";
pub const CHECK_BUILD: &str = "build";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionConfig {
    /// Evaluate after every `check_every`-th cycle.
    pub check_every: u64,
    pub threshold: f64,
    pub consolidation_ratio: f64,
    pub version_ratio: f64,
    pub version_sample_size: usize,
    pub target_version: String,
    pub inventory_path: Option<PathBuf>,
    /// Shell command run with `sh -c`.
    pub dependency_probe: Option<String>,
    pub build_probe: Option<String>,
    pub build_tail_lines: usize,
    pub probe_timeout: Duration,
    pub probe_working_dir: Option<PathBuf>,
    pub unresolved_markers: Vec<String>,
    pub build_error_markers: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            check_every: DEFAULT_COMPLETION_CHECK_EVERY,
            threshold: DEFAULT_COMPLETION_THRESHOLD,
            consolidation_ratio: DEFAULT_CONSOLIDATION_RATIO,
            version_ratio: DEFAULT_VERSION_RATIO,
            version_sample_size: DEFAULT_VERSION_SAMPLE_SIZE,
            target_version: DEFAULT_TARGET_VERSION.to_string(),
            inventory_path: None,
            dependency_probe: None,
            build_probe: None,
            build_tail_lines: DEFAULT_BUILD_TAIL_LINES,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_working_dir: None,
            unresolved_markers: DEFAULT_UNRESOLVED_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
            build_error_markers: DEFAULT_BUILD_ERROR_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }
}

impl CompletionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_every == 0 {
            bail!("completion_check_every must be greater than 0");
        }
        ensure_unit_interval(self.threshold, "completion_threshold")?;
        ensure_unit_interval(self.consolidation_ratio, "consolidation_ratio")?;
        ensure_unit_interval(self.version_ratio, "version_ratio")?;
        if self.version_sample_size == 0 {
            bail!("version_sample_size must be greater than 0");
        }
        if self.build_tail_lines == 0 {
            bail!("build_tail_lines must be greater than 0");
        }
        if self.probe_timeout.is_zero() {
            bail!("probe_timeout must be greater than 0");
        }
        Ok(())
    }

    /// True when cycle number `cycle` should be followed by an evaluation.
    pub fn is_check_due(&self, cycle: u64) -> bool {
        cycle > 0 && self.check_every > 0 && cycle % self.check_every == 0
    }
}

fn ensure_unit_interval(value: f64, field_name: &str) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        bail!("{field_name} must be within [0, 1]");
    }
    Ok(())
}

/// One entry of the entity inventory document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryEntity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub consolidated: bool,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InventoryDocument {
    #[serde(default)]
    entities: Vec<InventoryEntity>,
}

pub fn parse_inventory_document(raw: &str) -> serde_json::Result<Vec<InventoryEntity>> {
    serde_json::from_str::<InventoryDocument>(raw).map(|document| document.entities)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventorySignal {
    Unconfigured,
    Unavailable { reason: String },
    Loaded(Vec<InventoryEntity>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSignal {
    Unconfigured,
    /// Spawn error or timeout.
    Failed { reason: String },
    Completed {
        exit_code: Option<i32>,
        output: String,
    },
}

/// Raw evidence gathered for one completion evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignals {
    pub inventory: InventorySignal,
    pub dependency_probe: ProbeSignal,
    pub build_probe: ProbeSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionVerdict {
    pub score: f64,
    pub passed: bool,
    pub checks: Vec<CompletionCheck>,
}

impl CompletionVerdict {
    /// Scores a list of pass/fail checks against `threshold`.
    pub fn from_checks(checks: Vec<CompletionCheck>, threshold: f64) -> Self {
        let total = checks.len();
        let passed_count = checks.iter().filter(|check| check.passed).count();
        let score = if total == 0 {
            0.0
        } else {
            passed_count as f64 / total as f64
        };
        Self {
            score,
            passed: total > 0 && score >= threshold,
            checks,
        }
    }
}

#[async_trait]
pub trait CompletionSignalSource: Send + Sync {
    async fn collect(&self) -> CompletionSignals;
}

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    config: CompletionConfig,
}

impl CompletionDetector {
    pub fn new(config: CompletionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    pub fn evaluate(&self, signals: &CompletionSignals) -> CompletionVerdict {
        let checks = vec![
            self.consolidation_check(&signals.inventory),
            self.version_check(&signals.inventory),
            self.dependency_check(&signals.dependency_probe),
            self.build_check(&signals.build_probe),
        ];
        let verdict = CompletionVerdict::from_checks(checks, self.config.threshold);
        info!(
            score = verdict.score,
            passed = verdict.passed,
            threshold = self.config.threshold,
            "completion evaluated"
        );
        verdict
    }

    fn consolidation_check(&self, inventory: &InventorySignal) -> CompletionCheck {
        let entities = match inventory_entities(inventory) {
            Ok(entities) => entities,
            Err(detail) => return failed(CHECK_CONSOLIDATION, detail),
        };
        let consolidated = entities.iter().filter(|entity| entity.consolidated).count();
        let ratio = consolidated as f64 / entities.len() as f64;
        CompletionCheck {
            name: CHECK_CONSOLIDATION,
            passed: ratio >= self.config.consolidation_ratio,
            detail: format!(
                "{consolidated}/{} consolidated (ratio {ratio:.3}, need {:.3})",
                entities.len(),
                self.config.consolidation_ratio
            ),
        }
    }

    fn version_check(&self, inventory: &InventorySignal) -> CompletionCheck {
        let entities = match inventory_entities(inventory) {
            Ok(entities) => entities,
            Err(detail) => return failed(CHECK_VERSION_UNIFORMITY, detail),
        };
        let sample = &entities[..entities.len().min(self.config.version_sample_size)];
        let target = self.config.target_version.as_str();
        let at_target = sample
            .iter()
            .filter(|entity| entity.version.as_deref() == Some(target))
            .count();
        let ratio = at_target as f64 / sample.len() as f64;
        CompletionCheck {
            name: CHECK_VERSION_UNIFORMITY,
            passed: ratio >= self.config.version_ratio,
            detail: format!(
                "{at_target}/{} sampled at {} (ratio {ratio:.3}, need {:.3})",
                sample.len(),
                self.config.target_version,
                self.config.version_ratio
            ),
        }
    }

    fn dependency_check(&self, probe: &ProbeSignal) -> CompletionCheck {
        match probe {
            ProbeSignal::Unconfigured => {
                failed(CHECK_DEPENDENCIES, "dependency probe not configured")
            }
            ProbeSignal::Failed { reason } => failed(CHECK_DEPENDENCIES, reason.clone()),
            ProbeSignal::Completed { output, .. } => {
                let hits = count_marker_lines(output.lines(), &self.config.unresolved_markers);
                CompletionCheck {
                    name: CHECK_DEPENDENCIES,
                    passed: hits == 0,
                    detail: format!("{hits} unresolved dependency lines"),
                }
            }
        }
    }

    fn build_check(&self, probe: &ProbeSignal) -> CompletionCheck {
        match probe {
            ProbeSignal::Unconfigured => failed(CHECK_BUILD, "build probe not configured"),
            ProbeSignal::Failed { reason } => failed(CHECK_BUILD, reason.clone()),
            ProbeSignal::Completed { exit_code, output } => {
                let lines = output.lines().collect::<Vec<_>>();
                let tail_start = lines.len().saturating_sub(self.config.build_tail_lines);
                let hits = count_marker_lines(
                    lines[tail_start..].iter().copied(),
                    &self.config.build_error_markers,
                );
                CompletionCheck {
                    name: CHECK_BUILD,
                    passed: *exit_code == Some(0) && hits == 0,
                    detail: format!(
                        "exit {} with {hits} error lines in last {} lines",
                        exit_code
                            .map(|code| code.to_string())
                            .unwrap_or_else(|| "signal".to_string()),
                        lines.len() - tail_start
                    ),
                }
            }
        }
    }
}

fn inventory_entities(inventory: &InventorySignal) -> Result<&[InventoryEntity], String> {
    match inventory {
        InventorySignal::Unconfigured => Err("inventory not configured".to_string()),
        InventorySignal::Unavailable { reason } => Err(reason.clone()),
        InventorySignal::Loaded(entities) if entities.is_empty() => {
            Err("inventory is empty".to_string())
        }
        InventorySignal::Loaded(entities) => Ok(entities),
    }
}

fn failed(name: &'static str, detail: impl Into<String>) -> CompletionCheck {
    CompletionCheck {
        name,
        passed: false,
        detail: detail.into(),
    }
}

fn count_marker_lines<'a>(lines: impl Iterator<Item = &'a str>, markers: &[String]) -> usize {
    lines
        .filter(|line| markers.iter().any(|marker| line.contains(marker.as_str())))
        .count()
}

/// Reads the inventory document and runs both probes with `probe_timeout`.
#[derive(Debug, Clone)]
pub struct ExternalCompletionSignals {
    inventory_path: Option<PathBuf>,
    dependency_probe: Option<String>,
    build_probe: Option<String>,
    probe_timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ExternalCompletionSignals {
    pub fn from_config(config: &CompletionConfig) -> Self {
        Self {
            inventory_path: config.inventory_path.clone(),
            dependency_probe: config.dependency_probe.clone(),
            build_probe: config.build_probe.clone(),
            probe_timeout: config.probe_timeout,
            working_dir: config.probe_working_dir.clone(),
        }
    }

    async fn read_inventory(&self) -> InventorySignal {
        let Some(path) = self.inventory_path.as_ref() else {
            return InventorySignal::Unconfigured;
        };
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(error) => {
                return InventorySignal::Unavailable {
                    reason: format!("failed to read inventory {}: {error}", path.display()),
                }
            }
        };
        match parse_inventory_document(&raw) {
            Ok(entities) => InventorySignal::Loaded(entities),
            Err(error) => InventorySignal::Unavailable {
                reason: format!("failed to parse inventory {}: {error}", path.display()),
            },
        }
    }

    async fn run_probe(&self, probe: Option<&str>) -> ProbeSignal {
        let Some(script) = probe else {
            return ProbeSignal::Unconfigured;
        };
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(working_dir) = self.working_dir.as_ref() {
            command.current_dir(working_dir);
        }
        match tokio::time::timeout(self.probe_timeout, command.output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                ProbeSignal::Completed {
                    exit_code: output.status.code(),
                    output: combined,
                }
            }
            Ok(Err(error)) => {
                warn!(probe = script, %error, "completion probe failed to run");
                ProbeSignal::Failed {
                    reason: format!("probe failed to run: {error}"),
                }
            }
            Err(_) => {
                warn!(probe = script, "completion probe timed out");
                ProbeSignal::Failed {
                    reason: format!(
                        "probe timed out after {}ms",
                        self.probe_timeout.as_millis()
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl CompletionSignalSource for ExternalCompletionSignals {
    async fn collect(&self) -> CompletionSignals {
        let (inventory, dependency_probe, build_probe) = tokio::join!(
            self.read_inventory(),
            self.run_probe(self.dependency_probe.as_deref()),
            self.run_probe(self.build_probe.as_deref()),
        );
        CompletionSignals {
            inventory,
            dependency_probe,
            build_probe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CompletionCheck, CompletionConfig, CompletionDetector, CompletionSignalSource,
        CompletionSignals, CompletionVerdict, ExternalCompletionSignals, InventoryEntity,
        InventorySignal, ProbeSignal,
    };
    use std::time::Duration;

    fn entity(index: usize, consolidated: bool, version: &str) -> InventoryEntity {
        InventoryEntity {
            name: format!("package-{index}"),
            consolidated,
            version: Some(version.to_string()),
        }
    }

    fn clean_probe() -> ProbeSignal {
        ProbeSignal::Completed {
            exit_code: Some(0),
            output: "done in 4.2s\n".to_string(),
        }
    }

    fn healthy_signals() -> CompletionSignals {
        CompletionSignals {
            inventory: InventorySignal::Loaded(
                (0..40).map(|index| entity(index, true, "1.0.0")).collect(),
            ),
            dependency_probe: clean_probe(),
            build_probe: clean_probe(),
        }
    }

    fn check(passed: bool) -> CompletionCheck {
        CompletionCheck {
            name: "synthetic",
            passed,
            detail: String::new(),
        }
    }

    #[test]
    fn unit_three_of_four_checks_score_below_default_threshold() {
        let verdict = CompletionVerdict::from_checks(
            vec![check(true), check(true), check(true), check(false)],
            0.8,
        );
        assert_eq!(verdict.score, 0.75);
        assert!(!verdict.passed);
    }

    #[test]
    fn unit_all_checks_passing_scores_one() {
        let verdict = CompletionVerdict::from_checks(vec![check(true); 4], 0.8);
        assert_eq!(verdict.score, 1.0);
        assert!(verdict.passed);
    }

    #[test]
    fn functional_healthy_signals_pass_every_check() {
        let detector = CompletionDetector::new(CompletionConfig::default());
        let verdict = detector.evaluate(&healthy_signals());
        assert_eq!(verdict.score, 1.0);
        assert!(verdict.passed);
        assert!(verdict.checks.iter().all(|check| check.passed));
    }

    #[test]
    fn functional_failing_build_tail_drops_score_to_three_quarters() {
        let detector = CompletionDetector::new(CompletionConfig::default());
        let mut signals = healthy_signals();
        signals.build_probe = ProbeSignal::Completed {
            exit_code: Some(0),
            output: "compiling\nError: cannot resolve module\n".to_string(),
        };
        let verdict = detector.evaluate(&signals);
        assert_eq!(verdict.score, 0.75);
        assert!(!verdict.passed);
    }

    #[test]
    fn unit_build_markers_outside_tail_are_ignored() {
        let config = CompletionConfig {
            build_tail_lines: 2,
            ..CompletionConfig::default()
        };
        let detector = CompletionDetector::new(config);
        let mut signals = healthy_signals();
        signals.build_probe = ProbeSignal::Completed {
            exit_code: Some(0),
            output: "warning: Failed optional step\nok\nok\n".to_string(),
        };
        assert!(detector.evaluate(&signals).passed);
        assert_eq!(detector.evaluate(&signals).score, 1.0);
    }

    #[test]
    fn unit_build_non_zero_exit_fails_check() {
        let detector = CompletionDetector::new(CompletionConfig::default());
        let mut signals = healthy_signals();
        signals.build_probe = ProbeSignal::Completed {
            exit_code: Some(2),
            output: "clean output\n".to_string(),
        };
        assert_eq!(detector.evaluate(&signals).score, 0.75);
    }

    #[test]
    fn functional_version_check_only_samples_leading_entities() {
        let detector = CompletionDetector::new(CompletionConfig::default());
        let mut entities = (0..20).map(|index| entity(index, true, "1.0.0")).collect::<Vec<_>>();
        entities.extend((20..60).map(|index| entity(index, true, "0.3.0")));
        let mut signals = healthy_signals();
        signals.inventory = InventorySignal::Loaded(entities);
        let verdict = detector.evaluate(&signals);
        let version = verdict
            .checks
            .iter()
            .find(|check| check.name == "version_uniformity")
            .expect("version check");
        assert!(version.passed, "{}", version.detail);
    }

    #[test]
    fn regression_consolidation_ratio_boundary_is_inclusive() {
        let detector = CompletionDetector::new(CompletionConfig::default());
        let mut entities = (0..19).map(|index| entity(index, true, "1.0.0")).collect::<Vec<_>>();
        entities.push(entity(19, false, "1.0.0"));
        let mut signals = healthy_signals();
        signals.inventory = InventorySignal::Loaded(entities);
        let verdict = detector.evaluate(&signals);
        assert!(verdict.checks[0].passed, "{}", verdict.checks[0].detail);
    }

    #[test]
    fn regression_unconfigured_signals_count_as_failed_checks() {
        let detector = CompletionDetector::new(CompletionConfig::default());
        let verdict = detector.evaluate(&CompletionSignals {
            inventory: InventorySignal::Unconfigured,
            dependency_probe: ProbeSignal::Unconfigured,
            build_probe: ProbeSignal::Failed {
                reason: "probe timed out".to_string(),
            },
        });
        assert_eq!(verdict.checks.len(), 4);
        assert_eq!(verdict.score, 0.0);
        assert!(!verdict.passed);
    }

    #[test]
    fn unit_empty_inventory_fails_inventory_checks() {
        let detector = CompletionDetector::new(CompletionConfig::default());
        let mut signals = healthy_signals();
        signals.inventory = InventorySignal::Loaded(Vec::new());
        assert_eq!(detector.evaluate(&signals).score, 0.5);
    }

    #[test]
    fn unit_is_check_due_every_k_cycles() {
        let config = CompletionConfig {
            check_every: 3,
            ..CompletionConfig::default()
        };
        assert!(!config.is_check_due(0));
        assert!(!config.is_check_due(2));
        assert!(config.is_check_due(3));
        assert!(config.is_check_due(6));
    }

    #[tokio::test]
    async fn integration_external_signals_read_inventory_and_run_probes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inventory = temp.path().join("inventory.json");
        std::fs::write(
            &inventory,
            r#"{"entities": [{"name": "core", "consolidated": true, "version": "1.0.0"}]}"#,
        )
        .expect("write inventory");
        let config = CompletionConfig {
            inventory_path: Some(inventory),
            dependency_probe: Some("echo ERR_PNPM_WORKSPACE_PKG_NOT_FOUND >&2".to_string()),
            build_probe: Some("echo built".to_string()),
            probe_timeout: Duration::from_secs(10),
            ..CompletionConfig::default()
        };
        let signals = ExternalCompletionSignals::from_config(&config).collect().await;
        assert!(matches!(
            signals.inventory,
            InventorySignal::Loaded(ref entities) if entities.len() == 1
        ));
        let verdict = CompletionDetector::new(config).evaluate(&signals);
        assert_eq!(verdict.score, 0.75);
        assert!(!verdict.checks[2].passed);
    }

    #[tokio::test]
    async fn integration_probe_timeout_is_a_failed_signal() {
        let config = CompletionConfig {
            build_probe: Some("sleep 5".to_string()),
            probe_timeout: Duration::from_millis(100),
            ..CompletionConfig::default()
        };
        let signals = ExternalCompletionSignals::from_config(&config).collect().await;
        assert!(matches!(signals.build_probe, ProbeSignal::Failed { .. }));
        assert_eq!(signals.inventory, InventorySignal::Unconfigured);
    }
}
