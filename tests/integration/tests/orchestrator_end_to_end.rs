use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use cadence_runtime::{
    CycleScheduler, LockRecord, OrchestratorConfig, StopReason, UnitOfWorkSpec, LOCK_FILE_NAME,
};
use cadence_state::{ArchiveStore, RunStateStore};
use serde_json::json;
use tokio::sync::watch;

/// Unit of work that records three improvements per cycle and, on cycle
/// `finish_cycle`, writes an inventory where every entity is consolidated.
fn reporting_unit_of_work(workspace: &Path, finish_cycle: u64) -> UnitOfWorkSpec {
    let inventory = workspace.join("inventory.json");
    let script = format!(
        r#"cat > "$CADENCE_CYCLE_REPORT" <<JSON
{{"improvements": [
  {{"type": "Consolidation", "subject": "entity-$CADENCE_CYCLE-a"}},
  {{"type": "fix", "subject": "entity-$CADENCE_CYCLE-b"}},
  {{"type": "", "subject": "entity-$CADENCE_CYCLE-c"}}
], "counters": {{"files_touched": 2}}}}
JSON
if [ "$CADENCE_CYCLE" -ge {finish_cycle} ]; then
  printf '%s' '{{"entities": [{{"name": "a", "consolidated": true, "version": "1.0.0"}}, {{"name": "b", "consolidated": true, "version": "1.0.0"}}]}}' > '{inventory}'
fi
"#,
        inventory = inventory.display()
    );
    UnitOfWorkSpec::new("sh")
        .with_args(vec!["-c".to_string(), script])
        .with_working_dir(workspace.to_path_buf())
}

fn fast_config(state_dir: PathBuf, unit_of_work: UnitOfWorkSpec) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(state_dir, unit_of_work);
    config.interval = Duration::from_millis(5);
    config.failure_backoff = Duration::from_millis(5);
    config.cycle_timeout = Duration::from_secs(20);
    config.shutdown_grace = Duration::from_millis(200);
    config
}

fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn short-lived process");
    let pid = child.id();
    child.wait().expect("reap short-lived process");
    pid
}

#[tokio::test]
async fn integration_orchestrator_ingests_compacts_and_stops_on_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = temp.path().join("workspace");
    fs::create_dir_all(&workspace).expect("workspace");
    let state_dir = temp.path().join("state");

    let mut config = fast_config(state_dir.clone(), reporting_unit_of_work(&workspace, 4));
    config.label = Some("consolidation".to_string());
    config.max_cycles = Some(20);
    config.compaction.max_live_improvements = 5;
    config.completion.check_every = 2;
    config.completion.inventory_path = Some(workspace.join("inventory.json"));
    config.completion.dependency_probe = Some("true".to_string());
    config.completion.build_probe = Some("echo compiled".to_string());
    config.validate().expect("valid config");

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = CycleScheduler::new(config)
        .run(cancel_rx)
        .await
        .expect("scheduler run");

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.cycles_run, 4);
    let verdict = report.last_verdict.expect("completion verdict");
    assert!(verdict.passed);
    assert!((verdict.score - 1.0).abs() < f64::EPSILON);

    let state = RunStateStore::in_state_dir(&state_dir)
        .read_existing()
        .expect("read state")
        .expect("state exists");
    assert_eq!(state.current_cycle, 4);
    assert_eq!(state.label.as_deref(), Some("consolidation"));
    assert_eq!(state.last_stop_reason.as_deref(), Some("completed"));
    assert_eq!(state.counter("files_touched"), 8);
    assert_eq!(state.counter("cycle_succeeded"), 4);
    assert!(state.improvements.len() <= 5);
    assert_eq!(
        state.improvements.len() as u64 + state.total_archived_improvements(),
        12
    );
    assert!(state
        .improvements
        .iter()
        .all(|record| record.kind == record.kind.to_ascii_lowercase() && !record.kind.is_empty()));

    let archive = ArchiveStore::in_state_dir(&state_dir)
        .read_existing()
        .expect("read archive")
        .expect("archive exists");
    assert_eq!(archive.total_archived, state.total_archived_improvements());
    let sequences: Vec<u64> = archive.entries.iter().map(|entry| entry.sequence).collect();
    let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
    assert_eq!(sequences, expected);

    let events = fs::read_to_string(state_dir.join("cycle-events.jsonl")).expect("events");
    assert_eq!(events.lines().count(), 4);
    let summary = fs::read_to_string(state_dir.join("summary.md")).expect("summary");
    assert!(summary.contains("consolidation"));
    assert!(!state_dir.join(LOCK_FILE_NAME).exists());
    assert!(!state_dir.join("cycle-report.json").exists());
}

#[tokio::test]
async fn regression_orchestrator_reclaims_dead_owner_lock_and_resumes_cycles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = temp.path().join("workspace");
    fs::create_dir_all(&workspace).expect("workspace");
    let state_dir = temp.path().join("state");

    let unit = reporting_unit_of_work(&workspace, 1_000_000);
    let mut first = fast_config(state_dir.clone(), unit.clone());
    first.max_cycles = Some(2);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = CycleScheduler::new(first)
        .run(cancel_rx)
        .await
        .expect("first run");
    assert_eq!(report.stop_reason, StopReason::MaxCyclesReached);

    let stale = LockRecord {
        owner_pid: exited_pid(),
        acquired_unix_ms: 1,
    };
    fs::write(
        state_dir.join(LOCK_FILE_NAME),
        serde_json::to_string(&stale).expect("encode lock"),
    )
    .expect("write stale lock");

    let mut second = fast_config(state_dir.clone(), unit);
    second.max_cycles = Some(3);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = CycleScheduler::new(second)
        .run(cancel_rx)
        .await
        .expect("resumed run");

    assert_eq!(report.stop_reason, StopReason::MaxCyclesReached);
    assert_eq!(report.cycles_run, 1);
    assert_eq!(report.state.current_cycle, 3);
    assert_eq!(report.state.counter("files_touched"), 6);
    assert!(!state_dir.join(LOCK_FILE_NAME).exists());
}

#[tokio::test]
async fn integration_orchestrator_cancellation_preserves_progress() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state_dir = temp.path().join("state");
    fs::create_dir_all(&state_dir).expect("state dir");
    fs::write(
        state_dir.join("state.json"),
        json!({"current_cycle": 7, "preserved_learnings": ["keep"]}).to_string(),
    )
    .expect("seed state");

    let unit = UnitOfWorkSpec::new("sleep").with_args(vec!["30".to_string()]);
    let config = fast_config(state_dir.clone(), unit);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let scheduler = CycleScheduler::new(config);
    let mut phase = scheduler.subscribe_phase();
    let canceller = tokio::spawn(async move {
        phase
            .wait_for(|phase| matches!(phase, cadence_runtime::SchedulerPhase::Running { .. }))
            .await
            .expect("phase channel open");
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).expect("send cancel");
    });

    let report = tokio::time::timeout(Duration::from_secs(20), scheduler.run(cancel_rx))
        .await
        .expect("scheduler stops promptly")
        .expect("scheduler run");
    canceller.await.expect("canceller task");

    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.state.current_cycle, 8);
    assert_eq!(report.state.preserved_learnings, vec![json!("keep")]);
    assert_eq!(report.state.counter("cycle_cancelled"), 1);
}
