#![cfg(unix)]

use image_registration::config::{AmbiguityPolicy, ArtifactConfig, EngineConfig};
use image_registration::data::FileSceneIo;
use image_registration::logging::MemorySink;
use image_registration::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::oneshot;

// Scripts are written and executed in the same process; running the tests
// one at a time keeps a concurrent fork from holding a script open for writing.
static SERIAL: Mutex<()> = Mutex::new(());

const RESULT_TFM: &str = "#Insight Transform File V1.0
#Transform 0
Transform: AffineTransform_double_3_3
Parameters: 1 0 0 0 1 0 0 0 1 5 -2 3
FixedParameters: 0 0 0
";

struct FakeEngine {
    root: TempDir,
    engine: EngineConfig,
}

impl FakeEngine {
    fn new(body: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config_directory = root.path().join("config");
        fs::create_dir(&config_directory).unwrap();
        fs::write(config_directory.join("Rigid.json"), "{\"stages\": []}").unwrap();
        fs::write(config_directory.join("Affine.json"), "{\"stages\": []}").unwrap();

        let script = root.path().join("fake-engine");
        fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let engine = EngineConfig {
            executable: Some(script),
            config_directory,
            work_root: Some(root.path().join("runs")),
            poll_interval_ms: 10,
            stop_grace_period_ms: 200,
            ..EngineConfig::default()
        };
        Self { root, engine }
    }

    fn orchestrator(&self, artifacts: ArtifactConfig) -> RegistrationOrchestrator {
        RegistrationOrchestrator::new(self.engine.clone(), artifacts, FileSceneIo::new())
    }

    fn work_root(&self) -> PathBuf {
        self.root.path().join("runs")
    }
}

fn volume(name: &str) -> VolumeNode {
    VolumeNode::memory(
        name,
        Volume::from_fn([6, 6, 4], [1.0, 1.0, 2.0], [0.0; 3], |i, j, k| (i + 2 * j + 3 * k) as f32),
    )
}

fn request() -> RegistrationRequest {
    RegistrationRequest::new(volume("fixed"), volume("moving"), TransformNode::new("result"))
}

/// Submit and wait for the completion on the current `LocalSet`.
async fn run(orchestrator: &RegistrationOrchestrator, request: RegistrationRequest) -> RegistrationOutcome {
    let (tx, rx) = oneshot::channel();
    orchestrator
        .submit_registration(request, Completion::new(move |outcome: RegistrationOutcome| {
            let _ = tx.send(outcome);
        }))
        .unwrap();
    rx.await.unwrap()
}

fn leftover_runs(root: &Path) -> usize {
    fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
}

// writes the result into the output directory, the last argument
const WRITE_RESULT: &str = "for last; do :; done\ncat > \"$last/registration_transform.tfm\" <<'TFM'\n";

fn writing_engine(extra: &str) -> FakeEngine {
    FakeEngine::new(&format!("{}{}{}TFM\n{}", extra, WRITE_RESULT, RESULT_TFM, "exit 0"))
}

#[tokio::test]
async fn test_successful_run_fills_output_node() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = writing_engine("echo starting registration\n");
            let orchestrator = fake.orchestrator(ArtifactConfig::default());
            let sink = Arc::new(MemorySink::new());
            orchestrator.set_log_sink(sink.clone());

            let output = TransformNode::new("result");
            let request = RegistrationRequest::new(volume("fixed"), volume("moving"), output.clone());
            let outcome = run(&orchestrator, request).await;

            assert!(outcome.success(), "unexpected error: {:?}", outcome.error);
            assert_eq!(outcome.status, RunStatus::Completed);
            assert_eq!(outcome.exit_code, Some(0));
            assert_eq!(outcome.artifact.as_deref(), Some("registration_transform.tfm"));

            let delivered = outcome.transform.unwrap();
            assert!(delivered.same_node(&output));
            let moved = output.transform().apply(Point3::new(1.0, 1.0, 1.0));
            assert!((moved.x - 6.0).abs() < 1e-9);
            assert!((moved.y + 1.0).abs() < 1e-9);
            assert!((moved.z - 4.0).abs() < 1e-9);

            assert!(!outcome.working_directory.unwrap().exists());
            assert_eq!(leftover_runs(&fake.work_root()), 0);
            assert_eq!(orchestrator.phase(), Phase::Idle);
            assert!(sink.lines().iter().any(|l| l.contains("starting registration")));
        })
        .await;
}

#[tokio::test]
async fn test_engine_receives_staged_inputs() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            // echo the argument list and check the staged files exist before writing a result
            let fake = writing_engine(
                "echo \"args: $*\"\n\
                 for f in fixed.nrrd moving.nrrd mask.nrrd initial_transform.tfm Rigid.json; do\n\
                 [ -f \"$f\" ] || { echo \"missing $f\"; exit 7; }\n\
                 done\n",
            );
            let orchestrator = fake.orchestrator(ArtifactConfig::default());
            let sink = Arc::new(MemorySink::new());
            orchestrator.set_log_sink(sink.clone());

            let request = request()
                .with_mask(volume("mask"))
                .with_initial_transform(TransformNode::with_content("start", Transform::translation([1.0, 0.0, 0.0])))
                .with_sampling_percentage(0.25);
            let outcome = run(&orchestrator, request).await;

            assert!(outcome.success(), "unexpected error: {:?}, output: {:?}", outcome.error, sink.lines());
            let args = sink.lines().into_iter().find(|l| l.starts_with("args: ")).unwrap();
            assert!(args.contains("--sampling-percentage 0.25"));
            assert!(args.contains("--fixed-mask"));
            assert!(args.contains("--initial"));
            assert!(!args.contains("--initialization"));
        })
        .await;
}

#[tokio::test]
async fn test_nonzero_exit_is_process_failure() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = FakeEngine::new("echo 'optimizer diverged' >&2\nexit 1");
            let orchestrator = fake.orchestrator(ArtifactConfig::default());
            let outcome = run(&orchestrator, request()).await;

            assert_eq!(outcome.status, RunStatus::Failed);
            assert_eq!(outcome.exit_code, Some(1));
            assert!(matches!(
                outcome.error,
                Some(RegistrationError::ProcessFailure { exit_code: Some(1) })
            ));
            assert!(outcome.transform.is_none());
            assert_eq!(leftover_runs(&fake.work_root()), 0);
            assert_eq!(orchestrator.phase(), Phase::Idle);
        })
        .await;
}

#[tokio::test]
async fn test_clean_exit_without_artifact_is_missing_output() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = FakeEngine::new("echo done\nexit 0");
            let orchestrator = fake.orchestrator(ArtifactConfig::default());
            let output = TransformNode::new("result");
            let request = RegistrationRequest::new(volume("fixed"), volume("moving"), output.clone());
            let outcome = run(&orchestrator, request).await;

            assert!(matches!(outcome.error, Some(RegistrationError::MissingOutput { .. })));
            assert!(outcome.transform.is_none());
            assert!(output.transform().is_identity(0.0));
            assert_eq!(leftover_runs(&fake.work_root()), 0);
        })
        .await;
}

#[tokio::test]
async fn test_staged_config_is_never_taken_as_result() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = FakeEngine::new("echo no result written\nexit 0");
            let params = fake.root.path().join("params.txt");
            fs::write(&params, "(Metric \"AdvancedMattesMutualInformation\")\n").unwrap();
            let orchestrator = fake.orchestrator(ArtifactConfig::default());

            let staged_request = request()
                .with_selection(ConfigSelection::File(params.clone()))
                .with_initial_transform(TransformNode::with_content("start", Transform::identity()));
            let outcome = run(&orchestrator, staged_request).await;
            assert!(
                matches!(outcome.error, Some(RegistrationError::MissingOutput { .. })),
                "unexpected outcome: {:?}",
                outcome.error
            );

            // a real unmarked result next to the staged config is still found
            let fake = FakeEngine::new(&format!(
                "for last; do :; done\ncat > \"$last/affine_stage.txt\" <<'TFM'\n{}TFM\n",
                RESULT_TFM
            ));
            let orchestrator = fake.orchestrator(ArtifactConfig::default());
            let outcome = run(&orchestrator, request().with_selection(ConfigSelection::File(params))).await;
            assert!(outcome.success(), "unexpected error: {:?}", outcome.error);
            assert_eq!(outcome.artifact.as_deref(), Some("affine_stage.txt"));
        })
        .await;
}

#[tokio::test]
async fn test_unmarked_artifacts_follow_ambiguity_policy() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let body = format!(
                "for last; do :; done\n\
                 cat > \"$last/b_stage.tfm\" <<'TFM'\n{tfm}TFM\n\
                 cat > \"$last/a_stage.tfm\" <<'TFM'\n{tfm}TFM\n",
                tfm = RESULT_TFM
            );
            let fake = FakeEngine::new(&body);

            let first = fake.orchestrator(ArtifactConfig::default());
            let outcome = run(&first, request()).await;
            assert!(outcome.success(), "unexpected error: {:?}", outcome.error);
            assert_eq!(outcome.artifact.as_deref(), Some("a_stage.tfm"));

            let strict = fake.orchestrator(ArtifactConfig {
                ambiguity: AmbiguityPolicy::Reject,
                ..ArtifactConfig::default()
            });
            let outcome = run(&strict, request()).await;
            match outcome.error {
                Some(RegistrationError::AmbiguousOutput { candidates }) => {
                    assert_eq!(candidates, vec!["a_stage.tfm".to_string(), "b_stage.tfm".to_string()]);
                }
                other => panic!("expected ambiguous output, got {:?}", other),
            }
        })
        .await;
}

#[tokio::test]
async fn test_cancel_stops_stubborn_engine() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = FakeEngine::new("trap '' TERM\nwhile true; do sleep 0.05; done");
            let orchestrator = fake.orchestrator(ArtifactConfig::default());

            let (tx, rx) = oneshot::channel();
            orchestrator
                .submit_registration(request(), Completion::new(move |outcome: RegistrationOutcome| {
                    let _ = tx.send(outcome);
                }))
                .unwrap();
            assert_eq!(orchestrator.phase(), Phase::Running);

            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            assert!(orchestrator.cancel());

            let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), rx)
                .await
                .expect("cancelled run never completed")
                .unwrap();
            assert_eq!(outcome.status, RunStatus::Cancelled);
            assert!(matches!(outcome.error, Some(RegistrationError::Cancelled)));
            assert_eq!(leftover_runs(&fake.work_root()), 0);
            assert_eq!(orchestrator.phase(), Phase::Idle);
            assert!(!orchestrator.cancel());
        })
        .await;
}

/// False once `pid` is gone or only a zombie is left.
#[cfg(target_os = "linux")]
fn is_running(pid: &str) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid.trim())) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancelled_engine_and_helpers_are_gone() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let pids = tempfile::tempdir().unwrap();
            let engine_pid = pids.path().join("engine.pid");
            let helper_pid = pids.path().join("helper.pid");
            // both the engine and its background helper ignore SIGTERM
            let fake = FakeEngine::new(&format!(
                "trap '' TERM\n\
                 echo $$ > \"{}\"\n\
                 sleep 30 &\n\
                 echo $! > \"{}\"\n\
                 while true; do sleep 0.05; done",
                engine_pid.display(),
                helper_pid.display()
            ));
            let orchestrator = fake.orchestrator(ArtifactConfig::default());

            let (tx, rx) = oneshot::channel();
            orchestrator
                .submit_registration(request(), Completion::new(move |outcome: RegistrationOutcome| {
                    let _ = tx.send(outcome);
                }))
                .unwrap();
            for _ in 0..100 {
                if helper_pid.exists() && fs::read_to_string(&helper_pid).is_ok_and(|p| !p.trim().is_empty()) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            let engine = fs::read_to_string(&engine_pid).unwrap();
            let helper = fs::read_to_string(&helper_pid).unwrap();
            assert!(is_running(&engine) && is_running(&helper));

            let cancelled_at = std::time::Instant::now();
            assert!(orchestrator.cancel());
            let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), rx)
                .await
                .expect("cancelled run never completed")
                .unwrap();

            assert_eq!(outcome.status, RunStatus::Cancelled);
            assert!(cancelled_at.elapsed() < std::time::Duration::from_secs(5));
            assert!(!is_running(&engine), "engine {} still running", engine.trim());
            assert!(!is_running(&helper), "helper {} still running", helper.trim());
        })
        .await;
}

#[tokio::test]
async fn test_cancel_does_not_wait_for_engine_children() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = FakeEngine::new("echo start\nsleep 6\nexit 0");
            let orchestrator = fake.orchestrator(ArtifactConfig::default());

            let (tx, rx) = oneshot::channel();
            orchestrator
                .submit_registration(request(), Completion::new(move |outcome: RegistrationOutcome| {
                    let _ = tx.send(outcome);
                }))
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;

            let cancelled_at = std::time::Instant::now();
            assert!(orchestrator.cancel());
            let outcome = rx.await.unwrap();
            assert_eq!(outcome.status, RunStatus::Cancelled);
            assert!(
                cancelled_at.elapsed() < std::time::Duration::from_secs(3),
                "callback after {:?}",
                cancelled_at.elapsed()
            );
            assert_eq!(leftover_runs(&fake.work_root()), 0);
        })
        .await;
}

#[tokio::test]
async fn test_busy_while_running_and_sequential_runs_are_independent() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = writing_engine("sleep 0.2\n");
            let orchestrator = fake.orchestrator(ArtifactConfig::default());

            let (tx, rx) = oneshot::channel();
            orchestrator
                .submit_registration(request(), Completion::new(move |outcome: RegistrationOutcome| {
                    let _ = tx.send(outcome);
                }))
                .unwrap();
            let busy = orchestrator.submit_registration(request(), Completion::none());
            assert!(matches!(busy, Err(RegistrationError::Busy(_))));

            let first = rx.await.unwrap();
            let second = run(&orchestrator, request().with_selection(RegistrationStrategy::Affine)).await;

            assert!(first.success() && second.success());
            assert_ne!(first.run_id, second.run_id);
            assert_ne!(first.working_directory, second.working_directory);
            assert_eq!(leftover_runs(&fake.work_root()), 0);
        })
        .await;
}

#[tokio::test]
async fn test_invalid_request_is_delivered_not_returned() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let fake = writing_engine("");
            let orchestrator = fake.orchestrator(ArtifactConfig::default());

            let outcome = run(&orchestrator, request().with_sampling_percentage(1.5)).await;
            assert!(matches!(outcome.error, Some(RegistrationError::Validation(_))));

            let outcome = run(
                &orchestrator,
                request().with_selection(ConfigSelection::File(PathBuf::from("/nonexistent/custom.json"))),
            )
            .await;
            assert!(matches!(outcome.error, Some(RegistrationError::Configuration(_))));
            assert_eq!(leftover_runs(&fake.work_root()), 0);
        })
        .await;
}
