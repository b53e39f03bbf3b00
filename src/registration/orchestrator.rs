use super::artifacts::discover_artifact;
use super::request::{Phase, RegistrationOutcome, RegistrationRequest, RunStatus};
use crate::callback::Completion;
use crate::config::{ArtifactConfig, Config, EngineConfig, InitMode};
use crate::data::{FileSceneIo, SceneIo};
use crate::error::RegistrationError;
use crate::logging::{LogSink, RunSpan, TracingSink};
use crate::poll::poll_until;
use crate::process::{CommandSpec, ProcessRunner};
use crate::spatial::TransformNode;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Files staged in a run's working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedInputs {
    pub config: PathBuf,
    pub fixed: PathBuf,
    pub moving: PathBuf,
    pub mask: Option<PathBuf>,
    pub initial_transform: Option<PathBuf>,
    pub output_directory: PathBuf,
}

impl StagedInputs {
    /// File names of everything staged into the output directory; none of them is ever a result.
    pub fn file_names(&self) -> Vec<String> {
        [Some(&self.config), Some(&self.fixed), Some(&self.moving), self.mask.as_ref(), self.initial_transform.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect()
    }
}

/// Engine command line for staged inputs.
///
/// `init_mode` is only forwarded when the engine is configured to accept it.
pub fn build_command(
    program: &Path,
    staged: &StagedInputs,
    sampling_percentage: f64,
    init_mode: Option<InitMode>,
) -> CommandSpec {
    CommandSpec::new(program)
        .option("--config", &staged.config)
        .option("--sampling-percentage", format!("{}", sampling_percentage))
        .option_if("--fixed-mask", staged.mask.as_ref())
        .option_if("--initial", staged.initial_transform.as_ref())
        .option_if("--initialization", init_mode.map(InitMode::as_str))
        .positional(&staged.fixed)
        .positional(&staged.moving)
        .positional(&staged.output_directory)
}

struct ActiveRun {
    run_id: Uuid,
    runner: ProcessRunner,
    working_directory: TempDir,
    staged_names: Vec<String>,
    output: TransformNode,
    span: RunSpan,
    completion: Completion<RegistrationOutcome>,
}

struct State {
    phase: Phase,
    active: Option<ActiveRun>,
}

struct Shared {
    engine: EngineConfig,
    artifacts: ArtifactConfig,
    io: Box<dyn SceneIo>,
    sink: RefCell<Option<Arc<dyn LogSink>>>,
    state: RefCell<State>,
}

/// Drives one external registration run at a time from a single-threaded loop.
///
/// Submission stages inputs into a fresh working directory, launches the
/// engine and returns immediately. A poll task spawned on the current
/// [`tokio::task::LocalSet`] observes the process, recovers the result,
/// removes the working directory and fires the completion exactly once.
///
/// `submit_registration` must be called from within a `LocalSet`.
#[derive(Clone)]
pub struct RegistrationOrchestrator {
    shared: Rc<Shared>,
}

impl RegistrationOrchestrator {
    pub fn new(engine: EngineConfig, artifacts: ArtifactConfig, io: impl SceneIo + 'static) -> Self {
        Self {
            shared: Rc::new(Shared {
                engine,
                artifacts,
                io: Box::new(io),
                sink: RefCell::new(None),
                state: RefCell::new(State {
                    phase: Phase::Idle,
                    active: None,
                }),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.engine.clone(), config.artifacts.clone(), FileSceneIo::new())
    }

    /// Route engine output to `sink` instead of `tracing`.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        *self.shared.sink.borrow_mut() = Some(sink);
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.borrow().phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Start a run.
    ///
    /// Only `Busy` is returned here; every other failure, including
    /// validation, arrives through `on_complete` on a later loop iteration.
    pub fn submit_registration(
        &self,
        request: RegistrationRequest,
        on_complete: Completion<RegistrationOutcome>,
    ) -> Result<(), RegistrationError> {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.phase != Phase::Idle {
                return Err(RegistrationError::Busy("registration"));
            }
            state.phase = Phase::Preparing;
        }

        let run_id = Uuid::new_v4();
        let span = RunSpan::new(run_id, &request.fixed.name(), &request.moving.name());
        span.record_phase(Phase::Preparing.as_str());

        match self.shared.launch(run_id, &request, &span) {
            Ok((runner, working_directory, staged_names)) => {
                span.record_phase(Phase::Running.as_str());
                let mut state = self.shared.state.borrow_mut();
                state.phase = Phase::Running;
                state.active = Some(ActiveRun {
                    run_id,
                    runner,
                    working_directory,
                    staged_names,
                    output: request.output,
                    span,
                    completion: on_complete,
                });
                drop(state);
                self.spawn_monitor();
            }
            Err((error, working_directory)) => {
                let mut outcome = RegistrationOutcome::failed(run_id, error);
                outcome.working_directory = working_directory.as_ref().map(|d| d.path().to_path_buf());
                if let Some(dir) = working_directory {
                    purge(dir);
                }
                self.shared.set_phase(outcome.status.phase());
                span.record_completion(outcome.status.phase().as_str(), outcome.error.as_ref().map(|e| e.to_string()).as_deref());

                let shared = Rc::clone(&self.shared);
                tokio::task::spawn_local(async move {
                    shared.set_phase(Phase::Idle);
                    on_complete.fire(outcome);
                });
            }
        }
        Ok(())
    }

    /// Request cancellation of the running engine. Returns false when nothing is running.
    ///
    /// The completion still fires, with a cancelled outcome, once the process is gone.
    pub fn cancel(&self) -> bool {
        let state = self.shared.state.borrow();
        match (&state.phase, state.active.as_ref()) {
            (Phase::Running, Some(active)) => {
                tracing::info!(run_id = %active.run_id, "Cancelling registration run");
                active.runner.stop();
                true
            }
            _ => false,
        }
    }

    fn spawn_monitor(&self) {
        let shared = Rc::clone(&self.shared);
        tokio::task::spawn_local(async move {
            poll_until(shared.engine.poll_interval(), || shared.run_finished()).await;
            shared.finish_run();
        });
    }
}

impl Shared {
    fn set_phase(&self, phase: Phase) {
        self.state.borrow_mut().phase = phase;
    }

    fn run_finished(&self) -> bool {
        let mut state = self.state.borrow_mut();
        match state.active.as_mut() {
            Some(active) => !active.runner.is_alive(),
            None => true,
        }
    }

    /// Validate, stage and start. On failure the working directory (if any)
    /// is handed back for purging.
    fn launch(
        &self,
        run_id: Uuid,
        request: &RegistrationRequest,
        span: &RunSpan,
    ) -> Result<(ProcessRunner, TempDir, Vec<String>), (RegistrationError, Option<TempDir>)> {
        request.validate().map_err(|e| (e, None))?;

        let program = self.engine.resolve_executable().ok_or_else(|| {
            (
                RegistrationError::configuration(format!(
                    "registration engine '{}' not found (set engine.executable or engine.search_paths)",
                    self.engine.executable_name
                )),
                None,
            )
        })?;

        let config_file = request.selection.resolve(&self.engine.config_directory).ok_or_else(|| {
            (
                RegistrationError::configuration(format!(
                    "no engine configuration file for {:?} in {}",
                    request.selection,
                    self.engine.config_directory.display()
                )),
                None,
            )
        })?;

        let working_directory = self.allocate_working_directory().map_err(|e| (e, None))?;

        let staged = match self.stage(request, &config_file, working_directory.path()) {
            Ok(staged) => staged,
            Err(e) => return Err((e, Some(working_directory))),
        };

        let init_mode = request
            .effective_init_mode()
            .filter(|_| self.engine.forward_init_mode);
        let spec = build_command(&program, &staged, request.sampling_percentage, init_mode);
        span.record_command(&spec.to_string(), working_directory.path());

        let sink = self
            .sink
            .borrow()
            .clone()
            .unwrap_or_else(|| Arc::new(TracingSink::for_run(run_id)));
        let mut runner = ProcessRunner::new(spec, working_directory.path(), sink)
            .with_grace_period(self.engine.stop_grace_period());

        match runner.start() {
            Ok(()) => Ok((runner, working_directory, staged.file_names())),
            Err(e) => Err((e, Some(working_directory))),
        }
    }

    fn allocate_working_directory(&self) -> Result<TempDir, RegistrationError> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("registration-");
            builder
        };
        let dir = match self.engine.work_root {
            Some(ref root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!(path = %dir.path().display(), "Allocated working directory");
        Ok(dir)
    }

    fn stage(
        &self,
        request: &RegistrationRequest,
        config_file: &Path,
        dir: &Path,
    ) -> Result<StagedInputs, RegistrationError> {
        let fixed = dir.join(format!("fixed.{}", request.fixed.extension()));
        self.io
            .export_volume(&request.fixed, &fixed)
            .map_err(|e| RegistrationError::export("fixed volume", e))?;

        let moving = dir.join(format!("moving.{}", request.moving.extension()));
        self.io
            .export_volume(&request.moving, &moving)
            .map_err(|e| RegistrationError::export("moving volume", e))?;

        let mask = match request.mask {
            Some(ref mask) => {
                let path = dir.join(format!("mask.{}", mask.extension()));
                self.io
                    .export_volume(mask, &path)
                    .map_err(|e| RegistrationError::export("mask", e))?;
                Some(path)
            }
            None => None,
        };

        let initial_transform = match request.initial_transform {
            Some(ref transform) => {
                let path = dir.join(format!("{}.tfm", self.artifacts.initial_transform_name));
                self.io
                    .export_transform(transform, &path)
                    .map_err(|e| RegistrationError::export("initial transform", e))?;
                Some(path)
            }
            None => None,
        };

        let config_name = config_file
            .file_name()
            .ok_or_else(|| RegistrationError::configuration("configuration path has no file name"))?;
        let config = dir.join(config_name);
        fs::copy(config_file, &config).map_err(|e| {
            RegistrationError::configuration(format!("copying {}: {}", config_file.display(), e))
        })?;

        Ok(StagedInputs {
            config,
            fixed,
            moving,
            mask,
            initial_transform,
            output_directory: dir.to_path_buf(),
        })
    }

    fn finish_run(&self) {
        let Some(active) = self.state.borrow_mut().active.take() else {
            return;
        };
        let ActiveRun {
            run_id,
            runner,
            working_directory,
            staged_names,
            output,
            span,
            completion,
        } = active;

        let process = runner.outcome();
        let exit_code = process.and_then(|p| p.exit_code);
        let cancelled = process.map_or(runner.is_cancelled(), |p| p.cancelled);
        span.record_exit(exit_code, cancelled);
        drop(runner);

        let result = if cancelled {
            Err(RegistrationError::Cancelled)
        } else if exit_code != Some(0) {
            Err(RegistrationError::ProcessFailure { exit_code })
        } else {
            self.recover_result(working_directory.path(), &staged_names, &output, &span)
        };

        let directory = working_directory.path().to_path_buf();
        purge(working_directory);

        let outcome = match result {
            Ok(artifact) => RegistrationOutcome {
                run_id,
                status: RunStatus::Completed,
                transform: Some(output),
                artifact: Some(artifact),
                error: None,
                working_directory: Some(directory),
                exit_code,
            },
            Err(error) => {
                let mut outcome = RegistrationOutcome::failed(run_id, error);
                outcome.working_directory = Some(directory);
                outcome.exit_code = exit_code;
                outcome
            }
        };

        let status = outcome.status.phase();
        self.set_phase(status);
        span.record_completion(
            status.as_str(),
            outcome.error.as_ref().map(|e| e.to_string()).as_deref(),
        );

        self.set_phase(Phase::Idle);
        completion.fire(outcome);
    }

    /// Locate, load and copy the engine result into the output slot.
    fn recover_result(
        &self,
        dir: &Path,
        staged_names: &[String],
        output: &TransformNode,
        span: &RunSpan,
    ) -> Result<String, RegistrationError> {
        let artifact = discover_artifact(dir, &self.artifacts, staged_names, |path| self.io.can_import(path))?;
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        span.record_artifact(&name);

        match self.io.import_transform(&artifact) {
            Ok(Some(transform)) => {
                output.copy_content(&transform);
                Ok(name)
            }
            Ok(None) => Err(RegistrationError::transform_load(&artifact, "file contains no transform")),
            Err(e) => Err(RegistrationError::transform_load(&artifact, e)),
        }
    }
}

fn purge(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        tracing::warn!(path = %path.display(), "Failed to remove working directory: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(mask: bool, initial: bool) -> StagedInputs {
        StagedInputs {
            config: PathBuf::from("/w/Rigid.json"),
            fixed: PathBuf::from("/w/fixed.nrrd"),
            moving: PathBuf::from("/w/moving.nrrd"),
            mask: mask.then(|| PathBuf::from("/w/mask.nrrd")),
            initial_transform: initial.then(|| PathBuf::from("/w/initial_transform.tfm")),
            output_directory: PathBuf::from("/w"),
        }
    }

    #[test]
    fn test_command_argument_order() {
        let spec = build_command(Path::new("/opt/MIRegistration"), &staged(true, true), 0.25, None);
        let argv: Vec<String> = spec.argv().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            argv,
            vec![
                "--config",
                "/w/Rigid.json",
                "--sampling-percentage",
                "0.25",
                "--fixed-mask",
                "/w/mask.nrrd",
                "--initial",
                "/w/initial_transform.tfm",
                "/w/fixed.nrrd",
                "/w/moving.nrrd",
                "/w",
            ]
        );
    }

    #[test]
    fn test_optional_arguments_omitted() {
        let spec = build_command(Path::new("engine"), &staged(false, false), 0.1, Some(InitMode::Moments));
        assert!(spec.option_value("--fixed-mask").is_none());
        assert!(spec.option_value("--initial").is_none());
        assert_eq!(spec.option_value("--initialization").and_then(|v| v.to_str()), Some("moments"));
        assert_eq!(spec.option_value("--sampling-percentage").and_then(|v| v.to_str()), Some("0.1"));
        assert_eq!(spec.positionals().len(), 3);
    }

    #[test]
    fn test_staged_file_names() {
        assert_eq!(
            staged(true, false).file_names(),
            vec!["Rigid.json", "fixed.nrrd", "moving.nrrd", "mask.nrrd"]
        );
        assert_eq!(staged(false, true).file_names().len(), 4);
    }

    #[tokio::test]
    async fn test_busy_and_idle_phases() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = EngineConfig {
                    executable: Some(PathBuf::from("/nonexistent/engine")),
                    ..EngineConfig::default()
                };
                let orchestrator = RegistrationOrchestrator::new(engine, ArtifactConfig::default(), FileSceneIo::new());
                assert_eq!(orchestrator.phase(), Phase::Idle);
                assert!(!orchestrator.cancel());

                let (tx, rx) = tokio::sync::oneshot::channel();
                let request = RegistrationRequest::new(
                    crate::data::VolumeNode::file("/data/fixed.nrrd"),
                    crate::data::VolumeNode::file("/data/moving.nrrd"),
                    TransformNode::new("out"),
                );
                orchestrator
                    .submit_registration(request.clone(), Completion::new(move |o| {
                        let _ = tx.send(o);
                    }))
                    .unwrap();

                // the failure is pending delivery, so the orchestrator is still busy
                assert!(orchestrator.is_busy());
                let second = orchestrator.submit_registration(request, Completion::none());
                assert!(matches!(second, Err(RegistrationError::Busy(_))));

                let outcome = rx.await.unwrap();
                assert!(matches!(outcome.error, Some(RegistrationError::Configuration(_))));
                assert_eq!(orchestrator.phase(), Phase::Idle);
            })
            .await;
    }
}
