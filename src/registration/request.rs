use crate::config::{ConfigSelection, InitMode, RegistrationDefaults};
use crate::data::VolumeNode;
use crate::error::RegistrationError;
use crate::spatial::TransformNode;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Everything one engine run needs. Consumed by the orchestrator on submission.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub fixed: VolumeNode,
    pub moving: VolumeNode,
    pub mask: Option<VolumeNode>,
    /// When set the engine starts from this transform and `init_mode` is ignored.
    pub initial_transform: Option<TransformNode>,
    pub selection: ConfigSelection,
    pub sampling_percentage: f64,
    pub init_mode: InitMode,
    /// Caller-owned slot that receives the result on success.
    pub output: TransformNode,
}

impl RegistrationRequest {
    pub fn new(fixed: VolumeNode, moving: VolumeNode, output: TransformNode) -> Self {
        Self::from_defaults(fixed, moving, output, &RegistrationDefaults::default())
    }

    pub fn from_defaults(
        fixed: VolumeNode,
        moving: VolumeNode,
        output: TransformNode,
        defaults: &RegistrationDefaults,
    ) -> Self {
        Self {
            fixed,
            moving,
            mask: None,
            initial_transform: None,
            selection: ConfigSelection::Strategy(defaults.strategy),
            sampling_percentage: defaults.sampling_percentage,
            init_mode: defaults.init_mode,
            output,
        }
    }

    pub fn with_mask(mut self, mask: VolumeNode) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_initial_transform(mut self, transform: TransformNode) -> Self {
        self.initial_transform = Some(transform);
        self
    }

    pub fn with_selection(mut self, selection: impl Into<ConfigSelection>) -> Self {
        self.selection = selection.into();
        self
    }

    pub fn with_sampling_percentage(mut self, sampling_percentage: f64) -> Self {
        self.sampling_percentage = sampling_percentage;
        self
    }

    pub fn with_init_mode(mut self, init_mode: InitMode) -> Self {
        self.init_mode = init_mode;
        self
    }

    /// Init mode actually in effect: none when an initial transform is supplied.
    pub fn effective_init_mode(&self) -> Option<InitMode> {
        match self.initial_transform {
            Some(_) => None,
            None => Some(self.init_mode),
        }
    }

    /// Cheap checks that need no filesystem access.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.fixed.is_empty() {
            return Err(RegistrationError::validation("fixed volume is empty"));
        }
        if self.moving.is_empty() {
            return Err(RegistrationError::validation("moving volume is empty"));
        }
        if self.mask.as_ref().is_some_and(VolumeNode::is_empty) {
            return Err(RegistrationError::validation("mask volume is empty"));
        }
        let sampling = self.sampling_percentage;
        if !(sampling > 0.0 && sampling <= 1.0) {
            return Err(RegistrationError::validation(format!(
                "sampling percentage must be in (0, 1], got {}",
                sampling
            )));
        }
        Ok(())
    }
}

/// Orchestrator state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Running => "running",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn phase(self) -> Phase {
        match self {
            RunStatus::Completed => Phase::Completed,
            RunStatus::Failed => Phase::Failed,
            RunStatus::Cancelled => Phase::Cancelled,
        }
    }
}

/// Result of one run, delivered exactly once through the completion callback.
#[derive(Debug)]
pub struct RegistrationOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// The caller's output slot, now holding the result. Set only on success.
    pub transform: Option<TransformNode>,
    /// File name of the artifact the result was loaded from.
    pub artifact: Option<String>,
    pub error: Option<RegistrationError>,
    /// Working directory of the run; already removed when the outcome is delivered.
    pub working_directory: Option<PathBuf>,
    pub exit_code: Option<i32>,
}

impl RegistrationOutcome {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub(crate) fn failed(run_id: Uuid, error: RegistrationError) -> Self {
        let status = if error.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        Self {
            run_id,
            status,
            transform: None,
            artifact: None,
            error: Some(error),
            working_directory: None,
            exit_code: None,
        }
    }
}
