//! Registration runs: request model, artifact recovery and the orchestrating state machine.

pub mod artifacts;
pub mod orchestrator;
pub mod request;

pub use artifacts::{discover_artifact, list_candidates, select_artifact};
pub use orchestrator::{build_command, RegistrationOrchestrator, StagedInputs};
pub use request::{Phase, RegistrationOutcome, RegistrationRequest, RunStatus};
