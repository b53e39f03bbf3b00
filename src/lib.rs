pub mod analysis;
pub mod callback;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod poll;
pub mod process;
pub mod registration;
pub mod spatial;

pub use analysis::{compute_tre, EvaluationReport, IntensityAgreementEvaluator, MiOutcome, MiResult, TreResult};
pub use callback::Completion;
pub use config::{Config, ConfigSelection, InitMode, RegistrationStrategy};
pub use data::{SceneIo, Volume, VolumeNode};
pub use error::RegistrationError;
pub use registration::{Phase, RegistrationOrchestrator, RegistrationOutcome, RegistrationRequest, RunStatus};
pub use spatial::{Point3, Transform, TransformNode};

pub type Result<T> = anyhow::Result<T>;
