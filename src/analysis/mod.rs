//! Quality measures for registration results: point-based TRE and
//! intensity-based mutual information.

pub mod mi_evaluator;
pub mod mutual_information;
pub mod report;
pub mod tre;

pub use mi_evaluator::{IntensityAgreementEvaluator, MiOutcome, MiResult};
pub use mutual_information::{mutual_information, HistogramMutualInformation, IntensityMetric};
pub use report::{EvaluationReport, MetricRow};
pub use tre::{compute_tre, TreResult};
