//! Structured spans for registration runs and evaluations
//!
//! Every run carries its run id so that engine output, phase transitions and
//! the final outcome can be correlated in the JSON log files.

use std::time::Instant;
use tracing::{span, Level, Span};
use uuid::Uuid;

/// Span covering one registration run from submission to completion
pub struct RunSpan {
    span: Span,
    start_time: Instant,
    run_id: Uuid,
}

impl RunSpan {
    pub fn new(run_id: Uuid, fixed: &str, moving: &str) -> Self {
        let span = span!(
            Level::INFO,
            "registration_run",
            run_id = %run_id,
            fixed = fixed,
            moving = moving,
            phase = tracing::field::Empty,
            exit_code = tracing::field::Empty,
            artifact = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        Self {
            span,
            start_time: Instant::now(),
            run_id,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record a state machine transition
    pub fn record_phase(&self, phase: &str) {
        self.span.record("phase", phase);
        tracing::debug!(parent: &self.span, phase = phase, "Registration phase changed");
    }

    /// Record the engine invocation
    pub fn record_command(&self, command_line: &str, working_directory: &std::path::Path) {
        tracing::info!(
            parent: &self.span,
            command = command_line,
            working_directory = %working_directory.display(),
            "Launching registration engine"
        );
    }

    pub fn record_exit(&self, exit_code: Option<i32>, cancelled: bool) {
        if let Some(code) = exit_code {
            self.span.record("exit_code", code);
        }
        tracing::info!(
            parent: &self.span,
            exit_code = ?exit_code,
            cancelled = cancelled,
            "Registration engine exited"
        );
    }

    pub fn record_artifact(&self, artifact: &str) {
        self.span.record("artifact", artifact);
        tracing::info!(parent: &self.span, artifact = artifact, "Selected registration output");
    }

    /// Record the terminal outcome with total duration
    pub fn record_completion(&self, status: &str, error: Option<&str>) {
        let duration = self.start_time.elapsed();
        self.span.record("duration_ms", duration.as_millis() as u64);
        match error {
            None => tracing::info!(
                parent: &self.span,
                status = status,
                duration_ms = duration.as_millis() as u64,
                "Registration run completed"
            ),
            Some(error) => tracing::warn!(
                parent: &self.span,
                status = status,
                error = error,
                duration_ms = duration.as_millis() as u64,
                "Registration run did not succeed"
            ),
        }
    }

    /// Get the underlying span for manual instrumentation
    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Span for one metric evaluation (MI or TRE)
pub struct EvaluationSpan {
    span: Span,
    start_time: Instant,
}

impl EvaluationSpan {
    pub fn new(metric: &str) -> Self {
        let span = span!(
            Level::INFO,
            "evaluation",
            metric = metric,
            evaluation_id = %Uuid::new_v4(),
            success = tracing::field::Empty,
        );
        Self {
            span,
            start_time: Instant::now(),
        }
    }

    pub fn record_result(&self, success: bool, value: Option<f64>) {
        self.span.record("success", success);
        tracing::info!(
            parent: &self.span,
            success = success,
            value = ?value,
            execution_time_ms = self.start_time.elapsed().as_millis() as u64,
            "Evaluation completed"
        );
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_run_span_records_lifecycle() {
        let run_id = Uuid::new_v4();
        let span = RunSpan::new(run_id, "fixed.nrrd", "moving.nrrd");
        assert_eq!(span.run_id(), run_id);

        span.record_phase("running");
        span.record_exit(Some(0), false);
        span.record_artifact("registration_transform.tfm");
        span.record_completion("completed", None);

        assert!(logs_contain("Registration run completed"));
        assert!(logs_contain("registration_transform.tfm"));
    }

    #[traced_test]
    #[test]
    fn test_evaluation_span() {
        let span = EvaluationSpan::new("mutual_information");
        span.record_result(false, None);
        assert!(logs_contain("Evaluation completed"));
    }
}
