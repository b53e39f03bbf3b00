use super::mutual_information::IntensityMetric;
use crate::callback::Completion;
use crate::data::Volume;
use crate::error::RegistrationError;
use crate::logging::EvaluationSpan;
use crate::poll::{poll_until, DEFAULT_POLL_INTERVAL};
use crate::spatial::Transform;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Intensity agreement between two volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiResult {
    pub value: f64,
    pub used_mask: bool,
    pub method: String,
}

impl MiResult {
    /// The value as a cost, the sign convention of optimizers that minimize.
    pub fn negative(&self) -> f64 {
        -self.value
    }
}

/// Delivered once per submission.
#[derive(Debug)]
pub struct MiOutcome {
    pub success: bool,
    pub result: Option<MiResult>,
    pub error: Option<RegistrationError>,
}

#[derive(Debug, Default)]
struct WorkerSlot {
    success: bool,
    value: f64,
    error: Option<String>,
}

/// Runs an [`IntensityMetric`] on a worker thread and reports back on the caller's loop.
///
/// `submit` must be called from within a `tokio::task::LocalSet`.
#[derive(Clone)]
pub struct IntensityAgreementEvaluator {
    metric: Arc<dyn IntensityMetric>,
    poll_interval: Duration,
    in_flight: Rc<Cell<bool>>,
}

impl IntensityAgreementEvaluator {
    pub fn new(metric: impl IntensityMetric + 'static) -> Self {
        Self {
            metric: Arc::new(metric),
            poll_interval: DEFAULT_POLL_INTERVAL,
            in_flight: Rc::new(Cell::new(false)),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.get()
    }

    /// Start an evaluation without blocking.
    ///
    /// Returns `Busy` if one is already in flight; any other failure is
    /// delivered through `on_complete`.
    pub fn submit(
        &self,
        fixed: Arc<Volume>,
        moving: Arc<Volume>,
        transform: Option<Transform>,
        mask: Option<Arc<Volume>>,
        on_complete: Completion<MiOutcome>,
    ) -> Result<(), RegistrationError> {
        if self.in_flight.replace(true) {
            return Err(RegistrationError::Busy("mutual information evaluation"));
        }

        let used_mask = mask.is_some();
        let slot = Arc::new(Mutex::new(WorkerSlot::default()));
        let worker_slot = Arc::clone(&slot);
        let metric = Arc::clone(&self.metric);

        let worker = thread::Builder::new()
            .name("mi-evaluation".to_string())
            .spawn(move || {
                let computed = catch_unwind(AssertUnwindSafe(|| {
                    metric.evaluate(&fixed, &moving, transform.as_ref(), mask.as_deref())
                }));
                let mut slot = match worker_slot.lock() {
                    Ok(slot) => slot,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match computed {
                    Ok(Ok(value)) => {
                        slot.success = true;
                        slot.value = value;
                    }
                    Ok(Err(e)) => slot.error = Some(format!("{e:#}")),
                    Err(panic) => slot.error = Some(panic_message(panic.as_ref())),
                }
            });

        let span = EvaluationSpan::new(self.metric.method());
        let method = self.metric.method().to_string();
        let in_flight = Rc::clone(&self.in_flight);
        let period = self.poll_interval;

        tokio::task::spawn_local(async move {
            let outcome = match worker {
                Ok(handle) => {
                    poll_until(period, || handle.is_finished()).await;
                    let _ = handle.join();
                    let slot = match slot.lock() {
                        Ok(mut slot) => std::mem::take(&mut *slot),
                        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
                    };
                    if slot.success {
                        MiOutcome {
                            success: true,
                            result: Some(MiResult {
                                value: slot.value,
                                used_mask,
                                method,
                            }),
                            error: None,
                        }
                    } else {
                        let reason = slot.error.unwrap_or_else(|| "metric produced no value".to_string());
                        failure(RegistrationError::metric(reason))
                    }
                }
                Err(e) => failure(RegistrationError::metric(format!("could not start worker: {}", e))),
            };

            span.record_result(outcome.success, outcome.result.as_ref().map(|r| r.value));
            if let Some(ref error) = outcome.error {
                tracing::warn!("Mutual information evaluation failed: {}", error);
            }
            in_flight.set(false);
            on_complete.fire(outcome);
        });
        Ok(())
    }
}

fn failure(error: RegistrationError) -> MiOutcome {
    MiOutcome {
        success: false,
        result: None,
        error: Some(error),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("metric panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("metric panicked: {}", s)
    } else {
        "metric panicked".to_string()
    }
}
