//! Destinations for the engine's combined output stream.
//!
//! Sinks are called from the runner's drain thread, so they must be
//! `Send + Sync`. A failing sink never interrupts draining; the runner drops
//! the error.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Receives engine output one line at a time, in order.
pub trait LogSink: Send + Sync {
    fn emit(&self, line: &str) -> Result<()>;
}

/// Forwards lines to `tracing` under the `image_registration::engine` target.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    run_id: Option<Uuid>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_run(run_id: Uuid) -> Self {
        Self { run_id: Some(run_id) }
    }
}

impl LogSink for TracingSink {
    fn emit(&self, line: &str) -> Result<()> {
        match self.run_id {
            Some(run_id) => tracing::info!(target: "image_registration::engine", run_id = %run_id, "{}", line),
            None => tracing::info!(target: "image_registration::engine", "{}", line),
        }
        Ok(())
    }
}

/// Hands each line to a closure, e.g. a GUI log panel.
pub struct CallbackSink {
    callback: Box<dyn Fn(&str) -> Result<()> + Send + Sync>,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl LogSink for CallbackSink {
    fn emit(&self, line: &str) -> Result<()> {
        (self.callback)(line)
    }
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

/// Collects lines in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl LogSink for MemorySink {
    fn emit(&self, line: &str) -> Result<()> {
        let mut lines = self
            .lines
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?;
        lines.push(line.to_string());
        Ok(())
    }
}

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn emit(&self, line: &str) -> Result<()> {
        (**self).emit(line)
    }
}
