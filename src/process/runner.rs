use super::CommandSpec;
use crate::error::RegistrationError;
use crate::logging::LogSink;
use crate::poll::poll_until;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ESCALATION_STEP: Duration = Duration::from_millis(50);
/// How long output may stay open after the engine exited before its process group is killed.
const DRAIN_SETTLE: Duration = Duration::from_millis(100);
/// After this, a reader still blocked on output held by an unkillable process is detached.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminal state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was ended by a signal or never reported a code.
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

struct Running {
    child: Arc<Mutex<Child>>,
    /// Also the process group id on unix.
    pid: u32,
    drain: Option<JoinHandle<()>>,
    status: Option<ExitStatus>,
    wait_failed: bool,
    reaped_at: Option<Instant>,
    group_killed: bool,
}

/// Supervises one external process.
///
/// The combined stdout/stderr stream is drained line by line on a dedicated
/// thread and forwarded to the [`LogSink`]. On unix the process leads its own
/// process group, and stopping it signals the whole group. Nothing here blocks: callers check
/// [`is_alive`](Self::is_alive) from their own loop and read the
/// [`outcome`](Self::outcome) once it turns false.
pub struct ProcessRunner {
    spec: CommandSpec,
    working_directory: PathBuf,
    grace_period: Duration,
    sink: Arc<dyn LogSink>,
    cancelled: Arc<AtomicBool>,
    stop_requested: AtomicBool,
    running: Option<Running>,
}

impl ProcessRunner {
    pub fn new(spec: CommandSpec, working_directory: impl Into<PathBuf>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            spec,
            working_directory: working_directory.into(),
            grace_period: Duration::from_secs(5),
            sink,
            cancelled: Arc::new(AtomicBool::new(false)),
            stop_requested: AtomicBool::new(false),
            running: None,
        }
    }

    /// Time between the graceful termination request and a forced kill.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Spawn the process and its output drain. A runner starts at most once.
    pub fn start(&mut self) -> Result<(), RegistrationError> {
        if self.running.is_some() {
            return Err(RegistrationError::Spawn("process already started".to_string()));
        }

        let (reader, writer) = std::io::pipe()?;
        let stderr_writer = writer.try_clone()?;

        let child = {
            let mut command = self.spec.to_command(&self.working_directory);
            command
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr_writer);
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(0);
            }
            command.spawn().map_err(|e| {
                RegistrationError::Spawn(format!("{}: {}", self.spec.program.display(), e))
            })?
            // `command` drops here, closing our copies of the write end.
        };
        tracing::debug!(pid = child.id(), program = %self.spec.program.display(), "Engine process started");

        let sink = Arc::clone(&self.sink);
        let drain = thread::Builder::new()
            .name("engine-output".to_string())
            .spawn(move || drain_lines(reader, sink.as_ref()));

        let drain = match drain {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Without a reader the child would block on a full pipe.
                let mut child = child;
                let _ = child.kill();
                let _ = child.wait();
                return Err(RegistrationError::Spawn(format!("output thread: {}", e)));
            }
        };

        self.running = Some(Running {
            pid: child.id(),
            child: Arc::new(Mutex::new(child)),
            drain,
            status: None,
            wait_failed: false,
            reaped_at: None,
            group_killed: false,
        });
        Ok(())
    }

    /// Non-blocking liveness probe.
    ///
    /// Stays true until the process has exited and every line of its output
    /// has been delivered to the sink. Output kept open by a leftover member
    /// of the process group is only waited for briefly: the group is killed
    /// after [`DRAIN_SETTLE`] and the reader detached after [`DRAIN_TIMEOUT`].
    pub fn is_alive(&mut self) -> bool {
        let Some(running) = self.running.as_mut() else {
            return false;
        };

        if running.status.is_none() && !running.wait_failed {
            match lock(&running.child).try_wait() {
                Ok(Some(status)) => running.status = Some(status),
                Ok(None) => return true,
                Err(e) => {
                    tracing::warn!("Failed to query engine process state: {}", e);
                    running.wait_failed = true;
                }
            }
        }

        if running.drain.as_ref().is_some_and(|drain| !drain.is_finished()) {
            let waited = running.reaped_at.get_or_insert_with(Instant::now).elapsed();
            if waited < DRAIN_SETTLE {
                return true;
            }
            if !running.group_killed {
                running.group_killed = true;
                tracing::debug!(pid = running.pid, "Engine exited with its output still open, killing process group");
                kill_group(running.pid);
            }
            if waited < DRAIN_TIMEOUT {
                return true;
            }
            tracing::warn!(pid = running.pid, "Engine output still open after exit, detaching output reader");
            running.drain = None;
            return false;
        }
        if let Some(drain) = running.drain.take() {
            if drain.join().is_err() {
                tracing::warn!("Engine output thread panicked");
            }
        }
        false
    }

    /// Terminal outcome, available once [`is_alive`](Self::is_alive) has returned false.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        let running = self.running.as_ref()?;
        if running.drain.is_some() || (running.status.is_none() && !running.wait_failed) {
            return None;
        }
        Some(ProcessOutcome {
            exit_code: running.status.and_then(|s| s.code()),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request termination without blocking.
    ///
    /// Sends a graceful termination signal, then a background thread forces
    /// the process down if it is still running after the grace period.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let Some(running) = self.running.as_ref() else {
            return;
        };
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut child = lock(&running.child);
            if !matches!(child.try_wait(), Ok(None)) {
                return;
            }
            terminate_gracefully(&mut child);
        }

        let child = Arc::clone(&running.child);
        let grace_period = self.grace_period;
        let escalation = thread::Builder::new()
            .name("engine-stop".to_string())
            .spawn(move || escalate_after(child, grace_period));
        if let Err(e) = escalation {
            tracing::warn!("Could not start stop escalation thread, killing now: {}", e);
            force_kill(&mut lock(&running.child));
        }
    }

    /// Wait asynchronously for the process, polling every `period`.
    pub async fn wait(&mut self, period: Duration) -> Option<ProcessOutcome> {
        poll_until(period, || !self.is_alive()).await;
        self.outcome()
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        if let Some(running) = self.running.as_ref() {
            let mut child = lock(&running.child);
            if matches!(child.try_wait(), Ok(None)) {
                tracing::debug!(pid = child.id(), "Killing engine process on drop");
                force_kill(&mut child);
                let _ = child.wait();
            } else if running.drain.as_ref().is_some_and(|drain| !drain.is_finished()) {
                kill_group(running.pid);
            }
        }
    }
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn drain_lines(reader: impl std::io::Read, sink: &dyn LogSink) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                let line = line.trim_end_matches(['\n', '\r']);
                // A failing sink must not stall the child on a full pipe.
                let _ = sink.emit(line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: killpg has no memory-safety preconditions. The group was
    // created for the engine at spawn time and carries its pid.
    unsafe { libc::killpg(pgid, signal) == 0 }
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child) {
    if !signal_group(child.id(), libc::SIGTERM) {
        tracing::debug!(pid = child.id(), "SIGTERM failed, killing engine process");
        force_kill(child);
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child) {
    force_kill(child);
}

/// Kill the engine and, on unix, everything left in its process group.
fn force_kill(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn escalate_after(child: Arc<Mutex<Child>>, grace_period: Duration) {
    let deadline = Instant::now() + grace_period;
    loop {
        {
            let mut child = lock(&child);
            if !matches!(child.try_wait(), Ok(None)) {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(pid = child.id(), "Engine ignored termination request, killing");
                force_kill(&mut child);
                return;
            }
        }
        thread::sleep(ESCALATION_STEP.min(deadline.saturating_duration_since(Instant::now())));
    }
}
