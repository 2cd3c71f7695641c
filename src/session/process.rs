use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use shared_child::SharedChild;

use crate::common::{Result, SupervisorError};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_EXITED: u8 = 2;

/// Cadence used while waiting for a signalled child to go away.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of a supervised subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Running,
    Exited,
}

impl ProcessState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_IDLE => ProcessState::Idle,
            STATE_RUNNING => ProcessState::Running,
            _ => ProcessState::Exited,
        }
    }
}

/// Terminal outcome of a supervised subprocess, delivered at most once per
/// process. Collapsing exit and error into one tagged event avoids the
/// duplicate-teardown bugs that come from registering separate exit and error
/// handlers that each try to clean up.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The subprocess exited; carries the exit code when one was reported
    /// (killed processes have none).
    Exited(Option<i32>),
    /// The subprocess could not be spawned or waited on.
    Errored(String),
}

/// Caller-supplied completion callback, invoked exactly once.
pub type CompletionCallback = Box<dyn FnOnce(ProcessOutcome) + Send + 'static>;

/// Everything needed to launch one subprocess bound to a display.
pub struct ProcessSpec {
    pub display_number: u32,
    pub command: String,
    pub args: Vec<String>,
    /// Environment overlay applied on top of the inherited environment.
    /// The display target and input-method selectors travel here instead of
    /// through ambient process-wide state.
    pub env: Vec<(String, String)>,
    /// Suppress forwarding of the subprocess's stderr.
    pub silent: bool,
}

/// The `ManagedProcess` struct owns one spawned subprocess bound to a display
/// number. It is a cheaply cloneable handle; a watcher thread waits on the
/// child and delivers the completion outcome.
///
/// A `ManagedProcess` never restarts itself. Restart policy belongs to the
/// caller, which may spawn a fresh instance from the completion callback.
#[derive(Clone)]
pub struct ManagedProcess {
    display_number: u32,
    command: String,
    process: Arc<SharedChild>,
    state: Arc<AtomicU8>,
    completion: Arc<Mutex<Option<CompletionCallback>>>,
}

impl ManagedProcess {
    /// Spawns the subprocess described by `spec` with its environment overlay
    /// already applied, and returns immediately.
    ///
    /// stdout is discarded; stderr is forwarded to the supervisor's own
    /// stderr unless silenced. `on_completion` fires exactly once
    /// with the process's terminal outcome. If the spawn itself fails the
    /// callback fires with the originating error and the call returns
    /// `SpawnFailure`.
    pub fn spawn(spec: ProcessSpec, on_completion: Option<CompletionCallback>) -> Result<ManagedProcess> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(name, value)| (name, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if spec.silent { Stdio::null() } else { Stdio::inherit() });

        debug!("Spawning command: {}", format!("{:?}", command).replace('\"', ""));

        let child = match SharedChild::spawn(&mut command) {
            Ok(child) => child,
            Err(error) => {
                let message = format!("Failed to spawn {}: {}", spec.command, error);
                error!("{}", message);
                if let Some(callback) = on_completion {
                    callback(ProcessOutcome::Errored(message.clone()));
                }
                return Err(SupervisorError::SpawnFailure(message));
            }
        };

        let process = ManagedProcess {
            display_number: spec.display_number,
            command: spec.command,
            process: Arc::new(child),
            state: Arc::new(AtomicU8::new(STATE_RUNNING)),
            completion: Arc::new(Mutex::new(on_completion)),
        };

        info!(
            "Spawned {} [pid={}] on display :{}",
            process.command,
            process.pid(),
            process.display_number
        );

        process.spawn_watcher();

        Ok(process)
    }

    /// Waits on the child from a background thread so natural exits are
    /// observed without any caller involvement.
    fn spawn_watcher(&self) {
        let handle = self.clone();
        thread::spawn(move || {
            let outcome = match handle.process.wait() {
                Ok(status) => ProcessOutcome::Exited(status.code()),
                Err(error) => ProcessOutcome::Errored(format!(
                    "Failed to wait for {} [pid={}]: {}",
                    handle.command,
                    handle.pid(),
                    error
                )),
            };
            // Claim the exited transition. Losing the exchange means an
            // explicit stop() owns it and will fire the completion itself,
            // before that stop() returns.
            if handle
                .state
                .compare_exchange(STATE_RUNNING, STATE_EXITED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                handle.complete(outcome);
            }
        });
    }

    /// Fires the completion callback, at most once across the watcher thread
    /// and any explicit `stop()`.
    fn complete(&self, outcome: ProcessOutcome) {
        let callback = self.completion.lock().unwrap().take();
        if let Some(callback) = callback {
            debug!(
                "Process {} [pid={}] on display :{} completed: {:?}",
                self.command,
                self.pid(),
                self.display_number,
                outcome
            );
            callback(outcome);
        }
    }

    /// Returns the process ID (PID) of the subprocess.
    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    /// Returns the display number the subprocess is bound to.
    pub fn display_number(&self) -> u32 {
        self.display_number
    }

    /// Returns the command this process was spawned from.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the lifecycle state of the subprocess.
    pub fn state(&self) -> ProcessState {
        ProcessState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Checks whether the subprocess is still running.
    pub fn is_running(&self) -> bool {
        if self.state() != ProcessState::Running {
            return false;
        }
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Sends SIGTERM to the subprocess if it is still alive and waits up to
    /// `grace` for it to go away, escalating to SIGKILL after that. Xvfb only
    /// removes its lock file on a catchable termination signal, which is why
    /// SIGTERM comes first.
    ///
    /// The exited transition and the completion callback each happen exactly
    /// once, even when this call races the exit watcher.
    pub fn stop(&self, grace: Duration) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_EXITED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Already exited, or a concurrent stop won the race
            return Ok(());
        }

        debug!(
            "Stopping {} [pid={}] on display :{}",
            self.command,
            self.pid(),
            self.display_number
        );

        self.signal(Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        loop {
            match self.process.try_wait() {
                Ok(Some(status)) => {
                    self.complete(ProcessOutcome::Exited(status.code()));
                    return Ok(());
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(
                            "Process {} [pid={}] ignored SIGTERM, escalating to SIGKILL",
                            self.command,
                            self.pid()
                        );
                        self.signal(Signal::SIGKILL);
                        let status = self.process.wait()?;
                        self.complete(ProcessOutcome::Exited(status.code()));
                        return Ok(());
                    }
                    thread::sleep(REAP_POLL_INTERVAL);
                }
                Err(error) => {
                    let message = format!(
                        "Failed to wait for {} [pid={}]: {}",
                        self.command,
                        self.pid(),
                        error
                    );
                    self.complete(ProcessOutcome::Errored(message.clone()));
                    return Err(SupervisorError::IoError(error));
                }
            }
        }
    }

    fn signal(&self, signal: Signal) {
        if let Err(error) = kill(Pid::from_raw(self.pid() as i32), signal) {
            // ESRCH just means the process is already gone
            if error != Errno::ESRCH {
                warn!(
                    "Could not signal process {} [pid={}]: {}",
                    self.command,
                    self.pid(),
                    error
                );
            }
        }
    }
}
