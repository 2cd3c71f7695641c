use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::common::{EnvironmentContext, EnvironmentSnapshot, Result, SupervisorError};

use super::process::{CompletionCallback, ManagedProcess, ProcessSpec};
use super::{LockFileProbe, SessionConfig};

/// Lifecycle of a display session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Notification fired when the display process dies without a `stop()`
/// having been requested. Carries the display number. Callbacks must not
/// call back into the session; they typically post an event for the
/// supervisor loop to act on (restart or shut down).
pub type UnsolicitedExitCallback = Arc<dyn Fn(u32) + Send + Sync>;

struct SessionInner {
    state: SessionState,
    display_process: Option<ManagedProcess>,
    dependents: Vec<ManagedProcess>,
    snapshot: Option<EnvironmentSnapshot>,
    on_unsolicited_exit: Option<UnsolicitedExitCallback>,
}

/// The `DisplaySession` struct owns one virtual display subprocess and the
/// dependent processes bound to it, and drives their start/stop sequencing.
///
/// Startup is gated on the display's lock file appearing; teardown always
/// stops dependents before the display process, then waits for the lock file
/// to disappear. An unsolicited death of the display process is treated as an
/// implicit `stop()` and reported through `on_unsolicited_exit`.
///
/// The session is a cloneable handle over shared state. `start()` and
/// `stop()` hold the session mutex for their full duration, so they never
/// overlap on one session; independent sessions only ever meet at the (brief)
/// global environment gate.
#[derive(Clone)]
pub struct DisplaySession {
    id: String,
    config: SessionConfig,
    probe: LockFileProbe,
    inner: Arc<Mutex<SessionInner>>,
    /// Set while a teardown or spawn is driving process completions from the
    /// session's own thread with the mutex held; tells internal completion
    /// callbacks to stand down instead of re-entering the lock.
    suppress_events: Arc<AtomicBool>,
}

impl DisplaySession {
    /// Creates a new session for the given configuration. Nothing is spawned
    /// until `start()` is called.
    pub fn new(config: SessionConfig) -> Self {
        let probe = LockFileProbe::new(config.poll_interval);
        Self {
            id: Uuid::new_v4().simple().to_string(),
            config,
            probe,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Stopped,
                display_process: None,
                dependents: Vec::new(),
                snapshot: None,
                on_unsolicited_exit: None,
            })),
            suppress_events: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the unique identifier for the session.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the display number the session owns.
    pub fn display_number(&self) -> u32 {
        self.config.display_number
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Checks whether the session is running.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Returns the PID of the display process, if one is alive.
    pub fn display_pid(&self) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .display_process
            .as_ref()
            .map(|process| process.pid())
    }

    /// Registers the callback fired when the display process dies without a
    /// requested `stop()`. At most one notification is delivered per
    /// unsolicited death.
    pub fn on_unsolicited_exit(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.inner.lock().unwrap().on_unsolicited_exit = Some(Arc::new(callback));
    }

    /// Starts the virtual display: exports the display variable, spawns the
    /// display command and waits for its lock file to appear.
    ///
    /// Fails with `DuplicateSession` (before spawning anything) if the lock
    /// file already exists, `SpawnFailure` if the display command cannot be
    /// launched, or `StartupTimeout` if the lock file never appears. A failed
    /// start never leaks a process or an environment mutation: the partially
    /// spawned child is killed and the snapshot restored before returning.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Stopped {
            return Err(SupervisorError::InvalidState(format!(
                "Session {} on display {} cannot start from state {:?}",
                self.id,
                self.config.display_id(),
                inner.state
            )));
        }

        let lock_path = self.lock_path();
        if lock_path.exists() {
            return Err(SupervisorError::DuplicateSession(format!(
                "Display {} is already in use: lock file {} exists",
                self.config.display_id(),
                lock_path.display()
            )));
        }

        inner.state = SessionState::Starting;
        info!(
            "Starting display session {} on display {}",
            self.id,
            self.config.display_id()
        );

        let display_id = self.config.display_id();
        if self.config.export_display {
            inner.snapshot = Some(EnvironmentContext::set(&[("DISPLAY", display_id.as_str())])?);
        }

        // The completion callback runs inline on spawn failure, so events
        // are suppressed for the duration of the spawn call
        self.suppress_events.store(true, Ordering::SeqCst);
        let spawn_result = ManagedProcess::spawn(
            self.display_process_spec(),
            Some(self.display_exit_watcher()),
        );
        self.suppress_events.store(false, Ordering::SeqCst);

        let display_process = match spawn_result {
            Ok(process) => process,
            Err(error) => {
                self.restore_snapshot(&mut inner);
                inner.state = SessionState::Stopped;
                return Err(error);
            }
        };
        inner.display_process = Some(display_process.clone());

        match self
            .probe
            .wait_for(&lock_path, true, self.config.startup_timeout)
        {
            Ok(()) => {
                inner.state = SessionState::Running;
                info!(
                    "Display session {} running on display {} [pid={}]",
                    self.id,
                    display_id,
                    display_process.pid()
                );
                Ok(())
            }
            Err(timeout) => {
                // The display process launched but never announced itself;
                // kill it rather than leak it
                warn!("Display session {} failed to start: {}", self.id, timeout);
                self.suppress_events.store(true, Ordering::SeqCst);
                if let Err(error) = display_process.stop(self.config.teardown_timeout) {
                    warn!(
                        "Could not kill display process after failed start: {}",
                        error
                    );
                }
                self.suppress_events.store(false, Ordering::SeqCst);
                inner.display_process = None;
                self.restore_snapshot(&mut inner);
                inner.state = SessionState::Stopped;
                Err(SupervisorError::StartupTimeout(timeout.to_string()))
            }
        }
    }

    /// Stops the session: dependents first, then the display process, then
    /// the environment restore, then a probe for the lock file disappearing.
    ///
    /// Stopping an already stopped session is a no-op. On `TeardownTimeout`
    /// every process has already been killed and the session stays in
    /// `Stopping`; a later `stop()` re-probes the lock file, or the registry
    /// can be force-cleared for operator recovery.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SessionState::Stopped => Ok(()),
            SessionState::Stopping => self.await_lock_release(&mut inner),
            SessionState::Running => {
                info!(
                    "Stopping display session {} on display {}",
                    self.id,
                    self.config.display_id()
                );
                inner.state = SessionState::Stopping;
                self.teardown_processes(&mut inner);
                self.await_lock_release(&mut inner)
            }
            // start() holds the session mutex for its full duration, so this
            // state is unreachable from outside
            SessionState::Starting => Err(SupervisorError::InvalidState(format!(
                "Session {} is still starting",
                self.id
            ))),
        }
    }

    /// Spawns a dependent process under this session's display. Only legal
    /// while the session is running; the dependent is registered for the next
    /// teardown fan-out.
    pub fn add_dependent(&self, command: &str, args: &[String]) -> Result<ManagedProcess> {
        self.add_dependent_with_env(command, args, Vec::new(), None)
    }

    /// Spawns a dependent process with additional environment overlay entries
    /// (input-method selectors and the like) and an optional completion
    /// callback through which the caller can implement its restart policy.
    pub fn add_dependent_with_env(
        &self,
        command: &str,
        args: &[String],
        extra_env: Vec<(String, String)>,
        on_completion: Option<CompletionCallback>,
    ) -> Result<ManagedProcess> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Running {
            return Err(SupervisorError::InvalidState(format!(
                "Cannot add dependent {} to session {}: session is {:?}, not running",
                command, self.id, inner.state
            )));
        }

        let mut env = vec![("DISPLAY".to_string(), self.config.display_id())];
        env.extend(extra_env);

        let process = ManagedProcess::spawn(
            ProcessSpec {
                display_number: self.config.display_number,
                command: command.to_string(),
                args: args.to_vec(),
                env,
                silent: self.config.silent,
            },
            Some(self.dependent_exit_watcher(on_completion)),
        )?;

        inner.dependents.push(process.clone());
        Ok(process)
    }

    /// Kills everything still attached to the session without waiting on the
    /// lock file, and forces the state to `Stopped`. Operator recovery for
    /// sessions stuck in `Stopping` after a `TeardownTimeout`.
    pub fn force_stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        warn!(
            "Force-stopping display session {} on display {}",
            self.id,
            self.config.display_id()
        );
        self.teardown_processes(&mut inner);
        inner.state = SessionState::Stopped;
    }

    /// Stops all dependents, then the display process, then restores the
    /// environment snapshot. Called with the session mutex held.
    fn teardown_processes(&self, inner: &mut SessionInner) {
        teardown_processes(inner, &self.id, &self.config, &self.suppress_events);
    }

    /// Waits for the lock file to disappear and completes the transition to
    /// `Stopped`. Called with the session mutex held and all processes gone.
    fn await_lock_release(&self, inner: &mut SessionInner) -> Result<()> {
        match self
            .probe
            .wait_for(&self.lock_path(), false, self.config.teardown_timeout)
        {
            Ok(()) => {
                inner.state = SessionState::Stopped;
                info!(
                    "Display session {} on display {} stopped",
                    self.id,
                    self.config.display_id()
                );
                Ok(())
            }
            Err(timeout) => {
                warn!(
                    "Display session {} teardown incomplete: {}",
                    self.id, timeout
                );
                Err(SupervisorError::TeardownTimeout(timeout.to_string()))
            }
        }
    }

    fn restore_snapshot(&self, inner: &mut SessionInner) {
        restore_snapshot(inner, &self.id);
    }

    fn lock_path(&self) -> std::path::PathBuf {
        LockFileProbe::lock_path(&self.config.lock_dir, self.config.display_number)
    }

    fn display_process_spec(&self) -> ProcessSpec {
        let mut args = vec![
            self.config.display_id(),
            "-screen".to_string(),
            "0".to_string(),
            self.config.geometry.to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());

        ProcessSpec {
            display_number: self.config.display_number,
            command: self.config.command.clone(),
            args,
            env: vec![("DISPLAY".to_string(), self.config.display_id())],
            silent: self.config.silent,
        }
    }

    /// Builds the completion callback for the display process. An exit
    /// observed while the session believes it is `Running` is unsolicited:
    /// the watcher performs an implicit stop and fires the session-level
    /// notification exactly once.
    fn display_exit_watcher(&self) -> CompletionCallback {
        let weak: Weak<Mutex<SessionInner>> = Arc::downgrade(&self.inner);
        let id = self.id.clone();
        let config = self.config.clone();
        let probe = self.probe;
        let suppress = self.suppress_events.clone();
        Box::new(move |outcome| {
            if suppress.load(Ordering::SeqCst) {
                // Solicited: a stop or failed start is already driving this
                return;
            }
            let Some(inner_arc) = weak.upgrade() else {
                return;
            };
            let mut inner = inner_arc.lock().unwrap();
            if inner.state != SessionState::Running {
                return;
            }

            warn!(
                "Display process of session {} on display {} exited unexpectedly: {:?}",
                id,
                config.display_id(),
                outcome
            );

            inner.state = SessionState::Stopping;
            inner.display_process = None;
            teardown_processes(&mut inner, &id, &config, &suppress);

            // The display server is gone; if its lock file lingers there is
            // nobody left to remove it, so the session terminates regardless
            let lock_path = LockFileProbe::lock_path(&config.lock_dir, config.display_number);
            if let Err(timeout) = probe.wait_for(&lock_path, false, config.teardown_timeout) {
                warn!(
                    "Stale lock file after unsolicited exit of session {}: {}",
                    id, timeout
                );
            }
            inner.state = SessionState::Stopped;

            let notify = inner.on_unsolicited_exit.clone();
            drop(inner);

            if let Some(notify) = notify {
                notify(config.display_number);
            }
        })
    }

    /// Builds the completion callback for a dependent: prunes dead dependents
    /// from the session (opportunistically, never blocking on the session
    /// mutex) and forwards the outcome to the caller's callback.
    fn dependent_exit_watcher(
        &self,
        on_completion: Option<CompletionCallback>,
    ) -> CompletionCallback {
        let weak: Weak<Mutex<SessionInner>> = Arc::downgrade(&self.inner);
        let suppress = self.suppress_events.clone();
        Box::new(move |outcome| {
            if !suppress.load(Ordering::SeqCst) {
                if let Some(inner_arc) = weak.upgrade() {
                    if let Ok(mut inner) = inner_arc.try_lock() {
                        inner.dependents.retain(|dependent| dependent.is_running());
                    }
                }
            }
            if let Some(callback) = on_completion {
                callback(outcome);
            }
        })
    }
}

/// Stops all dependents, then the display process, then restores the
/// environment snapshot. Called with the session mutex held, from `stop()`,
/// `force_stop()`, or the display exit watcher.
fn teardown_processes(
    inner: &mut SessionInner,
    id: &str,
    config: &SessionConfig,
    suppress_events: &AtomicBool,
) {
    suppress_events.store(true, Ordering::SeqCst);

    // Dependents strictly before the display process, so no dependent is
    // left pointing at a display that is being torn down
    for dependent in inner.dependents.drain(..) {
        if let Err(error) = dependent.stop(config.teardown_timeout) {
            warn!(
                "Failed to stop dependent {} of session {}: {}",
                dependent.command(),
                id,
                error
            );
        }
    }

    if let Some(display_process) = inner.display_process.take() {
        if let Err(error) = display_process.stop(config.teardown_timeout) {
            warn!("Failed to stop display process of session {}: {}", id, error);
        }
    }

    suppress_events.store(false, Ordering::SeqCst);
    restore_snapshot(inner, id);
}

fn restore_snapshot(inner: &mut SessionInner, id: &str) {
    if let Some(snapshot) = inner.snapshot.take() {
        if let Err(error) = EnvironmentContext::restore(snapshot) {
            // Signals a broken save/restore pairing; teardown continues
            error!("Environment restore failed for session {}: {}", id, error);
        }
    }
}
