use std::sync::mpsc;

use crate::common::{Result, Settings};
use crate::session::{DisplaySession, ManagedProcess, SessionConfig, SessionRegistry};

/// Events the supervisor loop reacts to.
enum SupervisorEvent {
    /// The display process died without a requested stop.
    DisplayDied(u32),
    /// The shared application reached its terminal outcome.
    AppExited,
    /// Termination signal received.
    Shutdown,
}

/// Represents the main application responsible for running a display session
/// and the processes that share it: the virtual display itself, the shared
/// application and, when enabled, the input-method daemon.
///
/// Restart policy lives here, not in the session or process layers: on an
/// unsolicited display death or application exit the supervisor either
/// recreates what died or shuts down, depending on configuration.
pub struct Application {}

impl Application {
    /// Creates a new instance of the `Application`.
    pub fn new() -> Self {
        Self {}
    }

    /// Runs the application: starts the session and its dependents, then
    /// services lifecycle events until shutdown.
    ///
    /// # Arguments
    /// * `settings` - The application settings.
    ///
    /// # Returns
    /// * `Result<()>` - Indicates success or failure of the operation.
    pub fn run(&self, settings: &Settings) -> Result<()> {
        info!("Starting Xvfb Supervisor...");

        let registry = SessionRegistry::new();
        let (sender, receiver) = mpsc::channel();

        self.create_shutdown_handler(sender.clone());

        let mut session = self.launch_session(&registry, settings, &sender)?;
        info!("Xvfb Supervisor running");

        loop {
            match receiver.recv() {
                Ok(SupervisorEvent::Shutdown) | Err(_) => break,
                Ok(SupervisorEvent::DisplayDied(display_number)) => {
                    if settings.app.auto_restart {
                        warn!("Display :{} died, recreating the session", display_number);
                        registry.release(display_number)?;
                        session = self.launch_session(&registry, settings, &sender)?;
                    } else {
                        error!("Display :{} died, shutting down", display_number);
                        break;
                    }
                }
                Ok(SupervisorEvent::AppExited) => {
                    if !session.is_running() {
                        // Session teardown is already in flight; the display
                        // event that follows decides what happens next
                        continue;
                    }
                    if settings.app.auto_restart {
                        warn!("Shared application exited, restarting it");
                        self.spawn_app(&session, settings, &sender)?;
                    } else {
                        info!("Shared application exited, shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(error) = session.stop() {
            warn!("Session did not stop cleanly: {}", error);
            registry.force_clear(session.display_number());
        } else {
            registry.release(session.display_number())?;
        }

        info!("Xvfb Supervisor terminated");
        Ok(())
    }

    /// Sets up a handler that converts CTRL-C / SIGTERM into a shutdown event
    /// for the supervisor loop.
    ///
    /// # Arguments
    /// * `sender` - The event channel into the supervisor loop.
    fn create_shutdown_handler(&self, sender: mpsc::Sender<SupervisorEvent>) {
        ctrlc::set_handler(move || {
            info!("Received termination signal");
            let _ = sender.send(SupervisorEvent::Shutdown);
        })
        .expect("Error setting Ctrl-C handler");
    }

    /// Acquires a session from the registry, starts the virtual display and
    /// spawns the configured dependents under it.
    fn launch_session(
        &self,
        registry: &SessionRegistry,
        settings: &Settings,
        sender: &mpsc::Sender<SupervisorEvent>,
    ) -> Result<DisplaySession> {
        let session = registry.acquire(SessionConfig::from_settings(settings))?;

        let exit_sender = sender.clone();
        session.on_unsolicited_exit(move |display_number| {
            let _ = exit_sender.send(SupervisorEvent::DisplayDied(display_number));
        });

        session.start()?;

        if settings.input_method.enabled {
            // The input method is best-effort: a missing daemon must not
            // bring the whole session down
            if let Err(error) = session.add_dependent(&settings.input_method.command, &[]) {
                warn!(
                    "Could not start input method {}: {}",
                    settings.input_method.command, error
                );
            }
        }

        if !settings.app.command.is_empty() {
            self.spawn_app(&session, settings, sender)?;
        }

        Ok(session)
    }

    /// Spawns the shared application as a dependent of the session, with the
    /// input-method module variables in its overlay when configured.
    fn spawn_app(
        &self,
        session: &DisplaySession,
        settings: &Settings,
        sender: &mpsc::Sender<SupervisorEvent>,
    ) -> Result<ManagedProcess> {
        let mut extra_env = Vec::new();
        if settings.input_method.enabled && settings.input_method.set_module_env {
            extra_env.push(("GTK_IM_MODULE".to_string(), "fcitx".to_string()));
            extra_env.push(("QT_IM_MODULE".to_string(), "fcitx".to_string()));
            extra_env.push(("XMODIFIERS".to_string(), "@im=fcitx".to_string()));
        }

        let completion_sender = sender.clone();
        session.add_dependent_with_env(
            &settings.app.command,
            &settings.app.args,
            extra_env,
            Some(Box::new(move |outcome| {
                debug!("Shared application completed: {:?}", outcome);
                let _ = completion_sender.send(SupervisorEvent::AppExited);
            })),
        )
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}
