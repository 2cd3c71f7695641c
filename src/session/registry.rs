use std::collections::HashMap;
use std::sync::Mutex;

use crate::common::{Result, SupervisorError};

use super::{DisplaySession, SessionConfig, SessionState};

/// The `SessionRegistry` struct tracks the active `DisplaySession`s keyed by
/// display number, for the lifetime of the application. It is the guard
/// against two independent sessions fighting over one display number and its
/// lock file: `acquire` refuses a number whose session is not `Stopped`.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u32, DisplaySession>>,
}

impl SessionRegistry {
    /// Creates a new, empty `SessionRegistry`.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Creates and registers a session for the display number in `config`.
    ///
    /// Fails with `DuplicateSession` if a session for that number already
    /// exists and has not reached `Stopped`. A stopped leftover (for example
    /// after a completed teardown whose entry was never released) is
    /// replaced.
    pub fn acquire(&self, config: SessionConfig) -> Result<DisplaySession> {
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(existing) = sessions.get(&config.display_number) {
            if existing.state() != SessionState::Stopped {
                return Err(SupervisorError::DuplicateSession(format!(
                    "Display :{} already has an active session ({})",
                    config.display_number,
                    existing.id()
                )));
            }
            debug!(
                "Replacing stopped session {} on display :{}",
                existing.id(),
                config.display_number
            );
        }

        let session = DisplaySession::new(config);
        sessions.insert(session.display_number(), session.clone());
        Ok(session)
    }

    /// Returns the session registered for a display number, if any.
    pub fn get(&self, display_number: u32) -> Option<DisplaySession> {
        self.sessions.lock().unwrap().get(&display_number).cloned()
    }

    /// Returns the number of registered sessions that are not `Stopped`.
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| session.state() != SessionState::Stopped)
            .count()
    }

    /// Removes the entry for a display number once its session has reached
    /// `Stopped`. Refuses otherwise: a session stuck in `Stopping` keeps its
    /// entry until the lock file is confirmed gone or `force_clear` is used.
    pub fn release(&self, display_number: u32) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&display_number) {
            None => Ok(()),
            Some(session) => {
                if session.state() == SessionState::Stopped {
                    sessions.remove(&display_number);
                    debug!("Released session registry entry for display :{}", display_number);
                    Ok(())
                } else {
                    Err(SupervisorError::InvalidState(format!(
                        "Session on display :{} is {:?}; stop it before releasing",
                        display_number,
                        session.state()
                    )))
                }
            }
        }
    }

    /// Operator recovery: kills whatever is still attached to the session and
    /// removes its entry unconditionally.
    pub fn force_clear(&self, display_number: u32) {
        let removed = self.sessions.lock().unwrap().remove(&display_number);
        if let Some(session) = removed {
            warn!(
                "Force-clearing session {} on display :{}",
                session.id(),
                display_number
            );
            session.force_stop();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
