use std::time::Duration;

use crate::common::Settings;

use super::Geometry;

/// The `SessionConfig` struct carries everything a `DisplaySession` needs to
/// launch and supervise one virtual display: the display number, geometry,
/// the display server command, probe timing and behavioural flags.
#[derive(Clone)]
pub struct SessionConfig {
    pub display_number: u32,
    pub geometry: Geometry,
    pub command: String,
    pub extra_args: Vec<String>,
    pub lock_dir: String,
    pub startup_timeout: Duration,
    pub teardown_timeout: Duration,
    pub poll_interval: Duration,
    /// Suppress forwarded stderr of the display process and its dependents.
    pub silent: bool,
    /// Export `DISPLAY` into the supervisor's own environment while the
    /// session is running, for same-process collaborators such as the
    /// capture pipeline.
    pub export_display: bool,
}

impl SessionConfig {
    /// Builds a session configuration from the application settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            display_number: settings.display.number,
            geometry: Geometry::from(&settings.display.geometry),
            command: settings.display.command.clone(),
            extra_args: settings.display.extra_args.clone(),
            lock_dir: settings.lock_dir.clone(),
            startup_timeout: Duration::from_millis(settings.display.startup_timeout_ms),
            teardown_timeout: Duration::from_millis(settings.display.teardown_timeout_ms),
            poll_interval: Duration::from_millis(settings.display.poll_interval_ms),
            silent: settings.display.silent,
            export_display: settings.display.export_display,
        }
    }

    /// Returns the symbolic display target, e.g. `:99`.
    pub fn display_id(&self) -> String {
        format!(":{}", self.display_number)
    }
}
