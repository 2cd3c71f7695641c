use serde::Deserialize;
use std::fs;

fn default_logging() -> String {
    "info".to_string()
}

fn default_lock_dir() -> String {
    "/tmp".to_string()
}

fn default_display_number() -> u32 {
    99
}

fn default_width() -> u32 {
    1200
}

fn default_height() -> u32 {
    720
}

fn default_depth() -> u32 {
    24
}

fn default_display_command() -> String {
    "Xvfb".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_input_method_command() -> String {
    "fcitx5".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeometrySettings {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_depth")]
    pub depth: u32,
}

impl Default for GeometrySettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            depth: default_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DisplaySettings {
    #[serde(default = "default_display_number")]
    pub number: u32,
    #[serde(default)]
    pub geometry: GeometrySettings,
    #[serde(default = "default_display_command")]
    pub command: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub teardown_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub export_display: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            number: default_display_number(),
            geometry: GeometrySettings::default(),
            command: default_display_command(),
            extra_args: Vec::new(),
            startup_timeout_ms: default_timeout_ms(),
            teardown_timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            silent: false,
            export_display: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppSettings {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub auto_restart: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputMethodSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_input_method_command")]
    pub command: String,
    #[serde(default)]
    pub set_module_env: bool,
}

impl Default for InputMethodSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_input_method_command(),
            set_module_env: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_logging")]
    pub logging: String,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,
    #[serde(default)]
    pub display: DisplaySettings,
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub input_method: InputMethodSettings,
}

impl Settings {
    pub fn new(config_path: &str) -> Result<Self, config::ConfigError> {
        let settings_raw = config::Config::builder()
            .add_source(config::File::new(config_path, config::FileFormat::Yaml).required(false))
            .add_source(config::Environment::with_prefix("XVFB_SUPERVISOR").separator("_"))
            .build()?;

        settings_raw.try_deserialize()
    }

    pub fn verify(&self) -> bool {
        // Check that settings are valid for running a supervisor

        // Verify the display command is set
        if self.display.command.is_empty() {
            error!("Display command is missing from settings");
            return false;
        }

        // Verify the lock directory exists
        if fs::metadata(&self.lock_dir).is_err() {
            error!("Lock directory {} does not exist", self.lock_dir);
            return false;
        }

        // The probe refuses to spin faster than 10ms
        if self.display.poll_interval_ms == 0 {
            error!("Poll interval must be greater than zero");
            return false;
        }

        if self.display.startup_timeout_ms == 0 || self.display.teardown_timeout_ms == 0 {
            error!("Startup and teardown timeouts must be greater than zero");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings {
            logging: default_logging(),
            lock_dir: default_lock_dir(),
            display: DisplaySettings::default(),
            app: AppSettings::default(),
            input_method: InputMethodSettings::default(),
        };

        assert!(settings.verify());
        assert_eq!(settings.display.number, 99);
        assert_eq!(settings.display.geometry.width, 1200);
        assert_eq!(settings.display.geometry.height, 720);
        assert_eq!(settings.display.geometry.depth, 24);
        assert_eq!(settings.display.startup_timeout_ms, 1000);
        assert!(settings.display.export_display);
    }

    #[test]
    fn verify_rejects_missing_lock_dir() {
        let mut settings = Settings {
            logging: default_logging(),
            lock_dir: "/nonexistent/lock/dir".to_string(),
            display: DisplaySettings::default(),
            app: AppSettings::default(),
            input_method: InputMethodSettings::default(),
        };

        assert!(!settings.verify());

        settings.lock_dir = default_lock_dir();
        settings.display.command = String::new();
        assert!(!settings.verify());
    }
}
