use std::error::Error;
use std::fmt;
use std::result;

pub type Result<T> = result::Result<T, SupervisorError>;

#[derive(Debug)]
pub enum SupervisorError {
    SpawnFailure(String),
    StartupTimeout(String),
    TeardownTimeout(String),
    DuplicateSession(String),
    InvalidState(String),
    RestoreInconsistency(String),
    IoError(std::io::Error),
    ConfigError(config::ConfigError),
}

impl Error for SupervisorError {}

impl fmt::Display for SupervisorError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SupervisorError::SpawnFailure(message) => write!(formatter, "SpawnFailure: {}", message),
            SupervisorError::StartupTimeout(message) => write!(formatter, "StartupTimeout: {}", message),
            SupervisorError::TeardownTimeout(message) => write!(formatter, "TeardownTimeout: {}", message),
            SupervisorError::DuplicateSession(message) => write!(formatter, "DuplicateSession: {}", message),
            SupervisorError::InvalidState(message) => write!(formatter, "InvalidState: {}", message),
            SupervisorError::RestoreInconsistency(message) => write!(formatter, "RestoreInconsistency: {}", message),
            SupervisorError::IoError(err) => write!(formatter, "IoError: {}", err),
            SupervisorError::ConfigError(err) => write!(formatter, "ConfigError: {}", err),
        }
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        SupervisorError::IoError(err)
    }
}

impl From<config::ConfigError> for SupervisorError {
    fn from(err: config::ConfigError) -> Self {
        SupervisorError::ConfigError(err)
    }
}
