pub use config::SessionConfig;
pub use display_session::{DisplaySession, SessionState, UnsolicitedExitCallback};
pub use geometry::Geometry;
pub use lock_file::{LockFileProbe, ProbeTimeout};
pub use process::{CompletionCallback, ManagedProcess, ProcessOutcome, ProcessSpec, ProcessState};
pub use registry::SessionRegistry;

mod config;
mod display_session;
mod geometry;
mod lock_file;
mod process;
mod registry;

#[cfg(test)]
mod tests;
