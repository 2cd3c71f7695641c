pub use environment::{EnvironmentContext, EnvironmentSnapshot};
pub use error::{Result, SupervisorError};
pub use settings::{AppSettings, DisplaySettings, GeometrySettings, InputMethodSettings, Settings};

mod environment;
mod error;
mod settings;
