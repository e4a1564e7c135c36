pub mod config;
pub mod error;

pub use config::{ConfigIssue, ConfigSeverity, RelayConfig};
pub use error::{Error, Result};
