//! Configuration and logging for the duplex transport.

mod config;
mod error;
mod logging;
mod options;

pub use config::{Config, DEFAULT_LOG_LEVEL, LOG_LEVEL_ENV};
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, parse_level};
pub use options::{EngineOptions, DEFAULT_HIGH_WATER_MARK};
