//! Configuration for the Kiln runtime.
//!
//! A [`KilnConfig`] is assembled by [`ConfigLoader`] from built-in defaults,
//! a `kiln.yaml`/`kiln.toml` file and `KILN_*` environment variables, then
//! checked by [`validate_config`].

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile};
pub use schema::{
    KilnConfig, LogFormat, LogLevel, LogOutput, LoggingConfig, SpanEventConfig,
    WatchConfig,
};
pub use validation::validate_config;
