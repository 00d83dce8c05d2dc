//! AquaWatch basic library
//!
//! Provides the bootstrap plumbing shared by all services:
//! - layered configuration loading (defaults, file, environment)
//! - logging initialization
//! - shutdown signal handling

pub mod config_loader;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_layered, ENV_SPLIT};
pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig, LogFormat};
