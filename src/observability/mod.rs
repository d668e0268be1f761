//! # Observability Infrastructure
//!
//! Structured logging for the Vaultline engine.

pub mod logging;

pub use logging::{init_logging, log_config_info};
