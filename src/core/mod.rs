//! Core application layer
//!
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, ConfigArgs};
pub use error::{HostError, Result};
pub use logging::Logger;
