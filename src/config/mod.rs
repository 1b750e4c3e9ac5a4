//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions (Config, ServerConfig, ProtocolConfig)
//! - [`listen`]: Listener blocks (BindConfig)
//! - [`links`]: Server-to-server link blocks (LinkBlock)
//! - [`validation`]: Startup and rehash checks

mod links;
mod listen;
mod types;
pub mod validation;

pub use links::LinkBlock;
pub use listen::BindConfig;
pub use types::{Config, ConfigError, ProtocolConfig, ServerConfig};
pub use validation::{ValidationError, validate};
