//! Neodip Core - Shared data models, strategy math, configuration, and errors

pub mod config;
pub mod errors;
pub mod events;
pub mod indicators;
pub mod models;
pub mod symbols;

pub use config::AgentConfig;
pub use errors::{EndpointClass, Error, Result};
pub use models::*;
