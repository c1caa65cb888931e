//! # Engage Core
//!
//! Shared building blocks for the automation engine and the campaign pipeline:
//! domain types, collaborator traits (channel adapter, target lists, delayed
//! job queue), the error taxonomy, and configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::EngageConfig;
pub use error::{EngageError, ErrorBody, Result};
