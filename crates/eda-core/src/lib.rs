//! Shared configuration, error and domain types for the EDA activation service.

pub mod config;
pub mod error;
pub mod types;

pub use config::EdaConfig;
pub use error::{EdaError, Result};
pub use types::*;
