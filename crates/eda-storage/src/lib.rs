//! EDA Storage crate - SQLite persistence for activations.
//!
//! Provides a WAL-mode SQLite database with migrations and repository
//! implementations for activations, their instances, instance logs and
//! the resources an activation references.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::{
    ActivationFilter, ActivationRepository, InstanceFilter, InstanceRepository, LogFilter,
    LogRepository, ResourceRepository,
};
