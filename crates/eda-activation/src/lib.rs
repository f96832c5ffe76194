//! Activation lifecycle for the EDA server.
//!
//! Turns user intent (create, enable, disable, restart, delete) into durable
//! state changes plus dispatched jobs, runs those jobs against the rule
//! engine, and keeps activations alive through heartbeat liveness checks and
//! restart policies.

pub mod conflict;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod monitor;
pub mod orchestrator;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use dispatch::{JobDispatcher, JobQueue, QueueDispatcher};
pub use error::{ActivationError, DispatchError};
pub use locks::ActivationLocks;
pub use monitor::{LivenessMonitor, MonitorReport};
pub use orchestrator::Orchestrator;
pub use store::{ActivationStore, SqliteStore};
pub use types::{
    ActivationListItem, ActivationRead, JobHandle, JobKind, JobRequest, JobState, References,
};
pub use worker::{EngineExit, EngineLauncher, JobWorker, LaunchSpec, ProcessLauncher, RunningEngine};
