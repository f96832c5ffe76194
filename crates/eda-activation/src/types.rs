//! Job and read-model types for the activation lifecycle.
//!
//! Defines the job requests sent to the worker pool, the opaque job handle
//! stored on an activation, and the enriched views returned to callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eda_core::config::DeploymentConfig;
use eda_core::types::{
    rule_counts, Activation, ActivationInstance, DecisionEnvironment, ExtraVar, Project, Rulebook,
};

// =============================================================================
// Jobs
// =============================================================================

/// Kinds of work the dispatcher accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Activate,
    Deactivate,
    Monitor,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Activate => write!(f, "activate"),
            JobKind::Deactivate => write!(f, "deactivate"),
            JobKind::Monitor => write!(f, "monitor"),
        }
    }
}

/// Parameters of an "activate" job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateParams {
    pub is_restart: bool,
    pub activation_id: i64,
    pub deployment_type: String,
    pub websocket_base_url: String,
    pub ssl_verify: String,
}

/// Parameters of a "deactivate" job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateParams {
    pub activation_instance_id: i64,
    pub deployment_type: String,
}

/// A unit of work submitted to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRequest {
    Activate(ActivateParams),
    Deactivate(DeactivateParams),
    Monitor,
}

impl JobRequest {
    pub fn activate(activation_id: i64, is_restart: bool, deployment: &DeploymentConfig) -> Self {
        JobRequest::Activate(ActivateParams {
            is_restart,
            activation_id,
            deployment_type: deployment.deployment_type.clone(),
            websocket_base_url: deployment.websocket_base_url.clone(),
            ssl_verify: deployment.websocket_ssl_verify.clone(),
        })
    }

    pub fn deactivate(activation_instance_id: i64, deployment: &DeploymentConfig) -> Self {
        JobRequest::Deactivate(DeactivateParams {
            activation_instance_id,
            deployment_type: deployment.deployment_type.clone(),
        })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Activate(_) => JobKind::Activate,
            JobRequest::Deactivate(_) => JobKind::Deactivate,
            JobRequest::Monitor => JobKind::Monitor,
        }
    }
}

/// Opaque identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub Uuid);

impl JobHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<JobHandle> for Uuid {
    fn from(handle: JobHandle) -> Self {
        handle.0
    }
}

/// Progress of a job inside the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

// =============================================================================
// Read models
// =============================================================================

/// Resources an activation points at, resolved from their ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct References {
    pub project: Option<Project>,
    pub rulebook: Option<Rulebook>,
    pub decision_environment: Option<DecisionEnvironment>,
    pub extra_var: Option<ExtraVar>,
}

/// An activation with its dependent objects, instances and rule counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRead {
    #[serde(flatten)]
    pub activation: Activation,
    #[serde(flatten)]
    pub references: References,
    pub instances: Vec<ActivationInstance>,
    /// Start time of the most recent instance.
    pub restarted_at: Option<DateTime<Utc>>,
    pub rules_count: u64,
    pub rules_fired_count: u64,
}

impl ActivationRead {
    pub fn new(
        activation: Activation,
        references: References,
        instances: Vec<ActivationInstance>,
    ) -> Self {
        let (rules_count, rules_fired_count) = rule_counts(&activation.ruleset_stats);
        let restarted_at = instances.iter().map(|i| i.started_at).max();
        Self {
            activation,
            references,
            instances,
            restarted_at,
            rules_count,
            rules_fired_count,
        }
    }
}

/// A list entry: the activation plus its rule counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationListItem {
    #[serde(flatten)]
    pub activation: Activation,
    pub rules_count: u64,
    pub rules_fired_count: u64,
}

impl From<Activation> for ActivationListItem {
    fn from(activation: Activation) -> Self {
        let (rules_count, rules_fired_count) = rule_counts(&activation.ruleset_stats);
        Self {
            activation,
            rules_count,
            rules_fired_count,
        }
    }
}
