//! Activation lifecycle orchestrator.
//!
//! Validates transition requests, mutates activation state under the
//! activation's lock and dispatches the matching jobs. Requests never wait
//! for a job to run.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eda_core::config::{DeploymentConfig, EdaConfig};
use eda_core::error::EdaError;
use eda_core::types::{
    Activation, ActivationInstance, ActivationInstanceLog, ActivationStatus, NewActivation, Page,
    PageRequest, RulesetStats,
};
use eda_storage::{ActivationFilter, InstanceFilter, LogFilter};

use crate::conflict::resolve_integrity_error;
use crate::dispatch::{submit_or_log, JobDispatcher};
use crate::error::ActivationError;
use crate::locks::ActivationLocks;
use crate::monitor::LivenessMonitor;
use crate::state_machine::{check_disable, check_enable, check_restart, Decision};
use crate::store::ActivationStore;
use crate::types::{ActivationListItem, ActivationRead, JobHandle, JobRequest};

/// Entry point for every user-initiated activation operation.
pub struct Orchestrator {
    store: Arc<dyn ActivationStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    locks: Arc<ActivationLocks>,
    monitor: Arc<LivenessMonitor>,
    deployment: DeploymentConfig,
    monitor_on_list: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ActivationStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        locks: Arc<ActivationLocks>,
        monitor: Arc<LivenessMonitor>,
        config: &EdaConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            locks,
            monitor,
            deployment: config.deployment.clone(),
            monitor_on_list: config.liveness.monitor_on_list,
        }
    }

    /// Persist a new activation and start it if it is enabled.
    ///
    /// An enabled activation starts PENDING, a disabled one STOPPED. A missing
    /// referenced resource is reported by name.
    pub async fn create(&self, new: NewActivation) -> Result<ActivationRead, ActivationError> {
        if new.name.trim().is_empty() {
            return Err(ActivationError::Unprocessable(
                "Activation name must not be empty.".to_string(),
            ));
        }

        let status = if new.is_enabled {
            ActivationStatus::Pending
        } else {
            ActivationStatus::Stopped
        };
        let activation = match self.store.insert_activation(&new, status) {
            Ok(activation) => activation,
            Err(EdaError::Integrity(detail)) => {
                debug!(name = %new.name, detail = %detail, "Activation insert rejected");
                return Err(resolve_integrity_error(&new, |kind, id| {
                    self.store.resource_exists(kind, id)
                }));
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            activation_id = activation.id,
            name = %activation.name,
            is_enabled = activation.is_enabled,
            "Activation created"
        );

        let activation = if activation.is_enabled {
            let _guard = self.locks.lock(activation.id).await;
            let handle = self.submit(JobRequest::activate(activation.id, false, &self.deployment));
            self.record_job(activation, handle)?
        } else {
            activation
        };

        self.read(activation)
    }

    /// Enable an activation and dispatch an activate job.
    ///
    /// Already enabled is a no-op; a transition in flight is a Conflict.
    pub async fn enable(&self, id: i64) -> Result<(), ActivationError> {
        let _guard = self.locks.lock(id).await;
        let mut activation = self.activation(id)?;

        if check_enable(&activation)? == Decision::NoOp {
            debug!(activation_id = id, "Activation already enabled");
            return Ok(());
        }

        activation.is_enabled = true;
        activation.failure_count = 0;
        activation.set_status(ActivationStatus::Pending, None);
        let activation = self.store.update_activation(&activation)?;
        info!(activation_id = id, "Activation enabled");

        let handle = self.submit(JobRequest::activate(id, false, &self.deployment));
        self.record_job(activation, handle)?;
        Ok(())
    }

    /// Disable an activation and send one deactivate per live instance.
    pub async fn disable(&self, id: i64) -> Result<(), ActivationError> {
        let _guard = self.locks.lock(id).await;
        let mut activation = self.activation(id)?;

        if check_disable(&activation) == Decision::NoOp {
            debug!(activation_id = id, "Activation already disabled");
            return Ok(());
        }

        let live = self.live_instances(id)?;
        activation.is_enabled = false;
        let status = if live.is_empty() {
            ActivationStatus::Stopped
        } else {
            ActivationStatus::Stopping
        };
        activation.set_status(status, None);
        let activation = self.store.update_activation(&activation)?;
        info!(activation_id = id, live_instances = live.len(), "Activation disabled");

        if live.is_empty() {
            return Ok(());
        }
        let mut last = None;
        for instance in &live {
            last = self
                .submit(JobRequest::deactivate(instance.id, &self.deployment))
                .or(last);
        }
        self.record_job(activation, last)?;
        Ok(())
    }

    /// Stop any live instance and start a fresh one.
    ///
    /// A disabled activation cannot be restarted.
    pub async fn restart(&self, id: i64) -> Result<(), ActivationError> {
        let _guard = self.locks.lock(id).await;
        let mut activation = self.activation(id)?;
        check_restart(&activation)?;

        let live = self.live_instances(id)?;
        activation.restart_count += 1;
        activation.set_status(ActivationStatus::Pending, None);
        let activation = self.store.update_activation(&activation)?;
        info!(
            activation_id = id,
            restart_count = activation.restart_count,
            "Activation restart requested"
        );

        for instance in &live {
            self.submit(JobRequest::deactivate(instance.id, &self.deployment));
        }
        let handle = self.submit(JobRequest::activate(id, false, &self.deployment));
        self.record_job(activation, handle)?;
        Ok(())
    }

    /// Deactivate every instance, then remove the activation.
    pub async fn delete(&self, id: i64) -> Result<(), ActivationError> {
        let guard = self.locks.lock(id).await;
        self.activation(id)?;

        let instances = self.store.instances(id)?;
        for instance in &instances {
            self.submit(JobRequest::deactivate(instance.id, &self.deployment));
        }
        if !self.store.delete_activation(id)? {
            return Err(ActivationError::not_found("Activation", id));
        }
        drop(guard);
        self.locks.forget(id);

        info!(activation_id = id, instances = instances.len(), "Activation deleted");
        Ok(())
    }

    pub async fn retrieve(&self, id: i64) -> Result<ActivationRead, ActivationError> {
        let activation = self.activation(id)?;
        self.read(activation)
    }

    /// List activations with their rule counters.
    ///
    /// Runs a monitor pass first when `liveness.monitor_on_list` is set.
    pub async fn list(
        &self,
        filter: &ActivationFilter,
        page: PageRequest,
    ) -> Result<Page<ActivationListItem>, ActivationError> {
        if self.monitor_on_list {
            if let Err(e) = self.monitor.run_once().await {
                warn!(error = %e, "Monitor pass before list failed");
            }
        }
        let (activations, count) = self.store.list_activations(filter, page)?;
        Ok(Page::new(page, count, activations).map(ActivationListItem::from))
    }

    pub async fn list_instances(
        &self,
        activation_id: i64,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> Result<Page<ActivationInstance>, ActivationError> {
        self.activation(activation_id)?;
        let (instances, count) = self.store.list_instances(activation_id, filter, page)?;
        Ok(Page::new(page, count, instances))
    }

    pub async fn get_instance(&self, id: i64) -> Result<ActivationInstance, ActivationError> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| ActivationError::not_found("Activation Instance", id))
    }

    /// Log lines of an instance in ascending id order.
    pub async fn list_logs(
        &self,
        instance_id: i64,
        filter: &LogFilter,
        page: PageRequest,
    ) -> Result<Page<ActivationInstanceLog>, ActivationError> {
        self.get_instance(instance_id).await?;
        let (logs, count) = self.store.list_logs(instance_id, filter, page)?;
        Ok(Page::new(page, count, logs))
    }

    /// Record that an instance's rule engine is alive, optionally with fresh stats.
    pub async fn record_heartbeat(
        &self,
        instance_id: i64,
        ruleset_stats: Option<RulesetStats>,
    ) -> Result<(), ActivationError> {
        let instance = self.get_instance(instance_id).await?;
        self.store.touch_instance(instance_id, Utc::now())?;

        if let Some(stats) = ruleset_stats {
            let _guard = self.locks.lock(instance.activation_id).await;
            if let Some(mut activation) = self.store.get_activation(instance.activation_id)? {
                activation.ruleset_stats = stats;
                self.store.update_activation(&activation)?;
            }
        }
        debug!(instance_id, "Heartbeat recorded");
        Ok(())
    }

    fn activation(&self, id: i64) -> Result<Activation, ActivationError> {
        self.store
            .get_activation(id)?
            .ok_or_else(|| ActivationError::not_found("Activation", id))
    }

    fn live_instances(&self, activation_id: i64) -> Result<Vec<ActivationInstance>, ActivationError> {
        Ok(self
            .store
            .instances(activation_id)?
            .into_iter()
            .filter(|i| i.status.is_live())
            .collect())
    }

    fn submit(&self, request: JobRequest) -> Option<JobHandle> {
        submit_or_log(self.dispatcher.as_ref(), request)
    }

    /// Store the handle of the job just dispatched for `activation`.
    fn record_job(
        &self,
        mut activation: Activation,
        handle: Option<JobHandle>,
    ) -> Result<Activation, ActivationError> {
        activation.current_job_id = handle.map(Uuid::from);
        Ok(self.store.update_activation(&activation)?)
    }

    fn read(&self, activation: Activation) -> Result<ActivationRead, ActivationError> {
        let references = self.store.references(&activation)?;
        let instances = self.store.instances(activation.id)?;
        Ok(ActivationRead::new(activation, references, instances))
    }
}
