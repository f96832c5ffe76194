//! Liveness monitor for activation instances.
//!
//! A pass expires instances that stopped reporting, applies each
//! activation's restart policy and picks up lifecycle jobs that were lost
//! on the way to the worker. Passes run as "monitor" jobs scheduled by the
//! background ticker, or inline when an activation list asks for one.
//!
//! Nothing is dispatched for an activation whose `current_job_id` is still
//! queued or running.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eda_core::config::{DeploymentConfig, EdaConfig, LivenessConfig, RestartConfig};
use eda_core::types::{Activation, ActivationInstance, ActivationStatus, RestartPolicy};

use crate::dispatch::{submit_or_log, JobDispatcher};
use crate::error::ActivationError;
use crate::locks::ActivationLocks;
use crate::state_machine::{auto_restart, AutoRestart};
use crate::store::ActivationStore;
use crate::types::{JobHandle, JobRequest};

pub const EXHAUSTED_MESSAGE: &str = "Exceeded the maximum number of restarts on failure.";
pub const UNRESPONSIVE_MESSAGE: &str = "Rule engine stopped reporting.";
pub const NEVER_STARTED_MESSAGE: &str = "Rule engine never reported after start.";

/// Counters describing what one monitor pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Running instances marked unresponsive.
    pub unresponsive: usize,
    /// Starting or stopping instances given up on.
    pub expired: usize,
    pub restarted: usize,
    pub redispatched: usize,
    /// Disabled activations whose last instance is gone.
    pub stopped: usize,
    pub exhausted: usize,
}

/// Periodically reconciles observed instance state with restart policy.
pub struct LivenessMonitor {
    store: Arc<dyn ActivationStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    locks: Arc<ActivationLocks>,
    liveness: LivenessConfig,
    restart: RestartConfig,
    deployment: DeploymentConfig,
    last_pass: Mutex<Option<JobHandle>>,
    shutdown: Arc<Notify>,
}

impl LivenessMonitor {
    pub fn new(
        store: Arc<dyn ActivationStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        locks: Arc<ActivationLocks>,
        config: &EdaConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            locks,
            liveness: config.liveness.clone(),
            restart: config.restart.clone(),
            deployment: config.deployment.clone(),
            last_pass: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Schedule a monitor job every `liveness.check_seconds` until shutdown.
    ///
    /// A tick is skipped while the previous pass is still queued or running.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.liveness.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            check_seconds = self.liveness.check_seconds,
            timeout_seconds = self.liveness.timeout_seconds,
            "Liveness monitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => self.schedule_pass(),
                _ = self.shutdown.notified() => {
                    info!("Liveness monitor stopped");
                    return;
                }
            }
        }
    }

    /// Signal the ticker loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn schedule_pass(&self) {
        let mut last = match self.last_pass.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = *last {
            if self.dispatcher.is_live(handle) {
                debug!(job_id = %handle, "Previous monitor pass still in flight");
                return;
            }
        }
        *last = submit_or_log(self.dispatcher.as_ref(), JobRequest::Monitor);
    }

    /// Run one monitor pass now.
    ///
    /// Failures on a single activation are logged and do not stop the pass.
    pub async fn run_once(&self) -> Result<MonitorReport, ActivationError> {
        let now = Utc::now();
        let mut report = MonitorReport::default();

        for status in ActivationStatus::ALL.into_iter().filter(|s| s.is_live()) {
            for instance in self.store.instances_with_status(status)? {
                if !self.is_stale(&instance, now) {
                    continue;
                }
                match self.expire(instance.id, instance.activation_id, now).await {
                    Ok(Some(ActivationStatus::Unresponsive)) => report.unresponsive += 1,
                    Ok(Some(_)) => report.expired += 1,
                    Ok(None) => {}
                    Err(e) => warn!(
                        instance_id = instance.id,
                        error = %e,
                        "Failed to expire stale instance"
                    ),
                }
            }
        }

        for activation in self.store.enabled_activations()? {
            if let Err(e) = self.reconcile(activation.id, now, &mut report).await {
                warn!(activation_id = activation.id, error = %e, "Failed to reconcile activation");
            }
        }

        for activation in self.store.activations_with_status(ActivationStatus::Stopping)? {
            if activation.is_enabled {
                continue;
            }
            if let Err(e) = self.finish_stop(activation.id, now, &mut report).await {
                warn!(activation_id = activation.id, error = %e, "Failed to finish stop");
            }
        }

        if report == MonitorReport::default() {
            debug!("Monitor pass found nothing to do");
        } else {
            info!(
                unresponsive = report.unresponsive,
                expired = report.expired,
                restarted = report.restarted,
                redispatched = report.redispatched,
                stopped = report.stopped,
                exhausted = report.exhausted,
                "Monitor pass complete"
            );
        }
        Ok(report)
    }

    fn is_stale(&self, instance: &ActivationInstance, now: DateTime<Utc>) -> bool {
        (now - instance.updated_at).num_seconds() > self.liveness.timeout_seconds as i64
    }

    /// Give up on a live instance that has not reported for `timeout_seconds`.
    ///
    /// Returns the status the instance was moved to. A running instance
    /// becomes unresponsive; one that never came up fails; one already being
    /// stopped is taken as stopped. A deactivate is sent either way so the
    /// worker releases whatever is left of the engine.
    async fn expire(
        &self,
        instance_id: i64,
        activation_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<ActivationStatus>, ActivationError> {
        let _guard = self.locks.lock(activation_id).await;

        // A heartbeat or a stop may have landed since the scan.
        let Some(instance) = self.store.get_instance(instance_id)? else {
            return Ok(None);
        };
        if !instance.status.is_live() || !self.is_stale(&instance, now) {
            return Ok(None);
        }
        let activation = self.store.get_activation(activation_id)?;
        if activation.as_ref().is_some_and(|a| self.job_in_flight(a)) {
            return Ok(None);
        }

        let (status, message) = match instance.status {
            ActivationStatus::Running => (ActivationStatus::Unresponsive, UNRESPONSIVE_MESSAGE),
            ActivationStatus::Pending | ActivationStatus::Starting => {
                (ActivationStatus::Failed, NEVER_STARTED_MESSAGE)
            }
            _ => (ActivationStatus::Stopped, UNRESPONSIVE_MESSAGE),
        };
        self.store.set_instance_status(instance_id, status)?;
        warn!(
            activation_id,
            instance_id,
            from = %instance.status,
            to = %status,
            last_seen = %instance.updated_at,
            "Instance stopped reporting"
        );
        let deactivate = submit_or_log(
            self.dispatcher.as_ref(),
            JobRequest::deactivate(instance_id, &self.deployment),
        );

        let Some(mut activation) = activation else {
            return Ok(Some(status));
        };
        if status != ActivationStatus::Stopped && self.follows(&activation, instance_id)? {
            activation.failure_count += 1;
            let next = if status == ActivationStatus::Unresponsive
                && activation.restart_policy != RestartPolicy::Never
            {
                ActivationStatus::Unresponsive
            } else {
                ActivationStatus::Failed
            };
            activation.set_status(next, Some(message.to_string()));
            activation.current_job_id = deactivate.map(Uuid::from);
            self.store.update_activation(&activation)?;
        }
        Ok(Some(status))
    }

    /// The activation's status tracks this instance: it is enabled, starting
    /// or running, and the instance is its latest run.
    fn follows(&self, activation: &Activation, instance_id: i64) -> Result<bool, ActivationError> {
        if !activation.is_enabled
            || !matches!(
                activation.status,
                ActivationStatus::Starting | ActivationStatus::Running
            )
        {
            return Ok(false);
        }
        let latest = self.store.instances(activation.id)?.last().map(|i| i.id);
        Ok(latest == Some(instance_id))
    }

    fn job_in_flight(&self, activation: &Activation) -> bool {
        match activation.current_job_id {
            Some(job) if self.dispatcher.is_live(JobHandle(job)) => {
                debug!(activation_id = activation.id, job_id = %job, "Job in flight, skipping");
                true
            }
            _ => false,
        }
    }

    async fn reconcile(
        &self,
        activation_id: i64,
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) -> Result<(), ActivationError> {
        let _guard = self.locks.lock(activation_id).await;

        let Some(mut activation) = self.store.get_activation(activation_id)? else {
            return Ok(());
        };
        if !activation.is_enabled || self.job_in_flight(&activation) {
            return Ok(());
        }

        match auto_restart(&activation, &self.restart, now) {
            AutoRestart::Restart => {
                info!(
                    activation_id,
                    status = %activation.status,
                    failure_count = activation.failure_count,
                    "Restarting activation"
                );
                activation.set_status(ActivationStatus::Pending, None);
                activation.current_job_id = submit_or_log(
                    self.dispatcher.as_ref(),
                    JobRequest::activate(activation_id, true, &self.deployment),
                )
                .map(Uuid::from);
                self.store.update_activation(&activation)?;
                report.restarted += 1;
            }
            AutoRestart::Exhausted => {
                let already_reported = activation.status == ActivationStatus::Failed
                    && activation.status_message.as_deref() == Some(EXHAUSTED_MESSAGE);
                if !already_reported {
                    warn!(
                        activation_id,
                        failure_count = activation.failure_count,
                        max_restarts = self.restart.max_restarts_on_failure,
                        "Activation exceeded restart limit"
                    );
                    activation.set_status(
                        ActivationStatus::Failed,
                        Some(EXHAUSTED_MESSAGE.to_string()),
                    );
                    self.store.update_activation(&activation)?;
                    report.exhausted += 1;
                }
            }
            AutoRestart::Wait | AutoRestart::NotEligible => {
                if self.activate_was_lost(&activation, now)? {
                    warn!(activation_id, "No live activate job for pending activation, re-dispatching");
                    activation.set_status(ActivationStatus::Pending, None);
                    activation.current_job_id = submit_or_log(
                        self.dispatcher.as_ref(),
                        JobRequest::activate(activation_id, false, &self.deployment),
                    )
                    .map(Uuid::from);
                    self.store.update_activation(&activation)?;
                    report.redispatched += 1;
                }
            }
        }
        Ok(())
    }

    /// A pending activation with no live job and no live instance after a full
    /// check interval never reached the worker.
    fn activate_was_lost(
        &self,
        activation: &Activation,
        now: DateTime<Utc>,
    ) -> Result<bool, ActivationError> {
        if activation.status != ActivationStatus::Pending
            || activation.seconds_in_status(now) < self.liveness.check_seconds as i64
        {
            return Ok(false);
        }
        let instances = self.store.instances(activation.id)?;
        Ok(!instances.iter().any(|i| i.status.is_live()))
    }

    /// Complete a disable whose deactivate jobs were lost.
    ///
    /// With no live instance left the activation is stopped. Otherwise, once
    /// it has been stopping for a full check interval, the deactivates are
    /// sent again.
    async fn finish_stop(
        &self,
        activation_id: i64,
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) -> Result<(), ActivationError> {
        let _guard = self.locks.lock(activation_id).await;

        let Some(mut activation) = self.store.get_activation(activation_id)? else {
            return Ok(());
        };
        if activation.is_enabled
            || activation.status != ActivationStatus::Stopping
            || self.job_in_flight(&activation)
        {
            return Ok(());
        }

        let live: Vec<ActivationInstance> = self
            .store
            .instances(activation_id)?
            .into_iter()
            .filter(|i| i.status.is_live())
            .collect();
        if live.is_empty() {
            info!(activation_id, "No live instances left, activation stopped");
            activation.set_status(ActivationStatus::Stopped, None);
            self.store.update_activation(&activation)?;
            report.stopped += 1;
            return Ok(());
        }
        if activation.seconds_in_status(now) < self.liveness.check_seconds as i64 {
            return Ok(());
        }

        warn!(
            activation_id,
            live_instances = live.len(),
            "No live deactivate job for stopping activation, re-dispatching"
        );
        let mut last = None;
        for instance in &live {
            last = submit_or_log(
                self.dispatcher.as_ref(),
                JobRequest::deactivate(instance.id, &self.deployment),
            )
            .or(last);
        }
        activation.set_status(ActivationStatus::Stopping, None);
        activation.current_job_id = last.map(Uuid::from);
        self.store.update_activation(&activation)?;
        report.redispatched += 1;
        Ok(())
    }
}
