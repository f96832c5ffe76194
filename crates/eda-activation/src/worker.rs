//! Job worker pool and rule-engine launching.
//!
//! `JobWorker` drains the in-process job queue with bounded concurrency and
//! runs activate, deactivate and monitor jobs. The rule engine itself is
//! started through the `EngineLauncher` trait; `ProcessLauncher` runs it as a
//! local child process and streams its output into instance logs.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use eda_core::config::WorkerConfig;
use eda_core::error::EdaError;
use eda_core::types::{ActivationInstance, ActivationStatus};

use crate::dispatch::{JobQueue, JobRegistry};
use crate::error::{ActivationError, DispatchError};
use crate::locks::ActivationLocks;
use crate::monitor::LivenessMonitor;
use crate::store::ActivationStore;
use crate::types::{ActivateParams, DeactivateParams, JobRequest, JobState};

const WEBSOCKET_PATH: &str = "/api/eda/ws/ansible-rulebook";

// =============================================================================
// Engine launching
// =============================================================================

/// Everything needed to start the rule engine for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub activation_id: i64,
    pub instance_id: i64,
    pub deployment_type: String,
    pub websocket_base_url: String,
    pub ssl_verify: String,
}

impl LaunchSpec {
    /// Address the engine connects back to.
    pub fn websocket_address(&self) -> String {
        format!(
            "{}{}",
            self.websocket_base_url.trim_end_matches('/'),
            WEBSOCKET_PATH
        )
    }
}

/// How a rule-engine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    Completed,
    Failed { code: Option<i32> },
    /// Ended by a deactivate job.
    Stopped,
}

impl EngineExit {
    pub fn status(&self) -> ActivationStatus {
        match self {
            EngineExit::Completed => ActivationStatus::Completed,
            EngineExit::Failed { .. } => ActivationStatus::Failed,
            EngineExit::Stopped => ActivationStatus::Stopped,
        }
    }
}

/// Starts rule-engine runs.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Start the engine. Every output line is sent to `output`; the channel
    /// closes once the engine's output ends.
    async fn launch(
        &self,
        spec: &LaunchSpec,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn RunningEngine>, DispatchError>;
}

/// A started rule-engine run.
#[async_trait]
pub trait RunningEngine: Send {
    /// Wait for the engine to exit on its own.
    async fn wait(&mut self) -> Result<EngineExit, DispatchError>;

    async fn stop(&mut self) -> Result<(), DispatchError>;
}

/// Runs the rule engine as a local child process.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    log_level: String,
}

impl ProcessLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            command: config.engine_command.clone(),
            args: config.engine_args.clone(),
            log_level: config.log_level.clone(),
        }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn RunningEngine>, DispatchError> {
        if spec.deployment_type != "local" {
            return Err(DispatchError::UnsupportedDeployment(
                spec.deployment_type.clone(),
            ));
        }

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg("--id")
            .arg(spec.instance_id.to_string())
            .arg("--websocket-address")
            .arg(spec.websocket_address())
            .arg("--websocket-ssl-verify")
            .arg(&spec.ssl_verify);
        if !self.log_level.is_empty() {
            command.arg(&self.log_level);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| DispatchError::Launch(format!("{}: {}", self.command, e)))?;
        info!(
            instance_id = spec.instance_id,
            pid = child.id(),
            command = %self.command,
            "Rule engine started"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, output));
        }
        Ok(Box::new(ProcessEngine { child }))
    }
}

async fn forward_lines<R>(reader: R, output: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if output.send(line).is_err() {
            break;
        }
    }
}

struct ProcessEngine {
    child: Child,
}

#[async_trait]
impl RunningEngine for ProcessEngine {
    async fn wait(&mut self) -> Result<EngineExit, DispatchError> {
        let status = self.child.wait().await?;
        if status.success() {
            Ok(EngineExit::Completed)
        } else {
            Ok(EngineExit::Failed {
                code: status.code(),
            })
        }
    }

    async fn stop(&mut self) -> Result<(), DispatchError> {
        self.child.kill().await?;
        Ok(())
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Consumes jobs from the queue and drives rule-engine runs.
pub struct JobWorker {
    store: Arc<dyn ActivationStore>,
    locks: Arc<ActivationLocks>,
    monitor: Arc<LivenessMonitor>,
    launcher: Arc<dyn EngineLauncher>,
    /// Stop signals of the engines this worker started, by instance id.
    engines: Mutex<HashMap<i64, Arc<Notify>>>,
    concurrency: usize,
    shutdown: Notify,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn ActivationStore>,
        locks: Arc<ActivationLocks>,
        monitor: Arc<LivenessMonitor>,
        launcher: Arc<dyn EngineLauncher>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            locks,
            monitor,
            launcher,
            engines: Mutex::new(HashMap::new()),
            concurrency: config.concurrency.max(1),
            shutdown: Notify::new(),
        }
    }

    /// Process jobs until shutdown or until the dispatcher is dropped.
    ///
    /// Running engines are left to the process lifetime; instances that stop
    /// reporting are picked up by the liveness monitor after a restart.
    pub async fn run(self: Arc<Self>, mut queue: JobQueue) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let registry = queue.registry();
        info!(concurrency = self.concurrency, "Job worker started");

        loop {
            let job = tokio::select! {
                job = queue.next() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = self.shutdown.notified() => break,
            };
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };

            let worker = Arc::clone(&self);
            let registry: Arc<JobRegistry> = Arc::clone(&registry);
            tokio::spawn(async move {
                let kind = job.request.kind();
                registry.set(job.handle, JobState::Running);
                debug!(job_id = %job.handle, kind = %kind, "Job started");

                let state = match worker.process(&job.request).await {
                    Ok(()) => JobState::Finished,
                    Err(e) => {
                        warn!(job_id = %job.handle, kind = %kind, error = %e, "Job failed");
                        JobState::Failed
                    }
                };
                registry.set(job.handle, state);
                drop(permit);
            });
        }
        info!("Job worker stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run a single job to completion.
    pub async fn process(self: &Arc<Self>, request: &JobRequest) -> Result<(), ActivationError> {
        match request {
            JobRequest::Activate(params) => self.activate(params).await,
            JobRequest::Deactivate(params) => self.deactivate(params).await,
            JobRequest::Monitor => self.monitor.run_once().await.map(|_| ()),
        }
    }

    async fn activate(self: &Arc<Self>, params: &ActivateParams) -> Result<(), ActivationError> {
        let activation_id = params.activation_id;
        let _guard = self.locks.lock(activation_id).await;

        let Some(mut activation) = self.store.get_activation(activation_id)? else {
            info!(activation_id, "Activation deleted before start, skipping");
            return Ok(());
        };
        if !activation.is_enabled {
            info!(activation_id, "Activation disabled before start, skipping");
            return Ok(());
        }

        let instance =
            self.store
                .insert_instance(activation_id, &activation.name, ActivationStatus::Starting)?;
        activation.set_status(ActivationStatus::Starting, None);
        if params.is_restart {
            activation.restart_count += 1;
        }
        let mut activation = self.store.update_activation(&activation)?;

        let spec = LaunchSpec {
            activation_id,
            instance_id: instance.id,
            deployment_type: params.deployment_type.clone(),
            websocket_base_url: params.websocket_base_url.clone(),
            ssl_verify: params.ssl_verify.clone(),
        };
        let (output, lines) = mpsc::unbounded_channel();
        let engine = match self.launcher.launch(&spec, output).await {
            Ok(engine) => engine,
            Err(e) => {
                error!(activation_id, instance_id = instance.id, error = %e, "Rule engine failed to start");
                if let Err(log_err) = self
                    .store
                    .append_log(instance.id, &format!("Failed to start rule engine: {}", e))
                {
                    debug!(instance_id = instance.id, error = %log_err, "Failed to record launch error");
                }
                self.apply_exit(
                    activation_id,
                    &instance,
                    EngineExit::Failed { code: None },
                    Some(e.to_string()),
                )?;
                return Err(e.into());
            }
        };

        self.store
            .set_instance_status(instance.id, ActivationStatus::Running)?;
        activation.set_status(ActivationStatus::Running, None);
        self.store.update_activation(&activation)?;
        info!(activation_id, instance_id = instance.id, "Activation running");

        let stop = Arc::new(Notify::new());
        self.register(instance.id, Arc::clone(&stop));

        tokio::spawn(Arc::clone(self).supervise(activation_id, instance, engine, lines, stop));
        Ok(())
    }

    /// Follow an engine run to its end, recording output and final status.
    async fn supervise(
        self: Arc<Self>,
        activation_id: i64,
        instance: ActivationInstance,
        mut engine: Box<dyn RunningEngine>,
        mut lines: mpsc::UnboundedReceiver<String>,
        stop: Arc<Notify>,
    ) {
        let instance_id = instance.id;
        let store = Arc::clone(&self.store);
        let drain = tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if let Err(e) = store.append_log(instance_id, &line) {
                    debug!(instance_id, error = %e, "Dropping log line");
                    continue;
                }
                if let Err(e) = store.touch_instance(instance_id, Utc::now()) {
                    debug!(instance_id, error = %e, "Failed to record heartbeat");
                }
            }
        });

        let outcome = tokio::select! {
            exit = engine.wait() => Some(exit),
            _ = stop.notified() => None,
        };
        let exit = match outcome {
            Some(Ok(exit)) => exit,
            Some(Err(e)) => {
                warn!(instance_id, error = %e, "Lost track of rule engine");
                EngineExit::Failed { code: None }
            }
            None => {
                if let Err(e) = engine.stop().await {
                    warn!(instance_id, error = %e, "Failed to stop rule engine");
                }
                EngineExit::Stopped
            }
        };
        if let Err(e) = drain.await {
            warn!(instance_id, error = %e, "Log drain task failed");
        }
        self.unregister(instance_id);

        let message = match exit {
            EngineExit::Failed { code: Some(code) } => {
                Some(format!("Rule engine exited with code {}", code))
            }
            _ => None,
        };
        let _guard = self.locks.lock(activation_id).await;
        if let Err(e) = self.apply_exit(activation_id, &instance, exit, message) {
            warn!(activation_id, instance_id, error = %e, "Failed to record engine exit");
        }
    }

    /// Record how an instance ended. The caller holds the activation's lock.
    ///
    /// The activation only follows when this instance is its latest run and
    /// it was not already moved on by a stop, a restart or the monitor.
    fn apply_exit(
        &self,
        activation_id: i64,
        instance: &ActivationInstance,
        exit: EngineExit,
        message: Option<String>,
    ) -> Result<(), ActivationError> {
        let status = exit.status();
        let Some(current) = self.store.get_instance(instance.id)? else {
            return Ok(());
        };
        if current.status.is_live() {
            self.store.set_instance_status(instance.id, status)?;
        }
        if exit == EngineExit::Stopped {
            return Ok(());
        }

        let Some(mut activation) = self.store.get_activation(activation_id)? else {
            return Ok(());
        };
        let latest = self.store.instances(activation_id)?.last().map(|i| i.id);
        let following = activation.is_enabled
            && latest == Some(instance.id)
            && matches!(
                activation.status,
                ActivationStatus::Starting | ActivationStatus::Running
            );
        if !following {
            return Ok(());
        }

        if status == ActivationStatus::Failed {
            activation.failure_count += 1;
            warn!(
                activation_id,
                instance_id = instance.id,
                failure_count = activation.failure_count,
                "Activation failed"
            );
        } else {
            info!(activation_id, instance_id = instance.id, "Activation completed");
        }
        activation.set_status(status, message);
        self.store.update_activation(&activation)?;
        Ok(())
    }

    async fn deactivate(&self, params: &DeactivateParams) -> Result<(), ActivationError> {
        let instance_id = params.activation_instance_id;
        let Some(instance) = self.store.get_instance(instance_id)? else {
            // The activation was deleted; only the engine is left to stop.
            self.signal_stop(instance_id);
            return Ok(());
        };

        let _guard = self.locks.lock(instance.activation_id).await;
        self.signal_stop(instance_id);

        if instance.status.is_live() {
            match self
                .store
                .set_instance_status(instance_id, ActivationStatus::Stopped)
            {
                Ok(()) => {}
                Err(EdaError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            info!(activation_id = instance.activation_id, instance_id, "Instance stopped");
        }

        let Some(mut activation) = self.store.get_activation(instance.activation_id)? else {
            return Ok(());
        };
        if activation.is_enabled || activation.status == ActivationStatus::Stopped {
            return Ok(());
        }
        let any_live = self
            .store
            .instances(activation.id)?
            .iter()
            .any(|i| i.status.is_live());
        if !any_live {
            activation.set_status(ActivationStatus::Stopped, None);
            self.store.update_activation(&activation)?;
            info!(activation_id = activation.id, "Activation stopped");
        }
        Ok(())
    }

    fn register(&self, instance_id: i64, stop: Arc<Notify>) {
        if let Ok(mut engines) = self.engines.lock() {
            engines.insert(instance_id, stop);
        }
    }

    fn unregister(&self, instance_id: i64) {
        if let Ok(mut engines) = self.engines.lock() {
            engines.remove(&instance_id);
        }
    }

    fn signal_stop(&self, instance_id: i64) {
        let stop = self
            .engines
            .lock()
            .ok()
            .and_then(|mut engines| engines.remove(&instance_id));
        match stop {
            Some(stop) => stop.notify_one(),
            None => debug!(instance_id, "No engine running for instance"),
        }
    }

    /// Number of engines this worker is currently supervising.
    pub fn running_engines(&self) -> usize {
        self.engines.lock().map(|e| e.len()).unwrap_or(0)
    }
}
