//! Job dispatch: the `JobDispatcher` seam and its in-process queue.
//!
//! Submission never blocks. `QueueDispatcher` hands jobs to a `JobQueue`
//! drained by the worker pool and tracks each job's progress in a shared
//! `JobRegistry`, which answers whether a job handle is still in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::types::{JobHandle, JobRequest, JobState};

/// Submits asynchronous units of work to a worker pool.
pub trait JobDispatcher: Send + Sync {
    /// Enqueue `request` and return its handle without waiting for it to run.
    fn submit(&self, request: JobRequest) -> Result<JobHandle, DispatchError>;

    /// Whether the job is queued or running.
    fn is_live(&self, handle: JobHandle) -> bool;
}

/// Submit a job, logging instead of failing when the queue rejects it.
///
/// Lifecycle state is persisted before dispatch; a lost job is picked up
/// again by the liveness monitor.
pub fn submit_or_log(dispatcher: &dyn JobDispatcher, request: JobRequest) -> Option<JobHandle> {
    let kind = request.kind();
    match dispatcher.submit(request) {
        Ok(handle) => {
            debug!(job_id = %handle, kind = %kind, "Job dispatched");
            Some(handle)
        }
        Err(e) => {
            warn!(kind = %kind, error = %e, "Job dispatch failed");
            None
        }
    }
}

/// A job as delivered to the worker pool.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: JobHandle,
    pub request: JobRequest,
}

/// Shared record of every submitted job's state.
#[derive(Debug, Default)]
pub struct JobRegistry {
    states: Mutex<HashMap<JobHandle, JobState>>,
}

impl JobRegistry {
    pub fn set(&self, handle: JobHandle, state: JobState) {
        match self.states.lock() {
            Ok(mut states) => {
                states.insert(handle, state);
            }
            Err(e) => warn!(job_id = %handle, error = %e, "Job registry lock poisoned"),
        }
    }

    pub fn get(&self, handle: JobHandle) -> Option<JobState> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&handle).copied())
    }
}

/// In-process dispatcher backed by an unbounded tokio channel.
pub struct QueueDispatcher {
    sender: mpsc::UnboundedSender<Job>,
    registry: Arc<JobRegistry>,
}

/// Receiving side of a `QueueDispatcher`.
pub struct JobQueue {
    receiver: mpsc::UnboundedReceiver<Job>,
    registry: Arc<JobRegistry>,
}

impl QueueDispatcher {
    /// Create a dispatcher and the queue its jobs are delivered to.
    pub fn new() -> (Self, JobQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let registry = Arc::new(JobRegistry::default());
        (
            Self {
                sender,
                registry: Arc::clone(&registry),
            },
            JobQueue { receiver, registry },
        )
    }

    pub fn state(&self, handle: JobHandle) -> Option<JobState> {
        self.registry.get(handle)
    }
}

impl JobDispatcher for QueueDispatcher {
    fn submit(&self, request: JobRequest) -> Result<JobHandle, DispatchError> {
        let handle = JobHandle::new();
        self.registry.set(handle, JobState::Queued);
        if self.sender.send(Job { handle, request }).is_err() {
            self.registry.set(handle, JobState::Failed);
            return Err(DispatchError::QueueClosed);
        }
        Ok(handle)
    }

    fn is_live(&self, handle: JobHandle) -> bool {
        self.registry.get(handle).is_some_and(|state| state.is_live())
    }
}

impl JobQueue {
    /// Wait for the next job; `None` once every dispatcher is dropped.
    pub async fn next(&mut self) -> Option<Job> {
        self.receiver.recv().await
    }

    /// Take a job if one is already waiting.
    pub fn try_next(&mut self) -> Option<Job> {
        self.receiver.try_recv().ok()
    }

    /// Every job currently waiting, in submission order.
    pub fn drain(&mut self) -> Vec<Job> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        Arc::clone(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobKind;
    use eda_core::config::DeploymentConfig;

    #[test]
    fn test_submit_delivers_in_order() {
        let (dispatcher, mut queue) = QueueDispatcher::new();
        let deployment = DeploymentConfig::default();

        let first = dispatcher
            .submit(JobRequest::deactivate(3, &deployment))
            .unwrap();
        let second = dispatcher
            .submit(JobRequest::activate(1, false, &deployment))
            .unwrap();
        assert_ne!(first, second);

        let jobs = queue.drain();
        let kinds: Vec<JobKind> = jobs.iter().map(|j| j.request.kind()).collect();
        assert_eq!(kinds, vec![JobKind::Deactivate, JobKind::Activate]);
        assert_eq!(jobs[0].handle, first);
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_job_liveness_follows_registry() {
        let (dispatcher, queue) = QueueDispatcher::new();
        let handle = dispatcher.submit(JobRequest::Monitor).unwrap();
        assert_eq!(dispatcher.state(handle), Some(JobState::Queued));
        assert!(dispatcher.is_live(handle));

        let registry = queue.registry();
        registry.set(handle, JobState::Running);
        assert!(dispatcher.is_live(handle));

        registry.set(handle, JobState::Finished);
        assert!(!dispatcher.is_live(handle));
        assert!(!dispatcher.is_live(JobHandle::new()));
    }

    #[test]
    fn test_submit_after_queue_dropped_fails() {
        let (dispatcher, queue) = QueueDispatcher::new();
        drop(queue);

        let err = dispatcher.submit(JobRequest::Monitor).unwrap_err();
        assert!(matches!(err, DispatchError::QueueClosed));
        assert!(submit_or_log(&dispatcher, JobRequest::Monitor).is_none());
    }

    #[tokio::test]
    async fn test_next_returns_none_when_dispatcher_dropped() {
        let (dispatcher, mut queue) = QueueDispatcher::new();
        dispatcher.submit(JobRequest::Monitor).unwrap();
        drop(dispatcher);

        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());
    }
}
