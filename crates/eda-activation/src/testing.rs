//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::Utc;

use eda_core::config::EdaConfig;
use eda_core::types::{Activation, ActivationInstance, ActivationStatus, NewActivation};
use eda_storage::Database;

use crate::dispatch::{JobQueue, QueueDispatcher};
use crate::locks::ActivationLocks;
use crate::monitor::LivenessMonitor;
use crate::orchestrator::Orchestrator;
use crate::store::{ActivationStore, SqliteStore};

/// In-memory store, queue dispatcher and locks wired together.
pub(crate) struct Harness {
    pub store: Arc<SqliteStore>,
    pub dispatcher: Arc<QueueDispatcher>,
    pub queue: JobQueue,
    pub locks: Arc<ActivationLocks>,
    pub config: EdaConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EdaConfig::default())
    }

    pub fn with_config(config: EdaConfig) -> Self {
        let db = Arc::new(Database::in_memory().unwrap());
        let (dispatcher, queue) = QueueDispatcher::new();
        Self {
            store: Arc::new(SqliteStore::new(db)),
            dispatcher: Arc::new(dispatcher),
            queue,
            locks: Arc::new(ActivationLocks::new()),
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn ActivationStore> {
        self.store.clone()
    }

    pub fn monitor(&self) -> Arc<LivenessMonitor> {
        Arc::new(LivenessMonitor::new(
            self.store(),
            self.dispatcher.clone(),
            Arc::clone(&self.locks),
            &self.config,
        ))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.store(),
            self.dispatcher.clone(),
            Arc::clone(&self.locks),
            self.monitor(),
            &self.config,
        )
    }

    /// Insert an activation directly in the given state, bypassing dispatch.
    pub fn insert(&self, name: &str, status: ActivationStatus, is_enabled: bool) -> Activation {
        let new = NewActivation {
            name: name.to_string(),
            is_enabled,
            ..NewActivation::default()
        };
        self.store.insert_activation(&new, status).unwrap()
    }

    pub fn instance(&self, activation_id: i64, status: ActivationStatus) -> ActivationInstance {
        self.store
            .insert_instance(activation_id, "demo", status)
            .unwrap()
    }

    /// Move an activation's last status change `seconds` into the past.
    pub fn age(&self, activation_id: i64, seconds: i64) {
        let mut activation = self.store.get_activation(activation_id).unwrap().unwrap();
        activation.status_updated_at = Utc::now() - chrono::Duration::seconds(seconds);
        self.store.update_activation(&activation).unwrap();
    }

    /// Pretend an instance was last heard from `seconds` ago.
    pub fn last_seen(&self, instance_id: i64, seconds: i64) {
        self.store
            .touch_instance(instance_id, Utc::now() - chrono::Duration::seconds(seconds))
            .unwrap();
    }
}
