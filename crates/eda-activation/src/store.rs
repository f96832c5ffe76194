//! Persistence seam used by the orchestrator, the monitor and the worker.
//!
//! `ActivationStore` is the narrow repository interface the lifecycle logic
//! depends on; `SqliteStore` implements it over the eda-storage repositories.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use eda_core::error::EdaError;
use eda_core::types::{
    Activation, ActivationInstance, ActivationInstanceLog, ActivationStatus, NewActivation,
    PageRequest, ResourceKind,
};
use eda_storage::{
    ActivationFilter, ActivationRepository, Database, InstanceFilter, InstanceRepository,
    LogFilter, LogRepository, ResourceRepository,
};

use crate::types::References;

/// Repository operations the activation lifecycle needs.
pub trait ActivationStore: Send + Sync {
    fn insert_activation(
        &self,
        new: &NewActivation,
        status: ActivationStatus,
    ) -> Result<Activation, EdaError>;
    fn get_activation(&self, id: i64) -> Result<Option<Activation>, EdaError>;
    fn list_activations(
        &self,
        filter: &ActivationFilter,
        page: PageRequest,
    ) -> Result<(Vec<Activation>, u64), EdaError>;
    fn enabled_activations(&self) -> Result<Vec<Activation>, EdaError>;
    fn activations_with_status(
        &self,
        status: ActivationStatus,
    ) -> Result<Vec<Activation>, EdaError>;
    /// Compare-and-swap on `version`; see `ActivationRepository::update`.
    fn update_activation(&self, activation: &Activation) -> Result<Activation, EdaError>;
    fn delete_activation(&self, id: i64) -> Result<bool, EdaError>;

    fn resource_exists(&self, kind: ResourceKind, id: i64) -> Result<bool, EdaError>;
    fn references(&self, activation: &Activation) -> Result<References, EdaError>;

    fn insert_instance(
        &self,
        activation_id: i64,
        name: &str,
        status: ActivationStatus,
    ) -> Result<ActivationInstance, EdaError>;
    fn get_instance(&self, id: i64) -> Result<Option<ActivationInstance>, EdaError>;
    fn instances(&self, activation_id: i64) -> Result<Vec<ActivationInstance>, EdaError>;
    fn list_instances(
        &self,
        activation_id: i64,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> Result<(Vec<ActivationInstance>, u64), EdaError>;
    fn instances_with_status(
        &self,
        status: ActivationStatus,
    ) -> Result<Vec<ActivationInstance>, EdaError>;
    fn set_instance_status(&self, id: i64, status: ActivationStatus) -> Result<(), EdaError>;
    fn touch_instance(&self, id: i64, at: DateTime<Utc>) -> Result<(), EdaError>;

    fn append_log(&self, instance_id: i64, line: &str) -> Result<ActivationInstanceLog, EdaError>;
    fn list_logs(
        &self,
        instance_id: i64,
        filter: &LogFilter,
        page: PageRequest,
    ) -> Result<(Vec<ActivationInstanceLog>, u64), EdaError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    activations: ActivationRepository,
    instances: InstanceRepository,
    logs: LogRepository,
    resources: ResourceRepository,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            activations: ActivationRepository::new(Arc::clone(&db)),
            instances: InstanceRepository::new(Arc::clone(&db)),
            logs: LogRepository::new(Arc::clone(&db)),
            resources: ResourceRepository::new(db),
        }
    }

    /// Direct access to resource inserts, used to seed projects and rulebooks.
    pub fn resources(&self) -> &ResourceRepository {
        &self.resources
    }
}

impl ActivationStore for SqliteStore {
    fn insert_activation(
        &self,
        new: &NewActivation,
        status: ActivationStatus,
    ) -> Result<Activation, EdaError> {
        self.activations.insert(new, status)
    }

    fn get_activation(&self, id: i64) -> Result<Option<Activation>, EdaError> {
        self.activations.find_by_id(id)
    }

    fn list_activations(
        &self,
        filter: &ActivationFilter,
        page: PageRequest,
    ) -> Result<(Vec<Activation>, u64), EdaError> {
        self.activations.list(filter, page)
    }

    fn enabled_activations(&self) -> Result<Vec<Activation>, EdaError> {
        self.activations.list_enabled()
    }

    fn activations_with_status(
        &self,
        status: ActivationStatus,
    ) -> Result<Vec<Activation>, EdaError> {
        self.activations.list_by_status(status)
    }

    fn update_activation(&self, activation: &Activation) -> Result<Activation, EdaError> {
        self.activations.update(activation)
    }

    fn delete_activation(&self, id: i64) -> Result<bool, EdaError> {
        self.activations.delete(id)
    }

    fn resource_exists(&self, kind: ResourceKind, id: i64) -> Result<bool, EdaError> {
        self.resources.exists(kind, id)
    }

    fn references(&self, activation: &Activation) -> Result<References, EdaError> {
        Ok(References {
            project: match activation.project_id {
                Some(id) => self.resources.find_project(id)?,
                None => None,
            },
            rulebook: match activation.rulebook_id {
                Some(id) => self.resources.find_rulebook(id)?,
                None => None,
            },
            decision_environment: match activation.decision_environment_id {
                Some(id) => self.resources.find_decision_environment(id)?,
                None => None,
            },
            extra_var: match activation.extra_var_id {
                Some(id) => self.resources.find_extra_var(id)?,
                None => None,
            },
        })
    }

    fn insert_instance(
        &self,
        activation_id: i64,
        name: &str,
        status: ActivationStatus,
    ) -> Result<ActivationInstance, EdaError> {
        self.instances.insert(activation_id, name, status)
    }

    fn get_instance(&self, id: i64) -> Result<Option<ActivationInstance>, EdaError> {
        self.instances.find_by_id(id)
    }

    fn instances(&self, activation_id: i64) -> Result<Vec<ActivationInstance>, EdaError> {
        self.instances.all_for_activation(activation_id)
    }

    fn list_instances(
        &self,
        activation_id: i64,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> Result<(Vec<ActivationInstance>, u64), EdaError> {
        self.instances.list_for_activation(activation_id, filter, page)
    }

    fn instances_with_status(
        &self,
        status: ActivationStatus,
    ) -> Result<Vec<ActivationInstance>, EdaError> {
        self.instances.list_by_status(status)
    }

    fn set_instance_status(&self, id: i64, status: ActivationStatus) -> Result<(), EdaError> {
        self.instances.update_status(id, status)
    }

    fn touch_instance(&self, id: i64, at: DateTime<Utc>) -> Result<(), EdaError> {
        self.instances.touch(id, at)
    }

    fn append_log(&self, instance_id: i64, line: &str) -> Result<ActivationInstanceLog, EdaError> {
        self.logs.append(instance_id, line)
    }

    fn list_logs(
        &self,
        instance_id: i64,
        filter: &LogFilter,
        page: PageRequest,
    ) -> Result<(Vec<ActivationInstanceLog>, u64), EdaError> {
        self.logs.list(instance_id, filter, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_resolve_present_ids() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteStore::new(db);
        let project = store
            .resources()
            .insert_project("demo", "https://git.example.com/demo")
            .unwrap();
        let rulebook = store
            .resources()
            .insert_rulebook("hello.yml", "---", Some(project.id))
            .unwrap();

        let new = NewActivation {
            name: "demo".to_string(),
            project_id: Some(project.id),
            rulebook_id: Some(rulebook.id),
            ..NewActivation::default()
        };
        let activation = store
            .insert_activation(&new, ActivationStatus::Pending)
            .unwrap();

        let refs = store.references(&activation).unwrap();
        assert_eq!(refs.project, Some(project));
        assert_eq!(refs.rulebook, Some(rulebook));
        assert_eq!(refs.decision_environment, None);
        assert_eq!(refs.extra_var, None);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eda.db");

        let (activation_id, instance_id) = {
            let store = SqliteStore::new(Arc::new(Database::new(&path).unwrap()));
            let new = NewActivation {
                name: "durable".to_string(),
                ..NewActivation::default()
            };
            let activation = store
                .insert_activation(&new, ActivationStatus::Pending)
                .unwrap();
            let instance = store
                .insert_instance(activation.id, &activation.name, ActivationStatus::Running)
                .unwrap();
            store.append_log(instance.id, "ruleset started").unwrap();
            (activation.id, instance.id)
        };

        let store = SqliteStore::new(Arc::new(Database::new(&path).unwrap()));
        let activation = store.get_activation(activation_id).unwrap().unwrap();
        assert_eq!(activation.name, "durable");
        assert_eq!(activation.status, ActivationStatus::Pending);

        let running = store
            .instances_with_status(ActivationStatus::Running)
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, instance_id);

        let (logs, count) = store
            .list_logs(instance_id, &LogFilter::default(), PageRequest::default())
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(logs[0].log, "ruleset started");
    }
}
