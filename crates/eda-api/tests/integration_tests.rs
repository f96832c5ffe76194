//! Integration tests for the EDA API.
//!
//! Every test builds its own in-memory database and job queue, drives the
//! router with `oneshot`, and inspects the queue to see which jobs the
//! request dispatched.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use eda_activation::{
    ActivationLocks, ActivationStore, JobKind, JobQueue, LivenessMonitor, Orchestrator,
    QueueDispatcher, SqliteStore,
};
use eda_api::handlers::HealthResponse;
use eda_api::{create_router, AppState};
use eda_core::config::EdaConfig;
use eda_core::types::{Activation, ActivationInstance, ActivationStatus, NewActivation};
use eda_storage::Database;

// =============================================================================
// Helpers
// =============================================================================

struct TestApp {
    router: axum::Router,
    store: Arc<SqliteStore>,
    queue: JobQueue,
}

impl TestApp {
    fn new() -> Self {
        let config = EdaConfig::default();
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(SqliteStore::new(db));
        let (dispatcher, queue) = QueueDispatcher::new();
        let dispatcher = Arc::new(dispatcher);
        let locks = Arc::new(ActivationLocks::new());
        let monitor = Arc::new(LivenessMonitor::new(
            store.clone(),
            dispatcher.clone(),
            Arc::clone(&locks),
            &config,
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            dispatcher,
            locks,
            monitor,
            &config,
        );
        let state = AppState::new(Arc::new(orchestrator), config.server.clone());
        Self {
            router: create_router(state),
            store,
            queue,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let (status, bytes) = self
            .send(Request::get(uri).body(Body::empty()).unwrap())
            .await;
        (status, parse(&bytes))
    }

    async fn post(&self, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let request = match body {
            Some(json) => Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => Request::post(uri).body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn delete(&self, uri: &str) -> StatusCode {
        self.send(Request::delete(uri).body(Body::empty()).unwrap())
            .await
            .0
    }

    /// Create an activation through the API and return its JSON.
    async fn create(&self, body: Value) -> Value {
        let (status, bytes) = self.post("/activations", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        parse(&bytes)
    }

    /// Insert an activation directly, bypassing dispatch.
    fn seed(&self, name: &str, status: ActivationStatus, is_enabled: bool) -> Activation {
        let new = NewActivation {
            name: name.to_string(),
            is_enabled,
            ..NewActivation::default()
        };
        self.store.insert_activation(&new, status).unwrap()
    }

    fn seed_instance(&self, activation_id: i64, status: ActivationStatus) -> ActivationInstance {
        self.store
            .insert_instance(activation_id, "demo", status)
            .unwrap()
    }

    /// Kinds of every job dispatched since the last call.
    fn dispatched(&mut self) -> Vec<JobKind> {
        self.queue
            .drain()
            .into_iter()
            .map(|job| job.request.kind())
            .collect()
    }
}

fn parse(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap()
    }
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.status, "healthy");
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_enabled_dispatches_activate() {
    let mut app = TestApp::new();
    let body = app.create(json!({"name": "demo"})).await;

    assert_eq!(body["name"], "demo");
    assert_eq!(body["is_enabled"], true);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["restart_policy"], "on-failure");
    assert_eq!(body["rules_count"], 0);
    assert_eq!(body["rules_fired_count"], 0);
    assert_eq!(body["instances"], json!([]));
    assert!(body["current_job_id"].is_string());
    assert_eq!(app.dispatched(), vec![JobKind::Activate]);
}

#[tokio::test]
async fn test_create_disabled_dispatches_nothing() {
    let mut app = TestApp::new();
    let body = app
        .create(json!({"name": "quiet", "is_enabled": false}))
        .await;

    assert_eq!(body["is_enabled"], false);
    assert_eq!(body["status"], "stopped");
    assert!(body["current_job_id"].is_null());
    assert!(app.dispatched().is_empty());
}

#[tokio::test]
async fn test_create_with_references_expands_them() {
    let app = TestApp::new();
    let project = app
        .store
        .resources()
        .insert_project("demo", "https://git.example.com/demo.git")
        .unwrap();
    let rulebook = app
        .store
        .resources()
        .insert_rulebook("hello.yml", "---", Some(project.id))
        .unwrap();

    let body = app
        .create(json!({
            "name": "demo",
            "project_id": project.id,
            "rulebook_id": rulebook.id,
        }))
        .await;
    assert_eq!(body["project"]["name"], "demo");
    assert_eq!(body["rulebook"]["name"], "hello.yml");
    assert!(body["decision_environment"].is_null());
}

#[tokio::test]
async fn test_create_with_missing_reference_is_422() {
    let mut app = TestApp::new();
    let (status, bytes) = app
        .post(
            "/activations",
            Some(json!({"name": "demo", "decision_environment_id": 41, "project_id": 42})),
        )
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let body = parse(&bytes);
    assert_eq!(body["error"], "unprocessable_entity");
    assert_eq!(
        body["message"],
        "Decision environment with ID=41 does not exist."
    );
    assert!(app.dispatched().is_empty());

    let (_, list) = app.get("/activations").await;
    assert_eq!(list["count"], 0);
}

// =============================================================================
// Retrieve / list
// =============================================================================

#[tokio::test]
async fn test_get_activation() {
    let app = TestApp::new();
    let created = app.create(json!({"name": "demo"})).await;
    let id = created["id"].as_i64().unwrap();

    let (status, body) = app.get(&format!("/activations/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id);
    assert_eq!(body["name"], "demo");
}

#[tokio::test]
async fn test_get_missing_activation_is_404() {
    let app = TestApp::new();
    let (status, body) = app.get("/activations/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["message"], "Activation with ID=99 does not exist.");
}

#[tokio::test]
async fn test_list_paginates_and_clamps() {
    let app = TestApp::new();
    for name in ["alpha", "beta", "gamma"] {
        app.create(json!({"name": name, "is_enabled": false})).await;
    }

    let (status, body) = app.get("/activations?page=1&page_size=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
    assert_eq!(body["page"], 1);
    assert_eq!(body["page_size"], 2);
    assert_eq!(body["results"].as_array().unwrap().len(), 2);

    let (_, body) = app.get("/activations?page=2&page_size=2").await;
    assert_eq!(body["results"].as_array().unwrap().len(), 1);

    let (_, body) = app.get("/activations?page_size=100000").await;
    assert_eq!(body["page_size"], 200);
}

#[tokio::test]
async fn test_list_filters_by_name() {
    let app = TestApp::new();
    app.create(json!({"name": "webhook-alerts", "is_enabled": false}))
        .await;
    app.create(json!({"name": "kafka-ingest", "is_enabled": false}))
        .await;

    let (_, body) = app.get("/activations?name=WEBHOOK").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["results"][0]["name"], "webhook-alerts");
}

// =============================================================================
// Enable / disable / restart / delete
// =============================================================================

#[tokio::test]
async fn test_enable_disabled_activation() {
    let mut app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Stopped, false);

    let (status, bytes) = app
        .post(&format!("/activations/{}/enable", activation.id), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(bytes.is_empty());
    assert_eq!(app.dispatched(), vec![JobKind::Activate]);

    let (_, body) = app.get(&format!("/activations/{}", activation.id)).await;
    assert_eq!(body["is_enabled"], true);
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn test_enable_busy_activation_is_409_with_empty_body() {
    let mut app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Stopping, false);

    let (status, bytes) = app
        .post(&format!("/activations/{}/enable", activation.id), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(bytes.is_empty());
    assert!(app.dispatched().is_empty());
}

#[tokio::test]
async fn test_enable_missing_is_404() {
    let app = TestApp::new();
    let (status, _) = app.post("/activations/5/enable", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disable_sends_deactivate_per_live_instance() {
    let mut app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Running, true);
    app.seed_instance(activation.id, ActivationStatus::Completed);
    app.seed_instance(activation.id, ActivationStatus::Running);

    let (status, _) = app
        .post(&format!("/activations/{}/disable", activation.id), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(app.dispatched(), vec![JobKind::Deactivate]);

    let (_, body) = app.get(&format!("/activations/{}", activation.id)).await;
    assert_eq!(body["is_enabled"], false);
    assert_eq!(body["status"], "stopping");
}

#[tokio::test]
async fn test_disable_without_instances_stops_immediately() {
    let mut app = TestApp::new();
    let created = app.create(json!({"name": "demo"})).await;
    app.dispatched();
    let id = created["id"].as_i64().unwrap();

    let (status, _) = app.post(&format!("/activations/{}/disable", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.dispatched().is_empty());

    let (_, body) = app.get(&format!("/activations/{}", id)).await;
    assert_eq!(body["status"], "stopped");
}

#[tokio::test]
async fn test_restart_disabled_is_403() {
    let mut app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Stopped, false);

    let (status, bytes) = app
        .post(&format!("/activations/{}/restart", activation.id), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        parse(&bytes)["message"],
        "Activation is disabled and cannot be run."
    );
    assert!(app.dispatched().is_empty());
}

#[tokio::test]
async fn test_restart_stops_then_starts() {
    let mut app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Running, true);
    app.seed_instance(activation.id, ActivationStatus::Running);

    let (status, _) = app
        .post(&format!("/activations/{}/restart", activation.id), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        app.dispatched(),
        vec![JobKind::Deactivate, JobKind::Activate]
    );

    let (_, body) = app.get(&format!("/activations/{}", activation.id)).await;
    assert_eq!(body["restart_count"], 1);
}

#[tokio::test]
async fn test_delete_removes_activation() {
    let mut app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Running, true);
    app.seed_instance(activation.id, ActivationStatus::Failed);
    app.seed_instance(activation.id, ActivationStatus::Running);

    let uri = format!("/activations/{}", activation.id);
    assert_eq!(app.delete(&uri).await, StatusCode::NO_CONTENT);
    assert_eq!(
        app.dispatched(),
        vec![JobKind::Deactivate, JobKind::Deactivate]
    );

    let (status, _) = app.get(&uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.delete(&uri).await, StatusCode::NOT_FOUND);
}

// =============================================================================
// Instances, logs and heartbeats
// =============================================================================

#[tokio::test]
async fn test_list_instances_with_status_filter() {
    let app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Running, true);
    app.seed_instance(activation.id, ActivationStatus::Failed);
    let running = app.seed_instance(activation.id, ActivationStatus::Running);

    let uri = format!("/activations/{}/instances", activation.id);
    let (status, body) = app.get(&uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (_, body) = app.get(&format!("{}?status=running", uri)).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["results"][0]["id"], running.id);

    let (status, body) = app.get(&format!("{}?status=sleeping", uri)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_list_instances_of_missing_activation_is_404() {
    let app = TestApp::new();
    let (status, _) = app.get("/activations/12/instances").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_instance() {
    let app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Running, true);
    let instance = app.seed_instance(activation.id, ActivationStatus::Running);

    let (status, body) = app
        .get(&format!("/activation-instances/{}", instance.id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activation_id"], activation.id);
    assert_eq!(body["status"], "running");

    let (status, body) = app.get("/activation-instances/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body["message"],
        "Activation Instance with ID=999 does not exist."
    );
}

#[tokio::test]
async fn test_instance_logs_filter() {
    let app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Running, true);
    let instance = app.seed_instance(activation.id, ActivationStatus::Running);
    for line in ["starting ruleset", "rule fired: alert", "rule fired: page"] {
        app.store.append_log(instance.id, line).unwrap();
    }

    let uri = format!("/activation-instances/{}/logs", instance.id);
    let (status, body) = app.get(&uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
    assert_eq!(body["results"][0]["line_number"], 1);
    assert_eq!(body["results"][0]["log"], "starting ruleset");

    let (_, body) = app.get(&format!("{}?log=fired", uri)).await;
    assert_eq!(body["count"], 2);

    let (status, _) = app.get("/activation-instances/404/logs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_heartbeat_updates_rule_counts() {
    let app = TestApp::new();
    let activation = app.seed("demo", ActivationStatus::Running, true);
    let instance = app.seed_instance(activation.id, ActivationStatus::Running);

    let uri = format!("/activation-instances/{}/heartbeat", instance.id);
    let (status, _) = app
        .post(
            &uri,
            Some(json!({
                "ruleset_stats": {
                    "alerts": {"numberOfRules": 3, "rulesTriggered": 2},
                    "paging": {"numberOfRules": 1, "rulesTriggered": 5}
                }
            })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = app.get(&format!("/activations/{}", activation.id)).await;
    assert_eq!(body["rules_count"], 4);
    assert_eq!(body["rules_fired_count"], 7);

    let (status, _) = app.post(&uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_heartbeat_errors() {
    let app = TestApp::new();
    let (status, _) = app.post("/activation-instances/8/heartbeat", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let activation = app.seed("demo", ActivationStatus::Running, true);
    let instance = app.seed_instance(activation.id, ActivationStatus::Running);
    let request = Request::post(format!("/activation-instances/{}/heartbeat", instance.id))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
