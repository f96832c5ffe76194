//! Database schema migrations.
//!
//! Applies the initial schema: dependent resources (projects, rulebooks,
//! decision environments, extra vars), activations, their instances and
//! instance logs, plus the schema_migrations bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use eda_core::error::EdaError;

/// Run all pending database migrations.
///
/// Currently implements the initial schema (version 1). Future migrations
/// can be added by checking the current version and applying incremental changes.
pub fn run_migrations(conn: &Connection) -> Result<(), EdaError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| EdaError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| EdaError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), EdaError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL UNIQUE,
            url             TEXT NOT NULL DEFAULT '',
            git_hash        TEXT,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE TABLE IF NOT EXISTS rulebooks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL,
            rulesets        TEXT NOT NULL DEFAULT '',
            project_id      INTEGER,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS decision_environments (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL UNIQUE,
            image_url       TEXT NOT NULL,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE TABLE IF NOT EXISTS extra_vars (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL,
            extra_var       TEXT NOT NULL,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        -- Desired and observed state of every activation.
        CREATE TABLE IF NOT EXISTS activations (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            name                    TEXT NOT NULL UNIQUE,
            description             TEXT NOT NULL DEFAULT '',
            is_enabled              INTEGER NOT NULL DEFAULT 1,
            status                  TEXT NOT NULL DEFAULT 'pending'
                                    CHECK (status IN ('pending', 'starting', 'running', 'stopping',
                                                      'stopped', 'failed', 'completed',
                                                      'unresponsive', 'error')),
            status_message          TEXT,
            restart_policy          TEXT NOT NULL DEFAULT 'on-failure'
                                    CHECK (restart_policy IN ('always', 'on-failure', 'never')),
            failure_count           INTEGER NOT NULL DEFAULT 0,
            restart_count           INTEGER NOT NULL DEFAULT 0,
            current_job_id          TEXT,
            project_id              INTEGER,
            rulebook_id             INTEGER,
            decision_environment_id INTEGER,
            extra_var_id            INTEGER,
            ruleset_stats           TEXT NOT NULL DEFAULT '{}',
            created_at              INTEGER NOT NULL,
            modified_at             INTEGER NOT NULL,
            status_updated_at       INTEGER NOT NULL,
            version                 INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE SET NULL,
            FOREIGN KEY (rulebook_id) REFERENCES rulebooks(id) ON DELETE SET NULL,
            FOREIGN KEY (decision_environment_id)
                REFERENCES decision_environments(id) ON DELETE SET NULL,
            FOREIGN KEY (extra_var_id) REFERENCES extra_vars(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS idx_activations_status
            ON activations (status, is_enabled);

        CREATE TABLE IF NOT EXISTS activation_instances (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            activation_id   INTEGER NOT NULL,
            name            TEXT NOT NULL DEFAULT '',
            status          TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'starting', 'running', 'stopping',
                                              'stopped', 'failed', 'completed',
                                              'unresponsive', 'error')),
            started_at      INTEGER NOT NULL,
            ended_at        INTEGER,
            updated_at      INTEGER NOT NULL,
            FOREIGN KEY (activation_id) REFERENCES activations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_instances_activation
            ON activation_instances (activation_id, started_at DESC);

        CREATE INDEX IF NOT EXISTS idx_instances_status
            ON activation_instances (status, updated_at);

        -- Append-only engine output, ordered by id.
        CREATE TABLE IF NOT EXISTS activation_instance_logs (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            activation_instance_id  INTEGER NOT NULL,
            line_number             INTEGER NOT NULL,
            log                     TEXT NOT NULL,
            FOREIGN KEY (activation_instance_id)
                REFERENCES activation_instances(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_instance_logs_instance
            ON activation_instance_logs (activation_instance_id, id ASC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| EdaError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
