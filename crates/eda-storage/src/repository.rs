//! Repository implementations for SQLite-backed persistence.
//!
//! Provides ActivationRepository, InstanceRepository, LogRepository and
//! ResourceRepository that operate on the Database struct using raw SQL.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;

use eda_core::error::EdaError;
use eda_core::types::{
    Activation, ActivationInstance, ActivationInstanceLog, ActivationStatus, DecisionEnvironment,
    ExtraVar, NewActivation, PageRequest, Project, ResourceKind, Rulebook, RulesetStats,
};

use crate::db::Database;

// =============================================================================
// Filters
// =============================================================================

/// Filters for listing activations.
#[derive(Debug, Clone, Default)]
pub struct ActivationFilter {
    /// Case-insensitive substring match on the name.
    pub name: Option<String>,
}

/// Filters for listing the instances of one activation.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub name: Option<String>,
    pub status: Option<ActivationStatus>,
}

/// Filters for listing the log lines of one instance.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Case-insensitive substring match on the log text.
    pub log: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Map a rusqlite error, keeping constraint violations distinguishable.
fn storage_err(context: &str, err: rusqlite::Error) -> EdaError {
    match err {
        rusqlite::Error::SqliteFailure(ref code, ref msg)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            EdaError::Integrity(
                msg.clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            )
        }
        other => EdaError::Storage(format!("{}: {}", context, other)),
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn like_pattern(fragment: &str) -> String {
    format!("%{}%", fragment.to_lowercase())
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, EdaError> {
    rows.map(|row| row.map_err(|e| EdaError::Storage(e.to_string())))
        .collect()
}

/// Run a filtered COUNT + paginated SELECT pair sharing one WHERE clause.
fn paginate<T>(
    conn: &rusqlite::Connection,
    select: &str,
    from_where: &str,
    order_by: &str,
    params: Vec<Box<dyn ToSql>>,
    page: PageRequest,
    map: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<(Vec<T>, u64), EdaError> {
    let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) {}", from_where),
            params_refs.as_slice(),
            |row| row.get(0),
        )
        .map_err(|e| storage_err("Count query", e))?;

    let sql = format!(
        "SELECT {} {} ORDER BY {} LIMIT {} OFFSET {}",
        select,
        from_where,
        order_by,
        page.limit(),
        page.offset()
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| storage_err("List query prepare", e))?;
    let rows = stmt
        .query_map(params_refs.as_slice(), |row| map(row))
        .map_err(|e| storage_err("List query", e))?;

    Ok((collect_rows(rows)?, count as u64))
}

// =============================================================================
// Activations
// =============================================================================

const ACTIVATION_COLUMNS: &str = "id, name, description, is_enabled, status, status_message,
    restart_policy, failure_count, restart_count, current_job_id, project_id, rulebook_id,
    decision_environment_id, extra_var_id, ruleset_stats, created_at, modified_at,
    status_updated_at, version";

fn row_to_activation(row: &Row<'_>) -> rusqlite::Result<Activation> {
    let job_id: Option<String> = row.get(9)?;
    let current_job_id = job_id
        .map(|raw| Uuid::parse_str(&raw).map_err(|e| conversion_err(9, e.to_string())))
        .transpose()?;
    let stats_raw: String = row.get(14)?;
    let ruleset_stats: RulesetStats =
        serde_json::from_str(&stats_raw).map_err(|e| conversion_err(14, e.to_string()))?;

    Ok(Activation {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_enabled: row.get::<_, i64>(3)? != 0,
        status: parse_col(row, 4)?,
        status_message: row.get(5)?,
        restart_policy: parse_col(row, 6)?,
        failure_count: row.get(7)?,
        restart_count: row.get(8)?,
        current_job_id,
        project_id: row.get(10)?,
        rulebook_id: row.get(11)?,
        decision_environment_id: row.get(12)?,
        extra_var_id: row.get(13)?,
        ruleset_stats,
        created_at: from_millis(row.get(15)?),
        modified_at: from_millis(row.get(16)?),
        status_updated_at: from_millis(row.get(17)?),
        version: row.get(18)?,
    })
}

/// Repository for activation records.
pub struct ActivationRepository {
    db: Arc<Database>,
}

impl ActivationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new activation with the given initial status.
    ///
    /// Foreign-key and uniqueness violations surface as `EdaError::Integrity`.
    pub fn insert(
        &self,
        new: &NewActivation,
        status: ActivationStatus,
    ) -> Result<Activation, EdaError> {
        let now = to_millis(Utc::now());
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activations (name, description, is_enabled, status, restart_policy,
                    project_id, rulebook_id, decision_environment_id, extra_var_id,
                    created_at, modified_at, status_updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10)",
                rusqlite::params![
                    new.name,
                    new.description,
                    new.is_enabled as i32,
                    status.as_str(),
                    new.restart_policy.to_string(),
                    new.project_id,
                    new.rulebook_id,
                    new.decision_environment_id,
                    new.extra_var_id,
                    now,
                ],
            )
            .map_err(|e| storage_err("Failed to insert activation", e))?;
            Ok(conn.last_insert_rowid())
        })?;

        self.find_by_id(id)?.ok_or(EdaError::NotFound {
            entity: "Activation",
            id,
        })
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Activation>, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM activations WHERE id = ?1", ACTIVATION_COLUMNS),
                [id],
                row_to_activation,
            )
            .optional()
            .map_err(|e| storage_err("Failed to load activation", e))
        })
    }

    pub fn exists(&self, id: i64) -> Result<bool, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT 1 FROM activations WHERE id = ?1", [id], |_| Ok(()))
                .optional()
                .map(|found| found.is_some())
                .map_err(|e| storage_err("Failed to check activation", e))
        })
    }

    /// List activations ordered by id, with the total matching count.
    pub fn list(
        &self,
        filter: &ActivationFilter,
        page: PageRequest,
    ) -> Result<(Vec<Activation>, u64), EdaError> {
        let mut from_where = "FROM activations".to_string();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(ref name) = filter.name {
            from_where.push_str(" WHERE LOWER(name) LIKE ?1");
            params.push(Box::new(like_pattern(name)));
        }

        self.db.with_conn(|conn| {
            paginate(
                conn,
                ACTIVATION_COLUMNS,
                &from_where,
                "id ASC",
                params,
                page,
                row_to_activation,
            )
        })
    }

    /// Every activation that is enabled, ordered by id.
    pub fn list_enabled(&self) -> Result<Vec<Activation>, EdaError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM activations WHERE is_enabled = 1 ORDER BY id ASC",
                    ACTIVATION_COLUMNS
                ))
                .map_err(|e| storage_err("Enabled query prepare", e))?;
            let rows = stmt
                .query_map([], row_to_activation)
                .map_err(|e| storage_err("Enabled query", e))?;
            collect_rows(rows)
        })
    }

    pub fn list_by_status(&self, status: ActivationStatus) -> Result<Vec<Activation>, EdaError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM activations WHERE status = ?1 ORDER BY id ASC",
                    ACTIVATION_COLUMNS
                ))
                .map_err(|e| storage_err("Status query prepare", e))?;
            let rows = stmt
                .query_map([status.as_str()], row_to_activation)
                .map_err(|e| storage_err("Status query", e))?;
            collect_rows(rows)
        })
    }

    /// Persist every mutable field of `activation` if nobody else updated it first.
    ///
    /// Compares the stored `version` with the one carried by `activation`; on a
    /// mismatch nothing is written and `EdaError::VersionConflict` is returned.
    pub fn update(&self, activation: &Activation) -> Result<Activation, EdaError> {
        let id = activation.id;
        let stats = serde_json::to_string(&activation.ruleset_stats)?;
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE activations SET
                    name = ?1, description = ?2, is_enabled = ?3, status = ?4,
                    status_message = ?5, restart_policy = ?6, failure_count = ?7,
                    restart_count = ?8, current_job_id = ?9, ruleset_stats = ?10,
                    modified_at = ?11, status_updated_at = ?12, version = version + 1
                 WHERE id = ?13 AND version = ?14",
                rusqlite::params![
                    activation.name,
                    activation.description,
                    activation.is_enabled as i32,
                    activation.status.as_str(),
                    activation.status_message,
                    activation.restart_policy.to_string(),
                    activation.failure_count,
                    activation.restart_count,
                    activation.current_job_id.map(|j| j.to_string()),
                    stats,
                    to_millis(Utc::now()),
                    to_millis(activation.status_updated_at),
                    id,
                    activation.version,
                ],
            )
            .map_err(|e| storage_err("Failed to update activation", e))
        })?;

        if changed == 0 {
            return Err(if self.exists(id)? {
                EdaError::VersionConflict {
                    entity: "Activation",
                    id,
                }
            } else {
                EdaError::NotFound {
                    entity: "Activation",
                    id,
                }
            });
        }

        self.find_by_id(id)?.ok_or(EdaError::NotFound {
            entity: "Activation",
            id,
        })
    }

    /// Delete an activation; instances and logs cascade. Returns false if absent.
    pub fn delete(&self, id: i64) -> Result<bool, EdaError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM activations WHERE id = ?1", [id])
                .map(|n| n > 0)
                .map_err(|e| storage_err("Failed to delete activation", e))
        })
    }
}

// =============================================================================
// Instances
// =============================================================================

const INSTANCE_COLUMNS: &str =
    "id, activation_id, name, status, started_at, ended_at, updated_at";

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<ActivationInstance> {
    Ok(ActivationInstance {
        id: row.get(0)?,
        activation_id: row.get(1)?,
        name: row.get(2)?,
        status: parse_col(row, 3)?,
        started_at: from_millis(row.get(4)?),
        ended_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        updated_at: from_millis(row.get(6)?),
    })
}

/// Repository for activation instances.
pub struct InstanceRepository {
    db: Arc<Database>,
}

impl InstanceRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a new run of `activation_id`, started now.
    pub fn insert(
        &self,
        activation_id: i64,
        name: &str,
        status: ActivationStatus,
    ) -> Result<ActivationInstance, EdaError> {
        let now = to_millis(Utc::now());
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activation_instances (activation_id, name, status, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![activation_id, name, status.as_str(), now],
            )
            .map_err(|e| storage_err("Failed to insert instance", e))?;
            Ok(conn.last_insert_rowid())
        })?;

        self.find_by_id(id)?.ok_or(EdaError::NotFound {
            entity: "Activation Instance",
            id,
        })
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<ActivationInstance>, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM activation_instances WHERE id = ?1",
                    INSTANCE_COLUMNS
                ),
                [id],
                row_to_instance,
            )
            .optional()
            .map_err(|e| storage_err("Failed to load instance", e))
        })
    }

    /// Paginated, filtered instances of one activation, ordered by id.
    pub fn list_for_activation(
        &self,
        activation_id: i64,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> Result<(Vec<ActivationInstance>, u64), EdaError> {
        let mut from_where = "FROM activation_instances WHERE activation_id = ?1".to_string();
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(activation_id)];
        if let Some(ref name) = filter.name {
            params.push(Box::new(like_pattern(name)));
            from_where.push_str(&format!(" AND LOWER(name) LIKE ?{}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(Box::new(status.as_str()));
            from_where.push_str(&format!(" AND status = ?{}", params.len()));
        }

        self.db.with_conn(|conn| {
            paginate(
                conn,
                INSTANCE_COLUMNS,
                &from_where,
                "id ASC",
                params,
                page,
                row_to_instance,
            )
        })
    }

    /// Every instance of one activation, oldest first.
    pub fn all_for_activation(
        &self,
        activation_id: i64,
    ) -> Result<Vec<ActivationInstance>, EdaError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM activation_instances WHERE activation_id = ?1 ORDER BY id ASC",
                    INSTANCE_COLUMNS
                ))
                .map_err(|e| storage_err("Instance query prepare", e))?;
            let rows = stmt
                .query_map([activation_id], row_to_instance)
                .map_err(|e| storage_err("Instance query", e))?;
            collect_rows(rows)
        })
    }

    /// Every instance currently in `status`, across all activations.
    pub fn list_by_status(
        &self,
        status: ActivationStatus,
    ) -> Result<Vec<ActivationInstance>, EdaError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM activation_instances WHERE status = ?1 ORDER BY id ASC",
                    INSTANCE_COLUMNS
                ))
                .map_err(|e| storage_err("Status query prepare", e))?;
            let rows = stmt
                .query_map([status.as_str()], row_to_instance)
                .map_err(|e| storage_err("Status query", e))?;
            collect_rows(rows)
        })
    }

    /// Set an instance status; terminal states also stamp `ended_at`.
    pub fn update_status(&self, id: i64, status: ActivationStatus) -> Result<(), EdaError> {
        let now = to_millis(Utc::now());
        let ended_at = (!status.is_live()).then_some(now);
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE activation_instances
                 SET status = ?1, ended_at = COALESCE(?2, ended_at), updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![status.as_str(), ended_at, now, id],
            )
            .map_err(|e| storage_err("Failed to update instance", e))
        })?;
        if changed == 0 {
            return Err(EdaError::NotFound {
                entity: "Activation Instance",
                id,
            });
        }
        Ok(())
    }

    /// Record that the engine behind an instance was heard from at `at`.
    pub fn touch(&self, id: i64, at: DateTime<Utc>) -> Result<(), EdaError> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE activation_instances SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![to_millis(at), id],
            )
            .map_err(|e| storage_err("Failed to touch instance", e))
        })?;
        if changed == 0 {
            return Err(EdaError::NotFound {
                entity: "Activation Instance",
                id,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Instance logs
// =============================================================================

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<ActivationInstanceLog> {
    Ok(ActivationInstanceLog {
        id: row.get(0)?,
        activation_instance_id: row.get(1)?,
        line_number: row.get(2)?,
        log: row.get(3)?,
    })
}

/// Repository for append-only instance log lines.
pub struct LogRepository {
    db: Arc<Database>,
}

impl LogRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one line; its line number follows the instance's previous line.
    pub fn append(&self, instance_id: i64, log: &str) -> Result<ActivationInstanceLog, EdaError> {
        self.db.with_tx(|tx| {
            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(line_number), 0) + 1
                     FROM activation_instance_logs WHERE activation_instance_id = ?1",
                    [instance_id],
                    |row| row.get(0),
                )
                .map_err(|e| storage_err("Failed to number log line", e))?;
            tx.execute(
                "INSERT INTO activation_instance_logs (activation_instance_id, line_number, log)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![instance_id, next, log],
            )
            .map_err(|e| storage_err("Failed to append log line", e))?;
            Ok(ActivationInstanceLog {
                id: tx.last_insert_rowid(),
                activation_instance_id: instance_id,
                line_number: next,
                log: log.to_string(),
            })
        })
    }

    /// Paginated log lines of one instance in insertion order.
    pub fn list(
        &self,
        instance_id: i64,
        filter: &LogFilter,
        page: PageRequest,
    ) -> Result<(Vec<ActivationInstanceLog>, u64), EdaError> {
        let mut from_where =
            "FROM activation_instance_logs WHERE activation_instance_id = ?1".to_string();
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(instance_id)];
        if let Some(ref log) = filter.log {
            from_where.push_str(" AND LOWER(log) LIKE ?2");
            params.push(Box::new(like_pattern(log)));
        }

        self.db.with_conn(|conn| {
            paginate(
                conn,
                "id, activation_instance_id, line_number, log",
                &from_where,
                "id ASC",
                params,
                page,
                row_to_log,
            )
        })
    }
}

// =============================================================================
// Dependent resources
// =============================================================================

/// Repository for the resources an activation references.
pub struct ResourceRepository {
    db: Arc<Database>,
}

impl ResourceRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn exists(&self, kind: ResourceKind, id: i64) -> Result<bool, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", kind.table()),
                [id],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(|e| storage_err("Failed to check resource", e))
        })
    }

    fn insert(&self, sql: &str, params: &[&dyn ToSql]) -> Result<i64, EdaError> {
        self.db.with_conn(|conn| {
            conn.execute(sql, params)
                .map_err(|e| storage_err("Failed to insert resource", e))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn insert_project(&self, name: &str, url: &str) -> Result<Project, EdaError> {
        let id = self.insert(
            "INSERT INTO projects (name, url) VALUES (?1, ?2)",
            &[&name, &url],
        )?;
        Ok(Project {
            id,
            name: name.to_string(),
            url: url.to_string(),
            git_hash: None,
        })
    }

    pub fn insert_rulebook(
        &self,
        name: &str,
        rulesets: &str,
        project_id: Option<i64>,
    ) -> Result<Rulebook, EdaError> {
        let id = self.insert(
            "INSERT INTO rulebooks (name, rulesets, project_id) VALUES (?1, ?2, ?3)",
            &[&name, &rulesets, &project_id],
        )?;
        Ok(Rulebook {
            id,
            name: name.to_string(),
            rulesets: rulesets.to_string(),
            project_id,
        })
    }

    pub fn insert_decision_environment(
        &self,
        name: &str,
        image_url: &str,
    ) -> Result<DecisionEnvironment, EdaError> {
        let id = self.insert(
            "INSERT INTO decision_environments (name, image_url) VALUES (?1, ?2)",
            &[&name, &image_url],
        )?;
        Ok(DecisionEnvironment {
            id,
            name: name.to_string(),
            image_url: image_url.to_string(),
        })
    }

    pub fn insert_extra_var(&self, name: &str, extra_var: &str) -> Result<ExtraVar, EdaError> {
        let id = self.insert(
            "INSERT INTO extra_vars (name, extra_var) VALUES (?1, ?2)",
            &[&name, &extra_var],
        )?;
        Ok(ExtraVar {
            id,
            name: name.to_string(),
            extra_var: extra_var.to_string(),
        })
    }

    pub fn find_project(&self, id: i64) -> Result<Option<Project>, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, url, git_hash FROM projects WHERE id = ?1",
                [id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        url: row.get(2)?,
                        git_hash: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage_err("Failed to load project", e))
        })
    }

    pub fn find_rulebook(&self, id: i64) -> Result<Option<Rulebook>, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, rulesets, project_id FROM rulebooks WHERE id = ?1",
                [id],
                |row| {
                    Ok(Rulebook {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        rulesets: row.get(2)?,
                        project_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage_err("Failed to load rulebook", e))
        })
    }

    pub fn find_decision_environment(
        &self,
        id: i64,
    ) -> Result<Option<DecisionEnvironment>, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, image_url FROM decision_environments WHERE id = ?1",
                [id],
                |row| {
                    Ok(DecisionEnvironment {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        image_url: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage_err("Failed to load decision environment", e))
        })
    }

    pub fn find_extra_var(&self, id: i64) -> Result<Option<ExtraVar>, EdaError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, extra_var FROM extra_vars WHERE id = ?1",
                [id],
                |row| {
                    Ok(ExtraVar {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        extra_var: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage_err("Failed to load extra var", e))
        })
    }
}
