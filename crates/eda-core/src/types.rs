use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Observed runtime state shared by activations and their instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Unresponsive,
    Error,
}

impl ActivationStatus {
    pub const ALL: [ActivationStatus; 9] = [
        ActivationStatus::Pending,
        ActivationStatus::Starting,
        ActivationStatus::Running,
        ActivationStatus::Stopping,
        ActivationStatus::Stopped,
        ActivationStatus::Failed,
        ActivationStatus::Completed,
        ActivationStatus::Unresponsive,
        ActivationStatus::Error,
    ];

    /// A transition is already in flight; enabling must not race it.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ActivationStatus::Starting
                | ActivationStatus::Stopping
                | ActivationStatus::Pending
                | ActivationStatus::Running
                | ActivationStatus::Unresponsive
        )
    }

    /// The worker process for an instance in this state may still exist.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            ActivationStatus::Stopped
                | ActivationStatus::Failed
                | ActivationStatus::Completed
                | ActivationStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Pending => "pending",
            ActivationStatus::Starting => "starting",
            ActivationStatus::Running => "running",
            ActivationStatus::Stopping => "stopping",
            ActivationStatus::Stopped => "stopped",
            ActivationStatus::Failed => "failed",
            ActivationStatus::Completed => "completed",
            ActivationStatus::Unresponsive => "unresponsive",
            ActivationStatus::Error => "error",
        }
    }
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivationStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ActivationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown activation status: {}", s))
    }
}

/// When the liveness monitor may restart an activation on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Never => write!(f, "never"),
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "never" => Ok(RestartPolicy::Never),
            _ => Err(format!("Unknown restart policy: {}", s)),
        }
    }
}

/// Resources an activation may reference, in the order they are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    DecisionEnvironment,
    Project,
    Rulebook,
    ExtraVar,
}

impl ResourceKind {
    pub const VALIDATION_ORDER: [ResourceKind; 4] = [
        ResourceKind::DecisionEnvironment,
        ResourceKind::Project,
        ResourceKind::Rulebook,
        ResourceKind::ExtraVar,
    ];

    /// Label used in user-facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::DecisionEnvironment => "Decision environment",
            ResourceKind::Project => "Project",
            ResourceKind::Rulebook => "Rulebook",
            ResourceKind::ExtraVar => "Extra var",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            ResourceKind::DecisionEnvironment => "decision_environments",
            ResourceKind::Project => "projects",
            ResourceKind::Rulebook => "rulebooks",
            ResourceKind::ExtraVar => "extra_vars",
        }
    }
}

// =============================================================================
// Ruleset statistics
// =============================================================================

/// Counters reported by the rule engine for one ruleset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RulesetStat {
    pub number_of_rules: u64,
    pub rules_triggered: u64,
}

/// Per-ruleset counters keyed by ruleset name.
pub type RulesetStats = BTreeMap<String, RulesetStat>;

/// Sum `(numberOfRules, rulesTriggered)` across every ruleset.
pub fn rule_counts(stats: &RulesetStats) -> (u64, u64) {
    stats.values().fold((0, 0), |(rules, fired), stat| {
        (rules + stat.number_of_rules, fired + stat.rules_triggered)
    })
}

// =============================================================================
// Domain Structs
// =============================================================================

/// Desired-state record for one rule-engine worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub is_enabled: bool,
    pub status: ActivationStatus,
    pub status_message: Option<String>,
    pub restart_policy: RestartPolicy,
    pub failure_count: u32,
    pub restart_count: u32,
    pub current_job_id: Option<Uuid>,
    pub project_id: Option<i64>,
    pub rulebook_id: Option<i64>,
    pub decision_environment_id: Option<i64>,
    pub extra_var_id: Option<i64>,
    pub ruleset_stats: RulesetStats,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every update.
    pub version: i64,
}

impl NewActivation {
    /// The referenced resource id for `kind`, if any.
    pub fn reference(&self, kind: ResourceKind) -> Option<i64> {
        match kind {
            ResourceKind::DecisionEnvironment => self.decision_environment_id,
            ResourceKind::Project => self.project_id,
            ResourceKind::Rulebook => self.rulebook_id,
            ResourceKind::ExtraVar => self.extra_var_id,
        }
    }
}

impl Activation {
    /// Set a new status and stamp the status change time.
    pub fn set_status(&mut self, status: ActivationStatus, message: Option<String>) {
        self.status = status;
        self.status_message = message;
        self.status_updated_at = Utc::now();
    }

    /// Seconds elapsed since the last status change.
    pub fn seconds_in_status(&self, now: DateTime<Utc>) -> i64 {
        (now - self.status_updated_at).num_seconds()
    }
}

/// Fields required to insert a new activation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewActivation {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub project_id: Option<i64>,
    pub rulebook_id: Option<i64>,
    pub decision_environment_id: Option<i64>,
    pub extra_var_id: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

/// One concrete run of the rule engine for an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationInstance {
    pub id: i64,
    pub activation_id: i64,
    pub name: String,
    pub status: ActivationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Last time the running engine was heard from.
    pub updated_at: DateTime<Utc>,
}

/// One output line of an activation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationInstanceLog {
    pub id: i64,
    pub activation_instance_id: i64,
    pub line_number: i64,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub git_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rulebook {
    pub id: i64,
    pub name: String,
    pub rulesets: String,
    pub project_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEnvironment {
    pub id: i64,
    pub name: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraVar {
    pub id: i64,
    pub name: String,
    pub extra_var: String,
}

// =============================================================================
// Pagination
// =============================================================================

/// A 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }

    pub fn limit(&self) -> u64 {
        self.page_size as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// One page of results plus the total number of matching rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub count: u64,
    pub page: u32,
    pub page_size: u32,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(request: PageRequest, count: u64, results: Vec<T>) -> Self {
        Self {
            count,
            page: request.page,
            page_size: request.page_size,
            results,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            count: self.count,
            page: self.page,
            page_size: self.page_size,
            results: self.results.into_iter().map(f).collect(),
        }
    }
}
