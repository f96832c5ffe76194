//! Status rules for lifecycle transitions.
//!
//! Guards for user-requested transitions and the restart-policy verdict
//! used by the liveness monitor:
//! - Enable: no-op when enabled, Conflict while busy
//! - Disable: no-op when disabled
//! - Restart: Forbidden when disabled

use chrono::{DateTime, Utc};

use eda_core::config::RestartConfig;
use eda_core::types::{Activation, ActivationStatus, RestartPolicy};

use crate::error::ActivationError;

pub const DISABLED_RESTART_MESSAGE: &str = "Activation is disabled and cannot be run.";

/// Outcome of a guard that may turn a request into a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    NoOp,
}

pub fn check_enable(activation: &Activation) -> Result<Decision, ActivationError> {
    if activation.is_enabled {
        return Ok(Decision::NoOp);
    }
    if activation.status.is_busy() {
        return Err(ActivationError::Conflict);
    }
    Ok(Decision::Apply)
}

pub fn check_disable(activation: &Activation) -> Decision {
    if activation.is_enabled {
        Decision::Apply
    } else {
        Decision::NoOp
    }
}

pub fn check_restart(activation: &Activation) -> Result<(), ActivationError> {
    if activation.is_enabled {
        Ok(())
    } else {
        Err(ActivationError::Forbidden(
            DISABLED_RESTART_MESSAGE.to_string(),
        ))
    }
}

/// What the monitor should do about an activation that is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRestart {
    Restart,
    /// Eligible, but the backoff has not elapsed.
    Wait,
    /// Failed more often than `max_restarts_on_failure` allows.
    Exhausted,
    NotEligible,
}

pub fn auto_restart(
    activation: &Activation,
    config: &RestartConfig,
    now: DateTime<Utc>,
) -> AutoRestart {
    if !activation.is_enabled {
        return AutoRestart::NotEligible;
    }
    let elapsed = activation.seconds_in_status(now).max(0) as u64;
    let after = |delay: u64| {
        if elapsed >= delay {
            AutoRestart::Restart
        } else {
            AutoRestart::Wait
        }
    };

    match (activation.status, activation.restart_policy) {
        (ActivationStatus::Completed, RestartPolicy::Always) => after(config.seconds_on_complete),
        (ActivationStatus::Failed | ActivationStatus::Unresponsive, RestartPolicy::Never) => {
            AutoRestart::NotEligible
        }
        (ActivationStatus::Failed | ActivationStatus::Unresponsive, _) => {
            if activation.failure_count > config.max_restarts_on_failure {
                AutoRestart::Exhausted
            } else {
                after(config.seconds_on_failure)
            }
        }
        _ => AutoRestart::NotEligible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eda_core::types::RulesetStats;

    fn activation(status: ActivationStatus, is_enabled: bool) -> Activation {
        let now = Utc::now();
        Activation {
            id: 1,
            name: "demo".to_string(),
            description: String::new(),
            is_enabled,
            status,
            status_message: None,
            restart_policy: RestartPolicy::OnFailure,
            failure_count: 0,
            restart_count: 0,
            current_job_id: None,
            project_id: None,
            rulebook_id: None,
            decision_environment_id: None,
            extra_var_id: None,
            ruleset_stats: RulesetStats::new(),
            created_at: now,
            modified_at: now,
            status_updated_at: now,
            version: 0,
        }
    }

    fn aged(mut a: Activation, seconds: i64) -> Activation {
        a.status_updated_at = Utc::now() - chrono::Duration::seconds(seconds);
        a
    }

    // =====================================================================
    // Enable / disable / restart guards
    // =====================================================================

    #[test]
    fn test_enable_busy_statuses_conflict() {
        for status in [
            ActivationStatus::Starting,
            ActivationStatus::Stopping,
            ActivationStatus::Pending,
            ActivationStatus::Running,
            ActivationStatus::Unresponsive,
        ] {
            let result = check_enable(&activation(status, false));
            assert!(
                matches!(result, Err(ActivationError::Conflict)),
                "{} should conflict",
                status
            );
        }
    }

    #[test]
    fn test_enable_settled_statuses_apply() {
        for status in [
            ActivationStatus::Stopped,
            ActivationStatus::Failed,
            ActivationStatus::Completed,
            ActivationStatus::Error,
        ] {
            assert_eq!(
                check_enable(&activation(status, false)).unwrap(),
                Decision::Apply
            );
        }
    }

    #[test]
    fn test_enable_already_enabled_is_noop() {
        // Even a busy status is fine when there is nothing to change.
        let a = activation(ActivationStatus::Running, true);
        assert_eq!(check_enable(&a).unwrap(), Decision::NoOp);
    }

    #[test]
    fn test_disable() {
        assert_eq!(
            check_disable(&activation(ActivationStatus::Running, true)),
            Decision::Apply
        );
        assert_eq!(
            check_disable(&activation(ActivationStatus::Stopped, false)),
            Decision::NoOp
        );
    }

    #[test]
    fn test_restart_forbidden_when_disabled() {
        let err = check_restart(&activation(ActivationStatus::Stopped, false)).unwrap_err();
        assert!(matches!(err, ActivationError::Forbidden(_)));
        assert_eq!(err.to_string(), DISABLED_RESTART_MESSAGE);
        assert!(check_restart(&activation(ActivationStatus::Failed, true)).is_ok());
    }

    // =====================================================================
    // Restart policy
    // =====================================================================

    #[test]
    fn test_failed_restarts_after_backoff() {
        let config = RestartConfig::default();
        let now = Utc::now();

        let fresh = activation(ActivationStatus::Failed, true);
        assert_eq!(auto_restart(&fresh, &config, now), AutoRestart::Wait);

        let old = aged(activation(ActivationStatus::Failed, true), 61);
        assert_eq!(auto_restart(&old, &config, now), AutoRestart::Restart);
    }

    #[test]
    fn test_failure_bound() {
        let config = RestartConfig::default();
        let mut a = aged(activation(ActivationStatus::Unresponsive, true), 120);

        a.failure_count = config.max_restarts_on_failure;
        assert_eq!(auto_restart(&a, &config, Utc::now()), AutoRestart::Restart);

        a.failure_count = config.max_restarts_on_failure + 1;
        assert_eq!(auto_restart(&a, &config, Utc::now()), AutoRestart::Exhausted);
    }

    #[test]
    fn test_completed_restarts_only_under_always() {
        let config = RestartConfig::default();
        let mut a = activation(ActivationStatus::Completed, true);
        assert_eq!(auto_restart(&a, &config, Utc::now()), AutoRestart::NotEligible);

        a.restart_policy = RestartPolicy::Always;
        assert_eq!(auto_restart(&a, &config, Utc::now()), AutoRestart::Restart);
    }

    #[test]
    fn test_never_policy_and_disabled_not_eligible() {
        let config = RestartConfig::default();
        let mut a = aged(activation(ActivationStatus::Failed, true), 600);
        a.restart_policy = RestartPolicy::Never;
        assert_eq!(auto_restart(&a, &config, Utc::now()), AutoRestart::NotEligible);

        let disabled = aged(activation(ActivationStatus::Failed, false), 600);
        assert_eq!(
            auto_restart(&disabled, &config, Utc::now()),
            AutoRestart::NotEligible
        );
    }

    #[test]
    fn test_running_not_eligible() {
        let mut a = activation(ActivationStatus::Running, true);
        a.restart_policy = RestartPolicy::Always;
        assert_eq!(
            auto_restart(&a, &RestartConfig::default(), Utc::now()),
            AutoRestart::NotEligible
        );
    }
}
