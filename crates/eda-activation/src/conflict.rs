//! Turns a generic integrity failure on create into a precise message.

use eda_core::error::EdaError;
use eda_core::types::{NewActivation, ResourceKind};

use crate::error::ActivationError;

pub const GENERIC_INTEGRITY_MESSAGE: &str = "Integrity error.";

/// Re-check every reference of `new` and name the first one that is missing.
///
/// References are checked in `ResourceKind::VALIDATION_ORDER`. When all of
/// them exist the failure had another cause and a generic message is used.
pub fn resolve_integrity_error<F>(new: &NewActivation, exists: F) -> ActivationError
where
    F: Fn(ResourceKind, i64) -> Result<bool, EdaError>,
{
    for kind in ResourceKind::VALIDATION_ORDER {
        let Some(id) = new.reference(kind) else {
            continue;
        };
        match exists(kind, id) {
            Ok(true) => {}
            Ok(false) => {
                return ActivationError::Unprocessable(format!(
                    "{} with ID={} does not exist.",
                    kind.label(),
                    id
                ));
            }
            Err(e) => {
                tracing::warn!(kind = ?kind, id, error = %e, "Reference check failed");
            }
        }
    }
    ActivationError::Unprocessable(GENERIC_INTEGRITY_MESSAGE.to_string())
}
