//! Per-connection permission checks.

use crate::codec::Method;
use crate::connection::SharedConnection;
use crate::error::AgentError;
use crate::prompt::{Decision, PermissionRequest, PromptGate};
use crate::store::Database;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Allowed, either already granted or allowed once.
    Granted,
    /// The operator refused.
    Denied,
    /// Allowed and added to the stored allow-set.
    GrantedAndPersist,
}

impl Outcome {
    /// Returns `true` unless denied.
    #[must_use]
    pub const fn is_granted(self) -> bool {
        !matches!(self, Self::Denied)
    }
}

/// Decides whether a connection may call a method, prompting when the
/// allow-set does not already cover it.
#[derive(Clone)]
pub struct PermissionGate {
    db: Database,
    prompt: Arc<dyn PromptGate>,
}

impl PermissionGate {
    /// Creates a gate that persists grants to `db`.
    #[must_use]
    pub fn new(db: Database, prompt: Arc<dyn PromptGate>) -> Self {
        Self { db, prompt }
    }

    /// Checks `method` against `conn`'s allow-set, asking the operator if
    /// needed. `detail` is shown alongside the question.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Store`] if an "allow always" grant cannot be
    /// written. The in-memory grant stays in place.
    ///
    /// A connection removed while the prompt was open is never written
    /// back, and the request is treated as denied.
    pub async fn check_allowed(
        &self,
        conn: &SharedConnection,
        method: Method,
        detail: Option<String>,
    ) -> Result<Outcome, AgentError> {
        if !method.requires_permission() || conn.allows(method.name()) {
            debug!(%method, "permission already granted");
            return Ok(Outcome::Granted);
        }

        let snapshot = conn.snapshot();
        let request = PermissionRequest {
            app_name: snapshot.metadata.name,
            app_id: snapshot.app_id,
            method,
            detail,
        };
        match self.prompt.ask_permission(&request).await {
            Decision::AllowOnce => Ok(Outcome::Granted),
            Decision::Deny => {
                info!(app = %request.app_id, %method, "permission denied");
                Ok(Outcome::Denied)
            }
            Decision::AllowAlways => {
                let updated = conn.grant(method.name());
                if !self.db.update_connection(&updated)? {
                    info!(app = %request.app_id, %method, "connection removed while asking, refusing");
                    return Ok(Outcome::Denied);
                }
                info!(app = %request.app_id, %method, "permission granted permanently");
                Ok(Outcome::GrantedAndPersist)
            }
        }
    }
}
