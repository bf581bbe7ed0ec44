use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use mailforge_core::{AuditLog, AuditLogPayload, TaskId};

use crate::jobs::TaskError;
use crate::store::AuditStore;

/// Persists audit trail entries delivered as tasks.
pub struct AuditWorker<S> {
    store: Arc<S>,
}

impl<S> Clone for AuditWorker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: AuditStore> AuditWorker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Insert one audit log. The row id is the task id, so a redelivered task
    /// does not duplicate the entry.
    #[instrument(
        skip_all,
        fields(task_id = %task_id, company_id = %payload.company_id, action = %payload.action),
        err
    )]
    pub async fn record(&self, task_id: TaskId, payload: AuditLogPayload) -> Result<(), TaskError> {
        if payload.resource.trim().is_empty() {
            return Err(TaskError::permanent("audit log without resource"));
        }

        let log = AuditLog {
            id: *task_id.as_uuid(),
            company_id: payload.company_id,
            user_id: payload.user_id,
            action: payload.action,
            resource: payload.resource,
            resource_id: payload.resource_id,
            details: payload.details,
            ip_address: payload.ip_address,
            created_at: Utc::now(),
        };
        self.store.create_audit_log(&log).await?;

        debug!(resource = %log.resource, "audit log recorded");
        Ok(())
    }
}
