//! The privacy request state machine.
//!
//! [`RequestEngine`] owns the request registry and drives every lifecycle
//! transition: creation, identity verification, review, execution handoff,
//! pause/resume, retry, finalization, and soft deletion. Execution itself is
//! external — the engine enqueues opaque work and later receives the outcome
//! via [`StepOutcome`], never blocking on the runner.
//!
//! Ordering under partial failure: every transition commits the request's
//! primary state first and touches the cache second. A crash between the two
//! can leave a stale checkpoint behind; [`RequestEngine::requeue`] exists to
//! recover such a request, so a stale cache entry is never permanently
//! wedging.

use crate::cache::{Cache, CacheError, RequestCache};
use crate::checkpoint::{CheckpointActionRequired, CheckpointStep};
use crate::collaborators::{
    EnqueueRequest, Messenger, MessagingError, Notification, QueryPlanner, QueueError,
    TaskHandle, TaskQueue, TraversalError,
};
use crate::request::{
    ActionType, AuditAction, CollectionAddress, ExecutionLogStatus, PrivacyRequest, RequestId,
    RequestSource, RequestStatus, RequestTask, TaskStatus,
};
use crate::resume::{derive_resume_instructions, ResumeInstructions, StepOutcome};
use crate::webhook::{InputValidationError, PreApprovalReply, WebhookRegistry};
use chrono::{DateTime, Utc};
use dsr_conditions::{evaluate_rule, Condition, ConditionData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Engine behavior knobs, injected at construction. No ambient globals are
/// read inside the state machine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether user-submitted requests must verify identity before review.
    pub identity_verification_required: bool,
    /// Whether a human reviewer must approve every request. When false, a
    /// verified request is approved automatically.
    pub require_manual_approval: bool,
    /// Response window used to derive each request's due date.
    pub due_in_days: i64,
    /// Verification attempts allowed before the request is locked out.
    pub max_verification_attempts: u32,
    /// Chunk size for bulk operations.
    pub bulk_batch_size: usize,
    /// Dataset descriptions handed to the query planner.
    pub datasets: Vec<String>,
    /// Extra condition a request must satisfy before the pre-approval gate
    /// may auto-approve it. Evaluated against the request's fields;
    /// evaluation failure blocks auto-approval rather than approving
    /// blindly.
    pub auto_approval_condition: Option<Condition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            identity_verification_required: true,
            require_manual_approval: true,
            due_in_days: 45,
            max_verification_attempts: 3,
            bulk_batch_size: 50,
            datasets: Vec::new(),
            auto_approval_condition: None,
        }
    }
}

/// Errors surfaced by lifecycle transitions.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("privacy request {0} not found")]
    NotFound(RequestId),

    #[error("privacy request {0} has been deleted")]
    Deleted(RequestId),

    #[error(
        "privacy request {request_id} must be in status '{required}' to {operation}, but is '{actual}'"
    )]
    InvalidStatus {
        request_id: RequestId,
        operation: &'static str,
        required: &'static str,
        actual: RequestStatus,
    },

    #[error("task {task_id} not found on privacy request {request_id}")]
    TaskNotFound { request_id: RequestId, task_id: Uuid },

    #[error(
        "task {task_id} must be in status '{required}' to receive a callback, but is '{actual}'"
    )]
    TaskInvalidStatus {
        task_id: Uuid,
        required: &'static str,
        actual: TaskStatus,
    },

    #[error("identity verification failed for request {request_id}: {reason}")]
    IdentityVerification { request_id: RequestId, reason: String },

    #[error("request {request_id} exceeded {attempts} identity verification attempts")]
    TooManyVerificationAttempts { request_id: RequestId, attempts: u32 },

    #[error(
        "manual input supplied for collection '{supplied}' but request {request_id} is paused at '{expected}'"
    )]
    WrongCollection {
        request_id: RequestId,
        expected: String,
        supplied: String,
    },

    #[error("request {request_id} is paused without a manual collection step")]
    NoPausedCollection { request_id: RequestId },

    #[error("manual webhook '{connection_key}' has no cached input for request {request_id}")]
    ManualInputMissing {
        request_id: RequestId,
        connection_key: String,
    },

    #[error(transparent)]
    ManualInputInvalid(#[from] InputValidationError),

    #[error("bulk selection resolved to no request ids")]
    EmptySelection,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Traversal(#[from] TraversalError),
}

/// How a restart-from-failure call was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Cached identity had expired; the request was reset for a fresh cycle
    /// instead of resuming the stale one.
    Resubmitted,
    /// Execution was re-enqueued from the failed checkpoint (or from the
    /// start when no checkpoint survived).
    Retried { from_step: Option<CheckpointStep> },
}

/// Flat response representation of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub id: RequestId,
    pub status: RequestStatus,
    pub source: RequestSource,
    pub policy_id: String,
    pub requested_at: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub finished_processing_at: Option<DateTime<Utc>>,
}

impl From<&PrivacyRequest> for RequestSummary {
    fn from(request: &PrivacyRequest) -> Self {
        Self {
            id: request.id.clone(),
            status: request.status,
            source: request.source,
            policy_id: request.policy_id.clone(),
            requested_at: request.requested_at,
            due_date: request.due_date,
            reviewed_by: request.reviewed_by.clone(),
            reviewed_at: request.reviewed_at,
            finished_processing_at: request.finished_processing_at,
        }
    }
}

/// Read response: flat by default, enriched when the caller asks for the
/// verbose shape. An explicit variant choice instead of response-shaping
/// mutable state on a shared model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestReadout {
    Verbose(Box<VerboseReadout>),
    Summary(RequestSummary),
}

/// Verbose read response: logs, tasks, and the derived resume action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseReadout {
    #[serde(flatten)]
    pub summary: RequestSummary,
    pub execution_log: Vec<crate::request::ExecutionLog>,
    pub audit_log: Vec<crate::request::AuditEntry>,
    pub tasks: Vec<RequestTask>,
    /// The single external action that can move a blocked request forward,
    /// when one applies.
    pub resume: Option<ResumeInstructions>,
}

/// Target of a bulk operation.
#[derive(Debug, Clone)]
pub enum BulkSelection {
    /// An explicit id list. Empty is a hard error for the whole call.
    Ids(Vec<RequestId>),
    /// All requests matching a status filter, minus exclusions.
    Filter {
        status: Option<RequestStatus>,
        exclude: Vec<RequestId>,
    },
}

/// One item that a bulk operation could not process.
#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub message: String,
    pub data: RequestId,
}

/// Bulk outcome: partial success is always observable.
#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    pub succeeded: Vec<RequestSummary>,
    pub failed: Vec<BulkFailure>,
}

/// The privacy request lifecycle engine.
pub struct RequestEngine<C: Cache> {
    requests: HashMap<RequestId, PrivacyRequest>,
    replies: Vec<PreApprovalReply>,
    handles: HashMap<RequestId, Vec<TaskHandle>>,
    store: RequestCache<C>,
    queue: Arc<dyn TaskQueue>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<dyn WebhookRegistry>,
    planner: Arc<dyn QueryPlanner>,
    config: EngineConfig,
}

fn fetch_live<'a>(
    requests: &'a mut HashMap<RequestId, PrivacyRequest>,
    id: &RequestId,
) -> Result<&'a mut PrivacyRequest, RequestError> {
    let request = requests
        .get_mut(id)
        .ok_or_else(|| RequestError::NotFound(id.clone()))?;
    if request.is_deleted() {
        return Err(RequestError::Deleted(id.clone()));
    }
    Ok(request)
}

impl<C: Cache> RequestEngine<C> {
    pub fn new(
        store: RequestCache<C>,
        queue: Arc<dyn TaskQueue>,
        messenger: Arc<dyn Messenger>,
        registry: Arc<dyn WebhookRegistry>,
        planner: Arc<dyn QueryPlanner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            requests: HashMap::new(),
            replies: Vec::new(),
            handles: HashMap::new(),
            store,
            queue,
            messenger,
            registry,
            planner,
            config,
        }
    }

    /// Read access for callers holding an id.
    pub fn request(&self, id: &RequestId) -> Option<&PrivacyRequest> {
        self.requests.get(id)
    }

    /// Creates a request and caches its identity.
    ///
    /// User-submitted requests start `identity_unverified` when verification
    /// is configured; the verification code is cached and dispatched before
    /// the call returns, and a failed dispatch fails creation since the
    /// subject cannot proceed without the code. Authenticated creation
    /// bypasses verification and may proceed straight to execution when
    /// manual approval is not required.
    #[instrument(skip(self, identity))]
    pub async fn create_request(
        &mut self,
        policy_id: &str,
        source: RequestSource,
        actions: Vec<ActionType>,
        identity: HashMap<String, Value>,
    ) -> Result<RequestId, RequestError> {
        let needs_verification = source == RequestSource::UserSubmitted
            && self.config.identity_verification_required;
        let initial_status = if needs_verification {
            RequestStatus::IdentityUnverified
        } else {
            RequestStatus::Pending
        };

        let mut request = PrivacyRequest::new(
            policy_id,
            source,
            actions,
            initial_status,
            self.config.due_in_days,
        );
        if source == RequestSource::Authenticated {
            request.identity_verified = true;
        }
        let id = request.id.clone();

        for (attr, value) in &identity {
            self.store.set_identity_attribute(&id, attr, value).await?;
        }

        if needs_verification {
            let code = generate_verification_code();
            self.store.set_verification_code(&id, &code).await?;
            if let Err(e) = self
                .messenger
                .dispatch(&id, Notification::IdentityVerificationCode { code })
                .await
            {
                // The subject cannot proceed without the code, so creation
                // fails and leaves nothing behind.
                self.store.clear(&id).await?;
                return Err(e.into());
            }
        } else if let Err(e) = self.messenger.dispatch(&id, Notification::Receipt).await {
            warn!(request_id = %id, error = %e, "failed to send receipt");
        }

        info!(request_id = %id, status = %request.status, "privacy request created");
        self.requests.insert(id.clone(), request);

        if !needs_verification && !self.config.require_manual_approval {
            self.approve_internal(&id, "system").await?;
        }
        Ok(id)
    }

    /// Verifies the subject's identity against the cached code.
    ///
    /// A mismatched code counts against the attempt limit; an exhausted
    /// limit locks verification out entirely. On success a receipt is sent
    /// and, when manual approval is not required, the request proceeds to
    /// execution.
    #[instrument(skip(self, code))]
    pub async fn verify_identity(
        &mut self,
        id: &RequestId,
        code: &str,
    ) -> Result<(), RequestError> {
        fetch_live(&mut self.requests, id)?;

        let attempts = self.store.get_verification_attempts(id).await?;
        if attempts >= self.config.max_verification_attempts {
            return Err(RequestError::TooManyVerificationAttempts {
                request_id: id.clone(),
                attempts,
            });
        }

        let cached = self.store.get_verification_code(id).await?;
        let matches = cached.as_deref() == Some(code);
        if !matches {
            self.store.increment_verification_attempts(id).await?;
            let reason = if cached.is_none() {
                "verification code expired or was never issued".to_string()
            } else {
                "verification code does not match".to_string()
            };
            return Err(RequestError::IdentityVerification {
                request_id: id.clone(),
                reason,
            });
        }

        let request = fetch_live(&mut self.requests, id)?;
        request.identity_verified = true;
        request.audit(AuditAction::IdentityVerified, "system");
        request.update_status(RequestStatus::Pending, "system");

        if let Err(e) = self.messenger.dispatch(id, Notification::Receipt).await {
            warn!(request_id = %id, error = %e, "failed to send receipt");
        }

        if !self.config.require_manual_approval {
            self.approve_internal(id, "system").await?;
        }
        Ok(())
    }

    /// Approves a pending request and hands it to the runner.
    #[instrument(skip(self))]
    pub async fn approve(
        &mut self,
        id: &RequestId,
        reviewer: &str,
    ) -> Result<RequestSummary, RequestError> {
        self.approve_internal(id, reviewer).await
    }

    async fn approve_internal(
        &mut self,
        id: &RequestId,
        reviewer: &str,
    ) -> Result<RequestSummary, RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if request.status != RequestStatus::Pending {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "approve",
                required: "pending",
                actual: request.status,
            });
        }
        request.reviewed_by = Some(reviewer.to_string());
        request.reviewed_at = Some(Utc::now());
        request.audit(AuditAction::Approved, reviewer);
        request.update_status(RequestStatus::Approved, reviewer);
        info!(request_id = %id, reviewer, "privacy request approved");

        if let Err(e) = self
            .messenger
            .dispatch(id, Notification::RequestApproved)
            .await
        {
            warn!(request_id = %id, error = %e, "failed to send approval notification");
        }

        self.queue_for_execution(id, EnqueueRequest::fresh(id.clone()))
            .await?;
        let request = fetch_live(&mut self.requests, id)?;
        Ok(RequestSummary::from(&*request))
    }

    /// Denies a pending request.
    #[instrument(skip(self))]
    pub async fn deny(
        &mut self,
        id: &RequestId,
        reviewer: &str,
        reason: Option<String>,
    ) -> Result<RequestSummary, RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if request.status != RequestStatus::Pending {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "deny",
                required: "pending",
                actual: request.status,
            });
        }
        request.reviewed_by = Some(reviewer.to_string());
        request.reviewed_at = Some(Utc::now());
        request.audit(
            AuditAction::Denied {
                reason: reason.clone(),
            },
            reviewer,
        );
        request.update_status(RequestStatus::Denied, reviewer);
        info!(request_id = %id, reviewer, "privacy request denied");

        if let Err(e) = self
            .messenger
            .dispatch(id, Notification::RequestDenied { reason })
            .await
        {
            warn!(request_id = %id, error = %e, "failed to send denial notification");
        }
        let request = fetch_live(&mut self.requests, id)?;
        Ok(RequestSummary::from(&*request))
    }

    /// Cancels a request, revoking in-flight work best-effort.
    ///
    /// An individual revocation failure is logged and never aborts the
    /// cancellation of sibling tasks or the status transition itself.
    #[instrument(skip(self))]
    pub async fn cancel(
        &mut self,
        id: &RequestId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<(), RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if !request.status.can_cancel() {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "cancel",
                required: "a cancelable status",
                actual: request.status,
            });
        }

        for handle in self.handles.remove(id).unwrap_or_default() {
            if let Err(e) = self.queue.revoke(&handle).await {
                warn!(request_id = %id, %handle, error = %e, "failed to revoke in-flight task");
            }
        }

        let request = fetch_live(&mut self.requests, id)?;
        request.audit(AuditAction::Canceled { reason }, actor);
        request.update_status(RequestStatus::Canceled, actor);
        info!(request_id = %id, "privacy request canceled");
        Ok(())
    }

    /// Resumes a request paused on a pre-processing webhook, caching the
    /// identity the webhook derived.
    #[instrument(skip(self, derived_identity))]
    pub async fn resume_from_webhook(
        &mut self,
        id: &RequestId,
        webhook_key: &str,
        derived_identity: HashMap<String, Value>,
    ) -> Result<(), RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if request.status != RequestStatus::Paused {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "resume from a webhook",
                required: "paused",
                actual: request.status,
            });
        }
        request.update_status(RequestStatus::InProcessing, "system");

        for (attr, value) in &derived_identity {
            self.store.set_identity_attribute(id, attr, value).await?;
        }
        self.store.clear_paused_checkpoint(id).await?;
        self.queue_for_execution(id, EnqueueRequest::from_webhook(id.clone(), webhook_key))
            .await
    }

    /// Supplies manual rows for the collection a request is paused at, then
    /// resumes execution from that step.
    ///
    /// The supplied collection must match the paused checkpoint exactly; a
    /// mismatch is rejected naming the collection actually blocking.
    #[instrument(skip(self, rows))]
    pub async fn resume_with_manual_input(
        &mut self,
        id: &RequestId,
        collection: CollectionAddress,
        rows: HashMap<String, Value>,
    ) -> Result<(), RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if request.status != RequestStatus::Paused {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "resume with manual input",
                required: "paused",
                actual: request.status,
            });
        }

        let checkpoint = self.store.get_paused_checkpoint(id).await?;
        let Some(checkpoint) = checkpoint else {
            return Err(RequestError::NoPausedCollection {
                request_id: id.clone(),
            });
        };
        let Some(expected) = checkpoint.collection.clone() else {
            return Err(RequestError::NoPausedCollection {
                request_id: id.clone(),
            });
        };
        if expected != collection {
            return Err(RequestError::WrongCollection {
                request_id: id.clone(),
                expected: expected.to_string(),
                supplied: collection.to_string(),
            });
        }

        let action = match checkpoint.step {
            CheckpointStep::Erasure => ActionType::Erasure,
            _ => ActionType::Access,
        };
        self.store
            .set_manual_webhook_input(id, &collection.dataset, action, &rows)
            .await?;

        let request = fetch_live(&mut self.requests, id)?;
        request.log_execution(
            collection,
            action,
            ExecutionLogStatus::InProcessing,
            Some("manual input supplied".to_string()),
        );
        request.update_status(RequestStatus::InProcessing, "system");

        self.store.clear_paused_checkpoint(id).await?;
        self.queue_for_execution(id, EnqueueRequest::from_step(id.clone(), checkpoint.step))
            .await
    }

    /// Resumes a request blocked on missing manual webhook answers.
    ///
    /// Every currently enabled manual webhook for each of the request's
    /// actions must have a strictly valid cached answer. The webhook list is
    /// fetched live so webhooks added or removed since the pause are
    /// respected.
    #[instrument(skip(self))]
    pub async fn resume_from_requires_input(&mut self, id: &RequestId) -> Result<(), RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if request.status != RequestStatus::RequiresInput {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "resume from requires_input",
                required: "requires_input",
                actual: request.status,
            });
        }
        let actions = request.actions.clone();

        for action in actions {
            if action == ActionType::Consent {
                continue;
            }
            for webhook in self.registry.enabled_manual_webhooks(action).await {
                let input = self
                    .store
                    .get_manual_webhook_input(id, &webhook.connection_key, action)
                    .await?;
                let Some(input) = input else {
                    return Err(RequestError::ManualInputMissing {
                        request_id: id.clone(),
                        connection_key: webhook.connection_key,
                    });
                };
                webhook.validate_strict(&input)?;
            }
        }

        let request = fetch_live(&mut self.requests, id)?;
        request.update_status(RequestStatus::InProcessing, "system");
        self.queue_for_execution(id, EnqueueRequest::fresh(id.clone()))
            .await
    }

    /// Retries an errored request from its failed checkpoint.
    ///
    /// Checked before the status precondition: when the cached identity has
    /// expired and the request is not complete, the stale cycle cannot be
    /// resumed, so the request is transparently reset for resubmission
    /// instead.
    #[instrument(skip(self))]
    pub async fn restart_from_failure(
        &mut self,
        id: &RequestId,
    ) -> Result<RestartOutcome, RequestError> {
        let status = fetch_live(&mut self.requests, id)?.status;

        let identity = self.store.get_identity(id).await?;
        if identity.is_empty() && status != RequestStatus::Complete {
            debug!(request_id = %id, "cached identity expired; resubmitting");
            self.store.clear(id).await?;
            let request = fetch_live(&mut self.requests, id)?;
            request.started_processing_at = None;
            request.finished_processing_at = None;
            request.tasks.clear();
            request.audit(AuditAction::Resubmitted, "system");
            request.update_status(RequestStatus::Pending, "system");
            return Ok(RestartOutcome::Resubmitted);
        }

        if status != RequestStatus::Error {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "restart from failure",
                required: "error",
                actual: status,
            });
        }

        let from_step = self
            .store
            .get_failed_checkpoint(id)
            .await?
            .map(|checkpoint| checkpoint.step);
        self.store.increment_retry_count(id).await?;

        let request = fetch_live(&mut self.requests, id)?;
        request.update_status(RequestStatus::InProcessing, "system");

        let enqueue = match from_step {
            Some(step) => EnqueueRequest::from_step(id.clone(), step),
            None => EnqueueRequest::fresh(id.clone()),
        };
        self.queue_for_execution(id, enqueue).await?;
        self.store.clear_failed_checkpoint(id).await?;
        Ok(RestartOutcome::Retried { from_step })
    }

    /// Operator escape hatch for a stuck request: re-derives the resumption
    /// point from cached checkpoints and re-queues.
    #[instrument(skip(self))]
    pub async fn requeue(&mut self, id: &RequestId, actor: &str) -> Result<(), RequestError> {
        let status = fetch_live(&mut self.requests, id)?.status;
        if matches!(
            status,
            RequestStatus::Complete
                | RequestStatus::Denied
                | RequestStatus::Canceled
                | RequestStatus::Pending
                | RequestStatus::IdentityUnverified
        ) {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "requeue",
                required: "a resumable status",
                actual: status,
            });
        }

        let from_step = match self.store.get_failed_checkpoint(id).await? {
            Some(checkpoint) => Some(checkpoint.step),
            None => self
                .store
                .get_paused_checkpoint(id)
                .await?
                .map(|checkpoint| checkpoint.step),
        };

        let request = fetch_live(&mut self.requests, id)?;
        request.audit(AuditAction::Requeued, actor);
        request.update_status(RequestStatus::InProcessing, actor);

        let enqueue = match from_step {
            Some(step) => EnqueueRequest::from_step(id.clone(), step),
            None => EnqueueRequest::fresh(id.clone()),
        };
        self.queue_for_execution(id, enqueue).await
    }

    /// Completes the manual finalization step, re-queuing the finalization
    /// pipeline stage. The runner flips the request to `complete` and sends
    /// completion messaging.
    #[instrument(skip(self))]
    pub async fn finalize(
        &mut self,
        id: &RequestId,
        finalized_by: &str,
    ) -> Result<(), RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if request.status != RequestStatus::RequiresManualFinalization {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "finalize",
                required: "requires_manual_finalization",
                actual: request.status,
            });
        }
        request.finalized_by = Some(finalized_by.to_string());
        request.finalized_at = Some(Utc::now());
        request.audit(AuditAction::Finalized, finalized_by);
        request.update_status(RequestStatus::InProcessing, finalized_by);

        self.queue_for_execution(
            id,
            EnqueueRequest::from_step(id.clone(), CheckpointStep::Finalization),
        )
        .await
    }

    /// Receives an asynchronous completion callback for one task.
    ///
    /// The request must be executing (or approved and about to) and the
    /// named task must be awaiting its callback; mismatches are rejected
    /// naming the actual status.
    #[instrument(skip(self, access_data))]
    pub async fn handle_task_callback(
        &mut self,
        id: &RequestId,
        task_id: Uuid,
        access_data: Option<Value>,
        rows_masked: Option<u64>,
    ) -> Result<(), RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        if !matches!(
            request.status,
            RequestStatus::InProcessing | RequestStatus::Approved
        ) {
            return Err(RequestError::InvalidStatus {
                request_id: id.clone(),
                operation: "receive a task callback",
                required: "in_processing or approved",
                actual: request.status,
            });
        }

        let task = request
            .task_mut(task_id)
            .ok_or(RequestError::TaskNotFound {
                request_id: id.clone(),
                task_id,
            })?;
        if task.status != TaskStatus::AwaitingProcessing {
            return Err(RequestError::TaskInvalidStatus {
                task_id,
                required: "awaiting_processing",
                actual: task.status,
            });
        }

        task.callback_received = true;
        task.access_data = access_data;
        task.rows_masked = rows_masked;
        task.status = TaskStatus::Pending;
        let step = match task.action_type {
            ActionType::Erasure => CheckpointStep::Erasure,
            _ => CheckpointStep::Access,
        };
        debug!(request_id = %id, %task_id, "task callback received");

        self.queue_for_execution(id, EnqueueRequest::from_step(id.clone(), step))
            .await
    }

    /// Soft-deletes a request. Nothing is ever hard-deleted through the
    /// engine.
    #[instrument(skip(self))]
    pub async fn soft_delete(
        &mut self,
        id: &RequestId,
        deleted_by: Option<&str>,
    ) -> Result<(), RequestError> {
        let request = fetch_live(&mut self.requests, id)?;
        let actor = deleted_by.unwrap_or("system");
        request.deleted_at = Some(Utc::now());
        request.deleted_by = Some(actor.to_string());
        request.audit(AuditAction::SoftDeleted, actor);
        info!(request_id = %id, actor, "privacy request soft-deleted");
        Ok(())
    }

    /// Records a pre-approval webhook's reply and applies the auto-approval
    /// gate. Returns whether the request was auto-approved by this reply.
    ///
    /// The gate re-reads the full reply set and the live webhook list at
    /// decision time, so it is correct when replies from independent systems
    /// arrive in any order: a request auto-approves only when every
    /// currently configured webhook has replied and every reply whose
    /// webhook still exists is affirmative. A webhook added after earlier
    /// replies arrived blocks the gate until it too replies.
    #[instrument(skip(self))]
    pub async fn record_pre_approval_reply(
        &mut self,
        webhook_id: Uuid,
        id: &RequestId,
        eligible: bool,
    ) -> Result<bool, RequestError> {
        let status = fetch_live(&mut self.requests, id)?.status;

        self.replies
            .retain(|reply| !(reply.webhook_id == webhook_id && &reply.request_id == id));
        self.replies
            .push(PreApprovalReply::new(webhook_id, id.clone(), eligible));

        // A negative reply stands on its own; only affirmatives trigger the
        // gate, and only for a request still pending review.
        if !eligible || status != RequestStatus::Pending {
            return Ok(false);
        }

        let configured = self.registry.pre_approval_webhooks().await;
        let replies: Vec<&PreApprovalReply> = self
            .replies
            .iter()
            .filter(|reply| &reply.request_id == id)
            .collect();

        let all_replied = configured.iter().all(|webhook| {
            replies.iter().any(|reply| reply.webhook_id == webhook.id)
        });
        // Replies whose webhook has since been deleted are ignored here but
        // never satisfy "all replied" on their own.
        let all_affirmative = replies.iter().all(|reply| {
            reply.eligible || !configured.iter().any(|webhook| webhook.id == reply.webhook_id)
        });

        if !(all_replied && all_affirmative && !configured.is_empty()) {
            return Ok(false);
        }

        if let Some(condition) = &self.config.auto_approval_condition {
            let Some(request) = self.requests.get(id) else {
                return Ok(false);
            };
            let data = match serde_json::to_value(request) {
                Ok(value) => value,
                Err(e) => {
                    warn!(request_id = %id, error = %e, "auto-approval condition skipped");
                    return Ok(false);
                }
            };
            match evaluate_rule(condition, &ConditionData::Mapping(&data)) {
                Ok((true, _)) => {}
                Ok((false, _)) => {
                    debug!(request_id = %id, "auto-approval condition not met");
                    return Ok(false);
                }
                // Fail closed: an unevaluable condition means manual review.
                Err(e) => {
                    warn!(request_id = %id, error = %e, "auto-approval condition failed to evaluate");
                    return Ok(false);
                }
            }
        }

        info!(request_id = %id, "all pre-approval webhooks affirmative; auto-approving");
        self.approve_internal(id, "system").await?;
        Ok(true)
    }

    /// Records the outcome of one execution run reported by the runner.
    ///
    /// Status is committed before any cache write, so a crash mid-call
    /// leaves the request recoverable via [`RequestEngine::requeue`].
    #[instrument(skip(self, outcome))]
    pub async fn record_step_outcome(
        &mut self,
        id: &RequestId,
        outcome: StepOutcome,
    ) -> Result<(), RequestError> {
        match outcome {
            StepOutcome::AwaitingInput => {
                let request = fetch_live(&mut self.requests, id)?;
                request.update_status(RequestStatus::RequiresInput, "system");
            }
            StepOutcome::Paused(checkpoint) => {
                let request = fetch_live(&mut self.requests, id)?;
                request.update_status(RequestStatus::Paused, "system");
                self.store.set_paused_checkpoint(id, &checkpoint).await?;
            }
            StepOutcome::RequiresFinalization => {
                let request = fetch_live(&mut self.requests, id)?;
                request.update_status(RequestStatus::RequiresManualFinalization, "system");
            }
            StepOutcome::Failed { checkpoint, reason } => {
                let request = fetch_live(&mut self.requests, id)?;
                if let Some(collection) = checkpoint.collection.clone() {
                    let action = match checkpoint.step {
                        CheckpointStep::Erasure => ActionType::Erasure,
                        _ => ActionType::Access,
                    };
                    request.log_execution(
                        collection,
                        action,
                        ExecutionLogStatus::Error,
                        Some(reason.clone()),
                    );
                }
                request.update_status(RequestStatus::Error, "system");
                warn!(request_id = %id, step = %checkpoint.step, reason = %reason, "execution failed");
                self.store.set_failed_checkpoint(id, &checkpoint).await?;
            }
            StepOutcome::Completed => {
                let request = fetch_live(&mut self.requests, id)?;
                request.finished_processing_at = Some(Utc::now());
                request.update_status(RequestStatus::Complete, "system");
                self.handles.remove(id);
                self.store.clear_paused_checkpoint(id).await?;
                self.store.clear_failed_checkpoint(id).await?;
                self.store.delete_part(id, "async_execution").await?;
                if let Err(e) = self
                    .messenger
                    .dispatch(id, Notification::RequestComplete)
                    .await
                {
                    warn!(request_id = %id, error = %e, "failed to send completion notification");
                }
            }
        }
        Ok(())
    }

    /// Reads a request in either the flat or the verbose shape.
    pub async fn read(
        &self,
        id: &RequestId,
        verbose: bool,
    ) -> Result<RequestReadout, RequestError> {
        let request = self
            .requests
            .get(id)
            .ok_or_else(|| RequestError::NotFound(id.clone()))?;
        if !verbose {
            return Ok(RequestReadout::Summary(RequestSummary::from(request)));
        }

        let paused = self.store.get_paused_checkpoint(id).await?;
        let failed = self.store.get_failed_checkpoint(id).await?;
        let resume = derive_resume_instructions(request.status, paused.as_ref(), failed.as_ref());
        Ok(RequestReadout::Verbose(Box::new(VerboseReadout {
            summary: RequestSummary::from(request),
            execution_log: request.execution_log.clone(),
            audit_log: request.audit_log.clone(),
            tasks: request.tasks.clone(),
            resume,
        })))
    }

    // --- bulk operations ---

    /// Bulk approve. Per-item failures never fail the batch.
    pub async fn bulk_approve(
        &mut self,
        selection: BulkSelection,
        reviewer: &str,
    ) -> Result<BulkResult, RequestError> {
        let ids = self.resolve_selection(selection)?;
        let mut result = BulkResult {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for chunk in chunks(&ids, self.config.bulk_batch_size) {
            for id in chunk {
                match self.approve_internal(id, reviewer).await {
                    Ok(summary) => result.succeeded.push(summary),
                    Err(e) => result.failed.push(BulkFailure {
                        message: e.to_string(),
                        data: id.clone(),
                    }),
                }
            }
        }
        Ok(result)
    }

    /// Bulk deny.
    pub async fn bulk_deny(
        &mut self,
        selection: BulkSelection,
        reviewer: &str,
        reason: Option<String>,
    ) -> Result<BulkResult, RequestError> {
        let ids = self.resolve_selection(selection)?;
        let mut result = BulkResult {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for chunk in chunks(&ids, self.config.bulk_batch_size) {
            for id in chunk {
                match self.deny(id, reviewer, reason.clone()).await {
                    Ok(summary) => result.succeeded.push(summary),
                    Err(e) => result.failed.push(BulkFailure {
                        message: e.to_string(),
                        data: id.clone(),
                    }),
                }
            }
        }
        Ok(result)
    }

    /// Bulk restart-from-failure.
    pub async fn bulk_restart_from_failure(
        &mut self,
        selection: BulkSelection,
    ) -> Result<BulkResult, RequestError> {
        let ids = self.resolve_selection(selection)?;
        let mut result = BulkResult {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for chunk in chunks(&ids, self.config.bulk_batch_size) {
            for id in chunk {
                match self.restart_from_failure(id).await {
                    Ok(_) => {
                        if let Some(request) = self.requests.get(id) {
                            result.succeeded.push(RequestSummary::from(request));
                        }
                    }
                    Err(e) => result.failed.push(BulkFailure {
                        message: e.to_string(),
                        data: id.clone(),
                    }),
                }
            }
        }
        Ok(result)
    }

    /// Bulk soft delete.
    pub async fn bulk_soft_delete(
        &mut self,
        selection: BulkSelection,
        deleted_by: Option<&str>,
    ) -> Result<BulkResult, RequestError> {
        let ids = self.resolve_selection(selection)?;
        let mut result = BulkResult {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for chunk in chunks(&ids, self.config.bulk_batch_size) {
            for id in chunk {
                match self.soft_delete(id, deleted_by).await {
                    Ok(()) => {
                        if let Some(request) = self.requests.get(id) {
                            result.succeeded.push(RequestSummary::from(request));
                        }
                    }
                    Err(e) => result.failed.push(BulkFailure {
                        message: e.to_string(),
                        data: id.clone(),
                    }),
                }
            }
        }
        Ok(result)
    }

    fn resolve_selection(&self, selection: BulkSelection) -> Result<Vec<RequestId>, RequestError> {
        match selection {
            BulkSelection::Ids(ids) => {
                if ids.is_empty() {
                    return Err(RequestError::EmptySelection);
                }
                Ok(ids)
            }
            BulkSelection::Filter { status, exclude } => Ok(self
                .requests
                .values()
                .filter(|request| status.map_or(true, |s| request.status == s))
                .filter(|request| !exclude.contains(&request.id))
                .map(|request| request.id.clone())
                .collect()),
        }
    }

    /// Builds the execution task graph from the planner's traversal and
    /// hands the request to the runner.
    async fn queue_for_execution(
        &mut self,
        id: &RequestId,
        enqueue: EnqueueRequest,
    ) -> Result<(), RequestError> {
        let fresh_run = enqueue.from_step.is_none() && enqueue.from_webhook.is_none();
        if fresh_run {
            let identity = self.store.get_identity(id).await?;
            let nodes = self.planner.plan(&self.config.datasets, &identity).await?;
            let request = fetch_live(&mut self.requests, id)?;
            let actions = request.actions.clone();
            if request.tasks.is_empty() {
                request.tasks = nodes
                    .iter()
                    .flat_map(|node| {
                        actions.iter().filter(|a| **a != ActionType::Consent).map(
                            |action| {
                                RequestTask::new(
                                    id.clone(),
                                    *action,
                                    node.address.clone(),
                                    node.upstream.clone(),
                                    node.downstream.clone(),
                                )
                            },
                        )
                    })
                    .collect();
            }
            if request.started_processing_at.is_none() {
                request.started_processing_at = Some(Utc::now());
            }
            if request.status != RequestStatus::InProcessing {
                request.update_status(RequestStatus::InProcessing, "system");
            }
        }

        let handle = self.queue.enqueue(enqueue).await?;
        self.store.set_async_execution_id(id, &handle.to_string()).await?;
        self.handles.entry(id.clone()).or_default().push(handle);
        debug!(request_id = %id, "execution enqueued");
        Ok(())
    }
}

fn chunks<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

fn generate_verification_code() -> String {
    // Six digits derived from a fresh UUID's entropy.
    let bytes = Uuid::new_v4().into_bytes();
    let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 1_000_000;
    format!("{:06}", n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MockCache, StoreConfig};
    use crate::request::CollectionAddress;
    use crate::testing::{RecordingMessenger, RecordingQueue, StaticPlanner, StaticRegistry};
    use crate::webhook::{ManualWebhook, ManualWebhookField, PreApprovalWebhook};
    use serde_json::json;

    struct Harness {
        engine: RequestEngine<MockCache>,
        queue: Arc<RecordingQueue>,
        messenger: Arc<RecordingMessenger>,
        registry: Arc<StaticRegistry>,
    }

    fn create_harness(config: EngineConfig) -> Harness {
        let queue = Arc::new(RecordingQueue::new());
        let messenger = Arc::new(RecordingMessenger::new());
        let registry = Arc::new(StaticRegistry::new());
        let planner = Arc::new(StaticPlanner::single(CollectionAddress::new(
            "postgres_db",
            "users",
        )));
        let store = RequestCache::new(Arc::new(MockCache::new()), StoreConfig::default());
        let engine = RequestEngine::new(
            store,
            queue.clone(),
            messenger.clone(),
            registry.clone(),
            planner,
            config,
        );
        Harness {
            engine,
            queue,
            messenger,
            registry,
        }
    }

    fn subject_identity() -> HashMap<String, Value> {
        HashMap::from([("email".to_string(), json!("subject@example.com"))])
    }

    async fn create_pending_request(h: &mut Harness) -> RequestId {
        let id = h
            .engine
            .create_request(
                "default_access_policy",
                RequestSource::Authenticated,
                vec![ActionType::Access],
                subject_identity(),
            )
            .await
            .unwrap();
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::Pending
        );
        id
    }

    #[tokio::test]
    async fn test_user_submitted_request_starts_unverified_with_code_sent() {
        let mut h = create_harness(EngineConfig::default());
        let id = h
            .engine
            .create_request(
                "default_access_policy",
                RequestSource::UserSubmitted,
                vec![ActionType::Access],
                subject_identity(),
            )
            .await
            .unwrap();

        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::IdentityUnverified
        );
        let sent = h.messenger.sent_for(&id);
        assert!(matches!(
            sent[0],
            Notification::IdentityVerificationCode { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_code_dispatch_fails_creation() {
        let mut h = create_harness(EngineConfig::default());
        h.messenger.fail_dispatches();

        let result = h
            .engine
            .create_request(
                "default_access_policy",
                RequestSource::UserSubmitted,
                vec![ActionType::Access],
                subject_identity(),
            )
            .await;
        assert!(matches!(result, Err(RequestError::Messaging(_))));
    }

    #[tokio::test]
    async fn test_verify_identity_with_correct_code() {
        let mut h = create_harness(EngineConfig::default());
        let id = h
            .engine
            .create_request(
                "default_access_policy",
                RequestSource::UserSubmitted,
                vec![ActionType::Access],
                subject_identity(),
            )
            .await
            .unwrap();
        let code = match &h.messenger.sent_for(&id)[0] {
            Notification::IdentityVerificationCode { code } => code.clone(),
            other => panic!("unexpected notification: {:?}", other),
        };

        h.engine.verify_identity(&id, &code).await.unwrap();

        let request = h.engine.request(&id).unwrap();
        assert!(request.identity_verified);
        // Manual approval required, so verification leaves it pending.
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(h
            .messenger
            .sent_for(&id)
            .contains(&Notification::Receipt));
    }

    #[tokio::test]
    async fn test_verify_identity_attempt_limit() {
        let mut h = create_harness(EngineConfig {
            max_verification_attempts: 2,
            ..EngineConfig::default()
        });
        let id = h
            .engine
            .create_request(
                "default_access_policy",
                RequestSource::UserSubmitted,
                vec![ActionType::Access],
                subject_identity(),
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let err = h.engine.verify_identity(&id, "000000").await.unwrap_err();
            assert!(matches!(err, RequestError::IdentityVerification { .. }));
        }
        let err = h.engine.verify_identity(&id, "000000").await.unwrap_err();
        assert!(matches!(
            err,
            RequestError::TooManyVerificationAttempts { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_approve_requires_pending_and_quotes_actual_status() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;

        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::InProcessing
        );
        assert_eq!(
            h.queue.last_enqueued().unwrap(),
            EnqueueRequest::fresh(id.clone())
        );
        // Task graph built from the planner's traversal.
        assert_eq!(h.engine.request(&id).unwrap().tasks.len(), 1);

        let err = h
            .engine
            .approve(&id, "reviewer@example.com")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("in_processing"));
    }

    #[tokio::test]
    async fn test_auto_approval_when_manual_approval_not_required() {
        let mut h = create_harness(EngineConfig {
            require_manual_approval: false,
            ..EngineConfig::default()
        });
        let id = h
            .engine
            .create_request(
                "default_access_policy",
                RequestSource::Authenticated,
                vec![ActionType::Access],
                subject_identity(),
            )
            .await
            .unwrap();

        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::InProcessing
        );
        assert!(h.queue.last_enqueued().is_some());
    }

    #[tokio::test]
    async fn test_deny_stamps_reviewer_and_reason() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;

        h.engine
            .deny(&id, "reviewer@example.com", Some("out of scope".to_string()))
            .await
            .unwrap();

        let request = h.engine.request(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Denied);
        assert_eq!(request.reviewed_by.as_deref(), Some("reviewer@example.com"));
        assert!(h
            .messenger
            .sent_for(&id)
            .iter()
            .any(|n| matches!(n, Notification::RequestDenied { .. })));
    }

    #[tokio::test]
    async fn test_cancel_revokes_tasks_best_effort() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();

        // A failing revoke must not block the cancellation itself.
        h.queue.fail_revocations();
        h.engine
            .cancel(&id, "operator", Some("subject withdrew".to_string()))
            .await
            .unwrap();
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::Canceled
        );

        let err = h.engine.cancel(&id, "operator", None).await.unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }

    #[tokio::test]
    async fn test_status_gated_transitions_leave_state_unchanged() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;

        let err = h.engine.resume_from_requires_input(&id).await.unwrap_err();
        assert!(err.to_string().contains("pending"));
        let err = h.engine.finalize(&id, "operator").await.unwrap_err();
        assert!(err.to_string().contains("pending"));
        let err = h
            .engine
            .resume_from_webhook(&id, "pre_check", HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pending"));

        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_resume_from_webhook_caches_identity_and_enqueues() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        h.engine
            .record_step_outcome(
                &id,
                StepOutcome::Paused(CheckpointActionRequired::at_step(
                    CheckpointStep::PreWebhooks,
                )),
            )
            .await
            .unwrap();

        h.engine
            .resume_from_webhook(
                &id,
                "pre_check",
                HashMap::from([("user_id".to_string(), json!(42))]),
            )
            .await
            .unwrap();

        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::InProcessing
        );
        let enqueued = h.queue.last_enqueued().unwrap();
        assert_eq!(enqueued.from_webhook.as_deref(), Some("pre_check"));
        assert_eq!(enqueued.proceed, Some(true));
    }

    #[tokio::test]
    async fn test_resume_from_requires_input_validates_live_webhooks() {
        let mut h = create_harness(EngineConfig::default());
        h.registry.add_manual_webhook(ManualWebhook {
            connection_key: "manual_crm".to_string(),
            enabled: true,
            actions: vec![ActionType::Access],
            fields: vec![ManualWebhookField::new("plan", "Subscription plan")],
        });
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        h.engine
            .record_step_outcome(&id, StepOutcome::AwaitingInput)
            .await
            .unwrap();

        // No cached answer yet: rejected naming the webhook.
        let err = h.engine.resume_from_requires_input(&id).await.unwrap_err();
        assert!(err.to_string().contains("manual_crm"));

        h.engine
            .store
            .set_manual_webhook_input(
                &id,
                "manual_crm",
                ActionType::Access,
                &HashMap::from([("plan".to_string(), json!("premium"))]),
            )
            .await
            .unwrap();
        h.engine.resume_from_requires_input(&id).await.unwrap();
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::InProcessing
        );
    }

    #[tokio::test]
    async fn test_restart_from_failure_uses_cached_checkpoint() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        h.engine
            .record_step_outcome(
                &id,
                StepOutcome::Failed {
                    checkpoint: CheckpointActionRequired::at_step(CheckpointStep::Erasure),
                    reason: "connector timeout".to_string(),
                },
            )
            .await
            .unwrap();

        let outcome = h.engine.restart_from_failure(&id).await.unwrap();
        assert_eq!(
            outcome,
            RestartOutcome::Retried {
                from_step: Some(CheckpointStep::Erasure)
            }
        );
        assert_eq!(
            h.queue.last_enqueued().unwrap().from_step,
            Some(CheckpointStep::Erasure)
        );
        assert_eq!(
            h.engine.store.get_retry_count(&id).await.unwrap(),
            1
        );
        // Checkpoint cleared once re-enqueued.
        assert_eq!(
            h.engine.store.get_failed_checkpoint(&id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_restart_with_expired_identity_resubmits() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        h.engine
            .record_step_outcome(
                &id,
                StepOutcome::Failed {
                    checkpoint: CheckpointActionRequired::at_step(CheckpointStep::Access),
                    reason: "connector timeout".to_string(),
                },
            )
            .await
            .unwrap();

        // Identity TTL elapses before the retry arrives.
        h.engine
            .store
            .backend()
            .expire_now(&format!("dsr:{}:identity:email", id))
            .await;

        let outcome = h.engine.restart_from_failure(&id).await.unwrap();
        assert_eq!(outcome, RestartOutcome::Resubmitted);
        let request = h.engine.request(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.tasks.is_empty());
        assert!(request
            .audit_log
            .iter()
            .any(|entry| entry.action == AuditAction::Resubmitted));
        assert!(h.engine.store.get_all_keys(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_requires_manual_finalization_status() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        h.engine
            .record_step_outcome(&id, StepOutcome::RequiresFinalization)
            .await
            .unwrap();

        h.engine.finalize(&id, "operator@example.com").await.unwrap();
        let request = h.engine.request(&id).unwrap();
        assert_eq!(request.finalized_by.as_deref(), Some("operator@example.com"));
        assert!(request.finalized_at.is_some());
        assert_eq!(
            h.queue.last_enqueued().unwrap().from_step,
            Some(CheckpointStep::Finalization)
        );
    }

    #[tokio::test]
    async fn test_task_callback_flow() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();

        let task_id = h.engine.request(&id).unwrap().tasks[0].id;
        let err = h
            .engine
            .handle_task_callback(&id, task_id, None, None)
            .await
            .unwrap_err();
        // Task is pending, not awaiting a callback.
        assert!(err.to_string().contains("pending"));

        h.engine
            .requests
            .get_mut(&id)
            .unwrap()
            .task_mut(task_id)
            .unwrap()
            .status = TaskStatus::AwaitingProcessing;
        h.engine
            .handle_task_callback(&id, task_id, Some(json!([{"row": 1}])), None)
            .await
            .unwrap();

        let task = h.engine.request(&id).unwrap().task(task_id).unwrap();
        assert!(task.callback_received);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(
            h.queue.last_enqueued().unwrap().from_step,
            Some(CheckpointStep::Access)
        );
    }

    #[tokio::test]
    async fn test_completion_clears_cache_and_notifies() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();

        h.engine
            .record_step_outcome(&id, StepOutcome::Completed)
            .await
            .unwrap();

        let request = h.engine.request(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Complete);
        assert!(request.finished_processing_at.is_some());
        assert!(h
            .messenger
            .sent_for(&id)
            .contains(&Notification::RequestComplete));
        assert_eq!(
            h.engine.store.get_async_execution_id(&id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_soft_delete_rejects_double_delete() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;

        h.engine.soft_delete(&id, None).await.unwrap();
        let request = h.engine.request(&id).unwrap();
        assert!(request.is_deleted());
        assert_eq!(request.deleted_by.as_deref(), Some("system"));

        let err = h.engine.soft_delete(&id, None).await.unwrap_err();
        assert!(matches!(err, RequestError::Deleted(_)));
    }

    #[tokio::test]
    async fn test_pre_approval_gate_requires_all_configured_webhooks() {
        let mut h = create_harness(EngineConfig::default());
        let first = PreApprovalWebhook::new("fraud_check");
        let second = PreApprovalWebhook::new("billing_check");
        h.registry.add_pre_approval_webhook(first.clone());
        h.registry.add_pre_approval_webhook(second.clone());
        let id = create_pending_request(&mut h).await;

        let approved = h
            .engine
            .record_pre_approval_reply(first.id, &id, true)
            .await
            .unwrap();
        assert!(!approved);
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::Pending
        );

        let approved = h
            .engine
            .record_pre_approval_reply(second.id, &id, true)
            .await
            .unwrap();
        assert!(approved);
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::InProcessing
        );
    }

    #[tokio::test]
    async fn test_pre_approval_gate_blocked_by_negative_reply() {
        let mut h = create_harness(EngineConfig::default());
        let first = PreApprovalWebhook::new("fraud_check");
        let second = PreApprovalWebhook::new("billing_check");
        h.registry.add_pre_approval_webhook(first.clone());
        h.registry.add_pre_approval_webhook(second.clone());
        let id = create_pending_request(&mut h).await;

        h.engine
            .record_pre_approval_reply(first.id, &id, false)
            .await
            .unwrap();
        let approved = h
            .engine
            .record_pre_approval_reply(second.id, &id, true)
            .await
            .unwrap();
        assert!(!approved);
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_deleted_webhook_reply_ignored_for_affirmativeness() {
        let mut h = create_harness(EngineConfig::default());
        let kept = PreApprovalWebhook::new("fraud_check");
        let removed = PreApprovalWebhook::new("billing_check");
        h.registry.add_pre_approval_webhook(kept.clone());
        h.registry.add_pre_approval_webhook(removed.clone());
        let id = create_pending_request(&mut h).await;

        h.engine
            .record_pre_approval_reply(removed.id, &id, false)
            .await
            .unwrap();
        h.registry.remove_pre_approval_webhook(removed.id);

        // The stale negative reply no longer blocks once its webhook is
        // gone.
        let approved = h
            .engine
            .record_pre_approval_reply(kept.id, &id, true)
            .await
            .unwrap();
        assert!(approved);
    }

    #[tokio::test]
    async fn test_auto_approval_condition_gates_the_webhook_consensus() {
        let condition: Condition = dsr_conditions::ConditionLeaf::new(
            "policy_id",
            dsr_conditions::Operator::Eq,
            json!("erasure_policy"),
        )
        .into();
        let mut h = create_harness(EngineConfig {
            auto_approval_condition: Some(condition),
            ..EngineConfig::default()
        });
        let webhook = PreApprovalWebhook::new("fraud_check");
        h.registry.add_pre_approval_webhook(webhook.clone());

        // Policy does not satisfy the condition: consensus alone is not
        // enough.
        let id = create_pending_request(&mut h).await;
        let approved = h
            .engine
            .record_pre_approval_reply(webhook.id, &id, true)
            .await
            .unwrap();
        assert!(!approved);
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::Pending
        );

        let id = h
            .engine
            .create_request(
                "erasure_policy",
                RequestSource::Authenticated,
                vec![ActionType::Erasure],
                subject_identity(),
            )
            .await
            .unwrap();
        let approved = h
            .engine
            .record_pre_approval_reply(webhook.id, &id, true)
            .await
            .unwrap();
        assert!(approved);
    }

    #[tokio::test]
    async fn test_bulk_partial_failure() {
        let mut h = create_harness(EngineConfig::default());
        let good_one = create_pending_request(&mut h).await;
        let good_two = create_pending_request(&mut h).await;
        let missing = RequestId::from("no-such-request");
        let denied = create_pending_request(&mut h).await;
        h.engine.deny(&denied, "reviewer@example.com", None).await.unwrap();

        let result = h
            .engine
            .bulk_approve(
                BulkSelection::Ids(vec![
                    good_one.clone(),
                    missing.clone(),
                    good_two.clone(),
                    denied.clone(),
                ]),
                "reviewer@example.com",
            )
            .await
            .unwrap();

        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.failed.len(), 2);
        assert!(result.failed.iter().any(|f| f.data == missing));
        assert!(result
            .failed
            .iter()
            .any(|f| f.data == denied && f.message.contains("denied")));
    }

    #[tokio::test]
    async fn test_bulk_empty_id_selection_is_hard_error() {
        let mut h = create_harness(EngineConfig::default());
        let result = h
            .engine
            .bulk_approve(BulkSelection::Ids(vec![]), "reviewer@example.com")
            .await;
        assert!(matches!(result, Err(RequestError::EmptySelection)));
    }

    #[tokio::test]
    async fn test_bulk_filter_selection_with_exclusions() {
        let mut h = create_harness(EngineConfig::default());
        let kept = create_pending_request(&mut h).await;
        let excluded = create_pending_request(&mut h).await;

        let result = h
            .engine
            .bulk_deny(
                BulkSelection::Filter {
                    status: Some(RequestStatus::Pending),
                    exclude: vec![excluded.clone()],
                },
                "reviewer@example.com",
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].id, kept);
        assert_eq!(
            h.engine.request(&excluded).unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_requeue_recovers_stuck_request() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        h.engine
            .record_step_outcome(
                &id,
                StepOutcome::Paused(CheckpointActionRequired {
                    step: CheckpointStep::Erasure,
                    collection: Some(CollectionAddress::new("manual_db", "subscriptions")),
                    action_needed: None,
                }),
            )
            .await
            .unwrap();

        h.engine.requeue(&id, "operator").await.unwrap();
        assert_eq!(
            h.engine.request(&id).unwrap().status,
            RequestStatus::InProcessing
        );
        assert_eq!(
            h.queue.last_enqueued().unwrap().from_step,
            Some(CheckpointStep::Erasure)
        );

        let pending = create_pending_request(&mut h).await;
        let err = h.engine.requeue(&pending, "operator").await.unwrap_err();
        assert!(err.to_string().contains("pending"));
    }

    #[tokio::test]
    async fn test_verbose_read_includes_resume_instructions() {
        let mut h = create_harness(EngineConfig::default());
        let id = create_pending_request(&mut h).await;
        h.engine.approve(&id, "reviewer@example.com").await.unwrap();
        h.engine
            .record_step_outcome(
                &id,
                StepOutcome::Failed {
                    checkpoint: CheckpointActionRequired::at_step(CheckpointStep::Access),
                    reason: "connector timeout".to_string(),
                },
            )
            .await
            .unwrap();

        match h.engine.read(&id, false).await.unwrap() {
            RequestReadout::Summary(summary) => {
                assert_eq!(summary.status, RequestStatus::Error);
            }
            other => panic!("expected summary readout, got {:?}", other),
        }

        match h.engine.read(&id, true).await.unwrap() {
            RequestReadout::Verbose(verbose) => {
                let resume = verbose.resume.unwrap();
                assert_eq!(
                    resume.target,
                    crate::resume::ResumeTarget::RetryFromFailure
                );
                assert_eq!(resume.step, Some(CheckpointStep::Access));
                assert!(!verbose.audit_log.is_empty());
            }
            other => panic!("expected verbose readout, got {:?}", other),
        }
    }
}
