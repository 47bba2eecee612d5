//! Privacy request data models.
//!
//! This module defines the aggregate root of the system — [`PrivacyRequest`]
//! — together with its status lifecycle, audit and execution logs, and the
//! per-collection [`RequestTask`] execution units.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, externally referenced identifier of a privacy request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Status of a privacy request in its lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Submitted, awaiting review or automatic approval.
    Pending,
    /// Awaiting the subject's identity verification code.
    IdentityUnverified,
    /// Blocked on missing manual webhook answers.
    RequiresInput,
    /// Approved for execution, not yet picked up.
    Approved,
    /// Denied by a reviewer.
    Denied,
    /// Execution in progress.
    InProcessing,
    /// Execution finished, awaiting a human finalization step.
    RequiresManualFinalization,
    /// Blocked on a pre-processing webhook or a manual collection step.
    Paused,
    /// Fully processed.
    Complete,
    /// Execution failed at a checkpoint.
    Error,
    /// Canceled before completion.
    Canceled,
}

impl RequestStatus {
    /// Whether a request in this status may still be canceled.
    pub fn can_cancel(&self) -> bool {
        !matches!(
            self,
            RequestStatus::Complete | RequestStatus::Denied | RequestStatus::Canceled
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::IdentityUnverified => "identity_unverified",
            RequestStatus::RequiresInput => "requires_input",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
            RequestStatus::InProcessing => "in_processing",
            RequestStatus::RequiresManualFinalization => "requires_manual_finalization",
            RequestStatus::Paused => "paused",
            RequestStatus::Complete => "complete",
            RequestStatus::Error => "error",
            RequestStatus::Canceled => "canceled",
        };
        write!(f, "{}", name)
    }
}

/// How a request entered the system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    /// Submitted by the data subject through the public intake surface.
    UserSubmitted,
    /// Created by an authenticated operator; identity verification is bypassed.
    Authenticated,
    /// Synthetic request used to exercise a dataset configuration.
    DatasetTest,
}

/// The kind of data subject right a request exercises.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Access,
    Erasure,
    Consent,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Access => write!(f, "access"),
            ActionType::Erasure => write!(f, "erasure"),
            ActionType::Consent => write!(f, "consent"),
        }
    }
}

/// Composite address of one collection within one dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CollectionAddress {
    pub dataset: String,
    pub collection: String,
}

impl CollectionAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }
}

impl std::fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dataset, self.collection)
    }
}

/// Status of one execution log event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogStatus {
    InProcessing,
    Complete,
    Error,
    Paused,
    AwaitingProcessing,
    Retrying,
    Skipped,
}

/// Append-only record of one dataset/collection processing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    /// Collection the event concerns.
    pub collection: CollectionAddress,
    /// Action being executed against the collection.
    pub action_type: ActionType,
    /// Outcome of the event.
    pub status: ExecutionLogStatus,
    /// Free-form detail (error text, row counts).
    pub message: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

/// Whole-request-level events recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RequestCreated,
    StatusChanged(RequestStatus),
    IdentityVerified,
    Approved,
    Denied { reason: Option<String> },
    Canceled { reason: Option<String> },
    Finalized,
    Resubmitted,
    Requeued,
    SoftDeleted,
}

/// Append-only audit entry for a privacy request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique identifier for this entry.
    pub id: Uuid,
    /// What happened.
    pub action: AuditAction,
    /// Who did it (operator identity or `"system"`).
    pub actor: String,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, actor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor: actor.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Execution status of a single [`RequestTask`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to run once upstream tasks complete.
    Pending,
    /// Currently running.
    InProcessing,
    /// Paused for an asynchronous external callback.
    AwaitingProcessing,
    Complete,
    Error,
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProcessing => "in_processing",
            TaskStatus::AwaitingProcessing => "awaiting_processing",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

/// One unit of execution work scoped to a single dataset collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTask {
    /// Unique identifier for this task.
    pub id: Uuid,
    /// Owning privacy request.
    pub request_id: RequestId,
    /// Action this task performs on its collection.
    pub action_type: ActionType,
    /// Current task status.
    pub status: TaskStatus,
    /// Collection this task touches.
    pub collection_address: CollectionAddress,
    /// Collections whose tasks must complete before this one runs.
    pub upstream_tasks: Vec<CollectionAddress>,
    /// Collections whose tasks depend on this one.
    pub downstream_tasks: Vec<CollectionAddress>,
    /// Rows returned by an access task, attached when work completes.
    pub access_data: Option<serde_json::Value>,
    /// Rows masked by an erasure task.
    pub rows_masked: Option<u64>,
    /// Whether an asynchronous callback has been received for this task.
    pub callback_received: bool,
}

impl RequestTask {
    /// Creates a pending task for one collection node.
    pub fn new(
        request_id: RequestId,
        action_type: ActionType,
        collection_address: CollectionAddress,
        upstream_tasks: Vec<CollectionAddress>,
        downstream_tasks: Vec<CollectionAddress>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            action_type,
            status: TaskStatus::Pending,
            collection_address,
            upstream_tasks,
            downstream_tasks,
            access_data: None,
            rows_masked: None,
            callback_received: false,
        }
    }
}

/// The aggregate root: one data subject's privacy request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyRequest {
    /// Stable, externally referenced id.
    pub id: RequestId,
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// How the request entered the system.
    pub source: RequestSource,
    /// Policy governing which actions and rules apply.
    pub policy_id: String,
    /// Actions the policy requires for this request.
    pub actions: Vec<ActionType>,
    /// Whether the subject's identity has been verified.
    pub identity_verified: bool,
    pub requested_at: DateTime<Utc>,
    pub started_processing_at: Option<DateTime<Utc>>,
    pub finished_processing_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    /// Deadline derived from the configured response window.
    pub due_date: DateTime<Utc>,
    /// Per-collection processing events, append-only.
    pub execution_log: Vec<ExecutionLog>,
    /// Whole-request audit trail, append-only.
    pub audit_log: Vec<AuditEntry>,
    /// Execution units, one per collection node in the traversal graph.
    pub tasks: Vec<RequestTask>,
}

impl PrivacyRequest {
    /// Creates a new request in the given initial status.
    pub fn new(
        policy_id: impl Into<String>,
        source: RequestSource,
        actions: Vec<ActionType>,
        initial_status: RequestStatus,
        due_in_days: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::generate(),
            status: initial_status,
            source,
            policy_id: policy_id.into(),
            actions,
            identity_verified: false,
            requested_at: now,
            started_processing_at: None,
            finished_processing_at: None,
            reviewed_at: None,
            reviewed_by: None,
            finalized_at: None,
            finalized_by: None,
            deleted_at: None,
            deleted_by: None,
            due_date: now + Duration::days(due_in_days),
            execution_log: Vec::new(),
            audit_log: vec![AuditEntry::new(AuditAction::RequestCreated, "system")],
            tasks: Vec::new(),
        }
    }

    /// Whether the request has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Updates the status, recording the change in the audit trail.
    pub fn update_status(&mut self, status: RequestStatus, actor: &str) {
        self.status = status;
        self.audit_log
            .push(AuditEntry::new(AuditAction::StatusChanged(status), actor));
    }

    /// Appends an audit entry without changing status.
    pub fn audit(&mut self, action: AuditAction, actor: &str) {
        self.audit_log.push(AuditEntry::new(action, actor));
    }

    /// Appends a per-collection execution event.
    pub fn log_execution(
        &mut self,
        collection: CollectionAddress,
        action_type: ActionType,
        status: ExecutionLogStatus,
        message: Option<String>,
    ) {
        self.execution_log.push(ExecutionLog {
            collection,
            action_type,
            status,
            message,
            created_at: Utc::now(),
        });
    }

    /// Finds a task by id.
    pub fn task(&self, task_id: Uuid) -> Option<&RequestTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Finds a task by id, mutably.
    pub fn task_mut(&mut self, task_id: Uuid) -> Option<&mut RequestTask> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_request() -> PrivacyRequest {
        PrivacyRequest::new(
            "default_access_policy",
            RequestSource::UserSubmitted,
            vec![ActionType::Access],
            RequestStatus::Pending,
            45,
        )
    }

    #[test]
    fn test_new_request_starts_with_creation_audit_entry() {
        let request = create_test_request();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.audit_log.len(), 1);
        assert_eq!(request.audit_log[0].action, AuditAction::RequestCreated);
        assert!(!request.is_deleted());
        assert!(request.due_date > request.requested_at);
    }

    #[test]
    fn test_update_status_appends_audit_entry() {
        let mut request = create_test_request();
        request.update_status(RequestStatus::Approved, "reviewer@example.com");

        assert_eq!(request.status, RequestStatus::Approved);
        let last = request.audit_log.last().unwrap();
        assert_eq!(
            last.action,
            AuditAction::StatusChanged(RequestStatus::Approved)
        );
        assert_eq!(last.actor, "reviewer@example.com");
    }

    #[test]
    fn test_cancelable_statuses() {
        assert!(RequestStatus::Pending.can_cancel());
        assert!(RequestStatus::Paused.can_cancel());
        assert!(RequestStatus::Error.can_cancel());
        assert!(!RequestStatus::Complete.can_cancel());
        assert!(!RequestStatus::Denied.can_cancel());
        assert!(!RequestStatus::Canceled.can_cancel());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RequestStatus::RequiresManualFinalization).unwrap();
        assert_eq!(json, "\"requires_manual_finalization\"");
        let json = serde_json::to_string(&RequestStatus::RequiresInput).unwrap();
        assert_eq!(json, "\"requires_input\"");
    }

    #[test]
    fn test_task_lookup_by_id() {
        let mut request = create_test_request();
        let task = RequestTask::new(
            request.id.clone(),
            ActionType::Access,
            CollectionAddress::new("postgres_db", "users"),
            vec![],
            vec![CollectionAddress::new("postgres_db", "orders")],
        );
        let task_id = task.id;
        request.tasks.push(task);

        assert!(request.task(task_id).is_some());
        assert_eq!(
            request.task(task_id).unwrap().collection_address.to_string(),
            "postgres_db:users"
        );
        assert!(request.task(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_execution_log_append() {
        let mut request = create_test_request();
        request.log_execution(
            CollectionAddress::new("postgres_db", "users"),
            ActionType::Access,
            ExecutionLogStatus::Complete,
            Some("3 rows".to_string()),
        );
        assert_eq!(request.execution_log.len(), 1);
        assert_eq!(
            request.execution_log[0].status,
            ExecutionLogStatus::Complete
        );
    }
}
