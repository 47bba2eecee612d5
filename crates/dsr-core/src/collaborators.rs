//! External collaborator interfaces.
//!
//! The engine drives three side-effect collaborators it never blocks on: the
//! execution queue (fire-and-forget work dispatch), the messenger
//! (notifications to the data subject), and the query planner (dataset graph
//! traversal). Each is a trait so deployments wire in their own transport;
//! the engine only depends on the contracts here.

use crate::checkpoint::CheckpointStep;
use crate::request::{ActionType, CollectionAddress, RequestId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Parameters for one execution enqueue call.
///
/// This signature is contractual for interoperability with existing runner
/// deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnqueueRequest {
    /// Request the work belongs to.
    pub request_id: RequestId,
    /// Checkpoint to resume from. `None` means a fresh run.
    pub from_step: Option<CheckpointStep>,
    /// Pre-processing webhook to resume after, when unpausing a webhook
    /// halt.
    pub from_webhook: Option<String>,
    /// Whether the paused webhook signalled that processing should proceed.
    pub proceed: Option<bool>,
}

impl EnqueueRequest {
    /// A fresh run with no resume point.
    pub fn fresh(request_id: RequestId) -> Self {
        Self {
            request_id,
            from_step: None,
            from_webhook: None,
            proceed: None,
        }
    }

    /// A resume from the given checkpoint.
    pub fn from_step(request_id: RequestId, step: CheckpointStep) -> Self {
        Self {
            request_id,
            from_step: Some(step),
            from_webhook: None,
            proceed: None,
        }
    }

    /// A resume past a pre-processing webhook.
    pub fn from_webhook(request_id: RequestId, webhook_key: impl Into<String>) -> Self {
        Self {
            request_id,
            from_step: None,
            from_webhook: Some(webhook_key.into()),
            proceed: Some(true),
        }
    }
}

/// Opaque handle to one enqueued unit of work, used for best-effort
/// revocation on cancel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub Uuid);

impl TaskHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure dispatching or revoking execution work.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("failed to enqueue work for request {request_id}: {reason}")]
    Enqueue { request_id: RequestId, reason: String },

    #[error("failed to revoke task {handle}: {reason}")]
    Revoke { handle: TaskHandle, reason: String },
}

/// Fire-and-forget dispatch of execution work to the external runner.
///
/// The engine never awaits completion of the work itself, only the handoff.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hands one unit of work to the runner, returning a handle usable for
    /// revocation.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskHandle, QueueError>;

    /// Asks the runner to abandon an in-flight unit of work. Best-effort.
    async fn revoke(&self, handle: &TaskHandle) -> Result<(), QueueError>;
}

/// Notification templates sent to the data subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum Notification {
    /// Receipt confirming the request was received.
    Receipt,
    /// The subject's identity verification code.
    IdentityVerificationCode { code: String },
    /// A reviewer approved the request.
    RequestApproved,
    /// A reviewer denied the request.
    RequestDenied { reason: Option<String> },
    /// Processing finished and the result package is ready.
    RequestComplete,
}

/// Failure dispatching a notification.
#[derive(Error, Debug, Clone)]
#[error("failed to send {template} notification for request {request_id}: {reason}")]
pub struct MessagingError {
    pub request_id: RequestId,
    pub template: String,
    pub reason: String,
}

/// Fire-and-forget notification dispatch.
///
/// Failures are logged by the engine and never block the state transition
/// that triggered them, with one exception: a failed identity-verification
/// code dispatch fails request creation, since the subject cannot proceed
/// without the code.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn dispatch(
        &self,
        request_id: &RequestId,
        notification: Notification,
    ) -> Result<(), MessagingError>;
}

/// One collection node in a planned traversal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionNode {
    pub address: CollectionAddress,
    /// Collections that must be processed before this one.
    pub upstream: Vec<CollectionAddress>,
    /// Collections that depend on this one.
    pub downstream: Vec<CollectionAddress>,
}

/// The dataset graph could not be traversed.
#[derive(Error, Debug, Clone)]
pub enum TraversalError {
    #[error("dataset graph is disconnected: cannot reach {0}")]
    Unreachable(CollectionAddress),

    #[error("malformed dataset graph: {0}")]
    Malformed(String),
}

/// Turns dataset descriptions plus an identity seed into a traversal order
/// of collection nodes. Consumed opaquely; the traversal algorithm lives
/// outside this crate.
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn plan(
        &self,
        datasets: &[String],
        identity: &HashMap<String, Value>,
    ) -> Result<Vec<CollectionNode>, TraversalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_request_constructors() {
        let id = RequestId::from("req-1");

        let fresh = EnqueueRequest::fresh(id.clone());
        assert_eq!(fresh.from_step, None);
        assert_eq!(fresh.from_webhook, None);

        let stepped = EnqueueRequest::from_step(id.clone(), CheckpointStep::Access);
        assert_eq!(stepped.from_step, Some(CheckpointStep::Access));

        let webhook = EnqueueRequest::from_webhook(id, "pre_check");
        assert_eq!(webhook.from_webhook.as_deref(), Some("pre_check"));
        assert_eq!(webhook.proceed, Some(true));
    }

    #[test]
    fn test_notification_serializes_with_template_tag() {
        let json = serde_json::to_string(&Notification::IdentityVerificationCode {
            code: "123456".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"template\":\"identity_verification_code\""));
        assert!(json.contains("123456"));
    }
}
