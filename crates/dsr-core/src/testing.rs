//! In-memory collaborator fakes for tests.
//!
//! Each fake records the calls it receives so tests can assert on the
//! engine's side effects without a real queue, mailer, or graph planner.

use crate::collaborators::{
    CollectionNode, EnqueueRequest, Messenger, MessagingError, Notification, QueryPlanner,
    QueueError, TaskHandle, TaskQueue, TraversalError,
};
use crate::request::{ActionType, CollectionAddress, RequestId};
use crate::webhook::{ManualWebhook, PreApprovalWebhook, WebhookRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// A [`TaskQueue`] that records enqueues and revocations.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    enqueued: Mutex<Vec<EnqueueRequest>>,
    revoked: Mutex<Vec<TaskHandle>>,
    fail_revoke: Mutex<bool>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `revoke` calls fail, for exercising best-effort
    /// cancellation.
    pub fn fail_revocations(&self) {
        *self.fail_revoke.lock().unwrap() = true;
    }

    /// Everything enqueued so far, in order.
    pub fn enqueued(&self) -> Vec<EnqueueRequest> {
        self.enqueued.lock().unwrap().clone()
    }

    /// The most recent enqueue, if any.
    pub fn last_enqueued(&self) -> Option<EnqueueRequest> {
        self.enqueued.lock().unwrap().last().cloned()
    }

    /// Handles revoked so far.
    pub fn revoked(&self) -> Vec<TaskHandle> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskHandle, QueueError> {
        self.enqueued.lock().unwrap().push(request);
        Ok(TaskHandle::generate())
    }

    async fn revoke(&self, handle: &TaskHandle) -> Result<(), QueueError> {
        if *self.fail_revoke.lock().unwrap() {
            return Err(QueueError::Revoke {
                handle: handle.clone(),
                reason: "worker unreachable".to_string(),
            });
        }
        self.revoked.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

/// A [`Messenger`] that records notifications instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(RequestId, Notification)>>,
    fail_dispatch: Mutex<bool>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent dispatches fail.
    pub fn fail_dispatches(&self) {
        *self.fail_dispatch.lock().unwrap() = true;
    }

    /// All notifications dispatched so far.
    pub fn sent(&self) -> Vec<(RequestId, Notification)> {
        self.sent.lock().unwrap().clone()
    }

    /// Notifications dispatched for one request.
    pub fn sent_for(&self, id: &RequestId) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(request_id, _)| request_id == id)
            .map(|(_, notification)| notification.clone())
            .collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn dispatch(
        &self,
        request_id: &RequestId,
        notification: Notification,
    ) -> Result<(), MessagingError> {
        if *self.fail_dispatch.lock().unwrap() {
            return Err(MessagingError {
                request_id: request_id.clone(),
                template: format!("{:?}", notification),
                reason: "smtp unreachable".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((request_id.clone(), notification));
        Ok(())
    }
}

/// A [`WebhookRegistry`] over mutable in-memory lists, so tests can add or
/// remove webhooks mid-scenario.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    manual: Mutex<Vec<ManualWebhook>>,
    pre_approval: Mutex<Vec<PreApprovalWebhook>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_manual_webhook(&self, webhook: ManualWebhook) {
        self.manual.lock().unwrap().push(webhook);
    }

    pub fn add_pre_approval_webhook(&self, webhook: PreApprovalWebhook) {
        self.pre_approval.lock().unwrap().push(webhook);
    }

    pub fn remove_pre_approval_webhook(&self, id: uuid::Uuid) {
        self.pre_approval.lock().unwrap().retain(|w| w.id != id);
    }
}

#[async_trait]
impl WebhookRegistry for StaticRegistry {
    async fn enabled_manual_webhooks(&self, action: ActionType) -> Vec<ManualWebhook> {
        self.manual
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.enabled && w.applies_to(action))
            .cloned()
            .collect()
    }

    async fn pre_approval_webhooks(&self) -> Vec<PreApprovalWebhook> {
        self.pre_approval.lock().unwrap().clone()
    }
}

/// A [`QueryPlanner`] returning a fixed traversal.
#[derive(Debug, Default)]
pub struct StaticPlanner {
    nodes: Vec<CollectionNode>,
}

impl StaticPlanner {
    pub fn new(nodes: Vec<CollectionNode>) -> Self {
        Self { nodes }
    }

    /// A planner with a single root collection node.
    pub fn single(address: CollectionAddress) -> Self {
        Self::new(vec![CollectionNode {
            address,
            upstream: vec![],
            downstream: vec![],
        }])
    }
}

#[async_trait]
impl QueryPlanner for StaticPlanner {
    async fn plan(
        &self,
        _datasets: &[String],
        _identity: &HashMap<String, Value>,
    ) -> Result<Vec<CollectionNode>, TraversalError> {
        Ok(self.nodes.clone())
    }
}
