//! Manual and pre-approval webhook models.
//!
//! Manual webhooks stand in for connections that cannot be queried
//! automatically: a human supplies the field values through an upload
//! endpoint, and the cached answers are validated against the webhook's
//! currently defined fields before execution may resume. Pre-approval
//! webhooks are external systems consulted while a request is pending, whose
//! unanimous affirmative replies auto-approve it.

use crate::request::{ActionType, RequestId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// One field a manual webhook expects an operator to supply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualWebhookField {
    /// Key the operator supplies the value under.
    pub pii_field: String,
    /// Human-readable label shown in the upload form.
    pub label: String,
}

impl ManualWebhookField {
    pub fn new(pii_field: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            pii_field: pii_field.into(),
            label: label.into(),
        }
    }
}

/// A manually fulfilled connection: data arrives from an operator, not a
/// query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualWebhook {
    /// Stable key of the connection configuration this webhook belongs to.
    pub connection_key: String,
    /// Disabled webhooks are skipped by the resume check.
    pub enabled: bool,
    /// Actions this webhook participates in.
    pub actions: Vec<ActionType>,
    /// Fields currently defined for the webhook.
    pub fields: Vec<ManualWebhookField>,
}

impl ManualWebhook {
    /// Whether this webhook supplies data for the given action.
    pub fn applies_to(&self, action: ActionType) -> bool {
        self.actions.contains(&action)
    }

    /// Validates cached input strictly: every defined field must be present
    /// and no unknown fields are tolerated.
    ///
    /// Used by the resume-from-`requires_input` check, where a partially
    /// answered webhook must block execution.
    pub fn validate_strict(&self, input: &HashMap<String, Value>) -> Result<(), InputValidationError> {
        for field in &self.fields {
            if !input.contains_key(&field.pii_field) {
                return Err(InputValidationError::MissingField {
                    connection_key: self.connection_key.clone(),
                    field: field.pii_field.clone(),
                });
            }
        }
        for key in input.keys() {
            if !self.fields.iter().any(|f| &f.pii_field == key) {
                return Err(InputValidationError::UnknownField {
                    connection_key: self.connection_key.clone(),
                    field: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Overlays cached input onto the current field definitions best-effort:
    /// missing fields coerce to null, unknown fields are dropped.
    ///
    /// Used when assembling a report from answers that may predate a field
    /// definition change.
    pub fn overlay_non_strict(&self, input: &HashMap<String, Value>) -> HashMap<String, Value> {
        self.fields
            .iter()
            .map(|field| {
                let value = input.get(&field.pii_field).cloned().unwrap_or(Value::Null);
                (field.pii_field.clone(), value)
            })
            .collect()
    }
}

/// Rejection of a manual webhook answer set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputValidationError {
    #[error("manual webhook '{connection_key}' is missing required field '{field}'")]
    MissingField {
        connection_key: String,
        field: String,
    },

    #[error("manual webhook '{connection_key}' received unknown field '{field}'")]
    UnknownField {
        connection_key: String,
        field: String,
    },
}

/// An external system consulted before a pending request is approved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreApprovalWebhook {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
}

impl PreApprovalWebhook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
        }
    }
}

/// One reply from a pre-approval webhook about one privacy request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreApprovalReply {
    pub webhook_id: Uuid,
    pub request_id: RequestId,
    /// Whether the external system judged the request eligible for
    /// automatic approval.
    pub eligible: bool,
    pub replied_at: DateTime<Utc>,
}

impl PreApprovalReply {
    pub fn new(webhook_id: Uuid, request_id: RequestId, eligible: bool) -> Self {
        Self {
            webhook_id,
            request_id,
            eligible,
            replied_at: Utc::now(),
        }
    }
}

/// Live view of configured webhooks.
///
/// The resume-from-`requires_input` check and the pre-approval gate must see
/// webhooks added or removed since the request was created, so callers fetch
/// from this registry at decision time rather than caching its answers.
#[async_trait]
pub trait WebhookRegistry: Send + Sync {
    /// All currently enabled manual webhooks that participate in the given
    /// action.
    async fn enabled_manual_webhooks(&self, action: ActionType) -> Vec<ManualWebhook>;

    /// All currently configured pre-approval webhooks, enabled or not.
    async fn pre_approval_webhooks(&self) -> Vec<PreApprovalWebhook>;
}
