//! Execution pipeline checkpoints.
//!
//! Pipeline steps form a strict total order. Resuming "from" a checkpoint
//! re-executes that checkpoint and everything after it, never anything
//! strictly earlier.

use crate::request::CollectionAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named position in the execution pipeline.
///
/// Derive order matches pipeline order: `PreWebhooks < Access < Erasure <
/// EmailPostSend < Finalization`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStep {
    /// Pre-processing webhooks run before any data-source work.
    PreWebhooks,
    /// Access (data retrieval) phase.
    Access,
    /// Erasure (masking) phase.
    Erasure,
    /// Post-send email steps (erasure confirmation emails to third parties).
    EmailPostSend,
    /// Final report packaging and completion.
    Finalization,
}

impl std::fmt::Display for CheckpointStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CheckpointStep::PreWebhooks => "pre_webhooks",
            CheckpointStep::Access => "access",
            CheckpointStep::Erasure => "erasure",
            CheckpointStep::EmailPostSend => "email_post_send",
            CheckpointStep::Finalization => "finalization",
        };
        write!(f, "{}", name)
    }
}

/// Whether `step` may run when resuming from `from_checkpoint`.
///
/// With no checkpoint given every step is runnable (fresh run). Otherwise a
/// step runs iff its ordinal is at or after the resume point.
pub fn can_run_checkpoint(step: CheckpointStep, from_checkpoint: Option<CheckpointStep>) -> bool {
    match from_checkpoint {
        None => true,
        Some(from) => step >= from,
    }
}

/// Structured instructions for a manual action an operator must perform
/// against a collection that cannot be queried automatically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualAction {
    /// Identifier values used to locate the record (e.g. email → address).
    pub locators: HashMap<String, serde_json::Value>,
    /// Fields to fetch for an access action.
    pub get: Option<Vec<String>>,
    /// Field values to update for an erasure action.
    pub update: Option<HashMap<String, serde_json::Value>>,
}

/// Cached record of where execution paused or failed and what is needed to
/// proceed. Derived data: written to the cache when execution halts, read by
/// the resume protocol, cleared once execution moves past the point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointActionRequired {
    /// Pipeline stage at which execution halted.
    pub step: CheckpointStep,
    /// Collection involved, when the halt is scoped to one.
    pub collection: Option<CollectionAddress>,
    /// Manual actions required before execution can proceed.
    pub action_needed: Option<Vec<ManualAction>>,
}

impl CheckpointActionRequired {
    /// A checkpoint with no collection or manual-action detail.
    pub fn at_step(step: CheckpointStep) -> Self {
        Self {
            step,
            collection: None,
            action_needed: None,
        }
    }
}
