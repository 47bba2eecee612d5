//! Resume and retry orchestration.
//!
//! Given a request's status and its cached checkpoints, there is exactly one
//! correct external action that can move it forward. [`derive_resume_instructions`]
//! computes that action; the verbose read path surfaces it so operators and
//! clients never have to guess which endpoint to call.
//!
//! Pausing is an expected, frequent outcome of execution, so the runner
//! reports it as a [`StepOutcome`] value rather than unwinding with an
//! error.

use crate::checkpoint::{CheckpointActionRequired, CheckpointStep};
use crate::request::{CollectionAddress, RequestStatus};
use serde::{Deserialize, Serialize};

/// The single external action that can resume a blocked request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResumeTarget {
    /// Upload manual webhook access input, then resume.
    ManualAccessInput,
    /// Upload manual webhook erasure input, then resume.
    ManualErasureInput,
    /// Resume past a pre-processing webhook by supplying derived identity.
    WebhookResume,
    /// Retry execution from the failed checkpoint.
    RetryFromFailure,
    /// Supply the missing manual webhook answers, then resume.
    RequiresInput,
}

/// Diagnosis of how a blocked request can be moved forward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeInstructions {
    /// Which resume endpoint applies.
    pub target: ResumeTarget,
    /// Pipeline step involved, when one is cached. Diagnostic for the
    /// retry-from-failure path; the resume point for manual-input paths.
    pub step: Option<CheckpointStep>,
    /// Collection involved, when the halt is scoped to one.
    pub collection: Option<CollectionAddress>,
}

/// Computes the correct resume action for a request, or `None` when no
/// external action applies.
///
/// `paused` and `failed` are the cached checkpoints; their absence is a
/// legitimate state (checkpoints expire or were never written), not an
/// error.
pub fn derive_resume_instructions(
    status: RequestStatus,
    paused: Option<&CheckpointActionRequired>,
    failed: Option<&CheckpointActionRequired>,
) -> Option<ResumeInstructions> {
    match status {
        RequestStatus::Paused => match paused {
            Some(checkpoint) if checkpoint.collection.is_some() => {
                let target = match checkpoint.step {
                    CheckpointStep::Erasure => ResumeTarget::ManualErasureInput,
                    _ => ResumeTarget::ManualAccessInput,
                };
                Some(ResumeInstructions {
                    target,
                    step: Some(checkpoint.step),
                    collection: checkpoint.collection.clone(),
                })
            }
            // Paused on a pre-execution webhook with no collection recorded.
            _ => Some(ResumeInstructions {
                target: ResumeTarget::WebhookResume,
                step: None,
                collection: None,
            }),
        },
        RequestStatus::Error => Some(ResumeInstructions {
            target: ResumeTarget::RetryFromFailure,
            step: failed.map(|checkpoint| checkpoint.step),
            collection: None,
        }),
        RequestStatus::RequiresInput => Some(ResumeInstructions {
            target: ResumeTarget::RequiresInput,
            step: None,
            collection: None,
        }),
        _ => None,
    }
}

/// Outcome of one execution run, reported by the runner.
///
/// A tagged value instead of control-flow exceptions: halting is expected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Execution halted waiting for manual webhook answers.
    AwaitingInput,
    /// Execution paused at a checkpoint, with the manual action needed to
    /// proceed.
    Paused(CheckpointActionRequired),
    /// Execution finished its pipeline but the policy requires a human to
    /// finalize.
    RequiresFinalization,
    /// Execution failed at a checkpoint.
    Failed {
        checkpoint: CheckpointActionRequired,
        reason: String,
    },
    /// Execution completed the full pipeline.
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ManualAction;
    use std::collections::HashMap;

    fn paused_at_collection(step: CheckpointStep) -> CheckpointActionRequired {
        CheckpointActionRequired {
            step,
            collection: Some(CollectionAddress::new("manual_db", "subscriptions")),
            action_needed: Some(vec![ManualAction {
                locators: HashMap::new(),
                get: Some(vec!["plan".to_string()]),
                update: None,
            }]),
        }
    }

    #[test]
    fn test_paused_with_collection_targets_manual_input_by_step() {
        let access = paused_at_collection(CheckpointStep::Access);
        let instructions =
            derive_resume_instructions(RequestStatus::Paused, Some(&access), None).unwrap();
        assert_eq!(instructions.target, ResumeTarget::ManualAccessInput);
        assert_eq!(instructions.step, Some(CheckpointStep::Access));
        assert!(instructions.collection.is_some());

        let erasure = paused_at_collection(CheckpointStep::Erasure);
        let instructions =
            derive_resume_instructions(RequestStatus::Paused, Some(&erasure), None).unwrap();
        assert_eq!(instructions.target, ResumeTarget::ManualErasureInput);
    }

    #[test]
    fn test_paused_without_collection_targets_webhook_resume() {
        let webhook_pause = CheckpointActionRequired::at_step(CheckpointStep::PreWebhooks);
        let instructions =
            derive_resume_instructions(RequestStatus::Paused, Some(&webhook_pause), None)
                .unwrap();
        assert_eq!(instructions.target, ResumeTarget::WebhookResume);
        assert_eq!(instructions.step, None);

        // No checkpoint cached at all behaves the same.
        let instructions = derive_resume_instructions(RequestStatus::Paused, None, None).unwrap();
        assert_eq!(instructions.target, ResumeTarget::WebhookResume);
    }

    #[test]
    fn test_error_targets_retry_with_diagnostic_step() {
        let failed = CheckpointActionRequired::at_step(CheckpointStep::Erasure);
        let instructions =
            derive_resume_instructions(RequestStatus::Error, None, Some(&failed)).unwrap();
        assert_eq!(instructions.target, ResumeTarget::RetryFromFailure);
        assert_eq!(instructions.step, Some(CheckpointStep::Erasure));

        // Expired checkpoint still yields the retry target, just without a
        // step.
        let instructions = derive_resume_instructions(RequestStatus::Error, None, None).unwrap();
        assert_eq!(instructions.step, None);
    }

    #[test]
    fn test_requires_input_carries_no_pipeline_position() {
        let instructions =
            derive_resume_instructions(RequestStatus::RequiresInput, None, None).unwrap();
        assert_eq!(instructions.target, ResumeTarget::RequiresInput);
        assert_eq!(instructions.step, None);
        assert_eq!(instructions.collection, None);
    }

    #[test]
    fn test_other_statuses_have_no_resume_action() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::InProcessing,
            RequestStatus::Complete,
            RequestStatus::Denied,
            RequestStatus::Canceled,
        ] {
            assert_eq!(derive_resume_instructions(status, None, None), None);
        }
    }
}
