//! Core engine for Data Subject Rights (DSR) privacy requests.
//!
//! This crate tracks a privacy request — access, erasure, or consent — from
//! creation through identity verification, review, execution handoff, manual
//! intervention, retries, and finalization. It is built around three pieces:
//!
//! - [`RequestEngine`]: the lifecycle state machine driving every status
//!   transition, including the resume/retry protocol for paused, errored,
//!   and input-blocked requests.
//! - [`cache`]: the keyed request store over a TTL-capable cache backend,
//!   with per-request key indexing and legacy key migration.
//! - collaborator traits ([`TaskQueue`], [`Messenger`], [`WebhookRegistry`],
//!   [`QueryPlanner`]) through which deployments wire in their runner,
//!   mailer, webhook configuration, and dataset graph planner.
//!
//! Conditional auto-approval rules are evaluated by the companion
//! `dsr-conditions` crate.

pub mod cache;
pub mod checkpoint;
pub mod collaborators;
pub mod lifecycle;
pub mod request;
pub mod resume;
pub mod testing;
pub mod webhook;

pub use cache::{Cache, CacheError, MockCache, RedisCache, RedisCacheConfig, RequestCache};
pub use checkpoint::{
    can_run_checkpoint, CheckpointActionRequired, CheckpointStep, ManualAction,
};
pub use collaborators::{
    CollectionNode, EnqueueRequest, Messenger, MessagingError, Notification, QueryPlanner,
    QueueError, TaskHandle, TaskQueue, TraversalError,
};
pub use lifecycle::{
    BulkFailure, BulkResult, BulkSelection, EngineConfig, RequestEngine, RequestError,
    RequestReadout, RequestSummary, RestartOutcome, VerboseReadout,
};
pub use request::{
    ActionType, AuditAction, AuditEntry, CollectionAddress, ExecutionLog, ExecutionLogStatus,
    PrivacyRequest, RequestId, RequestSource, RequestStatus, RequestTask, TaskStatus,
};
pub use resume::{derive_resume_instructions, ResumeInstructions, ResumeTarget, StepOutcome};
pub use webhook::{
    InputValidationError, ManualWebhook, ManualWebhookField, PreApprovalReply,
    PreApprovalWebhook, WebhookRegistry,
};
