//! Error types shared across the engine.
//!
//! Failures are data: adapters and the verifier return typed errors, and
//! the scheduler folds them into its state machine instead of unwinding.

use thiserror::Error;

/// Planner failures. Surfaced to clients as HTTP 400 / CLI exit 1.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner output failed schema validation: {0}")]
    Schema(String),

    #[error("planner produced a task graph with a cycle")]
    Cycle,

    #[error("planner model call failed: {0}")]
    UpstreamLlm(String),
}

/// Normalized provider adapter failures.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("permanent provider failure: {0}")]
    Permanent(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

impl ProviderError {
    /// Errors worth retrying inside the adapter's own backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }

    /// Errors fatal to the whole run (no fallback can fix a bad key).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }
}

/// Verifier-internal failures (the rubric call itself broke).
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verifier rubric call failed: {0}")]
    InternalRubric(String),
}

/// Router failures.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no candidate model for task {task_id}: {reason}")]
    NoCandidate { task_id: String, reason: String },
}

/// Task graph structural violations, produced by validation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task graph is empty")]
    Empty,

    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    #[error("task {task_id} references unknown input {input}")]
    UnknownInput { task_id: String, input: String },

    #[error("cycle detected in task graph")]
    Cycle,
}

/// Run-level failures. Surfaced via the HTTP status map and CLI exit codes.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("all candidate bindings failed: {}", reasons.join("; "))]
    AllCandidatesFailed { reasons: Vec<String> },

    #[error("run cancelled")]
    Cancelled,

    #[error("run timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Top-level error union returned by the engine entry points.
#[derive(Debug, Error)]
pub enum Ai3Error {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl Ai3Error {
    /// Stable kind identifier used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Ai3Error::Plan(_) => "plan_error",
            Ai3Error::Run(RunError::AllCandidatesFailed { .. }) => "all_candidates_failed",
            Ai3Error::Run(RunError::Cancelled) => "cancelled",
            Ai3Error::Run(RunError::Timeout) => "timeout",
            Ai3Error::Run(RunError::Configuration(_)) => "configuration",
        }
    }

    /// CLI exit code per the interface contract.
    pub fn exit_code(&self) -> u8 {
        match self {
            Ai3Error::Plan(_) => 1,
            Ai3Error::Run(RunError::AllCandidatesFailed { .. }) => 2,
            Ai3Error::Run(RunError::Cancelled) | Ai3Error::Run(RunError::Timeout) => 3,
            Ai3Error::Run(RunError::Configuration(_)) => 4,
        }
    }
}
