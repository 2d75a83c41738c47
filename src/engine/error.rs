use uuid::Uuid;

use crate::model::AssignmentStatus;

/// Why a write was rejected on temporal or eligibility grounds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictReason {
    #[error("overlapping assignment {0}")]
    OverlappingAssignment(Uuid),
    #[error("staff unavailable (window {0})")]
    StaffUnavailable(Uuid),
    #[error("staff not eligible for route")]
    NotEligible,
    #[error("staff route already exists")]
    DuplicateStaffRoute,
}

impl ConflictReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ConflictReason::OverlappingAssignment(_) => "overlapping_assignment",
            ConflictReason::StaffUnavailable(_) => "staff_unavailable",
            ConflictReason::NotEligible => "not_eligible",
            ConflictReason::DuplicateStaffRoute => "duplicate_staff_route",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or missing input.
    #[error("{0}")]
    Validation(String),
    /// `end <= start`.
    #[error("{0}")]
    InvalidInterval(&'static str),
    #[error("{0}")]
    Conflict(ConflictReason),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: AssignmentStatus,
        to: AssignmentStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// The log could not be written. Nothing was applied; safe to retry.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }
}

impl From<ConflictReason> for EngineError {
    fn from(reason: ConflictReason) -> Self {
        EngineError::Conflict(reason)
    }
}
