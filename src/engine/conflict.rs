use time::OffsetDateTime;

use crate::limits::*;
use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

pub(crate) fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Half-open overlap: `candidate.start < existing.end && candidate.end > existing.start`.
pub fn overlaps(candidate: &Span, existing: &Span) -> bool {
    candidate.overlaps(existing)
}

/// True iff `candidate` overlaps at least one member of `existing`.
pub fn conflicts_with_any<'a, I>(candidate: &Span, existing: I) -> bool
where
    I: IntoIterator<Item = &'a Span>,
{
    existing.into_iter().any(|e| overlaps(candidate, e))
}

/// `end > start` and not absurdly long. `what` names the offending fields.
pub(crate) fn validate_span(span: &Span, what: &'static str) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::InvalidInterval(what));
    }
    if span.duration() > MAX_SPAN_DURATION {
        return Err(EngineError::LimitExceeded("interval too long"));
    }
    Ok(())
}

/// First committed assignment overlapping `span`. Cancelled assignments don't count.
pub(crate) fn check_no_assignment_overlap(st: &StaffState, span: &Span) -> Result<(), EngineError> {
    match st
        .overlapping_assignments(span)
        .find(|a| a.status.is_committed())
    {
        Some(a) => Err(ConflictReason::OverlappingAssignment(a.id).into()),
        None => Ok(()),
    }
}

pub(crate) fn check_not_unavailable(st: &StaffState, span: &Span) -> Result<(), EngineError> {
    match st.overlapping_unavailability(span).next() {
        Some(w) => Err(ConflictReason::StaffUnavailable(w.id).into()),
        None => Ok(()),
    }
}
