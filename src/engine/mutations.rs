use tracing::{debug, info};
use uuid::Uuid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_assignment_overlap, check_not_unavailable, now, validate_span};
use super::{Engine, EngineError};

pub(super) fn require_id(id: Uuid, field: &str) -> Result<(), EngineError> {
    if id.is_nil() {
        return Err(EngineError::Validation(format!("{field} must not be nil")));
    }
    Ok(())
}

pub(super) fn require_text(value: &str, field: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(EngineError::Validation(format!("{field} longer than {max} bytes")));
    }
    Ok(())
}

fn record_conflict(err: &EngineError) {
    if let EngineError::Conflict(reason) = err {
        metrics::counter!(observability::ASSIGNMENT_CONFLICTS_TOTAL, "reason" => reason.label()).increment(1);
    }
}

impl Engine {
    /// Validate and commit one assignment.
    ///
    /// Order: interval sanity, field checks, route eligibility, then the
    /// overlap checks against the staff member's assignments and
    /// unavailability. The staff timeline stays write-locked from the
    /// overlap checks through the commit, so two racing requests for the
    /// same staff member are serialised and the loser sees the winner.
    /// Registry writes for the pair wait until the commit is applied.
    ///
    /// Lock order: commit gate, registry, staff timeline.
    pub async fn create_assignment(&self, req: DispatchAssignmentCreate) -> Result<DispatchAssignment, EngineError> {
        let span = Span::new(req.assigned_at, req.expected_end_time);
        validate_span(&span, "expected_end_time must be after assigned_at")?;
        require_id(req.staff_id, "staff_id")?;
        require_id(req.trip_id, "trip_id")?;
        require_id(req.route_id, "route_id")?;
        require_text(&req.from_location, "from_location", MAX_LOCATION_LEN)?;
        require_text(&req.to_location, "to_location", MAX_LOCATION_LEN)?;
        if let Some(role) = &req.role {
            require_text(role, "role", MAX_ROLE_LEN)?;
        }

        let _commit = self.journal.begin().await;
        let _eligible = self
            .registry
            .hold_eligible(req.staff_id, req.route_id, req.role.as_deref())
            .await
            .inspect_err(record_conflict)?;
        let st = self.staff_state(req.staff_id);
        let mut guard = st.write().await;
        if guard.interval_count() >= MAX_INTERVALS_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many intervals for staff member"));
        }

        check_no_assignment_overlap(&guard, &span)
            .and_then(|()| check_not_unavailable(&guard, &span))
            .inspect_err(|e| {
                debug!(staff_id = %req.staff_id, error = %e, "assignment rejected");
                record_conflict(e);
            })?;

        let assignment = DispatchAssignment {
            id: Uuid::new_v4(),
            staff_id: req.staff_id,
            trip_id: req.trip_id,
            route_id: req.route_id,
            assigned_at: req.assigned_at,
            expected_end_time: req.expected_end_time,
            from_location: req.from_location,
            to_location: req.to_location,
            status: AssignmentStatus::Scheduled,
            created_at: now(),
        };
        let event = Event::AssignmentCreated {
            assignment: assignment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::ASSIGNMENTS_CREATED_TOTAL).increment(1);
        info!(
            assignment_id = %assignment.id,
            staff_id = %assignment.staff_id,
            trip_id = %assignment.trip_id,
            "assignment created"
        );
        Ok(assignment)
    }

    /// Hard delete. A second delete of the same id is `NotFound`.
    pub async fn delete_assignment(&self, id: Uuid) -> Result<DispatchAssignment, EngineError> {
        let _commit = self.journal.begin().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let Some(existing) = guard.assignments.iter().find(|a| a.id == id).cloned() else {
            return Err(EngineError::NotFound(format!("assignment {id}")));
        };
        let event = Event::AssignmentDeleted {
            id,
            staff_id: existing.staff_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(assignment_id = %id, staff_id = %existing.staff_id, "assignment deleted");
        Ok(existing)
    }

    /// Move an assignment along the status graph. Re-setting the current
    /// status is a no-op.
    pub async fn update_status(&self, id: Uuid, status: AssignmentStatus) -> Result<DispatchAssignment, EngineError> {
        let _commit = self.journal.begin().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let Some(current) = guard.assignments.iter().find(|a| a.id == id).cloned() else {
            return Err(EngineError::NotFound(format!("assignment {id}")));
        };
        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        let event = Event::AssignmentStatusChanged {
            id,
            staff_id: current.staff_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(assignment_id = %id, from = %current.status, to = %status, "assignment status changed");
        Ok(DispatchAssignment { status, ..current })
    }

    /// Declare a window the staff member can't work. Rejected if it overlaps a
    /// committed assignment; other unavailability windows are not checked.
    pub async fn create_unavailability(
        &self,
        req: StaffUnavailabilityCreate,
    ) -> Result<StaffUnavailability, EngineError> {
        let span = Span::new(req.start_time, req.end_time);
        validate_span(&span, "end_time must be after start_time")?;
        require_id(req.staff_id, "staff_id")?;

        let _commit = self.journal.begin().await;
        let st = self.staff_state(req.staff_id);
        let mut guard = st.write().await;
        if guard.interval_count() >= MAX_INTERVALS_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many intervals for staff member"));
        }

        check_no_assignment_overlap(&guard, &span).inspect_err(|e| {
            debug!(staff_id = %req.staff_id, error = %e, "unavailability rejected");
            record_conflict(e);
        })?;

        let window = StaffUnavailability {
            id: Uuid::new_v4(),
            staff_id: req.staff_id,
            start_time: req.start_time,
            end_time: req.end_time,
        };
        let event = Event::UnavailabilityCreated { window: window.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(window_id = %window.id, staff_id = %window.staff_id, "unavailability recorded");
        Ok(window)
    }
}
