use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Span {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> time::Duration {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// Anything occupying a span on a staff member's timeline.
pub trait Timed {
    fn span(&self) -> Span;
}

/// Lifecycle of a dispatch assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    /// Allowed edges: scheduled -> in_progress -> completed, and cancellation
    /// from either non-terminal state.
    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress) | (InProgress, Completed) | (Scheduled, Cancelled) | (InProgress, Cancelled)
        )
    }

    /// Cancelled assignments no longer occupy the staff member's time.
    pub fn is_committed(self) -> bool {
        self != AssignmentStatus::Cancelled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Scheduled => "scheduled",
            AssignmentStatus::InProgress => "in_progress",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization of a staff member for a route in a given role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffRoute {
    pub staff_id: Uuid,
    pub route_id: Uuid,
    pub full_name: String,
    pub role: String,
    #[serde(with = "time::serde::rfc3339")]
    pub assign_date: OffsetDateTime,
    pub is_active: bool,
    pub role_assignments: Vec<String>,
}

impl StaffRoute {
    /// True when `role` is this record's primary role or one of its extra assignments.
    pub fn grants_role(&self, role: &str) -> bool {
        self.role.eq_ignore_ascii_case(role)
            || self
                .role_assignments
                .iter()
                .any(|r| r.eq_ignore_ascii_case(role))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffRouteCreate {
    pub staff_id: Uuid,
    pub route_id: Uuid,
    pub full_name: String,
    pub role: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub assign_date: Option<OffsetDateTime>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub role_assignments: Vec<String>,
}

fn default_active() -> bool {
    true
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffRouteUpdate {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub role_assignments: Option<Vec<String>>,
}

/// A committed work interval `[assigned_at, expected_end_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAssignment {
    pub id: Uuid,
    pub staff_id: Uuid,
    pub trip_id: Uuid,
    pub route_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub assigned_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expected_end_time: OffsetDateTime,
    pub from_location: String,
    pub to_location: String,
    pub status: AssignmentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Timed for DispatchAssignment {
    fn span(&self) -> Span {
        Span::new(self.assigned_at, self.expected_end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAssignmentCreate {
    pub staff_id: Uuid,
    pub trip_id: Uuid,
    pub route_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub assigned_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expected_end_time: OffsetDateTime,
    pub from_location: String,
    pub to_location: String,
    /// Role the staff member must hold on the route, if any.
    #[serde(default)]
    pub role: Option<String>,
}

/// A declared window `[start_time, end_time)` during which the staff member must not be assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffUnavailability {
    pub id: Uuid,
    pub staff_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
}

impl Timed for StaffUnavailability {
    fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffUnavailabilityCreate {
    pub staff_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
}

/// Everything committed for one staff member. Both lists are sorted by start time.
#[derive(Debug, Clone)]
pub struct StaffState {
    pub staff_id: Uuid,
    pub assignments: Vec<DispatchAssignment>,
    pub unavailability: Vec<StaffUnavailability>,
}

impl StaffState {
    pub fn new(staff_id: Uuid) -> Self {
        Self {
            staff_id,
            assignments: Vec::new(),
            unavailability: Vec::new(),
        }
    }

    pub fn interval_count(&self) -> usize {
        self.assignments.len() + self.unavailability.len()
    }

    pub fn insert_assignment(&mut self, assignment: DispatchAssignment) {
        insert_sorted(&mut self.assignments, assignment);
    }

    pub fn remove_assignment(&mut self, id: Uuid) -> Option<DispatchAssignment> {
        let pos = self.assignments.iter().position(|a| a.id == id)?;
        Some(self.assignments.remove(pos))
    }

    pub fn assignment_mut(&mut self, id: Uuid) -> Option<&mut DispatchAssignment> {
        self.assignments.iter_mut().find(|a| a.id == id)
    }

    pub fn insert_unavailability(&mut self, window: StaffUnavailability) {
        insert_sorted(&mut self.unavailability, window);
    }

    pub fn overlapping_assignments(&self, query: &Span) -> impl Iterator<Item = &DispatchAssignment> {
        overlapping(&self.assignments, *query)
    }

    pub fn overlapping_unavailability(&self, query: &Span) -> impl Iterator<Item = &StaffUnavailability> {
        overlapping(&self.unavailability, *query)
    }
}

/// Insert maintaining sort order by span start; equal starts keep insertion order.
fn insert_sorted<T: Timed>(items: &mut Vec<T>, item: T) {
    let start = item.span().start;
    let pos = items.partition_point(|i| i.span().start <= start);
    items.insert(pos, item);
}

/// Items whose span overlaps `query`. Everything at or past the first item
/// starting at `query.end` can't overlap, so the scan stops there.
fn overlapping<T: Timed>(items: &[T], query: Span) -> impl Iterator<Item = &T> {
    let right_bound = items.partition_point(|i| i.span().start < query.end);
    items[..right_bound]
        .iter()
        .filter(move |i| i.span().end > query.start)
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StaffRouteCreated {
        route: StaffRoute,
    },
    StaffRouteUpdated {
        route: StaffRoute,
    },
    StaffRouteDeleted {
        staff_id: Uuid,
        route_id: Uuid,
    },
    AssignmentCreated {
        assignment: DispatchAssignment,
    },
    AssignmentStatusChanged {
        id: Uuid,
        staff_id: Uuid,
        status: AssignmentStatus,
    },
    AssignmentDeleted {
        id: Uuid,
        staff_id: Uuid,
    },
    UnavailabilityCreated {
        window: StaffUnavailability,
    },
}

impl Event {
    /// The staff member whose timeline this event touches, if any.
    pub fn staff_id(&self) -> Option<Uuid> {
        match self {
            Event::AssignmentCreated { assignment } => Some(assignment.staff_id),
            Event::AssignmentStatusChanged { staff_id, .. } | Event::AssignmentDeleted { staff_id, .. } => {
                Some(*staff_id)
            }
            Event::UnavailabilityCreated { window } => Some(window.staff_id),
            Event::StaffRouteCreated { .. } | Event::StaffRouteUpdated { .. } | Event::StaffRouteDeleted { .. } => {
                None
            }
        }
    }
}
