use uuid::Uuid;

use crate::model::*;

use super::{Engine, EngineError, SharedStaffState};

fn latest_key(a: &DispatchAssignment) -> (time::OffsetDateTime, time::OffsetDateTime, Uuid) {
    (a.assigned_at, a.created_at, a.id)
}

impl Engine {
    /// All assignments, or one staff member's, ordered by start time.
    pub async fn list_assignments(&self, staff_id: Option<Uuid>) -> Vec<DispatchAssignment> {
        let timelines: Vec<SharedStaffState> = match staff_id {
            Some(id) => self.get_staff(&id).into_iter().collect(),
            None => self.staff.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for st in timelines {
            out.extend(st.read().await.assignments.iter().cloned());
        }
        out.sort_by_key(|a| (a.assigned_at, a.created_at));
        out
    }

    pub async fn get_assignment(&self, id: Uuid) -> Result<DispatchAssignment, EngineError> {
        let not_found = || EngineError::NotFound(format!("assignment {id}"));
        let staff_id = self.get_staff_for_entity(&id).ok_or_else(not_found)?;
        let st = self.get_staff(&staff_id).ok_or_else(not_found)?;
        let guard = st.read().await;
        guard
            .assignments
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(not_found)
    }

    /// The staff member's assignment with the greatest `assigned_at`.
    /// Ties go to the most recently created, then to the greater id.
    pub async fn get_latest_assignment(&self, staff_id: Uuid) -> Result<DispatchAssignment, EngineError> {
        let not_found = || EngineError::NotFound(format!("assignments for staff {staff_id}"));
        let st = self.get_staff(&staff_id).ok_or_else(not_found)?;
        let guard = st.read().await;
        guard
            .assignments
            .iter()
            .max_by_key(|a| latest_key(a))
            .cloned()
            .ok_or_else(not_found)
    }

    pub async fn get_unavailability(&self, staff_id: Uuid) -> Vec<StaffUnavailability> {
        match self.get_staff(&staff_id) {
            Some(st) => st.read().await.unavailability.clone(),
            None => Vec::new(),
        }
    }
}
