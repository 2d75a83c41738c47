use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;
use uuid::Uuid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now;
use super::error::ConflictReason;
use super::mutations::{require_id, require_text};
use super::{EngineError, Journal};

type RouteKey = (Uuid, Uuid);

fn validate_role(role: &str, field: &str) -> Result<(), EngineError> {
    require_text(role, field, MAX_ROLE_LEN)?;
    if !role
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | ' '))
    {
        return Err(EngineError::Validation(format!("{field} contains invalid characters")));
    }
    Ok(())
}

fn validate_role_assignments(roles: &[String]) -> Result<(), EngineError> {
    if roles.len() > MAX_ROLE_ASSIGNMENTS {
        return Err(EngineError::Validation(format!(
            "at most {MAX_ROLE_ASSIGNMENTS} role_assignments allowed"
        )));
    }
    roles.iter().try_for_each(|r| validate_role(r, "role_assignments"))
}

fn not_found(staff_id: Uuid, route_id: Uuid) -> EngineError {
    EngineError::NotFound(format!("staff route {staff_id}/{route_id}"))
}

fn sorted(mut routes: Vec<StaffRoute>) -> Vec<StaffRoute> {
    routes.sort_by_key(|r| (r.assign_date, r.staff_id, r.route_id));
    routes
}

/// Which staff may work which routes, in which roles.
///
/// Records are unique per `(staff_id, route_id)`. Writes take the registry
/// lock exclusively, so read-modify-write operations like
/// [`toggle_active`](Self::toggle_active) are atomic. An assignment commit
/// holds it shared from the eligibility check until the assignment is
/// applied (see [`hold_eligible`](Self::hold_eligible)).
pub struct StaffRouteRegistry {
    routes: DashMap<RouteKey, StaffRoute>,
    write_lock: RwLock<()>,
    journal: Journal,
}

impl StaffRouteRegistry {
    pub(super) fn new(journal: Journal) -> Self {
        Self {
            routes: DashMap::new(),
            write_lock: RwLock::new(()),
            journal,
        }
    }

    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::StaffRouteCreated { route } | Event::StaffRouteUpdated { route } => {
                self.routes.insert((route.staff_id, route.route_id), route.clone());
            }
            Event::StaffRouteDeleted { staff_id, route_id } => {
                self.routes.remove(&(*staff_id, *route_id));
            }
            _ => {}
        }
    }

    pub(super) fn snapshot_events(&self) -> Vec<Event> {
        self.get_all()
            .into_iter()
            .map(|route| Event::StaffRouteCreated { route })
            .collect()
    }

    async fn commit(&self, event: Event) -> Result<(), EngineError> {
        self.journal.append(&event).await?;
        self.apply(&event);
        Ok(())
    }

    pub async fn create(&self, req: StaffRouteCreate) -> Result<StaffRoute, EngineError> {
        require_id(req.staff_id, "staff_id")?;
        require_id(req.route_id, "route_id")?;
        require_text(&req.full_name, "full_name", MAX_NAME_LEN)?;
        validate_role(&req.role, "role")?;
        validate_role_assignments(&req.role_assignments)?;

        let _commit = self.journal.begin().await;
        let _w = self.write_lock.write().await;
        if self.routes.contains_key(&(req.staff_id, req.route_id)) {
            return Err(ConflictReason::DuplicateStaffRoute.into());
        }
        let route = StaffRoute {
            staff_id: req.staff_id,
            route_id: req.route_id,
            full_name: req.full_name,
            role: req.role,
            assign_date: req.assign_date.unwrap_or_else(now),
            is_active: req.is_active,
            role_assignments: req.role_assignments,
        };
        self.commit(Event::StaffRouteCreated { route: route.clone() }).await?;
        info!(staff_id = %route.staff_id, route_id = %route.route_id, role = %route.role, "staff route created");
        Ok(route)
    }

    pub fn get(&self, staff_id: Uuid, route_id: Uuid) -> Option<StaffRoute> {
        self.routes.get(&(staff_id, route_id)).map(|e| e.value().clone())
    }

    pub fn get_by_staff(&self, staff_id: Uuid) -> Vec<StaffRoute> {
        sorted(
            self.routes
                .iter()
                .filter(|e| e.key().0 == staff_id)
                .map(|e| e.value().clone())
                .collect(),
        )
    }

    pub fn get_by_route(&self, route_id: Uuid) -> Vec<StaffRoute> {
        sorted(
            self.routes
                .iter()
                .filter(|e| e.key().1 == route_id)
                .map(|e| e.value().clone())
                .collect(),
        )
    }

    pub fn get_all(&self) -> Vec<StaffRoute> {
        sorted(self.routes.iter().map(|e| e.value().clone()).collect())
    }

    pub async fn update(
        &self,
        staff_id: Uuid,
        route_id: Uuid,
        fields: StaffRouteUpdate,
    ) -> Result<StaffRoute, EngineError> {
        if let Some(name) = &fields.full_name {
            require_text(name, "full_name", MAX_NAME_LEN)?;
        }
        if let Some(role) = &fields.role {
            validate_role(role, "role")?;
        }
        if let Some(roles) = &fields.role_assignments {
            validate_role_assignments(roles)?;
        }

        let _commit = self.journal.begin().await;
        let _w = self.write_lock.write().await;
        let mut route = self.get(staff_id, route_id).ok_or_else(|| not_found(staff_id, route_id))?;
        if let Some(name) = fields.full_name {
            route.full_name = name;
        }
        if let Some(role) = fields.role {
            route.role = role;
        }
        if let Some(active) = fields.is_active {
            route.is_active = active;
        }
        if let Some(roles) = fields.role_assignments {
            route.role_assignments = roles;
        }
        self.commit(Event::StaffRouteUpdated { route: route.clone() }).await?;
        info!(%staff_id, %route_id, "staff route updated");
        Ok(route)
    }

    /// Hard delete.
    pub async fn delete(&self, staff_id: Uuid, route_id: Uuid) -> Result<StaffRoute, EngineError> {
        let _commit = self.journal.begin().await;
        let _w = self.write_lock.write().await;
        let route = self.get(staff_id, route_id).ok_or_else(|| not_found(staff_id, route_id))?;
        self.commit(Event::StaffRouteDeleted { staff_id, route_id }).await?;
        info!(%staff_id, %route_id, "staff route deleted");
        Ok(route)
    }

    /// Flip `is_active` and return the new value.
    pub async fn toggle_active(&self, staff_id: Uuid, route_id: Uuid) -> Result<bool, EngineError> {
        let _commit = self.journal.begin().await;
        let _w = self.write_lock.write().await;
        let mut route = self.get(staff_id, route_id).ok_or_else(|| not_found(staff_id, route_id))?;
        route.is_active = !route.is_active;
        let active = route.is_active;
        self.commit(Event::StaffRouteUpdated { route }).await?;
        info!(%staff_id, %route_id, active, "staff route toggled");
        Ok(active)
    }

    /// [`check_eligible`](Self::check_eligible), returning a guard that keeps
    /// registry writes out until it is dropped.
    pub(super) async fn hold_eligible(
        &self,
        staff_id: Uuid,
        route_id: Uuid,
        role: Option<&str>,
    ) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        let held = self.write_lock.read().await;
        self.check_eligible(staff_id, route_id, role)?;
        Ok(held)
    }

    /// Passes when an active record exists for the pair and, if `role` is
    /// given, the record grants it.
    pub fn check_eligible(&self, staff_id: Uuid, route_id: Uuid, role: Option<&str>) -> Result<(), EngineError> {
        let eligible = self.routes.get(&(staff_id, route_id)).is_some_and(|r| {
            r.is_active && role.is_none_or(|role| r.grants_role(role))
        });
        if eligible {
            Ok(())
        } else {
            Err(ConflictReason::NotEligible.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::Engine;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("staff_dispatch_test_registry");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn driver(staff_id: Uuid, route_id: Uuid) -> StaffRouteCreate {
        StaffRouteCreate {
            staff_id,
            route_id,
            full_name: "Le Van C".into(),
            role: "driver".into(),
            assign_date: None,
            is_active: true,
            role_assignments: vec![],
        }
    }

    #[tokio::test]
    async fn create_and_query() {
        let engine = Engine::new(test_wal_path("create_query.wal")).unwrap();
        let reg = &engine.registry;
        let (s1, s2, r1, r2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        reg.create(driver(s1, r1)).await.unwrap();
        reg.create(driver(s1, r2)).await.unwrap();
        reg.create(driver(s2, r1)).await.unwrap();

        assert_eq!(reg.get_by_staff(s1).len(), 2);
        assert_eq!(reg.get_by_route(r1).len(), 2);
        assert_eq!(reg.get_all().len(), 3);
        assert!(reg.get_by_staff(Uuid::new_v4()).is_empty());
    }

    #[tokio::test]
    async fn duplicate_pair_is_conflict() {
        let engine = Engine::new(test_wal_path("duplicate.wal")).unwrap();
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        engine.registry.create(driver(s, r)).await.unwrap();
        let err = engine.registry.create(driver(s, r)).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(ConflictReason::DuplicateStaffRoute)));
    }

    #[tokio::test]
    async fn malformed_input_is_validation_error() {
        let engine = Engine::new(test_wal_path("malformed.wal")).unwrap();
        let reg = &engine.registry;

        let nil_staff = driver(Uuid::nil(), Uuid::new_v4());
        assert!(matches!(reg.create(nil_staff).await, Err(EngineError::Validation(_))));

        let mut empty_role = driver(Uuid::new_v4(), Uuid::new_v4());
        empty_role.role = "  ".into();
        assert!(matches!(reg.create(empty_role).await, Err(EngineError::Validation(_))));

        let mut bad_role = driver(Uuid::new_v4(), Uuid::new_v4());
        bad_role.role = "driver;drop".into();
        assert!(matches!(reg.create(bad_role).await, Err(EngineError::Validation(_))));

        let mut too_many = driver(Uuid::new_v4(), Uuid::new_v4());
        too_many.role_assignments = vec!["conductor".into(); MAX_ROLE_ASSIGNMENTS + 1];
        assert!(matches!(reg.create(too_many).await, Err(EngineError::Validation(_))));

        assert!(reg.get_all().is_empty());
    }

    #[tokio::test]
    async fn update_changes_only_given_fields() {
        let engine = Engine::new(test_wal_path("update.wal")).unwrap();
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let created = engine.registry.create(driver(s, r)).await.unwrap();

        let updated = engine
            .registry
            .update(
                s,
                r,
                StaffRouteUpdate {
                    role: Some("conductor".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.role, "conductor");
        assert_eq!(updated.full_name, created.full_name);
        assert!(updated.is_active);

        let missing = engine
            .registry
            .update(Uuid::new_v4(), r, StaffRouteUpdate::default())
            .await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_hard_and_second_delete_not_found() {
        let engine = Engine::new(test_wal_path("delete.wal")).unwrap();
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        engine.registry.create(driver(s, r)).await.unwrap();

        engine.registry.delete(s, r).await.unwrap();
        assert!(engine.registry.get(s, r).is_none());
        assert!(matches!(engine.registry.delete(s, r).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn toggle_flips_and_gates_eligibility() {
        let engine = Engine::new(test_wal_path("toggle.wal")).unwrap();
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        engine.registry.create(driver(s, r)).await.unwrap();
        assert!(engine.registry.check_eligible(s, r, None).is_ok());

        assert!(!engine.registry.toggle_active(s, r).await.unwrap());
        assert!(matches!(
            engine.registry.check_eligible(s, r, None),
            Err(EngineError::Conflict(ConflictReason::NotEligible))
        ));

        assert!(engine.registry.toggle_active(s, r).await.unwrap());
        assert!(engine.registry.check_eligible(s, r, None).is_ok());
    }

    #[tokio::test]
    async fn concurrent_toggles_are_not_lost() {
        let engine = Arc::new(Engine::new(test_wal_path("toggle_race.wal")).unwrap());
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        engine.registry.create(driver(s, r)).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let eng = engine.clone();
                tokio::spawn(async move { eng.registry.toggle_active(s, r).await })
            })
            .collect();
        for h in futures::future::join_all(handles).await {
            h.unwrap().unwrap();
        }
        // An even number of flips lands back where it started.
        assert!(engine.registry.get(s, r).unwrap().is_active);
    }

    #[tokio::test]
    async fn eligibility_checks_role() {
        let engine = Engine::new(test_wal_path("eligible_role.wal")).unwrap();
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let mut req = driver(s, r);
        req.role_assignments = vec!["conductor".into()];
        engine.registry.create(req).await.unwrap();

        assert!(engine.registry.check_eligible(s, r, Some("DRIVER")).is_ok());
        assert!(engine.registry.check_eligible(s, r, Some("conductor")).is_ok());
        assert!(engine.registry.check_eligible(s, r, Some("inspector")).is_err());
        assert!(engine.registry.check_eligible(s, Uuid::new_v4(), None).is_err());
    }

    #[tokio::test]
    async fn registry_survives_replay() {
        let path = test_wal_path("replay.wal");
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        {
            let engine = Engine::new(path.clone()).unwrap();
            engine.registry.create(driver(s, r)).await.unwrap();
            engine.registry.toggle_active(s, r).await.unwrap();
            engine.registry.create(driver(s, Uuid::new_v4())).await.unwrap();
        }
        let engine = Engine::new(path).unwrap();
        assert_eq!(engine.registry.get_by_staff(s).len(), 2);
        assert!(!engine.registry.get(s, r).unwrap().is_active);
    }
}
