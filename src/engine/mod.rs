mod conflict;
mod error;
mod mutations;
mod queries;
mod registry;

pub use conflict::{conflicts_with_any, overlaps};
pub use error::{ConflictReason, EngineError};
pub use registry::StaffRouteRegistry;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;
use uuid::Uuid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedStaffState = Arc<RwLock<StaffState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Blocks for the first append, drains whatever else is
/// already queued, then issues one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't bleed
    // into the next batch; every caller in this batch is told it failed.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
    }
}

/// Handle to the WAL writer task, shared by the engine and the registry.
///
/// Every mutation holds the commit gate (shared) from before it takes its
/// state lock until the event is applied. Compaction holds it exclusively,
/// so a snapshot never misses an event that is in flight.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<WalCommand>,
    gate: Arc<RwLock<()>>,
}

impl Journal {
    fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Self {
            tx,
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub(super) async fn begin(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    pub(super) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Durably record one event via the group-commit writer.
    pub(super) async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    pub(super) async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    pub(super) async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The dispatch assignment engine: per-staff timelines, the eligibility
/// registry, and the journal both write through.
pub struct Engine {
    pub(super) staff: DashMap<Uuid, SharedStaffState>,
    /// Reverse lookup: assignment / unavailability id → staff id.
    pub(super) entity_to_staff: DashMap<Uuid, Uuid>,
    pub registry: StaffRouteRegistry,
    pub(super) journal: Journal,
}

/// Apply a timeline event to one staff member's state (caller holds the lock).
fn apply_to_staff(st: &mut StaffState, event: &Event, entity_map: &DashMap<Uuid, Uuid>) {
    match event {
        Event::AssignmentCreated { assignment } => {
            entity_map.insert(assignment.id, assignment.staff_id);
            st.insert_assignment(assignment.clone());
        }
        Event::AssignmentStatusChanged { id, status, .. } => {
            if let Some(a) = st.assignment_mut(*id) {
                a.status = *status;
            }
        }
        Event::AssignmentDeleted { id, .. } => {
            st.remove_assignment(*id);
            entity_map.remove(id);
        }
        Event::UnavailabilityCreated { window } => {
            entity_map.insert(window.id, window.staff_id);
            st.insert_unavailability(window.clone());
        }
        // Registry events are applied by StaffRouteRegistry.
        Event::StaffRouteCreated { .. } | Event::StaffRouteUpdated { .. } | Event::StaffRouteDeleted { .. } => {}
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Needs a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let journal = Journal::spawn(wal);

        let engine = Self {
            staff: DashMap::new(),
            entity_to_staff: DashMap::new(),
            registry: StaffRouteRegistry::new(journal.clone()),
            journal,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // blocking_write would panic here when called from inside the runtime.
        for event in &events {
            match event.staff_id() {
                Some(staff_id) => {
                    let state = engine.staff_state(staff_id);
                    let mut guard = state
                        .try_write()
                        .map_err(|_| io::Error::other("replay: staff state contended"))?;
                    apply_to_staff(&mut guard, event, &engine.entity_to_staff);
                }
                None => engine.registry.apply(event),
            }
        }
        info!(
            events = events.len(),
            staff = engine.staff.len(),
            path = %wal_path.display(),
            "replayed dispatch log"
        );

        Ok(engine)
    }

    pub fn get_staff(&self, staff_id: &Uuid) -> Option<SharedStaffState> {
        self.staff.get(staff_id).map(|e| e.value().clone())
    }

    /// The staff member's timeline, created empty on first use.
    pub(super) fn staff_state(&self, staff_id: Uuid) -> SharedStaffState {
        self.staff
            .entry(staff_id)
            .or_insert_with(|| Arc::new(RwLock::new(StaffState::new(staff_id))))
            .value()
            .clone()
    }

    pub fn get_staff_for_entity(&self, entity_id: &Uuid) -> Option<Uuid> {
        self.entity_to_staff.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(&self, st: &mut StaffState, event: &Event) -> Result<(), EngineError> {
        self.journal.append(event).await?;
        apply_to_staff(st, event, &self.entity_to_staff);
        Ok(())
    }

    /// Lookup entity → staff member, then take that timeline's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Uuid,
    ) -> Result<OwnedRwLockWriteGuard<StaffState>, EngineError> {
        let staff_id = self
            .get_staff_for_entity(entity_id)
            .ok_or_else(|| EngineError::NotFound(format!("assignment {entity_id}")))?;
        let st = self
            .get_staff(&staff_id)
            .ok_or_else(|| EngineError::NotFound(format!("staff {staff_id}")))?;
        Ok(st.write_owned().await)
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.journal.exclusive().await;

        let mut events = self.registry.snapshot_events();
        let timelines: Vec<SharedStaffState> = self.staff.iter().map(|e| e.value().clone()).collect();
        for st in timelines {
            let guard = st.read().await;
            events.extend(
                guard
                    .assignments
                    .iter()
                    .map(|a| Event::AssignmentCreated { assignment: a.clone() }),
            );
            events.extend(
                guard
                    .unavailability
                    .iter()
                    .map(|w| Event::UnavailabilityCreated { window: w.clone() }),
            );
        }
        let count = events.len();
        self.journal.compact(events).await?;
        info!(events = count, "compacted dispatch log");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }
}
