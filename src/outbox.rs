use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::notify::{NotificationTask, TaskStatus};
use crate::wal::Log;

/// Appends after which a finish triggers a rewrite down to the pending tasks.
const COMPACT_AFTER: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxRecord {
    Queued { id: Uuid, task: NotificationTask },
    Finished { id: Uuid, status: TaskStatus },
}

struct OutboxState {
    log: Log<OutboxRecord>,
    /// Accepted but not yet finished, keyed by id with their acceptance order.
    pending: HashMap<Uuid, (u64, NotificationTask)>,
    next_seq: u64,
}

impl OutboxState {
    fn pending(&self) -> Vec<(Uuid, NotificationTask)> {
        let mut tasks: Vec<_> = self
            .pending
            .iter()
            .map(|(id, (seq, task))| (*seq, *id, task.clone()))
            .collect();
        tasks.sort_by_key(|(seq, ..)| *seq);
        tasks.into_iter().map(|(_, id, task)| (id, task)).collect()
    }

    fn compact(&mut self) -> io::Result<()> {
        let records: Vec<_> = self
            .pending()
            .into_iter()
            .map(|(id, task)| OutboxRecord::Queued { id, task })
            .collect();
        self.log.compact(&records)
    }
}

/// Durable ledger of accepted notifications.
///
/// A task is written here before the producer is told it was accepted and
/// marked finished once delivery succeeds or gives up. Anything without a
/// finish marker is handed back to the workers on the next start, so a
/// crash between the two can deliver a message twice but never drops one.
pub struct Outbox {
    state: Mutex<OutboxState>,
}

impl Outbox {
    /// Recover the log at `path` and rewrite it down to the unfinished tasks.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut pending = HashMap::new();
        let mut next_seq = 0;
        for record in Log::<OutboxRecord>::recover(path)? {
            match record {
                OutboxRecord::Queued { id, task } => {
                    pending.insert(id, (next_seq, task));
                    next_seq += 1;
                }
                OutboxRecord::Finished { id, .. } => {
                    pending.remove(&id);
                }
            }
        }

        let mut state = OutboxState {
            log: Log::open(path)?,
            pending,
            next_seq,
        };
        state.compact()?;
        if !state.pending.is_empty() {
            info!(pending = state.pending.len(), path = %path.display(), "recovered undelivered notifications");
        }
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, OutboxState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("outbox lock poisoned"))
    }

    /// Unfinished tasks, oldest first.
    pub fn pending(&self) -> io::Result<Vec<(Uuid, NotificationTask)>> {
        Ok(self.lock()?.pending())
    }

    /// Durably record an accepted task. Returns once the record is fsynced.
    pub fn record_queued(&self, id: Uuid, task: &NotificationTask) -> io::Result<()> {
        let mut st = self.lock()?;
        st.log.append(&OutboxRecord::Queued { id, task: task.clone() })?;
        let seq = st.next_seq;
        st.next_seq += 1;
        st.pending.insert(id, (seq, task.clone()));
        Ok(())
    }

    /// Mark a task delivered or abandoned so it is not handed out again.
    pub fn record_finished(&self, id: Uuid, status: TaskStatus) -> io::Result<()> {
        let mut st = self.lock()?;
        st.log.append(&OutboxRecord::Finished { id, status })?;
        st.pending.remove(&id);
        if st.log.appends_since_compact() >= COMPACT_AFTER {
            st.compact()?;
        }
        Ok(())
    }
}
