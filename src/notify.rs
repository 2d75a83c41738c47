use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::limits::*;
use crate::observability;
use crate::outbox::Outbox;

/// One outgoing email, already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the mail server. Worth retrying.
    #[error("mail transport unavailable: {0}")]
    Unavailable(String),
    /// The server refused the message. Retrying won't help.
    #[error("mail rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Delivers rendered mail. SMTP lives behind this.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: &MailMessage) -> Result<(), TransportError>;
}

/// Logs each message instead of sending it.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, message: &MailMessage) -> Result<(), TransportError> {
        info!(to = %message.to, subject = %message.subject, "mail delivered to log");
        debug!(body = %message.body, "mail body");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("{0}")]
    Validation(String),
    #[error("notification queue is full")]
    QueueFull,
    #[error("notification queue is closed")]
    Closed,
    #[error("could not record notification: {0}")]
    Store(String),
}

/// Work for the delivery pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationTask {
    PasswordReset { email: String, code: String },
}

impl NotificationTask {
    pub fn password_reset(email: impl Into<String>, code: impl Into<String>) -> Result<Self, NotifyError> {
        let email = email.into().trim().to_string();
        let code = code.into().trim().to_string();
        if email.len() > MAX_EMAIL_LEN || !is_plausible_email(&email) {
            return Err(NotifyError::Validation("invalid email address".into()));
        }
        if code.is_empty() || code.len() > MAX_RESET_CODE_LEN {
            return Err(NotifyError::Validation("invalid reset code".into()));
        }
        Ok(NotificationTask::PasswordReset { email, code })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NotificationTask::PasswordReset { .. } => "password_reset",
        }
    }

    pub fn render(&self, from: &str) -> MailMessage {
        match self {
            NotificationTask::PasswordReset { email, code } => MailMessage {
                from: from.to_string(),
                to: email.clone(),
                subject: "Your password reset code".into(),
                body: format!(
                    "We received a request to reset the password for your account.\n\n\
                     One-time code: {code}\n\
                     Valid for {RESET_CODE_TTL_MINUTES} minutes from receipt of this email.\n\n\
                     Do not share this code with anyone. If you did not ask to reset your \
                     password, you can ignore this email.\n"
                ),
            },
        }
    }
}

fn is_plausible_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Lifecycle of one task. Terminal states are recorded in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Delivered,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Delivered => "delivered",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub workers: usize,
    pub capacity: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub attempt_timeout: Duration,
    pub sender: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(10),
            sender: "no-reply@localhost".into(),
        }
    }
}

impl QueueSettings {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1 << attempt.saturating_sub(1).min(16))
    }
}

struct Queued {
    id: Uuid,
    task: NotificationTask,
}

/// Mail queue drained by a fixed worker pool, backed by an [`Outbox`].
///
/// `enqueue` returns once the task is durably recorded and never waits on
/// delivery. Tasks left unfinished by a crash are picked up again by the
/// next `start` on the same outbox.
pub struct NotificationQueue {
    tx: Mutex<Option<mpsc::Sender<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    outbox: Arc<Outbox>,
}

impl NotificationQueue {
    /// Start the worker pool and requeue whatever `outbox` still holds.
    /// Needs a tokio runtime.
    pub fn start(settings: QueueSettings, transport: Arc<dyn MailTransport>, outbox: Outbox) -> Self {
        let outbox = Arc::new(outbox);
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let settings = Arc::new(settings);
        let mut workers: Vec<_> = (0..settings.workers.max(1))
            .map(|n| {
                tokio::spawn(worker_loop(
                    n,
                    rx.clone(),
                    transport.clone(),
                    settings.clone(),
                    outbox.clone(),
                ))
            })
            .collect();

        let recovered = outbox.pending().unwrap_or_else(|e| {
            warn!(error = %e, "could not read pending notifications");
            Vec::new()
        });
        if !recovered.is_empty() {
            // Feed through the bounded channel without blocking start.
            let feeder = tx.clone();
            workers.push(tokio::spawn(async move {
                for (id, task) in recovered {
                    if feeder.send(Queued { id, task }).await.is_err() {
                        break;
                    }
                }
            }));
        }

        info!(workers = settings.workers.max(1), capacity = settings.capacity, "notification queue started");
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            outbox,
        }
    }

    /// Record a task, hand it to the pool and return its id. Never waits
    /// for delivery.
    pub fn enqueue(&self, task: NotificationTask) -> Result<Uuid, NotifyError> {
        let guard = self.tx.lock().map_err(|_| NotifyError::Closed)?;
        let tx = guard.as_ref().ok_or(NotifyError::Closed)?;
        let kind = task.kind();
        let permit = match tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                metrics::counter!(observability::NOTIFICATIONS_REJECTED_TOTAL, "reason" => "full").increment(1);
                warn!(kind, "notification queue full, dropping task");
                return Err(NotifyError::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(())) => return Err(NotifyError::Closed),
        };

        let id = Uuid::new_v4();
        self.outbox.record_queued(id, &task).map_err(|e| {
            metrics::counter!(observability::NOTIFICATIONS_REJECTED_TOTAL, "reason" => "store").increment(1);
            warn!(kind, error = %e, "could not record notification");
            NotifyError::Store(e.to_string())
        })?;
        permit.send(Queued { id, task });

        metrics::counter!(observability::NOTIFICATIONS_ENQUEUED_TOTAL, "kind" => kind).increment(1);
        debug!(task_id = %id, kind, status = TaskStatus::Queued.as_str(), "notification queued");
        Ok(id)
    }

    /// Stop accepting tasks and wait for the workers to drain what's queued.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handles = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => Vec::new(),
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "notification worker ended abnormally");
            }
        }
        info!("notification queue drained");
    }
}

async fn worker_loop(
    n: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>,
    transport: Arc<dyn MailTransport>,
    settings: Arc<QueueSettings>,
    outbox: Arc<Outbox>,
) {
    loop {
        // Lock only long enough to take one task, so other workers can pick up the next.
        let next = rx.lock().await.recv().await;
        let Some(Queued { id, task }) = next else { break };
        let kind = task.kind();
        debug!(worker = n, task_id = %id, kind, status = TaskStatus::InProgress.as_str(), "notification picked up");

        let message = task.render(&settings.sender);
        let status = deliver_with_retry(transport.as_ref(), &message, &settings, id).await;
        match status {
            TaskStatus::Delivered => {
                metrics::counter!(observability::NOTIFICATIONS_DELIVERED_TOTAL, "kind" => kind).increment(1);
                info!(task_id = %id, kind, to = %message.to, "notification delivered");
            }
            _ => {
                metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => kind).increment(1);
                warn!(task_id = %id, kind, to = %message.to, "notification failed");
            }
        }
        // A missing marker means the task is sent again after a restart.
        if let Err(e) = outbox.record_finished(id, status) {
            warn!(task_id = %id, error = %e, "could not mark notification finished");
        }
    }
    debug!(worker = n, "notification worker stopped");
}

async fn deliver_with_retry(
    transport: &dyn MailTransport,
    message: &MailMessage,
    settings: &QueueSettings,
    id: Uuid,
) -> TaskStatus {
    let attempts = settings.max_attempts.max(1);
    for attempt in 1..=attempts {
        metrics::counter!(observability::NOTIFICATION_ATTEMPTS_TOTAL).increment(1);
        match tokio::time::timeout(settings.attempt_timeout, transport.deliver(message)).await {
            Ok(Ok(())) => return TaskStatus::Delivered,
            Ok(Err(e)) if !e.is_retryable() => {
                warn!(task_id = %id, attempt, error = %e, "delivery rejected");
                return TaskStatus::Failed;
            }
            Ok(Err(e)) => warn!(task_id = %id, attempt, error = %e, "delivery attempt failed"),
            Err(_) => warn!(task_id = %id, attempt, "delivery attempt timed out"),
        }
        if attempt < attempts {
            tokio::time::sleep(settings.backoff(attempt)).await;
        }
    }
    TaskStatus::Failed
}
