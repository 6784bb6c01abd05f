use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time;

use pipeline_common::duration_ms;
use pipeline_common::message::{Batch, Envelope, Message};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::metrics_consts::{BATCH_FLUSHED, BATCH_SIZE};
use crate::processors::Flow;

/// Flush once `max_count` messages are pending, or `max_period` after the
/// first pending message arrived, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BatchPolicy {
    pub max_count: usize,
    #[serde(with = "duration_ms")]
    pub max_period: time::Duration,
}

impl BatchPolicy {
    pub fn new(max_count: usize, max_period: time::Duration) -> Self {
        Self {
            max_count,
            max_period,
        }
    }
}

#[derive(Default)]
struct Pending {
    messages: Vec<Message>,
    opened_at: Option<Instant>,
}

impl Pending {
    fn take(&mut self) -> Option<Batch> {
        self.opened_at = None;
        Batch::new(std::mem::take(&mut self.messages))
    }
}

/// Accumulates single messages. The lock is never held across an await.
pub(crate) struct Batcher {
    policy: BatchPolicy,
    pending: Mutex<Pending>,
    opened: Notify,
}

impl Batcher {
    pub(crate) fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(Pending::default()),
            opened: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a message. A batch that filled up, or one whose period elapsed
    /// before this message arrived, continues in the caller's task. Batches
    /// pass through untouched.
    pub(crate) fn process(&self, envelope: Envelope, stage: &str) -> Flow<'_> {
        let message = match envelope {
            Envelope::Message(message) => message,
            batch @ Envelope::Batch(_) => return Flow::Continue(batch),
        };

        let (overdue, full) = {
            let mut pending = self.lock();
            let now = Instant::now();
            let overdue = self.take_expired(&mut pending, now);
            if pending.opened_at.is_none() {
                pending.opened_at = Some(now);
                self.opened.notify_one();
            }
            pending.messages.push(message);
            let full = if pending.messages.len() >= self.policy.max_count {
                pending.take()
            } else {
                None
            };
            (overdue, full)
        };

        // Only a batch with room for more than one message can be overdue,
        // so at most one of these is set.
        match (overdue, full) {
            (Some(batch), _) => Flow::Continue(flushed(batch, stage, "period").into()),
            (None, Some(batch)) => Flow::Continue(flushed(batch, stage, "count").into()),
            (None, None) => Flow::Done,
        }
    }

    fn take_expired(&self, pending: &mut Pending, now: Instant) -> Option<Batch> {
        match pending.opened_at {
            Some(opened_at) if now >= opened_at + self.policy.max_period => pending.take(),
            _ => None,
        }
    }

    /// When the pending batch has to be flushed, if anything is pending.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.lock()
            .opened_at
            .map(|opened_at| opened_at + self.policy.max_period)
    }

    /// Take the pending batch if its period has elapsed by `now`.
    pub(crate) fn take_due(&self, now: Instant, stage: &str) -> Option<Batch> {
        let batch = self.take_expired(&mut self.lock(), now);
        batch.map(|batch| flushed(batch, stage, "period"))
    }

    /// Take whatever is pending, regardless of age.
    pub(crate) fn take_all(&self, stage: &str) -> Option<Batch> {
        let batch = self.lock().take();
        batch.map(|batch| flushed(batch, stage, "shutdown"))
    }

    /// Resolves once a new batch has been opened since the last call.
    pub(crate) async fn opened(&self) {
        self.opened.notified().await
    }
}

fn flushed(batch: Batch, stage: &str, trigger: &'static str) -> Batch {
    let labels = [("stage", stage.to_owned()), ("trigger", trigger.to_owned())];
    metrics::counter!(BATCH_FLUSHED, &labels).increment(1);
    metrics::histogram!(BATCH_SIZE, &labels).record(batch.len() as f64);
    batch
}
