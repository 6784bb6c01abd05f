use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

const MESSAGES_SETTLED: &str = "pipeline_messages_settled_total";
const MESSAGES_SETTLED_TWICE: &str = "pipeline_messages_settled_twice_total";
const MESSAGES_AUTO_REJECTED: &str = "pipeline_messages_auto_rejected_total";

/// Why a message was dropped on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    Duplicate,
    Deleted,
}

/// The terminal outcome of a message. Every message that enters a pipeline
/// ends with exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Reached an output, or the end of the pipeline.
    Delivered,
    /// Dropped on purpose; acknowledged without being forwarded.
    Filtered(FilterReason),
    /// Failed processing but was written to the error output.
    DeadLettered(String),
    /// Failed permanently; rejected at the source.
    Failed(String),
}

impl Outcome {
    /// Whether the source sees an acknowledgement (as opposed to a rejection).
    pub fn is_ack(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Filtered(FilterReason::Duplicate) => "duplicate",
            Outcome::Filtered(FilterReason::Deleted) => "deleted",
            Outcome::DeadLettered(_) => "dead_lettered",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Acknowledgement callbacks of the source a message came from.
pub trait Acknowledger: Send + Sync {
    fn ack(&self, message_id: Uuid, outcome: &Outcome);
    fn reject(&self, message_id: Uuid, reason: &str);
}

struct AckState {
    message_id: Uuid,
    /// None for messages that were not produced by a source.
    acknowledger: Option<Arc<dyn Acknowledger>>,
    settled: AtomicBool,
}

/// Shared by every replacement of a message, so that whichever copy reaches a
/// terminal outcome first settles it at the source.
#[derive(Clone)]
pub struct AckHandle {
    state: Arc<AckState>,
}

impl AckHandle {
    pub fn new(message_id: Uuid, acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self::build(message_id, Some(acknowledger))
    }

    pub fn detached(message_id: Uuid) -> Self {
        Self::build(message_id, None)
    }

    fn build(message_id: Uuid, acknowledger: Option<Arc<dyn Acknowledger>>) -> Self {
        Self {
            state: Arc::new(AckState {
                message_id,
                acknowledger,
                settled: AtomicBool::new(false),
            }),
        }
    }

    /// Settle the message. Returns false, and does nothing, if it was already settled.
    pub fn settle(&self, outcome: &Outcome) -> bool {
        if self.state.settled.swap(true, Ordering::AcqRel) {
            warn!(
                message_id = %self.state.message_id,
                outcome = outcome.label(),
                "message already settled"
            );
            metrics::counter!(MESSAGES_SETTLED_TWICE).increment(1);
            return false;
        }

        if let Some(acknowledger) = &self.state.acknowledger {
            match outcome {
                Outcome::Failed(reason) => acknowledger.reject(self.state.message_id, reason),
                other => acknowledger.ack(self.state.message_id, other),
            }
        }

        debug!(
            message_id = %self.state.message_id,
            outcome = outcome.label(),
            "settled message"
        );
        metrics::counter!(MESSAGES_SETTLED, "outcome" => outcome.label()).increment(1);
        true
    }

    pub fn is_settled(&self) -> bool {
        self.state.settled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("message_id", &self.state.message_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Drop for AckState {
    fn drop(&mut self) {
        if *self.settled.get_mut() {
            return;
        }
        let Some(acknowledger) = &self.acknowledger else {
            return;
        };

        error!(
            message_id = %self.message_id,
            "message dropped without acknowledgement, rejecting"
        );
        acknowledger.reject(self.message_id, "dropped without acknowledgement");
        metrics::counter!(MESSAGES_AUTO_REJECTED).increment(1);
    }
}
