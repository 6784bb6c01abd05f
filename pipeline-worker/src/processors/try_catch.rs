use pipeline_common::message::{Envelope, Message};

use crate::graph::Next;
use crate::processors::Flow;

/// Entry point of a try/catch block.
///
/// The try body's last stage continues through `Next::Leave`, which drops the
/// checkpoint taken here. Errors inside the body are routed to the catch
/// pipeline by the body's stages themselves, after rolling back to that
/// checkpoint.
pub(crate) struct TryCatch {
    body: Next,
}

impl TryCatch {
    pub(crate) fn new(body: Next) -> Self {
        Self { body }
    }

    pub(crate) fn process(&self, envelope: Envelope) -> Flow<'_> {
        Flow::Enter(&self.body, envelope.map_messages(Message::checkpoint))
    }
}
