use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::info;

use crate::message::Envelope;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("transient error, delivery may be retried: {0}")]
    Retryable(String),
    #[error("delivery rejected and cannot be retried: {0}")]
    NonRetryable(String),
    #[error("output is misconfigured: {0}")]
    Misconfigured(String),
}

/// An output: receives single messages or batches.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), SinkError>;
}

/// Logs every delivery. Useful as a default output and for local runs.
pub struct PrintSink {
    name: String,
}

impl PrintSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl Sink for PrintSink {
    async fn send(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let labels = [("output", self.name.clone())];
        match envelope {
            Envelope::Message(message) => {
                info!(output = self.name, id = %message.id(), payload = %message.payload(), "message");
            }
            Envelope::Batch(batch) => {
                let span = tracing::span!(tracing::Level::INFO, "batch", output = self.name);
                let _enter = span.enter();

                histogram!("pipeline_print_sink_batch_size", &labels).record(batch.len() as f64);
                for message in batch.messages() {
                    info!(id = %message.id(), payload = %message.payload(), "message");
                }
            }
        }
        counter!("pipeline_print_sink_messages_total", &labels).increment(envelope.len() as u64);

        Ok(())
    }
}
