use std::sync::Arc;

use pipeline_common::ack::{FilterReason, Outcome};
use pipeline_common::message::{Envelope, Message};
use thiserror::Error;

use crate::error::ProcessingError;
use crate::graph::Signals;
use crate::metrics_consts::MAPPING_DELETED;
use crate::processors::Flow;

/// What a transform decided for one message.
#[derive(Debug, Clone)]
pub enum Mapped {
    /// Continue unchanged.
    Keep,
    /// Continue with the replacement's payload and metadata.
    Replace(Message),
    /// Drop the message; it is acknowledged as filtered.
    Delete,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("{0}")]
    Failed(String),
    #[error("field {field} failed validation: {reason}")]
    Schema { field: String, reason: String },
}

impl From<MappingError> for ProcessingError {
    fn from(error: MappingError) -> Self {
        match error {
            MappingError::Failed(reason) => ProcessingError::TransformError(reason),
            MappingError::Schema { field, reason } => {
                ProcessingError::SchemaValidationError { field, reason }
            }
        }
    }
}

/// A pure function of one message. It must not block or perform I/O.
pub trait Transform: Send + Sync {
    fn apply(&self, message: &Message) -> Result<Mapped, MappingError>;
}

impl<F> Transform for F
where
    F: Fn(&Message) -> Result<Mapped, MappingError> + Send + Sync,
{
    fn apply(&self, message: &Message) -> Result<Mapped, MappingError> {
        self(message)
    }
}

pub(crate) struct Mapping {
    transform: Arc<dyn Transform>,
}

impl Mapping {
    pub(crate) fn new(transform: Arc<dyn Transform>) -> Self {
        Self { transform }
    }

    /// Apply the transform to every message of the envelope.
    ///
    /// A failure on any message sends the untouched envelope to the error
    /// path. Deletions only take effect when the whole envelope succeeded.
    pub(crate) fn process(&self, envelope: Envelope, stage: &str, signals: &Signals) -> Flow<'_> {
        let results: Result<Vec<Mapped>, MappingError> = envelope
            .messages()
            .iter()
            .map(|message| self.transform.apply(message))
            .collect();

        let results = match results {
            Ok(results) => results,
            Err(error) => return Flow::Divert(envelope, error.into()),
        };

        let was_batch = envelope.is_batch();
        let mut kept = Vec::with_capacity(results.len());
        for (message, mapped) in envelope.into_messages().into_iter().zip(results) {
            match mapped {
                Mapped::Keep => kept.push(message),
                Mapped::Replace(replacement) => kept.push(message.replace_content(replacement)),
                Mapped::Delete => {
                    metrics::counter!(MAPPING_DELETED, "stage" => stage.to_owned()).increment(1);
                    signals.settle_message(message, &Outcome::Filtered(FilterReason::Deleted));
                }
            }
        }

        match Envelope::regroup(was_batch, kept) {
            Some(envelope) => Flow::Continue(envelope),
            None => Flow::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::message::Batch;
    use serde_json::json;

    fn mapping<F>(f: F) -> Mapping
    where
        F: Fn(&Message) -> Result<Mapped, MappingError> + Send + Sync + 'static,
    {
        Mapping::new(Arc::new(f))
    }

    #[test]
    fn replacement_keeps_identity() {
        let signals = Signals::new();
        let mapping = mapping(|message: &Message| {
            Ok(Mapped::Replace(
                message.clone().with_payload(json!({"doubled": 2})),
            ))
        });
        let message = Message::new(json!({"n": 1}));
        let id = message.id();

        let Flow::Continue(Envelope::Message(mapped)) =
            mapping.process(message.into(), "test", &signals)
        else {
            panic!("expected a single message to continue");
        };
        assert_eq!(mapped.id(), id);
        assert_eq!(mapped.payload(), &json!({"doubled": 2}));
    }

    #[test]
    fn failure_diverts_the_original() {
        let signals = Signals::new();
        let mapping =
            mapping(|_: &Message| Err(MappingError::Failed("no such field".to_owned())));

        let flow = mapping.process(Message::new(json!({"n": 1})).into(), "test", &signals);
        let Flow::Divert(envelope, error) = flow else {
            panic!("expected the message to be diverted");
        };
        assert_eq!(envelope.messages()[0].payload(), &json!({"n": 1}));
        assert_eq!(error, ProcessingError::TransformError("no such field".to_owned()));
    }

    #[test]
    fn deletion_settles_as_filtered() {
        let signals = Signals::new();
        let mapping = mapping(|_: &Message| Ok(Mapped::Delete));
        let message = Message::new(json!({}));
        let probe = message.clone();

        assert!(matches!(
            mapping.process(message.into(), "test", &signals),
            Flow::Done
        ));
        assert!(probe.is_settled());
        assert_eq!(signals.summary(0).deleted, 1);
    }

    #[test]
    fn batches_lose_deleted_members_only() {
        let signals = Signals::new();
        let mapping = mapping(|message: &Message| match message.payload()["keep"].as_bool() {
            Some(true) => Ok(Mapped::Keep),
            _ => Ok(Mapped::Delete),
        });
        let batch = Batch::new(vec![
            Message::new(json!({"keep": true, "n": 1})),
            Message::new(json!({"keep": false, "n": 2})),
            Message::new(json!({"keep": true, "n": 3})),
        ])
        .expect("non-empty");

        let Flow::Continue(envelope) = mapping.process(batch.into(), "test", &signals) else {
            panic!("expected the batch to continue");
        };
        assert!(envelope.is_batch());
        let numbers: Vec<_> = envelope
            .messages()
            .iter()
            .map(|m| m.payload()["n"].clone())
            .collect();
        assert_eq!(numbers, vec![json!(1), json!(3)]);
    }

    #[test]
    fn one_failure_diverts_the_whole_batch() {
        let signals = Signals::new();
        let mapping = mapping(|message: &Message| match message.payload()["n"].as_i64() {
            Some(2) => Err(MappingError::Schema {
                field: "n".to_owned(),
                reason: "two is not allowed".to_owned(),
            }),
            _ => Ok(Mapped::Delete),
        });
        let batch = Batch::new(vec![
            Message::new(json!({"n": 1})),
            Message::new(json!({"n": 2})),
        ])
        .expect("non-empty");
        let first = batch.messages()[0].clone();

        let Flow::Divert(envelope, error) = mapping.process(batch.into(), "test", &signals)
        else {
            panic!("expected the batch to be diverted");
        };
        assert_eq!(envelope.len(), 2);
        assert_eq!(error.kind(), "schema_validation_error");
        assert!(!first.is_settled());
        assert_eq!(signals.summary(0).deleted, 0);
    }
}
