use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ack::{AckHandle, Acknowledger, Outcome};

/// Scalar values carried in message metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Int(i) => write!(f, "{i}"),
            MetaValue::Float(x) => write!(f, "{x}"),
            MetaValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<u32> for MetaValue {
    fn from(value: u32) -> Self {
        MetaValue::Int(i64::from(value))
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

#[derive(Debug, Clone)]
struct Checkpoint {
    payload: Arc<Value>,
    metadata: Arc<Metadata>,
}

/// The unit of data flowing through a pipeline.
///
/// Messages are immutable: every change produces a replacement that shares
/// the untouched parts (payload and metadata are copy-on-write) and the
/// acknowledgement handle of the original.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    payload: Arc<Value>,
    metadata: Arc<Metadata>,
    checkpoints: Vec<Checkpoint>,
    ack: AckHandle,
}

impl Message {
    /// A message that is not tied to any source.
    pub fn new(payload: Value) -> Self {
        let id = Uuid::now_v7();
        Self::build(id, payload, AckHandle::detached(id))
    }

    /// A message whose terminal outcome is reported to `acknowledger`.
    pub fn with_acknowledger(payload: Value, acknowledger: Arc<dyn Acknowledger>) -> Self {
        let id = Uuid::now_v7();
        Self::build(id, payload, AckHandle::new(id, acknowledger))
    }

    fn build(id: Uuid, payload: Value, ack: AckHandle) -> Self {
        Self {
            id,
            payload: Arc::new(payload),
            metadata: Default::default(),
            checkpoints: Vec::new(),
            ack,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Arc::new(payload);
        self
    }

    /// Edit a copy of the payload. The previous payload is left untouched for
    /// anyone else holding it.
    pub fn update_payload<F>(mut self, update: F) -> Self
    where
        F: FnOnce(&mut Value),
    {
        update(Arc::make_mut(&mut self.payload));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        Arc::make_mut(&mut self.metadata).insert(key.into(), value.into());
        self
    }

    pub fn without_metadata(mut self, key: &str) -> Self {
        if self.metadata.contains_key(key) {
            Arc::make_mut(&mut self.metadata).remove(key);
        }
        self
    }

    /// Take payload and metadata from `replacement`, keeping this message's
    /// identity, checkpoints and acknowledgement handle.
    pub fn replace_content(mut self, replacement: Message) -> Self {
        self.payload = replacement.payload.clone();
        self.metadata = replacement.metadata.clone();
        self
    }

    /// Size of the payload once serialized as compact JSON.
    pub fn byte_size(&self) -> usize {
        self.payload.to_string().len()
    }

    /// Remember the current content so it can be restored with `rollback`.
    pub fn checkpoint(mut self) -> Self {
        self.checkpoints.push(Checkpoint {
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        });
        self
    }

    /// Forget the most recent checkpoint, keeping the current content.
    pub fn release_checkpoint(mut self) -> Self {
        self.checkpoints.pop();
        self
    }

    /// Restore the content saved by the most recent checkpoint and forget it.
    /// Without a checkpoint the message is returned unchanged.
    pub fn rollback(mut self) -> Self {
        if let Some(checkpoint) = self.checkpoints.pop() {
            self.payload = checkpoint.payload;
            self.metadata = checkpoint.metadata;
        }
        self
    }

    pub fn checkpoint_depth(&self) -> usize {
        self.checkpoints.len()
    }

    /// Report the terminal outcome to the source. Only the first settlement of
    /// a message and its replacements counts.
    pub fn settle(self, outcome: &Outcome) -> bool {
        self.ack.settle(outcome)
    }

    pub fn is_settled(&self) -> bool {
        self.ack.is_settled()
    }
}

/// An ordered, non-empty group of messages delivered and settled together.
#[derive(Debug, Clone)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    /// Returns None for an empty list: a batch always holds at least one message.
    pub fn new(messages: Vec<Message>) -> Option<Self> {
        if messages.is_empty() {
            None
        } else {
            Some(Self { messages })
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// What travels between stages and what outputs receive.
#[derive(Debug, Clone)]
pub enum Envelope {
    Message(Message),
    Batch(Batch),
}

impl Envelope {
    pub fn messages(&self) -> &[Message] {
        match self {
            Envelope::Message(message) => std::slice::from_ref(message),
            Envelope::Batch(batch) => batch.messages(),
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Envelope::Message(message) => vec![message],
            Envelope::Batch(batch) => batch.into_messages(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Envelope::Batch(_))
    }

    pub fn byte_size(&self) -> usize {
        self.messages().iter().map(Message::byte_size).sum()
    }

    /// Apply `f` to every message, keeping the envelope's shape.
    pub fn map_messages<F>(self, mut f: F) -> Self
    where
        F: FnMut(Message) -> Message,
    {
        match self {
            Envelope::Message(message) => Envelope::Message(f(message)),
            Envelope::Batch(batch) => Envelope::Batch(Batch {
                messages: batch.messages.into_iter().map(f).collect(),
            }),
        }
    }

    /// Rebuild an envelope of the same shape from what is left of its messages.
    /// Returns None when nothing is left.
    pub fn regroup(was_batch: bool, mut messages: Vec<Message>) -> Option<Self> {
        if was_batch {
            Batch::new(messages).map(Envelope::Batch)
        } else {
            messages.pop().map(Envelope::Message)
        }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Envelope::Message(message)
    }
}

impl From<Batch> for Envelope {
    fn from(batch: Batch) -> Self {
        Envelope::Batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replacements_do_not_touch_the_original() {
        let original = Message::new(json!({"user": {"email": "a@b.c"}}));
        let redacted = original.clone().update_payload(|payload| {
            payload["user"]["email"] = json!("[redacted]");
        });

        assert_eq!(original.payload()["user"]["email"], json!("a@b.c"));
        assert_eq!(redacted.payload()["user"]["email"], json!("[redacted]"));
        assert_eq!(original.id(), redacted.id());
    }

    #[test]
    fn metadata_is_copy_on_write() {
        let original = Message::new(json!({})).with_metadata("attempt", 1u32);
        let bumped = original.clone().with_metadata("attempt", 2u32);

        assert_eq!(original.meta("attempt"), Some(&MetaValue::Int(1)));
        assert_eq!(bumped.meta("attempt"), Some(&MetaValue::Int(2)));
        assert_eq!(bumped.without_metadata("attempt").meta("attempt"), None);
    }

    #[test]
    fn rollback_restores_the_checkpoint() {
        let message = Message::new(json!({"v": 1}))
            .checkpoint()
            .with_payload(json!({"v": 2}))
            .with_metadata("touched", true);
        assert_eq!(message.checkpoint_depth(), 1);

        let restored = message.rollback();
        assert_eq!(restored.payload(), &json!({"v": 1}));
        assert_eq!(restored.meta("touched"), None);
        assert_eq!(restored.checkpoint_depth(), 0);

        let untouched = Message::new(json!({"v": 3})).rollback();
        assert_eq!(untouched.payload(), &json!({"v": 3}));
    }

    #[test]
    fn release_keeps_current_content() {
        let message = Message::new(json!({"v": 1}))
            .checkpoint()
            .with_payload(json!({"v": 2}))
            .release_checkpoint();
        assert_eq!(message.payload(), &json!({"v": 2}));
        assert_eq!(message.checkpoint_depth(), 0);
    }

    #[test]
    fn replace_content_keeps_identity() {
        let original = Message::new(json!({"v": 1}));
        let replacement = Message::new(json!({"v": 2})).with_metadata("k", "v");
        let merged = original.clone().replace_content(replacement);

        assert_eq!(merged.id(), original.id());
        assert_eq!(merged.payload(), &json!({"v": 2}));
        assert_eq!(merged.meta("k"), Some(&MetaValue::from("v")));
    }

    #[test]
    fn batches_are_never_empty() {
        assert!(Batch::new(vec![]).is_none());
        assert!(Envelope::regroup(true, vec![]).is_none());
        assert!(Envelope::regroup(false, vec![]).is_none());

        let batch = Envelope::regroup(true, vec![Message::new(json!(1)), Message::new(json!(2))])
            .expect("two messages make a batch");
        assert!(batch.is_batch());
        assert_eq!(batch.len(), 2);
        let values: Vec<_> = batch.messages().iter().map(|m| m.payload().clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2)]);
    }

    #[test]
    fn byte_size_is_compact_json() {
        let message = Message::new(json!({"a": 1}));
        assert_eq!(message.byte_size(), r#"{"a":1}"#.len());
        let envelope = Envelope::from(message);
        assert_eq!(envelope.byte_size(), 7);
    }
}
