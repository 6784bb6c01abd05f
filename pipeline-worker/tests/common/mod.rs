#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pipeline_common::ack::{Acknowledger, Outcome};
use pipeline_common::message::{Envelope, Message};
use pipeline_common::retry::RetryPolicy;
use pipeline_common::sink::{Sink, SinkError};
use pipeline_worker::processors::broker::{BrokerConfig, Output};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Keeps everything it receives, with the wall-clock time of each message.
#[derive(Default)]
pub struct MemorySink {
    envelopes: Mutex<Vec<Envelope>>,
    arrivals: Mutex<Vec<Instant>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.envelopes()
            .into_iter()
            .flat_map(Envelope::into_messages)
            .collect()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.messages()
            .iter()
            .map(|message| message.payload().clone())
            .collect()
    }

    /// One entry per message, in arrival order.
    pub fn arrivals(&self) -> Vec<Instant> {
        self.arrivals.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn send(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let now = Instant::now();
        self.arrivals
            .lock()
            .unwrap()
            .extend(std::iter::repeat(now).take(envelope.len()));
        self.envelopes.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Stalls on its first delivery, then behaves like a `MemorySink`.
pub struct SlowFirstSink {
    delay: Duration,
    calls: AtomicUsize,
    inner: Arc<MemorySink>,
}

impl SlowFirstSink {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            inner: MemorySink::new(),
        })
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.inner.envelopes()
    }
}

#[async_trait]
impl Sink for SlowFirstSink {
    async fn send(&self, envelope: &Envelope) -> Result<(), SinkError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.send(envelope).await
    }
}

/// Fails every delivery with the same error.
pub struct FailingSink {
    error: SinkError,
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new(error: SinkError) -> Arc<Self> {
        Arc::new(Self {
            error,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FailingSink {
    async fn send(&self, _envelope: &Envelope) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Records what the source was told about each message.
#[derive(Default)]
pub struct RecordingAcker {
    acks: Mutex<Vec<(Uuid, Outcome)>>,
    rejects: Mutex<Vec<(Uuid, String)>>,
}

impl RecordingAcker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acks(&self) -> Vec<(Uuid, Outcome)> {
        self.acks.lock().unwrap().clone()
    }

    pub fn rejects(&self) -> Vec<(Uuid, String)> {
        self.rejects.lock().unwrap().clone()
    }

    /// How many times each message was settled.
    pub fn settlements(&self) -> HashMap<Uuid, usize> {
        let mut counts = HashMap::new();
        for (id, _) in self.acks() {
            *counts.entry(id).or_insert(0) += 1;
        }
        for (id, _) in self.rejects() {
            *counts.entry(id).or_insert(0) += 1;
        }
        counts
    }
}

impl Acknowledger for RecordingAcker {
    fn ack(&self, message_id: Uuid, outcome: &Outcome) {
        self.acks.lock().unwrap().push((message_id, outcome.clone()));
    }

    fn reject(&self, message_id: Uuid, reason: &str) {
        self.rejects
            .lock()
            .unwrap()
            .push((message_id, reason.to_owned()));
    }
}

pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::build(1, Duration::from_millis(1))
        .max_attempts(max_attempts)
        .provide()
}

pub fn to(name: &str, sink: Arc<dyn Sink>) -> BrokerConfig {
    BrokerConfig::single(Output::new(name, sink), quick_retry(1))
}

/// Send payloads tied to `acker`, returning the ids of the messages sent.
pub async fn feed(
    sender: &mpsc::Sender<Message>,
    acker: &Arc<RecordingAcker>,
    payloads: impl IntoIterator<Item = Value>,
) -> Vec<Uuid> {
    let acknowledger: Arc<dyn Acknowledger> = acker.clone();
    let mut ids = Vec::new();
    for payload in payloads {
        let message = Message::with_acknowledger(payload, acknowledger.clone());
        ids.push(message.id());
        sender.send(message).await.expect("engine is receiving");
    }
    ids
}
