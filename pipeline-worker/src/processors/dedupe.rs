use std::hash::Hasher;
use std::sync::Arc;
use std::time;

use pipeline_common::ack::{FilterReason, Outcome};
use pipeline_common::cache::{DedupeCache, Sighting};
use pipeline_common::duration_ms;
use pipeline_common::message::Envelope;
use serde::Deserialize;
use serde_json::Value;
use siphasher::sip128::{Hasher128, SipHasher13};
use tracing::debug;

use crate::error::ProcessingError;
use crate::graph::Signals;
use crate::metrics_consts::DEDUPE_RESULT;
use crate::processors::Flow;
use crate::schema::lookup;

fn default_max_entries() -> u64 {
    100_000
}

/// Drop messages whose key was already seen within `ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DedupePolicy {
    /// Dotted payload paths making up the key. Empty means the whole payload.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(with = "duration_ms")]
    pub ttl: time::Duration,
    /// Capacity of the in-process cache, when no other cache is supplied.
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl DedupePolicy {
    pub fn new(fields: &[&str], ttl: time::Duration) -> Self {
        Self {
            fields: fields.iter().map(|field| (*field).to_owned()).collect(),
            ttl,
            max_entries: default_max_entries(),
        }
    }

    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// Hash the configured fields of `payload`. Missing fields hash like null, so
/// two messages both lacking a field share that part of the key.
pub fn dedupe_key(fields: &[String], payload: &Value) -> u128 {
    let mut hasher = SipHasher13::new();
    if fields.is_empty() {
        hasher.write(payload.to_string().as_bytes());
    }
    for field in fields {
        hasher.write(field.as_bytes());
        hasher.write_u8(0xff);
        let value = lookup(payload, field).unwrap_or(&Value::Null);
        hasher.write(value.to_string().as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish128().as_u128()
}

pub(crate) struct Dedupe {
    policy: DedupePolicy,
    cache: Arc<dyn DedupeCache>,
}

impl Dedupe {
    pub(crate) fn new(policy: DedupePolicy, cache: Arc<dyn DedupeCache>) -> Self {
        Self { policy, cache }
    }

    pub(crate) async fn process(
        &self,
        envelope: Envelope,
        stage: &str,
        signals: &Signals,
    ) -> Flow<'_> {
        let mut sightings = Vec::with_capacity(envelope.len());
        for message in envelope.messages() {
            let key = dedupe_key(&self.policy.fields, message.payload());
            match self.cache.check_and_set(key, self.policy.ttl).await {
                Ok(sighting) => sightings.push(sighting),
                Err(error) => {
                    metrics::counter!(DEDUPE_RESULT, "stage" => stage.to_owned(), "result" => "error")
                        .increment(1);
                    signals.trip(format!("{stage}: {error}"));
                    return Flow::Divert(envelope, ProcessingError::DedupeCacheError(error.to_string()));
                }
            }
        }

        let was_batch = envelope.is_batch();
        let mut kept = Vec::with_capacity(sightings.len());
        for (message, sighting) in envelope.into_messages().into_iter().zip(sightings) {
            let result = match sighting {
                Sighting::New => {
                    kept.push(message);
                    "new"
                }
                Sighting::Duplicate => {
                    debug!(stage, message_id = %message.id(), "dropping duplicate");
                    signals.settle_message(message, &Outcome::Filtered(FilterReason::Duplicate));
                    "duplicate"
                }
            };
            metrics::counter!(DEDUPE_RESULT, "stage" => stage.to_owned(), "result" => result)
                .increment(1);
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
    use async_trait::async_trait;
    use pipeline_common::cache::{CacheError, MemoryCache};
    use pipeline_common::message::{Batch, Message};
    use serde_json::json;

    const HOUR: time::Duration = time::Duration::from_secs(3600);

    fn dedupe(fields: &[&str]) -> Dedupe {
        Dedupe::new(
            DedupePolicy::new(fields, HOUR),
            Arc::new(MemoryCache::new(1_000)),
        )
    }

    #[test]
    fn keys_follow_the_selected_fields() {
        let fields = vec!["user.id".to_owned(), "event".to_owned()];
        let a = json!({"user": {"id": 1}, "event": "click", "ts": 1});
        let b = json!({"user": {"id": 1}, "event": "click", "ts": 2});
        let c = json!({"user": {"id": 2}, "event": "click", "ts": 1});

        assert_eq!(dedupe_key(&fields, &a), dedupe_key(&fields, &b));
        assert_ne!(dedupe_key(&fields, &a), dedupe_key(&fields, &c));
        assert_ne!(dedupe_key(&[], &a), dedupe_key(&[], &b));
    }

    #[test]
    fn missing_fields_hash_as_null() {
        let fields = vec!["id".to_owned()];
        assert_eq!(
            dedupe_key(&fields, &json!({"other": 1})),
            dedupe_key(&fields, &json!({"id": null}))
        );
        assert_ne!(
            dedupe_key(&fields, &json!({"id": "null"})),
            dedupe_key(&fields, &json!({"id": null}))
        );
    }

    #[tokio::test]
    async fn second_copy_is_filtered() {
        let signals = Signals::new();
        let dedupe = dedupe(&["id"]);

        let first = dedupe
            .process(Message::new(json!({"id": 1})).into(), "test", &signals)
            .await;
        assert!(matches!(first, Flow::Continue(_)));

        let copy = Message::new(json!({"id": 1}));
        let probe = copy.clone();
        let second = dedupe.process(copy.into(), "test", &signals).await;
        assert!(matches!(second, Flow::Done));
        assert!(probe.is_settled());
        assert_eq!(signals.summary(0).duplicates, 1);
    }

    #[tokio::test]
    async fn duplicates_inside_a_batch_are_removed() {
        let signals = Signals::new();
        let dedupe = dedupe(&["id"]);
        let batch = Batch::new(vec![
            Message::new(json!({"id": 1})),
            Message::new(json!({"id": 2})),
            Message::new(json!({"id": 1})),
        ])
        .expect("non-empty");

        let Flow::Continue(envelope) = dedupe.process(batch.into(), "test", &signals).await else {
            panic!("expected the batch to continue");
        };
        assert_eq!(envelope.len(), 2);
        assert!(envelope.is_batch());
    }

    struct Unreachable;

    #[async_trait]
    impl DedupeCache for Unreachable {
        async fn check_and_set(
            &self,
            _key: u128,
            _ttl: time::Duration,
        ) -> Result<Sighting, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_owned()))
        }
    }

    #[tokio::test]
    async fn cache_failure_is_fatal() {
        let signals = Signals::new();
        let dedupe = Dedupe::new(DedupePolicy::new(&["id"], HOUR), Arc::new(Unreachable));

        let flow = dedupe
            .process(Message::new(json!({"id": 1})).into(), "test", &signals)
            .await;
        assert!(matches!(flow, Flow::Divert(_, ProcessingError::DedupeCacheError(_))));
        assert!(signals.fatal_reason().is_some());
    }
}
