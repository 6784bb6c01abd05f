use std::num::NonZeroU32;
use std::time;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use pipeline_common::duration_ms;
use pipeline_common::message::Envelope;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ProcessingError;
use crate::graph::Signals;
use crate::metrics_consts::{RATE_LIMIT_EXCEEDED, RATE_LIMIT_WAIT};
use crate::processors::Flow;

/// What one token pays for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateUnit {
    #[default]
    Messages,
    Bytes,
}

/// Token bucket: `rate` tokens per `interval`, holding at most `burst`.
/// A message waits up to `timeout` for its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitPolicy {
    pub rate: u32,
    #[serde(with = "duration_ms")]
    pub interval: time::Duration,
    pub burst: u32,
    #[serde(default)]
    pub unit: RateUnit,
    #[serde(with = "duration_ms")]
    pub timeout: time::Duration,
}

impl RateLimitPolicy {
    pub fn per_second(rate: u32, burst: u32, timeout: time::Duration) -> Self {
        Self {
            rate,
            interval: time::Duration::from_secs(1),
            burst,
            unit: RateUnit::Messages,
            timeout,
        }
    }

    pub fn unit(mut self, unit: RateUnit) -> Self {
        self.unit = unit;
        self
    }

    /// None when the policy cannot produce a single token.
    pub(crate) fn quota(&self) -> Option<Quota> {
        let period = self.interval.checked_div(self.rate)?;
        let burst = NonZeroU32::new(self.burst)?;
        Quota::with_period(period).map(|quota| quota.allow_burst(burst))
    }
}

pub(crate) struct RateLimit {
    policy: RateLimitPolicy,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimit {
    pub(crate) fn new(policy: RateLimitPolicy, quota: Quota) -> Self {
        Self {
            policy,
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Tokens needed for this envelope: its message count or its size.
    fn cost(&self, envelope: &Envelope) -> NonZeroU32 {
        let cost = match self.policy.unit {
            RateUnit::Messages => envelope.len(),
            RateUnit::Bytes => envelope.byte_size(),
        };
        NonZeroU32::new(u32::try_from(cost).unwrap_or(u32::MAX)).unwrap_or(NonZeroU32::MIN)
    }

    pub(crate) async fn process(
        &self,
        envelope: Envelope,
        stage: &str,
        signals: &Signals,
    ) -> Flow<'_> {
        let cost = self.cost(&envelope);
        let started = Instant::now();

        let ready = tokio::select! {
            biased;
            _ = signals.cancelled() => {
                return Flow::Divert(envelope, ProcessingError::ShutdownInProgress);
            }
            ready = tokio::time::timeout(self.policy.timeout, self.limiter.until_n_ready(cost)) => ready,
        };

        let waited = started.elapsed();
        match ready {
            Ok(Ok(())) => {
                metrics::histogram!(RATE_LIMIT_WAIT, "stage" => stage.to_owned())
                    .record(waited.as_secs_f64());
                Flow::Continue(envelope)
            }
            Ok(Err(insufficient)) => {
                warn!(stage, cost = cost.get(), %insufficient, "envelope costs more than the bucket holds");
                metrics::counter!(RATE_LIMIT_EXCEEDED, "stage" => stage.to_owned()).increment(1);
                Flow::Divert(envelope, ProcessingError::RateLimitExceeded { waited })
            }
            Err(_) => {
                metrics::counter!(RATE_LIMIT_EXCEEDED, "stage" => stage.to_owned()).increment(1);
                Flow::Divert(envelope, ProcessingError::RateLimitExceeded { waited })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::message::{Batch, Message};
    use serde_json::json;

    fn limiter(policy: RateLimitPolicy) -> RateLimit {
        RateLimit::new(policy, policy.quota().expect("valid quota"))
    }

    #[test]
    fn degenerate_policies_have_no_quota() {
        let timeout = time::Duration::from_secs(1);
        assert!(RateLimitPolicy::per_second(0, 1, timeout).quota().is_none());
        assert!(RateLimitPolicy::per_second(1, 0, timeout).quota().is_none());
        assert!(RateLimitPolicy::per_second(10, 5, timeout).quota().is_some());
    }

    #[test]
    fn cost_follows_the_unit() {
        let policy = RateLimitPolicy::per_second(10, 1_000, time::Duration::from_secs(1));
        let batch: Envelope = Batch::new(vec![Message::new(json!(1)), Message::new(json!(22))])
            .expect("non-empty")
            .into();

        assert_eq!(limiter(policy).cost(&batch).get(), 2);
        assert_eq!(limiter(policy.unit(RateUnit::Bytes)).cost(&batch).get(), 3);
    }

    #[tokio::test]
    async fn burst_passes_then_times_out() {
        let signals = Signals::new();
        let policy = RateLimitPolicy::per_second(1, 2, time::Duration::from_millis(50));
        let limit = limiter(policy);

        for _ in 0..2 {
            let flow = limit
                .process(Message::new(json!({})).into(), "test", &signals)
                .await;
            assert!(matches!(flow, Flow::Continue(_)));
        }

        let flow = limit
            .process(Message::new(json!({})).into(), "test", &signals)
            .await;
        assert!(matches!(
            flow,
            Flow::Divert(_, ProcessingError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn waits_for_the_next_token() {
        let signals = Signals::new();
        let policy = RateLimitPolicy::per_second(20, 1, time::Duration::from_secs(1));
        let limit = limiter(policy);
        let started = std::time::Instant::now();

        for _ in 0..3 {
            let flow = limit
                .process(Message::new(json!({})).into(), "test", &signals)
                .await;
            assert!(matches!(flow, Flow::Continue(_)));
        }

        // One token up front, two more at 50ms intervals.
        assert!(started.elapsed() >= time::Duration::from_millis(90));
    }

    #[tokio::test]
    async fn oversized_envelopes_fail_immediately() {
        let signals = Signals::new();
        let policy = RateLimitPolicy::per_second(100, 2, time::Duration::from_secs(5));
        let limit = limiter(policy.unit(RateUnit::Bytes));

        let flow = limit
            .process(Message::new(json!({"big": "payload"})).into(), "test", &signals)
            .await;
        assert!(matches!(
            flow,
            Flow::Divert(_, ProcessingError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let signals = Signals::new();
        let policy = RateLimitPolicy::per_second(1, 1, time::Duration::from_secs(30));
        let limit = limiter(policy);
        limit
            .process(Message::new(json!({})).into(), "test", &signals)
            .await;

        signals.cancel();
        let flow = limit
            .process(Message::new(json!({})).into(), "test", &signals)
            .await;
        assert!(matches!(
            flow,
            Flow::Divert(_, ProcessingError::ShutdownInProgress)
        ));
    }
}
