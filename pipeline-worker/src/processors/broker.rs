use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use futures::future::join_all;
use pipeline_common::ack::Outcome;
use pipeline_common::message::Envelope;
use pipeline_common::retry::RetryPolicy;
use pipeline_common::sink::{Sink, SinkError};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::ProcessingError;
use crate::graph::Signals;
use crate::metrics_consts::{BROKER_ATTEMPTS, BROKER_DURATION, BROKER_PARTIAL};
use crate::processors::Flow;

/// A named sink.
#[derive(Clone)]
pub struct Output {
    name: String,
    sink: Arc<dyn Sink>,
}

impl Output {
    pub fn new(name: &str, sink: Arc<dyn Sink>) -> Self {
        Self {
            name: name.to_owned(),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How many outputs must accept a fan-out delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    All,
    /// More than half of the outputs.
    Majority,
    AtLeast(usize),
}

impl Quorum {
    pub fn required(&self, outputs: usize) -> usize {
        match self {
            Quorum::All => outputs,
            Quorum::Majority => outputs / 2 + 1,
            Quorum::AtLeast(count) => *count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Send to every output concurrently.
    FanOutAll { quorum: Quorum },
    /// Send to one output at a time, rotating the starting output per envelope.
    FanOutAny,
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub outputs: Vec<Output>,
    pub policy: DeliveryPolicy,
    pub retry: RetryPolicy,
}

impl BrokerConfig {
    pub fn fan_out_all(outputs: Vec<Output>, quorum: Quorum, retry: RetryPolicy) -> Self {
        Self {
            outputs,
            policy: DeliveryPolicy::FanOutAll { quorum },
            retry,
        }
    }

    pub fn fan_out_any(outputs: Vec<Output>, retry: RetryPolicy) -> Self {
        Self {
            outputs,
            policy: DeliveryPolicy::FanOutAny,
            retry,
        }
    }

    pub fn single(output: Output, retry: RetryPolicy) -> Self {
        Self::fan_out_all(vec![output], Quorum::All, retry)
    }
}

pub(crate) struct Broker {
    config: BrokerConfig,
    rotation: AtomicUsize,
}

impl Broker {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            rotation: AtomicUsize::new(0),
        }
    }

    /// Deliver and settle as delivered, or send the envelope to the error path.
    pub(crate) async fn process(
        &self,
        envelope: Envelope,
        stage: &str,
        signals: &Signals,
    ) -> Flow<'_> {
        match self.deliver(&envelope, stage, signals).await {
            Ok(()) => {
                signals.settle(envelope, &Outcome::Delivered);
                Flow::Done
            }
            Err(error) => Flow::Divert(envelope, error),
        }
    }

    pub(crate) async fn deliver(
        &self,
        envelope: &Envelope,
        stage: &str,
        signals: &Signals,
    ) -> Result<(), ProcessingError> {
        let started = Instant::now();
        let delivered = match self.config.policy {
            DeliveryPolicy::FanOutAll { quorum } => {
                self.deliver_all(envelope, quorum, stage, signals).await
            }
            DeliveryPolicy::FanOutAny => self.deliver_any(envelope, stage, signals).await,
        };

        let status = if delivered.is_ok() { "ok" } else { "failed" };
        metrics::histogram!(BROKER_DURATION, "stage" => stage.to_owned(), "status" => status)
            .record(started.elapsed().as_secs_f64());
        delivered
    }

    async fn deliver_all(
        &self,
        envelope: &Envelope,
        quorum: Quorum,
        stage: &str,
        signals: &Signals,
    ) -> Result<(), ProcessingError> {
        let outputs = &self.config.outputs;
        let attempts = outputs
            .iter()
            .map(|output| self.deliver_to(output, envelope, stage, signals));
        let results = join_all(attempts).await;

        let failures: Vec<(&str, ProcessingError)> = outputs
            .iter()
            .zip(results)
            .filter_map(|(output, result)| result.err().map(|error| (output.name(), error)))
            .collect();
        let accepted = outputs.len() - failures.len();
        let required = quorum.required(outputs.len());

        if accepted >= required {
            if !failures.is_empty() {
                warn!(
                    stage,
                    accepted,
                    required,
                    failed = ?failures,
                    "delivery met its quorum with failing outputs"
                );
                metrics::counter!(BROKER_PARTIAL, "stage" => stage.to_owned()).increment(1);
            }
            return Ok(());
        }

        if failures
            .iter()
            .any(|(_, error)| *error == ProcessingError::ShutdownInProgress)
        {
            return Err(ProcessingError::ShutdownInProgress);
        }
        Err(ProcessingError::DeliveryFailed(format!(
            "{accepted} of {} outputs accepted, {required} required ({})",
            outputs.len(),
            describe(&failures)
        )))
    }

    /// Deliver to one output, retrying transient errors as the policy allows.
    async fn deliver_to(
        &self,
        output: &Output,
        envelope: &Envelope,
        stage: &str,
        signals: &Signals,
    ) -> Result<(), ProcessingError> {
        let retry = &self.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(output, envelope, stage, signals).await {
                Ok(()) => return Ok(()),
                Err(SinkError::Retryable(reason)) if retry.should_retry(attempt) => {
                    let interval = retry.retry_interval(attempt);
                    warn!(
                        stage,
                        output = output.name(),
                        attempt,
                        retry_in_ms = interval.as_millis() as u64,
                        %reason,
                        "delivery failed, retrying"
                    );
                    backoff(interval, signals).await?;
                }
                Err(error) => return Err(ProcessingError::DeliveryFailed(error.to_string())),
            }
        }
    }

    async fn deliver_any(
        &self,
        envelope: &Envelope,
        stage: &str,
        signals: &Signals,
    ) -> Result<(), ProcessingError> {
        let outputs = &self.config.outputs;
        let retry = &self.config.retry;
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        let mut exhausted = vec![false; outputs.len()];
        let mut failures = Vec::new();
        let mut round = 0;

        loop {
            round += 1;
            for offset in 0..outputs.len() {
                let index = (start + offset) % outputs.len();
                if exhausted[index] {
                    continue;
                }
                let output = &outputs[index];
                match self.attempt(output, envelope, stage, signals).await {
                    Ok(()) => return Ok(()),
                    Err(error) => {
                        if !matches!(error, SinkError::Retryable(_)) {
                            exhausted[index] = true;
                        }
                        failures.push((output.name(), ProcessingError::DeliveryFailed(error.to_string())));
                    }
                }
            }

            if exhausted.iter().all(|done| *done) || !retry.should_retry(round) {
                break;
            }
            backoff(retry.retry_interval(round), signals).await?;
        }

        Err(ProcessingError::DeliveryFailed(format!(
            "no output accepted after {round} rounds ({})",
            describe(&failures)
        )))
    }

    /// One send. A misconfigured output also stops the engine.
    async fn attempt(
        &self,
        output: &Output,
        envelope: &Envelope,
        stage: &str,
        signals: &Signals,
    ) -> Result<(), SinkError> {
        let result = output.sink.send(envelope).await;
        let status = match &result {
            Ok(()) => "ok",
            Err(SinkError::Retryable(_)) => "retryable",
            Err(SinkError::NonRetryable(_)) => "non_retryable",
            Err(SinkError::Misconfigured(reason)) => {
                error!(stage, output = output.name(), %reason, "output is misconfigured");
                signals.trip(format!("{stage}: output {} is misconfigured: {reason}", output.name()));
                "misconfigured"
            }
        };
        let labels = [
            ("stage", stage.to_owned()),
            ("output", output.name().to_owned()),
            ("status", status.to_owned()),
        ];
        metrics::counter!(BROKER_ATTEMPTS, &labels).increment(1);
        result
    }
}

/// Sleep between attempts unless the engine cancels outstanding waits.
async fn backoff(interval: time::Duration, signals: &Signals) -> Result<(), ProcessingError> {
    tokio::select! {
        biased;
        _ = signals.cancelled() => Err(ProcessingError::ShutdownInProgress),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

fn describe(failures: &[(&str, ProcessingError)]) -> String {
    failures
        .iter()
        .map(|(output, error)| format!("{output}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}
