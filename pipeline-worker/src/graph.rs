//! A pipeline compiled into linked stages.
//!
//! Every stage knows where its output goes (`Next`) and where its failures go
//! (`Fallback`). Nesting is resolved at compile time: the last stage of a
//! switch case continues after the switch, the last stage of a try body leaves
//! the try block, and stages inside a try body fall back to its catch pipeline.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use health::{HealthHandle, HealthRegistry};
use pipeline_common::ack::{FilterReason, Outcome};
use pipeline_common::cache::DedupeCache;
use pipeline_common::message::{Envelope, Message};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use crate::engine::{liveness_deadline, RunSummary};
use crate::error::{
    ConfigError, ProcessingError, ERROR_KIND_KEY, ERROR_REASON_KEY, ERROR_STAGE_KEY,
    ERROR_TIMESTAMP_KEY,
};
use crate::metrics_consts::{ENGINE_FATAL, ERRORS_DIVERTED};
use crate::pipeline::{stage_label, Pipeline, ProcessorConfig};
use crate::processors::broker::BrokerConfig;
use crate::processors::{
    Batcher, Broker, Dedupe, Flow, Mapping, Processor, RateLimit, Switch, TryCatch,
};

const ERROR_OUTPUT_LABEL: &str = "error_output";

#[derive(Default)]
struct Stats {
    delivered: AtomicU64,
    duplicates: AtomicU64,
    deleted: AtomicU64,
    dead_lettered: AtomicU64,
    failed: AtomicU64,
}

impl Stats {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Delivered => &self.delivered,
            Outcome::Filtered(FilterReason::Duplicate) => &self.duplicates,
            Outcome::Filtered(FilterReason::Deleted) => &self.deleted,
            Outcome::DeadLettered(_) => &self.dead_lettered,
            Outcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by every stage of one engine.
pub(crate) struct Signals {
    /// Interrupts waits: rate limiting and retry backoff.
    cancel: CancellationToken,
    /// Stops admission after an error the engine cannot recover from.
    fatal: CancellationToken,
    fatal_reason: Mutex<Option<String>>,
    stats: Stats,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
            fatal_reason: Mutex::new(None),
            stats: Stats::default(),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Record a fatal error. The first reason is kept.
    pub(crate) fn trip(&self, reason: String) {
        let mut fatal_reason = self
            .fatal_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if fatal_reason.is_none() {
            error!(%reason, "fatal pipeline error, stopping admission");
            metrics::counter!(ENGINE_FATAL).increment(1);
            *fatal_reason = Some(reason);
        }
        self.fatal.cancel();
    }

    pub(crate) fn fatal(&self) -> WaitForCancellationFuture<'_> {
        self.fatal.cancelled()
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.is_cancelled()
    }

    pub(crate) fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn settle(&self, envelope: Envelope, outcome: &Outcome) {
        for message in envelope.into_messages() {
            self.settle_message(message, outcome);
        }
    }

    pub(crate) fn settle_message(&self, message: Message, outcome: &Outcome) {
        if message.settle(outcome) {
            self.stats.record(outcome);
        }
    }

    pub(crate) fn summary(&self, received: u64) -> RunSummary {
        RunSummary {
            received,
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            deleted: self.stats.deleted.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

/// Where an envelope goes once a stage is done with it.
#[derive(Clone)]
pub(crate) enum Next {
    Stage(Arc<Stage>),
    /// Leave a try body: drop the checkpoint taken on entry, then continue.
    Leave(Arc<Next>),
    /// End of the top-level pipeline.
    Complete(Arc<Signals>),
}

impl Next {
    pub(crate) fn forward(&self, envelope: Envelope) -> BoxFuture<'_, ()> {
        async move {
            match self {
                Next::Stage(stage) => stage.process(envelope).await,
                Next::Leave(next) => {
                    next.forward(envelope.map_messages(Message::release_checkpoint))
                        .await
                }
                Next::Complete(signals) => signals.settle(envelope, &Outcome::Delivered),
            }
        }
        .boxed()
    }
}

/// Where an envelope goes when a stage fails it.
#[derive(Clone)]
pub(crate) enum Fallback {
    /// Inside a try body: roll back to the checkpoint and run the catch pipeline.
    Catch(Next),
    /// Top level with an error output configured.
    Output(Arc<Broker>, Arc<Signals>),
    /// Nowhere left to go: reject at the source.
    Reject(Arc<Signals>),
}

impl Fallback {
    fn route(&self) -> &'static str {
        match self {
            Fallback::Catch(_) => "catch",
            Fallback::Output(..) => "error_output",
            Fallback::Reject(_) => "reject",
        }
    }

    pub(crate) fn divert<'a>(
        &'a self,
        envelope: Envelope,
        error: ProcessingError,
        stage: &'a str,
    ) -> BoxFuture<'a, ()> {
        async move {
            let route = self.route();
            warn!(
                stage,
                route,
                kind = error.kind(),
                messages = envelope.len(),
                %error,
                "processing failed"
            );
            metrics::counter!(ERRORS_DIVERTED, "kind" => error.kind(), "route" => route)
                .increment(1);

            match self {
                Fallback::Catch(catch) => {
                    let envelope = envelope
                        .map_messages(|message| annotate(message.rollback(), &error, stage));
                    catch.forward(envelope).await
                }
                Fallback::Output(broker, signals) => {
                    let envelope =
                        envelope.map_messages(|message| annotate(message, &error, stage));
                    match broker.deliver(&envelope, ERROR_OUTPUT_LABEL, signals).await {
                        Ok(()) => {
                            signals.settle(envelope, &Outcome::DeadLettered(error.to_string()))
                        }
                        Err(output_error) => {
                            error!(stage, %error, %output_error, "error output rejected the envelope");
                            let reason = format!("{error}; error output failed: {output_error}");
                            signals.settle(envelope, &Outcome::Failed(reason));
                        }
                    }
                }
                Fallback::Reject(signals) => {
                    signals.settle(envelope, &Outcome::Failed(error.to_string()))
                }
            }
        }
        .boxed()
    }
}

fn annotate(message: Message, error: &ProcessingError, stage: &str) -> Message {
    message
        .with_metadata(ERROR_STAGE_KEY, stage)
        .with_metadata(ERROR_REASON_KEY, error.to_string())
        .with_metadata(ERROR_KIND_KEY, error.kind())
        .with_metadata(ERROR_TIMESTAMP_KEY, Utc::now().to_rfc3339())
}

pub(crate) struct Stage {
    label: String,
    processor: Processor,
    next: Next,
    fallback: Fallback,
    signals: Arc<Signals>,
}

impl Stage {
    async fn process(&self, envelope: Envelope) {
        let stage = self.label.as_str();
        let signals = self.signals.as_ref();

        let flow = match &self.processor {
            Processor::Mapping(mapping) => mapping.process(envelope, stage, signals),
            Processor::Switch(switch) => switch.process(envelope),
            Processor::Dedupe(dedupe) => dedupe.process(envelope, stage, signals).await,
            Processor::Batch(batcher) => batcher.process(envelope, stage),
            Processor::RateLimit(limit) => limit.process(envelope, stage, signals).await,
            Processor::TryCatch(try_catch) => try_catch.process(envelope),
            Processor::Broker(broker) => broker.process(envelope, stage, signals).await,
        };

        match flow {
            Flow::Continue(envelope) => self.next.forward(envelope).await,
            Flow::Enter(route, envelope) => route.forward(envelope).await,
            Flow::Divert(envelope, error) => self.fallback.divert(envelope, error, stage).await,
            Flow::Done => {}
        }
    }

    /// Flush this stage's batch once its period elapses, until `stop` fires.
    /// Whatever is pending at that point is flushed before returning.
    ///
    /// Period flushes run in their own tasks so a slow output downstream
    /// never holds back the next flush.
    async fn run_flush_timer(
        self: Arc<Self>,
        stop: CancellationToken,
        liveness: Option<HealthHandle>,
        heartbeat: time::Duration,
    ) {
        let Processor::Batch(batcher) = &self.processor else {
            return;
        };
        let mut heartbeat = tokio::time::interval(heartbeat);
        let mut flushing = JoinSet::new();

        loop {
            let deadline = batcher.deadline();
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = sleep_until(deadline) => {
                    if let Some(batch) = batcher.take_due(Instant::now(), &self.label) {
                        debug!(stage = self.label, messages = batch.len(), "batch period elapsed");
                        let stage = self.clone();
                        flushing.spawn(async move { stage.next.forward(batch.into()).await });
                    }
                }
                _ = batcher.opened() => {}
                Some(flushed) = flushing.join_next(), if !flushing.is_empty() => {
                    if let Err(join_error) = flushed {
                        error!(stage = self.label, %join_error, "batch flush failed");
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(liveness) = &liveness {
                        liveness.report_healthy();
                    }
                }
            }
        }

        if let Some(batch) = batcher.take_all(&self.label) {
            info!(stage = self.label, messages = batch.len(), "flushing pending batch");
            self.next.forward(batch.into()).await;
        }
        while let Some(flushed) = flushing.join_next().await {
            if let Err(join_error) = flushed {
                error!(stage = self.label, %join_error, "batch flush failed");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct FlushTimer {
    stage: String,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct Graph {
    head: Next,
    /// Batching stages, upstream first.
    batchers: Vec<Arc<Stage>>,
    caches: Vec<Arc<dyn DedupeCache>>,
    signals: Arc<Signals>,
}

impl Graph {
    pub(crate) fn compile(
        pipeline: &Pipeline,
        error_output: Option<&BrokerConfig>,
    ) -> Result<Self, ConfigError> {
        let signals = Arc::new(Signals::new());
        let fallback = match error_output {
            Some(config) => {
                Fallback::Output(Arc::new(Broker::new(config.clone())), signals.clone())
            }
            None => Fallback::Reject(signals.clone()),
        };

        let mut compiler = Compiler {
            signals: signals.clone(),
            batchers: Vec::new(),
            caches: Vec::new(),
        };
        let tail = Next::Complete(signals.clone());
        let head = compiler.compile(pipeline, "pipeline", tail, fallback)?;

        // Stages are compiled back to front.
        let mut batchers = compiler.batchers;
        batchers.reverse();

        Ok(Self {
            head,
            batchers,
            caches: compiler.caches,
            signals,
        })
    }

    pub(crate) fn signals(&self) -> &Arc<Signals> {
        &self.signals
    }

    /// Run one message through the pipeline until it settles or is held by a batch.
    pub(crate) async fn admit(&self, message: Message) {
        self.head.forward(message.into()).await
    }

    pub(crate) fn start_flush_timers(
        &self,
        liveness: Option<&HealthRegistry>,
        heartbeat: time::Duration,
    ) -> Vec<FlushTimer> {
        self.batchers
            .iter()
            .map(|stage| {
                let stop = CancellationToken::new();
                let handle = liveness.map(|registry| {
                    registry.register(
                        format!("flush_timer {}", stage.label),
                        liveness_deadline(heartbeat),
                    )
                });
                let task = stage.clone().run_flush_timer(stop.clone(), handle, heartbeat);
                FlushTimer {
                    stage: stage.label.clone(),
                    stop,
                    handle: tokio::spawn(task),
                }
            })
            .collect()
    }

    /// Stop the timers in order, so a flush from upstream still finds the
    /// downstream batches accepting.
    pub(crate) async fn stop_flush_timers(&self, timers: Vec<FlushTimer>) {
        for timer in timers {
            timer.stop.cancel();
            if let Err(join_error) = timer.handle.await {
                error!(stage = timer.stage, %join_error, "flush timer failed");
            }
        }
    }

    pub(crate) async fn release_caches(&self) {
        for cache in &self.caches {
            cache.release().await;
        }
    }
}

struct Compiler {
    signals: Arc<Signals>,
    batchers: Vec<Arc<Stage>>,
    caches: Vec<Arc<dyn DedupeCache>>,
}

impl Compiler {
    /// Link `pipeline`'s stages back to front, ending in `tail`.
    fn compile(
        &mut self,
        pipeline: &Pipeline,
        path: &str,
        tail: Next,
        fallback: Fallback,
    ) -> Result<Next, ConfigError> {
        let mut next = tail;
        for (index, config) in pipeline.stages().iter().enumerate().rev() {
            let label = stage_label(path, index, config);
            let processor = self.processor(config, &label, &next, &fallback)?;
            let is_batch = matches!(processor, Processor::Batch(_));
            let stage = Arc::new(Stage {
                label,
                processor,
                next,
                fallback: fallback.clone(),
                signals: self.signals.clone(),
            });
            if is_batch {
                self.batchers.push(stage.clone());
            }
            next = Next::Stage(stage);
        }
        Ok(next)
    }

    fn processor(
        &mut self,
        config: &ProcessorConfig,
        label: &str,
        next: &Next,
        fallback: &Fallback,
    ) -> Result<Processor, ConfigError> {
        let processor = match config {
            ProcessorConfig::Mapping(transform) => {
                Processor::Mapping(Mapping::new(transform.clone()))
            }
            ProcessorConfig::Switch(cases) => {
                let mut compiled = Vec::with_capacity(cases.len());
                for (index, case) in cases.iter().enumerate() {
                    let branch = self.compile(
                        case.pipeline(),
                        &format!("{label}/case{index}"),
                        next.clone(),
                        fallback.clone(),
                    )?;
                    compiled.push((case.predicate.clone(), branch));
                }
                Processor::Switch(Switch::new(compiled))
            }
            ProcessorConfig::Dedupe { policy, cache } => {
                self.caches.push(cache.clone());
                Processor::Dedupe(Dedupe::new(policy.clone(), cache.clone()))
            }
            ProcessorConfig::Batch(policy) => Processor::Batch(Batcher::new(*policy)),
            ProcessorConfig::RateLimit(policy) => {
                let quota = policy.quota().ok_or_else(|| ConfigError::InvalidParameter {
                    stage: label.to_owned(),
                    reason: "rate limit has no usable quota".to_owned(),
                })?;
                Processor::RateLimit(RateLimit::new(*policy, quota))
            }
            ProcessorConfig::TryCatch {
                try_pipeline,
                catch_pipeline,
            } => {
                let catch = self.compile(
                    catch_pipeline,
                    &format!("{label}/catch"),
                    next.clone(),
                    Fallback::Reject(self.signals.clone()),
                )?;
                let body = self.compile(
                    try_pipeline,
                    &format!("{label}/try"),
                    Next::Leave(Arc::new(next.clone())),
                    Fallback::Catch(catch),
                )?;
                Processor::TryCatch(TryCatch::new(body))
            }
            ProcessorConfig::Broker(config) => Processor::Broker(Broker::new(config.clone())),
        };
        Ok(processor)
    }
}
