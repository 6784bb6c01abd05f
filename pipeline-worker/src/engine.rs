use std::sync::Arc;
use std::time;

use health::{ComponentStatus, HealthHandle, HealthRegistry};
use pipeline_common::ack::Outcome;
use pipeline_common::source::Source;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ConfigError, EngineError, ProcessingError};
use crate::graph::{Graph, Signals};
use crate::metrics_consts::{ENGINE_SATURATION, MESSAGES_RECEIVED};
use crate::pipeline::{validate_broker, Pipeline};
use crate::processors::broker::BrokerConfig;

/// How many outcomes of each kind a run produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub deleted: u64,
    pub dead_lettered: u64,
    pub failed: u64,
}

impl RunSummary {
    /// Messages that reached a terminal outcome.
    pub fn settled(&self) -> u64 {
        self.delivered + self.duplicates + self.deleted + self.dead_lettered + self.failed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Messages processed at the same time. Admission stops while all are busy.
    pub max_concurrent_messages: usize,
    /// How long shutdown waits for in-flight messages and pending batch
    /// flushes before cancelling their waits.
    pub drain_timeout: time::Duration,
    /// How often the engine and its batch timers report liveness.
    pub heartbeat_interval: time::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 64,
            drain_timeout: time::Duration::from_secs(30),
            heartbeat_interval: time::Duration::from_secs(5),
        }
    }
}

/// A component is considered stalled after missing three heartbeats.
pub(crate) fn liveness_deadline(heartbeat: time::Duration) -> ::time::Duration {
    let millis = i64::try_from(heartbeat.as_millis().saturating_mul(3)).unwrap_or(i64::MAX);
    ::time::Duration::milliseconds(millis)
}

pub struct EngineBuilder {
    pipeline: Pipeline,
    error_output: Option<BrokerConfig>,
    settings: EngineSettings,
    liveness: Option<HealthRegistry>,
}

impl EngineBuilder {
    /// Where messages go when they fail outside any try/catch. Without one,
    /// they are rejected at the source.
    pub fn error_output(mut self, broker: BrokerConfig) -> Self {
        self.error_output = Some(broker);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn liveness(mut self, registry: HealthRegistry) -> Self {
        self.liveness = Some(registry);
        self
    }

    /// Validate and compile the pipeline.
    pub fn build(self, source: Arc<dyn Source>) -> Result<Engine, ConfigError> {
        if self.settings.max_concurrent_messages == 0 {
            return Err(ConfigError::InvalidSetting(
                "max_concurrent_messages must be positive".to_owned(),
            ));
        }
        if u32::try_from(self.settings.max_concurrent_messages).is_err() {
            return Err(ConfigError::InvalidSetting(
                "max_concurrent_messages does not fit in 32 bits".to_owned(),
            ));
        }
        if self.settings.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidSetting(
                "heartbeat_interval must be positive".to_owned(),
            ));
        }

        self.pipeline.validate()?;
        if let Some(error_output) = &self.error_output {
            validate_broker(error_output, "error_output")?;
        }
        let graph = Graph::compile(&self.pipeline, self.error_output.as_ref())?;

        Ok(Engine {
            graph: Arc::new(graph),
            source,
            settings: self.settings,
            liveness: self.liveness,
        })
    }
}

/// Pulls messages from a source and runs each through the compiled pipeline
/// in its own task.
pub struct Engine {
    graph: Arc<Graph>,
    source: Arc<dyn Source>,
    settings: EngineSettings,
    liveness: Option<HealthRegistry>,
}

impl Engine {
    pub fn builder(pipeline: Pipeline) -> EngineBuilder {
        EngineBuilder {
            pipeline,
            error_output: None,
            settings: EngineSettings::default(),
            liveness: None,
        }
    }

    /// Run until the source ends, `shutdown` fires, or a fatal error occurs.
    ///
    /// Shutdown stops admission and flushes pending batches, upstream stages
    /// first. In-flight messages and those flushes get `drain_timeout` in
    /// total; after that, whatever is still waiting is cancelled and fails
    /// with `ShutdownInProgress`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RunSummary, EngineError> {
        let Engine {
            graph,
            source,
            settings,
            liveness,
        } = self;
        let signals = graph.signals().clone();
        let max_concurrent = settings.max_concurrent_messages;
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        let timers = graph.start_flush_timers(liveness.as_ref(), settings.heartbeat_interval);
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = liveness.as_ref().map(|registry| {
            let handle = registry.register(
                "engine".to_owned(),
                liveness_deadline(settings.heartbeat_interval),
            );
            tokio::spawn(report_liveness(
                handle,
                settings.heartbeat_interval,
                signals.clone(),
                heartbeat_stop.clone(),
            ))
        });

        info!(max_concurrent, "pipeline engine started");
        let mut received: u64 = 0;
        let mut source_error = None;

        loop {
            metrics::gauge!(ENGINE_SATURATION)
                .set(1f64 - semaphore.available_permits() as f64 / max_concurrent as f64);

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = signals.fatal() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = signals.fatal() => break,
                next = source.receive() => next,
            };

            match next {
                Ok(Some(message)) => {
                    received += 1;
                    metrics::counter!(MESSAGES_RECEIVED).increment(1);

                    if shutdown.is_cancelled() || signals.is_fatal() {
                        let reason = ProcessingError::ShutdownInProgress.to_string();
                        signals.settle_message(message, &Outcome::Failed(reason));
                        break;
                    }

                    let graph = graph.clone();
                    tokio::spawn(async move {
                        graph.admit(message).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    info!("source exhausted");
                    break;
                }
                Err(error) => {
                    error!(%error, "failed to receive from source");
                    source_error = Some(error);
                    break;
                }
            }
        }

        info!(received, "admission stopped, draining in-flight messages");
        let deadline = Instant::now() + settings.drain_timeout;
        drain(&semaphore, &signals, &settings, deadline).await;

        // Flushing pending batches shares the drain deadline.
        let stopping = graph.stop_flush_timers(timers);
        tokio::pin!(stopping);
        if tokio::time::timeout_at(deadline, stopping.as_mut()).await.is_err() {
            warn!("flushing pending batches outlived the drain timeout, cancelling outstanding waits");
            signals.cancel();
            stopping.await;
        }
        signals.cancel();
        graph.release_caches().await;

        heartbeat_stop.cancel();
        if let Some(heartbeat) = heartbeat {
            if let Err(join_error) = heartbeat.await {
                error!(%join_error, "liveness reporter failed");
            }
        }

        let summary = signals.summary(received);
        info!(?summary, "pipeline engine stopped");

        if let Some(reason) = signals.fatal_reason() {
            return Err(EngineError::FatalError(reason));
        }
        match source_error {
            Some(error) => Err(EngineError::SourceError(error)),
            None => Ok(summary),
        }
    }
}

/// Wait for every permit to come back. Past the drain timeout, cancel waits
/// so the remaining messages fail fast instead of stalling shutdown.
async fn drain(
    semaphore: &Semaphore,
    signals: &Signals,
    settings: &EngineSettings,
    deadline: Instant,
) {
    // Checked to fit when the engine was built.
    let permits = u32::try_from(settings.max_concurrent_messages).unwrap_or(u32::MAX);

    let drained = tokio::time::timeout_at(deadline, semaphore.acquire_many(permits));
    if drained.await.is_ok() {
        return;
    }

    warn!(
        in_flight = settings.max_concurrent_messages - semaphore.available_permits(),
        "drain timed out, cancelling outstanding waits"
    );
    signals.cancel();
    if semaphore.acquire_many(permits).await.is_err() {
        warn!("semaphore closed while draining");
    }
}

async fn report_liveness(
    handle: HealthHandle,
    interval: time::Duration,
    signals: Arc<Signals>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if signals.is_fatal() {
            handle.report_status(ComponentStatus::Unhealthy);
        } else {
            handle.report_healthy();
        }
    }
}
