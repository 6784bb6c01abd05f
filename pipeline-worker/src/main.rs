//! Run newline-delimited JSON events from stdin through a data-quality pipeline.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use health::HealthRegistry;
use pipeline_common::ack::{Acknowledger, Outcome};
use pipeline_common::message::Message;
use pipeline_common::metrics::{serve, setup_metrics_router};
use pipeline_common::sink::PrintSink;
use pipeline_common::source::ChannelSource;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pipeline_worker::config::{list, Config};
use pipeline_worker::engine::Engine;
use pipeline_worker::pipeline::{Pipeline, ProcessorConfig};
use pipeline_worker::processors::batch::BatchPolicy;
use pipeline_worker::processors::broker::{BrokerConfig, Output, Quorum};
use pipeline_worker::processors::dedupe::DedupePolicy;
use pipeline_worker::processors::rate_limit::RateLimitPolicy;
use pipeline_worker::quality::{AssignMissingId, DropEnvironments, NormalizeTimestamp, Redact};
use pipeline_worker::schema::{FieldType, RequiredFields};

/// Stdin cannot be acknowledged; outcomes are logged instead.
struct LogAcknowledger;

impl Acknowledger for LogAcknowledger {
    fn ack(&self, message_id: Uuid, outcome: &Outcome) {
        debug!(%message_id, outcome = outcome.label(), "acknowledged");
    }

    fn reject(&self, message_id: Uuid, reason: &str) {
        warn!(%message_id, reason, "rejected");
    }
}

fn output(name: &str) -> Output {
    Output::new(name, Arc::new(PrintSink::new(name)))
}

fn data_quality_pipeline(config: &Config) -> Pipeline {
    let retry = config.retry_policy.policy();
    let schema = list(&config.required_fields)
        .iter()
        .fold(RequiredFields::new(), |schema, field| {
            schema.field(field, FieldType::Any)
        });

    let cleanup = Pipeline::new()
        .then(ProcessorConfig::mapping(AssignMissingId::new(
            config.id_field.as_str(),
        )))
        .then(ProcessorConfig::mapping(NormalizeTimestamp::new("timestamp")))
        .then(ProcessorConfig::mapping(schema))
        .then(ProcessorConfig::mapping(Redact::new(list(
            &config.redacted_fields,
        ))))
        .then(ProcessorConfig::mapping(DropEnvironments::new(
            "properties.$environment",
            list(&config.dropped_environments),
        )));
    let dead_letter = Pipeline::new().then(ProcessorConfig::broker(BrokerConfig::single(
        output("dead_letter"),
        retry,
    )));

    Pipeline::new()
        .then(ProcessorConfig::try_catch(cleanup, dead_letter))
        .then(ProcessorConfig::dedupe(
            DedupePolicy::new(&[config.id_field.as_str()], config.dedupe_ttl.0)
                .max_entries(config.dedupe_max_entries),
        ))
        .then(ProcessorConfig::rate_limit(RateLimitPolicy::per_second(
            config.rate_limit_per_second,
            config.rate_limit_burst,
            config.rate_limit_timeout.0,
        )))
        .then(ProcessorConfig::batch(BatchPolicy::new(
            config.batch_max_count,
            config.batch_max_period.0,
        )))
        .then(ProcessorConfig::broker(BrokerConfig::fan_out_all(
            vec![output("warehouse"), output("archive")],
            Quorum::AtLeast(1),
            retry,
        )))
}

/// Feed stdin lines to the engine. Returning drops the sender, which ends the stream.
async fn read_stdin(sender: mpsc::Sender<Message>, shutdown: CancellationToken) {
    let acknowledger: Arc<dyn Acknowledger> = Arc::new(LogAcknowledger);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                error!(%error, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        // Unparseable lines still go through, so that validation routes them
        // to the dead-letter output.
        let payload = serde_json::from_str(&line).unwrap_or_else(|error| {
            warn!(%error, "line is not valid JSON");
            Value::String(line)
        });
        if sender
            .send(Message::with_acknowledger(payload, acknowledger.clone()))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    let liveness = HealthRegistry::new("liveness");

    let (sender, source) = ChannelSource::new(config.input_buffer);
    let engine = Engine::builder(data_quality_pipeline(&config))
        .error_output(BrokerConfig::single(
            output("error_output"),
            config.retry_policy.policy(),
        ))
        .settings(config.engine_settings())
        .liveness(liveness.clone())
        .build(Arc::new(source))?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router(liveness);
        if let Err(error) = serve(router, &bind).await {
            error!(%error, "failed to serve metrics");
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(read_stdin(sender, shutdown.clone()));
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        signal.cancel();
    });

    let summary = engine.run(shutdown).await?;
    info!(
        received = summary.received,
        delivered = summary.delivered,
        duplicates = summary.duplicates,
        dead_lettered = summary.dead_lettered,
        failed = summary.failed,
        "done"
    );

    Ok(())
}
