use std::sync::Arc;

use pipeline_common::cache::{DedupeCache, MemoryCache};
use pipeline_common::message::Message;

use crate::error::ConfigError;
use crate::processors::batch::BatchPolicy;
use crate::processors::broker::{BrokerConfig, DeliveryPolicy};
use crate::processors::dedupe::DedupePolicy;
use crate::processors::mapping::{Mapped, MappingError, Transform};
use crate::processors::rate_limit::RateLimitPolicy;
use crate::processors::switch::SwitchCase;

/// An ordered list of stages. Pipelines nest: switch cases and try/catch
/// blocks hold pipelines of their own.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<ProcessorConfig>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, stage: ProcessorConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[ProcessorConfig] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Check every stage, nested pipelines included.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_at("pipeline")
    }

    pub(crate) fn validate_at(&self, path: &str) -> Result<(), ConfigError> {
        for (index, stage) in self.stages.iter().enumerate() {
            let label = stage_label(path, index, stage);
            let is_last = index + 1 == self.stages.len();
            stage.validate(&label, is_last)?;
        }
        Ok(())
    }
}

pub(crate) fn stage_label(path: &str, index: usize, stage: &ProcessorConfig) -> String {
    format!("{path}/{index}:{}", stage.kind())
}

#[derive(Clone)]
pub enum ProcessorConfig {
    Mapping(Arc<dyn Transform>),
    Switch(Vec<SwitchCase>),
    Dedupe {
        policy: DedupePolicy,
        cache: Arc<dyn DedupeCache>,
    },
    Batch(BatchPolicy),
    RateLimit(RateLimitPolicy),
    TryCatch {
        try_pipeline: Pipeline,
        catch_pipeline: Pipeline,
    },
    Broker(BrokerConfig),
}

impl ProcessorConfig {
    pub fn mapping(transform: impl Transform + 'static) -> Self {
        ProcessorConfig::Mapping(Arc::new(transform))
    }

    /// A mapping from a closure.
    pub fn map_fn<F>(transform: F) -> Self
    where
        F: Fn(&Message) -> Result<Mapped, MappingError> + Send + Sync + 'static,
    {
        ProcessorConfig::Mapping(Arc::new(transform))
    }

    pub fn switch(cases: Vec<SwitchCase>) -> Self {
        ProcessorConfig::Switch(cases)
    }

    /// Deduplicate with an in-process cache sized by the policy.
    pub fn dedupe(policy: DedupePolicy) -> Self {
        let cache = Arc::new(MemoryCache::new(policy.max_entries));
        ProcessorConfig::Dedupe { policy, cache }
    }

    pub fn dedupe_with_cache(policy: DedupePolicy, cache: Arc<dyn DedupeCache>) -> Self {
        ProcessorConfig::Dedupe { policy, cache }
    }

    pub fn batch(policy: BatchPolicy) -> Self {
        ProcessorConfig::Batch(policy)
    }

    pub fn rate_limit(policy: RateLimitPolicy) -> Self {
        ProcessorConfig::RateLimit(policy)
    }

    pub fn try_catch(try_pipeline: Pipeline, catch_pipeline: Pipeline) -> Self {
        ProcessorConfig::TryCatch {
            try_pipeline,
            catch_pipeline,
        }
    }

    pub fn broker(config: BrokerConfig) -> Self {
        ProcessorConfig::Broker(config)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorConfig::Mapping(_) => "mapping",
            ProcessorConfig::Switch(_) => "switch",
            ProcessorConfig::Dedupe { .. } => "dedupe",
            ProcessorConfig::Batch(_) => "batch",
            ProcessorConfig::RateLimit(_) => "rate_limit",
            ProcessorConfig::TryCatch { .. } => "try_catch",
            ProcessorConfig::Broker(_) => "broker",
        }
    }

    fn validate(&self, label: &str, is_last: bool) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidParameter {
            stage: label.to_owned(),
            reason: reason.to_owned(),
        };

        match self {
            ProcessorConfig::Mapping(_) => {}
            ProcessorConfig::Switch(cases) => {
                if cases.is_empty() {
                    return Err(invalid("a switch needs at least one case"));
                }
                for (index, case) in cases.iter().enumerate() {
                    case.pipeline().validate_at(&format!("{label}/case{index}"))?;
                }
            }
            ProcessorConfig::Dedupe { policy, .. } => {
                if policy.ttl.is_zero() {
                    return Err(invalid("ttl must be positive"));
                }
                if policy.max_entries == 0 {
                    return Err(invalid("max_entries must be positive"));
                }
                if policy.fields.iter().any(|field| field.is_empty()) {
                    return Err(invalid("field paths must not be empty"));
                }
            }
            ProcessorConfig::Batch(policy) => {
                if policy.max_count == 0 {
                    return Err(invalid("max_count must be positive"));
                }
                if policy.max_period.is_zero() {
                    return Err(invalid("max_period must be positive"));
                }
            }
            ProcessorConfig::RateLimit(policy) => {
                if policy.quota().is_none() {
                    return Err(invalid(
                        "rate, burst and interval must be positive, with interval/rate of at least 1ns",
                    ));
                }
            }
            ProcessorConfig::TryCatch {
                try_pipeline,
                catch_pipeline,
            } => {
                try_pipeline.validate_at(&format!("{label}/try"))?;
                catch_pipeline.validate_at(&format!("{label}/catch"))?;
            }
            ProcessorConfig::Broker(config) => {
                if !is_last {
                    return Err(ConfigError::BrokerNotTerminal {
                        stage: label.to_owned(),
                    });
                }
                validate_broker(config, label)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_broker(config: &BrokerConfig, label: &str) -> Result<(), ConfigError> {
    let outputs = config.outputs.len();
    if outputs == 0 {
        return Err(ConfigError::NoOutputs {
            stage: label.to_owned(),
        });
    }
    if config.retry.max_attempts() == 0 || config.retry.backoff_coefficient() == 0 {
        return Err(ConfigError::InvalidParameter {
            stage: label.to_owned(),
            reason: "retry needs at least one attempt and a positive backoff coefficient"
                .to_owned(),
        });
    }
    if let DeliveryPolicy::FanOutAll { quorum } = config.policy {
        let required = quorum.required(outputs);
        if required == 0 || required > outputs {
            return Err(ConfigError::UnsatisfiableQuorum {
                stage: label.to_owned(),
                required,
                outputs,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::retry::RetryPolicy;
    use pipeline_common::sink::PrintSink;
    use std::time::Duration;

    use crate::processors::broker::{Output, Quorum};

    fn broker(outputs: usize, quorum: Quorum) -> ProcessorConfig {
        let outputs = (0..outputs)
            .map(|i| Output::new(&format!("out{i}"), Arc::new(PrintSink::new("test"))))
            .collect();
        ProcessorConfig::broker(BrokerConfig::fan_out_all(
            outputs,
            quorum,
            RetryPolicy::default(),
        ))
    }

    fn passthrough() -> ProcessorConfig {
        ProcessorConfig::map_fn(|_: &Message| Ok(Mapped::Keep))
    }

    #[test]
    fn broker_must_be_last() {
        let pipeline = Pipeline::new()
            .then(broker(1, Quorum::All))
            .then(passthrough());
        assert_eq!(
            pipeline.validate(),
            Err(ConfigError::BrokerNotTerminal {
                stage: "pipeline/0:broker".to_owned()
            })
        );
    }

    #[test]
    fn nested_errors_carry_their_path() {
        let pipeline = Pipeline::new().then(passthrough()).then(ProcessorConfig::try_catch(
            Pipeline::new().then(passthrough()),
            Pipeline::new().then(broker(0, Quorum::All)),
        ));
        assert_eq!(
            pipeline.validate(),
            Err(ConfigError::NoOutputs {
                stage: "pipeline/1:try_catch/catch/0:broker".to_owned()
            })
        );
    }

    #[test]
    fn quorum_must_be_satisfiable() {
        let too_many = Pipeline::new().then(broker(2, Quorum::AtLeast(3)));
        assert_eq!(
            too_many.validate(),
            Err(ConfigError::UnsatisfiableQuorum {
                stage: "pipeline/0:broker".to_owned(),
                required: 3,
                outputs: 2
            })
        );
        assert!(Pipeline::new()
            .then(broker(2, Quorum::AtLeast(0)))
            .validate()
            .is_err());
        assert!(Pipeline::new()
            .then(broker(3, Quorum::Majority))
            .validate()
            .is_ok());
    }

    #[test]
    fn parameters_are_checked() {
        let zero_batch = Pipeline::new().then(ProcessorConfig::batch(BatchPolicy::new(
            0,
            Duration::from_secs(1),
        )));
        assert!(matches!(
            zero_batch.validate(),
            Err(ConfigError::InvalidParameter { .. })
        ));

        let zero_rate = Pipeline::new().then(ProcessorConfig::rate_limit(
            RateLimitPolicy::per_second(0, 10, Duration::from_secs(1)),
        ));
        assert!(zero_rate.validate().is_err());

        let empty_switch = Pipeline::new().then(ProcessorConfig::switch(vec![]));
        assert!(empty_switch.validate().is_err());

        let zero_ttl = Pipeline::new().then(ProcessorConfig::dedupe(DedupePolicy::new(
            &["id"],
            Duration::ZERO,
        )));
        assert!(zero_ttl.validate().is_err());
    }

    #[test]
    fn switch_cases_are_validated() {
        let pipeline = Pipeline::new().then(ProcessorConfig::switch(vec![SwitchCase::otherwise(
            Pipeline::new().then(broker(1, Quorum::All)).then(passthrough()),
        )]));
        assert_eq!(
            pipeline.validate(),
            Err(ConfigError::BrokerNotTerminal {
                stage: "pipeline/0:switch/case0/0:broker".to_owned()
            })
        );
    }
}
