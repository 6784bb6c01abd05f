use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use pipeline_common::retry::RetryPolicy;

use crate::engine::EngineSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "64")]
    pub max_concurrent_messages: usize,

    #[envconfig(default = "30000")]
    pub drain_timeout: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub input_buffer: usize,

    #[envconfig(default = "event_id")]
    pub id_field: NonEmptyString,

    #[envconfig(default = "event,timestamp")]
    pub required_fields: String,

    #[envconfig(default = "properties.email,properties.$ip")]
    pub redacted_fields: String,

    #[envconfig(default = "test,development")]
    pub dropped_environments: String,

    #[envconfig(default = "3600000")]
    pub dedupe_ttl: EnvMsDuration,

    #[envconfig(default = "1000000")]
    pub dedupe_max_entries: u64,

    #[envconfig(default = "1000")]
    pub rate_limit_per_second: u32,

    #[envconfig(default = "2000")]
    pub rate_limit_burst: u32,

    #[envconfig(default = "5000")]
    pub rate_limit_timeout: EnvMsDuration,

    #[envconfig(default = "50")]
    pub batch_max_count: usize,

    #[envconfig(default = "2000")]
    pub batch_max_period: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_concurrent_messages: self.max_concurrent_messages,
            drain_timeout: self.drain_timeout.0,
            heartbeat_interval: self.heartbeat_interval.0,
        }
    }
}

/// Split a comma separated list, ignoring blanks.
pub fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "100000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "5")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
