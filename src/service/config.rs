// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use super::{AppError, AppResult};

/// Environment variables with this prefix override file values,
/// e.g. `STONEMQ_CLIENT__CONSUMER__GROUP_ID=g1`.
pub const ENV_PREFIX: &str = "STONEMQ_CLIENT";

/// Where a consumer starts when its group has no committed offset for a partition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPolicy {
    Earliest,
    #[default]
    Latest,
}

impl FromStr for ResetPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(ResetPolicy::Earliest),
            "latest" => Ok(ResetPolicy::Latest),
            other => Err(AppError::ValidationError(format!(
                "reset policy must be earliest or latest, got {}",
                other
            ))),
        }
    }
}

impl Display for ResetPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetPolicy::Earliest => write!(f, "earliest"),
            ResetPolicy::Latest => write!(f, "latest"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub bootstrap_servers: Vec<String>,
    /// reconnect rounds over the bootstrap list before giving up
    pub reconnect_retries: u32,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub request_queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            reconnect_retries: 5,
            reconnect_backoff_ms: 50,
            reconnect_backoff_max_ms: 1000,
            request_queue_size: 1024,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(AppError::ValidationError(
                "session.bootstrap_servers must not be empty".to_string(),
            ));
        }
        if self.request_queue_size == 0 {
            return Err(AppError::ValidationError(
                "session.request_queue_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// records buffered per partition before `send` waits
    pub max_buffer_per_partition: usize,
    /// records per produce request
    pub batch_size: usize,
    pub linger_ms: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// key plus value, in bytes
    pub max_record_size: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_buffer_per_partition: 1024,
            batch_size: 16,
            linger_ms: 5,
            retries: 3,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 1000,
            max_record_size: 1024 * 1024,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_buffer_per_partition == 0 || self.batch_size == 0 {
            return Err(AppError::ValidationError(
                "producer.max_buffer_per_partition and producer.batch_size must be positive"
                    .to_string(),
            ));
        }
        if self.max_record_size == 0 {
            return Err(AppError::ValidationError(
                "producer.max_record_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub client_id: String,
    pub reset_policy: ResetPolicy,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub fetch_max_records: usize,
    pub fetch_wait_ms: u64,
    /// fetched batches waiting for `poll`
    pub arrival_queue_size: usize,
    /// attempts for join/sync before the error is surfaced
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            client_id: "stonemq-client".to_string(),
            reset_policy: ResetPolicy::default(),
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            fetch_max_records: 500,
            fetch_wait_ms: 100,
            arrival_queue_size: 16,
            retries: 5,
            retry_backoff_ms: 100,
        }
    }
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    /// Checks the timing and sizing knobs. The group id is checked by the
    /// consumer, a file may leave it to the environment.
    pub fn validate(&self) -> AppResult<()> {
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.session_timeout_ms
        {
            return Err(AppError::ValidationError(format!(
                "consumer.heartbeat_interval_ms ({}) must be positive and below session_timeout_ms ({})",
                self.heartbeat_interval_ms, self.session_timeout_ms
            )));
        }
        if self.fetch_max_records == 0 || self.arrival_queue_size == 0 {
            return Err(AppError::ValidationError(
                "consumer.fetch_max_records and consumer.arrival_queue_size must be positive"
                    .to_string(),
            ));
        }
        if self.fetch_wait_ms == 0 {
            return Err(AppError::ValidationError(
                "consumer.fetch_wait_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

impl ClientConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ClientConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::ConfigFileError(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("session.bootstrap_servers")
                    .try_parsing(true),
            )
            .build()?;

        let client_config: ClientConfig = config.try_deserialize()?;
        client_config.validate()?;
        Ok(client_config)
    }

    /// Validates every section, reporting problems as `ConfigFileError`.
    pub fn validate(&self) -> AppResult<()> {
        self.session
            .validate()
            .and_then(|_| self.producer.validate())
            .and_then(|_| self.consumer.validate())
            .map_err(|e| match e {
                AppError::ValidationError(message) => AppError::ConfigFileError(message),
                other => other,
            })
    }
}
