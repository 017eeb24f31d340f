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

use crate::message::TopicPartition;
use crate::network::ErrorCode;

pub type AppResult<T> = Result<T, AppError>;

/// Coarse classification of an [`AppError`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    BufferFull,
    Broker,
    Unavailable,
    NotAssigned,
    Closed,
    IllegalState,
    Config,
}

/// Where a broker error happened. Every field is optional, a metadata
/// failure only knows the topic while a fetch failure knows all three.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
}

impl ErrorContext {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn partition(topic_partition: &TopicPartition) -> Self {
        Self {
            topic: Some(topic_partition.topic.clone()),
            partition: Some(topic_partition.partition),
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl Display for ErrorContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "topic={}", self.topic.as_deref().unwrap_or("-"))?;
        if let Some(partition) = self.partition {
            write!(f, " partition={}", partition)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " offset={}", offset)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    /// malformed input, never retried
    #[error("validation error: {0}")]
    ValidationError(String),

    /// local backpressure, retry after yielding
    #[error("buffer full for {0}")]
    BufferFullError(TopicPartition),

    #[error("broker error {code:?} [{context}]: {}", .code.message())]
    BrokerError {
        code: ErrorCode,
        context: ErrorContext,
    },

    /// reconnect budget exhausted, fatal for the session
    #[error("broker unavailable: {0}")]
    UnavailableError(String),

    #[error("partition {0} is not assigned to this member")]
    NotAssignedError(TopicPartition),

    #[error("{0} is closed")]
    ClosedError(&'static str),

    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("config file error: {0}")]
    ConfigFileError(String),
}

impl AppError {
    pub fn broker(code: ErrorCode, context: ErrorContext) -> Self {
        AppError::BrokerError { code, context }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ValidationError(_) => ErrorKind::Validation,
            AppError::BufferFullError(_) => ErrorKind::BufferFull,
            AppError::BrokerError { .. } => ErrorKind::Broker,
            AppError::UnavailableError(_) => ErrorKind::Unavailable,
            AppError::NotAssignedError(_) => ErrorKind::NotAssigned,
            AppError::ClosedError(_) => ErrorKind::Closed,
            AppError::IllegalStateError(_) => ErrorKind::IllegalState,
            AppError::ConfigFileError(_) => ErrorKind::Config,
        }
    }

    /// Broker error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            AppError::BrokerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            AppError::BufferFullError(_) => true,
            AppError::BrokerError { code, .. } => code.is_retriable(),
            _ => false,
        }
    }

    /// The coordinator moved on to another generation or forgot the member.
    pub fn needs_rejoin(&self) -> bool {
        matches!(
            self.code(),
            Some(ErrorCode::RebalanceInProgress)
                | Some(ErrorCode::IllegalGeneration)
                | Some(ErrorCode::UnknownMemberId)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(value: config::ConfigError) -> Self {
        AppError::ConfigFileError(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_carries_context() {
        let tp = TopicPartition::new("orders", 1);
        let error = AppError::broker(
            ErrorCode::OffsetOutOfRange,
            ErrorContext::partition(&tp).with_offset(42),
        );
        assert_eq!(error.kind(), ErrorKind::Broker);
        let message = error.to_string();
        assert!(message.contains("topic=orders partition=1 offset=42"));
        assert!(message.contains("not within the range"));
    }

    #[test]
    fn test_retriable_classification() {
        let tp = TopicPartition::new("orders", 0);
        assert!(AppError::broker(ErrorCode::NotLeaderForPartition, ErrorContext::partition(&tp))
            .is_retriable());
        assert!(!AppError::broker(ErrorCode::MessageTooLarge, ErrorContext::partition(&tp))
            .is_retriable());
        assert!(AppError::BufferFullError(tp.clone()).is_retriable());
        assert!(!AppError::NotAssignedError(tp).is_retriable());
        assert!(!AppError::ClosedError("producer").is_retriable());
    }

    #[test]
    fn test_needs_rejoin() {
        let error = AppError::broker(ErrorCode::IllegalGeneration, ErrorContext::default());
        assert!(error.needs_rejoin());
        assert!(!AppError::UnavailableError("down".to_string()).needs_rejoin());
    }
}
