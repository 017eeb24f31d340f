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

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }

    /// Parses the `topic-partition` form produced by [`TopicPartition::id`].
    /// Topics may contain dashes, only the last one separates the partition.
    pub fn from_string(name: &str) -> AppResult<Self> {
        let (topic, partition) = name.rsplit_once('-').ok_or_else(|| {
            AppError::ValidationError(format!("topic partition name: {}", name))
        })?;
        let partition = partition
            .parse::<i32>()
            .ok()
            .filter(|p| *p >= 0)
            .ok_or_else(|| AppError::ValidationError(format!("topic partition id: {}", name)))?;
        if topic.is_empty() {
            return Err(AppError::ValidationError(format!(
                "topic partition name: {}",
                name
            )));
        }
        Ok(Self::new(topic, partition))
    }
}

/// A position in one partition, as committed for a consumer group.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl PartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn from_topic_partition(topic_partition: &TopicPartition, offset: i64) -> Self {
        Self::new(topic_partition.topic.clone(), topic_partition.partition, offset)
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.topic.is_empty() || self.partition < 0 || self.offset < 0 {
            return Err(AppError::ValidationError(format!(
                "invalid partition offset {}-{}@{}",
                self.topic, self.partition, self.offset
            )));
        }
        Ok(())
    }
}

impl Display for PartitionOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}
