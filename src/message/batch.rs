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

use super::{ConsumerRecord, TopicPartition};

/// Records of a single partition in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    topic_partition: TopicPartition,
    records: Vec<ConsumerRecord>,
}

impl Batch {
    pub fn new(topic_partition: TopicPartition) -> Self {
        Self {
            topic_partition,
            records: Vec::new(),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn records(&self) -> &[ConsumerRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }

    /// Appends records that continue this batch. Records that belong to another
    /// partition or do not move past the current last offset are dropped.
    pub(crate) fn extend(&mut self, records: impl IntoIterator<Item = ConsumerRecord>) {
        for record in records {
            if record.topic != self.topic_partition.topic
                || record.partition != self.topic_partition.partition
            {
                continue;
            }
            if self.last_offset().is_some_and(|last| record.offset <= last) {
                continue;
            }
            self.records.push(record);
        }
    }
}

impl IntoIterator for Batch {
    type Item = ConsumerRecord;
    type IntoIter = std::vec::IntoIter<ConsumerRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceCause {
    /// the coordinator started a new generation
    RebalanceInProgress,
    /// the coordinator no longer knows this member or its generation
    MemberEvicted,
    /// `poll` was not called within the session timeout, the member left
    PollTimeoutExceeded,
    /// heartbeats stopped reaching the coordinator, membership is unconfirmed
    HeartbeatFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceEvent {
    pub cause: RebalanceCause,
    /// generation the member was in when the event was observed
    pub generation_id: i32,
}

/// What one `poll` call hands back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResult {
    pub batches: Vec<Batch>,
    pub rebalance: Option<RebalanceEvent>,
}

impl PollResult {
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.is_empty())
    }

    pub fn record_count(&self) -> usize {
        self.batches.iter().map(|b| b.len()).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &ConsumerRecord> {
        self.batches.iter().flat_map(|b| b.records().iter())
    }
}
