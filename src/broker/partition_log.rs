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

use crate::message::{ConsumerRecord, Record, TopicPartition};
use crate::network::ErrorCode;

/// Append-only record log of one partition. Offsets are dense and start at
/// `log_start_offset`.
#[derive(Debug)]
pub struct PartitionLog {
    topic_partition: TopicPartition,
    log_start_offset: i64,
    records: Vec<ConsumerRecord>,
}

impl PartitionLog {
    pub fn new(topic_partition: TopicPartition) -> Self {
        Self {
            topic_partition,
            log_start_offset: 0,
            records: Vec::new(),
        }
    }

    pub fn log_start_offset(&self) -> i64 {
        self.log_start_offset
    }

    /// Offset the next appended record will get.
    pub fn log_end_offset(&self) -> i64 {
        self.log_start_offset + self.records.len() as i64
    }

    /// Appends in order and returns the offset of the first record.
    pub fn append(&mut self, records: Vec<Record>) -> i64 {
        let base_offset = self.log_end_offset();
        for (i, record) in records.into_iter().enumerate() {
            self.records.push(ConsumerRecord {
                topic: self.topic_partition.topic.clone(),
                partition: self.topic_partition.partition,
                offset: base_offset + i as i64,
                key: record.key().cloned(),
                value: record.value().clone(),
                timestamp: record.timestamp(),
            });
        }
        base_offset
    }

    /// Reads up to `max_records` starting at `offset`. Reading at the log end
    /// yields nothing, anything outside `[start, end]` is out of range.
    pub fn read(&self, offset: i64, max_records: usize) -> Result<Vec<ConsumerRecord>, ErrorCode> {
        if offset < self.log_start_offset || offset > self.log_end_offset() {
            return Err(ErrorCode::OffsetOutOfRange);
        }
        let from = (offset - self.log_start_offset) as usize;
        let to = (from + max_records).min(self.records.len());
        Ok(self.records[from..to].to_vec())
    }

    /// Drops every record below `offset`, like retention would.
    pub fn truncate_before(&mut self, offset: i64) {
        let offset = offset.min(self.log_end_offset());
        if offset <= self.log_start_offset {
            return;
        }
        let count = (offset - self.log_start_offset) as usize;
        self.records.drain(..count);
        self.log_start_offset = offset;
    }
}
