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

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::trace;

use crate::message::{Record, TopicPartition};
use crate::{AppError, AppResult};

use super::DeliveryResult;

/// A record waiting in the buffer or on the wire. It holds one buffer permit
/// of its partition until it is resolved.
#[derive(Debug)]
pub(crate) struct PendingRecord {
    pub(crate) record_id: u64,
    pub(crate) record: Record,
    reply: oneshot::Sender<DeliveryResult>,
    _permit: OwnedSemaphorePermit,
}

impl PendingRecord {
    pub(crate) fn complete(self, topic_partition: &TopicPartition, result: AppResult<i64>) {
        let _ = self.reply.send(DeliveryResult {
            record_id: self.record_id,
            topic_partition: topic_partition.clone(),
            result,
        });
    }
}

/// Per-partition FIFO buffers between `send` and the sender task.
///
/// Every partition gets `max_buffer` permits. A record takes one when it is
/// appended and gives it back when its delivery result is out, so buffered
/// plus in-flight records never exceed the limit.
#[derive(Debug)]
pub(crate) struct RecordAccumulator {
    max_buffer: usize,
    batch_size: usize,
    permits: DashMap<TopicPartition, Arc<Semaphore>>,
    queues: DashMap<TopicPartition, VecDeque<PendingRecord>>,
    batch_ready: Notify,
    closed: AtomicCell<bool>,
}

impl RecordAccumulator {
    pub(crate) fn new(max_buffer: usize, batch_size: usize) -> Self {
        Self {
            max_buffer,
            batch_size: batch_size.max(1),
            permits: DashMap::new(),
            queues: DashMap::new(),
            batch_ready: Notify::new(),
            closed: AtomicCell::new(false),
        }
    }

    /// Buffers the record. With `wait` the call parks until the partition has
    /// room, otherwise a full partition is a `BufferFullError`.
    pub(crate) async fn append(
        &self,
        topic_partition: TopicPartition,
        record_id: u64,
        record: Record,
        wait: bool,
    ) -> AppResult<oneshot::Receiver<DeliveryResult>> {
        if self.closed.load() {
            return Err(AppError::ClosedError("producer"));
        }
        let semaphore = self
            .permits
            .entry(topic_partition.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_buffer)))
            .clone();

        let permit = if wait {
            semaphore
                .acquire_owned()
                .await
                .map_err(|_| AppError::ClosedError("producer"))?
        } else {
            semaphore.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::NoPermits => AppError::BufferFullError(topic_partition.clone()),
                TryAcquireError::Closed => AppError::ClosedError("producer"),
            })?
        };
        if self.closed.load() {
            return Err(AppError::ClosedError("producer"));
        }

        let (reply, rx) = oneshot::channel();
        let ready = {
            let mut queue = self.queues.entry(topic_partition.clone()).or_default();
            queue.push_back(PendingRecord {
                record_id,
                record,
                reply,
                _permit: permit,
            });
            queue.len() >= self.batch_size
        };
        trace!("record {} buffered for {}", record_id, topic_partition);
        if ready {
            self.batch_ready.notify_one();
        }
        Ok(rx)
    }

    /// Resolves once some partition holds a full batch.
    pub(crate) async fn batch_ready(&self) {
        self.batch_ready.notified().await
    }

    /// Takes batches of at most `batch_size` records. Without `force` only
    /// full batches are taken.
    pub(crate) fn drain(&self, force: bool) -> Vec<(TopicPartition, Vec<PendingRecord>)> {
        let mut batches = Vec::new();
        for mut entry in self.queues.iter_mut() {
            let topic_partition = entry.key().clone();
            let queue = entry.value_mut();
            while queue.len() >= self.batch_size || (force && !queue.is_empty()) {
                let count = queue.len().min(self.batch_size);
                batches.push((topic_partition.clone(), queue.drain(..count).collect()));
            }
        }
        batches
    }

    pub(crate) fn buffered(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }

    /// Room left in the partition buffer.
    pub(crate) fn available_permits(&self, topic_partition: &TopicPartition) -> usize {
        self.permits
            .get(topic_partition)
            .map(|semaphore| semaphore.available_permits())
            .unwrap_or(self.max_buffer)
    }

    /// Wakes every `append` parked on a full buffer with `ClosedError` and
    /// refuses new records. Buffered records stay for the final drain.
    pub(crate) fn close(&self) {
        self.closed.store(true);
        for entry in self.permits.iter() {
            entry.value().close();
        }
    }

    /// Fails every record still buffered.
    pub(crate) fn abort_all(&self, error: &AppError) {
        for (topic_partition, batch) in self.drain(true) {
            for pending in batch {
                pending.complete(&topic_partition, Err(error.clone()));
            }
        }
    }
}
