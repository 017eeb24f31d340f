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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::message::TopicPartition;
use crate::{AppError, AppResult};

/// Outcome of one sent record.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// per-producer sequence number handed out by `send`
    pub record_id: u64,
    pub topic_partition: TopicPartition,
    /// offset assigned by the broker, or why the record was not written
    pub result: AppResult<i64>,
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn offset(&self) -> Option<i64> {
        self.result.as_ref().ok().copied()
    }

    pub fn error(&self) -> Option<&AppError> {
        self.result.as_ref().err()
    }
}

/// Resolves to the [`DeliveryResult`] of one record once the broker
/// acknowledged it or the producer gave up on it.
#[derive(Debug)]
pub struct DeliveryFuture {
    record_id: u64,
    topic_partition: TopicPartition,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryFuture {
    pub(crate) fn new(
        record_id: u64,
        topic_partition: TopicPartition,
        rx: oneshot::Receiver<DeliveryResult>,
    ) -> Self {
        Self {
            record_id,
            topic_partition,
            rx,
        }
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }
}

impl Future for DeliveryFuture {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // the pending record was dropped without an answer
            Poll::Ready(Err(_)) => Poll::Ready(DeliveryResult {
                record_id: self.record_id,
                topic_partition: self.topic_partition.clone(),
                result: Err(AppError::ClosedError("producer")),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}
