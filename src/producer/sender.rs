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

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::message::{Record, TopicPartition};
use crate::network::Session;
use crate::service::{ProducerConfig, Shutdown};
use crate::utils::ExponentialBackoff;
use crate::{AppError, AppResult, ErrorContext};

use super::accumulator::{PendingRecord, RecordAccumulator};

#[derive(Debug)]
pub(crate) enum SenderCommand {
    /// ship everything buffered, answer once it is resolved
    Flush(oneshot::Sender<()>),
}

/// Background task moving batches from the accumulator to the session.
///
/// Batches are sent one at a time, so a partition never has two produce
/// requests in flight and its delivery results come out in send order.
pub(crate) struct Sender {
    config: ProducerConfig,
    session: Session,
    accumulator: Arc<RecordAccumulator>,
    commands: mpsc::Receiver<SenderCommand>,
    shutdown: Shutdown,
}

impl Sender {
    pub(crate) fn new(
        config: ProducerConfig,
        session: Session,
        accumulator: Arc<RecordAccumulator>,
        commands: mpsc::Receiver<SenderCommand>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            session,
            accumulator,
            commands,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let period = self.config.linger().max(Duration::from_millis(1));
        let mut linger = tokio::time::interval_at(Instant::now() + period, period);
        linger.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                command = self.commands.recv() => match command {
                    Some(SenderCommand::Flush(done)) => {
                        self.send_ready(true).await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = self.accumulator.batch_ready() => self.send_ready(false).await,
                _ = linger.tick() => self.send_ready(true).await,
            }
        }

        // records accepted before close still go out
        self.send_ready(true).await;
        self.accumulator.abort_all(&AppError::ClosedError("producer"));
        debug!("producer sender exiting");
    }

    async fn send_ready(&self, force: bool) {
        for (topic_partition, batch) in self.accumulator.drain(force) {
            self.send_batch(topic_partition, batch).await;
        }
    }

    async fn send_batch(&self, topic_partition: TopicPartition, batch: Vec<PendingRecord>) {
        let records: Vec<Record> = batch.iter().map(|pending| pending.record.clone()).collect();
        trace!("sending {} records to {}", records.len(), topic_partition);

        let result = self.produce_with_retry(&topic_partition, records).await;
        match result {
            Ok(base_offset) => {
                for (i, pending) in batch.into_iter().enumerate() {
                    pending.complete(&topic_partition, Ok(base_offset + i as i64));
                }
            }
            Err(error) => {
                warn!(
                    "{} records to {} failed: {}",
                    batch.len(),
                    topic_partition,
                    error
                );
                for pending in batch {
                    pending.complete(&topic_partition, Err(error.clone()));
                }
            }
        }
    }

    /// Retriable broker codes are retried with backoff. Session errors are
    /// final, the session already spent its reconnect budget on them.
    async fn produce_with_retry(
        &self,
        topic_partition: &TopicPartition,
        records: Vec<Record>,
    ) -> AppResult<i64> {
        let mut backoff = ExponentialBackoff::new(
            self.config.retry_backoff(),
            self.config.retry_backoff_max(),
        );
        loop {
            let response = self
                .session
                .produce(topic_partition.clone(), records.clone())
                .await?;
            if response.error.is_ok() {
                return Ok(response.base_offset);
            }
            let error = AppError::broker(response.error, ErrorContext::partition(topic_partition));
            if !response.error.is_retriable() || backoff.attempts() >= self.config.retries {
                return Err(error);
            }
            let delay = backoff.next_delay();
            warn!(
                "produce to {} failed ({}), retry {}/{} in {:?}",
                topic_partition,
                error,
                backoff.attempts(),
                self.config.retries,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
