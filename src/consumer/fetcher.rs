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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::message::{Batch, TopicPartition};
use crate::network::{ErrorCode, Session};
use crate::service::{ResetPolicy, Shutdown};
use crate::AppError;

/// What the fetcher should read. The consumer replaces it on every new
/// generation; the fetcher only moves positions forward within one.
#[derive(Debug, Default)]
pub(crate) struct FetchState {
    pub(crate) generation: i32,
    pub(crate) positions: BTreeMap<TopicPartition, i64>,
    pub(crate) reset_policy: ResetPolicy,
}

#[derive(Debug)]
pub(crate) enum Arrival {
    /// everything one fetch round read, at most one batch per partition
    Batches { generation: i32, batches: Vec<Batch> },
    /// the session gave up, nothing more will arrive
    Failed(AppError),
}

/// Background task reading assigned partitions into the arrival queue.
pub(crate) struct Fetcher {
    pub(crate) session: Session,
    pub(crate) state: Arc<Mutex<FetchState>>,
    pub(crate) arrivals: async_channel::Sender<Arrival>,
    pub(crate) max_records: usize,
    pub(crate) fetch_wait: Duration,
    pub(crate) wakeup: Arc<Notify>,
    pub(crate) shutdown: Shutdown,
}

enum Round {
    Fetched(bool),
    Stop,
}

impl Fetcher {
    pub(crate) async fn run(mut self) {
        loop {
            let fetched = match self.fetch_round().await {
                Round::Fetched(fetched) => fetched,
                Round::Stop => break,
            };
            if !fetched {
                tokio::select! {
                    biased;
                    _ = self.shutdown.recv() => break,
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.fetch_wait) => {}
                }
            }
        }
        self.arrivals.close();
        debug!("fetcher exiting");
    }

    /// One fetch per assigned partition, queued as a single arrival so a poll
    /// sees the whole round. Tells whether anything was queued.
    async fn fetch_round(&mut self) -> Round {
        let (generation, positions) = {
            let state = self.state.lock();
            (state.generation, state.positions.clone())
        };
        let mut batches = Vec::new();
        let mut failure = None;

        for (topic_partition, offset) in positions {
            let response = tokio::select! {
                biased;
                _ = self.shutdown.recv() => return Round::Stop,
                response = self.session.fetch(topic_partition.clone(), offset, self.max_records) => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(AppError::ClosedError(_)) => return Round::Stop,
                Err(e) => {
                    error!("fetch from {} failed for good: {}", topic_partition, e);
                    failure = Some(e);
                    break;
                }
            };

            match response.error {
                ErrorCode::None => {
                    let Some(last) = response.records.last().map(|record| record.offset) else {
                        continue;
                    };
                    if !self.advance(generation, &topic_partition, offset, last + 1) {
                        trace!("{} moved on while fetching, dropping batch", topic_partition);
                        continue;
                    }
                    let mut batch = Batch::new(topic_partition.clone());
                    batch.extend(response.records);
                    trace!(
                        "fetched {} records of {} from offset {}",
                        batch.len(),
                        topic_partition,
                        offset
                    );
                    batches.push(batch);
                }
                ErrorCode::OffsetOutOfRange => {
                    self.reset_position(generation, &topic_partition, offset).await;
                }
                code => {
                    warn!("fetch from {} at {} failed: {}", topic_partition, offset, code.message());
                }
            }
        }

        let fetched = !batches.is_empty();
        if fetched && !self.queue(Arrival::Batches { generation, batches }).await {
            return Round::Stop;
        }
        if let Some(e) = failure {
            self.queue(Arrival::Failed(e)).await;
            return Round::Stop;
        }
        Round::Fetched(fetched)
    }

    /// False once the consumer is gone or closing.
    async fn queue(&mut self, arrival: Arrival) -> bool {
        let sent = tokio::select! {
            biased;
            _ = self.shutdown.recv() => return false,
            sent = self.arrivals.send(arrival) => sent,
        };
        sent.is_ok()
    }

    /// Moves the position from `from` to `to` unless the consumer replaced it
    /// in the meantime.
    fn advance(&self, generation: i32, topic_partition: &TopicPartition, from: i64, to: i64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        match state.positions.get_mut(topic_partition) {
            Some(position) if *position == from => {
                *position = to;
                true
            }
            _ => false,
        }
    }

    async fn reset_position(&self, generation: i32, topic_partition: &TopicPartition, offset: i64) {
        let reset_policy = self.state.lock().reset_policy;
        match self
            .session
            .list_offsets(topic_partition.clone(), reset_policy)
            .await
        {
            Ok(response) if response.error.is_ok() => {
                if self.advance(generation, topic_partition, offset, response.offset) {
                    warn!(
                        "offset {} out of range for {}, reset to {} ({})",
                        offset, topic_partition, response.offset, reset_policy
                    );
                }
            }
            Ok(response) => warn!(
                "cannot reset {}: {}",
                topic_partition,
                response.error.message()
            ),
            Err(e) => warn!("cannot reset {}: {}", topic_partition, e),
        }
    }
}
