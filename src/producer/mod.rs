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

//! Producer core.
//!
//! `send` validates a record, picks its partition and parks it in the
//! [`RecordAccumulator`]; a single sender task ships the buffered batches
//! through the shared [`Session`] and resolves each record's
//! [`DeliveryFuture`].

pub use delivery::{DeliveryFuture, DeliveryResult};
pub use partitioner::{partition_for_key, Partitioner};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use accumulator::RecordAccumulator;
use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use sender::{Sender, SenderCommand};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::message::{Record, TopicPartition};
use crate::network::Session;
use crate::service::{ProducerConfig, Shutdown};
use crate::{AppError, AppResult, ErrorContext};

mod accumulator;
mod delivery;
mod partitioner;
mod sender;

#[derive(Debug)]
pub struct Producer {
    config: ProducerConfig,
    /// dropped by `close`
    session: Mutex<Option<Session>>,
    accumulator: Arc<RecordAccumulator>,
    partitioner: Partitioner,
    /// partition count per topic, filled by metadata lookups
    partition_counts: DashMap<String, i32>,
    next_record_id: AtomicU64,
    command_tx: mpsc::Sender<SenderCommand>,
    notify_shutdown: broadcast::Sender<()>,
    closed: AtomicCell<bool>,
    sender_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// Starts the sender task. The producer shares `session` and never
    /// closes it.
    pub fn new(config: &ProducerConfig, session: Session) -> AppResult<Producer> {
        config.validate()?;
        let accumulator = Arc::new(RecordAccumulator::new(
            config.max_buffer_per_partition,
            config.batch_size,
        ));
        let (command_tx, command_rx) = mpsc::channel(16);
        let (notify_shutdown, _) = broadcast::channel(1);

        let sender = Sender::new(
            config.clone(),
            session.clone(),
            accumulator.clone(),
            command_rx,
            Shutdown::new(notify_shutdown.subscribe()),
        );
        let sender_handle = tokio::spawn(sender.run());
        debug!("producer started");

        Ok(Producer {
            config: config.clone(),
            session: Mutex::new(Some(session)),
            accumulator,
            partitioner: Partitioner::new(),
            partition_counts: DashMap::new(),
            next_record_id: AtomicU64::new(0),
            command_tx,
            notify_shutdown,
            closed: AtomicCell::new(false),
            sender_handle: Mutex::new(Some(sender_handle)),
        })
    }

    /// Hands the record over. Waits only while the destination partition's
    /// buffer is full; the returned future resolves on acknowledgment.
    pub async fn send(&self, record: Record) -> AppResult<DeliveryFuture> {
        self.enqueue(record, true).await
    }

    /// Like [`Producer::send`] but a full buffer is a `BufferFullError`.
    pub async fn try_send(&self, record: Record) -> AppResult<DeliveryFuture> {
        self.enqueue(record, false).await
    }

    async fn enqueue(&self, record: Record, wait: bool) -> AppResult<DeliveryFuture> {
        if self.is_closed() {
            return Err(AppError::ClosedError("producer"));
        }
        record.validate(self.config.max_record_size)?;

        let partition_count = self.partition_count(record.topic()).await?;
        let partition = self
            .partitioner
            .partition(record.key().map(|key| key.as_ref()), partition_count);
        let topic_partition = TopicPartition::new(record.topic(), partition);
        let record_id = self.next_record_id.fetch_add(1, Ordering::Relaxed);

        let rx = self
            .accumulator
            .append(topic_partition.clone(), record_id, record, wait)
            .await?;
        trace!("record {} routed to {}", record_id, topic_partition);
        Ok(DeliveryFuture::new(record_id, topic_partition, rx))
    }

    async fn partition_count(&self, topic: &str) -> AppResult<i32> {
        if let Some(count) = self.partition_counts.get(topic) {
            return Ok(*count);
        }
        let session = self
            .session
            .lock()
            .clone()
            .ok_or(AppError::ClosedError("producer"))?;
        let response = session.metadata(vec![topic.to_string()]).await?;
        let metadata = response
            .topics
            .into_iter()
            .find(|metadata| metadata.name == topic)
            .ok_or_else(|| {
                AppError::IllegalStateError(format!("metadata response is missing topic {}", topic))
            })?;
        if !metadata.error.is_ok() {
            return Err(AppError::broker(metadata.error, ErrorContext::topic(topic)));
        }
        if metadata.partition_count <= 0 {
            return Err(AppError::IllegalStateError(format!(
                "topic {} reports {} partitions",
                topic, metadata.partition_count
            )));
        }
        debug!("topic {} has {} partitions", topic, metadata.partition_count);
        self.partition_counts
            .insert(topic.to_string(), metadata.partition_count);
        Ok(metadata.partition_count)
    }

    /// Returns once every record accepted before the call has a delivery
    /// result. A concurrent `close` cancels the wait with `ClosedError`.
    pub async fn flush(&self) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        if self.is_closed() {
            return Err(AppError::ClosedError("producer"));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(SenderCommand::Flush(done_tx))
            .await
            .map_err(|_| AppError::ClosedError("producer"))?;
        tokio::select! {
            done = done_rx => done.map_err(|_| AppError::ClosedError("producer")),
            _ = shutdown.recv() => Err(AppError::ClosedError("producer")),
        }
    }

    /// Ships what is still buffered and stops the sender task. Blocked `send`
    /// and `flush` calls fail with `ClosedError`. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true) {
            return;
        }
        self.accumulator.close();
        let _ = self.notify_shutdown.send(());
        let handle = self.sender_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("producer sender task failed: {}", e);
            }
        }
        self.session.lock().take();
        info!("producer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load()
    }

    /// Records buffered and not yet handed to the session.
    pub fn buffered_records(&self) -> usize {
        self.accumulator.buffered()
    }
}
