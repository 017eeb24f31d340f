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

//! Consumer core.
//!
//! A [`Consumer`] joins a group through the [`GroupCoordinatorClient`], a
//! fetcher task reads the assigned partitions into a bounded arrival queue
//! and `poll` hands the queued batches to the application. Every batch is
//! tagged with the generation it was fetched for, so nothing fetched for a
//! previous assignment is ever delivered.

pub use state::ConsumerState;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use fetcher::{Arrival, FetchState, Fetcher};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::group_consume::{ConsumerGroupState, GroupCoordinatorClient, PollTracker};
use crate::message::{Batch, PartitionOffset, PollResult, RebalanceEvent, TopicPartition};
use crate::network::Session;
use crate::service::{ConsumerConfig, ResetPolicy, Shutdown};
use crate::{AppError, AppResult};

mod fetcher;
mod state;

/// Positions known to the consumer, per assigned partition.
#[derive(Debug, Default)]
struct OffsetBook {
    /// offset after the last record handed to the application
    consumed: HashMap<TopicPartition, i64>,
    /// last offset the group committed
    committed: HashMap<TopicPartition, i64>,
}

/// Parts only touched while holding the consumer's async lock.
#[derive(Debug)]
struct ConsumerInner {
    coordinator: GroupCoordinatorClient,
    topics: Vec<String>,
    reset_policy: ResetPolicy,
    generation: i32,
    arrival_rx: async_channel::Receiver<Arrival>,
    /// taken when the fetcher starts
    arrival_tx: Option<async_channel::Sender<Arrival>>,
    events_tx: mpsc::Sender<RebalanceEvent>,
    events_rx: mpsc::Receiver<RebalanceEvent>,
    fetcher: Option<JoinHandle<()>>,
}

enum Wake {
    Closed,
    Event(Option<RebalanceEvent>),
    Arrival(Option<Arrival>),
    Timeout,
}

#[derive(Debug)]
pub struct Consumer {
    config: ConsumerConfig,
    /// dropped by `close`
    session: Mutex<Option<Session>>,
    inner: tokio::sync::Mutex<ConsumerInner>,
    state: Mutex<ConsumerState>,
    group: Mutex<Option<ConsumerGroupState>>,
    offsets: Mutex<OffsetBook>,
    fetch_state: Arc<Mutex<FetchState>>,
    wakeup: Arc<Notify>,
    tracker: Arc<PollTracker>,
    notify_shutdown: broadcast::Sender<()>,
    closed: AtomicCell<bool>,
}

impl Consumer {
    /// The consumer shares `session` and never closes it. `close` drops
    /// every handle the consumer holds.
    pub fn new(config: &ConsumerConfig, session: Session) -> AppResult<Consumer> {
        if config.group_id.trim().is_empty() {
            return Err(AppError::ValidationError(
                "consumer group id must not be empty".to_string(),
            ));
        }
        config.validate()?;
        let (arrival_tx, arrival_rx) = async_channel::bounded(config.arrival_queue_size);
        let (events_tx, events_rx) = mpsc::channel(4);
        let (notify_shutdown, _) = broadcast::channel(1);

        Ok(Consumer {
            config: config.clone(),
            session: Mutex::new(Some(session.clone())),
            inner: tokio::sync::Mutex::new(ConsumerInner {
                coordinator: GroupCoordinatorClient::new(session, config.clone()),
                topics: Vec::new(),
                reset_policy: config.reset_policy,
                generation: -1,
                arrival_rx,
                arrival_tx: Some(arrival_tx),
                events_tx,
                events_rx,
                fetcher: None,
            }),
            state: Mutex::new(ConsumerState::Unsubscribed),
            group: Mutex::new(None),
            offsets: Mutex::new(OffsetBook::default()),
            fetch_state: Arc::new(Mutex::new(FetchState::default())),
            wakeup: Arc::new(Notify::new()),
            tracker: Arc::new(PollTracker::default()),
            notify_shutdown,
            closed: AtomicCell::new(false),
        })
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load()
    }

    /// Partitions of the current generation.
    pub fn assignment(&self) -> BTreeSet<TopicPartition> {
        self.group
            .lock()
            .as_ref()
            .map(|group| group.assigned_partitions.clone())
            .unwrap_or_default()
    }

    pub fn group_state(&self) -> Option<ConsumerGroupState> {
        self.group.lock().clone()
    }

    pub fn generation(&self) -> Option<i32> {
        self.group.lock().as_ref().map(|group| group.generation_id)
    }

    pub fn member_id(&self) -> Option<String> {
        self.group.lock().as_ref().map(|group| group.member_id.clone())
    }

    /// Offset of the next record `poll` will return for the partition.
    pub fn position(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.offsets.lock().consumed.get(topic_partition).copied()
    }

    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.offsets.lock().committed.get(topic_partition).copied()
    }

    fn transition(&self, target: ConsumerState) -> AppResult<()> {
        let mut state = self.state.lock();
        if !ConsumerState::can_transition_to(*state, target) {
            return Err(AppError::IllegalStateError(format!(
                "consumer cannot go from {:?} to {:?}",
                *state, target
            )));
        }
        debug!("consumer {:?} -> {:?}", *state, target);
        *state = target;
        Ok(())
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ClosedError("consumer"));
        }
        Ok(())
    }

    /// Joins the group for `topics`. Partitions without a committed offset
    /// start where `reset_policy` says.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        topics: &[S],
        reset_policy: ResetPolicy,
    ) -> AppResult<()> {
        self.ensure_open()?;
        let topics: Vec<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();
        if topics.is_empty() || topics.iter().any(|t| t.trim().is_empty()) {
            return Err(AppError::ValidationError(
                "subscribe needs at least one non-empty topic".to_string(),
            ));
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        self.transition(ConsumerState::Subscribing)?;
        inner.topics = topics;
        inner.reset_policy = reset_policy;
        self.fetch_state.lock().reset_policy = reset_policy;

        if let Err(e) = self.rejoin(inner).await {
            warn!("subscribe to {} failed: {}", inner.topics.join(","), e);
            if let Err(leave_error) = inner.coordinator.leave().await {
                debug!("leaving after a failed subscribe: {}", leave_error);
            }
            self.transition(ConsumerState::Unsubscribed)?;
            return Err(e);
        }
        self.start_fetcher(inner);
        info!(
            "subscribed to {} in group {}",
            inner.topics.join(","),
            self.config.group_id
        );
        Ok(())
    }

    fn start_fetcher(&self, inner: &mut ConsumerInner) {
        let Some(session) = self.session.lock().clone() else {
            return;
        };
        let Some(arrivals) = inner.arrival_tx.take() else {
            return;
        };
        let fetcher = Fetcher {
            session,
            state: self.fetch_state.clone(),
            arrivals,
            max_records: self.config.fetch_max_records,
            fetch_wait: self.config.fetch_wait(),
            wakeup: self.wakeup.clone(),
            shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
        };
        inner.fetcher = Some(tokio::spawn(fetcher.run()));
    }

    /// Joins the next generation and lines positions and the fetcher up with
    /// its assignment.
    async fn rejoin(&self, inner: &mut ConsumerInner) -> AppResult<()> {
        inner.coordinator.stop_heartbeat().await;
        let topics = inner.topics.clone();
        let group = inner.coordinator.join_and_sync(&topics).await?;
        let assigned = &group.assigned_partitions;

        // positions of partitions kept across the rebalance stay
        let (kept, revoked) = {
            let mut offsets = self.offsets.lock();
            let before = offsets.consumed.len();
            offsets.consumed.retain(|tp, _| assigned.contains(tp));
            offsets.committed.retain(|tp, _| assigned.contains(tp));
            (offsets.consumed.clone(), before - offsets.consumed.len())
        };
        if revoked > 0 {
            info!("{} partitions revoked at generation {}", revoked, group.generation_id);
        }

        let added: Vec<TopicPartition> = assigned
            .iter()
            .filter(|tp| !kept.contains_key(*tp))
            .cloned()
            .collect();
        if !added.is_empty() {
            let committed = inner.coordinator.fetch_offsets(added.clone()).await?;
            for topic_partition in added {
                let position = match committed.get(&topic_partition) {
                    Some(&offset) => offset,
                    None => {
                        inner
                            .coordinator
                            .list_offsets(&topic_partition, inner.reset_policy)
                            .await?
                    }
                };
                debug!("{} starts at offset {}", topic_partition, position);
                let mut offsets = self.offsets.lock();
                if let Some(&offset) = committed.get(&topic_partition) {
                    offsets.committed.insert(topic_partition.clone(), offset);
                }
                offsets.consumed.insert(topic_partition, position);
            }
        }

        inner.generation = group.generation_id;
        {
            let positions: BTreeMap<TopicPartition, i64> = self
                .offsets
                .lock()
                .consumed
                .iter()
                .map(|(tp, offset)| (tp.clone(), *offset))
                .collect();
            let mut fetch_state = self.fetch_state.lock();
            fetch_state.generation = group.generation_id;
            fetch_state.positions = positions;
        }
        // whatever is queued belongs to the previous generation
        while let Ok(arrival) = inner.arrival_rx.try_recv() {
            if let Arrival::Failed(e) = arrival {
                return Err(e);
            }
        }
        while inner.events_rx.try_recv().is_ok() {}

        *self.group.lock() = Some(group);
        self.tracker.touch();
        inner
            .coordinator
            .start_heartbeat(inner.events_tx.clone(), self.tracker.clone())
            .await?;
        self.wakeup.notify_one();
        self.transition(ConsumerState::Stable)
    }

    /// Waits up to `timeout` for records of the assigned partitions.
    ///
    /// An empty result is the normal outcome of a quiet timeout. A rebalance
    /// ends the wait early; the result then carries the event along with what
    /// was already collected and the next call rejoins the group first.
    pub async fn poll(&self, timeout: Duration) -> AppResult<PollResult> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        self.ensure_open()?;
        let mut guard = tokio::select! {
            biased;
            _ = shutdown.recv() => return Err(AppError::ClosedError("consumer")),
            guard = self.inner.lock() => guard,
        };
        let inner = &mut *guard;

        match self.state() {
            ConsumerState::Stable => {}
            ConsumerState::Rebalancing => {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => return Err(AppError::ClosedError("consumer")),
                    rejoined = self.rejoin(inner) => rejoined?,
                }
            }
            ConsumerState::Closed => return Err(AppError::ClosedError("consumer")),
            state => {
                return Err(AppError::IllegalStateError(format!(
                    "poll needs a subscribed consumer, state is {:?}",
                    state
                )))
            }
        }

        self.tracker.begin();
        let result = self.collect(inner, timeout, &mut shutdown).await;
        self.tracker.end();
        result
    }

    async fn collect(
        &self,
        inner: &mut ConsumerInner,
        timeout: Duration,
        shutdown: &mut Shutdown,
    ) -> AppResult<PollResult> {
        let deadline = Instant::now() + timeout;
        let mut batches: BTreeMap<TopicPartition, Batch> = BTreeMap::new();
        let mut rebalance = None;

        loop {
            if let Ok(event) = inner.events_rx.try_recv() {
                if event.generation_id == inner.generation {
                    rebalance = Some(event);
                    break;
                }
                continue;
            }
            if let Ok(arrival) = inner.arrival_rx.try_recv() {
                self.accept(inner.generation, arrival, &mut batches)?;
                continue;
            }
            if !batches.is_empty() {
                break;
            }

            let wake = tokio::select! {
                biased;
                _ = shutdown.recv() => Wake::Closed,
                event = inner.events_rx.recv() => Wake::Event(event),
                arrival = inner.arrival_rx.recv() => Wake::Arrival(arrival.ok()),
                _ = tokio::time::sleep_until(deadline) => Wake::Timeout,
            };
            match wake {
                Wake::Closed => return Err(AppError::ClosedError("consumer")),
                Wake::Event(Some(event)) if event.generation_id == inner.generation => {
                    rebalance = Some(event);
                    break;
                }
                Wake::Event(Some(event)) => {
                    trace!("ignoring event of generation {}", event.generation_id)
                }
                Wake::Arrival(Some(arrival)) => {
                    self.accept(inner.generation, arrival, &mut batches)?
                }
                Wake::Event(None) | Wake::Arrival(None) | Wake::Timeout => break,
            }
        }

        if let Some(event) = &rebalance {
            info!(
                "generation {} ended ({:?}), rejoining on next poll",
                event.generation_id, event.cause
            );
            self.transition(ConsumerState::Rebalancing)?;
        }
        Ok(PollResult {
            batches: batches.into_values().filter(|batch| !batch.is_empty()).collect(),
            rebalance,
        })
    }

    /// Keeps records of the current generation and assignment that move past
    /// the consumed position, and advances it.
    fn accept(
        &self,
        generation: i32,
        arrival: Arrival,
        batches: &mut BTreeMap<TopicPartition, Batch>,
    ) -> AppResult<()> {
        let (round_generation, fetched) = match arrival {
            Arrival::Batches {
                generation,
                batches,
            } => (generation, batches),
            Arrival::Failed(e) => return Err(e),
        };
        if round_generation != generation {
            trace!(
                "dropping {} batches of generation {}",
                fetched.len(),
                round_generation
            );
            return Ok(());
        }
        let mut offsets = self.offsets.lock();
        for batch in fetched {
            let topic_partition = batch.topic_partition().clone();
            let Some(position) = offsets.consumed.get(&topic_partition).copied() else {
                trace!("dropping records of unassigned {}", topic_partition);
                continue;
            };
            let fresh: Vec<_> = batch
                .into_iter()
                .filter(|record| record.offset >= position)
                .collect();
            let Some(last) = fresh.last().map(|record| record.offset) else {
                continue;
            };
            offsets.consumed.insert(topic_partition.clone(), last + 1);
            batches
                .entry(topic_partition.clone())
                .or_insert_with(|| Batch::new(topic_partition))
                .extend(fresh);
        }
        Ok(())
    }

    /// Commits the given offsets for the current generation. Every partition
    /// must be assigned to this member. Re-committing the current offset is a
    /// no-op, going backwards is rejected.
    pub async fn commit(&self, offsets: Vec<PartitionOffset>) -> AppResult<()> {
        self.ensure_open()?;
        let mut guard = self.inner.lock().await;
        self.commit_locked(&mut guard, offsets).await
    }

    /// Commits the consumed position of every assigned partition.
    pub async fn commit_consumed(&self) -> AppResult<()> {
        self.ensure_open()?;
        let mut guard = self.inner.lock().await;
        let offsets = {
            let assignment = self.assignment();
            let book = self.offsets.lock();
            assignment
                .iter()
                .filter_map(|tp| {
                    book.consumed
                        .get(tp)
                        .map(|&offset| PartitionOffset::from_topic_partition(tp, offset))
                })
                .collect()
        };
        self.commit_locked(&mut guard, offsets).await
    }

    async fn commit_locked(
        &self,
        inner: &mut ConsumerInner,
        offsets: Vec<PartitionOffset>,
    ) -> AppResult<()> {
        match self.state() {
            ConsumerState::Stable | ConsumerState::Rebalancing => {}
            ConsumerState::Closed => return Err(AppError::ClosedError("consumer")),
            state => {
                return Err(AppError::IllegalStateError(format!(
                    "commit needs a subscribed consumer, state is {:?}",
                    state
                )))
            }
        }
        for offset in &offsets {
            offset.validate()?;
        }

        let mut pending: BTreeMap<TopicPartition, i64> = BTreeMap::new();
        {
            let book = self.offsets.lock();
            for offset in &offsets {
                let topic_partition = offset.topic_partition();
                if !inner.coordinator.is_assigned(&topic_partition) {
                    return Err(AppError::NotAssignedError(topic_partition));
                }
                match book.committed.get(&topic_partition) {
                    Some(&committed) if offset.offset == committed => continue,
                    Some(&committed) if offset.offset < committed => {
                        return Err(AppError::ValidationError(format!(
                            "offset {} for {} is below the committed offset {}",
                            offset.offset, topic_partition, committed
                        )));
                    }
                    _ => {
                        pending.insert(topic_partition, offset.offset);
                    }
                }
            }
        }
        if pending.is_empty() {
            trace!("nothing new to commit");
            return Ok(());
        }

        let request: Vec<PartitionOffset> = pending
            .iter()
            .map(|(tp, &offset)| PartitionOffset::from_topic_partition(tp, offset))
            .collect();
        match inner.coordinator.commit_offsets(request).await {
            Ok(()) => {
                debug!("committed {} offsets", pending.len());
                self.offsets.lock().committed.extend(pending);
                Ok(())
            }
            Err(e) => {
                if e.needs_rejoin() && self.state() == ConsumerState::Stable {
                    warn!("commit rejected for generation {}: {}", inner.generation, e);
                    self.transition(ConsumerState::Rebalancing)?;
                }
                Err(e)
            }
        }
    }

    /// Leaves the group and stops the background tasks. A `poll` blocked
    /// meanwhile returns `ClosedError`. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true) {
            return;
        }
        let _ = self.notify_shutdown.send(());
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        *self.state.lock() = ConsumerState::Closed;

        if let Err(e) = inner.coordinator.release().await {
            warn!("leaving group {} failed: {}", self.config.group_id, e);
        }
        if let Some(fetcher) = inner.fetcher.take() {
            if let Err(e) = fetcher.await {
                warn!("fetcher task ended abnormally: {}", e);
            }
        }
        self.session.lock().take();
        *self.group.lock() = None;
        info!("consumer of group {} closed", self.config.group_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::message::Record;
    use crate::network::{ErrorCode, ProduceRequest};
    use crate::service::SessionConfig;

    fn consumer_config() -> ConsumerConfig {
        ConsumerConfig {
            session_timeout_ms: 2_000,
            heartbeat_interval_ms: 50,
            fetch_wait_ms: 10,
            retry_backoff_ms: 1,
            ..ConsumerConfig::new("g1")
        }
    }

    fn setup(partitions: i32) -> (MemoryBroker, Session, Consumer) {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", partitions).unwrap();
        let session = Session::connect(&SessionConfig::default(), broker.transport()).unwrap();
        let consumer = Consumer::new(&consumer_config(), session.clone()).unwrap();
        (broker, session, consumer)
    }

    fn produce(broker: &MemoryBroker, partition: i32, values: &[&str]) {
        broker.handle(crate::network::BrokerRequest::Produce(ProduceRequest {
            topic_partition: TopicPartition::new("orders", partition),
            records: values
                .iter()
                .map(|v| Record::new("orders", v.to_string()))
                .collect(),
        }));
    }

    async fn poll_until(consumer: &Consumer, count: usize) -> Vec<i64> {
        let mut offsets = Vec::new();
        for _ in 0..50 {
            let result = consumer.poll(Duration::from_millis(50)).await.unwrap();
            offsets.extend(result.records().map(|r| r.offset));
            if offsets.len() >= count {
                break;
            }
        }
        offsets
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let (_broker, session, _consumer) = setup(1);
        for config in [
            ConsumerConfig {
                heartbeat_interval_ms: 0,
                ..consumer_config()
            },
            ConsumerConfig {
                fetch_max_records: 0,
                ..consumer_config()
            },
            ConsumerConfig {
                arrival_queue_size: 0,
                ..consumer_config()
            },
            ConsumerConfig::new(" "),
        ] {
            let result = Consumer::new(&config, session.clone());
            assert!(matches!(result, Err(AppError::ValidationError(_))), "{:?}", config);
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_session() {
        let (broker, session, consumer) = setup(2);
        produce(&broker, 0, &["a"]);
        consumer.subscribe(&["orders"], ResetPolicy::Earliest).await.unwrap();
        assert_eq!(consumer.poll(Duration::from_secs(1)).await.unwrap().record_count(), 1);
        assert!(session.handle_count() > 1);

        consumer.close().await;
        assert_eq!(session.handle_count(), 1);
        assert!(!session.is_closed());
        session.close().await;
    }

    #[tokio::test]
    async fn test_poll_requires_subscription() {
        let (_broker, session, consumer) = setup(1);
        let result = consumer.poll(Duration::ZERO).await;
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
        assert!(matches!(
            consumer.subscribe::<&str>(&[], ResetPolicy::Earliest).await,
            Err(AppError::ValidationError(_))
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_earliest_reads_from_start_and_commits() {
        let (broker, session, consumer) = setup(1);
        produce(&broker, 0, &["a", "b", "c"]);
        consumer.subscribe(&["orders"], ResetPolicy::Earliest).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stable);

        let offsets = poll_until(&consumer, 3).await;
        assert_eq!(offsets, vec![0, 1, 2]);
        let tp = TopicPartition::new("orders", 0);
        assert_eq!(consumer.position(&tp), Some(3));

        consumer.commit_consumed().await.unwrap();
        assert_eq!(broker.committed_offset("g1", &tp), Some(3));
        assert_eq!(consumer.committed(&tp), Some(3));
        // same offset again is a no-op, a lower one is refused
        consumer
            .commit(vec![PartitionOffset::new("orders", 0, 3)])
            .await
            .unwrap();
        let lower = consumer.commit(vec![PartitionOffset::new("orders", 0, 1)]).await;
        assert!(matches!(lower, Err(AppError::ValidationError(_))));

        let foreign = consumer.commit(vec![PartitionOffset::new("orders", 5, 1)]).await;
        assert!(matches!(foreign, Err(AppError::NotAssignedError(_))));
        consumer.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_first_poll_returns_backlog_of_every_partition() {
        let (broker, session, consumer) = setup(2);
        produce(&broker, 0, &["a", "b", "c"]);
        produce(&broker, 1, &["d", "e", "f"]);
        consumer.subscribe(&["orders"], ResetPolicy::Earliest).await.unwrap();

        let result = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.record_count(), 6);
        assert_eq!(result.batches.len(), 2);
        for batch in &result.batches {
            assert_eq!(batch.first_offset(), Some(0));
            assert_eq!(batch.last_offset(), Some(2));
        }
        consumer.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let (broker, session, consumer) = setup(1);
        produce(&broker, 0, &["old"]);
        consumer.subscribe(&["orders"], ResetPolicy::Latest).await.unwrap();
        let empty = consumer.poll(Duration::ZERO).await.unwrap();
        assert!(empty.is_empty());

        produce(&broker, 0, &["new"]);
        let offsets = poll_until(&consumer, 1).await;
        assert_eq!(offsets, vec![1]);
        consumer.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_resumes_from_committed_offset() {
        let (broker, session, consumer) = setup(1);
        produce(&broker, 0, &["a", "b", "c", "d"]);
        consumer.subscribe(&["orders"], ResetPolicy::Earliest).await.unwrap();
        poll_until(&consumer, 4).await;
        consumer
            .commit(vec![PartitionOffset::new("orders", 0, 2)])
            .await
            .unwrap();
        consumer.close().await;

        let next = Consumer::new(&consumer_config(), session.clone()).unwrap();
        next.subscribe(&["orders"], ResetPolicy::Latest).await.unwrap();
        assert_eq!(next.position(&TopicPartition::new("orders", 0)), Some(2));
        assert_eq!(poll_until(&next, 2).await, vec![2, 3]);
        next.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_out_of_range_position_is_reset() {
        let (broker, session, consumer) = setup(1);
        produce(&broker, 0, &["a", "b", "c", "d"]);
        consumer.subscribe(&["orders"], ResetPolicy::Earliest).await.unwrap();
        assert_eq!(poll_until(&consumer, 4).await.len(), 4);
        consumer
            .commit(vec![PartitionOffset::new("orders", 0, 1)])
            .await
            .unwrap();
        consumer.close().await;

        // retention dropped what the group never consumed
        broker.truncate_before(&TopicPartition::new("orders", 0), 3);
        let next = Consumer::new(&consumer_config(), session.clone()).unwrap();
        next.subscribe(&["orders"], ResetPolicy::Earliest).await.unwrap();
        assert_eq!(poll_until(&next, 1).await, vec![3]);
        next.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_poll() {
        let (_broker, session, consumer) = setup(1);
        consumer.subscribe(&["orders"], ResetPolicy::Latest).await.unwrap();
        let consumer = Arc::new(consumer);
        let polling = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.poll(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer.close().await;
        consumer.close().await;

        let result = polling.await.unwrap();
        assert!(matches!(result, Err(AppError::ClosedError("consumer"))));
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert!(matches!(
            consumer.poll(Duration::ZERO).await,
            Err(AppError::ClosedError(_))
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_failed_subscribe_returns_to_unsubscribed() {
        let broker = MemoryBroker::new();
        let session = Session::connect(&SessionConfig::default(), broker.transport()).unwrap();
        let config = ConsumerConfig {
            session_timeout_ms: 5,
            heartbeat_interval_ms: 1,
            ..ConsumerConfig::new("g1")
        };
        let consumer = Consumer::new(&config, session.clone()).unwrap();
        let result = consumer.subscribe(&["orders"], ResetPolicy::Earliest).await;
        assert_eq!(
            result.unwrap_err().code(),
            Some(ErrorCode::InvalidSessionTimeout)
        );
        assert_eq!(consumer.state(), ConsumerState::Unsubscribed);
        session.close().await;
    }
}
