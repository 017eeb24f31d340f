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

//! In-process broker.
//!
//! Keeps partition logs, consumer groups and committed offsets in memory and
//! answers [`BrokerRequest`]s synchronously. [`MemoryTransport`] plugs it into
//! a [`Session`](crate::network::Session), which makes it the collaborator
//! for tests and for the demo binary.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::message::TopicPartition;
use crate::network::*;
use crate::service::ResetPolicy;
use crate::{AppError, AppResult};

pub use group::{GroupMetadata, GroupState, MemberMetadata};
pub use partition_log::PartitionLog;

mod group;
mod partition_log;

pub const DEFAULT_ADDRESS: &str = "localhost:9092";
pub const MIN_SESSION_TIMEOUT_MS: u64 = 10;
pub const MAX_SESSION_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    addresses: Vec<String>,
    reachable: AtomicCell<bool>,
    /// partitions given to unknown topics on first use, 0 disables it
    auto_create_partitions: i32,
    topics: DashMap<String, i32>,
    logs: DashMap<TopicPartition, PartitionLog>,
    groups: Mutex<HashMap<String, GroupMetadata>>,
    injected_produce_errors: Mutex<VecDeque<ErrorCode>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::with_addresses(vec![DEFAULT_ADDRESS.to_string()])
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addresses(addresses: Vec<String>) -> Self {
        Self::build(addresses, 0)
    }

    pub fn with_auto_create_topics(partitions: i32) -> Self {
        Self::build(vec![DEFAULT_ADDRESS.to_string()], partitions.max(0))
    }

    fn build(addresses: Vec<String>, auto_create_partitions: i32) -> Self {
        MemoryBroker {
            inner: Arc::new(BrokerInner {
                addresses,
                reachable: AtomicCell::new(true),
                auto_create_partitions,
                topics: DashMap::new(),
                logs: DashMap::new(),
                groups: Mutex::new(HashMap::new()),
                injected_produce_errors: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.inner.addresses
    }

    /// Creates a topic, or does nothing if it exists with the same layout.
    pub fn create_topic(&self, name: &str, partitions: i32) -> AppResult<()> {
        if name.is_empty() || partitions <= 0 {
            return Err(AppError::ValidationError(format!(
                "cannot create topic '{}' with {} partitions",
                name, partitions
            )));
        }
        if let Some(existing) = self.inner.topics.get(name) {
            if *existing != partitions {
                return Err(AppError::ValidationError(format!(
                    "topic {} already exists with {} partitions",
                    name, *existing
                )));
            }
            return Ok(());
        }
        for partition in 0..partitions {
            let tp = TopicPartition::new(name, partition);
            self.inner.logs.insert(tp.clone(), PartitionLog::new(tp));
        }
        self.inner.topics.insert(name.to_string(), partitions);
        info!("created topic {} with {} partitions", name, partitions);
        Ok(())
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            connected: None,
        }
    }

    /// An unreachable broker refuses connections and breaks live ones.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load()
    }

    /// The next `count` produce requests are answered with `code`.
    pub fn fail_next_produces(&self, count: usize, code: ErrorCode) {
        let mut injected = self.inner.injected_produce_errors.lock();
        injected.extend(std::iter::repeat(code).take(count));
    }

    pub fn log_end_offset(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.inner
            .logs
            .get(topic_partition)
            .map(|log| log.log_end_offset())
    }

    /// Simulates retention by dropping records below `offset`.
    pub fn truncate_before(&self, topic_partition: &TopicPartition, offset: i64) {
        if let Some(mut log) = self.inner.logs.get_mut(topic_partition) {
            log.truncate_before(offset);
        }
    }

    pub fn group_generation(&self, group_id: &str) -> Option<i32> {
        self.inner
            .groups
            .lock()
            .get(group_id)
            .map(|group| group.generation_id())
    }

    pub fn group_state(&self, group_id: &str) -> Option<GroupState> {
        self.inner
            .groups
            .lock()
            .get(group_id)
            .map(|group| group.state())
    }

    pub fn group_members(&self, group_id: &str) -> usize {
        self.inner
            .groups
            .lock()
            .get(group_id)
            .map(|group| group.member_count())
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.inner
            .groups
            .lock()
            .get(group_id)
            .and_then(|group| group.committed(topic_partition))
    }

    pub fn handle(&self, request: BrokerRequest) -> BrokerResponse {
        trace!("broker handling {} request", request.api_name());
        match request {
            BrokerRequest::Metadata(request) => BrokerResponse::Metadata(self.handle_metadata(request)),
            BrokerRequest::Produce(request) => BrokerResponse::Produce(self.handle_produce(request)),
            BrokerRequest::Fetch(request) => BrokerResponse::Fetch(self.handle_fetch(request)),
            BrokerRequest::ListOffsets(request) => {
                BrokerResponse::ListOffsets(self.handle_list_offsets(request))
            }
            BrokerRequest::JoinGroup(request) => {
                BrokerResponse::JoinGroup(self.handle_join_group(request))
            }
            BrokerRequest::SyncGroup(request) => {
                BrokerResponse::SyncGroup(self.handle_sync_group(request))
            }
            BrokerRequest::Heartbeat(request) => {
                BrokerResponse::Heartbeat(self.handle_heartbeat(request))
            }
            BrokerRequest::LeaveGroup(request) => {
                BrokerResponse::LeaveGroup(self.handle_leave_group(request))
            }
            BrokerRequest::OffsetCommit(request) => {
                BrokerResponse::OffsetCommit(self.handle_offset_commit(request))
            }
            BrokerRequest::OffsetFetch(request) => {
                BrokerResponse::OffsetFetch(self.handle_offset_fetch(request))
            }
        }
    }

    fn topic_partitions(&self, topic: &str) -> Option<i32> {
        if let Some(count) = self.inner.topics.get(topic) {
            return Some(*count);
        }
        if self.inner.auto_create_partitions > 0 && !topic.is_empty() {
            let partitions = self.inner.auto_create_partitions;
            self.create_topic(topic, partitions).ok()?;
            return Some(partitions);
        }
        None
    }

    fn partition_counts(&self) -> HashMap<String, i32> {
        self.inner
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn handle_metadata(&self, request: MetadataRequest) -> MetadataResponse {
        let names = if request.topics.is_empty() {
            let mut all: Vec<String> = self.inner.topics.iter().map(|e| e.key().clone()).collect();
            all.sort();
            all
        } else {
            request.topics
        };
        let topics = names
            .into_iter()
            .map(|name| match self.topic_partitions(&name) {
                Some(partition_count) => TopicMetadata {
                    name,
                    error: ErrorCode::None,
                    partition_count,
                },
                None => TopicMetadata {
                    name,
                    error: ErrorCode::UnknownTopicOrPartition,
                    partition_count: 0,
                },
            })
            .collect();
        MetadataResponse { topics }
    }

    fn handle_produce(&self, request: ProduceRequest) -> ProduceResponse {
        if let Some(code) = self.inner.injected_produce_errors.lock().pop_front() {
            debug!("failing produce to {} with {:?}", request.topic_partition, code);
            return ProduceResponse {
                error: code,
                base_offset: -1,
            };
        }
        self.topic_partitions(&request.topic_partition.topic);
        match self.inner.logs.get_mut(&request.topic_partition) {
            Some(mut log) => ProduceResponse {
                error: ErrorCode::None,
                base_offset: log.append(request.records),
            },
            None => ProduceResponse {
                error: ErrorCode::UnknownTopicOrPartition,
                base_offset: -1,
            },
        }
    }

    fn handle_fetch(&self, request: FetchRequest) -> FetchResponse {
        let Some(log) = self.inner.logs.get(&request.topic_partition) else {
            return FetchResponse {
                error: ErrorCode::UnknownTopicOrPartition,
                records: vec![],
                log_end_offset: -1,
            };
        };
        match log.read(request.offset, request.max_records) {
            Ok(records) => FetchResponse {
                error: ErrorCode::None,
                records,
                log_end_offset: log.log_end_offset(),
            },
            Err(error) => FetchResponse {
                error,
                records: vec![],
                log_end_offset: log.log_end_offset(),
            },
        }
    }

    fn handle_list_offsets(&self, request: ListOffsetsRequest) -> ListOffsetsResponse {
        match self.inner.logs.get(&request.topic_partition) {
            Some(log) => ListOffsetsResponse {
                error: ErrorCode::None,
                offset: match request.reset_policy {
                    ResetPolicy::Earliest => log.log_start_offset(),
                    ResetPolicy::Latest => log.log_end_offset(),
                },
            },
            None => ListOffsetsResponse {
                error: ErrorCode::UnknownTopicOrPartition,
                offset: -1,
            },
        }
    }

    /// Members whose session timed out are dropped before any group request
    /// is served, which starts a new generation for the rest.
    fn with_group<R>(&self, group_id: &str, f: impl FnOnce(&mut GroupMetadata) -> R) -> R {
        let partition_counts = self.partition_counts();
        let mut groups = self.inner.groups.lock();
        let group = groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupMetadata::new(group_id));
        if !group.expire_members(Instant::now()).is_empty() {
            group.rebalance(&partition_counts);
        }
        f(group)
    }

    fn handle_join_group(&self, request: JoinGroupRequest) -> JoinGroupResponse {
        let failed = |error| JoinGroupResponse {
            error,
            member_id: request.member_id.clone(),
            generation_id: -1,
            leader_id: String::new(),
        };
        if request.group_id.is_empty() {
            return failed(ErrorCode::InvalidGroupId);
        }
        if !(MIN_SESSION_TIMEOUT_MS..=MAX_SESSION_TIMEOUT_MS).contains(&request.session_timeout_ms) {
            return failed(ErrorCode::InvalidSessionTimeout);
        }
        for topic in &request.topics {
            self.topic_partitions(topic);
        }
        let partition_counts = self.partition_counts();
        let subscription: BTreeSet<String> = request.topics.iter().cloned().collect();
        let session_timeout = Duration::from_millis(request.session_timeout_ms);

        self.with_group(&request.group_id, |group| {
            let member_id = if request.member_id.is_empty() {
                let member_id = format!("{}-{}", request.client_id, Uuid::new_v4());
                group.add_member(MemberMetadata::new(
                    member_id.clone(),
                    request.client_id.clone(),
                    subscription,
                    session_timeout,
                ));
                group.rebalance(&partition_counts);
                member_id
            } else {
                let Some(member) = group.get_mut_member(&request.member_id) else {
                    return failed(ErrorCode::UnknownMemberId);
                };
                member.update_heartbeat();
                if *member.subscription() != subscription {
                    let client_id = member.client_id().to_string();
                    group.remove_member(&request.member_id);
                    group.add_member(MemberMetadata::new(
                        request.member_id.clone(),
                        client_id,
                        subscription,
                        session_timeout,
                    ));
                    group.rebalance(&partition_counts);
                }
                request.member_id.clone()
            };
            debug!(
                "member {} joined group {} at generation {}",
                member_id,
                group.id(),
                group.generation_id()
            );
            JoinGroupResponse {
                error: ErrorCode::None,
                member_id,
                generation_id: group.generation_id(),
                leader_id: group.leader_id().unwrap_or_default().to_string(),
            }
        })
    }

    fn handle_sync_group(&self, request: SyncGroupRequest) -> SyncGroupResponse {
        self.with_group(&request.group_id, |group| {
            let error = if !group.has_member(&request.member_id) {
                ErrorCode::UnknownMemberId
            } else if request.generation_id != group.generation_id() {
                ErrorCode::RebalanceInProgress
            } else {
                let assignment = group.complete_sync(&request.member_id).unwrap_or_default();
                return SyncGroupResponse {
                    error: ErrorCode::None,
                    assignment,
                };
            };
            SyncGroupResponse {
                error,
                assignment: vec![],
            }
        })
    }

    fn handle_heartbeat(&self, request: HeartbeatRequest) -> HeartbeatResponse {
        self.with_group(&request.group_id, |group| {
            let generation_id = group.generation_id();
            let Some(member) = group.get_mut_member(&request.member_id) else {
                return HeartbeatResponse {
                    error: ErrorCode::UnknownMemberId,
                };
            };
            member.update_heartbeat();
            let error = if request.generation_id < generation_id {
                ErrorCode::RebalanceInProgress
            } else if request.generation_id > generation_id {
                ErrorCode::IllegalGeneration
            } else {
                ErrorCode::None
            };
            HeartbeatResponse { error }
        })
    }

    fn handle_leave_group(&self, request: LeaveGroupRequest) -> LeaveGroupResponse {
        let partition_counts = self.partition_counts();
        self.with_group(&request.group_id, |group| {
            if group.remove_member(&request.member_id).is_none() {
                return LeaveGroupResponse {
                    error: ErrorCode::UnknownMemberId,
                };
            }
            info!("member {} left group {}", request.member_id, group.id());
            group.rebalance(&partition_counts);
            LeaveGroupResponse {
                error: ErrorCode::None,
            }
        })
    }

    fn handle_offset_commit(&self, request: OffsetCommitRequest) -> OffsetCommitResponse {
        self.with_group(&request.group_id, |group| {
            let Some(member) = group.get_mut_member(&request.member_id) else {
                return OffsetCommitResponse {
                    error: ErrorCode::UnknownMemberId,
                };
            };
            member.update_heartbeat();
            if request.generation_id != group.generation_id() {
                return OffsetCommitResponse {
                    error: ErrorCode::IllegalGeneration,
                };
            }
            for offset in request.offsets {
                group.commit(offset.topic_partition(), offset.offset);
            }
            OffsetCommitResponse {
                error: ErrorCode::None,
            }
        })
    }

    fn handle_offset_fetch(&self, request: OffsetFetchRequest) -> OffsetFetchResponse {
        let groups = self.inner.groups.lock();
        let offsets = match groups.get(&request.group_id) {
            Some(group) => request
                .partitions
                .into_iter()
                .filter_map(|tp| group.committed(&tp).map(|offset| (tp, offset)))
                .collect(),
            None => HashMap::new(),
        };
        OffsetFetchResponse {
            error: ErrorCode::None,
            offsets,
        }
    }
}

/// [`BrokerTransport`] over a [`MemoryBroker`], no sockets involved.
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    connected: Option<String>,
}

impl BrokerTransport for MemoryTransport {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        let known = self.broker.addresses().iter().any(|a| a == endpoint);
        if !known || !self.broker.is_reachable() {
            return Err(TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: if known {
                    "connection refused".to_string()
                } else {
                    "no broker listens there".to_string()
                },
            });
        }
        self.connected = Some(endpoint.to_string());
        Ok(())
    }

    async fn call(&mut self, request: BrokerRequest) -> Result<BrokerResponse, TransportError> {
        let Some(endpoint) = &self.connected else {
            return Err(TransportError::Disconnected("not connected".to_string()));
        };
        if !self.broker.is_reachable() {
            return Err(TransportError::Disconnected(format!("{} went away", endpoint)));
        }
        // yield so a busy session cannot starve the runtime
        tokio::task::yield_now().await;
        Ok(self.broker.handle(request))
    }

    fn disconnect(&mut self) {
        self.connected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PartitionOffset, Record};

    fn join(broker: &MemoryBroker, member_id: &str) -> JoinGroupResponse {
        match broker.handle(BrokerRequest::JoinGroup(JoinGroupRequest {
            group_id: "g1".to_string(),
            member_id: member_id.to_string(),
            client_id: "test".to_string(),
            topics: vec!["orders".to_string()],
            session_timeout_ms: 10_000,
        })) {
            BrokerResponse::JoinGroup(response) => response,
            other => panic!("unexpected {}", other.api_name()),
        }
    }

    fn sync(broker: &MemoryBroker, member_id: &str, generation_id: i32) -> SyncGroupResponse {
        match broker.handle(BrokerRequest::SyncGroup(SyncGroupRequest {
            group_id: "g1".to_string(),
            member_id: member_id.to_string(),
            generation_id,
        })) {
            BrokerResponse::SyncGroup(response) => response,
            other => panic!("unexpected {}", other.api_name()),
        }
    }

    fn heartbeat(broker: &MemoryBroker, member_id: &str, generation_id: i32) -> ErrorCode {
        match broker.handle(BrokerRequest::Heartbeat(HeartbeatRequest {
            group_id: "g1".to_string(),
            member_id: member_id.to_string(),
            generation_id,
        })) {
            BrokerResponse::Heartbeat(response) => response.error,
            other => panic!("unexpected {}", other.api_name()),
        }
    }

    #[test]
    fn test_produce_then_fetch() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 2).unwrap();
        let tp = TopicPartition::new("orders", 1);
        let response = broker.handle(BrokerRequest::Produce(ProduceRequest {
            topic_partition: tp.clone(),
            records: vec![Record::new("orders", "a"), Record::new("orders", "b")],
        }));
        let BrokerResponse::Produce(produced) = response else {
            panic!("expected produce response");
        };
        assert_eq!(produced.error, ErrorCode::None);
        assert_eq!(produced.base_offset, 0);
        assert_eq!(broker.log_end_offset(&tp), Some(2));

        let BrokerResponse::Fetch(fetched) = broker.handle(BrokerRequest::Fetch(FetchRequest {
            topic_partition: tp,
            offset: 1,
            max_records: 10,
        })) else {
            panic!("expected fetch response");
        };
        assert_eq!(fetched.records.len(), 1);
        assert_eq!(fetched.records[0].value_str(), Some("b"));
    }

    #[test]
    fn test_unknown_topic_and_auto_create() {
        let broker = MemoryBroker::new();
        let BrokerResponse::Metadata(metadata) = broker.handle(BrokerRequest::Metadata(
            MetadataRequest {
                topics: vec!["missing".to_string()],
            },
        )) else {
            panic!("expected metadata response");
        };
        assert_eq!(metadata.topics[0].error, ErrorCode::UnknownTopicOrPartition);

        let broker = MemoryBroker::with_auto_create_topics(3);
        let BrokerResponse::Metadata(metadata) = broker.handle(BrokerRequest::Metadata(
            MetadataRequest {
                topics: vec!["fresh".to_string()],
            },
        )) else {
            panic!("expected metadata response");
        };
        assert_eq!(metadata.topics[0].partition_count, 3);
        assert_eq!(broker.log_end_offset(&TopicPartition::new("fresh", 2)), Some(0));
    }

    #[test]
    fn test_injected_produce_errors() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 1).unwrap();
        broker.fail_next_produces(1, ErrorCode::NotLeaderForPartition);
        let request = ProduceRequest {
            topic_partition: TopicPartition::new("orders", 0),
            records: vec![Record::new("orders", "a")],
        };
        let BrokerResponse::Produce(first) = broker.handle(BrokerRequest::Produce(request.clone()))
        else {
            panic!("expected produce response");
        };
        assert_eq!(first.error, ErrorCode::NotLeaderForPartition);
        let BrokerResponse::Produce(second) = broker.handle(BrokerRequest::Produce(request)) else {
            panic!("expected produce response");
        };
        assert_eq!(second.error, ErrorCode::None);
        assert_eq!(second.base_offset, 0);
    }

    #[test]
    fn test_group_generations() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 2).unwrap();

        let first = join(&broker, "");
        assert_eq!(first.error, ErrorCode::None);
        assert_eq!(first.generation_id, 1);
        assert_eq!(first.leader_id, first.member_id);
        assert_eq!(sync(&broker, &first.member_id, 1).assignment.len(), 2);
        assert_eq!(broker.group_state("g1"), Some(GroupState::Stable));

        let second = join(&broker, "");
        assert_eq!(second.generation_id, 2);
        assert_eq!(heartbeat(&broker, &first.member_id, 1), ErrorCode::RebalanceInProgress);
        assert_eq!(sync(&broker, &first.member_id, 1).error, ErrorCode::RebalanceInProgress);

        // rejoining with the same subscription keeps the generation
        let rejoined = join(&broker, &first.member_id);
        assert_eq!(rejoined.generation_id, 2);
        assert_eq!(sync(&broker, &first.member_id, 2).assignment.len(), 1);
        assert_eq!(sync(&broker, &second.member_id, 2).assignment.len(), 1);
        assert_eq!(broker.group_state("g1"), Some(GroupState::Stable));
        assert_eq!(heartbeat(&broker, &second.member_id, 2), ErrorCode::None);

        assert_eq!(join(&broker, "ghost").error, ErrorCode::UnknownMemberId);
        assert_eq!(heartbeat(&broker, "ghost", 2), ErrorCode::UnknownMemberId);
    }

    #[test]
    fn test_commit_requires_current_generation() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 1).unwrap();
        let member = join(&broker, "");
        sync(&broker, &member.member_id, member.generation_id);

        let commit = |generation_id| {
            broker.handle(BrokerRequest::OffsetCommit(OffsetCommitRequest {
                group_id: "g1".to_string(),
                member_id: member.member_id.clone(),
                generation_id,
                offsets: vec![PartitionOffset::new("orders", 0, 4)],
            }))
        };
        let BrokerResponse::OffsetCommit(stale) = commit(member.generation_id - 1) else {
            panic!("expected commit response");
        };
        assert_eq!(stale.error, ErrorCode::IllegalGeneration);
        let BrokerResponse::OffsetCommit(ok) = commit(member.generation_id) else {
            panic!("expected commit response");
        };
        assert_eq!(ok.error, ErrorCode::None);
        assert_eq!(
            broker.committed_offset("g1", &TopicPartition::new("orders", 0)),
            Some(4)
        );
    }

    #[test]
    fn test_invalid_session_timeout() {
        let broker = MemoryBroker::new();
        let BrokerResponse::JoinGroup(response) =
            broker.handle(BrokerRequest::JoinGroup(JoinGroupRequest {
                group_id: "g1".to_string(),
                member_id: String::new(),
                client_id: "test".to_string(),
                topics: vec![],
                session_timeout_ms: 1,
            }))
        else {
            panic!("expected join response");
        };
        assert_eq!(response.error, ErrorCode::InvalidSessionTimeout);
    }
}
