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

//! Requests the client sends to a broker and the matching responses.
//! Encoding them on the wire is the transport's business.

use std::collections::HashMap;

use crate::message::{ConsumerRecord, PartitionOffset, Record, TopicPartition};
use crate::service::ResetPolicy;

use super::ErrorCode;

#[derive(Debug, Clone)]
pub enum BrokerRequest {
    Metadata(MetadataRequest),
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    ListOffsets(ListOffsetsRequest),
    JoinGroup(JoinGroupRequest),
    SyncGroup(SyncGroupRequest),
    Heartbeat(HeartbeatRequest),
    LeaveGroup(LeaveGroupRequest),
    OffsetCommit(OffsetCommitRequest),
    OffsetFetch(OffsetFetchRequest),
}

impl BrokerRequest {
    pub fn api_name(&self) -> &'static str {
        match self {
            BrokerRequest::Metadata(_) => "metadata",
            BrokerRequest::Produce(_) => "produce",
            BrokerRequest::Fetch(_) => "fetch",
            BrokerRequest::ListOffsets(_) => "list_offsets",
            BrokerRequest::JoinGroup(_) => "join_group",
            BrokerRequest::SyncGroup(_) => "sync_group",
            BrokerRequest::Heartbeat(_) => "heartbeat",
            BrokerRequest::LeaveGroup(_) => "leave_group",
            BrokerRequest::OffsetCommit(_) => "offset_commit",
            BrokerRequest::OffsetFetch(_) => "offset_fetch",
        }
    }
}

#[derive(Debug, Clone)]
pub enum BrokerResponse {
    Metadata(MetadataResponse),
    Produce(ProduceResponse),
    Fetch(FetchResponse),
    ListOffsets(ListOffsetsResponse),
    JoinGroup(JoinGroupResponse),
    SyncGroup(SyncGroupResponse),
    Heartbeat(HeartbeatResponse),
    LeaveGroup(LeaveGroupResponse),
    OffsetCommit(OffsetCommitResponse),
    OffsetFetch(OffsetFetchResponse),
}

impl BrokerResponse {
    pub fn api_name(&self) -> &'static str {
        match self {
            BrokerResponse::Metadata(_) => "metadata",
            BrokerResponse::Produce(_) => "produce",
            BrokerResponse::Fetch(_) => "fetch",
            BrokerResponse::ListOffsets(_) => "list_offsets",
            BrokerResponse::JoinGroup(_) => "join_group",
            BrokerResponse::SyncGroup(_) => "sync_group",
            BrokerResponse::Heartbeat(_) => "heartbeat",
            BrokerResponse::LeaveGroup(_) => "leave_group",
            BrokerResponse::OffsetCommit(_) => "offset_commit",
            BrokerResponse::OffsetFetch(_) => "offset_fetch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    pub error: ErrorCode,
    pub partition_count: i32,
}

#[derive(Debug, Clone)]
pub struct MetadataResponse {
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub topic_partition: TopicPartition,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct ProduceResponse {
    pub error: ErrorCode,
    /// offset assigned to the first record of the request
    pub base_offset: i64,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub topic_partition: TopicPartition,
    pub offset: i64,
    pub max_records: usize,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub error: ErrorCode,
    pub records: Vec<ConsumerRecord>,
    pub log_end_offset: i64,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsRequest {
    pub topic_partition: TopicPartition,
    pub reset_policy: ResetPolicy,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsResponse {
    pub error: ErrorCode,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    pub group_id: String,
    /// empty for a member joining for the first time
    pub member_id: String,
    pub client_id: String,
    pub topics: Vec<String>,
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct JoinGroupResponse {
    pub error: ErrorCode,
    pub member_id: String,
    pub generation_id: i32,
    pub leader_id: String,
}

#[derive(Debug, Clone)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub member_id: String,
    pub generation_id: i32,
}

#[derive(Debug, Clone)]
pub struct SyncGroupResponse {
    pub error: ErrorCode,
    pub assignment: Vec<TopicPartition>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub member_id: String,
    pub generation_id: i32,
}

#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    pub error: ErrorCode,
}

#[derive(Debug, Clone)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

#[derive(Debug, Clone)]
pub struct LeaveGroupResponse {
    pub error: ErrorCode,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub member_id: String,
    pub generation_id: i32,
    pub offsets: Vec<PartitionOffset>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitResponse {
    pub error: ErrorCode,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchResponse {
    pub error: ErrorCode,
    /// partitions without a committed offset are absent
    pub offsets: HashMap<TopicPartition, i64>,
}
