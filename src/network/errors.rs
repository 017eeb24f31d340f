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

/// Broker error codes understood by the client. Numeric values follow the
/// kafka protocol so a wire transport can map them one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ErrorCode {
    Unknown = -1,
    None = 0,

    /// produce and fetch
    OffsetOutOfRange = 1,
    CorruptMessage = 2,
    UnknownTopicOrPartition = 3,
    LeaderNotAvailable = 5,
    NotLeaderForPartition = 6,
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    MessageTooLarge = 10,
    NetworkException = 13,
    InvalidTopic = 17,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,

    /// consumer group
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    IllegalGeneration = 22,
    InvalidGroupId = 24,
    UnknownMemberId = 25,
    InvalidSessionTimeout = 26,
    RebalanceInProgress = 27,

    InvalidRequest = 42,
}

impl ErrorCode {
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "The server experienced an unexpected error when processing the request",
            ErrorCode::None => "",
            ErrorCode::OffsetOutOfRange => "The requested offset is not within the range of offsets maintained by the server",
            ErrorCode::CorruptMessage => "This message has failed its CRC checksum, exceeds the valid size, or is otherwise corrupt",
            ErrorCode::UnknownTopicOrPartition => "This server does not host this topic-partition",
            ErrorCode::LeaderNotAvailable => "There is no leader for this topic-partition as we are in the middle of a leadership election",
            ErrorCode::NotLeaderForPartition => "This server is not the leader for that topic-partition",
            ErrorCode::RequestTimedOut => "The request timed out",
            ErrorCode::BrokerNotAvailable => "The broker is not available",
            ErrorCode::MessageTooLarge => "The request included a message larger than the max message size the server will accept",
            ErrorCode::NetworkException => "The server disconnected before a response was received",
            ErrorCode::InvalidTopic => "The request attempted to perform an operation on an invalid topic",
            ErrorCode::NotEnoughReplicas => "Messages are rejected since there are fewer in-sync replicas than required",
            ErrorCode::NotEnoughReplicasAfterAppend => "Messages are written to the log, but to fewer in-sync replicas than required",
            ErrorCode::CoordinatorLoadInProgress => "The coordinator is loading and hence can't process requests",
            ErrorCode::CoordinatorNotAvailable => "The coordinator is not available",
            ErrorCode::NotCoordinator => "This is not the correct coordinator",
            ErrorCode::IllegalGeneration => "Specified group generation id is not valid",
            ErrorCode::InvalidGroupId => "The configured groupId is invalid",
            ErrorCode::UnknownMemberId => "The coordinator is not aware of this member",
            ErrorCode::InvalidSessionTimeout => "The session timeout is not within the range allowed by the broker",
            ErrorCode::RebalanceInProgress => "The group is rebalancing, so a rejoin is needed",
            ErrorCode::InvalidRequest => "This most likely occurs because of a request being malformed by the client library or the message was sent to an incompatible broker",
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            1 => ErrorCode::OffsetOutOfRange,
            2 => ErrorCode::CorruptMessage,
            3 => ErrorCode::UnknownTopicOrPartition,
            5 => ErrorCode::LeaderNotAvailable,
            6 => ErrorCode::NotLeaderForPartition,
            7 => ErrorCode::RequestTimedOut,
            8 => ErrorCode::BrokerNotAvailable,
            10 => ErrorCode::MessageTooLarge,
            13 => ErrorCode::NetworkException,
            14 => ErrorCode::CoordinatorLoadInProgress,
            15 => ErrorCode::CoordinatorNotAvailable,
            16 => ErrorCode::NotCoordinator,
            17 => ErrorCode::InvalidTopic,
            19 => ErrorCode::NotEnoughReplicas,
            20 => ErrorCode::NotEnoughReplicasAfterAppend,
            22 => ErrorCode::IllegalGeneration,
            24 => ErrorCode::InvalidGroupId,
            25 => ErrorCode::UnknownMemberId,
            26 => ErrorCode::InvalidSessionTimeout,
            27 => ErrorCode::RebalanceInProgress,
            42 => ErrorCode::InvalidRequest,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn code(&self) -> i16 {
        *self as i16
    }

    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::None
    }

    /// Transient broker-side conditions: leader movement, throttling,
    /// coordinator failover. Retried by the client with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::LeaderNotAvailable
                | ErrorCode::NotLeaderForPartition
                | ErrorCode::RequestTimedOut
                | ErrorCode::BrokerNotAvailable
                | ErrorCode::NetworkException
                | ErrorCode::NotEnoughReplicas
                | ErrorCode::NotEnoughReplicasAfterAppend
                | ErrorCode::CoordinatorLoadInProgress
                | ErrorCode::CoordinatorNotAvailable
                | ErrorCode::NotCoordinator
        )
    }
}
