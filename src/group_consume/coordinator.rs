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

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{PartitionOffset, RebalanceEvent, TopicPartition};
use crate::network::{
    ErrorCode, HeartbeatRequest, JoinGroupRequest, LeaveGroupRequest, Session, SyncGroupRequest,
};
use crate::service::{ConsumerConfig, ResetPolicy, Shutdown};
use crate::utils::ExponentialBackoff;
use crate::{AppError, AppResult, ErrorContext};

use super::heartbeat::HeartbeatTask;
use super::{ConsumerGroupState, PollTracker};

#[derive(Debug)]
struct HeartbeatHandle {
    notify_shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Talks to the group coordinator for one consumer.
///
/// Owns the member id across generations and the heartbeat task of the
/// current one. All requests go through the shared [`Session`].
#[derive(Debug)]
pub struct GroupCoordinatorClient {
    /// `None` once released by a closing consumer
    session: Option<Session>,
    config: ConsumerConfig,
    member_id: String,
    generation_id: i32,
    topics: Vec<String>,
    state: Option<ConsumerGroupState>,
    heartbeat: Option<HeartbeatHandle>,
}

impl GroupCoordinatorClient {
    pub fn new(session: Session, config: ConsumerConfig) -> Self {
        Self {
            session: Some(session),
            config,
            member_id: String::new(),
            generation_id: -1,
            topics: Vec::new(),
            state: None,
            heartbeat: None,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn group_state(&self) -> Option<&ConsumerGroupState> {
        self.state.as_ref()
    }

    pub fn is_assigned(&self, topic_partition: &TopicPartition) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.is_assigned(topic_partition))
    }

    /// Joins the group for `topics` and remembers the member id and generation.
    /// The previous state stays until `sync` replaces it.
    pub async fn join(&mut self, topics: &[String]) -> AppResult<i32> {
        self.topics = topics.to_vec();
        let response = self
            .session()?
            .join_group(JoinGroupRequest {
                group_id: self.config.group_id.clone(),
                member_id: self.member_id.clone(),
                client_id: self.config.client_id.clone(),
                topics: self.topics.clone(),
                session_timeout_ms: self.config.session_timeout_ms,
            })
            .await?;
        if response.error == ErrorCode::UnknownMemberId {
            // the coordinator forgot us, come back as a new member
            self.member_id.clear();
        }
        if !response.error.is_ok() {
            return Err(self.group_error(response.error));
        }
        debug!(
            "joined group {} as {} at generation {} (leader {})",
            self.config.group_id, response.member_id, response.generation_id, response.leader_id
        );
        self.member_id = response.member_id;
        self.generation_id = response.generation_id;
        Ok(self.generation_id)
    }

    /// Fetches this member's assignment for the joined generation.
    pub async fn sync(&mut self) -> AppResult<ConsumerGroupState> {
        let response = self
            .session()?
            .sync_group(SyncGroupRequest {
                group_id: self.config.group_id.clone(),
                member_id: self.member_id.clone(),
                generation_id: self.generation_id,
            })
            .await?;
        if response.error == ErrorCode::UnknownMemberId {
            self.member_id.clear();
        }
        if !response.error.is_ok() {
            return Err(self.group_error(response.error));
        }
        let state = ConsumerGroupState {
            group_id: self.config.group_id.clone(),
            member_id: self.member_id.clone(),
            generation_id: self.generation_id,
            assigned_partitions: response.assignment.into_iter().collect(),
        };
        info!(
            "member {} of group {} got {} partitions at generation {}",
            state.member_id,
            state.group_id,
            state.assigned_partitions.len(),
            state.generation_id
        );
        self.state = Some(state.clone());
        Ok(state)
    }

    /// Join followed by sync. Generation races and retriable broker errors
    /// start over with backoff, up to the configured retries.
    pub async fn join_and_sync(&mut self, topics: &[String]) -> AppResult<ConsumerGroupState> {
        let mut backoff =
            ExponentialBackoff::new(self.config.retry_backoff(), self.config.retry_backoff() * 10);
        loop {
            let result = match self.join(topics).await {
                Ok(_) => self.sync().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(state) => return Ok(state),
                Err(e)
                    if (e.needs_rejoin() || e.is_retriable())
                        && backoff.attempts() < self.config.retries =>
                {
                    let delay = backoff.next_delay();
                    warn!(
                        "joining group {} failed ({}), retrying in {:?}",
                        self.config.group_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts heartbeating the current generation. Rebalance events go to
    /// `events`. A previous heartbeat task is stopped first.
    pub async fn start_heartbeat(
        &mut self,
        events: mpsc::Sender<RebalanceEvent>,
        tracker: Arc<PollTracker>,
    ) -> AppResult<()> {
        self.stop_heartbeat().await;
        if self.config.heartbeat_interval_ms == 0 {
            return Err(AppError::ValidationError(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| AppError::IllegalStateError("no generation to heartbeat".to_string()))?;
        let (notify_shutdown, _) = broadcast::channel(1);
        let task = HeartbeatTask {
            session: self.session()?.clone(),
            group_id: state.group_id.clone(),
            member_id: state.member_id.clone(),
            generation_id: state.generation_id,
            interval: self.config.heartbeat_interval(),
            session_timeout: self.config.session_timeout(),
            tracker,
            events,
            shutdown: Shutdown::new(notify_shutdown.subscribe()),
        };
        let handle = tokio::spawn(task.run());
        self.heartbeat = Some(HeartbeatHandle {
            notify_shutdown,
            handle,
        });
        Ok(())
    }

    pub async fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.notify_shutdown.send(());
            if let Err(e) = heartbeat.handle.await {
                warn!("heartbeat task ended abnormally: {}", e);
            }
        }
    }

    /// One heartbeat for the current generation, outside the background task.
    pub async fn heartbeat(&self) -> AppResult<()> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| AppError::IllegalStateError("no generation to heartbeat".to_string()))?;
        let response = self
            .session()?
            .heartbeat(HeartbeatRequest {
                group_id: state.group_id.clone(),
                member_id: state.member_id.clone(),
                generation_id: state.generation_id,
            })
            .await?;
        if !response.error.is_ok() {
            return Err(self.group_error(response.error));
        }
        Ok(())
    }

    /// Leaves the group so the remaining members rebalance right away.
    pub async fn leave(&mut self) -> AppResult<()> {
        self.stop_heartbeat().await;
        self.state = None;
        if self.member_id.is_empty() {
            return Ok(());
        }
        let member_id = std::mem::take(&mut self.member_id);
        let response = self
            .session()?
            .leave_group(LeaveGroupRequest {
                group_id: self.config.group_id.clone(),
                member_id: member_id.clone(),
            })
            .await?;
        match response.error {
            ErrorCode::None => {
                info!("member {} left group {}", member_id, self.config.group_id);
                Ok(())
            }
            // already evicted, nothing left to leave
            ErrorCode::UnknownMemberId => Ok(()),
            code => Err(self.group_error(code)),
        }
    }

    pub async fn commit_offsets(&self, offsets: Vec<PartitionOffset>) -> AppResult<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| AppError::IllegalStateError("commit without a generation".to_string()))?;
        let first = offsets[0].clone();
        let response = self
            .session()?
            .offset_commit(
                &state.group_id,
                &state.member_id,
                state.generation_id,
                offsets,
            )
            .await?;
        if !response.error.is_ok() {
            return Err(AppError::broker(
                response.error,
                ErrorContext::partition(&first.topic_partition()).with_offset(first.offset),
            ));
        }
        Ok(())
    }

    /// Committed offsets of the group; partitions never committed are absent.
    pub async fn fetch_offsets(
        &self,
        partitions: Vec<TopicPartition>,
    ) -> AppResult<HashMap<TopicPartition, i64>> {
        let response = self
            .session()?
            .offset_fetch(&self.config.group_id, partitions)
            .await?;
        if !response.error.is_ok() {
            return Err(self.group_error(response.error));
        }
        Ok(response.offsets)
    }

    /// First or next offset of a partition, per `reset_policy`.
    pub async fn list_offsets(
        &self,
        topic_partition: &TopicPartition,
        reset_policy: ResetPolicy,
    ) -> AppResult<i64> {
        let response = self
            .session()?
            .list_offsets(topic_partition.clone(), reset_policy)
            .await?;
        if !response.error.is_ok() {
            return Err(AppError::broker(
                response.error,
                ErrorContext::partition(topic_partition),
            ));
        }
        Ok(response.offset)
    }

    /// Leaves the group and drops the session handle. Later requests fail
    /// with `ClosedError`.
    pub(crate) async fn release(&mut self) -> AppResult<()> {
        let left = self.leave().await;
        self.session = None;
        left
    }

    fn session(&self) -> AppResult<&Session> {
        self.session
            .as_ref()
            .ok_or(AppError::ClosedError("group coordinator client"))
    }

    fn group_error(&self, code: ErrorCode) -> AppError {
        AppError::broker(code, ErrorContext::topic(self.topics.join(",")))
    }
}
