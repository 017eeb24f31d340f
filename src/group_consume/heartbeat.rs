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

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::message::{RebalanceCause, RebalanceEvent};
use crate::network::{ErrorCode, HeartbeatRequest, LeaveGroupRequest, Session};
use crate::service::Shutdown;
use crate::AppError;

use super::PollTracker;

/// Keeps one generation's membership alive.
///
/// Ticks every heartbeat interval whatever the application does. The task
/// ends after it reported the first rebalance event, the next generation
/// gets a fresh one.
pub(crate) struct HeartbeatTask {
    pub(crate) session: Session,
    pub(crate) group_id: String,
    pub(crate) member_id: String,
    pub(crate) generation_id: i32,
    pub(crate) interval: Duration,
    pub(crate) session_timeout: Duration,
    pub(crate) tracker: Arc<PollTracker>,
    pub(crate) events: mpsc::Sender<RebalanceEvent>,
    pub(crate) shutdown: Shutdown,
}

impl HeartbeatTask {
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            if self.tracker.stalled(self.session_timeout) {
                warn!(
                    "member {} did not poll within {:?}, leaving group {}",
                    self.member_id, self.session_timeout, self.group_id
                );
                self.leave().await;
                self.emit(RebalanceCause::PollTimeoutExceeded);
                break;
            }

            let request = HeartbeatRequest {
                group_id: self.group_id.clone(),
                member_id: self.member_id.clone(),
                generation_id: self.generation_id,
            };
            let response = tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                response = self.session.heartbeat(request) => response,
            };
            match response {
                Ok(response) => match response.error {
                    ErrorCode::None => trace!("heartbeat ok for {}", self.member_id),
                    ErrorCode::RebalanceInProgress => {
                        info!(
                            "group {} is rebalancing, generation {} is over",
                            self.group_id, self.generation_id
                        );
                        self.emit(RebalanceCause::RebalanceInProgress);
                        break;
                    }
                    ErrorCode::UnknownMemberId | ErrorCode::IllegalGeneration => {
                        warn!(
                            "member {} was evicted from group {}: {}",
                            self.member_id,
                            self.group_id,
                            response.error.message()
                        );
                        self.emit(RebalanceCause::MemberEvicted);
                        break;
                    }
                    code => warn!("heartbeat for {} failed: {}", self.member_id, code.message()),
                },
                Err(AppError::ClosedError(_)) => break,
                Err(e) => {
                    error!("heartbeat for {} stopped: {}", self.member_id, e);
                    self.emit(RebalanceCause::HeartbeatFailed);
                    break;
                }
            }
        }
        debug!("heartbeat task for generation {} exiting", self.generation_id);
    }

    async fn leave(&self) {
        let request = LeaveGroupRequest {
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
        };
        match self.session.leave_group(request).await {
            Ok(response) if response.error.is_ok() => {}
            Ok(response) => debug!("leave group answered {}", response.error.message()),
            Err(e) => debug!("leave group failed: {}", e),
        }
    }

    fn emit(&self, cause: RebalanceCause) {
        let event = RebalanceEvent {
            cause,
            generation_id: self.generation_id,
        };
        // one pending event is enough for the consumer to rejoin
        if self.events.try_send(event).is_err() {
            trace!("rebalance event for generation {} dropped", self.generation_id);
        }
    }
}
