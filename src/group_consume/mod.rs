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

//! Group coordinator client: membership, assignment, heartbeats and
//! committed offsets on behalf of one consumer.

mod coordinator;
mod heartbeat;

pub use coordinator::GroupCoordinatorClient;

use std::collections::BTreeSet;
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::message::TopicPartition;

/// Membership of one consumer for one generation. Reissued on every
/// rebalance, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupState {
    pub group_id: String,
    pub member_id: String,
    pub generation_id: i32,
    pub assigned_partitions: BTreeSet<TopicPartition>,
}

impl ConsumerGroupState {
    pub fn is_assigned(&self, topic_partition: &TopicPartition) -> bool {
        self.assigned_partitions.contains(topic_partition)
    }
}

/// When the application last finished a `poll`.
///
/// The heartbeat task reads it to tell a live but stalled consumer from a
/// healthy one.
#[derive(Debug)]
pub struct PollTracker {
    in_poll: AtomicCell<bool>,
    last_poll_end: Mutex<Instant>,
}

impl Default for PollTracker {
    fn default() -> Self {
        Self {
            in_poll: AtomicCell::new(false),
            last_poll_end: Mutex::new(Instant::now()),
        }
    }
}

impl PollTracker {
    pub fn begin(&self) {
        self.in_poll.store(true);
    }

    pub fn end(&self) {
        *self.last_poll_end.lock() = Instant::now();
        self.in_poll.store(false);
    }

    /// Restarts the clock, used when a new generation starts.
    pub fn touch(&self) {
        *self.last_poll_end.lock() = Instant::now();
    }

    /// No poll running and none finished within `session_timeout`.
    pub fn stalled(&self, session_timeout: Duration) -> bool {
        !self.in_poll.load() && self.last_poll_end.lock().elapsed() > session_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poll_tracker_detects_stall() {
        let tracker = PollTracker::default();
        let timeout = Duration::from_millis(100);
        assert!(!tracker.stalled(timeout));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(tracker.stalled(timeout));

        // a long poll is not a stall
        tracker.begin();
        assert!(!tracker.stalled(timeout));
        tracker.end();
        assert!(!tracker.stalled(timeout));

        tokio::time::advance(Duration::from_millis(150)).await;
        tracker.touch();
        assert!(!tracker.stalled(timeout));
    }
}
