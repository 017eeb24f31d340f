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

//! Coordinator-side bookkeeping of a consumer group.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::message::TopicPartition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Membership changed, a new generation is being formed.
    ///
    /// transition: assignment computed => AwaitingSync
    ///             all members have left the group => Empty
    PreparingRebalance,

    /// A generation exists, not every member has fetched its assignment yet.
    ///
    /// action: heartbeats from the previous generation get REBALANCE_IN_PROGRESS
    /// transition: last member synced => Stable
    ///             member joined, left or expired => PreparingRebalance
    AwaitingSync,

    /// Every member runs the current generation.
    ///
    /// transition: member joined, left or expired => PreparingRebalance
    Stable,

    /// No members. Committed offsets are kept.
    ///
    /// transition: join from a new member => PreparingRebalance
    Empty,
}

impl GroupState {
    pub const fn can_transition_to(current: GroupState, target: GroupState) -> bool {
        matches!(
            (current, target),
            (GroupState::Empty, GroupState::PreparingRebalance)
                | (GroupState::Stable, GroupState::PreparingRebalance)
                | (GroupState::AwaitingSync, GroupState::PreparingRebalance)
                | (GroupState::PreparingRebalance, GroupState::AwaitingSync)
                | (GroupState::PreparingRebalance, GroupState::Empty)
                | (GroupState::AwaitingSync, GroupState::Stable)
        )
    }
}

#[derive(Debug)]
pub struct MemberMetadata {
    id: String,
    client_id: String,
    subscription: BTreeSet<String>,
    session_timeout: Duration,
    last_heartbeat: Instant,
    /// generation this member last synced, -1 before its first sync
    synced_generation: i32,
    assignment: Vec<TopicPartition>,
}

impl MemberMetadata {
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        subscription: BTreeSet<String>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            subscription,
            session_timeout,
            last_heartbeat: Instant::now(),
            synced_generation: -1,
            assignment: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscription(&self) -> &BTreeSet<String> {
        &self.subscription
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > self.session_timeout
    }
}

#[derive(Debug)]
pub struct GroupMetadata {
    id: String,
    generation_id: i32,
    state: GroupState,
    members: BTreeMap<String, MemberMetadata>,
    leader_id: Option<String>,
    committed: HashMap<TopicPartition, i64>,
}

impl GroupMetadata {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            id: group_id.into(),
            generation_id: 0,
            state: GroupState::Empty,
            members: BTreeMap::new(),
            leader_id: None,
            committed: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn has_member(&self, member_id: &str) -> bool {
        self.members.contains_key(member_id)
    }

    pub fn get_mut_member(&mut self, member_id: &str) -> Option<&mut MemberMetadata> {
        self.members.get_mut(member_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// The first member becomes the leader.
    pub fn add_member(&mut self, member: MemberMetadata) {
        if self.leader_id.is_none() {
            self.leader_id = Some(member.id.clone());
        }
        self.members.insert(member.id.clone(), member);
    }

    /// Removes the member, electing a new leader if it led the group.
    pub fn remove_member(&mut self, member_id: &str) -> Option<MemberMetadata> {
        let removed = self.members.remove(member_id);
        if self.leader_id.as_deref() == Some(member_id) {
            self.leader_id = self.members.keys().next().cloned();
        }
        removed
    }

    /// Drops members whose session timed out. Returns their ids.
    pub fn expire_members(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .members
            .values()
            .filter(|member| member.is_expired(now))
            .map(|member| member.id.clone())
            .collect();
        for member_id in &expired {
            info!("group {} member {} session expired", self.id, member_id);
            self.remove_member(member_id);
        }
        expired
    }

    fn transition_to(&mut self, state: GroupState) {
        debug_assert!(
            GroupState::can_transition_to(self.state, state),
            "group {} cannot go from {:?} to {:?}",
            self.id,
            self.state,
            state
        );
        debug!("group {} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    /// Starts the next generation and computes its assignment, or empties the
    /// group when nobody is left.
    pub fn rebalance(&mut self, partition_counts: &HashMap<String, i32>) {
        if self.state != GroupState::PreparingRebalance {
            self.transition_to(GroupState::PreparingRebalance);
        }
        if self.members.is_empty() {
            self.leader_id = None;
            self.transition_to(GroupState::Empty);
            info!("group {} is empty at generation {}", self.id, self.generation_id);
            return;
        }
        self.generation_id += 1;
        let assignment = range_assign(&self.members, partition_counts);
        for member in self.members.values_mut() {
            member.assignment = assignment.get(&member.id).cloned().unwrap_or_default();
        }
        self.transition_to(GroupState::AwaitingSync);
        info!(
            "group {} rebalanced to generation {} with {} members",
            self.id,
            self.generation_id,
            self.members.len()
        );
    }

    /// Marks the member as running the current generation.
    pub fn complete_sync(&mut self, member_id: &str) -> Option<Vec<TopicPartition>> {
        let generation_id = self.generation_id;
        let member = self.members.get_mut(member_id)?;
        member.synced_generation = generation_id;
        member.update_heartbeat();
        let assignment = member.assignment.clone();
        if self.state == GroupState::AwaitingSync
            && self
                .members
                .values()
                .all(|member| member.synced_generation == generation_id)
        {
            self.transition_to(GroupState::Stable);
        }
        Some(assignment)
    }

    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.committed.get(topic_partition).copied()
    }

    pub fn commit(&mut self, topic_partition: TopicPartition, offset: i64) {
        self.committed.insert(topic_partition, offset);
    }
}

/// Range assignment per topic over the members subscribed to it, sorted by
/// member id. The first `partitions % members` members get one extra.
fn range_assign(
    members: &BTreeMap<String, MemberMetadata>,
    partition_counts: &HashMap<String, i32>,
) -> HashMap<String, Vec<TopicPartition>> {
    let mut assignment: HashMap<String, Vec<TopicPartition>> = HashMap::new();
    let topics: BTreeSet<&String> = members.values().flat_map(|m| m.subscription.iter()).collect();

    for topic in topics {
        let Some(&partition_count) = partition_counts.get(topic) else {
            continue;
        };
        let subscribers: Vec<&String> = members
            .values()
            .filter(|m| m.subscription.contains(topic))
            .map(|m| &m.id)
            .collect();
        let per_member = partition_count as usize / subscribers.len();
        let extra = partition_count as usize % subscribers.len();

        let mut next = 0;
        for (i, member_id) in subscribers.into_iter().enumerate() {
            let count = per_member + usize::from(i < extra);
            let partitions = assignment.entry(member_id.clone()).or_default();
            for partition in next..next + count {
                partitions.push(TopicPartition::new(topic.clone(), partition as i32));
            }
            next += count;
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, topics: &[&str]) -> MemberMetadata {
        MemberMetadata::new(
            id,
            "client",
            topics.iter().map(|t| t.to_string()).collect(),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_state_transitions() {
        assert!(GroupState::can_transition_to(
            GroupState::Empty,
            GroupState::PreparingRebalance
        ));
        assert!(GroupState::can_transition_to(
            GroupState::AwaitingSync,
            GroupState::Stable
        ));
        assert!(!GroupState::can_transition_to(
            GroupState::Empty,
            GroupState::Stable
        ));
        assert!(!GroupState::can_transition_to(
            GroupState::Stable,
            GroupState::AwaitingSync
        ));
    }

    #[test]
    fn test_range_assignment_spreads_partitions() {
        let mut group = GroupMetadata::new("g1");
        group.add_member(member("a", &["orders"]));
        group.add_member(member("b", &["orders"]));
        let counts = HashMap::from([("orders".to_string(), 3)]);
        group.rebalance(&counts);

        assert_eq!(group.generation_id(), 1);
        assert_eq!(group.state(), GroupState::AwaitingSync);
        let a = group.complete_sync("a").unwrap();
        assert_eq!(group.state(), GroupState::AwaitingSync);
        let b = group.complete_sync("b").unwrap();
        assert_eq!(group.state(), GroupState::Stable);
        assert_eq!(
            a,
            vec![TopicPartition::new("orders", 0), TopicPartition::new("orders", 1)]
        );
        assert_eq!(b, vec![TopicPartition::new("orders", 2)]);
    }

    #[test]
    fn test_leader_reelected_and_group_empties() {
        let mut group = GroupMetadata::new("g1");
        group.add_member(member("a", &["orders"]));
        group.add_member(member("b", &["orders"]));
        assert_eq!(group.leader_id(), Some("a"));

        group.remove_member("a");
        assert_eq!(group.leader_id(), Some("b"));
        group.remove_member("b");
        let counts = HashMap::from([("orders".to_string(), 1)]);
        group.rebalance(&counts);
        assert_eq!(group.state(), GroupState::Empty);
        assert_eq!(group.leader_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_members() {
        let mut group = GroupMetadata::new("g1");
        group.add_member(member("a", &["orders"]));
        tokio::time::advance(Duration::from_secs(5)).await;
        group.add_member(member("b", &["orders"]));
        tokio::time::advance(Duration::from_secs(6)).await;

        let expired = group.expire_members(Instant::now());
        assert_eq!(expired, vec!["a".to_string()]);
        assert!(group.has_member("b"));
    }
}
