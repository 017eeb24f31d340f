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

// 消费者状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created, or the last subscribe failed.
    ///
    /// transition: subscribe => Subscribing
    Unsubscribed,

    /// Joining the group for the first time.
    ///
    /// transition: assignment received => Stable
    ///             join failed => Unsubscribed
    Subscribing,

    /// Member of the current generation, `poll` delivers records.
    ///
    /// transition: rebalance event, or a commit rejected for the generation => Rebalancing
    Stable,

    /// The generation ended. The next `poll` rejoins.
    ///
    /// transition: rejoined => Stable
    Rebalancing,

    /// Final.
    Closed,
}

impl ConsumerState {
    pub const fn can_transition_to(current: ConsumerState, target: ConsumerState) -> bool {
        match (current, target) {
            (ConsumerState::Closed, _) => false,
            (_, ConsumerState::Closed) => true,
            (ConsumerState::Unsubscribed, ConsumerState::Subscribing) => true,
            (ConsumerState::Subscribing, ConsumerState::Stable) => true,
            (ConsumerState::Subscribing, ConsumerState::Unsubscribed) => true,
            (ConsumerState::Stable, ConsumerState::Rebalancing) => true,
            (ConsumerState::Rebalancing, ConsumerState::Stable) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::ConsumerState::*;
    use super::*;

    #[rstest]
    #[case(Unsubscribed, Subscribing, true)]
    #[case(Subscribing, Stable, true)]
    #[case(Subscribing, Unsubscribed, true)]
    #[case(Stable, Rebalancing, true)]
    #[case(Rebalancing, Stable, true)]
    #[case(Stable, Closed, true)]
    #[case(Unsubscribed, Stable, false)]
    #[case(Stable, Subscribing, false)]
    #[case(Rebalancing, Unsubscribed, false)]
    #[case(Closed, Closed, false)]
    #[case(Closed, Unsubscribed, false)]
    fn test_transitions(
        #[case] from: ConsumerState,
        #[case] to: ConsumerState,
        #[case] allowed: bool,
    ) {
        assert_eq!(ConsumerState::can_transition_to(from, to), allowed);
    }
}
