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

use std::sync::atomic::{AtomicUsize, Ordering};

use murmur2::{murmur2, KAFKA_SEED};

/// Picks the destination partition of a record.
///
/// Keyed records go where the key hashes to, the same way Kafka's default
/// partitioner does it, so records sharing a key stay ordered. Records without
/// a key rotate over the partitions.
#[derive(Debug, Default)]
pub struct Partitioner {
    counter: AtomicUsize,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, key: Option<&[u8]>, partition_count: i32) -> i32 {
        debug_assert!(partition_count > 0, "partition_count must be positive");
        match key {
            Some(key) => partition_for_key(key, partition_count),
            None => {
                let next = self.counter.fetch_add(1, Ordering::Relaxed);
                (next % partition_count as usize) as i32
            }
        }
    }
}

/// `(murmur2(key) & 0x7fffffff) % partition_count`
pub fn partition_for_key(key: &[u8], partition_count: i32) -> i32 {
    let hash = murmur2(key, KAFKA_SEED);
    ((hash & 0x7fffffff) as i32) % partition_count
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_key_routing_is_deterministic() {
        let partitioner = Partitioner::new();
        for i in 0..50 {
            let key = format!("key-{}", i);
            let first = partitioner.partition(Some(key.as_bytes()), 6);
            let second = partitioner.partition(Some(key.as_bytes()), 6);
            assert_eq!(first, second);
            assert!((0..6).contains(&first));
        }
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let seen: HashSet<i32> = (0..200)
            .map(|i| partition_for_key(format!("k{}", i).as_bytes(), 8))
            .collect();
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_round_robin_without_key() {
        let partitioner = Partitioner::new();
        let partitions: Vec<i32> = (0..6).map(|_| partitioner.partition(None, 3)).collect();
        assert_eq!(partitions, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_single_partition() {
        let partitioner = Partitioner::new();
        assert_eq!(partitioner.partition(Some(b"anything"), 1), 0);
        assert_eq!(partitioner.partition(None, 1), 0);
    }
}
