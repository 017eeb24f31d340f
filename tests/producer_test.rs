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

use std::collections::HashSet;
use std::time::Duration;

use rstest::{fixture, rstest};
use stonemq_client::{
    partition_for_key, setup_local_tracing, AppError, Consumer, ConsumerConfig, ErrorCode,
    MemoryBroker, Producer, ProducerConfig, Record, ResetPolicy, Session, SessionConfig,
    TopicPartition,
};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

fn producer_config() -> ProducerConfig {
    ProducerConfig {
        linger_ms: 1,
        retry_backoff_ms: 1,
        retry_backoff_max_ms: 5,
        ..Default::default()
    }
}

fn connect(partitions: i32, config: &ProducerConfig) -> (MemoryBroker, Session, Producer) {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", partitions).unwrap();
    let session = Session::connect(&SessionConfig::default(), broker.transport()).unwrap();
    let producer = Producer::new(config, session.clone()).unwrap();
    (broker, session, producer)
}

#[rstest]
#[tokio::test]
async fn test_keyed_orders_are_readable_by_a_consumer(_setup: ()) {
    let (broker, session, producer) = connect(3, &producer_config());

    let mut deliveries = Vec::new();
    for key in 1..=5 {
        let record = Record::new("orders", format!("order {}", key)).with_key(key.to_string());
        deliveries.push((key, producer.send(record).await.unwrap()));
    }
    producer.flush().await.unwrap();
    for (key, delivery) in deliveries {
        let result = delivery.await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(
            result.topic_partition.partition,
            partition_for_key(key.to_string().as_bytes(), 3)
        );
    }
    producer.close().await;

    let consumer = Consumer::new(
        &ConsumerConfig {
            heartbeat_interval_ms: 50,
            fetch_wait_ms: 10,
            ..ConsumerConfig::new("readers")
        },
        session.clone(),
    )
    .unwrap();
    consumer.subscribe(&["orders"], ResetPolicy::Earliest).await.unwrap();
    let mut values = HashSet::new();
    for _ in 0..50 {
        let result = consumer.poll(Duration::from_millis(50)).await.unwrap();
        values.extend(result.records().filter_map(|r| r.value_str().map(String::from)));
        if values.len() == 5 {
            break;
        }
    }
    let expected: HashSet<String> = (1..=5).map(|key| format!("order {}", key)).collect();
    assert_eq!(values, expected);

    let total: i64 = (0..3)
        .filter_map(|p| broker.log_end_offset(&TopicPartition::new("orders", p)))
        .sum();
    assert_eq!(total, 5);
    consumer.close().await;
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_records_without_key_spread_over_partitions(_setup: ()) {
    let (_broker, session, producer) = connect(3, &producer_config());
    let mut deliveries = Vec::new();
    for i in 0..6 {
        deliveries.push(producer.send(Record::new("orders", format!("v{}", i))).await.unwrap());
    }
    producer.flush().await.unwrap();

    let mut partitions = HashSet::new();
    for delivery in deliveries {
        partitions.insert(delivery.await.topic_partition.partition);
    }
    assert_eq!(partitions.len(), 3);
    producer.close().await;
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_try_send_reports_full_buffer(_setup: ()) {
    let config = ProducerConfig {
        max_buffer_per_partition: 1,
        batch_size: 100,
        linger_ms: 60_000,
        ..producer_config()
    };
    let (_broker, session, producer) = connect(1, &config);

    let first = producer.try_send(Record::new("orders", "a")).await.unwrap();
    let second = producer.try_send(Record::new("orders", "b")).await;
    match second {
        Err(AppError::BufferFullError(tp)) => assert_eq!(tp, TopicPartition::new("orders", 0)),
        other => panic!("expected a full buffer, got {:?}", other.map(|f| f.record_id())),
    }

    producer.flush().await.unwrap();
    assert_eq!(first.await.offset(), Some(0));
    // the acknowledged record gave its slot back
    let third = producer.try_send(Record::new("orders", "c")).await.unwrap();
    producer.close().await;
    assert_eq!(third.await.offset(), Some(1));
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_send_waits_for_room(_setup: ()) {
    let config = ProducerConfig {
        max_buffer_per_partition: 1,
        batch_size: 1,
        ..producer_config()
    };
    let (broker, session, producer) = connect(1, &config);

    let mut deliveries = Vec::new();
    for i in 0..4 {
        let send = producer.send(Record::new("orders", format!("v{}", i)));
        let delivery = tokio::time::timeout(Duration::from_secs(2), send)
            .await
            .expect("send never got room")
            .unwrap();
        deliveries.push(delivery);
    }
    for (expected, delivery) in deliveries.into_iter().enumerate() {
        assert_eq!(delivery.await.offset(), Some(expected as i64));
    }
    assert_eq!(broker.log_end_offset(&TopicPartition::new("orders", 0)), Some(4));
    producer.close().await;
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_transient_errors_are_retried_in_order(_setup: ()) {
    let (broker, session, producer) = connect(
        1,
        &ProducerConfig {
            retries: 3,
            ..producer_config()
        },
    );
    broker.fail_next_produces(2, ErrorCode::LeaderNotAvailable);
    let first = producer.send(Record::new("orders", "a")).await.unwrap();
    let second = producer.send(Record::new("orders", "b")).await.unwrap();
    producer.flush().await.unwrap();
    assert_eq!(first.await.offset(), Some(0));
    assert_eq!(second.await.offset(), Some(1));

    broker.fail_next_produces(4, ErrorCode::RequestTimedOut);
    let exhausted = producer.send(Record::new("orders", "c")).await.unwrap();
    producer.flush().await.unwrap();
    let result = exhausted.await;
    assert!(!result.is_success());
    assert_eq!(
        result.error().and_then(|e| e.code()),
        Some(ErrorCode::RequestTimedOut)
    );
    producer.close().await;
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_send_after_close_is_refused(_setup: ()) {
    let (_broker, session, producer) = connect(1, &producer_config());
    producer.close().await;
    assert!(producer.is_closed());
    let result = producer.send(Record::new("orders", "late")).await;
    assert!(matches!(result, Err(AppError::ClosedError("producer"))));
    session.close().await;
}
