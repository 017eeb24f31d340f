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

use std::time::Duration;

use rstest::{fixture, rstest};
use stonemq_client::{
    setup_local_tracing, AppError, Consumer, ConsumerConfig, ConsumerState, ErrorKind,
    MemoryBroker, Producer, ProducerConfig, Record, ResetPolicy, Session, SessionConfig,
};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

fn session_config(servers: &[&str]) -> SessionConfig {
    SessionConfig {
        bootstrap_servers: servers.iter().map(|s| s.to_string()).collect(),
        reconnect_retries: 1,
        reconnect_backoff_ms: 5,
        reconnect_backoff_max_ms: 10,
        ..Default::default()
    }
}

#[rstest]
#[tokio::test]
async fn test_producer_sees_unavailable_broker(_setup: ()) {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 1).unwrap();
    broker.set_reachable(false);
    let session = Session::connect(&session_config(&["localhost:9092"]), broker.transport()).unwrap();
    let producer = Producer::new(&ProducerConfig::default(), session.clone()).unwrap();

    let result = producer.send(Record::new("orders", "a")).await;
    let error = result.err().expect("send must fail");
    assert_eq!(error.kind(), ErrorKind::Unavailable);
    producer.close().await;
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_consumer_subscribe_fails_when_broker_unavailable(_setup: ()) {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 1).unwrap();
    broker.set_reachable(false);
    let session = Session::connect(&session_config(&["localhost:9092"]), broker.transport()).unwrap();
    let consumer = Consumer::new(&ConsumerConfig::new("g1"), session.clone()).unwrap();

    let result = consumer.subscribe(&["orders"], ResetPolicy::Earliest).await;
    assert!(matches!(result, Err(AppError::UnavailableError(_))));
    assert_eq!(consumer.state(), ConsumerState::Unsubscribed);
    consumer.close().await;
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_bootstrap_list_fails_over(_setup: ()) {
    let broker = MemoryBroker::with_addresses(vec!["broker-2:9092".to_string()]);
    broker.create_topic("orders", 2).unwrap();
    let session = Session::connect(
        &session_config(&["broker-1:9092", "broker-2:9092"]),
        broker.transport(),
    )
    .unwrap();
    let producer = Producer::new(
        &ProducerConfig {
            linger_ms: 1,
            ..Default::default()
        },
        session.clone(),
    )
    .unwrap();

    let delivery = producer
        .send(Record::new("orders", "a").with_key("k"))
        .await
        .unwrap();
    producer.flush().await.unwrap();
    assert!(delivery.await.is_success());

    let endpoints = session.endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(!endpoints[0].reachable);
    assert!(endpoints[1].reachable);
    producer.close().await;
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn test_closed_session_fails_clients(_setup: ()) {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 1).unwrap();
    let session = Session::connect(&session_config(&["localhost:9092"]), broker.transport()).unwrap();
    let producer = Producer::new(&ProducerConfig::default(), session.clone()).unwrap();
    session.close().await;

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        producer.send(Record::new("orders", "a")),
    )
    .await
    .expect("send on a closed session must not hang");
    assert!(matches!(result, Err(AppError::ClosedError(_))));
    producer.close().await;
}
