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

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::message::{PartitionOffset, Record, TopicPartition};
use crate::service::{ResetPolicy, SessionConfig, Shutdown};
use crate::utils::ExponentialBackoff;
use crate::{AppError, AppResult};

use super::request::*;
use super::BrokerTransport;

macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            BrokerResponse::$variant(inner) => Ok(inner),
            other => Err(AppError::IllegalStateError(format!(
                "expected {} response, got {}",
                stringify!($variant),
                other.api_name()
            ))),
        }
    };
}

/// Reachability of one bootstrap endpoint as seen by the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub address: String,
    pub reachable: bool,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct SessionRequest {
    request: BrokerRequest,
    reply: oneshot::Sender<AppResult<BrokerResponse>>,
}

/// Handle to one logical link with a broker cluster.
///
/// Cloning is cheap and every clone talks to the same background task, which
/// alone owns the transport. Producers and consumers keep a clone for as long
/// as they live; once [`Session::close`] ran their requests fail with
/// `ClosedError`.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    request_tx: mpsc::Sender<SessionRequest>,
    notify_shutdown: broadcast::Sender<()>,
    closed: AtomicCell<bool>,
    endpoints: Arc<RwLock<Vec<EndpointState>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Spawns the session task on the current tokio runtime. The task connects
    /// right away; requests issued meanwhile wait in the queue.
    pub fn connect<T: BrokerTransport>(config: &SessionConfig, transport: T) -> AppResult<Session> {
        config.validate()?;
        let (request_tx, request_rx) = mpsc::channel(config.request_queue_size);
        let (notify_shutdown, _) = broadcast::channel(1);
        let endpoints = Arc::new(RwLock::new(
            config
                .bootstrap_servers
                .iter()
                .map(|address| EndpointState {
                    address: address.clone(),
                    reachable: false,
                    consecutive_failures: 0,
                })
                .collect::<Vec<_>>(),
        ));

        let task = SessionTask {
            transport,
            config: config.clone(),
            endpoints: endpoints.clone(),
            connected: None,
            failed: None,
            request_rx,
            shutdown: Shutdown::new(notify_shutdown.subscribe()),
        };
        let handle = tokio::spawn(task.run());
        debug!(
            "session started, bootstrap servers: {}",
            config.bootstrap_servers.join(",")
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                request_tx,
                notify_shutdown,
                closed: AtomicCell::new(false),
                endpoints,
                task: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load()
    }

    /// Live clones of this session.
    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn endpoints(&self) -> Vec<EndpointState> {
        self.inner.endpoints.read().clone()
    }

    /// Queues a request for the session task and waits for its response.
    pub async fn call(&self, request: BrokerRequest) -> AppResult<BrokerResponse> {
        if self.is_closed() {
            return Err(AppError::ClosedError("session"));
        }
        let api = request.api_name();
        let (reply, response_rx) = oneshot::channel();
        self.inner
            .request_tx
            .send(SessionRequest { request, reply })
            .await
            .map_err(|_| AppError::ClosedError("session"))?;
        trace!("{} request queued", api);
        response_rx
            .await
            .map_err(|_| AppError::ClosedError("session"))?
    }

    /// Stops the session task and drops the transport. Queued requests fail
    /// with `ClosedError`. Only the first call does anything.
    pub async fn close(&self) {
        if self.inner.closed.swap(true) {
            return;
        }
        let _ = self.inner.notify_shutdown.send(());
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("session task ended abnormally: {}", e);
            }
        }
        info!("session closed");
    }

    pub async fn metadata(&self, topics: Vec<String>) -> AppResult<MetadataResponse> {
        let response = self
            .call(BrokerRequest::Metadata(MetadataRequest { topics }))
            .await?;
        expect_response!(response, Metadata)
    }

    pub async fn produce(
        &self,
        topic_partition: TopicPartition,
        records: Vec<Record>,
    ) -> AppResult<ProduceResponse> {
        let response = self
            .call(BrokerRequest::Produce(ProduceRequest {
                topic_partition,
                records,
            }))
            .await?;
        expect_response!(response, Produce)
    }

    pub async fn fetch(
        &self,
        topic_partition: TopicPartition,
        offset: i64,
        max_records: usize,
    ) -> AppResult<FetchResponse> {
        let response = self
            .call(BrokerRequest::Fetch(FetchRequest {
                topic_partition,
                offset,
                max_records,
            }))
            .await?;
        expect_response!(response, Fetch)
    }

    pub async fn list_offsets(
        &self,
        topic_partition: TopicPartition,
        reset_policy: ResetPolicy,
    ) -> AppResult<ListOffsetsResponse> {
        let response = self
            .call(BrokerRequest::ListOffsets(ListOffsetsRequest {
                topic_partition,
                reset_policy,
            }))
            .await?;
        expect_response!(response, ListOffsets)
    }

    pub async fn join_group(&self, request: JoinGroupRequest) -> AppResult<JoinGroupResponse> {
        let response = self.call(BrokerRequest::JoinGroup(request)).await?;
        expect_response!(response, JoinGroup)
    }

    pub async fn sync_group(&self, request: SyncGroupRequest) -> AppResult<SyncGroupResponse> {
        let response = self.call(BrokerRequest::SyncGroup(request)).await?;
        expect_response!(response, SyncGroup)
    }

    pub async fn heartbeat(&self, request: HeartbeatRequest) -> AppResult<HeartbeatResponse> {
        let response = self.call(BrokerRequest::Heartbeat(request)).await?;
        expect_response!(response, Heartbeat)
    }

    pub async fn leave_group(&self, request: LeaveGroupRequest) -> AppResult<LeaveGroupResponse> {
        let response = self.call(BrokerRequest::LeaveGroup(request)).await?;
        expect_response!(response, LeaveGroup)
    }

    pub async fn offset_commit(
        &self,
        group_id: &str,
        member_id: &str,
        generation_id: i32,
        offsets: Vec<PartitionOffset>,
    ) -> AppResult<OffsetCommitResponse> {
        let response = self
            .call(BrokerRequest::OffsetCommit(OffsetCommitRequest {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
                generation_id,
                offsets,
            }))
            .await?;
        expect_response!(response, OffsetCommit)
    }

    pub async fn offset_fetch(
        &self,
        group_id: &str,
        partitions: Vec<TopicPartition>,
    ) -> AppResult<OffsetFetchResponse> {
        let response = self
            .call(BrokerRequest::OffsetFetch(OffsetFetchRequest {
                group_id: group_id.to_string(),
                partitions,
            }))
            .await?;
        expect_response!(response, OffsetFetch)
    }
}

/// Owns the transport. Requests are served one at a time in arrival order.
struct SessionTask<T: BrokerTransport> {
    transport: T,
    config: SessionConfig,
    endpoints: Arc<RwLock<Vec<EndpointState>>>,
    /// index into `endpoints` of the live link
    connected: Option<usize>,
    /// once set, every request is answered with this error
    failed: Option<AppError>,
    request_rx: mpsc::Receiver<SessionRequest>,
    shutdown: Shutdown,
}

impl<T: BrokerTransport> SessionTask<T> {
    async fn run(mut self) {
        if let Err(err) = self.ensure_connected().await {
            error!("session could not connect: {}", err);
            self.failed = Some(err);
        }

        loop {
            let next = tokio::select! {
                request = self.request_rx.recv() => request,
                _ = self.shutdown.recv() => None,
            };
            let Some(request) = next else {
                break;
            };
            self.handle(request).await;
        }

        self.request_rx.close();
        self.fail_queued(&AppError::ClosedError("session"));
        self.transport.disconnect();
        debug!("session task exiting");
    }

    async fn handle(&mut self, pending: SessionRequest) {
        let SessionRequest { request, reply } = pending;
        if let Some(err) = &self.failed {
            let _ = reply.send(Err(err.clone()));
            return;
        }
        let api = request.api_name();
        let mut replays = 0;

        let result = loop {
            if self.connected.is_none() {
                if let Err(err) = self.ensure_connected().await {
                    error!("giving up on {} request: {}", api, err);
                    self.failed = Some(err.clone());
                    self.fail_queued(&err);
                    break Err(err);
                }
            }
            match self.transport.call(request.clone()).await {
                Ok(response) => break Ok(response),
                Err(err) => {
                    warn!("{} request lost its connection: {}", api, err);
                    self.mark_connection_lost();
                    replays += 1;
                    if replays > self.config.reconnect_retries {
                        break Err(AppError::UnavailableError(format!(
                            "{} request failed {} times: {}",
                            api, replays, err
                        )));
                    }
                }
            }
        };
        let _ = reply.send(result);
    }

    async fn ensure_connected(&mut self) -> AppResult<()> {
        let mut backoff = ExponentialBackoff::new(
            self.config.reconnect_backoff(),
            self.config.reconnect_backoff_max(),
        );
        for round in 0..=self.config.reconnect_retries {
            if round > 0 {
                let delay = backoff.next_delay();
                debug!("reconnect round {} in {:?}", round, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.recv() => return Err(AppError::ClosedError("session")),
                }
            }
            for index in self.connect_order() {
                let address = self.endpoints.read()[index].address.clone();
                match self.transport.connect(&address).await {
                    Ok(()) => {
                        self.update_endpoint(index, true);
                        self.connected = Some(index);
                        info!("session connected to {}", address);
                        return Ok(());
                    }
                    Err(err) => {
                        self.update_endpoint(index, false);
                        debug!("connect to {} failed: {}", address, err);
                    }
                }
            }
        }
        Err(AppError::UnavailableError(format!(
            "no reachable endpoint among [{}] after {} reconnect rounds",
            self.config.bootstrap_servers.join(", "),
            self.config.reconnect_retries
        )))
    }

    /// Endpoints that worked last time first, then the least failing ones.
    fn connect_order(&self) -> Vec<usize> {
        let endpoints = self.endpoints.read();
        let mut order: Vec<usize> = (0..endpoints.len()).collect();
        order.sort_by_key(|&i| (!endpoints[i].reachable, endpoints[i].consecutive_failures));
        order
    }

    fn update_endpoint(&self, index: usize, reachable: bool) {
        let mut endpoints = self.endpoints.write();
        let endpoint = &mut endpoints[index];
        endpoint.reachable = reachable;
        if reachable {
            endpoint.consecutive_failures = 0;
        } else {
            endpoint.consecutive_failures += 1;
        }
    }

    fn mark_connection_lost(&mut self) {
        if let Some(index) = self.connected.take() {
            self.update_endpoint(index, false);
        }
        self.transport.disconnect();
    }

    fn fail_queued(&mut self, err: &AppError) {
        while let Ok(pending) = self.request_rx.try_recv() {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::network::ErrorCode;

    fn session_config(servers: &[&str]) -> SessionConfig {
        SessionConfig {
            bootstrap_servers: servers.iter().map(|s| s.to_string()).collect(),
            reconnect_retries: 2,
            reconnect_backoff_ms: 5,
            reconnect_backoff_max_ms: 20,
            request_queue_size: 16,
        }
    }

    #[tokio::test]
    async fn test_skips_unreachable_endpoint() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 1).unwrap();
        let session = Session::connect(
            &session_config(&["nowhere:9092", "localhost:9092"]),
            broker.transport(),
        )
        .unwrap();

        let response = session.metadata(vec!["orders".to_string()]).await.unwrap();
        assert_eq!(response.topics[0].partition_count, 1);
        assert_eq!(response.topics[0].error, ErrorCode::None);

        let endpoints = session.endpoints();
        assert!(!endpoints[0].reachable);
        assert!(endpoints[0].consecutive_failures >= 1);
        assert!(endpoints[1].reachable);
        session.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_every_caller() {
        let broker = MemoryBroker::default();
        broker.set_reachable(false);
        let session =
            Session::connect(&session_config(&["localhost:9092"]), broker.transport()).unwrap();

        let first = session.metadata(vec!["orders".to_string()]).await;
        assert!(matches!(first, Err(AppError::UnavailableError(_))));

        // the session stays failed even if the broker comes back
        broker.set_reachable(true);
        let second = session.metadata(vec!["orders".to_string()]).await;
        assert!(matches!(second, Err(AppError::UnavailableError(_))));
        session.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let broker = MemoryBroker::default();
        broker.create_topic("orders", 1).unwrap();
        let session =
            Session::connect(&session_config(&["localhost:9092"]), broker.transport()).unwrap();
        session.metadata(vec!["orders".to_string()]).await.unwrap();

        broker.set_reachable(false);
        let broker_clone = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            broker_clone.set_reachable(true);
        });
        let response = session.metadata(vec!["orders".to_string()]).await.unwrap();
        assert_eq!(response.topics.len(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_requests_after_close_fail() {
        let broker = MemoryBroker::default();
        let session =
            Session::connect(&session_config(&["localhost:9092"]), broker.transport()).unwrap();
        let clone = session.clone();
        session.close().await;
        // closing twice is harmless
        session.close().await;
        assert!(clone.is_closed());
        let result = clone.metadata(vec![]).await;
        assert!(matches!(result, Err(AppError::ClosedError("session"))));
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let broker = MemoryBroker::default();
        let result = Session::connect(&session_config(&[]), broker.transport());
        assert!(matches!(result, Err(AppError::ValidationError(_))));

        let no_queue = SessionConfig {
            request_queue_size: 0,
            ..session_config(&["localhost:9092"])
        };
        let result = Session::connect(&no_queue, broker.transport());
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }
}
