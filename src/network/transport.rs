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

use std::future::Future;

use super::{BrokerRequest, BrokerResponse};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("connection lost: {0}")]
    Disconnected(String),
}

/// The link to a broker cluster, owned by exactly one session task.
///
/// Implementations deal with sockets, framing and the wire protocol. Broker
/// side failures come back inside the response as an error code, only a
/// broken link is a `TransportError`.
pub trait BrokerTransport: Send + 'static {
    fn connect(&mut self, endpoint: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn call(
        &mut self,
        request: BrokerRequest,
    ) -> impl Future<Output = Result<BrokerResponse, TransportError>> + Send;

    fn disconnect(&mut self);
}
