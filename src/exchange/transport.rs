// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Transport primitives for the exchange subsystem.
//!
//! Responsibilities:
//! - Abstracts "connect a remote sink" (listener-style completion) and the
//!   status request/response pair; connection management, serialization,
//!   and retries live behind this seam.
//! - Provides `LoopbackTransport`, an in-process implementation resolving
//!   against the channel registry, used by tests and single-process
//!   deployments.
//!
//! Key exported interfaces:
//! - Types: `ConnectRequest`, `ExchangeTransport`, `LoopbackTransport`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::batchex_logging::debug;
use crate::common::ids::{ChannelId, ExchangeId};
use crate::common::types::UniqueId;
use crate::exchange::channel::ExchangeSinkHandle;
use crate::exchange::status::{self, StatusResponse};

/// Everything a server node needs to accept one worker connection.
pub struct ConnectRequest {
    pub node: String,
    pub session_id: UniqueId,
    pub worker_index: i32,
    /// Client-to-server data channel; the server becomes its reader.
    pub inbound_channel: ChannelId,
    /// Server-to-client result sink, attached to the session's shared
    /// fan-in channel. Completion listener already installed by the client.
    pub result_sink: Arc<ExchangeSinkHandle>,
}

impl ConnectRequest {
    pub fn exchange_id(&self) -> ExchangeId {
        ExchangeId {
            session: self.session_id,
            worker_index: self.worker_index,
        }
    }
}

pub type ConnectListener = Box<dyn FnOnce(Result<(), String>) + Send>;

/// Abstract transport the client and server cores are written against.
pub trait ExchangeTransport: Send + Sync {
    /// Establishes the remote side of a worker connection. Always
    /// asynchronous: the outcome arrives via `listener`, on an arbitrary
    /// transport thread.
    fn connect_remote_sink(&self, request: ConnectRequest, listener: ConnectListener);

    /// Tells the server for `exchange_id` that the client is ready to
    /// stream batches.
    fn send_client_ready(&self, exchange_id: ExchangeId) -> Result<(), String>;

    /// Delivers the single final status response for a connection.
    fn send_status_response(&self, response: StatusResponse) -> Result<(), String>;
}

/// Callback a server node registers to accept incoming worker connections.
pub type ServerAcceptor = Arc<dyn Fn(ConnectRequest) -> Result<(), String> + Send + Sync>;

/// In-process transport: connects workers to acceptors registered per node
/// name and routes status messages through the status registry. Connection
/// completion is reported from a spawned thread, so callers see the same
/// asynchronous listener discipline a networked transport would give them.
pub struct LoopbackTransport {
    acceptors: Mutex<HashMap<String, ServerAcceptor>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acceptors: Mutex::new(HashMap::new()),
        })
    }

    pub fn register_node(&self, node: impl Into<String>, acceptor: ServerAcceptor) {
        let mut guard = self.acceptors.lock().expect("acceptor registry lock");
        guard.insert(node.into(), acceptor);
    }
}

impl ExchangeTransport for LoopbackTransport {
    fn connect_remote_sink(&self, request: ConnectRequest, listener: ConnectListener) {
        let acceptor = {
            let guard = self.acceptors.lock().expect("acceptor registry lock");
            guard.get(&request.node).cloned()
        };
        let node = request.node.clone();
        let exchange_id = request.exchange_id();
        std::thread::spawn(move || {
            let result = match acceptor {
                Some(acceptor) => acceptor(request),
                None => Err(format!("no server node registered as {node}")),
            };
            debug!(
                "loopback connect completed: exchange_id={} ok={}",
                exchange_id,
                result.is_ok()
            );
            listener(result);
        });
    }

    fn send_client_ready(&self, exchange_id: ExchangeId) -> Result<(), String> {
        status::signal_ready(exchange_id)
    }

    fn send_status_response(&self, response: StatusResponse) -> Result<(), String> {
        status::deliver_status(response)
    }
}
