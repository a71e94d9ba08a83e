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
//! Server-side orchestrator for one worker connection.
//!
//! Responsibilities:
//! - Owns the inbound channel, the batch lifecycle, and the driver for one
//!   accepted connection; wires caller-provided processing stages between
//!   the batch source and the result sink.
//! - Waits for the client-ready signal before starting the driver, with a
//!   timeout so an abandoned connection cannot leak its resources.
//! - Sends exactly one final status response carrying the best failure
//!   observed across the driver and both channels.
//!
//! Key exported interfaces:
//! - Types: `BidirectionalExchangeServer`, `ServerPhase`.
//!
//! Resource release order on driver completion: channels and registry
//! entries are released before the status response goes out, so a client
//! that reacts to the response instantly cannot race a half-torn-down
//! server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::batchex_logging::{debug, error, warn};
use crate::common::config;
use crate::common::ids::ExchangeId;
use crate::exchange::channel::{
    self, ExchangeChannel, ExchangeSinkHandle, get_or_create_channel,
};
use crate::exchange::failure::{ExchangeFailure, best_failure};
use crate::exchange::status::{self, StatusResponse};
use crate::exchange::transport::{ConnectRequest, ExchangeTransport};
use crate::exec::operators::{BatchExchangeSourceOperator, BatchResultSinkOperator};
use crate::exec::pipeline::batch_context::BatchContext;
use crate::exec::pipeline::driver::{BatchDriver, DriverState};
use crate::exec::pipeline::executor::run_driver;
use crate::exec::pipeline::operator::Operator;

/// Coarse lifecycle of one server-side connection, for diagnostics and for
/// catching out-of-order orchestration bugs early.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServerPhase {
    Constructed,
    WaitingReady,
    DriverStarted,
    DriverFinished,
    Closed,
}

struct ServerInner {
    exchange_id: ExchangeId,
    transport: Arc<dyn ExchangeTransport>,
    inbound: Arc<ExchangeChannel>,
    outbound_sink: Arc<ExchangeSinkHandle>,
    phase: Mutex<ServerPhase>,
    ready: Mutex<bool>,
    ready_cv: Condvar,
    response_sent: AtomicBool,
    closed: AtomicBool,
}

impl ServerInner {
    fn set_phase(&self, next: ServerPhase) {
        let mut guard = self.phase.lock().expect("server phase lock");
        debug!(
            "server phase: exchange_id={} {:?} -> {:?}",
            self.exchange_id, *guard, next
        );
        *guard = next;
    }

    /// Releases the connection's registry entries and completes the outbound
    /// sink's fan-in share. Idempotent.
    fn release_resources(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        status::unregister_ready_handler(self.exchange_id);
        self.outbound_sink.finish();
        channel::remove_channel(self.inbound.id());
        debug!("server resources released: exchange_id={}", self.exchange_id);
    }

    /// Sends the one status response for this connection; later calls are
    /// ignored.
    fn send_status(&self, failure: Option<ExchangeFailure>) {
        if self.response_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let response = StatusResponse {
            exchange_id: self.exchange_id,
            failure,
        };
        if let Err(err) = self.transport.send_status_response(response) {
            error!(
                "status response undeliverable: exchange_id={} error={}",
                self.exchange_id, err
            );
        }
    }
}

/// One instance per accepted worker connection on the server node.
pub struct BidirectionalExchangeServer {
    inner: Arc<ServerInner>,
}

impl BidirectionalExchangeServer {
    /// Accepts `request`, builds the pipeline
    /// `batch source -> stages -> result sink`, and starts the orchestration
    /// thread. Returns once the connection is registered; the driver itself
    /// starts only after the client signals ready.
    pub fn accept(
        request: ConnectRequest,
        stages: Vec<Box<dyn Operator>>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Result<Self, String> {
        let exchange_id = request.exchange_id();
        let capacity = config::exchange_channel_buffer_pages();
        let inbound = get_or_create_channel(request.inbound_channel, capacity);

        let context = Arc::new(BatchContext::new());
        let mut operators: Vec<Box<dyn Operator>> = Vec::with_capacity(stages.len() + 2);
        operators.push(Box::new(BatchExchangeSourceOperator::new(
            inbound.source_handle(),
            Arc::clone(&context),
        )));
        operators.extend(stages);
        operators.push(Box::new(BatchResultSinkOperator::new(
            Arc::clone(&request.result_sink),
            Arc::clone(&context),
        )));

        let inner = Arc::new(ServerInner {
            exchange_id,
            transport,
            inbound,
            outbound_sink: request.result_sink,
            phase: Mutex::new(ServerPhase::Constructed),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
            response_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        {
            let inner = Arc::clone(&inner);
            status::register_ready_handler(
                exchange_id,
                Arc::new(move || {
                    *inner.ready.lock().expect("server ready lock") = true;
                    inner.ready_cv.notify_all();
                }),
            )?;
        }

        let server = Self {
            inner: Arc::clone(&inner),
        };
        Self::spawn_orchestration(inner, operators, context);
        Ok(server)
    }

    pub fn exchange_id(&self) -> ExchangeId {
        self.inner.exchange_id
    }

    pub fn phase(&self) -> ServerPhase {
        *self.inner.phase.lock().expect("server phase lock")
    }

    /// Releases the connection's resources from the owning side. Idempotent.
    /// The driver owns the channels while it runs, so closing a connection
    /// whose driver has not finished is a programming error.
    pub fn close(&self) {
        let phase = self.phase();
        assert!(
            matches!(phase, ServerPhase::DriverFinished | ServerPhase::Closed),
            "close on exchange server {} while in phase {:?}",
            self.inner.exchange_id,
            phase
        );
        self.inner.release_resources();
    }

    fn spawn_orchestration(
        inner: Arc<ServerInner>,
        operators: Vec<Box<dyn Operator>>,
        context: Arc<BatchContext>,
    ) {
        let thread_name = format!("exchange-server-{}", inner.exchange_id.worker_index);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                inner.set_phase(ServerPhase::WaitingReady);
                let timeout = Duration::from_millis(config::exchange_client_ready_timeout_ms());
                let became_ready = {
                    let guard = inner.ready.lock().expect("server ready lock");
                    let (guard, result) = inner
                        .ready_cv
                        .wait_timeout_while(guard, timeout, |ready| !*ready)
                        .expect("server ready wait");
                    drop(guard);
                    !result.timed_out()
                };

                if !became_ready {
                    warn!(
                        "client never signaled ready: exchange_id={} timeout_ms={}",
                        inner.exchange_id,
                        timeout.as_millis()
                    );
                    // Response first: the waiting client learns the outcome
                    // even if teardown below takes its time.
                    inner.send_status(Some(ExchangeFailure::server_side(format!(
                        "timed out waiting for client ready on exchange {}",
                        inner.exchange_id
                    ))));
                    inner.release_resources();
                    inner.set_phase(ServerPhase::Closed);
                    return;
                }

                inner.set_phase(ServerPhase::DriverStarted);
                let driver = BatchDriver::new(
                    inner.exchange_id.worker_index,
                    inner.exchange_id.to_string(),
                    operators,
                    context,
                );
                let done_inner = Arc::clone(&inner);
                let handle = run_driver(
                    driver,
                    Box::new(move |state| Self::on_driver_done(&done_inner, state)),
                );
                drop(handle);
            })
            .expect("spawn exchange server thread");
    }

    fn on_driver_done(inner: &Arc<ServerInner>, state: DriverState) {
        inner.set_phase(ServerPhase::DriverFinished);
        let mut failure = match state {
            DriverState::Finished => None,
            DriverState::Failed(message) => Some(classify_driver_failure(message)),
            other => Some(ExchangeFailure::server_side(format!(
                "driver stopped in non-terminal state {other:?}"
            ))),
        };
        // A channel abort carries the root cause out of band; fold it in so
        // the status response never reports a bare cancellation when a more
        // specific failure was recorded.
        if let Some(recorded) = inner.outbound_sink.channel().recorded_failure() {
            failure = Some(best_failure(failure.take(), recorded));
        }
        if let Some(recorded) = inner.inbound.recorded_failure() {
            failure = Some(best_failure(failure.take(), recorded));
        }

        inner.release_resources();
        inner.send_status(failure);
        inner.set_phase(ServerPhase::Closed);
    }
}

/// Channel failures cross the operator seam in their origin-tagged string
/// form; an untagged message is a genuine server-side error.
fn classify_driver_failure(message: String) -> ExchangeFailure {
    ExchangeFailure::parse_tagged(&message)
        .unwrap_or_else(|| ExchangeFailure::server_side(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::ChannelId;
    use crate::common::types::UniqueId;
    use crate::exchange::failure::FailureOrigin;
    use crate::exchange::transport::LoopbackTransport;
    use std::time::Instant;

    #[test]
    fn channel_abort_failures_classify_as_cancellation() {
        let abort = ExchangeFailure::cancelled("exchange channel s2c/0 aborted");
        let failure = classify_driver_failure(abort.to_string());
        assert!(failure.is_cancellation());

        let failure = classify_driver_failure("protocol violation: page index".to_string());
        assert_eq!(failure.origin, FailureOrigin::ServerSide);
        // An error merely mentioning an aborted channel is not downgraded.
        let failure = classify_driver_failure(
            "stage failed while exchange channel c2s/0 aborted elsewhere".to_string(),
        );
        assert_eq!(failure.origin, FailureOrigin::ServerSide);
    }

    #[test]
    fn ready_timeout_sends_failing_status_then_closes() {
        let dir = std::env::temp_dir().join("batchex-server-tests");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("ready-timeout.toml");
        std::fs::write(&path, "[exchange]\nclient_ready_timeout_ms = 200\n")
            .expect("config written");
        let _ = crate::batchex_config::init_from_path(&path);

        let session = UniqueId::new(0x51de, 1);
        let exchange_id = ExchangeId {
            session,
            worker_index: 0,
        };
        let results = ExchangeChannel::new(ChannelId::shared_server_to_client(session), 4);
        let delivered: Arc<Mutex<Option<StatusResponse>>> = Arc::new(Mutex::new(None));
        {
            let delivered = Arc::clone(&delivered);
            status::register_status_listener(
                exchange_id,
                Box::new(move |response| {
                    *delivered.lock().expect("status slot") = Some(response);
                }),
            );
        }

        let request = crate::exchange::transport::ConnectRequest {
            node: "timeout-node".to_string(),
            session_id: session,
            worker_index: 0,
            inbound_channel: ChannelId::client_to_server(session, 0),
            result_sink: results.attach_sink(),
        };
        let transport: Arc<dyn ExchangeTransport> = LoopbackTransport::new();
        let server = BidirectionalExchangeServer::accept(request, Vec::new(), transport)
            .expect("accepted");

        // No client-ready ever arrives.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if delivered.lock().expect("status slot").is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "status response never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }
        let response = delivered
            .lock()
            .expect("status slot")
            .take()
            .expect("checked above");
        let failure = response.failure.expect("timeout is a failure");
        assert_eq!(failure.origin, FailureOrigin::ServerSide);
        assert!(failure.message.contains("timed out"), "{}", failure.message);

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.phase() != ServerPhase::Closed {
            assert!(Instant::now() < deadline, "server never closed");
            std::thread::sleep(Duration::from_millis(5));
        }
        server.close();
    }
}
