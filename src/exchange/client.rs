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
//! Client-side worker pool for bidirectional batch exchange.
//!
//! Responsibilities:
//! - Creates worker connections lazily up to the configured maximum and
//!   assigns each batch to the least-loaded worker, preferring an idle one.
//! - Funnels all result pages through one shared fan-in channel, reorders
//!   them by batch, and releases batch N+1 only after the consumer has
//!   acknowledged batch N with `mark_batch_completed`.
//! - Merges concurrent failures by origin priority and tears the session
//!   down exactly once; readers blocked on channels see a generic
//!   cancellation while the recorded best failure travels via `poll_result`.
//! - Defers `finish` while worker connections are still being established,
//!   running it when the last pending connection settles.
//!
//! Key exported interfaces:
//! - Types: `BidirectionalExchangeClient`.
//!
//! Each worker holds two completion references: one released when the
//! server completes this worker's share of the result channel, one released
//! by the worker's final status response.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::batchex_logging::debug;
use crate::common::config;
use crate::common::ids::{ChannelId, ExchangeId};
use crate::common::types::UniqueId;
use crate::exchange::channel::{
    self, ExchangeChannel, ExchangeSinkHandle, ExchangeSourceHandle, get_or_create_channel,
};
use crate::exchange::completion::CompletionTracker;
use crate::exchange::failure::{ExchangeFailure, FailureCollector};
use crate::exchange::ordering::BatchOrderingBuffer;
use crate::exchange::status::{self, StatusResponse};
use crate::exchange::transport::{ConnectRequest, ExchangeTransport};
use crate::exec::page::{BatchMetadata, Page};

/// State shared with transport callbacks running on arbitrary threads.
struct ClientShared {
    session_id: UniqueId,
    transport: Arc<dyn ExchangeTransport>,
    completion: CompletionTracker,
    failures: FailureCollector,
    pending_connections: AtomicUsize,
    finish_deferred: AtomicBool,
    inbound: Arc<ExchangeChannel>,
    outbound_sinks: Mutex<Vec<Arc<ExchangeSinkHandle>>>,
}

impl ClientShared {
    fn request_finish(&self) {
        self.finish_deferred.store(true, Ordering::Release);
        self.maybe_run_deferred_finish();
    }

    fn connection_settled(&self) {
        let prev = self.pending_connections.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "connection settled without being pending");
        self.maybe_run_deferred_finish();
    }

    /// Runs the deferred finish iff no connection is still in flight; the
    /// swap makes sure only one caller runs it.
    fn maybe_run_deferred_finish(&self) {
        if self.pending_connections.load(Ordering::Acquire) == 0
            && self.finish_deferred.swap(false, Ordering::AcqRel)
        {
            self.do_finish();
        }
    }

    fn do_finish(&self) {
        let sinks = self.outbound_sinks.lock().expect("outbound sink lock");
        for sink in sinks.iter() {
            sink.finish();
        }
        drop(sinks);
        self.completion.release_initial();
        debug!("client finish ran: session={}", self.session_id);
    }
}

/// Reports a failure and, if this is the session's first, tears everything
/// down. The failure is recorded before any channel aborts, so a reader the
/// abort unblocks always finds it.
fn handle_failure(shared: &Arc<ClientShared>, failure: ExchangeFailure) {
    if !shared.failures.report(failure.clone()) {
        return;
    }
    debug!(
        "client shutdown triggered: session={} failure={}",
        shared.session_id, failure
    );
    shared.inbound.abort(Some(failure.clone()));
    let sinks = shared.outbound_sinks.lock().expect("outbound sink lock");
    for sink in sinks.iter() {
        sink.abort(failure.clone());
    }
}

/// One-shot guards for the two completion references a worker holds. Setup
/// failure releases both eagerly; listeners that fire later become no-ops.
struct WorkerRefs {
    data_released: AtomicBool,
    status_released: AtomicBool,
}

impl WorkerRefs {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data_released: AtomicBool::new(false),
            status_released: AtomicBool::new(false),
        })
    }

    fn release_data(&self, shared: &ClientShared) {
        if !self.data_released.swap(true, Ordering::AcqRel) {
            shared.completion.release();
        }
    }

    fn release_status(&self, shared: &ClientShared) {
        if !self.status_released.swap(true, Ordering::AcqRel) {
            shared.completion.release();
        }
    }
}

struct Worker {
    outbound_channel: ChannelId,
    outbound: Arc<ExchangeSinkHandle>,
    /// Batches assigned to this worker and not yet fully consumed.
    pending: usize,
}

/// Client endpoint of one exchange session against a single server node.
///
/// Not `Sync`: one owner sends batches and polls results; the transport
/// callbacks synchronize through [`ClientShared`].
pub struct BidirectionalExchangeClient {
    session_id: UniqueId,
    node: String,
    max_workers: usize,
    shared: Arc<ClientShared>,
    inbound_source: ExchangeSourceHandle,
    workers: Vec<Worker>,
    /// Batch id to worker slot, removed on acknowledgment.
    batch_to_worker: HashMap<i64, usize>,
    /// Sent batches not yet acknowledged, smallest released first.
    unacked: BTreeSet<i64>,
    ordering: BatchOrderingBuffer,
    next_probe: usize,
    finish_requested: bool,
    closed: bool,
}

impl BidirectionalExchangeClient {
    pub fn new(
        session_id: UniqueId,
        node: impl Into<String>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Self {
        let capacity = config::exchange_channel_buffer_pages();
        let inbound = get_or_create_channel(
            ChannelId::shared_server_to_client(session_id),
            capacity,
        );
        let inbound_source = inbound.source_handle();
        let shared = Arc::new(ClientShared {
            session_id,
            transport,
            completion: CompletionTracker::new(Box::new(move || {
                debug!("exchange session complete: session={}", session_id);
            })),
            failures: FailureCollector::new(),
            pending_connections: AtomicUsize::new(0),
            finish_deferred: AtomicBool::new(false),
            inbound,
            outbound_sinks: Mutex::new(Vec::new()),
        });
        Self {
            session_id,
            node: node.into(),
            max_workers: config::exchange_max_workers(),
            shared,
            inbound_source,
            workers: Vec::new(),
            batch_to_worker: HashMap::new(),
            unacked: BTreeSet::new(),
            ordering: BatchOrderingBuffer::new(),
            next_probe: 0,
            finish_requested: false,
            closed: false,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn session_id(&self) -> UniqueId {
        self.session_id
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_batches(&self) -> usize {
        self.unacked.len()
    }

    /// Sends the single page of a new batch. The page must carry metadata
    /// flagged as the last page of its batch; streaming a batch across
    /// multiple pages is not supported by this client.
    pub fn send_page(&mut self, page: Page) -> Result<(), String> {
        if self.closed {
            return Err("send_page on closed exchange client".to_string());
        }
        if self.finish_requested {
            return Err("send_page after finish".to_string());
        }
        if let Some(failure) = self.shared.failures.best() {
            return Err(failure.to_string());
        }
        let meta = page
            .metadata()
            .ok_or_else(|| "send_page requires batch metadata".to_string())?;
        if !meta.is_last_page_in_batch {
            return Err(format!(
                "batch {} spans multiple pages; only single-page batches are supported, \
                 mark the page as last",
                meta.batch_id
            ));
        }
        let batch_id = meta.batch_id;
        if self.unacked.contains(&batch_id) {
            return Err(format!("batch {batch_id} already in flight"));
        }

        let slot = self.select_worker()?;
        self.workers[slot].outbound.add_page(page).map_err(|f| f.to_string())?;
        self.workers[slot].pending += 1;
        self.batch_to_worker.insert(batch_id, slot);
        self.unacked.insert(batch_id);
        debug!(
            "batch dispatched: session={} batch_id={} worker={}",
            self.session_id, batch_id, slot
        );
        Ok(())
    }

    /// Sends an empty batch: a single marker page delimiting `batch_id`
    /// without carrying rows.
    pub fn send_batch_marker(&mut self, batch_id: i64) -> Result<(), String> {
        self.send_page(Page::marker(BatchMetadata::single(batch_id)))
    }

    /// Non-blocking poll for the next result page, in batch order. `Ok(None)`
    /// means nothing is releasable right now; once a failure is recorded all
    /// polls surface it.
    pub fn poll_result(&mut self) -> Result<Option<Page>, String> {
        loop {
            match self.inbound_source.poll_page() {
                Ok(Some(page)) => self.ordering.insert(page)?,
                Ok(None) => break,
                Err(_cancellation) => {
                    return match self.shared.failures.best() {
                        Some(failure) => Err(failure.to_string()),
                        // Abort not yet attributed; the cause arrives through
                        // the failure path momentarily.
                        None => Ok(None),
                    };
                }
            }
        }
        if let Some(failure) = self.shared.failures.best() {
            return Err(failure.to_string());
        }
        let Some(current) = self.current_batch() else {
            return Ok(None);
        };
        // A fully drained batch stays current until the consumer calls
        // mark_batch_completed; nothing of a later batch is released before
        // that.
        Ok(self.ordering.poll_batch(current))
    }

    /// Smallest batch still in flight. Result pages release in this order.
    pub fn current_batch(&self) -> Option<i64> {
        self.unacked.iter().next().copied()
    }

    /// True once every result page of `batch_id` has arrived and been
    /// polled, leaving the batch waiting only for [`Self::mark_batch_completed`].
    pub fn is_batch_complete(&self, batch_id: i64) -> bool {
        self.unacked.contains(&batch_id)
            && self.ordering.is_batch_complete(batch_id)
            && self.ordering.is_batch_drained(batch_id)
    }

    /// Acknowledges that the consumer is done with `batch_id`, releasing
    /// the next batch in order. Only the current batch can be acknowledged,
    /// and only after all of its result pages were consumed.
    pub fn mark_batch_completed(&mut self, batch_id: i64) -> Result<(), String> {
        if self.current_batch() != Some(batch_id) {
            return Err(format!("batch {batch_id} is not the current in-flight batch"));
        }
        if !self.is_batch_complete(batch_id) {
            return Err(format!("batch {batch_id} still has unconsumed result pages"));
        }
        self.acknowledge(batch_id);
        Ok(())
    }

    /// No more batches will be sent. Outbound channels are finished once no
    /// worker connection is still being established; until then the finish
    /// is deferred and runs when the last connection settles.
    pub fn finish(&mut self) {
        if self.finish_requested {
            return;
        }
        self.finish_requested = true;
        self.shared.request_finish();
    }

    /// Fails the session with a client-side cause. Readers blocked on
    /// channels are unblocked with a generic cancellation; the cause itself
    /// is what `poll_result` reports.
    pub fn abort(&self, message: impl Into<String>) {
        handle_failure(&self.shared, ExchangeFailure::client_side(message.into()));
    }

    /// True once finish was requested, every worker completed both its data
    /// channel and its status response, and every sent batch was
    /// acknowledged.
    pub fn is_finished(&self) -> bool {
        self.finish_requested && self.shared.completion.is_done() && self.unacked.is_empty()
    }

    pub fn has_failure(&self) -> bool {
        self.shared.failures.has_failure()
    }

    /// Releases the session's channels. A close before completion counts as
    /// a cancellation. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.is_finished() && !self.shared.failures.has_failure() {
            handle_failure(
                &self.shared,
                ExchangeFailure::cancelled(format!(
                    "exchange client closed before completion: session={}",
                    self.session_id
                )),
            );
        }
        for worker in &self.workers {
            channel::remove_channel(worker.outbound_channel);
        }
        channel::remove_channel(self.shared.inbound.id());
        debug!("exchange client closed: session={}", self.session_id);
    }

    fn acknowledge(&mut self, batch_id: i64) {
        self.ordering.acknowledge(batch_id);
        self.unacked.remove(&batch_id);
        if let Some(slot) = self.batch_to_worker.remove(&batch_id) {
            self.workers[slot].pending = self.workers[slot].pending.saturating_sub(1);
        }
        debug!(
            "batch acknowledged: session={} batch_id={}",
            self.session_id, batch_id
        );
    }

    /// Worker selection: grow the pool until `max_workers`, then reuse the
    /// least-loaded worker, scanning from a rotating start so equally loaded
    /// workers take turns. An idle worker short-circuits the scan.
    fn select_worker(&mut self) -> Result<usize, String> {
        if self.workers.len() < self.max_workers {
            return self.create_worker();
        }
        let n = self.workers.len();
        let mut best: Option<(usize, usize)> = None;
        for offset in 0..n {
            let slot = (self.next_probe + offset) % n;
            let pending = self.workers[slot].pending;
            if pending == 0 {
                self.next_probe = (slot + 1) % n;
                return Ok(slot);
            }
            match best {
                Some((best_pending, _)) if pending >= best_pending => {}
                _ => best = Some((pending, slot)),
            }
        }
        let (_, slot) = best.ok_or_else(|| "exchange client has no workers".to_string())?;
        self.next_probe = (slot + 1) % n;
        Ok(slot)
    }

    fn create_worker(&mut self) -> Result<usize, String> {
        let worker_index = self.workers.len() as i32;
        let exchange_id = ExchangeId {
            session: self.session_id,
            worker_index,
        };
        let capacity = config::exchange_channel_buffer_pages();
        let outbound_channel = ChannelId::client_to_server(self.session_id, worker_index);
        let outbound = get_or_create_channel(outbound_channel, capacity).attach_sink();
        self.shared
            .outbound_sinks
            .lock()
            .expect("outbound sink lock")
            .push(Arc::clone(&outbound));

        // Two references per worker: the data-side completion of its share
        // of the result channel, and its final status response.
        self.shared.completion.acquire();
        self.shared.completion.acquire();
        self.shared.pending_connections.fetch_add(1, Ordering::AcqRel);

        let refs = WorkerRefs::new();

        let result_sink = self.shared.inbound.attach_sink();
        {
            let shared = Arc::clone(&self.shared);
            let refs = Arc::clone(&refs);
            result_sink.set_completion_listener(Box::new(move |failure| {
                if let Some(failure) = failure {
                    handle_failure(&shared, failure);
                }
                refs.release_data(&shared);
            }));
        }

        {
            let shared = Arc::clone(&self.shared);
            let refs = Arc::clone(&refs);
            status::register_status_listener(
                exchange_id,
                Box::new(move |response: StatusResponse| {
                    if let Some(failure) = response.failure {
                        handle_failure(&shared, failure);
                    }
                    refs.release_status(&shared);
                }),
            );
        }

        let request = ConnectRequest {
            node: self.node.clone(),
            session_id: self.session_id,
            worker_index,
            inbound_channel: outbound_channel,
            result_sink,
        };
        let shared = Arc::clone(&self.shared);
        self.shared.transport.connect_remote_sink(
            request,
            Box::new(move |result| {
                match result {
                    Ok(()) => {
                        if let Err(err) = shared.transport.send_client_ready(exchange_id) {
                            abandon_worker(&shared, exchange_id, &refs);
                            handle_failure(
                                &shared,
                                ExchangeFailure::client_side(format!(
                                    "client-ready for {exchange_id} failed: {err}"
                                )),
                            );
                        }
                    }
                    Err(err) => {
                        abandon_worker(&shared, exchange_id, &refs);
                        handle_failure(
                            &shared,
                            ExchangeFailure::client_side(format!(
                                "connect for {exchange_id} failed: {err}"
                            )),
                        );
                    }
                }
                shared.connection_settled();
            }),
        );

        self.workers.push(Worker {
            outbound_channel,
            outbound,
            pending: 0,
        });
        debug!(
            "worker created: session={} worker={}",
            self.session_id, worker_index
        );
        Ok(self.workers.len() - 1)
    }
}

/// Releases a worker whose setup failed: no server will ever complete its
/// data sink or send its status, so both references are dropped here.
fn abandon_worker(shared: &Arc<ClientShared>, exchange_id: ExchangeId, refs: &WorkerRefs) {
    let _ = status::unregister_status_listener(exchange_id);
    refs.release_data(shared);
    refs.release_status(shared);
}

impl Drop for BidirectionalExchangeClient {
    fn drop(&mut self) {
        self.close();
    }
}
