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
//! In-process exchange channels.
//!
//! Responsibilities:
//! - Point-to-point and many-to-one page queues with capacity-based
//!   backpressure signals, finish/abort semantics, and readiness
//!   observables.
//! - Registry keyed by channel id, shared between the client worker pool,
//!   the server orchestrators, and the loopback transport.
//!
//! Key exported interfaces:
//! - Types: `ExchangeChannel`, `ExchangeSinkHandle`, `ExchangeSourceHandle`.
//! - Functions: `get_or_create_channel`, `lookup_channel`, `remove_channel`.
//!
//! An abort surfaces to readers and writers as a generic cancellation; the
//! root-cause failure travels through the failure-notification path instead,
//! so a specific error is never masked by the abort it caused.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::batchex_logging::debug;
use crate::common::ids::ChannelId;
use crate::exchange::failure::{ExchangeFailure, best_failure};
use crate::exec::page::Page;
use crate::exec::pipeline::observer::Observable;

/// Callback fired exactly once when a sink handle finishes or aborts.
pub type SinkCompletionListener = Box<dyn FnOnce(Option<ExchangeFailure>) + Send>;

struct ChannelState {
    queue: VecDeque<Page>,
    ever_attached: usize,
    finished_sinks: usize,
    aborted: bool,
    abort_cause: Option<ExchangeFailure>,
}

/// One direction of page transfer. Multiple sinks may attach (many-to-one
/// fan-in on the shared server-to-client channel); a single reader drains.
pub struct ExchangeChannel {
    id: ChannelId,
    capacity: usize,
    mu: Mutex<ChannelState>,
    source_observable: Arc<Observable>,
    sink_observable: Arc<Observable>,
}

impl ExchangeChannel {
    pub fn new(id: ChannelId, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            capacity: capacity.max(1),
            mu: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                ever_attached: 0,
                finished_sinks: 0,
                aborted: false,
                abort_cause: None,
            }),
            source_observable: Arc::new(Observable::new()),
            sink_observable: Arc::new(Observable::new()),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn attach_sink(self: &Arc<Self>) -> Arc<ExchangeSinkHandle> {
        {
            let mut st = self.mu.lock().expect("exchange channel lock");
            st.ever_attached += 1;
        }
        Arc::new(ExchangeSinkHandle {
            channel: Arc::clone(self),
            finished: AtomicBool::new(false),
            completion: Mutex::new(None),
        })
    }

    pub fn source_handle(self: &Arc<Self>) -> ExchangeSourceHandle {
        ExchangeSourceHandle {
            channel: Arc::clone(self),
        }
    }

    pub fn source_observable(&self) -> Arc<Observable> {
        Arc::clone(&self.source_observable)
    }

    pub fn sink_observable(&self) -> Arc<Observable> {
        Arc::clone(&self.sink_observable)
    }

    /// Backpressure signal: whether a producer should push another page now.
    pub fn can_accept(&self) -> bool {
        let st = self.mu.lock().expect("exchange channel lock");
        !st.aborted && st.queue.len() < self.capacity
    }

    /// Marks the channel aborted, recording the best known cause and
    /// dropping all queued pages. Idempotent; later causes merge in.
    pub fn abort(&self, cause: Option<ExchangeFailure>) {
        let notify_source = self.source_observable.defer_notify();
        let notify_sink = self.sink_observable.defer_notify();
        let mut st = self.mu.lock().expect("exchange channel lock");
        let first = !st.aborted;
        st.aborted = true;
        if let Some(cause) = cause {
            st.abort_cause = Some(best_failure(st.abort_cause.take(), cause));
        }
        let dropped = st.queue.len();
        st.queue.clear();
        drop(st);
        if first {
            debug!(
                "exchange channel aborted: id={} dropped_pages={}",
                self.id, dropped
            );
        }
        notify_source.arm();
        notify_sink.arm();
    }

    pub fn is_aborted(&self) -> bool {
        self.mu.lock().expect("exchange channel lock").aborted
    }

    /// Best failure recorded by abort, if any.
    pub fn recorded_failure(&self) -> Option<ExchangeFailure> {
        self.mu
            .lock()
            .expect("exchange channel lock")
            .abort_cause
            .clone()
    }

    fn cancellation(&self) -> ExchangeFailure {
        ExchangeFailure::cancelled(format!("exchange channel {} aborted", self.id))
    }
}

/// Producer endpoint. One handle per logical sender; the channel finishes
/// once every attached sink has finished.
pub struct ExchangeSinkHandle {
    channel: Arc<ExchangeChannel>,
    finished: AtomicBool,
    completion: Mutex<Option<SinkCompletionListener>>,
}

impl ExchangeSinkHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id
    }

    /// Registers the one-shot completion callback fired on finish or abort.
    pub fn set_completion_listener(&self, listener: SinkCompletionListener) {
        let mut guard = self.completion.lock().expect("sink completion lock");
        debug_assert!(guard.is_none(), "completion listener registered twice");
        *guard = Some(listener);
    }

    fn fire_completion(&self, failure: Option<ExchangeFailure>) {
        let listener = self.completion.lock().expect("sink completion lock").take();
        if let Some(listener) = listener {
            listener(failure);
        }
    }

    /// Transfers `page` into the channel. The producer must not touch the
    /// page afterwards.
    pub fn add_page(&self, page: Page) -> Result<(), ExchangeFailure> {
        if self.finished.load(Ordering::Acquire) {
            return Err(ExchangeFailure::client_side(format!(
                "add_page on finished sink of channel {}",
                self.channel.id
            )));
        }
        let notify = self.channel.source_observable.defer_notify();
        let mut st = self.channel.mu.lock().expect("exchange channel lock");
        if st.aborted {
            return Err(self.channel.cancellation());
        }
        st.queue.push_back(page);
        drop(st);
        notify.arm();
        Ok(())
    }

    /// Whether the channel can take another page without exceeding its
    /// buffer capacity.
    pub fn can_accept(&self) -> bool {
        !self.finished.load(Ordering::Acquire) && self.channel.can_accept()
    }

    /// Whether the channel was aborted. Producers must not wait for
    /// capacity on an aborted channel; `add_page` surfaces the cancellation.
    pub fn is_aborted(&self) -> bool {
        self.channel.is_aborted()
    }

    /// Marks this sink done. When the last attached sink finishes, the
    /// channel reports finished to its reader. Idempotent.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let notify = self.channel.source_observable.defer_notify();
        {
            let mut st = self.channel.mu.lock().expect("exchange channel lock");
            st.finished_sinks += 1;
            debug!(
                "exchange sink finished: id={} finished={}/{}",
                self.channel.id, st.finished_sinks, st.ever_attached
            );
        }
        notify.arm();
        self.fire_completion(None);
    }

    /// Aborts the whole channel with a root-cause failure and completes this
    /// sink with it.
    pub fn abort(&self, failure: ExchangeFailure) {
        self.channel.abort(Some(failure.clone()));
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.fire_completion(Some(failure));
        }
    }

    pub fn sink_observable(&self) -> Arc<Observable> {
        self.channel.sink_observable()
    }

    /// Notifies producers blocked on a full channel. Called by the reader
    /// after draining pages.
    pub(crate) fn channel(&self) -> &Arc<ExchangeChannel> {
        &self.channel
    }
}

/// Consumer endpoint; a channel has one logical reader.
pub struct ExchangeSourceHandle {
    channel: Arc<ExchangeChannel>,
}

impl ExchangeSourceHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id
    }

    /// Non-blocking poll. `Ok(None)` means no page right now; aborted
    /// channels yield a generic cancellation.
    pub fn poll_page(&self) -> Result<Option<Page>, ExchangeFailure> {
        let notify = self.channel.sink_observable.defer_notify();
        let mut st = self.channel.mu.lock().expect("exchange channel lock");
        if st.aborted {
            return Err(self.channel.cancellation());
        }
        let page = st.queue.pop_front();
        drop(st);
        if page.is_some() {
            // Capacity freed; wake producers blocked on backpressure.
            notify.arm();
        }
        Ok(page)
    }

    /// Finished means every attached sink finished and the queue drained.
    /// A channel nothing ever attached to is not finished; it is still
    /// waiting for its first producer.
    pub fn is_finished(&self) -> bool {
        let st = self.channel.mu.lock().expect("exchange channel lock");
        !st.aborted
            && st.ever_attached > 0
            && st.finished_sinks == st.ever_attached
            && st.queue.is_empty()
    }

    /// Readiness for blocked readers: a page, completion, or an abort.
    pub fn has_page_or_finished(&self) -> bool {
        {
            let st = self.channel.mu.lock().expect("exchange channel lock");
            if st.aborted || !st.queue.is_empty() {
                return true;
            }
        }
        self.is_finished()
    }

    pub fn abort(&self, cause: Option<ExchangeFailure>) {
        self.channel.abort(cause);
    }

    pub fn is_aborted(&self) -> bool {
        self.channel.is_aborted()
    }

    pub fn observable(&self) -> Arc<Observable> {
        self.channel.source_observable()
    }
}

static CHANNELS: OnceLock<Mutex<HashMap<ChannelId, Arc<ExchangeChannel>>>> = OnceLock::new();

fn channels() -> &'static Mutex<HashMap<ChannelId, Arc<ExchangeChannel>>> {
    CHANNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn get_or_create_channel(id: ChannelId, capacity: usize) -> Arc<ExchangeChannel> {
    let mut guard = channels().lock().expect("channel registry lock");
    let existed = guard.contains_key(&id);
    let channel = guard
        .entry(id)
        .or_insert_with(|| ExchangeChannel::new(id, capacity))
        .clone();
    if !existed {
        debug!("exchange channel CREATED: id={} capacity={}", id, capacity);
    }
    channel
}

pub fn lookup_channel(id: ChannelId) -> Option<Arc<ExchangeChannel>> {
    channels().lock().expect("channel registry lock").get(&id).cloned()
}

pub fn remove_channel(id: ChannelId) {
    channels().lock().expect("channel registry lock").remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;
    use crate::exec::page::BatchMetadata;

    fn test_channel(lo: i64) -> Arc<ExchangeChannel> {
        ExchangeChannel::new(
            ChannelId::client_to_server(UniqueId::new(0x5a5a, lo), 0),
            2,
        )
    }

    #[test]
    fn pages_flow_in_fifo_order() {
        let channel = test_channel(1);
        let sink = channel.attach_sink();
        let source = channel.source_handle();

        sink.add_page(Page::marker(BatchMetadata::new(0, 0, true)))
            .expect("first page accepted");
        sink.add_page(Page::marker(BatchMetadata::new(1, 0, true)))
            .expect("second page accepted");
        assert!(!sink.can_accept(), "capacity 2 reached");

        let first = source.poll_page().expect("poll ok").expect("page present");
        assert_eq!(first.metadata().expect("metadata").batch_id, 0);
        assert!(sink.can_accept(), "capacity freed after poll");

        assert!(!source.is_finished());
        sink.finish();
        assert!(!source.is_finished(), "queue not drained yet");
        let _ = source.poll_page().expect("poll ok").expect("second page");
        assert!(source.is_finished());
    }

    #[test]
    fn fan_in_finishes_after_all_sinks() {
        let channel = test_channel(2);
        let a = channel.attach_sink();
        let b = channel.attach_sink();
        let source = channel.source_handle();

        a.finish();
        assert!(!source.is_finished());
        b.finish();
        assert!(source.is_finished());
    }

    #[test]
    fn abort_surfaces_as_cancellation_and_keeps_root_cause() {
        let channel = test_channel(3);
        let sink = channel.attach_sink();
        let source = channel.source_handle();
        sink.add_page(Page::marker(BatchMetadata::single(0)))
            .expect("page accepted");

        sink.abort(ExchangeFailure::server_side("breaker exhausted"));

        let err = source.poll_page().expect_err("aborted channel");
        assert!(err.is_cancellation());
        let cause = channel.recorded_failure().expect("cause recorded");
        assert_eq!(cause.message, "breaker exhausted");
    }

    #[test]
    fn sink_completion_listener_fires_once() {
        use std::sync::atomic::AtomicUsize;

        let channel = test_channel(4);
        let sink = channel.attach_sink();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        sink.set_completion_listener(Box::new(move |failure| {
            assert!(failure.is_none());
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        sink.finish();
        sink.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
