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
//! Batch-aware result sink.
//!
//! Responsibilities:
//! - Buffers the pages the pipeline produced for the current batch and, when
//!   the driver drains the batch, tags them with outbound batch metadata and
//!   pushes them into the server-to-client channel.
//! - An empty batch flushes as a single marker page, so the client always
//!   sees a last-flagged page per batch.
//!
//! Key exported interfaces:
//! - Types: `BatchResultSinkOperator`.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::batchex_logging::debug;
use crate::exchange::channel::ExchangeSinkHandle;
use crate::exec::page::{BatchMetadata, Page};
use crate::exec::pipeline::batch_context::BatchContext;
use crate::exec::pipeline::observer::Observable;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};

pub struct BatchResultSinkOperator {
    name: String,
    sink: Arc<ExchangeSinkHandle>,
    context: Arc<BatchContext>,
    /// Untagged pages of the batch currently being computed.
    buffered: VecDeque<Page>,
    /// Tagged pages waiting for channel capacity; non-empty only mid-flush.
    flush_queue: VecDeque<Page>,
    flush_prepared: bool,
    finished: bool,
}

impl BatchResultSinkOperator {
    pub fn new(sink: Arc<ExchangeSinkHandle>, context: Arc<BatchContext>) -> Self {
        let name = format!("BATCH_RESULT_SINK ({})", sink.channel_id());
        Self {
            name,
            sink,
            context,
            buffered: VecDeque::new(),
            flush_queue: VecDeque::new(),
            flush_prepared: false,
            finished: false,
        }
    }

    fn prepare_flush(&mut self) -> Result<(), String> {
        let batch_id = self
            .context
            .current_batch_id()
            .ok_or_else(|| "flush without a draining batch".to_string())?;
        let total = self.buffered.len();
        if total == 0 {
            self.flush_queue.push_back(Page::marker(BatchMetadata::single(batch_id)));
        } else {
            for (index, mut page) in self.buffered.drain(..).enumerate() {
                page.set_metadata(BatchMetadata::new(
                    batch_id,
                    index as i32,
                    index + 1 == total,
                ));
                self.flush_queue.push_back(page);
            }
        }
        self.flush_prepared = true;
        debug!(
            "result flush prepared: channel={} batch_id={} pages={}",
            self.sink.channel_id(),
            batch_id,
            self.flush_queue.len()
        );
        Ok(())
    }
}

impl Operator for BatchResultSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for BatchResultSinkOperator {
    fn need_input(&self) -> bool {
        // Channel capacity is the backpressure signal even though pages are
        // staged locally until the batch drains. While a flush is pending no
        // input arrives anyway; the capacity check is what lets a blocked
        // driver resume the flush. An aborted channel never frees capacity,
        // so it must read as ready too or a parked driver would wait forever
        // instead of failing on the next flush.
        !self.finished && (self.sink.can_accept() || self.sink.is_aborted())
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_page(&mut self, page: Page) -> Result<(), String> {
        if self.finished {
            return Err(format!("{} already finished", self.name));
        }
        self.buffered.push_back(page);
        Ok(())
    }

    fn pull_page(&mut self) -> Result<Option<Page>, String> {
        Ok(None)
    }

    fn flush_batch(&mut self) -> Result<bool, String> {
        if !self.flush_prepared {
            self.prepare_flush()?;
        }
        while let Some(page) = self.flush_queue.pop_front() {
            // Full channel: yield and retry once capacity frees. Aborted
            // channel: fall through to add_page, which reports the
            // cancellation and fails the driver.
            if !self.sink.can_accept() && !self.sink.is_aborted() {
                self.flush_queue.push_front(page);
                return Ok(false);
            }
            self.sink.add_page(page).map_err(|f| f.to_string())?;
        }
        self.flush_prepared = false;
        Ok(true)
    }

    fn set_finishing(&mut self) -> Result<(), String> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.sink.finish();
        Ok(())
    }

    fn sink_observable(&self) -> Option<Arc<Observable>> {
        Some(self.sink.sink_observable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::ChannelId;
    use crate::common::types::UniqueId;
    use crate::exchange::channel::ExchangeChannel;
    use arrow::array::{ArrayRef, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    fn plain_page(value: i64) -> Page {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let array = Arc::new(Int64Array::from(vec![value])) as ArrayRef;
        Page::new(RecordBatch::try_new(schema, vec![array]).expect("valid batch"))
    }

    fn sink_fixture(lo: i64, capacity: usize) -> (Arc<ExchangeChannel>, BatchResultSinkOperator, Arc<BatchContext>) {
        let channel = ExchangeChannel::new(
            ChannelId::shared_server_to_client(UniqueId::new(0xbeef, lo)),
            capacity,
        );
        let context = Arc::new(BatchContext::new());
        let operator = BatchResultSinkOperator::new(channel.attach_sink(), Arc::clone(&context));
        (channel, operator, context)
    }

    #[test]
    fn flush_tags_pages_and_flags_the_last() {
        let (channel, mut operator, context) = sink_fixture(1, 8);
        context.start_batch(7).expect("batch started");
        operator.push_page(plain_page(10)).expect("buffered");
        operator.push_page(plain_page(11)).expect("buffered");
        context.start_draining().expect("draining");

        assert!(operator.flush_batch().expect("flush ok"));

        let source = channel.source_handle();
        let first = source.poll_page().expect("poll").expect("page");
        let meta = first.metadata().expect("metadata");
        assert_eq!((meta.batch_id, meta.page_index_in_batch), (7, 0));
        assert!(!meta.is_last_page_in_batch);
        let second = source.poll_page().expect("poll").expect("page");
        assert!(second.metadata().expect("metadata").is_last_page_in_batch);
    }

    #[test]
    fn empty_batch_flushes_a_marker() {
        let (channel, mut operator, context) = sink_fixture(2, 8);
        context.start_batch(3).expect("batch started");
        context.start_draining().expect("draining");

        assert!(operator.flush_batch().expect("flush ok"));

        let source = channel.source_handle();
        let page = source.poll_page().expect("poll").expect("marker present");
        assert!(page.is_marker());
        let meta = page.metadata().expect("metadata");
        assert_eq!(meta.batch_id, 3);
        assert!(meta.is_last_page_in_batch);
    }

    #[test]
    fn aborted_channel_reads_as_ready_and_fails_the_flush() {
        use crate::exchange::failure::ExchangeFailure;

        let (channel, mut operator, context) = sink_fixture(4, 1);
        context.start_batch(0).expect("batch started");
        operator.push_page(plain_page(1)).expect("buffered");
        operator.push_page(plain_page(2)).expect("buffered");
        context.start_draining().expect("draining");

        assert!(!operator.flush_batch().expect("partial flush"), "capacity 1");
        assert!(!operator.need_input(), "backpressured");

        channel.abort(Some(ExchangeFailure::server_side("reader went away")));

        // The abort never frees capacity, so it must read as readiness and
        // the retried flush must surface the cancellation.
        assert!(operator.need_input());
        let err = operator.flush_batch().expect_err("flush fails on abort");
        assert!(err.starts_with("[cancelled]"), "{err}");
    }

    #[test]
    fn flush_yields_on_full_channel_and_resumes() {
        let (channel, mut operator, context) = sink_fixture(3, 1);
        context.start_batch(0).expect("batch started");
        operator.push_page(plain_page(1)).expect("buffered");
        operator.push_page(plain_page(2)).expect("buffered");
        context.start_draining().expect("draining");

        assert!(!operator.flush_batch().expect("partial flush"), "capacity 1");
        let source = channel.source_handle();
        let _ = source.poll_page().expect("poll").expect("first page");
        assert!(operator.flush_batch().expect("flush completes"));
        assert!(
            source
                .poll_page()
                .expect("poll")
                .expect("second page")
                .metadata()
                .expect("metadata")
                .is_last_page_in_batch
        );
    }
}
