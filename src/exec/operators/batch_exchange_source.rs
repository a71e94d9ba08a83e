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
//! Batch-aware exchange source.
//!
//! Responsibilities:
//! - Pulls pages from the inbound exchange channel, validates batch
//!   metadata, and drives the batch lifecycle transitions.
//! - Refuses to poll upstream while the current batch is draining, so no
//!   next-batch page is accepted before the drain completes.
//!
//! Key exported interfaces:
//! - Types: `BatchExchangeSourceOperator`.
//!
//! A page without metadata, a mismatched batch id while a batch is active,
//! or a non-contiguous page index is a protocol violation: fatal to this
//! driver instance, never retried.

use std::sync::Arc;

use crate::batchex_logging::debug;
use crate::exchange::channel::ExchangeSourceHandle;
use crate::exec::page::Page;
use crate::exec::pipeline::batch_context::{BatchContext, BatchLifecycle};
use crate::exec::pipeline::observer::Observable;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};

pub struct BatchExchangeSourceOperator {
    name: String,
    source: ExchangeSourceHandle,
    context: Arc<BatchContext>,
    next_page_index: i32,
}

impl BatchExchangeSourceOperator {
    pub fn new(source: ExchangeSourceHandle, context: Arc<BatchContext>) -> Self {
        let name = format!("BATCH_EXCHANGE_SOURCE ({})", source.channel_id());
        Self {
            name,
            source,
            context,
            next_page_index: 0,
        }
    }

    fn accept_page(&mut self, mut page: Page) -> Result<Option<Page>, String> {
        let meta = page.take_metadata().ok_or_else(|| {
            format!(
                "protocol violation: page without batch metadata on channel {}",
                self.source.channel_id()
            )
        })?;

        match self.context.state() {
            BatchLifecycle::NotStarted | BatchLifecycle::Idle => {
                self.context.start_batch(meta.batch_id)?;
                self.next_page_index = 0;
                debug!(
                    "batch started: channel={} batch_id={}",
                    self.source.channel_id(),
                    meta.batch_id
                );
            }
            BatchLifecycle::Active => {
                let active = self
                    .context
                    .current_batch_id()
                    .expect("active lifecycle has a batch id");
                if meta.batch_id != active {
                    return Err(format!(
                        "protocol violation: received page for batch {} while batch {} is active on channel {}",
                        meta.batch_id,
                        active,
                        self.source.channel_id()
                    ));
                }
            }
            BatchLifecycle::Draining => {
                // has_output/pull_page gate on Draining before polling.
                unreachable!("source polled upstream while draining");
            }
        }

        if meta.page_index_in_batch != self.next_page_index {
            return Err(format!(
                "protocol violation: expected page index {} of batch {}, got {} on channel {}",
                self.next_page_index,
                meta.batch_id,
                meta.page_index_in_batch,
                self.source.channel_id()
            ));
        }
        self.next_page_index += 1;

        if meta.is_last_page_in_batch {
            self.context.start_draining()?;
            debug!(
                "batch draining: channel={} batch_id={} pages={}",
                self.source.channel_id(),
                meta.batch_id,
                self.next_page_index
            );
        }

        if page.is_marker() {
            // Batch delimiter only; consumed, never forwarded.
            return Ok(None);
        }
        Ok(Some(page))
    }
}

impl Operator for BatchExchangeSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_finished(&self) -> bool {
        self.source.is_finished()
            && matches!(
                self.context.state(),
                BatchLifecycle::NotStarted | BatchLifecycle::Idle
            )
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for BatchExchangeSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        if self.context.state() == BatchLifecycle::Draining {
            return false;
        }
        // A queued page or an abort; a cleanly finished channel is handled
        // through is_finished instead.
        self.source.has_page_or_finished() && !self.source.is_finished()
    }

    fn push_page(&mut self, _page: Page) -> Result<(), String> {
        Err(format!("{} does not accept input", self.name))
    }

    fn pull_page(&mut self) -> Result<Option<Page>, String> {
        if self.context.state() == BatchLifecycle::Draining {
            return Ok(None);
        }
        let page = self.source.poll_page().map_err(|f| f.to_string())?;
        match page {
            Some(page) => self.accept_page(page),
            None => Ok(None),
        }
    }

    fn set_finishing(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn source_observable(&self) -> Option<Arc<Observable>> {
        Some(self.source.observable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::ChannelId;
    use crate::common::types::UniqueId;
    use crate::exchange::channel::{ExchangeChannel, ExchangeSinkHandle};
    use crate::exec::page::BatchMetadata;
    use arrow::array::{ArrayRef, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    fn data_page(batch_id: i64, index: i32, last: bool) -> Page {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let array = Arc::new(Int64Array::from(vec![index as i64])) as ArrayRef;
        Page::with_metadata(
            RecordBatch::try_new(schema, vec![array]).expect("valid batch"),
            BatchMetadata::new(batch_id, index, last),
        )
    }

    fn source_fixture(
        lo: i64,
    ) -> (
        Arc<ExchangeSinkHandle>,
        BatchExchangeSourceOperator,
        Arc<BatchContext>,
    ) {
        let channel = ExchangeChannel::new(
            ChannelId::client_to_server(UniqueId::new(0x50cc, lo), 0),
            8,
        );
        let sink = channel.attach_sink();
        let context = Arc::new(BatchContext::new());
        let operator = BatchExchangeSourceOperator::new(channel.source_handle(), Arc::clone(&context));
        (sink, operator, context)
    }

    #[test]
    fn mismatched_batch_id_while_active_is_a_protocol_error() {
        let (sink, mut operator, context) = source_fixture(1);
        sink.add_page(data_page(0, 0, false)).expect("accepted");
        sink.add_page(data_page(1, 0, true)).expect("accepted");

        let first = operator.pull_page().expect("first page ok").expect("page");
        assert!(first.metadata().is_none(), "metadata consumed by the source");
        assert_eq!(context.state(), BatchLifecycle::Active);

        let err = operator.pull_page().expect_err("wrong batch id");
        assert!(err.contains("protocol violation"), "{err}");
        assert!(err.contains("batch 1"), "{err}");
    }

    #[test]
    fn non_contiguous_page_index_is_a_protocol_error() {
        let (sink, mut operator, _context) = source_fixture(2);
        sink.add_page(data_page(0, 0, false)).expect("accepted");
        sink.add_page(data_page(0, 2, true)).expect("accepted");

        let _ = operator.pull_page().expect("first page ok").expect("page");
        let err = operator.pull_page().expect_err("index gap");
        assert!(err.contains("expected page index 1"), "{err}");
    }

    #[test]
    fn page_without_metadata_is_a_protocol_error() {
        let (sink, mut operator, _context) = source_fixture(3);
        let mut page = data_page(0, 0, true);
        let _ = page.take_metadata();
        sink.add_page(page).expect("accepted");

        let err = operator.pull_page().expect_err("metadata required");
        assert!(err.contains("without batch metadata"), "{err}");
    }

    #[test]
    fn marker_drains_the_batch_and_draining_gates_polling() {
        let (sink, mut operator, context) = source_fixture(4);
        sink.add_page(Page::marker(BatchMetadata::single(5))).expect("accepted");
        sink.add_page(data_page(6, 0, true)).expect("accepted");

        // The marker is consumed, never forwarded.
        assert!(operator.pull_page().expect("marker ok").is_none());
        assert_eq!(context.state(), BatchLifecycle::Draining);

        // Batch 6 stays queued until the drain completes.
        assert!(!operator.has_output());
        assert!(operator.pull_page().expect("gated").is_none());

        context.end_batch().expect("drained");
        assert!(operator.has_output());
        let page = operator.pull_page().expect("next batch ok").expect("page");
        assert!(page.metadata().is_none());
        assert_eq!(context.current_batch_id(), Some(6));
    }
}
