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
//! Batch-ordered buffering of result pages.
//!
//! Responsibilities:
//! - Buffers result pages arriving out of batch order from concurrently
//!   completing workers.
//! - Releases pages only for the batch the caller designates, so batch N+1
//!   is never exposed before batch N has been acknowledged.
//!
//! Key exported interfaces:
//! - Types: `BatchOrderingBuffer`.
//!
//! Marker pages are consumed on insert; they complete a batch without
//! contributing data pages.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::exec::page::Page;

/// Buffers out-of-order result pages keyed by batch id. The single reader
/// drains it; all workers write into the one channel feeding it.
pub struct BatchOrderingBuffer {
    pending: BTreeMap<i64, VecDeque<Page>>,
    /// Batches whose last-flagged page has arrived.
    completed: BTreeSet<i64>,
}

impl BatchOrderingBuffer {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Inserts a result page. Pages must carry batch metadata; within one
    /// batch they arrive in page-index order from the producing server.
    pub fn insert(&mut self, page: Page) -> Result<(), String> {
        let meta = page
            .metadata()
            .ok_or_else(|| "result page without batch metadata".to_string())?;
        if meta.is_last_page_in_batch {
            self.completed.insert(meta.batch_id);
        }
        if page.is_marker() {
            // Batch delimiter only; nothing for the consumer.
            return Ok(());
        }
        self.pending.entry(meta.batch_id).or_default().push_back(page);
        Ok(())
    }

    /// Next page of `batch_id`, if buffered. Pages of other batches stay
    /// buffered regardless of arrival order.
    pub fn poll_batch(&mut self, batch_id: i64) -> Option<Page> {
        let queue = self.pending.get_mut(&batch_id)?;
        let page = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&batch_id);
        }
        page
    }

    /// Whether the last page of `batch_id` has been observed.
    pub fn is_batch_complete(&self, batch_id: i64) -> bool {
        self.completed.contains(&batch_id)
    }

    /// Whether no page of `batch_id` remains buffered.
    pub fn is_batch_drained(&self, batch_id: i64) -> bool {
        !self.pending.contains_key(&batch_id)
    }

    /// Drops bookkeeping for an acknowledged batch.
    pub fn acknowledge(&mut self, batch_id: i64) {
        self.pending.remove(&batch_id);
        self.completed.remove(&batch_id);
    }

    pub fn buffered_pages(&self) -> usize {
        self.pending.values().map(|q| q.len()).sum()
    }
}

impl Default for BatchOrderingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::page::BatchMetadata;
    use arrow::array::{ArrayRef, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn data_page(batch_id: i64, index: i32, last: bool) -> Page {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let array = Arc::new(Int64Array::from(vec![index as i64])) as ArrayRef;
        Page::with_metadata(
            RecordBatch::try_new(schema, vec![array]).expect("valid batch"),
            BatchMetadata::new(batch_id, index, last),
        )
    }

    #[test]
    fn releases_only_the_requested_batch() {
        let mut buffer = BatchOrderingBuffer::new();
        // Batch 1 arrives entirely before batch 0.
        buffer.insert(data_page(1, 0, true)).expect("insert");
        buffer.insert(data_page(0, 0, false)).expect("insert");
        buffer.insert(data_page(0, 1, true)).expect("insert");

        assert!(buffer.poll_batch(0).is_some());
        assert!(buffer.poll_batch(0).is_some());
        assert!(buffer.poll_batch(0).is_none());
        assert!(buffer.is_batch_complete(0));

        let page = buffer.poll_batch(1).expect("batch 1 buffered");
        assert_eq!(page.metadata().expect("metadata").batch_id, 1);
    }

    #[test]
    fn marker_completes_batch_without_pages() {
        let mut buffer = BatchOrderingBuffer::new();
        buffer
            .insert(Page::marker(BatchMetadata::single(3)))
            .expect("marker accepted");
        assert!(buffer.is_batch_complete(3));
        assert!(buffer.poll_batch(3).is_none());
        assert_eq!(buffered(&buffer), 0);

        buffer.acknowledge(3);
        assert!(!buffer.is_batch_complete(3));
    }

    fn buffered(buffer: &BatchOrderingBuffer) -> usize {
        buffer.buffered_pages()
    }

    #[test]
    fn page_without_metadata_is_rejected() {
        let mut buffer = BatchOrderingBuffer::new();
        let mut page = data_page(0, 0, true);
        let _ = page.take_metadata();
        assert!(buffer.insert(page).is_err());
    }
}
