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
//! Columnar page and batch metadata.
//!
//! Responsibilities:
//! - Wraps an Arrow `RecordBatch` as the unit of data flowing through
//!   exchange channels and operator pipelines.
//! - Carries optional batch metadata that delimits batches on the wire.
//!
//! Key exported interfaces:
//! - Types: `BatchMetadata`, `Page`.

use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::datatypes::{Schema, SchemaRef};

/// Position of a page inside a batch.
///
/// Within one batch, `page_index_in_batch` values observed by the consumer
/// are strictly increasing from 0 and exactly one page (possibly a
/// zero-column marker) carries `is_last_page_in_batch = true`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BatchMetadata {
    pub batch_id: i64,
    pub page_index_in_batch: i32,
    pub is_last_page_in_batch: bool,
}

impl BatchMetadata {
    pub fn new(batch_id: i64, page_index_in_batch: i32, is_last_page_in_batch: bool) -> Self {
        Self {
            batch_id,
            page_index_in_batch,
            is_last_page_in_batch,
        }
    }

    /// Metadata of a single-page batch: index 0, last page.
    pub fn single(batch_id: i64) -> Self {
        Self::new(batch_id, 0, true)
    }
}

/// A page of rows, consisting of typed columns plus optional batch metadata.
///
/// Ownership transfers into a channel on `add_page`; the producer must not
/// touch the page afterwards.
#[derive(Debug, Clone)]
pub struct Page {
    pub batch: RecordBatch,
    metadata: Option<BatchMetadata>,
}

impl Page {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            metadata: None,
        }
    }

    pub fn with_metadata(batch: RecordBatch, metadata: BatchMetadata) -> Self {
        Self {
            batch,
            metadata: Some(metadata),
        }
    }

    /// Zero-column marker page signaling an empty batch (or terminating a
    /// batch without carrying rows).
    pub fn marker(metadata: BatchMetadata) -> Self {
        let batch = RecordBatch::try_new_with_options(
            Arc::new(Schema::empty()),
            Vec::new(),
            &RecordBatchOptions::new().with_row_count(Some(0)),
        )
        .expect("empty record batch is always valid");
        Self {
            batch,
            metadata: Some(metadata),
        }
    }

    pub fn metadata(&self) -> Option<BatchMetadata> {
        self.metadata
    }

    pub fn set_metadata(&mut self, metadata: BatchMetadata) {
        self.metadata = Some(metadata);
    }

    /// Removes the batch metadata, returning it. Used when handing a page
    /// downstream into the transform pipeline, which is batch-agnostic.
    pub fn take_metadata(&mut self) -> Option<BatchMetadata> {
        self.metadata.take()
    }

    /// A marker page carries no columns; it only delimits a batch.
    pub fn is_marker(&self) -> bool {
        self.batch.num_columns() == 0
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }
}
