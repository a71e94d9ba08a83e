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
//! Core operator traits and blocking semantics.
//!
//! Responsibilities:
//! - Defines source/processor/sink execution contracts and blocked-reason
//!   signaling for cooperative scheduling.
//! - Used by the batch driver to orchestrate operator execution steps.
//!
//! Key exported interfaces:
//! - Types: `BlockedReason`, `Operator`, `ProcessorOperator`.

use std::sync::Arc;

use crate::exec::page::Page;
use crate::exec::pipeline::observer::Observable;

/// The execution engine uses cooperative scheduling.
///
/// Operators are driven by a [`BatchDriver`](crate::exec::pipeline::driver::BatchDriver)
/// which repeatedly tries to move pages from upstream to downstream. When a
/// driver cannot make progress without blocking, it records a
/// [`BlockedReason`] and yields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// Upstream currently has no page available.
    InputEmpty,
    /// Downstream cannot accept more output at the moment.
    OutputFull,
}

/// Base operator contract implemented by source/processor/sink operators.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn prepare(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn cancel(&mut self) {
        // Default: nothing to cancel.
    }

    fn is_finished(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }
}

/// Extended operator contract for stages with push/pull semantics.
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn has_output(&self) -> bool;

    fn push_page(&mut self, page: Page) -> Result<(), String>;

    fn pull_page(&mut self) -> Result<Option<Page>, String>;

    fn set_finishing(&mut self) -> Result<(), String>;

    /// Flushes output buffered for the batch currently draining. Returns
    /// `true` when everything buffered has been handed downstream; sinks
    /// with backpressured channels may need multiple calls.
    fn flush_batch(&mut self) -> Result<bool, String> {
        Ok(true)
    }

    /// Observable for source-side readiness (has_output becomes true).
    fn source_observable(&self) -> Option<Arc<Observable>> {
        None
    }

    /// Observable for sink-side readiness (need_input becomes true).
    fn sink_observable(&self) -> Option<Arc<Observable>> {
        None
    }
}
