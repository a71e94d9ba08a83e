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
//! Batch lifecycle state machine for one server connection.
//!
//! Responsibilities:
//! - Tracks which batch is currently streaming in and whether the pipeline
//!   is draining it.
//! - Rejects invalid transitions loudly; a wrong transition is a protocol
//!   or programming error, never silently ignored.
//!
//! Key exported interfaces:
//! - Types: `BatchLifecycle`, `BatchContext`.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

/// Lifecycle of batch intake on one server connection.
///
/// ```text
/// NotStarted ──► Active ──► Draining ──► Idle ──► Active ──► ...
/// ```
///
/// At most one batch is Active per connection at a time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BatchLifecycle {
    /// No page for any batch has been accepted yet.
    NotStarted = 0,
    /// Between batches: the previous batch fully drained.
    Idle = 1,
    /// A batch is currently streaming in.
    Active = 2,
    /// The last page of the batch has been seen; the pipeline is pumped
    /// until it can produce no more output without new input.
    Draining = 3,
}

impl BatchLifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BatchLifecycle::NotStarted,
            1 => BatchLifecycle::Idle,
            2 => BatchLifecycle::Active,
            3 => BatchLifecycle::Draining,
            other => unreachable!("invalid batch lifecycle discriminant {other}"),
        }
    }

    /// Explicit transition table. Anything not listed is invalid.
    fn can_transition(self, next: BatchLifecycle) -> bool {
        matches!(
            (self, next),
            (BatchLifecycle::NotStarted, BatchLifecycle::Active)
                | (BatchLifecycle::Idle, BatchLifecycle::Active)
                | (BatchLifecycle::Active, BatchLifecycle::Draining)
                | (BatchLifecycle::Draining, BatchLifecycle::Idle)
        )
    }
}

const NO_BATCH: i64 = i64::MIN;

/// Owns the batch lifecycle and the current batch id for one connection.
///
/// Mutated only by the single driver thread that owns the connection; other
/// threads may read the state and batch id for diagnostics, which is why
/// both live in atomics rather than behind a lock.
pub struct BatchContext {
    state: AtomicU8,
    batch_id: AtomicI64,
}

impl BatchContext {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(BatchLifecycle::NotStarted as u8),
            batch_id: AtomicI64::new(NO_BATCH),
        }
    }

    pub fn state(&self) -> BatchLifecycle {
        BatchLifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Batch id currently Active or Draining, if any.
    pub fn current_batch_id(&self) -> Option<i64> {
        match self.state() {
            BatchLifecycle::Active | BatchLifecycle::Draining => {
                Some(self.batch_id.load(Ordering::Acquire))
            }
            _ => None,
        }
    }

    fn transition(&self, next: BatchLifecycle) -> Result<(), String> {
        let current = self.state();
        if !current.can_transition(next) {
            return Err(format!(
                "invalid batch lifecycle transition {current:?} -> {next:?}"
            ));
        }
        self.state.store(next as u8, Ordering::Release);
        Ok(())
    }

    /// Records `batch_id` and enters Active. Errors if a batch is already
    /// Active or Draining.
    pub fn start_batch(&self, batch_id: i64) -> Result<(), String> {
        self.transition(BatchLifecycle::Active)
            .map_err(|e| format!("start_batch({batch_id}): {e}"))?;
        self.batch_id.store(batch_id, Ordering::Release);
        Ok(())
    }

    /// Enters Draining after the last page of the Active batch was seen.
    pub fn start_draining(&self) -> Result<(), String> {
        self.transition(BatchLifecycle::Draining)
            .map_err(|e| format!("start_draining: {e}"))
    }

    /// Completes the drain, returning to Idle.
    pub fn end_batch(&self) -> Result<(), String> {
        self.transition(BatchLifecycle::Idle)
            .map_err(|e| format!("end_batch: {e}"))?;
        self.batch_id.store(NO_BATCH, Ordering::Release);
        Ok(())
    }
}

impl Default for BatchContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle_round_trip() {
        let ctx = BatchContext::new();
        assert_eq!(ctx.state(), BatchLifecycle::NotStarted);
        assert_eq!(ctx.current_batch_id(), None);

        ctx.start_batch(7).expect("not started -> active");
        assert_eq!(ctx.state(), BatchLifecycle::Active);
        assert_eq!(ctx.current_batch_id(), Some(7));

        ctx.start_draining().expect("active -> draining");
        assert_eq!(ctx.current_batch_id(), Some(7));

        ctx.end_batch().expect("draining -> idle");
        assert_eq!(ctx.state(), BatchLifecycle::Idle);
        assert_eq!(ctx.current_batch_id(), None);

        ctx.start_batch(8).expect("idle -> active");
        assert_eq!(ctx.current_batch_id(), Some(8));
    }

    #[test]
    fn start_batch_while_active_is_rejected() {
        let ctx = BatchContext::new();
        ctx.start_batch(1).expect("first batch starts");
        let err = ctx.start_batch(2).expect_err("second start must fail");
        assert!(err.contains("invalid batch lifecycle transition"), "{err}");
        // The active batch is untouched by the failed transition.
        assert_eq!(ctx.current_batch_id(), Some(1));
    }

    #[test]
    fn draining_requires_active() {
        let ctx = BatchContext::new();
        assert!(ctx.start_draining().is_err());
        assert!(ctx.end_batch().is_err());
    }
}
