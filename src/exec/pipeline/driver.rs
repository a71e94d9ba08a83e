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
//! Batch driver execution loop.
//!
//! Responsibilities:
//! - Runs source/processor/sink operators with cooperative scheduling
//!   semantics, moving pages along the edges between adjacent operators.
//! - Completes a draining batch: once the pipeline can produce no more
//!   output without new input, flushes the sink and returns the lifecycle
//!   to Idle so the next batch can start.
//! - Tracks driver state transitions and blocking reasons.
//!
//! Key exported interfaces:
//! - Types: `DriverState`, `BatchDriver`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::operator::{BlockedReason, Operator};
use crate::batchex_logging::{debug, error};
use crate::exec::page::Page;
use crate::exec::pipeline::batch_context::{BatchContext, BatchLifecycle};
use crate::exec::pipeline::observer::Observable;

/// Runtime state for a single batch driver.
///
/// ```text
///              (scheduled)                 (time slice ends)
///   Ready ───────────────────► Running ─────────────────────► Ready
///                               │  │
///                               │  ├─ blocks on channel I/O ─► Blocked(reason)
///                               │  │                         │
///                               │  │        (resumed)         │
///                               │  └─────────────────────────┘
///                               │
///                               ├─ completes normally ───────► Finished
///                               └─ fatal error ──────────────► Failed(err)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverState {
    Ready,
    Running,
    Blocked(BlockedReason),
    Finished,
    Failed(String),
}

/// Cooperative execution driver running the operators of one connection.
///
/// Owned and mutated by a single executor thread.
pub struct BatchDriver {
    driver_id: i32,
    label: String,
    operators: Vec<Box<dyn Operator>>,
    context: Arc<BatchContext>,
    state: DriverState,
    closed: bool,

    edge_pages: Vec<Option<Page>>,
    edge_closed: Vec<bool>,
    operator_finishing_set: Vec<bool>,
}

impl BatchDriver {
    pub fn new(
        driver_id: i32,
        label: impl Into<String>,
        operators: Vec<Box<dyn Operator>>,
        context: Arc<BatchContext>,
    ) -> Self {
        let operator_count = operators.len();
        let edge_count = operator_count.saturating_sub(1);
        Self {
            driver_id,
            label: label.into(),
            operators,
            context,
            state: DriverState::Ready,
            closed: false,
            edge_pages: (0..edge_count).map(|_| None).collect(),
            edge_closed: vec![false; edge_count],
            operator_finishing_set: vec![false; operator_count],
        }
    }

    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn prepare(&mut self) -> Result<(), String> {
        for op in self.operators.iter_mut() {
            op.prepare()?;
        }
        Ok(())
    }

    fn cancel_operators(&mut self) {
        for op in self.operators.iter_mut() {
            op.cancel();
        }
    }

    pub fn process(&mut self, time_slice: Duration) -> DriverState {
        let start = Instant::now();
        self.state = DriverState::Running;

        loop {
            if start.elapsed() >= time_slice {
                self.state = DriverState::Ready;
                return self.state.clone();
            }

            if self.is_finished() {
                return self.finish_with_state(DriverState::Finished);
            }

            let mut made_progress = false;

            if let Err(err) = self.propagate_edge_closure(&mut made_progress) {
                return self.finish_with_state(DriverState::Failed(err));
            }
            if let Err(err) = self.drive_set_finishing(&mut made_progress) {
                return self.finish_with_state(DriverState::Failed(err));
            }
            if let Err(err) = self.drive_dataflow(&mut made_progress) {
                return self.finish_with_state(DriverState::Failed(err));
            }
            if let Err(err) = self.try_complete_batch(&mut made_progress) {
                return self.finish_with_state(DriverState::Failed(err));
            }

            if made_progress {
                continue;
            }

            // A draining batch only proceeds once the sink channel frees
            // capacity for the flush, so that is an output-side wait.
            if self.context.state() == BatchLifecycle::Draining {
                return self.block(BlockedReason::OutputFull);
            }

            let has_buffered = self.edge_pages.iter().any(|p| p.is_some());

            if !has_buffered
                && let Some(source) = self.operators.first()
                && !source.is_finished()
            {
                let Some(proc) = source.as_processor_ref() else {
                    return self.finish_with_state(DriverState::Failed(
                        "pipeline source missing processor operator".to_string(),
                    ));
                };
                if !proc.has_output() {
                    return self.block(BlockedReason::InputEmpty);
                }
            }

            if let Some(sink) = self.operators.last()
                && !sink.is_finished()
            {
                let Some(proc) = sink.as_processor_ref() else {
                    return self.finish_with_state(DriverState::Failed(
                        "pipeline sink missing processor operator".to_string(),
                    ));
                };
                if !proc.need_input() {
                    return self.block(BlockedReason::OutputFull);
                }
            }

            self.state = DriverState::Ready;
            return self.state.clone();
        }
    }

    pub(crate) fn source_observable(&self) -> Option<Arc<Observable>> {
        let op = self.operators.first()?;
        op.as_processor_ref()?.source_observable()
    }

    pub(crate) fn sink_observable(&self) -> Option<Arc<Observable>> {
        let op = self.operators.last()?;
        op.as_processor_ref()?.sink_observable()
    }

    pub(crate) fn source_ready(&self) -> bool {
        let Some(op) = self.operators.first() else {
            return true;
        };
        if op.is_finished() {
            return true;
        }
        let Some(proc) = op.as_processor_ref() else {
            return true;
        };
        if proc.has_output() {
            return true;
        }
        op.is_finished()
    }

    pub(crate) fn sink_ready(&self) -> bool {
        let Some(op) = self.operators.last() else {
            return true;
        };
        if op.is_finished() {
            return true;
        }
        let Some(proc) = op.as_processor_ref() else {
            return true;
        };
        if proc.need_input() {
            return true;
        }
        op.is_finished()
    }

    pub(crate) fn check_is_ready(&self) -> bool {
        match &self.state {
            DriverState::Blocked(reason) => match reason {
                BlockedReason::InputEmpty => {
                    self.source_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
                BlockedReason::OutputFull => {
                    self.sink_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
            },
            DriverState::Ready | DriverState::Running => true,
            DriverState::Finished | DriverState::Failed(_) => true,
        }
    }

    fn has_ready_finishing_work(&self) -> bool {
        for idx in 1..self.operators.len() {
            if self.operator_finishing_set[idx] {
                continue;
            }
            let in_edge = idx - 1;
            if self.edge_closed[in_edge] && self.edge_pages[in_edge].is_none() {
                return true;
            }
        }
        false
    }

    fn is_finished(&self) -> bool {
        self.operators
            .last()
            .map(|op| op.is_finished())
            .unwrap_or(true)
    }

    fn block(&mut self, reason: BlockedReason) -> DriverState {
        self.state = DriverState::Blocked(reason);
        self.state.clone()
    }

    fn finish_with_state(&mut self, state: DriverState) -> DriverState {
        match &state {
            DriverState::Finished => {
                debug!(
                    "driver finished: label={} driver_id={}",
                    self.label, self.driver_id
                );
            }
            DriverState::Failed(err) => {
                error!(
                    "driver failed: label={} driver_id={} error={}",
                    self.label, self.driver_id, err
                );
                self.cancel_operators();
            }
            _ => {}
        }
        if matches!(state, DriverState::Finished | DriverState::Failed(_)) {
            self.close_operators();
        }
        self.state = state;
        self.state.clone()
    }

    fn close_operators(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for idx in 0..self.edge_pages.len() {
            let _ = self.edge_pages[idx].take();
        }
        for idx in (0..self.operators.len()).rev() {
            let op = &mut self.operators[idx];
            if let Err(err) = op.close() {
                error!("operator close failed: {}: {}", op.name(), err);
            }
        }
    }

    fn drive_dataflow(&mut self, made_progress: &mut bool) -> Result<(), String> {
        if self.edge_pages.is_empty() {
            return Ok(());
        }
        self.drive_push_edges(made_progress)?;
        self.drive_pull_edges(made_progress)?;
        self.drive_push_edges(made_progress)?;
        Ok(())
    }

    fn drive_push_edges(&mut self, made_progress: &mut bool) -> Result<(), String> {
        for e in (0..self.edge_pages.len()).rev() {
            if self.edge_pages[e].is_none() {
                continue;
            }
            let downstream_idx = e + 1;
            let downstream_op = self
                .operators
                .get_mut(downstream_idx)
                .ok_or_else(|| "pipeline operator index out of bounds".to_string())?;
            let downstream_name = downstream_op.name().to_string();
            let downstream = downstream_op.as_processor_mut().ok_or_else(|| {
                format!("pipeline operator {downstream_name} missing processor operator")
            })?;
            if !downstream.need_input() {
                continue;
            }
            let page = self.edge_pages[e].take().expect("checked is_some");
            let downstream_op = self
                .operators
                .get_mut(downstream_idx)
                .ok_or_else(|| "pipeline operator index out of bounds".to_string())?;
            let downstream = downstream_op.as_processor_mut().ok_or_else(|| {
                format!("pipeline operator {downstream_name} missing processor operator")
            })?;
            downstream.push_page(page)?;
            *made_progress = true;
        }
        Ok(())
    }

    fn drive_pull_edges(&mut self, made_progress: &mut bool) -> Result<(), String> {
        for e in 0..self.edge_pages.len() {
            if self.edge_pages[e].is_some() {
                continue;
            }
            let downstream_idx = e + 1;
            let (left, right) = self.operators.split_at_mut(downstream_idx);
            let upstream_op = &mut left[e];
            let downstream_op = &mut right[0];

            let upstream_name = upstream_op.name().to_string();
            let upstream = upstream_op.as_processor_mut().ok_or_else(|| {
                format!("pipeline operator {upstream_name} missing processor operator")
            })?;
            let downstream_name = downstream_op.name().to_string();
            let downstream = downstream_op.as_processor_mut().ok_or_else(|| {
                format!("pipeline operator {downstream_name} missing processor operator")
            })?;

            if !upstream.has_output() || !downstream.need_input() {
                continue;
            }

            if let Some(page) = upstream.pull_page()? {
                self.edge_pages[e] = Some(page);
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn propagate_edge_closure(&mut self, made_progress: &mut bool) -> Result<(), String> {
        for e in 0..self.edge_pages.len() {
            if self.edge_closed[e] {
                continue;
            }
            if self.edge_pages[e].is_some() {
                continue;
            }
            let upstream_finished = self
                .operators
                .get(e)
                .map(|op| op.is_finished())
                .unwrap_or(false);
            if upstream_finished {
                self.edge_closed[e] = true;
                debug!(
                    "driver edge closed: label={} driver_id={} edge={}",
                    self.label, self.driver_id, e
                );
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn drive_set_finishing(&mut self, made_progress: &mut bool) -> Result<(), String> {
        for idx in 1..self.operators.len() {
            if self.operator_finishing_set[idx] {
                continue;
            }
            let in_edge = idx - 1;
            if !self.edge_closed[in_edge] || self.edge_pages[in_edge].is_some() {
                continue;
            }
            let op = self
                .operators
                .get_mut(idx)
                .ok_or_else(|| "pipeline operator index out of bounds".to_string())?;
            let op_name = op.name().to_string();
            let proc = op
                .as_processor_mut()
                .ok_or_else(|| format!("pipeline operator {op_name} missing processor operator"))?;
            proc.set_finishing()?;
            debug!(
                "driver set_finishing: label={} driver_id={} op={}",
                self.label, self.driver_id, op_name
            );
            self.operator_finishing_set[idx] = true;
            *made_progress = true;
        }
        Ok(())
    }

    /// When the active batch is draining and the pipeline has been pumped
    /// dry, flushes the sink and returns the lifecycle to Idle. A flush held
    /// back by channel backpressure simply tries again on the next pass.
    fn try_complete_batch(&mut self, made_progress: &mut bool) -> Result<(), String> {
        if self.context.state() != BatchLifecycle::Draining {
            return Ok(());
        }
        if self.edge_pages.iter().any(|p| p.is_some()) {
            return Ok(());
        }
        // Every non-sink operator must be pumped dry before the flush.
        for idx in 0..self.operators.len().saturating_sub(1) {
            let op = &self.operators[idx];
            let op_name = op.name().to_string();
            let proc = op
                .as_processor_ref()
                .ok_or_else(|| format!("pipeline operator {op_name} missing processor operator"))?;
            if proc.has_output() {
                return Ok(());
            }
        }
        let sink_op = self
            .operators
            .last_mut()
            .ok_or_else(|| "pipeline has no sink operator".to_string())?;
        let sink_name = sink_op.name().to_string();
        let sink = sink_op
            .as_processor_mut()
            .ok_or_else(|| format!("pipeline operator {sink_name} missing processor operator"))?;
        if sink.flush_batch()? {
            let batch_id = self.context.current_batch_id();
            self.context.end_batch()?;
            debug!(
                "driver batch drained: label={} driver_id={} batch_id={:?}",
                self.label, self.driver_id, batch_id
            );
            *made_progress = true;
        }
        Ok(())
    }
}

impl Drop for BatchDriver {
    fn drop(&mut self) {
        self.close_operators();
    }
}
