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
//! Driver execution thread.
//!
//! Responsibilities:
//! - Runs one batch driver to completion on a dedicated thread, parking on
//!   a condvar while the driver is blocked and waking on channel readiness
//!   notifications.
//! - Reports the terminal driver state through a one-shot listener.
//!
//! Key exported interfaces:
//! - Functions: `run_driver`.
//!
//! Readiness observers can fire before the executor parks, so the wait is
//! bounded and re-checks `check_is_ready` on every pass rather than trusting
//! the wakeup flag alone.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::batchex_logging::debug;
use crate::exec::pipeline::driver::{BatchDriver, DriverState};

/// One-shot callback invoked with the terminal driver state.
pub type DriverListener = Box<dyn FnOnce(DriverState) + Send>;

const TIME_SLICE: Duration = Duration::from_millis(10);
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Spawns a thread that drives `driver` until it finishes or fails, then
/// fires `listener` exactly once with the terminal state.
pub fn run_driver(mut driver: BatchDriver, listener: DriverListener) -> JoinHandle<()> {
    let thread_name = format!("batch-driver-{}", driver.driver_id());
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            if let Err(err) = driver.prepare() {
                listener(DriverState::Failed(err));
                return;
            }

            let wakeup = Arc::new((Mutex::new(false), Condvar::new()));
            let observer = {
                let wakeup = Arc::clone(&wakeup);
                Arc::new(move || {
                    let (flag, condvar) = &*wakeup;
                    *flag.lock().expect("driver wakeup lock") = true;
                    condvar.notify_all();
                })
            };
            if let Some(observable) = driver.source_observable() {
                observable.add_observer(observer.clone());
            }
            if let Some(observable) = driver.sink_observable() {
                observable.add_observer(observer);
            }

            loop {
                let state = driver.process(TIME_SLICE);
                match state {
                    DriverState::Ready | DriverState::Running => continue,
                    DriverState::Blocked(reason) => {
                        debug!(
                            "driver parked: driver_id={} reason={:?}",
                            driver.driver_id(),
                            reason
                        );
                        let (flag, condvar) = &*wakeup;
                        let mut signaled = flag.lock().expect("driver wakeup lock");
                        while !driver.check_is_ready() {
                            let (guard, _) = condvar
                                .wait_timeout(signaled, BLOCKED_POLL_INTERVAL)
                                .expect("driver wakeup wait");
                            signaled = guard;
                            *signaled = false;
                        }
                    }
                    DriverState::Finished | DriverState::Failed(_) => {
                        listener(state);
                        return;
                    }
                }
            }
        })
        .expect("spawn batch driver thread")
}
