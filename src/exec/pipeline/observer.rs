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
//! Observable primitives for readiness notifications.
//!
//! Responsibilities:
//! - Provides callback registration and deferred notification helpers for
//!   channel readiness transitions.
//! - Used by exchange channels to wake blocked drivers and readers.
//!
//! Key exported interfaces:
//! - Types: `Observer`, `Observable`, `DeferNotify`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Callback type invoked when an observable readiness event fires.
pub type Observer = Arc<dyn Fn() + Send + Sync + 'static>;

/// Observer registry broadcasting readiness transitions.
pub struct Observable {
    observers: Mutex<Vec<Observer>>,
}

impl Observable {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Observer) {
        let mut guard = self.observers.lock().expect("observable lock");
        guard.push(observer);
    }

    // Create a deferred notifier that triggers on drop if armed.
    pub fn defer_notify(self: &Arc<Self>) -> DeferNotify {
        DeferNotify::new(Arc::clone(self))
    }

    pub(crate) fn notify_observers(&self) {
        let observers = {
            let guard = self.observers.lock().expect("observable lock");
            guard.clone()
        };
        for observer in observers {
            observer();
        }
    }

    pub fn num_observers(&self) -> usize {
        let guard = self.observers.lock().expect("observable lock");
        guard.len()
    }
}

impl Default for Observable {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII helper that defers observer callbacks until drop so notifications
/// always happen outside the state lock. Call `arm()` after the state change
/// is committed.
#[must_use]
pub struct DeferNotify {
    observable: Arc<Observable>,
    armed: AtomicBool,
}

impl DeferNotify {
    pub fn new(observable: Arc<Observable>) -> Self {
        Self {
            observable,
            armed: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }
}

impl Drop for DeferNotify {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            self.observable.notify_observers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn armed_defer_notify_fires_on_drop() {
        let observable = Arc::new(Observable::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        observable.add_observer(Arc::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        {
            let notify = observable.defer_notify();
            notify.arm();
            assert_eq!(hits.load(Ordering::SeqCst), 0);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unarmed_defer_notify_is_silent() {
        let observable = Arc::new(Observable::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        observable.add_observer(Arc::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        drop(observable.defer_notify());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
