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
//! Reference-counted completion tracking.
//!
//! Responsibilities:
//! - Counts outstanding completion signals (two per worker: data channel
//!   and status response) plus one initial reference held until `finish`.
//! - Fires a one-shot callback exactly once when the count reaches zero,
//!   regardless of thread interleaving.
//!
//! Key exported interfaces:
//! - Types: `CompletionTracker`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Callback invoked once when every acquired reference has been released.
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Atomic counter with a one-shot finalizer.
///
/// Starts at one: the initial reference is released by
/// `release_initial` (the client's `finish()`), so the all-done event cannot
/// fire while more workers may still be created.
pub struct CompletionTracker {
    refs: AtomicUsize,
    initial_released: AtomicBool,
    done: AtomicBool,
    on_done: Mutex<Option<CompletionCallback>>,
}

impl CompletionTracker {
    pub fn new(on_done: CompletionCallback) -> Self {
        Self {
            refs: AtomicUsize::new(1),
            initial_released: AtomicBool::new(false),
            done: AtomicBool::new(false),
            on_done: Mutex::new(Some(on_done)),
        }
    }

    pub fn acquire(&self) {
        let prev = self.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "acquire after completion fired");
    }

    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without matching acquire");
        if prev == 1 {
            self.fire();
        }
    }

    /// Releases the initial reference held since construction. Idempotent,
    /// so a repeated `finish()` is a no-op.
    pub fn release_initial(&self) {
        if !self.initial_released.swap(true, Ordering::AcqRel) {
            self.release();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn fire(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.on_done.lock().expect("completion callback lock").take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker_with_counter() -> (Arc<CompletionTracker>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let tracker = Arc::new(CompletionTracker::new(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })));
        (tracker, fired)
    }

    #[test]
    fn fires_only_after_initial_release() {
        let (tracker, fired) = tracker_with_counter();
        tracker.acquire();
        tracker.acquire();
        tracker.release();
        tracker.release();
        assert!(!tracker.is_done(), "initial reference still held");
        tracker.release_initial();
        assert!(tracker.is_done());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_initial_release_is_noop() {
        let (tracker, fired) = tracker_with_counter();
        tracker.acquire();
        tracker.release_initial();
        tracker.release_initial();
        assert!(!tracker.is_done());
        tracker.release();
        assert!(tracker.is_done());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_releases_fire_exactly_once() {
        let (tracker, fired) = tracker_with_counter();
        let workers = 8;
        for _ in 0..workers {
            tracker.acquire();
        }
        tracker.release_initial();

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || tracker.release())
            })
            .collect();
        for handle in handles {
            handle.join().expect("release thread");
        }
        assert!(tracker.is_done());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
