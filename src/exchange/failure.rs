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
//! Origin-tagged exchange failures and priority merging.
//!
//! Responsibilities:
//! - Tags every failure with where it originated so a specific root cause is
//!   never masked by a generic cancellation triggered while shutting down.
//! - Keeps a single best failure per client via a pure merge function, and
//!   triggers the notify-and-shutdown action exactly once.
//!
//! Key exported interfaces:
//! - Types: `FailureOrigin`, `ExchangeFailure`, `FailureCollector`.
//! - Functions: `best_failure`.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where a failure originated. Ordering is by how actionable the failure is:
/// a client-side failure outranks a server-side one, which outranks a plain
/// cancellation produced as a side effect of aborting channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureOrigin {
    ClientSide,
    ServerSide,
    Cancelled,
}

impl FailureOrigin {
    fn priority(self) -> u8 {
        match self {
            FailureOrigin::ClientSide => 2,
            FailureOrigin::ServerSide => 1,
            FailureOrigin::Cancelled => 0,
        }
    }

    /// Stable tag prefixing the string form of a failure. Owned by this
    /// module; layers passing failures through string seams recover the
    /// origin via [`ExchangeFailure::parse_tagged`].
    pub fn tag(self) -> &'static str {
        match self {
            FailureOrigin::ClientSide => "[client]",
            FailureOrigin::ServerSide => "[server]",
            FailureOrigin::Cancelled => "[cancelled]",
        }
    }
}

/// One failure observed somewhere in the exchange topology.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExchangeFailure {
    pub origin: FailureOrigin,
    pub message: String,
}

impl ExchangeFailure {
    pub fn client_side(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::ClientSide,
            message: message.into(),
        }
    }

    pub fn server_side(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::ServerSide,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Cancelled,
            message: message.into(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.origin == FailureOrigin::Cancelled
    }

    /// Recovers a failure from its string form, or `None` when `message`
    /// carries no origin tag. Inverse of `Display`.
    pub fn parse_tagged(message: &str) -> Option<Self> {
        for origin in [
            FailureOrigin::ClientSide,
            FailureOrigin::ServerSide,
            FailureOrigin::Cancelled,
        ] {
            if let Some(rest) = message.strip_prefix(origin.tag()) {
                return Some(Self {
                    origin,
                    message: rest.trim_start().to_string(),
                });
            }
        }
        None
    }
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.origin.tag(), self.message)
    }
}

/// Pure merge: keeps the higher-priority failure, preferring the incumbent
/// on ties so the first arrival of a tier is stable.
pub fn best_failure(
    current: Option<ExchangeFailure>,
    candidate: ExchangeFailure,
) -> ExchangeFailure {
    match current {
        None => candidate,
        Some(current) => {
            if candidate.origin.priority() > current.origin.priority() {
                candidate
            } else {
                current
            }
        }
    }
}

/// Retains the single best failure among all concurrent failure sources and
/// arbitrates the one-shot shutdown trigger.
///
/// `report` makes the merged failure visible before it reports whether this
/// call won the shutdown trigger, so a reader unblocked by the subsequent
/// channel abort can never observe "no error".
pub struct FailureCollector {
    best: Mutex<Option<ExchangeFailure>>,
    shutdown_triggered: AtomicBool,
}

impl FailureCollector {
    pub fn new() -> Self {
        Self {
            best: Mutex::new(None),
            shutdown_triggered: AtomicBool::new(false),
        }
    }

    /// Merges `failure` in; returns true iff this call is the first failure
    /// and the caller must run the notify-and-shutdown action.
    pub fn report(&self, failure: ExchangeFailure) -> bool {
        {
            let mut guard = self.best.lock().expect("failure collector lock");
            let merged = best_failure(guard.take(), failure);
            *guard = Some(merged);
        }
        !self.shutdown_triggered.swap(true, Ordering::AcqRel)
    }

    pub fn best(&self) -> Option<ExchangeFailure> {
        self.best.lock().expect("failure collector lock").clone()
    }

    pub fn has_failure(&self) -> bool {
        self.shutdown_triggered.load(Ordering::Acquire)
    }
}

impl Default for FailureCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_more_specific_origin() {
        let cancelled = ExchangeFailure::cancelled("channel aborted");
        let server = ExchangeFailure::server_side("breaker exhausted");
        let client = ExchangeFailure::client_side("bad request");

        let merged = best_failure(Some(cancelled.clone()), server.clone());
        assert_eq!(merged, server);
        let merged = best_failure(Some(merged), client.clone());
        assert_eq!(merged, client);
        // Never downgraded.
        let merged = best_failure(Some(merged), cancelled);
        assert_eq!(merged, client);
    }

    #[test]
    fn merge_keeps_first_within_same_tier() {
        let first = ExchangeFailure::server_side("first");
        let second = ExchangeFailure::server_side("second");
        assert_eq!(best_failure(Some(first.clone()), second), first);
    }

    #[test]
    fn tagged_string_form_round_trips() {
        let failure = ExchangeFailure::cancelled("exchange channel s2c/0 aborted");
        let parsed = ExchangeFailure::parse_tagged(&failure.to_string()).expect("tag recognized");
        assert_eq!(parsed, failure);

        let failure = ExchangeFailure::client_side("bad request");
        let parsed = ExchangeFailure::parse_tagged(&failure.to_string()).expect("tag recognized");
        assert_eq!(parsed.origin, FailureOrigin::ClientSide);
        assert_eq!(parsed.message, "bad request");

        assert!(ExchangeFailure::parse_tagged("protocol violation: page index").is_none());
    }

    #[test]
    fn shutdown_triggers_exactly_once() {
        let collector = FailureCollector::new();
        assert!(collector.report(ExchangeFailure::cancelled("abort")));
        assert!(!collector.report(ExchangeFailure::server_side("real cause")));
        assert!(!collector.report(ExchangeFailure::client_side("later still")));
        // Later reports still improved the recorded best error.
        assert_eq!(
            collector.best().expect("failure recorded").origin,
            FailureOrigin::ClientSide
        );
    }
}
