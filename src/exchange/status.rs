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
//! Status request/response routing.
//!
//! Responsibilities:
//! - Routes the client-ready request to the server instance owning an
//!   exchange id.
//! - Delivers the single final status response per exchange id back to the
//!   client-side listener; a listener is consumed on delivery so a second
//!   response cannot be observed.
//!
//! Key exported interfaces:
//! - Types: `StatusResponse`.
//! - Functions: `register_ready_handler`, `signal_ready`,
//!   `register_status_listener`, `deliver_status`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::batchex_logging::debug;
use crate::common::ids::ExchangeId;
use crate::exchange::failure::ExchangeFailure;

/// Final per-connection status: success, or the best failure the server
/// observed across its driver and outbound sink.
#[derive(Clone, Debug)]
pub struct StatusResponse {
    pub exchange_id: ExchangeId,
    pub failure: Option<ExchangeFailure>,
}

pub type ReadyHandler = Arc<dyn Fn() + Send + Sync>;
pub type StatusListener = Box<dyn FnOnce(StatusResponse) + Send>;

static READY_HANDLERS: OnceLock<Mutex<HashMap<ExchangeId, ReadyHandler>>> = OnceLock::new();
static STATUS_LISTENERS: OnceLock<Mutex<HashMap<ExchangeId, StatusListener>>> = OnceLock::new();

fn ready_handlers() -> &'static Mutex<HashMap<ExchangeId, ReadyHandler>> {
    READY_HANDLERS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn status_listeners() -> &'static Mutex<HashMap<ExchangeId, StatusListener>> {
    STATUS_LISTENERS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register_ready_handler(id: ExchangeId, handler: ReadyHandler) -> Result<(), String> {
    let mut guard = ready_handlers().lock().expect("ready handler lock");
    if guard.contains_key(&id) {
        return Err(format!("exchange id {id} already registered"));
    }
    guard.insert(id, handler);
    Ok(())
}

pub fn unregister_ready_handler(id: ExchangeId) {
    ready_handlers().lock().expect("ready handler lock").remove(&id);
}

/// Routes a client-ready request to the owning server.
pub fn signal_ready(id: ExchangeId) -> Result<(), String> {
    let handler = {
        let guard = ready_handlers().lock().expect("ready handler lock");
        guard.get(&id).cloned()
    };
    match handler {
        Some(handler) => {
            debug!("client-ready routed: exchange_id={}", id);
            handler();
            Ok(())
        }
        None => Err(format!("client-ready for unknown exchange id {id}")),
    }
}

pub fn register_status_listener(id: ExchangeId, listener: StatusListener) {
    let mut guard = status_listeners().lock().expect("status listener lock");
    debug_assert!(
        !guard.contains_key(&id),
        "status listener registered twice for {id}"
    );
    guard.insert(id, listener);
}

/// Removes a listener without delivering, e.g. when worker setup failed and
/// no response will ever arrive.
pub fn unregister_status_listener(id: ExchangeId) -> Option<StatusListener> {
    status_listeners().lock().expect("status listener lock").remove(&id)
}

/// Delivers the one status response for an exchange id, consuming the
/// listener.
pub fn deliver_status(response: StatusResponse) -> Result<(), String> {
    let listener = unregister_status_listener(response.exchange_id);
    match listener {
        Some(listener) => {
            debug!(
                "status response delivered: exchange_id={} failure={:?}",
                response.exchange_id, response.failure
            );
            listener(response);
            Ok(())
        }
        None => Err(format!(
            "status response for unknown exchange id {}",
            response.exchange_id
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_id(lo: i64) -> ExchangeId {
        ExchangeId {
            session: UniqueId::new(0x7e57, lo),
            worker_index: 0,
        }
    }

    #[test]
    fn ready_signal_reaches_registered_handler() {
        let id = test_id(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        register_ready_handler(id, Arc::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("registered");
        signal_ready(id).expect("routed");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        unregister_ready_handler(id);
        assert!(signal_ready(id).is_err());
    }

    #[test]
    fn status_listener_is_consumed_on_delivery() {
        let id = test_id(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        register_status_listener(
            id,
            Box::new(move |response| {
                assert!(response.failure.is_none());
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        deliver_status(StatusResponse {
            exchange_id: id,
            failure: None,
        })
        .expect("delivered");
        // The one listener was consumed; a second response has nowhere to go.
        assert!(
            deliver_status(StatusResponse {
                exchange_id: id,
                failure: None,
            })
            .is_err()
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
