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
//! Channel and exchange identifiers.
//!
//! Responsibilities:
//! - Derives channel ids deterministically from session id, direction, and
//!   worker index so concurrent workers under one session never collide.
//! - Used by the client worker pool, the server orchestrator, and the
//!   in-process channel registry as hash-map keys.

use std::fmt;

use crate::common::types::UniqueId;

/// Direction of a point-to-point exchange channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChannelDirection {
    ClientToServer,
    ServerToClient,
}

impl ChannelDirection {
    fn tag(self) -> &'static str {
        match self {
            ChannelDirection::ClientToServer => "c2s",
            ChannelDirection::ServerToClient => "s2c",
        }
    }
}

/// Identifier of one exchange channel.
///
/// The `(session, direction, worker_index)` triple is the full identity; two
/// workers of the same session always get distinct ids in both directions.
/// The shared server-to-client channel uses worker index `SHARED_WORKER`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelId {
    pub session: UniqueId,
    pub direction: ChannelDirection,
    pub worker_index: i32,
}

/// Worker index used for the fan-in channel shared by all workers of a session.
pub const SHARED_WORKER: i32 = -1;

impl ChannelId {
    pub fn client_to_server(session: UniqueId, worker_index: i32) -> Self {
        Self {
            session,
            direction: ChannelDirection::ClientToServer,
            worker_index,
        }
    }

    pub fn shared_server_to_client(session: UniqueId) -> Self {
        Self {
            session,
            direction: ChannelDirection::ServerToClient,
            worker_index: SHARED_WORKER,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.session,
            self.direction.tag(),
            self.worker_index
        )
    }
}

/// Identifier of one client/server exchange connection, used to route the
/// client-ready request and the final status response.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExchangeId {
    pub session: UniqueId,
    pub worker_index: i32,
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.worker_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_distinct_per_worker_and_direction() {
        let session = UniqueId::new(7, 9);
        let a = ChannelId::client_to_server(session, 0);
        let b = ChannelId::client_to_server(session, 1);
        let c = ChannelId::shared_server_to_client(session);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn channel_id_display_is_stable() {
        let session = UniqueId::new(0, 2);
        let id = ChannelId::client_to_server(session, 3);
        assert_eq!(
            id.to_string(),
            "00000000-0000-0000-0000-000000000002/c2s/3"
        );
    }
}
