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
use crate::batchex_config::config as batchex_app_config;

pub(crate) fn exchange_max_workers() -> usize {
    batchex_app_config()
        .ok()
        .map(|c| c.exchange.max_workers)
        .unwrap_or(4)
}

pub(crate) fn exchange_channel_buffer_pages() -> usize {
    batchex_app_config()
        .ok()
        .map(|c| c.exchange.channel_buffer_pages)
        .unwrap_or(32)
}

pub(crate) fn exchange_client_ready_timeout_ms() -> u64 {
    batchex_app_config()
        .ok()
        .map(|c| c.exchange.client_ready_timeout_ms)
        .unwrap_or(30_000)
}
