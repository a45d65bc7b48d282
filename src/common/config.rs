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
use crate::mpp_config::config as exchange_app_config;

pub(crate) fn exchange_io_threads() -> usize {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.actual_io_threads())
        .unwrap_or(4)
}

pub(crate) fn exchange_max_memory_bytes() -> i64 {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.max_memory_bytes)
        .unwrap_or(512 * 1024 * 1024)
}

pub(crate) fn exchange_max_memory_bytes_per_query() -> i64 {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.max_memory_bytes_per_query)
        .unwrap_or(128 * 1024 * 1024)
}

pub(crate) fn exchange_receive_wait_ms() -> u64 {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.receive_wait_ms)
        .unwrap_or(120_000)
}

pub(crate) fn exchange_rpc_timeout_ms() -> u64 {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.rpc_timeout_ms)
        .unwrap_or(60_000)
}

pub(crate) fn exchange_rpc_connect_timeout_ms() -> u64 {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.rpc_connect_timeout_ms)
        .unwrap_or(10_000)
}

pub(crate) fn exchange_rpc_retry_times() -> u32 {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.rpc_retry_times)
        .unwrap_or(3)
}

pub(crate) fn exchange_rpc_retry_interval_ms() -> u64 {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.rpc_retry_interval_ms)
        .unwrap_or(100)
}

pub(crate) fn exchange_max_message_bytes() -> usize {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.max_message_bytes)
        .unwrap_or(64 * 1024 * 1024)
}

pub(crate) fn exchange_max_blocks_per_fetch() -> usize {
    exchange_app_config()
        .ok()
        .map(|c| c.exchange.max_blocks_per_fetch)
        .unwrap_or(64)
}
