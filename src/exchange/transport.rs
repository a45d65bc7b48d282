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
//! Transport seam between peer exchange managers.
//!
//! Responsibilities:
//! - Defines the four calls a sink or source issues against a peer.
//! - Provides an in-process implementation that routes calls straight to the
//!   manager registered for an endpoint.
//!
//! Key exported interfaces:
//! - Traits: `ExchangeTransport`.
//! - Types: `LoopbackTransport`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::common::ids::Endpoint;
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::manager::ExchangeManager;
use crate::exchange::protocol::{
    AcknowledgeDataBlockEvent, EndOfDataBlockEvent, GetDataBlocksRequest, NewDataBlockEvent,
};

/// Client side of the data exchange protocol.
///
/// Implementations own connection pooling and any retry policy. Calls block the
/// calling worker thread; handles only invoke them from the io executor.
pub trait ExchangeTransport: Send + Sync {
    fn get_data_blocks(
        &self,
        endpoint: &Endpoint,
        request: GetDataBlocksRequest,
    ) -> ExchangeResult<Vec<DataBlock>>;

    fn send_acknowledge_event(
        &self,
        endpoint: &Endpoint,
        event: AcknowledgeDataBlockEvent,
    ) -> ExchangeResult<()>;

    fn send_new_data_block_event(
        &self,
        endpoint: &Endpoint,
        event: NewDataBlockEvent,
    ) -> ExchangeResult<()>;

    fn send_end_of_data_block_event(
        &self,
        endpoint: &Endpoint,
        event: EndOfDataBlockEvent,
    ) -> ExchangeResult<()>;
}

/// Delivers protocol calls to managers living in the same process.
#[derive(Default)]
pub struct LoopbackTransport {
    managers: Mutex<HashMap<Endpoint, Weak<ExchangeManager>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, manager: &Arc<ExchangeManager>) {
        let mut guard = self.managers.lock().expect("loopback transport lock");
        guard.insert(manager.local_endpoint().clone(), Arc::downgrade(manager));
    }

    pub fn unregister(&self, endpoint: &Endpoint) {
        let mut guard = self.managers.lock().expect("loopback transport lock");
        guard.remove(endpoint);
    }

    fn manager(&self, endpoint: &Endpoint) -> ExchangeResult<Arc<ExchangeManager>> {
        let guard = self.managers.lock().expect("loopback transport lock");
        guard
            .get(endpoint)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ExchangeError::Transport(format!("no exchange service at {}", endpoint)))
    }
}

impl ExchangeTransport for LoopbackTransport {
    fn get_data_blocks(
        &self,
        endpoint: &Endpoint,
        request: GetDataBlocksRequest,
    ) -> ExchangeResult<Vec<DataBlock>> {
        self.manager(endpoint)?.get_data_blocks(&request)
    }

    fn send_acknowledge_event(
        &self,
        endpoint: &Endpoint,
        event: AcknowledgeDataBlockEvent,
    ) -> ExchangeResult<()> {
        self.manager(endpoint)?.on_acknowledge_data_block_event(&event);
        Ok(())
    }

    fn send_new_data_block_event(
        &self,
        endpoint: &Endpoint,
        event: NewDataBlockEvent,
    ) -> ExchangeResult<()> {
        self.manager(endpoint)?.on_new_data_block_event(&event);
        Ok(())
    }

    fn send_end_of_data_block_event(
        &self,
        endpoint: &Endpoint,
        event: EndOfDataBlockEvent,
    ) -> ExchangeResult<()> {
        self.manager(endpoint)?.on_end_of_data_block_event(&event);
        Ok(())
    }
}
