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
//! Producer endpoint for a consumer in the same process.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::ids::{FragmentInstanceId, SequenceId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::listener::SinkListener;
use crate::exchange::shared_queue::SharedBlockQueue;
use crate::mpp_logging::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    Active,
    /// Producer is done; buffered blocks are still draining.
    NoMoreBlocks,
    Finished,
    Aborted,
}

impl SinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SinkState::Finished | SinkState::Aborted)
    }
}

pub struct LocalSinkHandle {
    handle_id: u64,
    local_instance_id: FragmentInstanceId,
    full_id: String,
    queue: Arc<SharedBlockQueue>,
    listener: SinkListener,
    state: Mutex<SinkState>,
    next_sequence_id: AtomicI64,
}

impl LocalSinkHandle {
    pub(crate) fn new(
        handle_id: u64,
        local_instance_id: FragmentInstanceId,
        queue: Arc<SharedBlockQueue>,
        listener: SinkListener,
    ) -> Arc<Self> {
        let full_id = local_instance_id.full_id_with("SinkHandle");
        let handle = Arc::new(Self {
            handle_id,
            local_instance_id,
            full_id,
            queue,
            listener,
            state: Mutex::new(SinkState::Active),
            next_sequence_id: AtomicI64::new(0),
        });
        handle.queue.set_sink_handle(&handle);
        debug!(
            "local sink handle created: sink={} queue={}",
            handle.full_id,
            handle.queue.full_id()
        );
        handle
    }

    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn local_instance_id(&self) -> &FragmentInstanceId {
        &self.local_instance_id
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn queue(&self) -> &Arc<SharedBlockQueue> {
        &self.queue
    }

    pub fn state(&self) -> SinkState {
        *self.state.lock().expect("local sink lock")
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SinkState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SinkState::Aborted
    }

    /// True while `send` still delivers blocks.
    pub fn accepts_blocks(&self) -> bool {
        self.state() == SinkState::Active && !self.queue.is_closed()
    }

    /// Number of blocks handed to the queue so far.
    pub fn next_sequence_id(&self) -> SequenceId {
        self.next_sequence_id.load(Ordering::Acquire)
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.queue.reserved_bytes()
    }

    /// Push a block to the consumer, blocking while memory is exhausted.
    pub fn send(&self, block: DataBlock) -> ExchangeResult<()> {
        match self.state() {
            SinkState::Active => {}
            SinkState::Aborted => {
                return Err(ExchangeError::Aborted(self.full_id.clone()));
            }
            SinkState::Finished => {
                return Err(ExchangeError::Closed(self.full_id.clone()));
            }
            SinkState::NoMoreBlocks => {
                debug!("block after no-more-blocks ignored: sink={}", self.full_id);
                return Ok(());
            }
        }
        self.queue.add(block)?;
        self.next_sequence_id.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn set_no_more_blocks(&self) {
        {
            let mut guard = self.state.lock().expect("local sink lock");
            if *guard != SinkState::Active {
                return;
            }
            *guard = SinkState::NoMoreBlocks;
        }
        self.queue.set_no_more_blocks();
        self.listener.on_end_of_blocks();
        self.check_and_invoke_on_finished();
    }

    /// Finish once the consumer has drained the queue, or went away.
    pub(crate) fn check_and_invoke_on_finished(&self) {
        {
            let mut guard = self.state.lock().expect("local sink lock");
            if *guard != SinkState::NoMoreBlocks {
                return;
            }
            if !self.queue.is_empty() && !self.queue.is_closed() {
                return;
            }
            *guard = SinkState::Finished;
        }
        debug!("local sink handle finished: sink={}", self.full_id);
        self.listener.on_finish();
    }

    pub fn abort(&self) {
        {
            let mut guard = self.state.lock().expect("local sink lock");
            if guard.is_terminal() {
                return;
            }
            *guard = SinkState::Aborted;
        }
        let cause = self.listener.on_aborted();
        info!(
            "local sink handle aborted: sink={} cause={}",
            self.full_id,
            cause.as_deref().unwrap_or("none")
        );
        self.queue.abort(cause);
    }

    pub fn close(&self) {
        {
            let mut guard = self.state.lock().expect("local sink lock");
            if guard.is_terminal() {
                return;
            }
            *guard = SinkState::Finished;
        }
        self.queue.set_no_more_blocks();
        self.queue.close();
        debug!("local sink handle closed: sink={}", self.full_id);
        self.listener.on_finish();
    }
}
