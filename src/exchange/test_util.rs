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
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::common::ids::{Endpoint, SequenceId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::protocol::{
    AcknowledgeDataBlockEvent, EndOfDataBlockEvent, GetDataBlocksRequest, NewDataBlockEvent,
};
use crate::exchange::transport::ExchangeTransport;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RecordedEvent {
    Acknowledge { start: SequenceId, end: SequenceId },
    NewDataBlock { start: SequenceId, sizes: Vec<i64> },
    EndOfDataBlock { last: SequenceId },
}

/// Records one-way events; fetches are answered from `blocks`.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub(crate) events: Mutex<Vec<RecordedEvent>>,
    pub(crate) blocks: Mutex<Vec<DataBlock>>,
    pub(crate) fail_events: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: RecordedEvent) -> ExchangeResult<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(ExchangeError::Transport("connection refused".into()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl ExchangeTransport for RecordingTransport {
    fn get_data_blocks(
        &self,
        _endpoint: &Endpoint,
        request: GetDataBlocksRequest,
    ) -> ExchangeResult<Vec<DataBlock>> {
        let blocks = self.blocks.lock().unwrap();
        (request.start_sequence_id..request.end_sequence_id)
            .map(|seq| {
                blocks
                    .get(seq as usize)
                    .cloned()
                    .ok_or_else(|| ExchangeError::BlockNotFound(seq.to_string()))
            })
            .collect()
    }

    fn send_acknowledge_event(
        &self,
        _endpoint: &Endpoint,
        event: AcknowledgeDataBlockEvent,
    ) -> ExchangeResult<()> {
        self.record(RecordedEvent::Acknowledge {
            start: event.start_sequence_id,
            end: event.end_sequence_id,
        })
    }

    fn send_new_data_block_event(
        &self,
        _endpoint: &Endpoint,
        event: NewDataBlockEvent,
    ) -> ExchangeResult<()> {
        self.record(RecordedEvent::NewDataBlock {
            start: event.start_sequence_id,
            sizes: event.block_sizes,
        })
    }

    fn send_end_of_data_block_event(
        &self,
        _endpoint: &Endpoint,
        event: EndOfDataBlockEvent,
    ) -> ExchangeResult<()> {
        self.record(RecordedEvent::EndOfDataBlock {
            last: event.last_sequence_id,
        })
    }
}

pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
