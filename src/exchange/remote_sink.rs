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
//! Producer endpoint for a consumer on another node.
//!
//! Blocks are kept until the consumer acknowledges them. Each block is
//! announced with a new-data-block event; the consumer pulls the bytes with a
//! fetch call and acknowledges what it consumed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::common::ids::{FragmentInstanceId, SequenceId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::event_queue::{ExchangeEvent, exchange_event_queue};
use crate::exchange::listener::SinkListener;
use crate::exchange::local_sink::SinkState;
use crate::exchange::protocol::{EndOfDataBlockEvent, NewDataBlockEvent};
use crate::exchange::shuffle_sink::DownstreamChannelLocation;
use crate::exchange::transport::ExchangeTransport;
use crate::mpp_logging::{debug, warn};
use crate::runtime::memory_pool::{MemoryPool, MemoryReservation};

struct RemoteSinkInner {
    state: SinkState,
    buffer: BTreeMap<SequenceId, DataBlock>,
    next_sequence_id: SequenceId,
    end_of_blocks_delivered: bool,
}

pub struct RemoteSinkHandle {
    handle_id: u64,
    local_instance_id: FragmentInstanceId,
    full_id: String,
    target: DownstreamChannelLocation,
    channel_index: i32,
    transport: Arc<dyn ExchangeTransport>,
    reservation: MemoryReservation,
    listener: SinkListener,
    inner: Mutex<RemoteSinkInner>,
    self_ref: Weak<RemoteSinkHandle>,
}

impl RemoteSinkHandle {
    pub(crate) fn new(
        handle_id: u64,
        local_instance_id: FragmentInstanceId,
        target: DownstreamChannelLocation,
        channel_index: i32,
        transport: Arc<dyn ExchangeTransport>,
        pool: &Arc<MemoryPool>,
        listener: SinkListener,
    ) -> Arc<Self> {
        let full_id = local_instance_id.full_id_with(&format!("SinkChannel{}", channel_index));
        let reservation =
            MemoryReservation::new(pool, local_instance_id.query_id.clone(), full_id.clone());
        Arc::new_cyclic(|self_ref| Self {
            handle_id,
            local_instance_id,
            full_id,
            target,
            channel_index,
            transport,
            reservation,
            listener,
            inner: Mutex::new(RemoteSinkInner {
                state: SinkState::Active,
                buffer: BTreeMap::new(),
                next_sequence_id: 0,
                end_of_blocks_delivered: false,
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn target(&self) -> &DownstreamChannelLocation {
        &self.target
    }

    pub fn channel_index(&self) -> i32 {
        self.channel_index
    }

    pub fn state(&self) -> SinkState {
        self.inner.lock().expect("remote sink lock").state
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SinkState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SinkState::Aborted
    }

    pub fn accepts_blocks(&self) -> bool {
        self.state() == SinkState::Active
    }

    pub fn next_sequence_id(&self) -> SequenceId {
        self.inner.lock().expect("remote sink lock").next_sequence_id
    }

    pub fn num_buffered_blocks(&self) -> usize {
        self.inner.lock().expect("remote sink lock").buffer.len()
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.reservation.reserved_bytes()
    }

    pub fn reservation(&self) -> &MemoryReservation {
        &self.reservation
    }

    fn submit_event(&self, event: ExchangeEvent, on_success: Option<fn(&RemoteSinkHandle)>) {
        let weak = self.self_ref.clone();
        exchange_event_queue().submit(
            Arc::clone(&self.transport),
            &self.target.remote_endpoint,
            &self.full_id,
            event,
            Some(Box::new(move |result| {
                let Some(handle) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        if let Some(on_success) = on_success {
                            on_success(&handle);
                        }
                    }
                    Err(err) => handle.fail(err),
                }
            })),
        );
    }

    /// Buffer a block under the next sequence id and announce it.
    ///
    /// Blocks the caller until the memory pool grants room for the block.
    pub fn send(&self, block: DataBlock) -> ExchangeResult<()> {
        match self.state() {
            SinkState::Active => {}
            SinkState::Aborted => return Err(ExchangeError::Aborted(self.full_id.clone())),
            SinkState::Finished => return Err(ExchangeError::Closed(self.full_id.clone())),
            SinkState::NoMoreBlocks => {
                debug!("block after no-more-blocks ignored: sink={}", self.full_id);
                return Ok(());
            }
        }
        let size = block.retained_size();
        if let Err(err) = self.reservation.reserve_blocking(size) {
            return match err {
                ExchangeError::Closed(_) => Err(ExchangeError::Aborted(self.full_id.clone())),
                other => Err(other),
            };
        }
        let mut guard = self.inner.lock().expect("remote sink lock");
        if guard.state != SinkState::Active {
            drop(guard);
            self.reservation.release(size);
            return Ok(());
        }
        let sequence_id = guard.next_sequence_id;
        guard.next_sequence_id += 1;
        guard.buffer.insert(sequence_id, block);
        // Enqueue under the lock so announcements keep sequence order.
        self.submit_event(
            ExchangeEvent::NewDataBlock(NewDataBlockEvent {
                target_fragment_instance_id: self.target.remote_fragment_instance_id.clone(),
                target_plan_node_id: self.target.remote_plan_node_id.clone(),
                source_fragment_instance_id: self.local_instance_id.clone(),
                start_sequence_id: sequence_id,
                block_sizes: vec![size],
            }),
            None,
        );
        Ok(())
    }

    /// Copies of the blocks in `[start, end)`. Every id must still be buffered.
    pub fn get_data_blocks(
        &self,
        start: SequenceId,
        end: SequenceId,
    ) -> ExchangeResult<Vec<DataBlock>> {
        if start > end {
            return Err(ExchangeError::InvalidState(format!(
                "{} inverted range [{}, {})",
                self.full_id, start, end
            )));
        }
        let guard = self.inner.lock().expect("remote sink lock");
        if guard.state == SinkState::Aborted {
            return Err(ExchangeError::Aborted(self.full_id.clone()));
        }
        (start..end)
            .map(|sequence_id| {
                guard.buffer.get(&sequence_id).cloned().ok_or_else(|| {
                    ExchangeError::BlockNotFound(format!(
                        "{} sequence {}",
                        self.full_id, sequence_id
                    ))
                })
            })
            .collect()
    }

    /// Discard blocks in `[start, end)`. Ranges already discarded are ignored.
    pub fn acknowledge(&self, start: SequenceId, end: SequenceId) {
        if start >= end {
            debug!(
                "empty acknowledge ignored: sink={} range=[{}, {})",
                self.full_id, start, end
            );
            return;
        }
        let freed = {
            let mut guard = self.inner.lock().expect("remote sink lock");
            let acked: Vec<SequenceId> =
                guard.buffer.range(start..end).map(|(k, _)| *k).collect();
            let mut freed = 0;
            for sequence_id in acked {
                if let Some(block) = guard.buffer.remove(&sequence_id) {
                    freed += block.retained_size();
                }
            }
            freed
        };
        self.reservation.release(freed);
        self.check_and_invoke_on_finished();
    }

    pub fn set_no_more_blocks(&self) {
        let mut guard = self.inner.lock().expect("remote sink lock");
        if guard.state != SinkState::Active {
            return;
        }
        guard.state = SinkState::NoMoreBlocks;
        let last_sequence_id = guard.next_sequence_id - 1;
        debug!(
            "remote sink no more blocks: sink={} last_sequence_id={}",
            self.full_id, last_sequence_id
        );
        self.submit_event(
            ExchangeEvent::EndOfDataBlock(EndOfDataBlockEvent {
                target_fragment_instance_id: self.target.remote_fragment_instance_id.clone(),
                target_plan_node_id: self.target.remote_plan_node_id.clone(),
                source_fragment_instance_id: self.local_instance_id.clone(),
                last_sequence_id,
            }),
            Some(RemoteSinkHandle::on_end_of_blocks_delivered),
        );
    }

    fn on_end_of_blocks_delivered(&self) {
        {
            let mut guard = self.inner.lock().expect("remote sink lock");
            if guard.state != SinkState::NoMoreBlocks {
                return;
            }
            guard.end_of_blocks_delivered = true;
        }
        self.listener.on_end_of_blocks();
        self.check_and_invoke_on_finished();
    }

    fn check_and_invoke_on_finished(&self) {
        {
            let mut guard = self.inner.lock().expect("remote sink lock");
            if guard.state != SinkState::NoMoreBlocks
                || !guard.end_of_blocks_delivered
                || !guard.buffer.is_empty()
            {
                return;
            }
            guard.state = SinkState::Finished;
        }
        self.reservation.release_all();
        debug!("remote sink handle finished: sink={}", self.full_id);
        self.listener.on_finish();
    }

    // Transport failure: tear down and escalate to the owner.
    fn fail(&self, err: ExchangeError) {
        if !self.enter_terminal(SinkState::Aborted) {
            return;
        }
        warn!("remote sink handle failed: sink={} error={}", self.full_id, err);
        self.listener.on_failure(&err);
    }

    fn enter_terminal(&self, state: SinkState) -> bool {
        {
            let mut guard = self.inner.lock().expect("remote sink lock");
            if guard.state.is_terminal() {
                return false;
            }
            guard.state = state;
            guard.buffer.clear();
        }
        self.reservation.release_all();
        true
    }

    pub fn abort(&self) {
        if !self.enter_terminal(SinkState::Aborted) {
            return;
        }
        let cause = self.listener.on_aborted();
        debug!(
            "remote sink handle aborted: sink={} cause={}",
            self.full_id,
            cause.as_deref().unwrap_or("none")
        );
    }

    pub fn close(&self) {
        if !self.enter_terminal(SinkState::Finished) {
            return;
        }
        debug!("remote sink handle closed: sink={}", self.full_id);
        self.listener.on_finish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use super::RemoteSinkHandle;
    use crate::common::ids::{Endpoint, FragmentInstanceId};
    use crate::exchange::data_block::DataBlock;
    use crate::exchange::error::ExchangeError;
    use crate::exchange::listener::SinkListener;
    use crate::exchange::local_sink::SinkState;
    use crate::exchange::shuffle_sink::DownstreamChannelLocation;
    use crate::exchange::test_util::{RecordedEvent, RecordingTransport, wait_until};
    use crate::runtime::fragment_context::{FragmentInstanceContext, InstanceContext, InstanceState};
    use crate::runtime::memory_pool::MemoryPool;

    fn remote_sink(
        pool: &Arc<MemoryPool>,
        transport: &Arc<RecordingTransport>,
    ) -> (Arc<RemoteSinkHandle>, Arc<FragmentInstanceContext>) {
        let producer = FragmentInstanceId::new("q", 1, "0");
        let ctx = FragmentInstanceContext::new(producer.clone());
        let context: Arc<dyn InstanceContext> = ctx.clone();
        let sink = RemoteSinkHandle::new(
            11,
            producer.clone(),
            DownstreamChannelLocation::new(
                Endpoint::new("10.0.0.2", 10740),
                FragmentInstanceId::new("q", 2, "0"),
                "exchange_3",
            ),
            0,
            transport.clone(),
            pool,
            SinkListener::Fragment {
                registry: Weak::new(),
                instance_id: producer,
                handle_id: 11,
                context,
            },
        );
        (sink, ctx)
    }

    #[test]
    fn acknowledged_blocks_are_discarded_and_sink_finishes() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = Arc::new(RecordingTransport::default());
        let (sink, ctx) = remote_sink(&pool, &transport);

        sink.send(DataBlock::from(vec![0u8; 10])).unwrap();
        sink.send(DataBlock::from(vec![1u8; 20])).unwrap();
        sink.send(DataBlock::from(vec![2u8; 30])).unwrap();
        assert_eq!(sink.next_sequence_id(), 3);
        assert!(wait_until(Duration::from_secs(5), || transport.events().len() == 3));
        assert_eq!(
            transport.events(),
            vec![
                RecordedEvent::NewDataBlock { start: 0, sizes: vec![10] },
                RecordedEvent::NewDataBlock { start: 1, sizes: vec![20] },
                RecordedEvent::NewDataBlock { start: 2, sizes: vec![30] },
            ]
        );

        sink.acknowledge(0, 2);
        assert_eq!(sink.num_buffered_blocks(), 1);
        assert_eq!(sink.buffered_bytes(), 30);
        assert_eq!(pool.reserved_bytes(), 30);
        sink.acknowledge(0, 2);
        assert_eq!(pool.reserved_bytes(), 30);
        assert!(matches!(
            sink.get_data_blocks(1, 3),
            Err(ExchangeError::BlockNotFound(_))
        ));
        assert_eq!(sink.get_data_blocks(2, 3).unwrap()[0].size(), 30);

        sink.set_no_more_blocks();
        assert!(wait_until(Duration::from_secs(5), || {
            ctx.state() == InstanceState::Flushing
        }));
        assert_eq!(
            transport.events().last(),
            Some(&RecordedEvent::EndOfDataBlock { last: 2 })
        );
        assert_eq!(sink.state(), SinkState::NoMoreBlocks);
        sink.acknowledge(2, 3);
        assert!(sink.is_finished());
        assert_eq!(ctx.state(), InstanceState::Finished);
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn end_of_blocks_without_data_carries_minus_one() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = Arc::new(RecordingTransport::default());
        let (sink, ctx) = remote_sink(&pool, &transport);
        sink.set_no_more_blocks();
        assert!(wait_until(Duration::from_secs(5), || sink.is_finished()));
        assert_eq!(
            transport.events(),
            vec![RecordedEvent::EndOfDataBlock { last: -1 }]
        );
        assert_eq!(ctx.state(), InstanceState::Finished);
    }

    #[test]
    fn notification_failure_fails_owner() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_events.store(true, Ordering::SeqCst);
        let (sink, ctx) = remote_sink(&pool, &transport);
        sink.send(DataBlock::from(vec![0u8; 40])).unwrap();
        assert!(wait_until(Duration::from_secs(5), || sink.is_aborted()));
        assert_eq!(ctx.state(), InstanceState::Failed);
        assert!(ctx.failure_cause().unwrap().contains("connection refused"));
        assert_eq!(pool.reserved_bytes(), 0);
        assert!(matches!(
            sink.send(DataBlock::from("x")),
            Err(ExchangeError::Aborted(_))
        ));
    }

    #[test]
    fn inverted_acknowledge_range_is_ignored() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = Arc::new(RecordingTransport::default());
        let (sink, _ctx) = remote_sink(&pool, &transport);
        sink.send(DataBlock::from("a")).unwrap();
        sink.send(DataBlock::from("b")).unwrap();
        sink.send(DataBlock::from("c")).unwrap();

        sink.acknowledge(3, 1);
        sink.acknowledge(2, 2);
        assert_eq!(sink.state(), SinkState::Active);
        assert_eq!(sink.num_buffered_blocks(), 3);
        assert_eq!(pool.reserved_bytes(), 3);
        assert!(matches!(
            sink.get_data_blocks(2, 0),
            Err(ExchangeError::InvalidState(_))
        ));
        assert!(sink.get_data_blocks(1, 1).unwrap().is_empty());

        sink.acknowledge(0, 3);
        assert_eq!(sink.num_buffered_blocks(), 0);
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn abort_releases_buffered_blocks() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = Arc::new(RecordingTransport::default());
        let (sink, _ctx) = remote_sink(&pool, &transport);
        sink.send(DataBlock::from(vec![0u8; 100])).unwrap();
        sink.send(DataBlock::from(vec![0u8; 100])).unwrap();
        assert_eq!(pool.reserved_bytes(), 200);
        sink.abort();
        assert!(sink.is_aborted());
        assert_eq!(sink.num_buffered_blocks(), 0);
        assert_eq!(pool.reserved_bytes(), 0);
        assert_eq!(sink.reservation().tracker().current(), 0);
        sink.acknowledge(0, 2);
        assert!(matches!(
            sink.get_data_blocks(0, 1),
            Err(ExchangeError::Aborted(_))
        ));
    }
}
