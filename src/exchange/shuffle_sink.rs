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
//! Fan-out sink over several downstream channels.
//!
//! Responsibilities:
//! - Maps each block to one or more channels according to a `ShuffleStrategy`.
//! - Backs every channel with a local sink (co-located consumer) or a remote
//!   sink (consumer on another node).
//! - Finishes once every channel has finished; a channel failure fails the
//!   whole shuffle sink.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::ids::{Endpoint, FragmentInstanceId, PlanNodeId, SequenceId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::listener::SinkListener;
use crate::exchange::local_sink::{LocalSinkHandle, SinkState};
use crate::exchange::remote_sink::RemoteSinkHandle;
use crate::exchange::shared_queue::SharedBlockQueue;
use crate::exchange::transport::ExchangeTransport;
use crate::mpp_logging::{debug, warn};
use crate::runtime::memory_pool::MemoryPool;

/// Where one downstream consumer lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownstreamChannelLocation {
    pub remote_endpoint: Endpoint,
    pub remote_fragment_instance_id: FragmentInstanceId,
    pub remote_plan_node_id: PlanNodeId,
}

impl DownstreamChannelLocation {
    pub fn new(
        remote_endpoint: Endpoint,
        remote_fragment_instance_id: FragmentInstanceId,
        remote_plan_node_id: impl Into<PlanNodeId>,
    ) -> Self {
        Self {
            remote_endpoint,
            remote_fragment_instance_id,
            remote_plan_node_id: remote_plan_node_id.into(),
        }
    }
}

/// Channel cursor shared with the producing operator.
#[derive(Clone, Debug, Default)]
pub struct DownstreamChannelIndex(Arc<AtomicUsize>);

impl DownstreamChannelIndex {
    pub fn new(index: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(index)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, index: usize) {
        self.0.store(index, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShuffleStrategy {
    /// Send to the channel currently selected by the shared index.
    Plain,
    /// Rotate through open channels, one block each.
    RoundRobin,
    /// Send every block to every open channel.
    Broadcast,
}

impl ShuffleStrategy {
    /// Channels that receive the next block. `open[i]` tells whether channel
    /// `i` still accepts blocks; `cursor` is advanced for round robin.
    fn targets(
        self,
        open: &[bool],
        index: &DownstreamChannelIndex,
        cursor: &mut usize,
    ) -> ExchangeResult<Vec<usize>> {
        let n = open.len();
        match self {
            ShuffleStrategy::Plain => {
                let current = index.get();
                if current >= n {
                    return Err(ExchangeError::InvalidState(format!(
                        "channel index {} out of range, channels={}",
                        current, n
                    )));
                }
                Ok(if open[current] { vec![current] } else { Vec::new() })
            }
            ShuffleStrategy::RoundRobin => {
                for step in 0..n {
                    let candidate = (*cursor + step) % n;
                    if open[candidate] {
                        *cursor = (candidate + 1) % n;
                        index.set(*cursor);
                        return Ok(vec![candidate]);
                    }
                }
                Ok(Vec::new())
            }
            ShuffleStrategy::Broadcast => Ok((0..n).filter(|i| open[*i]).collect()),
        }
    }
}

/// How a channel reaches its consumer.
pub(crate) enum ChannelRoute {
    Local(Arc<SharedBlockQueue>),
    Remote,
}

#[derive(Clone)]
pub enum ChannelSink {
    Local(Arc<LocalSinkHandle>),
    Remote(Arc<RemoteSinkHandle>),
}

impl ChannelSink {
    pub fn send(&self, block: DataBlock) -> ExchangeResult<()> {
        match self {
            ChannelSink::Local(sink) => sink.send(block),
            ChannelSink::Remote(sink) => sink.send(block),
        }
    }

    pub fn set_no_more_blocks(&self) {
        match self {
            ChannelSink::Local(sink) => sink.set_no_more_blocks(),
            ChannelSink::Remote(sink) => sink.set_no_more_blocks(),
        }
    }

    pub fn accepts_blocks(&self) -> bool {
        match self {
            ChannelSink::Local(sink) => sink.accepts_blocks(),
            ChannelSink::Remote(sink) => sink.accepts_blocks(),
        }
    }

    pub fn state(&self) -> SinkState {
        match self {
            ChannelSink::Local(sink) => sink.state(),
            ChannelSink::Remote(sink) => sink.state(),
        }
    }

    pub fn buffered_bytes(&self) -> i64 {
        match self {
            ChannelSink::Local(sink) => sink.buffered_bytes(),
            ChannelSink::Remote(sink) => sink.buffered_bytes(),
        }
    }

    fn abort(&self) {
        match self {
            ChannelSink::Local(sink) => sink.abort(),
            ChannelSink::Remote(sink) => sink.abort(),
        }
    }

    fn close(&self) {
        match self {
            ChannelSink::Local(sink) => sink.close(),
            ChannelSink::Remote(sink) => sink.close(),
        }
    }
}

struct ShuffleInner {
    state: SinkState,
    channel_finished: Vec<bool>,
    channel_end_of_blocks: Vec<bool>,
    end_of_blocks_reported: bool,
    cursor: usize,
    failure: Option<String>,
}

pub struct ShuffleSinkHandle {
    handle_id: u64,
    local_instance_id: FragmentInstanceId,
    full_id: String,
    strategy: ShuffleStrategy,
    channel_index: DownstreamChannelIndex,
    locations: Vec<DownstreamChannelLocation>,
    channels: Vec<ChannelSink>,
    listener: SinkListener,
    inner: Mutex<ShuffleInner>,
}

impl ShuffleSinkHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle_id: u64,
        local_instance_id: FragmentInstanceId,
        locations: Vec<DownstreamChannelLocation>,
        routes: Vec<ChannelRoute>,
        channel_index: DownstreamChannelIndex,
        strategy: ShuffleStrategy,
        transport: Arc<dyn ExchangeTransport>,
        pool: &Arc<MemoryPool>,
        listener: SinkListener,
    ) -> Arc<Self> {
        let full_id = local_instance_id.full_id_with("ShuffleSinkHandle");
        let num_channels = locations.len();
        let handle = Arc::new_cyclic(|parent| {
            let channels = locations
                .iter()
                .zip(routes)
                .enumerate()
                .map(|(index, (location, route))| {
                    let channel_listener = SinkListener::Channel {
                        parent: parent.clone(),
                        channel_index: index,
                    };
                    match route {
                        ChannelRoute::Local(queue) => ChannelSink::Local(LocalSinkHandle::new(
                            handle_id,
                            local_instance_id.clone(),
                            queue,
                            channel_listener,
                        )),
                        ChannelRoute::Remote => ChannelSink::Remote(RemoteSinkHandle::new(
                            handle_id,
                            local_instance_id.clone(),
                            location.clone(),
                            index as i32,
                            Arc::clone(&transport),
                            pool,
                            channel_listener,
                        )),
                    }
                })
                .collect();
            Self {
                handle_id,
                local_instance_id: local_instance_id.clone(),
                full_id,
                strategy,
                channel_index: channel_index.clone(),
                locations: locations.clone(),
                channels,
                listener,
                inner: Mutex::new(ShuffleInner {
                    state: SinkState::Active,
                    channel_finished: vec![false; num_channels],
                    channel_end_of_blocks: vec![false; num_channels],
                    end_of_blocks_reported: false,
                    cursor: channel_index.get(),
                    failure: None,
                }),
            }
        });
        debug!(
            "shuffle sink handle created: sink={} channels={} strategy={:?}",
            handle.full_id, num_channels, strategy
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

    pub fn strategy(&self) -> ShuffleStrategy {
        self.strategy
    }

    pub fn channel_index(&self) -> &DownstreamChannelIndex {
        &self.channel_index
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelSink> {
        self.channels.get(index)
    }

    pub fn location(&self, index: usize) -> Option<&DownstreamChannelLocation> {
        self.locations.get(index)
    }

    pub fn state(&self) -> SinkState {
        self.inner.lock().expect("shuffle sink lock").state
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SinkState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SinkState::Aborted
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.channels.iter().map(ChannelSink::buffered_bytes).sum()
    }

    /// Queue of the local channel feeding `(instance_id, plan_node_id)`, if any.
    pub(crate) fn local_queue_for(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> Option<Arc<SharedBlockQueue>> {
        self.channels.iter().find_map(|channel| match channel {
            ChannelSink::Local(sink) if sink.queue().is_consumed_by(instance_id, plan_node_id) => {
                Some(Arc::clone(sink.queue()))
            }
            _ => None,
        })
    }

    fn remote_channel(&self, channel_index: i32) -> ExchangeResult<&Arc<RemoteSinkHandle>> {
        let channel = usize::try_from(channel_index)
            .ok()
            .and_then(|index| self.channels.get(index));
        match channel {
            Some(ChannelSink::Remote(sink)) => Ok(sink),
            Some(ChannelSink::Local(_)) => Err(ExchangeError::InvalidState(format!(
                "{} channel {} is local",
                self.full_id, channel_index
            ))),
            None => Err(ExchangeError::InvalidState(format!(
                "{} has no channel {}",
                self.full_id, channel_index
            ))),
        }
    }

    pub fn send(&self, block: DataBlock) -> ExchangeResult<()> {
        let targets = {
            let mut guard = self.inner.lock().expect("shuffle sink lock");
            match guard.state {
                SinkState::Active => {}
                SinkState::Aborted => return Err(ExchangeError::Aborted(self.full_id.clone())),
                SinkState::Finished => return Err(ExchangeError::Closed(self.full_id.clone())),
                SinkState::NoMoreBlocks => return Ok(()),
            }
            let open: Vec<bool> = self
                .channels
                .iter()
                .map(ChannelSink::accepts_blocks)
                .collect();
            self.strategy
                .targets(&open, &self.channel_index, &mut guard.cursor)?
        };
        if targets.is_empty() {
            debug!("no open channel for block: sink={}", self.full_id);
        }
        for index in targets {
            self.channels[index].send(block.clone())?;
        }
        Ok(())
    }

    pub fn get_data_blocks(
        &self,
        channel_index: i32,
        start: SequenceId,
        end: SequenceId,
    ) -> ExchangeResult<Vec<DataBlock>> {
        self.remote_channel(channel_index)?.get_data_blocks(start, end)
    }

    pub fn acknowledge(&self, channel_index: i32, start: SequenceId, end: SequenceId) {
        match self.remote_channel(channel_index) {
            Ok(sink) => sink.acknowledge(start, end),
            Err(err) => debug!("acknowledge ignored: sink={} error={}", self.full_id, err),
        }
    }

    pub fn set_no_more_blocks(&self) {
        {
            let mut guard = self.inner.lock().expect("shuffle sink lock");
            if guard.state != SinkState::Active {
                return;
            }
            guard.state = SinkState::NoMoreBlocks;
        }
        for channel in &self.channels {
            channel.set_no_more_blocks();
        }
    }

    /// Close one channel early; the others keep receiving blocks.
    pub fn set_no_more_blocks_of_channel(&self, channel_index: usize) -> ExchangeResult<()> {
        let channel = self.channels.get(channel_index).ok_or_else(|| {
            ExchangeError::InvalidState(format!(
                "{} has no channel {}",
                self.full_id, channel_index
            ))
        })?;
        channel.set_no_more_blocks();
        Ok(())
    }

    pub(crate) fn on_channel_end_of_blocks(&self, channel_index: usize) {
        {
            let mut guard = self.inner.lock().expect("shuffle sink lock");
            if guard.state.is_terminal() || guard.end_of_blocks_reported {
                return;
            }
            if let Some(flag) = guard.channel_end_of_blocks.get_mut(channel_index) {
                *flag = true;
            }
            if !guard.channel_end_of_blocks.iter().all(|flag| *flag) {
                return;
            }
            guard.end_of_blocks_reported = true;
        }
        self.listener.on_end_of_blocks();
    }

    pub(crate) fn on_channel_finished(&self, channel_index: usize) {
        {
            let mut guard = self.inner.lock().expect("shuffle sink lock");
            if guard.state.is_terminal() {
                return;
            }
            if let Some(flag) = guard.channel_finished.get_mut(channel_index) {
                *flag = true;
            }
            if !guard.channel_finished.iter().all(|flag| *flag) {
                return;
            }
            guard.state = SinkState::Finished;
        }
        debug!("shuffle sink handle finished: sink={}", self.full_id);
        self.listener.on_finish();
    }

    /// Fails the whole sink. The cause is recorded before the sibling channels
    /// are aborted so co-located consumers see it on their queues.
    pub(crate) fn on_channel_failure(&self, channel_index: usize, err: &ExchangeError) {
        {
            let mut guard = self.inner.lock().expect("shuffle sink lock");
            if guard.state.is_terminal() {
                return;
            }
            guard.state = SinkState::Aborted;
            guard.failure = Some(err.to_string());
        }
        warn!(
            "shuffle sink channel failed: sink={} channel={} error={}",
            self.full_id, channel_index, err
        );
        self.listener.on_failure(err);
        for channel in &self.channels {
            channel.abort();
        }
    }

    pub(crate) fn failure_cause(&self) -> Option<String> {
        let failure = self.inner.lock().expect("shuffle sink lock").failure.clone();
        failure.or_else(|| self.listener.failure_cause())
    }

    fn enter_terminal(&self, state: SinkState) -> bool {
        let mut guard = self.inner.lock().expect("shuffle sink lock");
        if guard.state.is_terminal() {
            return false;
        }
        guard.state = state;
        true
    }

    pub fn abort(&self) {
        if !self.enter_terminal(SinkState::Aborted) {
            return;
        }
        for channel in &self.channels {
            channel.abort();
        }
        let cause = self.listener.on_aborted();
        debug!(
            "shuffle sink handle aborted: sink={} cause={}",
            self.full_id,
            cause.as_deref().unwrap_or("none")
        );
    }

    pub fn close(&self) {
        if !self.enter_terminal(SinkState::Finished) {
            return;
        }
        for channel in &self.channels {
            channel.close();
        }
        debug!("shuffle sink handle closed: sink={}", self.full_id);
        self.listener.on_finish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::{
        ChannelRoute, DownstreamChannelIndex, DownstreamChannelLocation, ShuffleSinkHandle,
        ShuffleStrategy,
    };
    use crate::common::ids::{Endpoint, FragmentInstanceId, PlanNodeId};
    use crate::exchange::data_block::DataBlock;
    use crate::exchange::listener::SinkListener;
    use crate::exchange::local_sink::SinkState;
    use crate::exchange::shared_queue::{QueueStatus, SharedBlockQueue};
    use crate::exchange::test_util::{RecordingTransport, wait_until};
    use crate::runtime::fragment_context::{FragmentInstanceContext, InstanceContext, InstanceState};
    use crate::runtime::memory_pool::MemoryPool;

    #[test]
    fn remote_channel_failure_reaches_local_consumer() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_events.store(true, Ordering::SeqCst);
        let producer = FragmentInstanceId::new("q", 1, "0");
        let local_consumer = FragmentInstanceId::new("q", 2, "0");
        let ctx = FragmentInstanceContext::new(producer.clone());
        let context: Arc<dyn InstanceContext> = ctx.clone();
        let queue = SharedBlockQueue::new(
            local_consumer.clone(),
            PlanNodeId::new("exchange_4"),
            &pool,
        );
        let sink = ShuffleSinkHandle::new(
            21,
            producer,
            vec![
                DownstreamChannelLocation::new(
                    Endpoint::new("127.0.0.1", 10740),
                    local_consumer,
                    "exchange_4",
                ),
                DownstreamChannelLocation::new(
                    Endpoint::new("10.0.0.2", 10740),
                    FragmentInstanceId::new("q", 2, "1"),
                    "exchange_4",
                ),
            ],
            vec![ChannelRoute::Local(Arc::clone(&queue)), ChannelRoute::Remote],
            DownstreamChannelIndex::new(0),
            ShuffleStrategy::Broadcast,
            transport,
            &pool,
            SinkListener::Pipeline { context },
        );

        sink.send(DataBlock::from(vec![0u8; 16])).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            matches!(queue.status(), QueueStatus::Aborted(_))
        }));
        match queue.status() {
            QueueStatus::Aborted(Some(cause)) => assert!(cause.contains("connection refused")),
            other => panic!("unexpected queue status {:?}", other),
        }
        assert_eq!(sink.state(), SinkState::Aborted);
        assert_eq!(ctx.state(), InstanceState::Failed);
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn round_robin_skips_closed_channels() {
        let index = DownstreamChannelIndex::new(0);
        let mut cursor = 0;
        let open = [true, false, true];
        let picks: Vec<usize> = (0..4)
            .map(|_| {
                ShuffleStrategy::RoundRobin
                    .targets(&open, &index, &mut cursor)
                    .unwrap()[0]
            })
            .collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
        assert_eq!(index.get(), 0);
    }

    #[test]
    fn plain_follows_shared_index() {
        let index = DownstreamChannelIndex::new(1);
        let mut cursor = 0;
        let open = [true, true];
        assert_eq!(
            ShuffleStrategy::Plain.targets(&open, &index, &mut cursor).unwrap(),
            vec![1]
        );
        index.set(5);
        assert!(ShuffleStrategy::Plain.targets(&open, &index, &mut cursor).is_err());
    }

    #[test]
    fn broadcast_targets_every_open_channel() {
        let index = DownstreamChannelIndex::new(0);
        let mut cursor = 0;
        assert_eq!(
            ShuffleStrategy::Broadcast
                .targets(&[true, false, true, true], &index, &mut cursor)
                .unwrap(),
            vec![0, 2, 3]
        );
        assert!(ShuffleStrategy::Broadcast
            .targets(&[false, false], &index, &mut cursor)
            .unwrap()
            .is_empty());
    }
}
