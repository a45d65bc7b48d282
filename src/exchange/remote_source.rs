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
//! Consumer endpoint pulling blocks from a sink on another node.
//!
//! Responsibilities:
//! - Records announced block sizes and fetches them in contiguous ranges on
//!   the io executor, only while memory quota is available.
//! - Hands blocks to the consumer in sequence order and acknowledges each
//!   consumed block back to the sink.
//! - Finishes once the consumed watermark passes the announced last sequence id.
//!
//! Flow control: a fetch is issued only after the memory pool grants the
//! announced bytes. When it does not, the source registers an observer with the
//! pool and re-schedules itself on the next release instead of blocking.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::common::config::{exchange_max_blocks_per_fetch, exchange_receive_wait_ms};
use crate::common::ids::{Endpoint, FragmentInstanceId, PlanNodeId, SequenceId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::event_queue::{ExchangeEvent, exchange_event_queue};
use crate::exchange::listener::SourceListener;
use crate::exchange::local_source::{
    ExchangePopResult, ExchangeRecvStats, SourceState, should_log_receive_wait,
};
use crate::exchange::protocol::{AcknowledgeDataBlockEvent, GetDataBlocksRequest};
use crate::exchange::transport::ExchangeTransport;
use crate::mpp_logging::{debug, warn};
use crate::runtime::io::{IoTaskHandle, io_executor};
use crate::runtime::memory_pool::{MemoryPool, MemoryReservation};
use crate::runtime::observer::Observable;

const RECEIVE_WAIT_SLICE: Duration = Duration::from_millis(100);

static FETCH_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time view of a remote source, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSourceSnapshot {
    pub state: SourceState,
    pub next_sequence_id_to_consume: SequenceId,
    pub last_sequence_id: Option<SequenceId>,
    pub pending_blocks: usize,
    pub inflight_blocks: usize,
    pub buffered_blocks: usize,
    pub blocked_on_memory: bool,
    pub reserved_bytes: i64,
}

struct RemoteSourceInner {
    state: SourceState,
    // Announced but not yet requested.
    pending_block_sizes: BTreeMap<SequenceId, i64>,
    // Requested, response not yet received.
    inflight_block_sizes: BTreeMap<SequenceId, i64>,
    received: BTreeMap<SequenceId, (DataBlock, i64)>,
    next_sequence_id_to_consume: SequenceId,
    last_sequence_id: Option<SequenceId>,
    fetch_tasks: HashMap<u64, IoTaskHandle>,
    blocked_on_memory: bool,
    failure: Option<ExchangeError>,
    stats: ExchangeRecvStats,
}

impl RemoteSourceInner {
    fn is_drained(&self) -> bool {
        self.last_sequence_id == Some(self.next_sequence_id_to_consume - 1)
    }

    fn knows(&self, sequence_id: SequenceId) -> bool {
        sequence_id < self.next_sequence_id_to_consume
            || self.pending_block_sizes.contains_key(&sequence_id)
            || self.inflight_block_sizes.contains_key(&sequence_id)
            || self.received.contains_key(&sequence_id)
    }

    fn cancel_fetches(&mut self) {
        for (_, task) in self.fetch_tasks.drain() {
            task.cancel();
        }
    }

    fn clear(&mut self) {
        self.cancel_fetches();
        self.pending_block_sizes.clear();
        self.inflight_block_sizes.clear();
        self.received.clear();
    }
}

struct FetchBatch {
    task_id: u64,
    start: SequenceId,
    sizes: Vec<i64>,
}

pub struct RemoteSourceHandle {
    handle_id: u64,
    local_instance_id: FragmentInstanceId,
    local_plan_node_id: PlanNodeId,
    remote_endpoint: Endpoint,
    remote_instance_id: FragmentInstanceId,
    channel_index: i32,
    full_id: String,
    transport: Arc<dyn ExchangeTransport>,
    reservation: MemoryReservation,
    listener: SourceListener,
    max_blocks_per_fetch: usize,
    inner: Mutex<RemoteSourceInner>,
    cv: Condvar,
    observable: Arc<Observable>,
    memory_observable: Arc<Observable>,
    self_ref: Weak<RemoteSourceHandle>,
}

impl RemoteSourceHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle_id: u64,
        local_instance_id: FragmentInstanceId,
        local_plan_node_id: PlanNodeId,
        remote_endpoint: Endpoint,
        remote_instance_id: FragmentInstanceId,
        channel_index: i32,
        transport: Arc<dyn ExchangeTransport>,
        pool: &Arc<MemoryPool>,
        listener: SourceListener,
    ) -> Arc<Self> {
        let full_id =
            local_instance_id.full_id_with(&format!("{}.SourceHandle", local_plan_node_id));
        let reservation =
            MemoryReservation::new(pool, local_instance_id.query_id.clone(), full_id.clone());
        let handle = Arc::new_cyclic(|self_ref: &Weak<RemoteSourceHandle>| {
            let memory_observable = Arc::new(Observable::new());
            let weak = self_ref.clone();
            memory_observable.add_observer(Arc::new(move || {
                let weak = weak.clone();
                io_executor().submit(move |_ctx| {
                    if let Some(handle) = weak.upgrade() {
                        handle.on_memory_available();
                    }
                });
            }));
            Self {
                handle_id,
                local_instance_id,
                local_plan_node_id,
                remote_endpoint,
                remote_instance_id,
                channel_index,
                full_id,
                transport,
                reservation,
                listener,
                max_blocks_per_fetch: exchange_max_blocks_per_fetch().max(1),
                inner: Mutex::new(RemoteSourceInner {
                    state: SourceState::Active,
                    pending_block_sizes: BTreeMap::new(),
                    inflight_block_sizes: BTreeMap::new(),
                    received: BTreeMap::new(),
                    next_sequence_id_to_consume: 0,
                    last_sequence_id: None,
                    fetch_tasks: HashMap::new(),
                    blocked_on_memory: false,
                    failure: None,
                    stats: ExchangeRecvStats::default(),
                }),
                cv: Condvar::new(),
                observable: Arc::new(Observable::new()),
                memory_observable,
                self_ref: self_ref.clone(),
            }
        });
        debug!(
            "remote source handle created: source={} upstream={}@{} channel={}",
            handle.full_id, handle.remote_instance_id, handle.remote_endpoint, channel_index
        );
        handle
    }

    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn local_instance_id(&self) -> &FragmentInstanceId {
        &self.local_instance_id
    }

    pub fn local_plan_node_id(&self) -> &PlanNodeId {
        &self.local_plan_node_id
    }

    pub fn remote_instance_id(&self) -> &FragmentInstanceId {
        &self.remote_instance_id
    }

    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote_endpoint
    }

    pub fn channel_index(&self) -> i32 {
        self.channel_index
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn observable(&self) -> &Arc<Observable> {
        &self.observable
    }

    pub fn state(&self) -> SourceState {
        self.inner.lock().expect("remote source lock").state
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SourceState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SourceState::Aborted
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.reservation.reserved_bytes()
    }

    pub fn reservation(&self) -> &MemoryReservation {
        &self.reservation
    }

    pub fn snapshot(&self) -> RemoteSourceSnapshot {
        let guard = self.inner.lock().expect("remote source lock");
        RemoteSourceSnapshot {
            state: guard.state,
            next_sequence_id_to_consume: guard.next_sequence_id_to_consume,
            last_sequence_id: guard.last_sequence_id,
            pending_blocks: guard.pending_block_sizes.len(),
            inflight_blocks: guard.inflight_block_sizes.len(),
            buffered_blocks: guard.received.len(),
            blocked_on_memory: guard.blocked_on_memory,
            reserved_bytes: self.reservation.reserved_bytes(),
        }
    }

    fn wake_consumer(&self) {
        self.cv.notify_all();
        let notify = self.observable.defer_notify();
        notify.arm();
    }

    /// Record blocks `[start, start + sizes.len())` announced by the sink.
    pub fn update_pending_data_block_info(&self, start: SequenceId, block_sizes: &[i64]) {
        {
            let mut guard = self.inner.lock().expect("remote source lock");
            if guard.state != SourceState::Active {
                return;
            }
            for (offset, size) in block_sizes.iter().enumerate() {
                let sequence_id = start + offset as SequenceId;
                if !guard.knows(sequence_id) {
                    guard.pending_block_sizes.insert(sequence_id, (*size).max(0));
                }
            }
        }
        self.try_submit_fetch();
    }

    /// Record the final sequence id; `-1` means the stream carried no blocks.
    pub fn set_no_more_blocks(&self, last_sequence_id: SequenceId) {
        let finished = {
            let mut guard = self.inner.lock().expect("remote source lock");
            if guard.state != SourceState::Active {
                return;
            }
            guard.last_sequence_id = Some(last_sequence_id);
            if guard.is_drained() {
                guard.state = SourceState::Finished;
                guard.clear();
                true
            } else {
                false
            }
        };
        debug!(
            "remote source no more blocks: source={} last_sequence_id={}",
            self.full_id, last_sequence_id
        );
        if finished {
            self.on_finished();
        }
        self.wake_consumer();
    }

    fn on_memory_available(&self) {
        {
            let mut guard = self.inner.lock().expect("remote source lock");
            guard.blocked_on_memory = false;
        }
        self.try_submit_fetch();
    }

    /// Issue fetches for announced blocks as far as memory quota allows.
    fn try_submit_fetch(&self) {
        let mut failure = None;
        {
            let mut guard = self.inner.lock().expect("remote source lock");
            while guard.state == SourceState::Active && !guard.pending_block_sizes.is_empty() {
                match self.next_batch(&mut guard) {
                    Ok(Some(batch)) => self.submit_fetch(&mut guard, batch),
                    Ok(None) => break,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
        if let Some(err) = failure {
            self.fail(err);
        }
    }

    // Reserve memory for the longest contiguous run at the head of pending.
    fn next_batch(&self, inner: &mut RemoteSourceInner) -> ExchangeResult<Option<FetchBatch>> {
        let Some((&start, _)) = inner.pending_block_sizes.first_key_value() else {
            return Ok(None);
        };
        let mut sizes = Vec::new();
        let mut sequence_id = start;
        while sizes.len() < self.max_blocks_per_fetch {
            let Some(&size) = inner.pending_block_sizes.get(&sequence_id) else {
                break;
            };
            if !self.reservation.try_reserve(size, Some(&self.memory_observable))? {
                inner.blocked_on_memory = true;
                break;
            }
            inner.blocked_on_memory = false;
            inner.pending_block_sizes.remove(&sequence_id);
            inner.inflight_block_sizes.insert(sequence_id, size);
            sizes.push(size);
            sequence_id += 1;
        }
        if sizes.is_empty() {
            return Ok(None);
        }
        Ok(Some(FetchBatch {
            task_id: FETCH_TASK_ID.fetch_add(1, Ordering::Relaxed),
            start,
            sizes,
        }))
    }

    fn submit_fetch(&self, inner: &mut RemoteSourceInner, batch: FetchBatch) {
        let end = batch.start + batch.sizes.len() as SequenceId;
        let request = GetDataBlocksRequest {
            source_fragment_instance_id: self.remote_instance_id.clone(),
            channel_index: self.channel_index,
            start_sequence_id: batch.start,
            end_sequence_id: end,
        };
        let transport = Arc::clone(&self.transport);
        let endpoint = self.remote_endpoint.clone();
        let weak = self.self_ref.clone();
        let task_id = batch.task_id;
        debug!(
            "remote source fetch: source={} range=[{}, {})",
            self.full_id, batch.start, end
        );
        let task = io_executor().submit(move |ctx| {
            if ctx.is_cancelled() {
                return;
            }
            let result = transport.get_data_blocks(&endpoint, request);
            if let Some(handle) = weak.upgrade() {
                handle.on_fetch_complete(batch, result);
            }
        });
        inner.fetch_tasks.insert(task_id, task);
    }

    fn on_fetch_complete(&self, batch: FetchBatch, result: ExchangeResult<Vec<DataBlock>>) {
        let blocks = match result {
            Ok(blocks) if blocks.len() == batch.sizes.len() => blocks,
            Ok(blocks) => {
                self.fail(ExchangeError::Failed(format!(
                    "{} fetched {} blocks from [{}, {}), expected {}",
                    self.full_id,
                    blocks.len(),
                    batch.start,
                    batch.start + batch.sizes.len() as SequenceId,
                    batch.sizes.len()
                )));
                return;
            }
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        {
            let mut guard = self.inner.lock().expect("remote source lock");
            guard.fetch_tasks.remove(&batch.task_id);
            if guard.state != SourceState::Active {
                return;
            }
            for (offset, (block, size)) in blocks.into_iter().zip(batch.sizes).enumerate() {
                let sequence_id = batch.start + offset as SequenceId;
                guard.inflight_block_sizes.remove(&sequence_id);
                guard.received.insert(sequence_id, (block, size));
            }
        }
        self.wake_consumer();
    }

    /// Pop the next block in sequence order without waiting.
    pub fn try_receive(&self) -> ExchangeResult<Option<ExchangePopResult>> {
        let (block, sequence_id, size, finished) = {
            let mut guard = self.inner.lock().expect("remote source lock");
            match guard.state {
                SourceState::Active => {}
                SourceState::Finished => return Ok(Some(ExchangePopResult::Finished(guard.stats))),
                SourceState::Aborted => return Err(ExchangeError::Aborted(self.full_id.clone())),
                SourceState::Failed => {
                    return Err(guard
                        .failure
                        .clone()
                        .unwrap_or_else(|| ExchangeError::Failed(self.full_id.clone())));
                }
            }
            let next = guard.next_sequence_id_to_consume;
            match guard.received.remove(&next) {
                Some((block, size)) => {
                    guard.next_sequence_id_to_consume += 1;
                    guard.stats.record(&block);
                    let finished = guard.is_drained();
                    if finished {
                        guard.state = SourceState::Finished;
                        guard.clear();
                    }
                    (block, next, size, finished)
                }
                None => {
                    if guard.is_drained() {
                        guard.state = SourceState::Finished;
                        guard.clear();
                        let stats = guard.stats;
                        drop(guard);
                        self.on_finished();
                        return Ok(Some(ExchangePopResult::Finished(stats)));
                    }
                    return Ok(None);
                }
            }
        };
        self.reservation.release(size);
        self.send_acknowledge(sequence_id, sequence_id + 1);
        if finished {
            self.on_finished();
        } else {
            self.try_submit_fetch();
        }
        Ok(Some(ExchangePopResult::Block(block)))
    }

    pub fn receive(&self) -> ExchangeResult<ExchangePopResult> {
        self.receive_timeout(Duration::from_millis(exchange_receive_wait_ms()))
    }

    pub fn receive_timeout(&self, timeout: Duration) -> ExchangeResult<ExchangePopResult> {
        let start = Instant::now();
        loop {
            if let Some(result) = self.try_receive()? {
                return Ok(result);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ExchangeError::Timeout(format!(
                    "{} waited {}ms for data",
                    self.full_id,
                    elapsed.as_millis()
                )));
            }
            let guard = self.inner.lock().expect("remote source lock");
            let next = guard.next_sequence_id_to_consume;
            if should_log_receive_wait() {
                debug!(
                    "remote source waiting: source={} next={} pending={} inflight={} \
                     blocked_on_memory={}",
                    self.full_id,
                    next,
                    guard.pending_block_sizes.len(),
                    guard.inflight_block_sizes.len(),
                    guard.blocked_on_memory
                );
            }
            let _ = self
                .cv
                .wait_timeout_while(guard, RECEIVE_WAIT_SLICE.min(timeout - elapsed), |s| {
                    s.state == SourceState::Active
                        && !s.received.contains_key(&s.next_sequence_id_to_consume)
                        && !s.is_drained()
                })
                .expect("remote source wait");
        }
    }

    fn send_acknowledge(&self, start: SequenceId, end: SequenceId) {
        let full_id = self.full_id.clone();
        exchange_event_queue().submit(
            Arc::clone(&self.transport),
            &self.remote_endpoint,
            &self.full_id,
            ExchangeEvent::Acknowledge(AcknowledgeDataBlockEvent {
                source_fragment_instance_id: self.remote_instance_id.clone(),
                channel_index: self.channel_index,
                start_sequence_id: start,
                end_sequence_id: end,
            }),
            Some(Box::new(move |result| {
                if let Err(err) = result {
                    warn!(
                        "acknowledge not delivered: source={} range=[{}, {}) error={}",
                        full_id, start, end, err
                    );
                }
            })),
        );
    }

    fn on_finished(&self) {
        self.reservation.release_all();
        debug!("remote source handle finished: source={}", self.full_id);
        self.listener.on_finished();
        self.wake_consumer();
    }

    fn fail(&self, err: ExchangeError) {
        {
            let mut guard = self.inner.lock().expect("remote source lock");
            if guard.state != SourceState::Active {
                return;
            }
            guard.state = SourceState::Failed;
            guard.failure = Some(err.clone());
            guard.clear();
        }
        self.reservation.release_all();
        warn!("remote source handle failed: source={} error={}", self.full_id, err);
        self.listener.on_failure(&err);
        self.wake_consumer();
    }

    /// Abort is accepted while active or after a failure, to release what is left.
    pub fn abort(&self) {
        {
            let mut guard = self.inner.lock().expect("remote source lock");
            if !matches!(guard.state, SourceState::Active | SourceState::Failed) {
                return;
            }
            guard.state = SourceState::Aborted;
            guard.clear();
        }
        self.reservation.release_all();
        debug!("remote source handle aborted: source={}", self.full_id);
        self.listener.on_aborted();
        self.wake_consumer();
    }

    pub fn close(&self) {
        {
            let mut guard = self.inner.lock().expect("remote source lock");
            if guard.state != SourceState::Active {
                return;
            }
            guard.state = SourceState::Finished;
            guard.clear();
        }
        self.on_finished();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::RemoteSourceHandle;
    use crate::common::ids::{Endpoint, FragmentInstanceId, PlanNodeId};
    use crate::exchange::data_block::DataBlock;
    use crate::exchange::error::ExchangeError;
    use crate::exchange::listener::SourceListener;
    use crate::exchange::local_source::{ExchangePopResult, SourceState};
    use crate::exchange::test_util::{RecordedEvent, RecordingTransport, wait_until};
    use crate::runtime::memory_pool::MemoryPool;

    fn remote_source(
        pool: &Arc<MemoryPool>,
        transport: &Arc<RecordingTransport>,
        failures: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<RemoteSourceHandle> {
        let failures = Arc::clone(failures);
        RemoteSourceHandle::new(
            21,
            FragmentInstanceId::new("q", 2, "0"),
            PlanNodeId::new("exchange_3"),
            Endpoint::new("10.0.0.1", 10740),
            FragmentInstanceId::new("q", 1, "0"),
            0,
            transport.clone(),
            pool,
            SourceListener::Pipeline {
                on_failure: Arc::new(move |err: &ExchangeError| {
                    failures.lock().unwrap().push(err.to_string())
                }),
            },
        )
    }

    fn transport_with(blocks: &[&'static str]) -> Arc<RecordingTransport> {
        let transport = Arc::new(RecordingTransport::default());
        *transport.blocks.lock().unwrap() = blocks.iter().map(|b| DataBlock::from(*b)).collect();
        transport
    }

    fn expect_block(source: &RemoteSourceHandle) -> DataBlock {
        match source.receive_timeout(Duration::from_secs(5)).unwrap() {
            ExchangePopResult::Block(block) => block,
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn consumes_in_order_and_finishes_at_last_sequence() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = transport_with(&["a", "bb", "ccc"]);
        let source = remote_source(&pool, &transport, &Arc::default());

        source.update_pending_data_block_info(0, &[1, 2]);
        source.update_pending_data_block_info(2, &[3]);
        source.set_no_more_blocks(2);

        assert_eq!(expect_block(&source), DataBlock::from("a"));
        assert_eq!(expect_block(&source), DataBlock::from("bb"));
        assert_eq!(source.state(), SourceState::Active);
        assert_eq!(expect_block(&source), DataBlock::from("ccc"));
        assert!(source.is_finished());
        match source.try_receive().unwrap() {
            Some(ExchangePopResult::Finished(stats)) => {
                assert_eq!(stats.blocks_received, 3);
                assert_eq!(stats.bytes_received, 6);
            }
            other => panic!("expected end of stream, got {:?}", other),
        }
        assert!(wait_until(Duration::from_secs(5), || transport.events().len() == 3));
        let mut acks = transport.events();
        acks.sort_by_key(|e| match e {
            RecordedEvent::Acknowledge { start, .. } => *start,
            _ => i64::MAX,
        });
        assert_eq!(
            acks,
            vec![
                RecordedEvent::Acknowledge { start: 0, end: 1 },
                RecordedEvent::Acknowledge { start: 1, end: 2 },
                RecordedEvent::Acknowledge { start: 2, end: 3 },
            ]
        );
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn does_not_finish_before_last_block_is_consumed() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = transport_with(&["a", "b", "c"]);
        let source = remote_source(&pool, &transport, &Arc::default());
        source.set_no_more_blocks(2);
        source.update_pending_data_block_info(0, &[1, 1]);
        expect_block(&source);
        expect_block(&source);
        assert_eq!(source.try_receive().unwrap(), None);
        assert_eq!(source.state(), SourceState::Active);
        source.update_pending_data_block_info(2, &[1]);
        expect_block(&source);
        assert!(source.is_finished());
    }

    #[test]
    fn empty_stream_finishes_immediately() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = transport_with(&[]);
        let source = remote_source(&pool, &transport, &Arc::default());
        source.set_no_more_blocks(-1);
        assert!(source.is_finished());
        assert!(matches!(
            source.try_receive().unwrap(),
            Some(ExchangePopResult::Finished(_))
        ));
        source.update_pending_data_block_info(0, &[4]);
        assert_eq!(source.snapshot().pending_blocks, 0);
    }

    #[test]
    fn fetch_waits_for_memory_quota() {
        let pool = MemoryPool::new("test", 3, 3);
        let transport = transport_with(&["xx", "yy"]);
        let source = remote_source(&pool, &transport, &Arc::default());
        source.update_pending_data_block_info(0, &[2, 2]);
        assert!(wait_until(Duration::from_secs(5), || {
            source.snapshot().buffered_blocks == 1
        }));
        let snapshot = source.snapshot();
        assert!(snapshot.blocked_on_memory);
        assert_eq!(snapshot.pending_blocks, 1);
        assert_eq!(snapshot.reserved_bytes, 2);

        assert_eq!(expect_block(&source), DataBlock::from("xx"));
        assert_eq!(expect_block(&source), DataBlock::from("yy"));
        assert!(pool.reserved_bytes() <= 3);
    }

    #[test]
    fn abort_with_unconsumed_blocks_releases_memory() {
        let pool = MemoryPool::new("test", 6, 6);
        let transport = transport_with(&["aaa", "bbb", "ccc"]);
        let source = remote_source(&pool, &transport, &Arc::default());
        source.update_pending_data_block_info(0, &[3, 3, 3]);
        assert!(wait_until(Duration::from_secs(5), || {
            source.snapshot().buffered_blocks == 2
        }));
        let before = source.snapshot();
        assert_eq!(before.pending_blocks, 1);
        assert!(before.blocked_on_memory);
        assert_eq!(pool.reserved_bytes(), 6);

        source.abort();
        let after = source.snapshot();
        assert_eq!(after.state, SourceState::Aborted);
        assert_eq!(after.pending_blocks, 0);
        assert_eq!(after.inflight_blocks, 0);
        assert_eq!(after.buffered_blocks, 0);
        assert_eq!(after.reserved_bytes, 0);
        assert_eq!(pool.reserved_bytes(), 0);
        assert!(matches!(
            source.try_receive(),
            Err(ExchangeError::Aborted(_))
        ));

        source.update_pending_data_block_info(3, &[3]);
        assert_eq!(source.snapshot().pending_blocks, 0);
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn fetch_failure_fails_source_and_abort_still_cleans_up() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let transport = transport_with(&[]);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let source = remote_source(&pool, &transport, &failures);
        source.update_pending_data_block_info(0, &[8]);
        assert!(wait_until(Duration::from_secs(5), || {
            source.state() == SourceState::Failed
        }));
        assert!(matches!(
            source.try_receive(),
            Err(ExchangeError::BlockNotFound(_))
        ));
        assert_eq!(failures.lock().unwrap().len(), 1);
        assert_eq!(pool.reserved_bytes(), 0);
        source.abort();
        assert!(source.is_aborted());
        source.close();
        assert!(source.is_aborted());
    }
}
