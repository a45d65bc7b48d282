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
//! Consumer endpoint reading from a shared queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::config::exchange_receive_wait_ms;
use crate::common::ids::{FragmentInstanceId, PlanNodeId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::listener::SourceListener;
use crate::exchange::shared_queue::{QueueStatus, SharedBlockQueue};
use crate::mpp_logging::{debug, info};
use crate::runtime::observer::Observable;

const RECEIVE_WAIT_SLICE: Duration = Duration::from_millis(100);

static RECEIVE_WAIT_COUNT: AtomicU64 = AtomicU64::new(0);

pub(crate) fn should_log_receive_wait() -> bool {
    let count = RECEIVE_WAIT_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    count % 50 == 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Active,
    Finished,
    Aborted,
    Failed,
}

impl SourceState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SourceState::Active)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeRecvStats {
    pub blocks_received: u64,
    pub bytes_received: u64,
}

impl ExchangeRecvStats {
    pub(crate) fn record(&mut self, block: &DataBlock) {
        self.blocks_received += 1;
        self.bytes_received += block.size() as u64;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExchangePopResult {
    Block(DataBlock),
    /// End of stream; every announced block has been consumed.
    Finished(ExchangeRecvStats),
}

struct LocalSourceInner {
    state: SourceState,
    failure: Option<ExchangeError>,
    stats: ExchangeRecvStats,
}

pub struct LocalSourceHandle {
    handle_id: u64,
    local_instance_id: FragmentInstanceId,
    local_plan_node_id: PlanNodeId,
    remote_instance_id: FragmentInstanceId,
    full_id: String,
    queue: Arc<SharedBlockQueue>,
    listener: SourceListener,
    inner: Mutex<LocalSourceInner>,
}

impl LocalSourceHandle {
    pub(crate) fn new(
        handle_id: u64,
        local_instance_id: FragmentInstanceId,
        local_plan_node_id: PlanNodeId,
        remote_instance_id: FragmentInstanceId,
        queue: Arc<SharedBlockQueue>,
        listener: SourceListener,
    ) -> Arc<Self> {
        let full_id =
            local_instance_id.full_id_with(&format!("{}.SourceHandle", local_plan_node_id));
        debug!(
            "local source handle created: source={} queue={}",
            full_id,
            queue.full_id()
        );
        Arc::new(Self {
            handle_id,
            local_instance_id,
            local_plan_node_id,
            remote_instance_id,
            full_id,
            queue,
            listener,
            inner: Mutex::new(LocalSourceInner {
                state: SourceState::Active,
                failure: None,
                stats: ExchangeRecvStats::default(),
            }),
        })
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

    /// The producing fragment instance.
    pub fn remote_instance_id(&self) -> &FragmentInstanceId {
        &self.remote_instance_id
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn queue(&self) -> &Arc<SharedBlockQueue> {
        &self.queue
    }

    /// Fires whenever a block arrives or the stream changes state.
    pub fn observable(&self) -> &Arc<Observable> {
        self.queue.observable()
    }

    pub fn state(&self) -> SourceState {
        self.inner.lock().expect("local source lock").state
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SourceState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SourceState::Aborted
    }

    pub fn stats(&self) -> ExchangeRecvStats {
        self.inner.lock().expect("local source lock").stats
    }

    pub fn buffered_bytes(&self) -> i64 {
        self.queue.reserved_bytes()
    }

    fn terminal_result(
        &self,
        inner: &LocalSourceInner,
    ) -> Option<ExchangeResult<Option<ExchangePopResult>>> {
        match inner.state {
            SourceState::Active => None,
            SourceState::Finished => Some(Ok(Some(ExchangePopResult::Finished(inner.stats)))),
            SourceState::Aborted => Some(Err(ExchangeError::Aborted(self.full_id.clone()))),
            SourceState::Failed => Some(Err(inner
                .failure
                .clone()
                .unwrap_or_else(|| ExchangeError::Failed(self.full_id.clone())))),
        }
    }

    /// Pop the next block without waiting. `Ok(None)` means nothing is ready yet.
    pub fn try_receive(&self) -> ExchangeResult<Option<ExchangePopResult>> {
        {
            let guard = self.inner.lock().expect("local source lock");
            if let Some(result) = self.terminal_result(&guard) {
                return result;
            }
        }
        if let Some(block) = self.queue.remove() {
            let finished = {
                let mut guard = self.inner.lock().expect("local source lock");
                guard.stats.record(&block);
                self.drained_after_pop(&mut guard)
            };
            if finished {
                debug!("local source handle finished: source={}", self.full_id);
                self.listener.on_finished();
            }
            return Ok(Some(ExchangePopResult::Block(block)));
        }
        match self.queue.status() {
            QueueStatus::HasBlocks | QueueStatus::Empty => Ok(None),
            QueueStatus::Drained => {
                let stats = {
                    let mut guard = self.inner.lock().expect("local source lock");
                    if let Some(result) = self.terminal_result(&guard) {
                        return result;
                    }
                    guard.state = SourceState::Finished;
                    guard.stats
                };
                debug!("local source handle finished: source={}", self.full_id);
                self.listener.on_finished();
                Ok(Some(ExchangePopResult::Finished(stats)))
            }
            QueueStatus::Aborted(Some(cause)) => {
                let err = ExchangeError::Failed(cause);
                self.fail(err.clone());
                Err(err)
            }
            QueueStatus::Aborted(None) => {
                self.abort();
                Err(ExchangeError::Aborted(self.full_id.clone()))
            }
        }
    }

    fn drained_after_pop(&self, inner: &mut LocalSourceInner) -> bool {
        if inner.state != SourceState::Active || self.queue.status() != QueueStatus::Drained {
            return false;
        }
        inner.state = SourceState::Finished;
        true
    }

    /// Receive with the configured wait limit.
    pub fn receive(&self) -> ExchangeResult<ExchangePopResult> {
        self.receive_timeout(Duration::from_millis(exchange_receive_wait_ms()))
    }

    /// Block until a block arrives, the stream ends, or `timeout` elapses.
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
            if should_log_receive_wait() {
                debug!(
                    "local source waiting: source={} waited_ms={}",
                    self.full_id,
                    elapsed.as_millis()
                );
            }
            let _ = self.queue.wait(RECEIVE_WAIT_SLICE.min(timeout - elapsed));
        }
    }

    fn fail(&self, err: ExchangeError) {
        {
            let mut guard = self.inner.lock().expect("local source lock");
            if guard.state.is_terminal() {
                return;
            }
            guard.state = SourceState::Failed;
            guard.failure = Some(err.clone());
        }
        self.queue.close();
        info!("local source handle failed: source={} error={}", self.full_id, err);
        self.listener.on_failure(&err);
    }

    pub fn abort(&self) {
        {
            let mut guard = self.inner.lock().expect("local source lock");
            if guard.state.is_terminal() {
                return;
            }
            guard.state = SourceState::Aborted;
        }
        self.queue.close();
        debug!("local source handle aborted: source={}", self.full_id);
        self.listener.on_aborted();
    }

    pub fn close(&self) {
        {
            let mut guard = self.inner.lock().expect("local source lock");
            if guard.state.is_terminal() {
                return;
            }
            guard.state = SourceState::Finished;
        }
        self.queue.close();
        debug!("local source handle closed: source={}", self.full_id);
        self.listener.on_finished();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::{ExchangePopResult, LocalSourceHandle, SourceState};
    use crate::common::ids::{FragmentInstanceId, PlanNodeId};
    use crate::exchange::data_block::DataBlock;
    use crate::exchange::error::ExchangeError;
    use crate::exchange::listener::SourceListener;
    use crate::exchange::shared_queue::SharedBlockQueue;
    use crate::runtime::memory_pool::MemoryPool;

    fn source(pool: &Arc<MemoryPool>, failures: Arc<Mutex<Vec<String>>>) -> Arc<LocalSourceHandle> {
        let consumer = FragmentInstanceId::new("q", 2, "0");
        let plan_node = PlanNodeId::new("exchange_1");
        let queue = SharedBlockQueue::new(consumer.clone(), plan_node.clone(), pool);
        LocalSourceHandle::new(
            7,
            consumer,
            plan_node,
            FragmentInstanceId::new("q", 1, "0"),
            queue,
            SourceListener::Pipeline {
                on_failure: Arc::new(move |err: &ExchangeError| {
                    failures.lock().unwrap().push(err.to_string())
                }),
            },
        )
    }

    #[test]
    fn drains_then_reports_finished() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let source = source(&pool, Arc::default());
        assert_eq!(source.try_receive().unwrap(), None);
        source.queue().add(DataBlock::from("a")).unwrap();
        source.queue().add(DataBlock::from("bc")).unwrap();
        source.queue().set_no_more_blocks();
        assert_eq!(
            source.try_receive().unwrap(),
            Some(ExchangePopResult::Block(DataBlock::from("a")))
        );
        assert!(!source.is_finished());
        assert_eq!(
            source.receive_timeout(Duration::from_secs(1)).unwrap(),
            ExchangePopResult::Block(DataBlock::from("bc"))
        );
        assert!(source.is_finished());
        match source.receive_timeout(Duration::from_secs(1)).unwrap() {
            ExchangePopResult::Finished(stats) => {
                assert_eq!(stats.blocks_received, 2);
                assert_eq!(stats.bytes_received, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn blocked_receive_wakes_on_block() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let source = source(&pool, Arc::default());
        let queue = Arc::clone(source.queue());
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            queue.add(DataBlock::from("late")).unwrap();
        });
        assert_eq!(
            source.receive_timeout(Duration::from_secs(5)).unwrap(),
            ExchangePopResult::Block(DataBlock::from("late"))
        );
        producer.join().unwrap();
    }

    #[test]
    fn receive_times_out_when_idle() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let source = source(&pool, Arc::default());
        assert!(matches!(
            source.receive_timeout(Duration::from_millis(20)),
            Err(ExchangeError::Timeout(_))
        ));
        assert_eq!(source.state(), SourceState::Active);
    }

    #[test]
    fn upstream_failure_fails_source_once() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let source = source(&pool, Arc::clone(&failures));
        source.queue().add(DataBlock::from("x")).unwrap();
        source.queue().abort(Some("upstream crashed".to_string()));
        assert!(matches!(source.try_receive(), Err(ExchangeError::Failed(_))));
        assert!(matches!(source.try_receive(), Err(ExchangeError::Failed(_))));
        assert_eq!(source.state(), SourceState::Failed);
        assert_eq!(failures.lock().unwrap().len(), 1);
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn abort_releases_queue_memory() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let source = source(&pool, Arc::default());
        source.queue().add(DataBlock::from(vec![0u8; 100])).unwrap();
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);
        source.observable().add_observer(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        source.abort();
        assert!(source.is_aborted());
        assert_eq!(pool.reserved_bytes(), 0);
        assert!(observed.load(Ordering::SeqCst) >= 1);
        assert!(matches!(source.try_receive(), Err(ExchangeError::Aborted(_))));
    }
}
