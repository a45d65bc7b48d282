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
//! Buffer shared by a co-located sink and source.
//!
//! Responsibilities:
//! - Holds blocks pushed by one local sink until the paired local source pops
//!   them, charging each block to the queue's own memory reservation.
//! - Carries end-of-stream, consumer close and upstream abort signals.
//! - Wakes a blocked consumer through a condition variable and pipeline
//!   drivers through an `Observable`.
//!
//! The queue is jointly owned (`Arc`) by both handles; whichever side tears
//! down first releases the reservation, the other only observes the state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::common::ids::{FragmentInstanceId, PlanNodeId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::local_sink::LocalSinkHandle;
use crate::mpp_logging::debug;
use crate::runtime::memory_pool::{MemoryPool, MemoryReservation};
use crate::runtime::observer::Observable;

static QUEUE_WAIT_COUNT: AtomicU64 = AtomicU64::new(0);

fn should_log_queue_wait() -> bool {
    let count = QUEUE_WAIT_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    count % 100 == 0
}

#[derive(Default)]
struct QueueState {
    blocks: VecDeque<DataBlock>,
    no_more_blocks: bool,
    // Consumer side is gone or the producer closed the stream.
    closed: bool,
    upstream_aborted: bool,
    abort_cause: Option<String>,
}

/// What a consumer finds when it looks at the head of the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueStatus {
    HasBlocks,
    Empty,
    Drained,
    Aborted(Option<String>),
}

pub struct SharedBlockQueue {
    consumer_instance_id: FragmentInstanceId,
    consumer_plan_node_id: PlanNodeId,
    full_id: String,
    reservation: MemoryReservation,
    state: Mutex<QueueState>,
    cv: Condvar,
    observable: Arc<Observable>,
    sink: Mutex<Weak<LocalSinkHandle>>,
}

impl SharedBlockQueue {
    pub fn new(
        consumer_instance_id: FragmentInstanceId,
        consumer_plan_node_id: PlanNodeId,
        pool: &Arc<MemoryPool>,
    ) -> Arc<Self> {
        let full_id = consumer_instance_id
            .full_id_with(&format!("{}.SharedQueue", consumer_plan_node_id));
        let reservation =
            MemoryReservation::new(pool, consumer_instance_id.query_id.clone(), full_id.clone());
        Arc::new(Self {
            consumer_instance_id,
            consumer_plan_node_id,
            full_id,
            reservation,
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
            observable: Arc::new(Observable::new()),
            sink: Mutex::new(Weak::new()),
        })
    }

    pub fn consumer_instance_id(&self) -> &FragmentInstanceId {
        &self.consumer_instance_id
    }

    pub fn consumer_plan_node_id(&self) -> &PlanNodeId {
        &self.consumer_plan_node_id
    }

    pub fn is_consumed_by(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> bool {
        &self.consumer_instance_id == instance_id && &self.consumer_plan_node_id == plan_node_id
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn observable(&self) -> &Arc<Observable> {
        &self.observable
    }

    pub fn reserved_bytes(&self) -> i64 {
        self.reservation.reserved_bytes()
    }

    pub fn reservation(&self) -> &MemoryReservation {
        &self.reservation
    }

    pub(crate) fn set_sink_handle(&self, sink: &Arc<LocalSinkHandle>) {
        *self.sink.lock().expect("shared queue sink lock") = Arc::downgrade(sink);
    }

    pub(crate) fn sink_handle(&self) -> Option<Arc<LocalSinkHandle>> {
        self.sink.lock().expect("shared queue sink lock").upgrade()
    }

    // Let the producer re-check whether it has drained.
    fn notify_sink(&self) {
        if let Some(sink) = self.sink_handle() {
            sink.check_and_invoke_on_finished();
        }
    }

    fn wake_consumer(&self) {
        self.cv.notify_all();
        let notify = self.observable.defer_notify();
        notify.arm();
    }

    /// Append a block, blocking while the memory pool is exhausted.
    ///
    /// Blocks pushed after the consumer closed the queue are dropped.
    pub fn add(&self, block: DataBlock) -> ExchangeResult<()> {
        {
            let guard = self.state.lock().expect("shared queue lock");
            if guard.closed {
                return Ok(());
            }
            if guard.no_more_blocks {
                return Err(ExchangeError::InvalidState(format!(
                    "{} received a block after no-more-blocks",
                    self.full_id
                )));
            }
        }
        let size = block.retained_size();
        match self.reservation.reserve_blocking(size) {
            Ok(()) => {}
            Err(ExchangeError::Closed(_)) | Err(ExchangeError::Aborted(_)) if self.is_closed() => {
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        {
            let mut guard = self.state.lock().expect("shared queue lock");
            if guard.closed {
                drop(guard);
                self.reservation.release(size);
                return Ok(());
            }
            guard.blocks.push_back(block);
        }
        self.wake_consumer();
        Ok(())
    }

    /// Pop the head block and return its memory to the pool.
    pub fn remove(&self) -> Option<DataBlock> {
        let block = {
            let mut guard = self.state.lock().expect("shared queue lock");
            guard.blocks.pop_front()
        }?;
        self.reservation.release(block.retained_size());
        self.notify_sink();
        Some(block)
    }

    pub fn status(&self) -> QueueStatus {
        let guard = self.state.lock().expect("shared queue lock");
        if guard.upstream_aborted {
            QueueStatus::Aborted(guard.abort_cause.clone())
        } else if !guard.blocks.is_empty() {
            QueueStatus::HasBlocks
        } else if guard.no_more_blocks || guard.closed {
            QueueStatus::Drained
        } else {
            QueueStatus::Empty
        }
    }

    /// Block until the queue is no longer `Empty` or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> QueueStatus {
        let guard = self.state.lock().expect("shared queue lock");
        let (guard, result) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| {
                s.blocks.is_empty() && !s.no_more_blocks && !s.closed && !s.upstream_aborted
            })
            .expect("shared queue wait");
        if result.timed_out() && should_log_queue_wait() {
            debug!(
                "shared queue wait timed out: queue={} buffered={}",
                self.full_id,
                guard.blocks.len()
            );
        }
        drop(guard);
        self.status()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("shared queue lock").blocks.is_empty()
    }

    pub fn num_blocks(&self) -> usize {
        self.state.lock().expect("shared queue lock").blocks.len()
    }

    pub fn is_no_more_blocks(&self) -> bool {
        self.state.lock().expect("shared queue lock").no_more_blocks
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("shared queue lock").closed
    }

    pub fn set_no_more_blocks(&self) {
        {
            let mut guard = self.state.lock().expect("shared queue lock");
            if guard.no_more_blocks {
                return;
            }
            guard.no_more_blocks = true;
        }
        self.wake_consumer();
    }

    /// Producer failed or was cancelled. Buffered blocks are discarded and the
    /// consumer observes `cause`.
    pub fn abort(&self, cause: Option<String>) {
        {
            let mut guard = self.state.lock().expect("shared queue lock");
            if guard.upstream_aborted {
                return;
            }
            guard.upstream_aborted = true;
            guard.abort_cause = cause;
            guard.closed = true;
            guard.blocks.clear();
        }
        self.reservation.release_all();
        self.wake_consumer();
    }

    /// Stop accepting blocks and discard what is buffered. Used when either side
    /// closes the stream or the consumer goes away.
    pub fn close(&self) {
        {
            let mut guard = self.state.lock().expect("shared queue lock");
            if guard.closed {
                return;
            }
            guard.closed = true;
            guard.blocks.clear();
        }
        self.reservation.release_all();
        self.wake_consumer();
        self.notify_sink();
    }
}
