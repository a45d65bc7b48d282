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
//! Live handles keyed by fragment instance and plan node.
//!
//! Check-then-insert happens under one lock so at most one sink per instance
//! and one source per `(instance, plan node)` can exist. Removal is guarded by
//! the handle id, so a late listener callback of a replaced handle never
//! removes its successor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::common::ids::{FragmentInstanceId, PlanNodeId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::ExchangeResult;
use crate::exchange::local_sink::{LocalSinkHandle, SinkState};
use crate::exchange::local_source::{ExchangePopResult, LocalSourceHandle, SourceState};
use crate::exchange::remote_source::RemoteSourceHandle;
use crate::exchange::shared_queue::SharedBlockQueue;
use crate::exchange::shuffle_sink::ShuffleSinkHandle;
use crate::runtime::observer::Observable;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Producer side of one exchange, whichever transport it uses.
#[derive(Clone)]
pub enum SinkHandle {
    Local(Arc<LocalSinkHandle>),
    Shuffle(Arc<ShuffleSinkHandle>),
}

impl SinkHandle {
    pub fn handle_id(&self) -> u64 {
        match self {
            SinkHandle::Local(h) => h.handle_id(),
            SinkHandle::Shuffle(h) => h.handle_id(),
        }
    }

    pub fn send(&self, block: DataBlock) -> ExchangeResult<()> {
        match self {
            SinkHandle::Local(h) => h.send(block),
            SinkHandle::Shuffle(h) => h.send(block),
        }
    }

    pub fn set_no_more_blocks(&self) {
        match self {
            SinkHandle::Local(h) => h.set_no_more_blocks(),
            SinkHandle::Shuffle(h) => h.set_no_more_blocks(),
        }
    }

    pub fn state(&self) -> SinkState {
        match self {
            SinkHandle::Local(h) => h.state(),
            SinkHandle::Shuffle(h) => h.state(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SinkState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SinkState::Aborted
    }

    pub fn buffered_bytes(&self) -> i64 {
        match self {
            SinkHandle::Local(h) => h.buffered_bytes(),
            SinkHandle::Shuffle(h) => h.buffered_bytes(),
        }
    }

    pub fn abort(&self) {
        match self {
            SinkHandle::Local(h) => h.abort(),
            SinkHandle::Shuffle(h) => h.abort(),
        }
    }

    pub fn close(&self) {
        match self {
            SinkHandle::Local(h) => h.close(),
            SinkHandle::Shuffle(h) => h.close(),
        }
    }
}

/// Consumer side of one exchange.
#[derive(Clone)]
pub enum SourceHandle {
    Local(Arc<LocalSourceHandle>),
    Remote(Arc<RemoteSourceHandle>),
}

impl SourceHandle {
    pub fn handle_id(&self) -> u64 {
        match self {
            SourceHandle::Local(h) => h.handle_id(),
            SourceHandle::Remote(h) => h.handle_id(),
        }
    }

    pub fn try_receive(&self) -> ExchangeResult<Option<ExchangePopResult>> {
        match self {
            SourceHandle::Local(h) => h.try_receive(),
            SourceHandle::Remote(h) => h.try_receive(),
        }
    }

    pub fn receive(&self) -> ExchangeResult<ExchangePopResult> {
        match self {
            SourceHandle::Local(h) => h.receive(),
            SourceHandle::Remote(h) => h.receive(),
        }
    }

    pub fn receive_timeout(&self, timeout: Duration) -> ExchangeResult<ExchangePopResult> {
        match self {
            SourceHandle::Local(h) => h.receive_timeout(timeout),
            SourceHandle::Remote(h) => h.receive_timeout(timeout),
        }
    }

    pub fn observable(&self) -> &Arc<Observable> {
        match self {
            SourceHandle::Local(h) => h.observable(),
            SourceHandle::Remote(h) => h.observable(),
        }
    }

    pub fn state(&self) -> SourceState {
        match self {
            SourceHandle::Local(h) => h.state(),
            SourceHandle::Remote(h) => h.state(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SourceState::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SourceState::Aborted
    }

    pub fn buffered_bytes(&self) -> i64 {
        match self {
            SourceHandle::Local(h) => h.buffered_bytes(),
            SourceHandle::Remote(h) => h.buffered_bytes(),
        }
    }

    pub fn abort(&self) {
        match self {
            SourceHandle::Local(h) => h.abort(),
            SourceHandle::Remote(h) => h.abort(),
        }
    }

    pub fn close(&self) {
        match self {
            SourceHandle::Local(h) => h.close(),
            SourceHandle::Remote(h) => h.close(),
        }
    }
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    pub(crate) sinks: HashMap<FragmentInstanceId, SinkHandle>,
    pub(crate) sources: HashMap<FragmentInstanceId, HashMap<PlanNodeId, SourceHandle>>,
}

impl RegistryInner {
    pub(crate) fn source(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> Option<&SourceHandle> {
        self.sources.get(instance_id).and_then(|m| m.get(plan_node_id))
    }

    /// Queue already created by the local source at `(consumer, plan_node)`
    /// for data coming from `producer`.
    pub(crate) fn queue_of_local_source(
        &self,
        consumer: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
        producer: &FragmentInstanceId,
    ) -> Option<Arc<SharedBlockQueue>> {
        match self.source(consumer, plan_node_id) {
            Some(SourceHandle::Local(source)) if source.remote_instance_id() == producer => {
                Some(Arc::clone(source.queue()))
            }
            _ => None,
        }
    }

    /// Queue already created by the sink of `producer` for `(consumer, plan_node)`.
    pub(crate) fn queue_of_sink(
        &self,
        producer: &FragmentInstanceId,
        consumer: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> Option<Arc<SharedBlockQueue>> {
        match self.sinks.get(producer) {
            Some(SinkHandle::Local(sink))
                if sink.queue().is_consumed_by(consumer, plan_node_id) =>
            {
                Some(Arc::clone(sink.queue()))
            }
            Some(SinkHandle::Shuffle(sink)) => sink.local_queue_for(consumer, plan_node_id),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct ExchangeRegistry {
    inner: Mutex<RegistryInner>,
}

impl ExchangeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("exchange registry lock")
    }

    pub fn sink(&self, instance_id: &FragmentInstanceId) -> Option<SinkHandle> {
        self.lock().sinks.get(instance_id).cloned()
    }

    pub fn source(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> Option<SourceHandle> {
        self.lock().source(instance_id, plan_node_id).cloned()
    }

    pub fn num_sinks(&self) -> usize {
        self.lock().sinks.len()
    }

    pub fn num_sources(&self) -> usize {
        self.lock().sources.values().map(HashMap::len).sum()
    }

    pub(crate) fn remove_sink_if(&self, instance_id: &FragmentInstanceId, handle_id: u64) -> bool {
        let mut guard = self.lock();
        match guard.sinks.get(instance_id) {
            Some(sink) if sink.handle_id() == handle_id => {
                guard.sinks.remove(instance_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_source_if(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
        handle_id: u64,
    ) -> bool {
        let mut guard = self.lock();
        let Some(by_plan_node) = guard.sources.get_mut(instance_id) else {
            return false;
        };
        let matches = by_plan_node
            .get(plan_node_id)
            .is_some_and(|source| source.handle_id() == handle_id);
        if !matches {
            return false;
        }
        by_plan_node.remove(plan_node_id);
        if by_plan_node.is_empty() {
            guard.sources.remove(instance_id);
        }
        true
    }

    /// Remove every handle owned by `instance_id` and return them.
    pub(crate) fn take_instance(
        &self,
        instance_id: &FragmentInstanceId,
    ) -> (Option<SinkHandle>, Vec<SourceHandle>) {
        let mut guard = self.lock();
        let sink = guard.sinks.remove(instance_id);
        let sources = guard
            .sources
            .remove(instance_id)
            .map(|m| m.into_values().collect())
            .unwrap_or_default();
        (sink, sources)
    }
}
