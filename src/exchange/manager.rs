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
//! Entry point of the exchange layer on one node.
//!
//! Responsibilities:
//! - Creates sink and source handles, registering fragment-level handles so
//!   inbound protocol events can find them.
//! - Makes a co-located producer and consumer share one `SharedBlockQueue`
//!   whichever side is created first.
//! - Serves the inbound side of the protocol. Events for handles that are gone
//!   are dropped: downstream instances may finish early (e.g. a limit) while
//!   upstream events are still in flight.
//! - Tears down every handle of a failed or cancelled instance.
//!
//! Key exported interfaces:
//! - Types: `ExchangeManager`, `ExchangeMetricsSnapshot`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::ids::{Endpoint, FragmentInstanceId, PlanNodeId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::listener::{FailureCallback, SinkListener, SourceListener};
use crate::exchange::local_sink::LocalSinkHandle;
use crate::exchange::local_source::LocalSourceHandle;
use crate::exchange::protocol::{
    AcknowledgeDataBlockEvent, EndOfDataBlockEvent, GetDataBlocksRequest, NewDataBlockEvent,
};
use crate::exchange::registry::{ExchangeRegistry, SinkHandle, SourceHandle, next_handle_id};
use crate::exchange::remote_source::RemoteSourceHandle;
use crate::exchange::shared_queue::SharedBlockQueue;
use crate::exchange::shuffle_sink::{
    ChannelRoute, DownstreamChannelIndex, DownstreamChannelLocation, ShuffleSinkHandle,
    ShuffleStrategy,
};
use crate::exchange::transport::ExchangeTransport;
use crate::mpp_logging::{debug, info, warn};
use crate::runtime::fragment_context::InstanceContext;
use crate::runtime::memory_pool::MemoryPool;

#[derive(Default)]
struct ExchangeMetrics {
    fetch_requests: AtomicU64,
    fetched_blocks: AtomicU64,
    acknowledge_events: AtomicU64,
    new_data_block_events: AtomicU64,
    end_of_data_block_events: AtomicU64,
    dropped_events: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeMetricsSnapshot {
    pub fetch_requests: u64,
    pub fetched_blocks: u64,
    pub acknowledge_events: u64,
    pub new_data_block_events: u64,
    pub end_of_data_block_events: u64,
    pub dropped_events: u64,
}

pub struct ExchangeManager {
    local_endpoint: Endpoint,
    memory_pool: Arc<MemoryPool>,
    transport: Arc<dyn ExchangeTransport>,
    registry: Arc<ExchangeRegistry>,
    metrics: ExchangeMetrics,
}

impl ExchangeManager {
    pub fn new(
        local_endpoint: Endpoint,
        memory_pool: Arc<MemoryPool>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Arc<Self> {
        info!("exchange manager started: endpoint={}", local_endpoint);
        Arc::new(Self {
            local_endpoint,
            memory_pool,
            transport,
            registry: ExchangeRegistry::new(),
            metrics: ExchangeMetrics::default(),
        })
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local_endpoint
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    pub fn sink_handle(&self, instance_id: &FragmentInstanceId) -> Option<SinkHandle> {
        self.registry.sink(instance_id)
    }

    pub fn source_handle(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> Option<SourceHandle> {
        self.registry.source(instance_id, plan_node_id)
    }

    pub fn num_sink_handles(&self) -> usize {
        self.registry.num_sinks()
    }

    pub fn num_source_handles(&self) -> usize {
        self.registry.num_sources()
    }

    pub fn metrics(&self) -> ExchangeMetricsSnapshot {
        let m = &self.metrics;
        ExchangeMetricsSnapshot {
            fetch_requests: m.fetch_requests.load(Ordering::Relaxed),
            fetched_blocks: m.fetched_blocks.load(Ordering::Relaxed),
            acknowledge_events: m.acknowledge_events.load(Ordering::Relaxed),
            new_data_block_events: m.new_data_block_events.load(Ordering::Relaxed),
            end_of_data_block_events: m.end_of_data_block_events.load(Ordering::Relaxed),
            dropped_events: m.dropped_events.load(Ordering::Relaxed),
        }
    }

    fn is_local(&self, endpoint: &Endpoint) -> bool {
        endpoint == &self.local_endpoint
    }

    fn sink_listener(
        &self,
        instance_id: &FragmentInstanceId,
        handle_id: u64,
        context: Arc<dyn InstanceContext>,
    ) -> SinkListener {
        SinkListener::Fragment {
            registry: Arc::downgrade(&self.registry),
            instance_id: instance_id.clone(),
            handle_id,
            context,
        }
    }

    fn source_listener(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
        handle_id: u64,
        on_failure: FailureCallback,
    ) -> SourceListener {
        SourceListener::Fragment {
            registry: Arc::downgrade(&self.registry),
            instance_id: instance_id.clone(),
            plan_node_id: plan_node_id.clone(),
            handle_id,
            on_failure,
        }
    }

    fn already_exists_sink(instance_id: &FragmentInstanceId) -> ExchangeError {
        ExchangeError::AlreadyExists(format!("sink handle for {}", instance_id))
    }

    fn already_exists_source(
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> ExchangeError {
        ExchangeError::AlreadyExists(format!(
            "source handle for {} plan node {}",
            instance_id, plan_node_id
        ))
    }

    /// Sink of `local_instance_id` feeding the co-located consumer
    /// `(remote_instance_id, remote_plan_node_id)`.
    pub fn create_local_sink_handle(
        &self,
        local_instance_id: &FragmentInstanceId,
        remote_instance_id: &FragmentInstanceId,
        remote_plan_node_id: &PlanNodeId,
        context: Arc<dyn InstanceContext>,
    ) -> ExchangeResult<Arc<LocalSinkHandle>> {
        let mut guard = self.registry.lock();
        if guard.sinks.contains_key(local_instance_id) {
            return Err(Self::already_exists_sink(local_instance_id));
        }
        let queue = match guard.queue_of_local_source(
            remote_instance_id,
            remote_plan_node_id,
            local_instance_id,
        ) {
            Some(queue) => {
                debug!("local sink reuses queue of existing source: queue={}", queue.full_id());
                queue
            }
            None => SharedBlockQueue::new(
                remote_instance_id.clone(),
                remote_plan_node_id.clone(),
                &self.memory_pool,
            ),
        };
        let handle_id = next_handle_id();
        let listener = self.sink_listener(local_instance_id, handle_id, context);
        let sink = LocalSinkHandle::new(handle_id, local_instance_id.clone(), queue, listener);
        guard
            .sinks
            .insert(local_instance_id.clone(), SinkHandle::Local(Arc::clone(&sink)));
        Ok(sink)
    }

    /// Sink of `local_instance_id` distributing blocks over `locations`.
    /// Channels whose endpoint is this node go through a shared queue.
    pub fn create_shuffle_sink_handle(
        &self,
        local_instance_id: &FragmentInstanceId,
        locations: Vec<DownstreamChannelLocation>,
        channel_index: DownstreamChannelIndex,
        strategy: ShuffleStrategy,
        context: Arc<dyn InstanceContext>,
    ) -> ExchangeResult<Arc<ShuffleSinkHandle>> {
        if locations.is_empty() {
            return Err(ExchangeError::InvalidState(format!(
                "shuffle sink for {} has no downstream channel",
                local_instance_id
            )));
        }
        let mut guard = self.registry.lock();
        if guard.sinks.contains_key(local_instance_id) {
            return Err(Self::already_exists_sink(local_instance_id));
        }
        let routes: Vec<ChannelRoute> = locations
            .iter()
            .map(|location| {
                if !self.is_local(&location.remote_endpoint) {
                    return ChannelRoute::Remote;
                }
                let queue = guard
                    .queue_of_local_source(
                        &location.remote_fragment_instance_id,
                        &location.remote_plan_node_id,
                        local_instance_id,
                    )
                    .unwrap_or_else(|| {
                        SharedBlockQueue::new(
                            location.remote_fragment_instance_id.clone(),
                            location.remote_plan_node_id.clone(),
                            &self.memory_pool,
                        )
                    });
                ChannelRoute::Local(queue)
            })
            .collect();
        let handle_id = next_handle_id();
        let listener = self.sink_listener(local_instance_id, handle_id, context);
        let sink = ShuffleSinkHandle::new(
            handle_id,
            local_instance_id.clone(),
            locations,
            routes,
            channel_index,
            strategy,
            Arc::clone(&self.transport),
            &self.memory_pool,
            listener,
        );
        guard
            .sinks
            .insert(local_instance_id.clone(), SinkHandle::Shuffle(Arc::clone(&sink)));
        Ok(sink)
    }

    /// Single-target sink: a local sink when the consumer is on this node,
    /// otherwise a one-channel shuffle sink over the transport.
    pub fn create_sink_handle(
        &self,
        local_instance_id: &FragmentInstanceId,
        target: DownstreamChannelLocation,
        context: Arc<dyn InstanceContext>,
    ) -> ExchangeResult<SinkHandle> {
        if self.is_local(&target.remote_endpoint) {
            return self
                .create_local_sink_handle(
                    local_instance_id,
                    &target.remote_fragment_instance_id,
                    &target.remote_plan_node_id,
                    context,
                )
                .map(SinkHandle::Local);
        }
        self.create_shuffle_sink_handle(
            local_instance_id,
            vec![target],
            DownstreamChannelIndex::new(0),
            ShuffleStrategy::Plain,
            context,
        )
        .map(SinkHandle::Shuffle)
    }

    /// Unregistered local sink for a producer and consumer inside one instance.
    pub fn create_local_sink_handle_for_pipeline(
        &self,
        local_instance_id: &FragmentInstanceId,
        local_plan_node_id: &PlanNodeId,
        context: Arc<dyn InstanceContext>,
    ) -> Arc<LocalSinkHandle> {
        let queue = SharedBlockQueue::new(
            local_instance_id.clone(),
            local_plan_node_id.clone(),
            &self.memory_pool,
        );
        LocalSinkHandle::new(
            next_handle_id(),
            local_instance_id.clone(),
            queue,
            SinkListener::Pipeline { context },
        )
    }

    /// Unregistered local source reading `queue`, which came from a pipeline sink.
    pub fn create_local_source_handle_for_pipeline(
        &self,
        queue: Arc<SharedBlockQueue>,
        on_failure: FailureCallback,
    ) -> Arc<LocalSourceHandle> {
        let instance_id = queue.consumer_instance_id().clone();
        let plan_node_id = queue.consumer_plan_node_id().clone();
        LocalSourceHandle::new(
            next_handle_id(),
            instance_id.clone(),
            plan_node_id,
            instance_id,
            queue,
            SourceListener::Pipeline { on_failure },
        )
    }

    /// Source at `(local_instance_id, local_plan_node_id)` reading from the
    /// co-located producer `remote_instance_id`.
    pub fn create_local_source_handle(
        &self,
        local_instance_id: &FragmentInstanceId,
        local_plan_node_id: &PlanNodeId,
        remote_instance_id: &FragmentInstanceId,
        on_failure: FailureCallback,
    ) -> ExchangeResult<Arc<LocalSourceHandle>> {
        let mut guard = self.registry.lock();
        if guard.source(local_instance_id, local_plan_node_id).is_some() {
            return Err(Self::already_exists_source(local_instance_id, local_plan_node_id));
        }
        let queue = match guard.queue_of_sink(
            remote_instance_id,
            local_instance_id,
            local_plan_node_id,
        ) {
            Some(queue) => {
                debug!("local source reuses queue of existing sink: queue={}", queue.full_id());
                queue
            }
            None => SharedBlockQueue::new(
                local_instance_id.clone(),
                local_plan_node_id.clone(),
                &self.memory_pool,
            ),
        };
        let handle_id = next_handle_id();
        let listener =
            self.source_listener(local_instance_id, local_plan_node_id, handle_id, on_failure);
        let source = LocalSourceHandle::new(
            handle_id,
            local_instance_id.clone(),
            local_plan_node_id.clone(),
            remote_instance_id.clone(),
            queue,
            listener,
        );
        guard
            .sources
            .entry(local_instance_id.clone())
            .or_default()
            .insert(local_plan_node_id.clone(), SourceHandle::Local(Arc::clone(&source)));
        Ok(source)
    }

    /// Source pulling channel `channel_index` of the sink in `remote_instance_id`
    /// at `remote_endpoint` over the transport.
    pub fn create_remote_source_handle(
        &self,
        local_instance_id: &FragmentInstanceId,
        local_plan_node_id: &PlanNodeId,
        remote_endpoint: &Endpoint,
        remote_instance_id: &FragmentInstanceId,
        channel_index: i32,
        on_failure: FailureCallback,
    ) -> ExchangeResult<Arc<RemoteSourceHandle>> {
        let mut guard = self.registry.lock();
        if guard.source(local_instance_id, local_plan_node_id).is_some() {
            return Err(Self::already_exists_source(local_instance_id, local_plan_node_id));
        }
        let handle_id = next_handle_id();
        let listener =
            self.source_listener(local_instance_id, local_plan_node_id, handle_id, on_failure);
        let source = RemoteSourceHandle::new(
            handle_id,
            local_instance_id.clone(),
            local_plan_node_id.clone(),
            remote_endpoint.clone(),
            remote_instance_id.clone(),
            channel_index,
            Arc::clone(&self.transport),
            &self.memory_pool,
            listener,
        );
        guard
            .sources
            .entry(local_instance_id.clone())
            .or_default()
            .insert(local_plan_node_id.clone(), SourceHandle::Remote(Arc::clone(&source)));
        Ok(source)
    }

    /// Local source when the producer runs on this node, remote otherwise.
    pub fn create_source_handle(
        &self,
        local_instance_id: &FragmentInstanceId,
        local_plan_node_id: &PlanNodeId,
        remote_endpoint: &Endpoint,
        remote_instance_id: &FragmentInstanceId,
        channel_index: i32,
        on_failure: FailureCallback,
    ) -> ExchangeResult<SourceHandle> {
        if self.is_local(remote_endpoint) {
            return self
                .create_local_source_handle(
                    local_instance_id,
                    local_plan_node_id,
                    remote_instance_id,
                    on_failure,
                )
                .map(SourceHandle::Local);
        }
        self.create_remote_source_handle(
            local_instance_id,
            local_plan_node_id,
            remote_endpoint,
            remote_instance_id,
            channel_index,
            on_failure,
        )
        .map(SourceHandle::Remote)
    }

    /// Abort and remove every handle of `instance_id`. Returns how many handles
    /// were torn down.
    pub fn force_deregister_fragment_instance(&self, instance_id: &FragmentInstanceId) -> usize {
        let (sink, sources) = self.registry.take_instance(instance_id);
        let count = sources.len() + usize::from(sink.is_some());
        if let Some(sink) = sink {
            sink.abort();
        }
        for source in sources {
            source.abort();
        }
        if count > 0 {
            info!(
                "force deregistered fragment instance: instance={} handles={}",
                instance_id, count
            );
        }
        count
    }

    fn drop_event(&self, kind: &str, detail: std::fmt::Arguments<'_>) {
        self.metrics.dropped_events.fetch_add(1, Ordering::Relaxed);
        debug!("{} event dropped: {}", kind, detail);
    }

    /// Serve a fetch for blocks of the sink in `source_fragment_instance_id`.
    pub fn get_data_blocks(
        &self,
        request: &GetDataBlocksRequest,
    ) -> ExchangeResult<Vec<DataBlock>> {
        self.metrics.fetch_requests.fetch_add(1, Ordering::Relaxed);
        let sink = self
            .registry
            .sink(&request.source_fragment_instance_id)
            .ok_or_else(|| {
                ExchangeError::SinkNotFound(request.source_fragment_instance_id.full_id())
            })?;
        let blocks = match sink {
            SinkHandle::Shuffle(sink) => sink.get_data_blocks(
                request.channel_index,
                request.start_sequence_id,
                request.end_sequence_id,
            ),
            SinkHandle::Local(sink) => Err(ExchangeError::InvalidState(format!(
                "{} is a local sink and cannot serve fetches",
                sink.full_id()
            ))),
        };
        match blocks {
            Ok(blocks) => {
                self.metrics
                    .fetched_blocks
                    .fetch_add(blocks.len() as u64, Ordering::Relaxed);
                Ok(blocks)
            }
            Err(err) => {
                warn!(
                    "get data blocks failed: instance={} range=[{}, {}) error={}",
                    request.source_fragment_instance_id,
                    request.start_sequence_id,
                    request.end_sequence_id,
                    err
                );
                Err(err)
            }
        }
    }

    pub fn on_acknowledge_data_block_event(&self, event: &AcknowledgeDataBlockEvent) {
        self.metrics.acknowledge_events.fetch_add(1, Ordering::Relaxed);
        match self.registry.sink(&event.source_fragment_instance_id) {
            Some(SinkHandle::Shuffle(sink)) => sink.acknowledge(
                event.channel_index,
                event.start_sequence_id,
                event.end_sequence_id,
            ),
            _ => self.drop_event(
                "acknowledge",
                format_args!(
                    "no remote sink for {} range=[{}, {})",
                    event.source_fragment_instance_id,
                    event.start_sequence_id,
                    event.end_sequence_id
                ),
            ),
        }
    }

    fn remote_source(
        &self,
        instance_id: &FragmentInstanceId,
        plan_node_id: &PlanNodeId,
    ) -> Option<Arc<RemoteSourceHandle>> {
        match self.registry.source(instance_id, plan_node_id) {
            Some(SourceHandle::Remote(source)) if !source.state().is_terminal() => Some(source),
            _ => None,
        }
    }

    pub fn on_new_data_block_event(&self, event: &NewDataBlockEvent) {
        self.metrics.new_data_block_events.fetch_add(1, Ordering::Relaxed);
        match self.remote_source(&event.target_fragment_instance_id, &event.target_plan_node_id) {
            Some(source) => {
                source.update_pending_data_block_info(event.start_sequence_id, &event.block_sizes)
            }
            None => self.drop_event(
                "new data block",
                format_args!(
                    "no active source for {} plan node {} start={}",
                    event.target_fragment_instance_id,
                    event.target_plan_node_id,
                    event.start_sequence_id
                ),
            ),
        }
    }

    pub fn on_end_of_data_block_event(&self, event: &EndOfDataBlockEvent) {
        self.metrics
            .end_of_data_block_events
            .fetch_add(1, Ordering::Relaxed);
        match self.remote_source(&event.target_fragment_instance_id, &event.target_plan_node_id) {
            Some(source) => source.set_no_more_blocks(event.last_sequence_id),
            None => self.drop_event(
                "end of data block",
                format_args!(
                    "no active source for {} plan node {} last={}",
                    event.target_fragment_instance_id,
                    event.target_plan_node_id,
                    event.last_sequence_id
                ),
            ),
        }
    }
}
