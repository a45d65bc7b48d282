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
//! Ordered delivery of one-way protocol events.
//!
//! Events for the same stream (destination endpoint plus stream label) are
//! sent one after another on the io executor so a source never observes an
//! end-of-blocks before the new-block events that precede it. Different
//! streams proceed in parallel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use crate::common::ids::Endpoint;
use crate::exchange::error::ExchangeResult;
use crate::exchange::protocol::{AcknowledgeDataBlockEvent, EndOfDataBlockEvent, NewDataBlockEvent};
use crate::exchange::transport::ExchangeTransport;
use crate::mpp_logging::{debug, warn};
use crate::runtime::io::io_executor;

#[derive(Clone, Debug)]
pub enum ExchangeEvent {
    Acknowledge(AcknowledgeDataBlockEvent),
    NewDataBlock(NewDataBlockEvent),
    EndOfDataBlock(EndOfDataBlockEvent),
}

impl ExchangeEvent {
    fn kind(&self) -> &'static str {
        match self {
            ExchangeEvent::Acknowledge(_) => "acknowledge",
            ExchangeEvent::NewDataBlock(_) => "new_data_block",
            ExchangeEvent::EndOfDataBlock(_) => "end_of_data_block",
        }
    }
}

/// Invoked on the io executor with the outcome of one delivery.
pub type EventCompletion = Box<dyn FnOnce(ExchangeResult<()>) + Send + 'static>;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct EventStreamKey {
    endpoint: Endpoint,
    stream: String,
}

struct QueuedEvent {
    transport: Arc<dyn ExchangeTransport>,
    event: ExchangeEvent,
    on_complete: Option<EventCompletion>,
}

type EventQueues = Arc<Mutex<HashMap<EventStreamKey, VecDeque<QueuedEvent>>>>;

pub struct ExchangeEventQueue {
    queues: EventQueues,
    inflight: Arc<AtomicUsize>,
}

impl ExchangeEventQueue {
    fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of events accepted but not yet completed.
    pub fn inflight_events(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn submit(
        &self,
        transport: Arc<dyn ExchangeTransport>,
        endpoint: &Endpoint,
        stream: &str,
        event: ExchangeEvent,
        on_complete: Option<EventCompletion>,
    ) {
        let key = EventStreamKey {
            endpoint: endpoint.clone(),
            stream: stream.to_string(),
        };
        let queued = QueuedEvent {
            transport,
            event,
            on_complete,
        };
        self.inflight.fetch_add(1, Ordering::AcqRel);

        let mut start_now = None;
        {
            let mut guard = self.queues.lock().expect("exchange event queue lock");
            if let Some(queue) = guard.get_mut(&key) {
                queue.push_back(queued);
            } else {
                guard.insert(key.clone(), VecDeque::new());
                start_now = Some(queued);
            }
        }

        if let Some(queued) = start_now {
            spawn_event_task(
                Arc::clone(&self.inflight),
                Arc::clone(&self.queues),
                key,
                queued,
            );
        }
    }
}

fn deliver(
    endpoint: &Endpoint,
    transport: &dyn ExchangeTransport,
    event: ExchangeEvent,
) -> ExchangeResult<()> {
    match event {
        ExchangeEvent::Acknowledge(e) => transport.send_acknowledge_event(endpoint, e),
        ExchangeEvent::NewDataBlock(e) => transport.send_new_data_block_event(endpoint, e),
        ExchangeEvent::EndOfDataBlock(e) => transport.send_end_of_data_block_event(endpoint, e),
    }
}

fn run_event_task(key: &EventStreamKey, queued: QueuedEvent, inflight: &AtomicUsize) {
    let start = Instant::now();
    let kind = queued.event.kind();
    let result = deliver(&key.endpoint, queued.transport.as_ref(), queued.event);
    match &result {
        Ok(()) => debug!(
            "exchange event sent: kind={} dest={} stream={} elapsed_us={}",
            kind,
            key.endpoint,
            key.stream,
            start.elapsed().as_micros()
        ),
        Err(err) => warn!(
            "exchange event failed: kind={} dest={} stream={} error={}",
            kind, key.endpoint, key.stream, err
        ),
    }
    if let Some(on_complete) = queued.on_complete {
        on_complete(result);
    }
    inflight.fetch_sub(1, Ordering::AcqRel);
}

fn spawn_event_task(
    inflight: Arc<AtomicUsize>,
    queues: EventQueues,
    key: EventStreamKey,
    queued: QueuedEvent,
) {
    io_executor().submit(move |_ctx| {
        run_event_task(&key, queued, &inflight);
        on_task_complete(inflight, queues, key);
    });
}

fn on_task_complete(inflight: Arc<AtomicUsize>, queues: EventQueues, key: EventStreamKey) {
    let next = {
        let mut guard = queues.lock().expect("exchange event queue lock");
        let Some(queue) = guard.get_mut(&key) else {
            return;
        };
        if let Some(next) = queue.pop_front() {
            Some(next)
        } else {
            guard.remove(&key);
            None
        }
    };

    if let Some(queued) = next {
        spawn_event_task(inflight, queues, key, queued);
    }
}

static EVENT_QUEUE: OnceLock<ExchangeEventQueue> = OnceLock::new();

pub fn exchange_event_queue() -> &'static ExchangeEventQueue {
    EVENT_QUEUE.get_or_init(ExchangeEventQueue::new)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{ExchangeEvent, exchange_event_queue};
    use crate::common::ids::{Endpoint, FragmentInstanceId, PlanNodeId};
    use crate::exchange::data_block::DataBlock;
    use crate::exchange::error::{ExchangeError, ExchangeResult};
    use crate::exchange::protocol::{
        AcknowledgeDataBlockEvent, EndOfDataBlockEvent, GetDataBlocksRequest, NewDataBlockEvent,
    };
    use crate::exchange::transport::ExchangeTransport;

    #[derive(Default)]
    struct SlowRecorder {
        seen: Mutex<Vec<i64>>,
    }

    impl ExchangeTransport for SlowRecorder {
        fn get_data_blocks(
            &self,
            _endpoint: &Endpoint,
            _request: GetDataBlocksRequest,
        ) -> ExchangeResult<Vec<DataBlock>> {
            Err(ExchangeError::Transport("unused".into()))
        }

        fn send_acknowledge_event(
            &self,
            _endpoint: &Endpoint,
            _event: AcknowledgeDataBlockEvent,
        ) -> ExchangeResult<()> {
            Ok(())
        }

        fn send_new_data_block_event(
            &self,
            _endpoint: &Endpoint,
            event: NewDataBlockEvent,
        ) -> ExchangeResult<()> {
            std::thread::sleep(Duration::from_millis(5));
            self.seen.lock().unwrap().push(event.start_sequence_id);
            Ok(())
        }

        fn send_end_of_data_block_event(
            &self,
            _endpoint: &Endpoint,
            event: EndOfDataBlockEvent,
        ) -> ExchangeResult<()> {
            self.seen.lock().unwrap().push(-100 - event.last_sequence_id);
            Err(ExchangeError::Transport("peer closed".into()))
        }
    }

    #[test]
    fn events_of_one_stream_are_delivered_in_order() {
        let transport = Arc::new(SlowRecorder::default());
        let endpoint = Endpoint::new("127.0.0.1", 1);
        let target = FragmentInstanceId::new("q", 2, "0");
        let source = FragmentInstanceId::new("q", 1, "0");
        for seq in 0..5 {
            exchange_event_queue().submit(
                transport.clone(),
                &endpoint,
                "q.1.0.SinkHandle",
                ExchangeEvent::NewDataBlock(NewDataBlockEvent {
                    target_fragment_instance_id: target.clone(),
                    target_plan_node_id: PlanNodeId::new("exchange_1"),
                    source_fragment_instance_id: source.clone(),
                    start_sequence_id: seq,
                    block_sizes: vec![1],
                }),
                None,
            );
        }
        let (tx, rx) = mpsc::channel();
        exchange_event_queue().submit(
            transport.clone(),
            &endpoint,
            "q.1.0.SinkHandle",
            ExchangeEvent::EndOfDataBlock(EndOfDataBlockEvent {
                target_fragment_instance_id: target,
                target_plan_node_id: PlanNodeId::new("exchange_1"),
                source_fragment_instance_id: source,
                last_sequence_id: 4,
            }),
            Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert!(matches!(result, Err(ExchangeError::Transport(_))));
        assert_eq!(*transport.seen.lock().unwrap(), vec![0, 1, 2, 3, 4, -104]);
    }
}
