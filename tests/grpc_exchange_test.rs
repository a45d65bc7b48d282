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
//! Exchange between two managers over real gRPC servers on loopback ports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::common::{MB, finst, plan_node, wait_until};
use mpp_exchange::exchange::local_source::ExchangePopResult;
use mpp_exchange::exchange::protocol::GetDataBlocksRequest;
use mpp_exchange::exchange::shuffle_sink::DownstreamChannelLocation;
use mpp_exchange::exchange::transport::ExchangeTransport;
use mpp_exchange::runtime::fragment_context::{FragmentInstanceContext, InstanceState};
use mpp_exchange::runtime::memory_pool::MemoryPool;
use mpp_exchange::service::grpc_client::{GrpcTransport, GrpcTransportOptions};
use mpp_exchange::service::grpc_server::serve_with_listener;
use mpp_exchange::{DataBlock, Endpoint, ExchangeError, ExchangeManager};

#[macro_use]
mod common;

const WAIT: Duration = Duration::from_secs(20);

struct GrpcNode {
    manager: Arc<ExchangeManager>,
    transport: Arc<GrpcTransport>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for GrpcNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn transport_options() -> GrpcTransportOptions {
    GrpcTransportOptions {
        rpc_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        retry_times: 2,
        retry_interval: Duration::from_millis(20),
        max_message_bytes: 16 * 1024 * 1024,
    }
}

fn start_node(rt: &tokio::runtime::Runtime, name: &str) -> GrpcNode {
    let listener = rt
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .expect("bind exchange listener");
    let port = listener.local_addr().expect("listener addr").port();
    let transport = Arc::new(GrpcTransport::new(transport_options()));
    let manager = ExchangeManager::new(
        Endpoint::new("127.0.0.1", port),
        MemoryPool::new(format!("{name}.exchange"), 64 * MB, 32 * MB),
        transport.clone(),
    );
    let (tx, rx) = oneshot::channel::<()>();
    rt.spawn(serve_with_listener(manager.clone(), listener, async move {
        let _ = rx.await;
    }));
    GrpcNode {
        manager,
        transport,
        shutdown: Some(tx),
    }
}

#[test]
fn test_grpc_remote_stream_end_to_end() {
    let rt = tokio::runtime::Runtime::new().expect("build test runtime");
    let node_a = start_node(&rt, "grpc_a");
    let node_b = start_node(&rt, "grpc_b");

    let producer = finst("grpc_stream", 1, "0");
    let consumer = finst("grpc_stream", 2, "0");
    let plan = plan_node("exchange_1");

    let consumer_ctx = FragmentInstanceContext::new(consumer.clone());
    let source = assert_ok!(node_b.manager.create_source_handle(
        &consumer,
        &plan,
        node_a.manager.local_endpoint(),
        &producer,
        0,
        consumer_ctx.failure_callback(),
    ));
    let producer_ctx = FragmentInstanceContext::new(producer.clone());
    let sink = assert_ok!(node_a.manager.create_sink_handle(
        &producer,
        DownstreamChannelLocation::new(
            node_b.manager.local_endpoint().clone(),
            consumer.clone(),
            plan.clone(),
        ),
        producer_ctx.clone(),
    ));

    let expected: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 100 * (i as usize + 1)]).collect();
    for payload in &expected {
        assert_ok!(sink.send(DataBlock::new(payload.clone())));
    }
    sink.set_no_more_blocks();

    let mut received = Vec::new();
    loop {
        match assert_ok!(source.receive_timeout(WAIT)) {
            ExchangePopResult::Block(block) => received.push(block.payload().to_vec()),
            ExchangePopResult::Finished(stats) => {
                assert_eq!(stats.blocks_received, 8);
                break;
            }
        }
    }
    assert_eq!(received, expected);
    assert_eq!(producer_ctx.wait_done(WAIT), Some(InstanceState::Finished));
    assert!(wait_until(
        || node_a.manager.memory_pool().reserved_bytes() == 0,
        WAIT
    ));
    assert_eq!(node_b.manager.memory_pool().reserved_bytes(), 0);
}

#[test]
fn test_grpc_fetch_from_unknown_sink_maps_to_not_found() {
    let rt = tokio::runtime::Runtime::new().expect("build test runtime");
    let node = start_node(&rt, "grpc_missing");

    let err = assert_err!(node.transport.get_data_blocks(
        node.manager.local_endpoint(),
        GetDataBlocksRequest {
            source_fragment_instance_id: finst("grpc_missing", 1, "0"),
            channel_index: 0,
            start_sequence_id: 0,
            end_sequence_id: 1,
        },
    ));
    assert!(matches!(err, ExchangeError::SinkNotFound(_)));
    assert_eq!(node.manager.metrics().fetch_requests, 1);
}
