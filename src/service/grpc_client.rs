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
//! gRPC implementation of `ExchangeTransport`.
//!
//! Responsibilities:
//! - Keeps one cached `Channel` per peer endpoint.
//! - Runs calls on a dedicated tokio runtime so io executor threads can block
//!   on them.
//! - Applies the per-call timeout and bounded retry from `[exchange]` config.
//!   Retries stay here; handles never retry on their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tonic::transport::Channel;
use tonic::{Code, Status};

use crate::common::config::{
    exchange_max_message_bytes, exchange_rpc_connect_timeout_ms, exchange_rpc_retry_interval_ms,
    exchange_rpc_retry_times, exchange_rpc_timeout_ms,
};
use crate::common::ids::Endpoint;
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::protocol::{
    AcknowledgeDataBlockEvent, EndOfDataBlockEvent, GetDataBlocksRequest, NewDataBlockEvent,
};
use crate::exchange::transport::ExchangeTransport;
use crate::mpp_logging::{debug, warn};
use crate::service::proto::mpp_exchange::data_exchange_service_client::DataExchangeServiceClient;
use crate::service::proto::mpp_exchange::{
    PAcknowledgeDataBlockEvent, PEndOfDataBlockEvent, PGetDataBlockRequest, PNewDataBlockEvent,
};

type ExchangeClient = DataExchangeServiceClient<Channel>;

fn client_runtime() -> &'static tokio::runtime::Runtime {
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RT.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(4)
            .thread_name("exchange_rpc")
            .build()
            .expect("build tokio runtime")
    })
}

#[derive(Clone, Debug)]
pub struct GrpcTransportOptions {
    pub rpc_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry_times: u32,
    pub retry_interval: Duration,
    pub max_message_bytes: usize,
}

impl GrpcTransportOptions {
    pub fn from_config() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(exchange_rpc_timeout_ms()),
            connect_timeout: Duration::from_millis(exchange_rpc_connect_timeout_ms()),
            retry_times: exchange_rpc_retry_times(),
            retry_interval: Duration::from_millis(exchange_rpc_retry_interval_ms()),
            max_message_bytes: exchange_max_message_bytes(),
        }
    }
}

pub struct GrpcTransport {
    options: GrpcTransportOptions,
    channels: Mutex<HashMap<Endpoint, Channel>>,
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new(GrpcTransportOptions::from_config())
    }
}

impl GrpcTransport {
    pub fn new(options: GrpcTransportOptions) -> Self {
        Self {
            options,
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn channel(&self, endpoint: &Endpoint) -> ExchangeResult<Channel> {
        if let Some(ch) = self
            .channels
            .lock()
            .expect("channel cache lock")
            .get(endpoint)
            .cloned()
        {
            return Ok(ch);
        }

        debug!("creating exchange channel: endpoint={}", endpoint);
        let ch = tonic::transport::Endpoint::from_shared(format!("http://{}", endpoint))
            .map_err(|e| ExchangeError::Transport(format!("invalid endpoint {}: {}", endpoint, e)))?
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(self.options.rpc_timeout)
            .connect_timeout(self.options.connect_timeout)
            .connect()
            .await
            .map_err(|e| {
                ExchangeError::Transport(format!(
                    "connect exchange endpoint {} failed: {}",
                    endpoint, e
                ))
            })?;

        self.channels
            .lock()
            .expect("channel cache lock")
            .insert(endpoint.clone(), ch.clone());
        Ok(ch)
    }

    fn evict(&self, endpoint: &Endpoint) {
        self.channels
            .lock()
            .expect("channel cache lock")
            .remove(endpoint);
    }

    fn client(&self, ch: Channel) -> ExchangeClient {
        DataExchangeServiceClient::new(ch)
            .max_encoding_message_size(self.options.max_message_bytes)
            .max_decoding_message_size(self.options.max_message_bytes)
    }

    /// Run `call` with retries on transport-level failures.
    fn call<T, F, Fut>(&self, endpoint: &Endpoint, name: &str, call: F) -> ExchangeResult<T>
    where
        F: Fn(ExchangeClient) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        client_runtime().block_on(async {
            let mut attempt = 0u32;
            loop {
                let result = match self.channel(endpoint).await {
                    Ok(ch) => call(self.client(ch)).await.map_err(|status| {
                        if matches!(status.code(), Code::Unavailable | Code::Unknown) {
                            self.evict(endpoint);
                        }
                        status_to_error(endpoint, name, status)
                    }),
                    Err(err) => Err(err),
                };
                match result {
                    Err(err) if err.is_retryable() && attempt < self.options.retry_times => {
                        attempt += 1;
                        warn!(
                            "exchange rpc retry: rpc={} dest={} attempt={} error={}",
                            name, endpoint, attempt, err
                        );
                        tokio::time::sleep(self.options.retry_interval).await;
                    }
                    other => return other,
                }
            }
        })
    }
}

fn status_to_error(endpoint: &Endpoint, name: &str, status: Status) -> ExchangeError {
    let message = format!("{} to {}: {}", name, endpoint, status.message());
    match status.code() {
        Code::NotFound => ExchangeError::SinkNotFound(message),
        Code::DeadlineExceeded => ExchangeError::Timeout(message),
        Code::Aborted | Code::Cancelled => ExchangeError::Aborted(message),
        Code::OutOfRange => ExchangeError::BlockNotFound(message),
        Code::FailedPrecondition | Code::InvalidArgument => ExchangeError::InvalidState(message),
        _ => ExchangeError::Transport(message),
    }
}

impl ExchangeTransport for GrpcTransport {
    fn get_data_blocks(
        &self,
        endpoint: &Endpoint,
        request: GetDataBlocksRequest,
    ) -> ExchangeResult<Vec<DataBlock>> {
        let req = PGetDataBlockRequest::from(&request);
        self.call(endpoint, "GetDataBlock", |mut cli| {
            let req = req.clone();
            async move {
                cli.get_data_block(req)
                    .await
                    .map(|resp| Vec::<DataBlock>::from(resp.into_inner()))
            }
        })
    }

    fn send_acknowledge_event(
        &self,
        endpoint: &Endpoint,
        event: AcknowledgeDataBlockEvent,
    ) -> ExchangeResult<()> {
        let req = PAcknowledgeDataBlockEvent::from(&event);
        self.call(endpoint, "OnAcknowledgeDataBlockEvent", |mut cli| {
            let req = req.clone();
            async move { cli.on_acknowledge_data_block_event(req).await.map(|_| ()) }
        })
    }

    fn send_new_data_block_event(
        &self,
        endpoint: &Endpoint,
        event: NewDataBlockEvent,
    ) -> ExchangeResult<()> {
        let req = PNewDataBlockEvent::from(&event);
        self.call(endpoint, "OnNewDataBlockEvent", |mut cli| {
            let req = req.clone();
            async move { cli.on_new_data_block_event(req).await.map(|_| ()) }
        })
    }

    fn send_end_of_data_block_event(
        &self,
        endpoint: &Endpoint,
        event: EndOfDataBlockEvent,
    ) -> ExchangeResult<()> {
        let req = PEndOfDataBlockEvent::from(&event);
        self.call(endpoint, "OnEndOfDataBlockEvent", |mut cli| {
            let req = req.clone();
            async move { cli.on_end_of_data_block_event(req).await.map(|_| ()) }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{GrpcTransport, GrpcTransportOptions};
    use crate::common::ids::{Endpoint, FragmentInstanceId};
    use crate::exchange::error::ExchangeError;
    use crate::exchange::protocol::AcknowledgeDataBlockEvent;
    use crate::exchange::transport::ExchangeTransport;

    #[test]
    fn unreachable_peer_surfaces_transport_error_after_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = GrpcTransport::new(GrpcTransportOptions {
            rpc_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            retry_times: 2,
            retry_interval: Duration::from_millis(10),
            max_message_bytes: 1024 * 1024,
        });
        let err = transport
            .send_acknowledge_event(
                &Endpoint::new("127.0.0.1", port),
                AcknowledgeDataBlockEvent {
                    source_fragment_instance_id: FragmentInstanceId::new("q", 1, "0"),
                    channel_index: 0,
                    start_sequence_id: 0,
                    end_sequence_id: 1,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));
    }
}
