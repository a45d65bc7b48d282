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
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock};

use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::common::config::exchange_max_message_bytes;
use crate::exchange::error::ExchangeError;
use crate::exchange::manager::ExchangeManager;
use crate::exchange::protocol::{
    AcknowledgeDataBlockEvent, EndOfDataBlockEvent, GetDataBlocksRequest, NewDataBlockEvent,
};
use crate::mpp_logging::{debug, error, info};
use crate::service::proto::mpp_exchange::data_exchange_service_server::{
    DataExchangeService, DataExchangeServiceServer,
};
use crate::service::proto::mpp_exchange::{
    PAcknowledgeDataBlockEvent, PEndOfDataBlockEvent, PEventResult, PGetDataBlockRequest,
    PGetDataBlockResponse, PNewDataBlockEvent,
};

/// Inbound side of the exchange protocol. Every call is forwarded to the
/// local `ExchangeManager`.
pub struct DataExchangeGrpcService {
    manager: Arc<ExchangeManager>,
}

impl DataExchangeGrpcService {
    pub fn new(manager: Arc<ExchangeManager>) -> Self {
        Self { manager }
    }

    pub fn into_server(self) -> DataExchangeServiceServer<Self> {
        let max_message_bytes = exchange_max_message_bytes();
        DataExchangeServiceServer::new(self)
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes)
    }
}

fn error_to_status(err: ExchangeError) -> Status {
    match err {
        ExchangeError::SinkNotFound(_) => Status::not_found(err.to_string()),
        ExchangeError::BlockNotFound(_) => Status::out_of_range(err.to_string()),
        ExchangeError::InvalidState(_) => Status::invalid_argument(err.to_string()),
        ExchangeError::Aborted(_) => Status::aborted(err.to_string()),
        ExchangeError::Timeout(_) => Status::deadline_exceeded(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl DataExchangeService for DataExchangeGrpcService {
    async fn get_data_block(
        &self,
        request: Request<PGetDataBlockRequest>,
    ) -> Result<Response<PGetDataBlockResponse>, Status> {
        let request =
            GetDataBlocksRequest::try_from(request.into_inner()).map_err(error_to_status)?;
        let blocks = self
            .manager
            .get_data_blocks(&request)
            .map_err(error_to_status)?;
        debug!(
            "GetDataBlock served: source={} channel={} range=[{}, {}) blocks={}",
            request.source_fragment_instance_id,
            request.channel_index,
            request.start_sequence_id,
            request.end_sequence_id,
            blocks.len()
        );
        Ok(Response::new(blocks.into()))
    }

    async fn on_acknowledge_data_block_event(
        &self,
        request: Request<PAcknowledgeDataBlockEvent>,
    ) -> Result<Response<PEventResult>, Status> {
        let event =
            AcknowledgeDataBlockEvent::try_from(request.into_inner()).map_err(error_to_status)?;
        self.manager.on_acknowledge_data_block_event(&event);
        Ok(Response::new(PEventResult {}))
    }

    async fn on_new_data_block_event(
        &self,
        request: Request<PNewDataBlockEvent>,
    ) -> Result<Response<PEventResult>, Status> {
        let event = NewDataBlockEvent::try_from(request.into_inner()).map_err(error_to_status)?;
        self.manager.on_new_data_block_event(&event);
        Ok(Response::new(PEventResult {}))
    }

    async fn on_end_of_data_block_event(
        &self,
        request: Request<PEndOfDataBlockEvent>,
    ) -> Result<Response<PEventResult>, Status> {
        let event = EndOfDataBlockEvent::try_from(request.into_inner()).map_err(error_to_status)?;
        self.manager.on_end_of_data_block_event(&event);
        Ok(Response::new(PEventResult {}))
    }
}

/// Start the exchange gRPC server on a background thread with its own runtime.
///
/// Binding is checked up front so a busy port fails the caller instead of the
/// server thread.
pub fn start_data_exchange_server(
    manager: Arc<ExchangeManager>,
    host: &str,
    port: u16,
) -> Result<(), String> {
    static STARTED: OnceLock<()> = OnceLock::new();
    if STARTED.get().is_some() {
        return Ok(());
    }

    let addr = ensure_bindable(host, port, "data exchange grpc")?;
    STARTED
        .set(())
        .map_err(|_| "data exchange grpc server already started".to_string())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(8)
        .thread_name("exchange_grpc")
        .build()
        .map_err(|e| format!("build grpc server runtime failed: {e}"))?;

    std::thread::Builder::new()
        .name("exchange_grpc_main".to_string())
        .spawn(move || {
            info!(
                target: "mpp_exchange::grpc",
                addr = %addr,
                local_endpoint = %manager.local_endpoint(),
                "starting data exchange grpc server"
            );
            rt.block_on(async move {
                let svc = DataExchangeGrpcService::new(manager).into_server();
                if let Err(e) = Server::builder().add_service(svc).serve(addr).await {
                    error!(
                        target: "mpp_exchange::grpc",
                        error = %e,
                        addr = %addr,
                        "data exchange grpc server stopped"
                    );
                }
            });
        })
        .map_err(|e| format!("spawn grpc server thread failed: {e}"))?;
    Ok(())
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_with_listener(
    manager: Arc<ExchangeManager>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    let svc = DataExchangeGrpcService::new(manager).into_server();
    Server::builder()
        .add_service(svc)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}

fn ensure_bindable(host: &str, port: u16, role: &str) -> Result<SocketAddr, String> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| format!("parse {role} bind addr failed: {e}"))?;
    let listener = TcpListener::bind(addr)
        .map_err(|e| format!("failed to bind {role} listener on {addr}: {e}"))?;
    drop(listener);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::{ensure_bindable, error_to_status};
    use crate::exchange::error::ExchangeError;
    use std::net::TcpListener;
    use tonic::Code;

    #[test]
    fn test_ensure_bindable_fails_for_occupied_port() {
        let occupied = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral test port");
        let occupied_port = occupied.local_addr().expect("get local addr").port();
        let err = ensure_bindable("127.0.0.1", occupied_port, "unit-test")
            .expect_err("expected bind failure");
        assert!(err.contains("failed to bind"));
        drop(occupied);
    }

    #[test]
    fn test_ensure_bindable_rejects_bad_host() {
        let err = ensure_bindable("not a host", 1, "unit-test").expect_err("expected parse error");
        assert!(err.contains("parse unit-test bind addr failed"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_to_status(ExchangeError::SinkNotFound("x".into())).code(),
            Code::NotFound
        );
        assert_eq!(
            error_to_status(ExchangeError::InvalidState("x".into())).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            error_to_status(ExchangeError::BlockNotFound("x".into())).code(),
            Code::OutOfRange
        );
        assert_eq!(
            error_to_status(ExchangeError::Failed("x".into())).code(),
            Code::Internal
        );
    }
}
