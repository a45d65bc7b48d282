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
use std::env;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mpp_exchange::exchange::manager::ExchangeManager;
use mpp_exchange::runtime::memory_pool::MemoryPool;
use mpp_exchange::service::grpc_client::GrpcTransport;
use mpp_exchange::{Endpoint, mpp_config, mpp_logging, start_data_exchange_server};

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut idx = 1usize;
    let mut config_path: Option<String> = None;
    let mut advertise_host: Option<String> = None;
    while let Some(arg) = args.get(idx) {
        match arg.as_str() {
            "--config" | "-c" => {
                idx += 1;
                config_path = args.get(idx).cloned();
                if config_path.is_none() {
                    eprintln!("missing value for --config/-c");
                    process::exit(1);
                }
                idx += 1;
            }
            "--advertise-host" => {
                idx += 1;
                advertise_host = args.get(idx).cloned();
                if advertise_host.is_none() {
                    eprintln!("missing value for --advertise-host");
                    process::exit(1);
                }
                idx += 1;
            }
            "--help" | "-h" => {
                eprintln!("Usage: mpp-exchange [--config <path>] [--advertise-host <host>]");
                eprintln!("  --config          - TOML config file");
                eprintln!("      default: $MPP_EXCHANGE_CONFIG, then ./mpp_exchange.toml");
                eprintln!("  --advertise-host  - host peers use to reach this node");
                eprintln!("      default: server.host");
                process::exit(0);
            }
            other => {
                eprintln!("unknown arg: {other} (try --help)");
                process::exit(1);
            }
        }
    }

    let cfg = match config_path.as_deref() {
        Some(p) => mpp_config::init_from_path(p),
        None => mpp_config::init_from_env_or_default(),
    };
    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("load mpp-exchange config failed: {e:#}");
            process::exit(1);
        }
    };

    // `log_level` alone keeps dependencies at info so h2/tonic stay quiet.
    let filter = if let Some(ref f) = cfg.log_filter {
        f.clone()
    } else {
        match cfg.log_level.as_str() {
            "debug" => "info,mpp_exchange=debug".to_string(),
            "trace" => "info,mpp_exchange=trace".to_string(),
            other => other.to_string(),
        }
    };
    mpp_logging::init_with_level(&filter);

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nReceived interrupt signal, shutting down...");
        running_clone.store(false, Ordering::SeqCst);
    }) {
        eprintln!("set Ctrl-C handler failed: {e}");
        process::exit(1);
    }

    let server = &cfg.server;
    let host = advertise_host.unwrap_or_else(|| server.host.clone());
    let local_endpoint = Endpoint::new(host, server.exchange_port);
    let manager = ExchangeManager::new(
        local_endpoint.clone(),
        MemoryPool::from_config(),
        Arc::new(GrpcTransport::default()),
    );

    if let Err(e) =
        start_data_exchange_server(manager.clone(), &server.host, server.exchange_port)
    {
        mpp_logging::error!("start data exchange server failed: {}", e);
        eprintln!("start data exchange server failed: {e}");
        process::exit(1);
    }

    println!(
        "mpp-exchange started (bind={}:{}, endpoint={})",
        server.host, server.exchange_port, local_endpoint
    );
    println!("Press Ctrl-C to stop...");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let metrics = manager.metrics();
    mpp_logging::info!(
        "mpp-exchange stopping: sinks={} sources={} metrics={:?}",
        manager.num_sink_handles(),
        manager.num_source_handles(),
        metrics
    );
    println!("mpp-exchange stopped");
}
