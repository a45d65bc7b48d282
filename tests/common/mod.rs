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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use mpp_exchange::exchange::manager::ExchangeManager;
use mpp_exchange::exchange::transport::{ExchangeTransport, LoopbackTransport};
use mpp_exchange::mpp_config;
use mpp_exchange::mpp_logging;
use mpp_exchange::runtime::memory_pool::MemoryPool;
use mpp_exchange::{Endpoint, FragmentInstanceId, PlanNodeId};

pub const MB: i64 = 1024 * 1024;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_content(
            r#"
log_level = "debug"

[server]
host = "127.0.0.1"
exchange_port = 19740

[exchange]
io_threads = 2
max_memory_bytes = 67108864
max_memory_bytes_per_query = 33554432
receive_wait_ms = 5000
rpc_timeout_ms = 2000
rpc_retry_times = 1
"#,
        )
    }

    pub fn with_content(content: &str) -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_mpp_exchange.toml");
        std::fs::write(&config_path, content)?;
        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        mpp_logging::init_with_level("debug");
    }

    /// Parse the test configuration without installing it globally.
    pub fn load_config(&self) -> anyhow::Result<mpp_config::ExchangeServiceConfig> {
        mpp_config::ExchangeServiceConfig::load_from_file(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Fragment instance id scoped to a test, so parallel tests never share a query.
pub fn finst(test_name: &str, fragment_id: i32, instance: &str) -> FragmentInstanceId {
    FragmentInstanceId::new(format!("q_{test_name}"), fragment_id, instance)
}

pub fn plan_node(id: &str) -> PlanNodeId {
    PlanNodeId::new(id)
}

/// Two managers on distinct endpoints wired through one loopback transport.
pub struct LoopbackCluster {
    pub transport: Arc<LoopbackTransport>,
    pub node_a: Arc<ExchangeManager>,
    pub node_b: Arc<ExchangeManager>,
}

impl LoopbackCluster {
    pub fn new(test_name: &str) -> Self {
        let transport = LoopbackTransport::new();
        let node_a = new_manager(&transport, &format!("{test_name}-a"), 9001);
        let node_b = new_manager(&transport, &format!("{test_name}-b"), 9002);
        Self {
            transport,
            node_a,
            node_b,
        }
    }
}

fn new_manager(transport: &Arc<LoopbackTransport>, host: &str, port: u16) -> Arc<ExchangeManager> {
    let shared: Arc<dyn ExchangeTransport> = transport.clone();
    let manager = ExchangeManager::new(
        Endpoint::new(host, port),
        MemoryPool::new(format!("{host}.exchange"), 64 * MB, 32 * MB),
        shared,
    );
    transport.register(&manager);
    manager
}

/// Wait for a condition to become true, with timeout.
pub fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(_) => panic!("Expected Err, got Ok"),
            Err(e) => e,
        }
    };
}
